//! HTTP capability client for the Nimbus control plane
//!
//! [`HttpControlPlane`] implements [`nimbus_core::control_plane::ControlPlane`]
//! over signed JSON requests. The binary registers [`HttpControlPlaneFactory`]
//! into the core's registry under the `"http"` backend name.

pub mod envelope;
pub mod http_client;
pub mod signing;

pub use http_client::{ClientSettings, HttpControlPlane, HttpControlPlaneFactory};
pub use signing::RequestSigner;

use nimbus_core::control_plane::ControlPlaneRegistry;
use std::sync::Arc;

/// The default registry plus the HTTP backend.
pub fn registry() -> ControlPlaneRegistry {
    let mut registry = ControlPlaneRegistry::default();
    registry.register(Arc::new(HttpControlPlaneFactory));
    registry
}
