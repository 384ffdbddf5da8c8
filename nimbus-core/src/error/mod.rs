//! Error handling for Nimbus
//!
//! All fallible operations in the workspace return [`NimbusResult`]. The error
//! enum is split into three groups:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Nimbus Error Taxonomy                      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Control plane           │  Business            │  Ambient       │
//! │  ┌────────────────────┐  │  ┌────────────────┐  │  ┌──────────┐  │
//! │  │ • Transport        │  │  │ • Insufficient │  │  │ • Storage│  │
//! │  │ • Upstream 5xx     │  │  │   balance      │  │  │ • Codec  │  │
//! │  │ • Upstream 4xx     │  │  │ • Product /    │  │  │ • Config │  │
//! │  │ • Circuit open     │  │  │   cycle / spec │  │  │ • IO     │  │
//! │  │ • App code / decode│  │  │ • Not found    │  │  │ • Intern │  │
//! │  │ • Cancelled        │  │  │ • Forbidden    │  │  │          │  │
//! │  └────────────────────┘  │  └────────────────┘  │  └──────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only transport failures and upstream 5xx responses are retried and counted
//! by the circuit breaker. Business errors are expected outcomes that callers
//! branch on; `InsufficientBalance` in particular is never retried.

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{format_errors, NimbusError, NimbusResult, Result};
