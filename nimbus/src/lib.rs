pub mod orchestrator;

pub use orchestrator::NimbusOrchestrator;

// Re-export commonly used types
pub use nimbus_core::{
    config::Config,
    error::{NimbusError, NimbusResult},
};
