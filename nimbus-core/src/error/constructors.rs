//! Constructor methods and classification helpers for NimbusError

use super::types::NimbusError;

impl NimbusError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use nimbus_core::error::NimbusError;
    ///
    /// let err = NimbusError::configuration("control_plane.base_url", "must not be empty");
    /// assert!(err.to_string().contains("control_plane.base_url"));
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        NimbusError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a Storage error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        NimbusError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        NimbusError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        NimbusError::Forbidden {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NimbusError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_spec(field: impl Into<String>, message: impl Into<String>) -> Self {
        NimbusError::InvalidSpec {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        NimbusError::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        NimbusError::Internal {
            message: message.into(),
        }
    }

    /// True for failures the capability client retries: transport errors and
    /// upstream 5xx responses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NimbusError::Transport { .. } | NimbusError::UpstreamServer { .. }
        )
    }

    /// True for failures that move the circuit breaker toward open.
    pub fn counts_as_breaker_failure(&self) -> bool {
        self.is_retryable()
    }

    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, NimbusError::InsufficientBalance { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, NimbusError::CircuitOpen { .. })
    }
}
