//! Core error types for Nimbus
//!
//! This module contains the main NimbusError enum with all error variants
//! and associated type aliases for Result types.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

/// Error type shared by every Nimbus crate
#[derive(Error, Debug)]
pub enum NimbusError {
    // Control plane errors
    /// Connection, timeout or body-read failure talking to the control plane.
    #[error("Transport error during '{operation}' after {attempts} attempt(s): {details}")]
    Transport {
        operation: String,
        attempts: u32,
        details: String,
    },

    /// Upstream kept answering 5xx until the retry budget ran out.
    #[error("Upstream server error during '{operation}': status {status} after {attempts} attempt(s)")]
    UpstreamServer {
        operation: String,
        status: u16,
        attempts: u32,
    },

    /// Upstream rejected the request (4xx). Never retried.
    #[error("Upstream rejected '{operation}': status {status}, body {body}")]
    UpstreamClient {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Response envelope carried a non-zero application code.
    #[error("Upstream application error code={code} message={message}")]
    UpstreamApplication { code: i64, message: String },

    #[error("Failed to decode response for '{operation}': {details}")]
    Decode { operation: String, details: String },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    // Business errors
    #[error("Insufficient balance for user {user_id}: balance {balance}, change {delta}")]
    InsufficientBalance {
        user_id: u64,
        balance: Decimal,
        delta: Decimal,
    },

    #[error("Product {product_id} is not available for ordering")]
    ProductUnavailable { product_id: u64 },

    #[error("Billing cycle '{cycle}' is not offered for product {product_id}")]
    InvalidBillingCycle { product_id: u64, cycle: String },

    #[error("Invalid {field} specification: {message}")]
    InvalidSpec { field: String, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Access denied: {message}")]
    Forbidden { message: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    StorageError(#[from] Box<redb::Error>),

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Database error: {operation} failed")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Serialization & IO errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] Box<bincode::Error>),

    #[error("JSON error: {0}")]
    JsonError(#[from] Box<serde_json::Error>),

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    // Configuration
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    // Internal
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Multiple errors in {context}: {}", format_errors(.errors))]
    Multiple {
        context: String,
        errors: Vec<NimbusError>,
    },
}

// Helper function to format multiple errors
pub fn format_errors(errors: &[NimbusError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {}", i + 1, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, NimbusError>;
pub type NimbusResult<T> = std::result::Result<T, NimbusError>;
