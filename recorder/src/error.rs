//! Error handling for the Pulse recorder service
//!
//! This module provides error types for all recorder operations, including
//! counter sampling, sample persistence, configuration, and subscriber
//! management.

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// The main error type for the recorder service
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Sample store related errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Counter sampling errors
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Subscriber registry errors
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Sample store specific errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Directory creation failed: {path}")]
    DirectoryCreationFailed { path: String },

    #[error("Schema error: {reason}")]
    Schema { reason: String },
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Counter sampling errors
#[derive(Error, Debug)]
pub enum SamplerError {
    /// The two snapshots handed to the load computation do not describe
    /// the same set of cores. Caller error, not retried.
    #[error("core count mismatch between snapshots: {prev} != {curr}")]
    CoreCountMismatch { prev: usize, curr: usize },

    #[error("counter read failed: {reason}")]
    CounterRead { reason: String },
}

/// Subscriber registry errors
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("no such subscriber: {id}")]
    UnknownSubscriber { id: Uuid },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RecorderError>;

/// A specialized result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for sampler operations
pub type SamplerResult<T> = std::result::Result<T, SamplerError>;

impl RecorderError {
    /// Check if this error is recoverable without restarting the service.
    ///
    /// A recoverable error abandons at most one tick or one request; an
    /// unrecoverable one must stop the process (configuration) or the
    /// sampling loop (counter topology changes).
    pub fn is_recoverable(&self) -> bool {
        match self {
            RecorderError::Store(_) => true,
            RecorderError::Config(_) => false,
            RecorderError::Sampler(SamplerError::CoreCountMismatch { .. }) => false,
            RecorderError::Sampler(SamplerError::CounterRead { .. }) => true,
            RecorderError::Subscription(_) => true,
            RecorderError::Io(io_error) => {
                matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => true,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RecorderError::Store(_) => "store",
            RecorderError::Config(_) => "config",
            RecorderError::Sampler(_) => "sampler",
            RecorderError::Subscription(_) => "subscription",
            RecorderError::Io(_) => "io",
            RecorderError::Serialization(_) => "serialization",
            RecorderError::Generic(_) => "generic",
        }
    }
}

impl From<String> for RecorderError {
    fn from(msg: String) -> Self {
        RecorderError::Generic(msg)
    }
}

impl From<&str> for RecorderError {
    fn from(msg: &str) -> Self {
        RecorderError::Generic(msg.to_string())
    }
}
