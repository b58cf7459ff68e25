//! Error types for the lanscout discovery engine.
//!
//! Synchronous setup failures are returned to callers as [`DiscoveryError`].
//! Every variant maps onto an [`ErrorCode`], the numeric code set of the
//! DNS-SD API that the public surface reports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using DiscoveryError as the error type.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Numeric provider error codes.
///
/// The discriminants are the values used by the DNS-SD C API, so they can be
/// handed straight to callers that expect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    Unknown = -65537,
    BadParam = -65540,
    AlreadyRegistered = -65547,
    Invalid = -65549,
    ServiceNotRunning = -65563,
    Timeout = -65568,
}

impl ErrorCode {
    /// Returns the integer value reported through the public API.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps an integer back onto a known code. Unrecognised values become
    /// [`ErrorCode::Unknown`].
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ErrorCode::NoError,
            -65540 => ErrorCode::BadParam,
            -65547 => ErrorCode::AlreadyRegistered,
            -65549 => ErrorCode::Invalid,
            -65563 => ErrorCode::ServiceNotRunning,
            -65568 => ErrorCode::Timeout,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::NoError
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_i32())
    }
}

/// Error returned by a discovery provider primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} [{code}]")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Generic provider failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// The provider engine is not running (shut down or never started).
    pub fn not_running(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceNotRunning, message)
    }
}

/// Errors raised while converting between TXT records and JSON.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TxtError {
    /// Input is not valid JSON
    #[error("Malformed TXT JSON: {reason}")]
    MalformedJson { reason: String },

    /// Input JSON is valid but not an object
    #[error("TXT JSON must be a flat object")]
    NotAnObject,

    /// A value is a number, bool, null, array or object
    #[error("TXT value for key '{key}' is not a string")]
    NonStringValue { key: String },

    #[error("TXT key must not be empty")]
    EmptyKey,

    #[error("TXT key '{key}' must not contain '='")]
    KeyContainsEquals { key: String },

    /// A single `key=value` entry does not fit in the one-byte length prefix
    #[error("TXT entry '{key}' is {len} bytes, the limit is 255")]
    EntryTooLong { key: String, len: usize },
}

/// Configuration loading and validation errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error for registry and session operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The registration TXT JSON could not be encoded
    #[error("Invalid TXT record: {0}")]
    InvalidRecord(#[from] TxtError),

    /// (name, service type) already has a live registration
    #[error("Service '{name}' is already registered for type '{service_type}'")]
    AlreadyRegistered { name: String, service_type: String },

    /// A provider primitive refused to start an operation
    #[error("Provider {operation} failed for '{target}': {source}")]
    ProviderOperationFailed {
        operation: &'static str,
        target: String,
        #[source]
        source: ProviderError,
    },

    #[error("Invalid service type: {0}")]
    InvalidServiceType(String),

    /// Unknown registration or session
    #[error("Not found: {0}")]
    NotFound(String),

    /// The registry has been shut down
    #[error("Session registry has been shut down")]
    ShutDown,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DiscoveryError {
    pub fn provider(operation: &'static str, target: impl Into<String>, source: ProviderError) -> Self {
        Self::ProviderOperationFailed {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Numeric code reported through the public API.
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::InvalidRecord(_) => ErrorCode::Invalid,
            DiscoveryError::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            DiscoveryError::ProviderOperationFailed { source, .. } => source.code,
            DiscoveryError::InvalidServiceType(_) => ErrorCode::BadParam,
            DiscoveryError::NotFound(_) => ErrorCode::BadParam,
            DiscoveryError::ShutDown => ErrorCode::ServiceNotRunning,
            DiscoveryError::Config(_) => ErrorCode::BadParam,
        }
    }
}
