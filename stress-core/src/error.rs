// stress-core/src/error.rs
// Error handling for the stress harness core

use std::result;
use thiserror::Error;

/// Main error type for the stress harness core
#[derive(Error, Debug)]
pub enum StressError {
    /// The shared region could not be created or mapped
    #[error("Shared region mapping failed: {what} - {source}")]
    Mapping {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// fork() failed
    #[error("Fork failed for {stressor} instance {instance}: {source}")]
    Fork {
        stressor: String,
        instance: u32,
        #[source]
        source: nix::Error,
    },

    /// Configuration validation errors
    #[error("Configuration error: {field} - {message}")]
    Config { field: String, message: String },

    /// Configuration file parse errors
    #[error("Configuration parse error: {0}")]
    Parse(String),

    /// Requested stressor is not in the registry
    #[error("Unknown stressor: {0}")]
    UnknownStressor(String),

    /// More instances requested than there are shared slots
    #[error("Too many instances: requested {requested}, maximum {max}")]
    TooManyInstances { requested: usize, max: usize },

    /// Slot index beyond the shared region's capacity
    #[error("Slot {slot} out of range (region holds {slots})")]
    SlotOutOfRange { slot: usize, slots: usize },

    /// A resource isolation knob could not be applied
    #[error("Isolation step '{step}' failed: {details}")]
    Isolation { step: &'static str, details: String },

    /// Semaphore initialization or operation failure
    #[error("Semaphore {name}: {operation} failed - {source}")]
    Semaphore {
        name: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Signal delivery or handler installation failure
    #[error("Signal error: {operation} failed - {source}")]
    Signal {
        operation: String,
        #[source]
        source: nix::Error,
    },

    /// Generic I/O errors
    #[error("I/O error: {operation} failed - {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context} - {source}")]
    Serialization {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type alias for convenience
pub type Result<T> = result::Result<T, StressError>;

/// How far the damage of an error reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The harness cannot proceed at all
    Run,
    /// One stressor runs with fewer instances than requested
    InstanceSet,
    /// One worker loses a tuning guarantee but keeps running
    Worker,
}

/// Classification of errors against the failure taxonomy
pub trait ErrorPolicy {
    fn scope(&self) -> ErrorScope;

    fn is_fatal(&self) -> bool {
        self.scope() == ErrorScope::Run
    }
}

impl ErrorPolicy for StressError {
    fn scope(&self) -> ErrorScope {
        match self {
            StressError::Fork { .. } => ErrorScope::InstanceSet,
            StressError::Isolation { .. } | StressError::Semaphore { .. } => ErrorScope::Worker,
            _ => ErrorScope::Run,
        }
    }
}

/// Helper macro for configuration errors
#[macro_export]
macro_rules! config_error {
    ($field:expr, $msg:expr) => {
        $crate::error::StressError::Config {
            field: $field.to_string(),
            message: $msg.to_string(),
        }
    };
}

impl From<std::io::Error> for StressError {
    fn from(err: std::io::Error) -> Self {
        StressError::Io {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<nix::Error> for StressError {
    fn from(err: nix::Error) -> Self {
        StressError::Signal {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for StressError {
    fn from(err: toml::de::Error) -> Self {
        StressError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for StressError {
    fn from(err: serde_json::Error) -> Self {
        StressError::Serialization {
            context: "JSON processing".to_string(),
            source: Box::new(err),
        }
    }
}
