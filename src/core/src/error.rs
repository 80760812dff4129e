use crate::handle::Handle;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error carried by the IPC layer.
///
/// Besides the human-readable description it tells the caller whether the
/// failure is transient (`can_retry`) or permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichError {
    pub description: String,
    pub can_retry: bool,
}

impl RichError {
    pub fn new(description: impl Into<String>, can_retry: bool) -> Self {
        Self {
            description: description.into(),
            can_retry,
        }
    }

    /// A failure the caller may retry (peer went away, reply timed out).
    pub fn transient(description: impl Into<String>) -> Self {
        Self::new(description, true)
    }

    /// A failure retrying cannot fix.
    pub fn permanent(description: impl Into<String>) -> Self {
        Self::new(description, false)
    }
}

impl std::fmt::Display for RichError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (can retry: {})", self.description, self.can_retry)
    }
}

impl std::error::Error for RichError {}

/// VM bridge error types
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration failed validation; every violation is listed
    #[error("Invalid configuration: {}", violations.join("; "))]
    ConfigInvalid { violations: Vec<String> },

    /// Configuration was validated and can no longer be changed
    #[error("Configuration is sealed: {0}")]
    ConfigSealed(String),

    /// Lifecycle operation not allowed in the current state
    #[error("Invalid state transition: cannot {operation} while {state}")]
    InvalidStateTransition { operation: String, state: String },

    /// A listener already owns the port
    #[error("Port in use: {0}")]
    PortInUse(u32),

    /// Handle was never registered or has already been released
    #[error("Unknown handle: {0}")]
    UnknownHandle(Handle),

    /// Stored value has a different tag than the accessor expects
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Value could not be parsed
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Native asynchronous operation failed
    #[error("Operation failed: {description}")]
    OperationFailed {
        description: String,
        cause: Option<String>,
    },

    /// Capability absent on this host
    #[error("{feature} is unsupported on this platform (requires {required})")]
    UnsupportedOnPlatform { feature: String, required: String },

    /// IPC layer error
    #[error("IPC error: {0}")]
    Ipc(RichError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Shorthand for a native failure without an underlying cause.
    pub fn failed(description: impl Into<String>) -> Self {
        BridgeError::OperationFailed {
            description: description.into(),
            cause: None,
        }
    }

    /// Native failure wrapping the error that caused it.
    pub fn failed_with(description: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        BridgeError::OperationFailed {
            description: description.into(),
            cause: Some(cause.to_string()),
        }
    }

    pub fn invalid_transition(operation: &str, state: impl std::fmt::Display) -> Self {
        BridgeError::InvalidStateTransition {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }

    pub fn type_mismatch(expected: impl std::fmt::Display, found: impl std::fmt::Display) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Whether a caller could reasonably retry the failed call.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Ipc(rich) => rich.can_retry,
            BridgeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<RichError> for BridgeError {
    fn from(err: RichError) -> Self {
        BridgeError::Ipc(err)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// Result type alias for VM bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
