// Error types for the worklet bridge

use thiserror::Error;

/// Unified error type for worklet operations
///
/// Every failure that crosses a runtime boundary is converted into one of
/// these variants and delivered to the caller (usually through a
/// continuation) instead of being left as a fault on a worker thread.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkletError {
    #[error("Failed to initialize runtime '{name}': {reason}")]
    RuntimeInit { name: String, reason: String },

    #[error("Cannot capture '{name}': {reason}")]
    UnsupportedCapture { name: String, reason: String },

    #[error("Runtime '{0}' is unavailable")]
    RuntimeUnavailable(String),

    #[error("Worklet execution failed: {message}")]
    Execution {
        message: String,
        stack: Option<String>,
    },

    #[error("Blocking wait on runtime '{0}' from its own thread would deadlock")]
    Deadlock(String),

    #[error("Task was cancelled")]
    Cancelled,
}

impl WorkletError {
    /// Shorthand for an execution error without a stack trace
    pub fn execution(message: impl Into<String>) -> Self {
        WorkletError::Execution {
            message: message.into(),
            stack: None,
        }
    }

    /// Stable name of the variant, used as the `name` of script errors
    pub fn kind(&self) -> &'static str {
        match self {
            WorkletError::RuntimeInit { .. } => "RuntimeInitError",
            WorkletError::UnsupportedCapture { .. } => "UnsupportedCaptureError",
            WorkletError::RuntimeUnavailable(_) => "RuntimeUnavailableError",
            WorkletError::Execution { .. } => "ExecutionError",
            WorkletError::Deadlock(_) => "DeadlockError",
            WorkletError::Cancelled => "CancelledError",
        }
    }

    /// True for errors caused by the target runtime going away
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            WorkletError::Cancelled | WorkletError::RuntimeUnavailable(_)
        )
    }
}

/// Errors raised by a JS engine instance
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },

    #[error("Engine does not support {0}")]
    Unsupported(String),

    #[error("Value conversion failed: {0}")]
    Conversion(String),

    #[error("Engine error: {0}")]
    Internal(String),
}

impl From<EngineError> for WorkletError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Exception { message, stack } => WorkletError::Execution { message, stack },
            other => WorkletError::execution(other.to_string()),
        }
    }
}

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
