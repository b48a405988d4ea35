//! Runtime error types.

use crate::config::ConfigError;
use harel_core::CoreError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns the stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Config(_) => "INVALID_CONFIG",
            RuntimeError::Json(_) => "BAD_REQUEST",
            RuntimeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Non-fatal problems reported to diagnostic listeners.
///
/// Misuse of the interpreter API and unresolved references never surface as
/// `Err`; they are logged and delivered here instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Diagnostic {
    #[error("event '{event}' sent to a stopped interpreter")]
    SendAfterStop { event: String },

    #[error("event '{event}' sent before start")]
    NotStarted { event: String },

    #[error("interpreter already started")]
    AlreadyStarted,

    #[error("unresolved action '{action_type}': {reason}")]
    UnresolvedAction { action_type: String, reason: String },

    #[error("no service '{src}' for invocation '{id}'")]
    UnknownService { id: String, src: String },

    #[error("no target '{target}' for event '{event}'")]
    UnknownTarget { target: String, event: String },

    #[error("configuration error: {reason}")]
    ConfigurationError { reason: String },

    #[error("delayed send '{send_id}' could not be scheduled")]
    TimerUnavailable { send_id: String },
}

impl Diagnostic {
    pub fn code(&self) -> &'static str {
        match self {
            Diagnostic::SendAfterStop { .. } => "SEND_AFTER_STOP",
            Diagnostic::NotStarted { .. } => "NOT_STARTED",
            Diagnostic::AlreadyStarted => "ALREADY_STARTED",
            Diagnostic::UnresolvedAction { .. } => "UNRESOLVED_ACTION",
            Diagnostic::UnknownService { .. } => "UNKNOWN_SERVICE",
            Diagnostic::UnknownTarget { .. } => "UNKNOWN_TARGET",
            Diagnostic::ConfigurationError { .. } => "CONFIGURATION_ERROR",
            Diagnostic::TimerUnavailable { .. } => "TIMER_UNAVAILABLE",
        }
    }

    /// Misuse of the public API rather than a problem in the machine.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Diagnostic::SendAfterStop { .. }
                | Diagnostic::NotStarted { .. }
                | Diagnostic::AlreadyStarted
        )
    }
}
