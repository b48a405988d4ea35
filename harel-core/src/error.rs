//! Core error types.

use thiserror::Error;

/// Errors from the statechart engine.
///
/// Only configuration problems surface as errors. Data-dependent failures
/// (guards, unknown action names, expression errors) are reported through the
/// resolved action list and the event system instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("duplicate state id: {id}")]
    DuplicateId { id: String },

    #[error("unknown transition target '{target}' from state '{source_id}'")]
    UnknownTarget { source_id: String, target: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("invalid state value: {reason}")]
    InvalidStateValue { reason: String },

    #[error("microstep limit ({limit}) exceeded while processing '{event}'")]
    MicrostepLimitExceeded { limit: usize, event: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error is a configuration error (malformed definition
    /// or unbounded eventless chain).
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, CoreError::InvalidStateValue { .. })
    }

    /// Returns a stable error code suitable for diagnostics and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::DuplicateId { .. } => "DUPLICATE_ID",
            CoreError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            CoreError::InvalidGuard { .. } => "INVALID_GUARD",
            CoreError::InvalidStateValue { .. } => "INVALID_STATE_VALUE",
            CoreError::MicrostepLimitExceeded { .. } => "MICROSTEP_LIMIT",
            CoreError::Json(_) => "BAD_DEFINITION_JSON",
        }
    }
}
