//! Error types for the audio server core

use thiserror::Error;

/// Errors surfaced by the audio server and its subsystems
#[derive(Error, Debug)]
pub enum AudioError {
    /// Invalid rate/format/channel combination or out-of-range argument
    #[error("bad value: {0}")]
    BadValue(String),

    /// Hardware or subsystem not initialized
    #[error("not initialized")]
    NoInit,

    /// Operation not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Buffer provider temporarily has nothing; callers retry, never abort
    #[error("not enough data")]
    NotEnoughData,

    /// Duplicate resource
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Caller lacks the required capability
    #[error("permission denied")]
    PermissionDenied,

    /// Shared-heap allocation failure for a control block
    #[error("shared memory allocation failed")]
    NoMemory,

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),

    /// Hardware stream fault reported by the backend
    #[error("hardware stream error: {0}")]
    Hal(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;

/// Rejected state-machine transition (track or thread lifecycle)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl From<InvalidTransition> for AudioError {
    fn from(e: InvalidTransition) -> Self {
        AudioError::InvalidOperation(e.to_string())
    }
}
