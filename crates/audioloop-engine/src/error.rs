//! Error types for session setup.

use thiserror::Error;

use audioloop_audio::{OpenError, StartError};
use audioloop_ipc::SourceKind;

use crate::authorization::AuthorizationError;

/// Errors that abort a session start.
///
/// Everything after a successful start is reported through events instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthorizationError),

    /// System audio is required but no authorization token was supplied.
    #[error("system audio required but no capture authorization was supplied")]
    AuthorizationMissing,

    #[error("failed to open {kind} capture: {error}")]
    OpenSource { kind: SourceKind, error: OpenError },

    #[error("failed to start {kind} capture: {error}")]
    StartSource { kind: SourceKind, error: StartError },

    #[error("failed to open output: {0}")]
    OpenSink(OpenError),

    #[error("failed to spawn mixer thread: {0}")]
    SpawnMixer(String),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
