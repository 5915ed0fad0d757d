//! Error types for the audio module.

use thiserror::Error;

use crate::capture::SourceState;
use crate::sink::SinkState;

/// Errors raised while acquiring a source or sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    /// The platform reported a non-positive minimum buffer size.
    #[error("invalid buffer size reported by device: {0}")]
    InvalidBufferSize(i32),

    /// The device could not be brought to a ready state.
    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    /// System capture requires a valid capture authorization.
    #[error("capture authorization missing or revoked")]
    AuthorizationMissing,
}

/// Errors raised when starting a source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// The source is not in a startable state.
    #[error("source cannot start from state {0:?}")]
    InvalidState(SourceState),

    /// The device refused to start.
    #[error("device failed to start: {0}")]
    Device(String),
}

/// Errors raised by a capture read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// Negative platform read result. The source is failed for good.
    #[error("capture device error: {0}")]
    DeviceError(i32),

    /// The source is not recording.
    #[error("source is not recording ({0:?})")]
    NotRecording(SourceState),
}

/// Errors raised by a sink write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Negative platform write result. Transient; the next write is retried.
    #[error("playback device error: {0}")]
    DeviceError(i32),

    /// The sink is not playing.
    #[error("sink is not playing ({0:?})")]
    NotPlaying(SinkState),
}
