//! PCM capture, mixing and playback.
//!
//! This crate provides the two capture sources (system playback and
//! microphone), the output sink, the focus arbiter, the shared control
//! state and the real-time mixing engine that ties them together.
//! Platform access goes through the [`AudioBackend`] trait.

mod authorization;
pub mod backend;
mod capture;
mod control;
mod device;
mod error;
mod focus;
mod format;
mod mixer;
mod sink;
mod stats;

pub use authorization::CaptureAuthorization;
pub use capture::{AudioSource, SourceState};
pub use control::{ControlSnapshot, ControlState};
pub use device::{AudioBackend, CaptureDevice, PlaybackDevice};
pub use error::{OpenError, ReadError, StartError, WriteError};
pub use focus::{FocusArbiter, FocusListener};
pub use format::{AudioStreamSpec, ChannelLayout, SampleFormat};
pub use mixer::{
    gain_factor, mix_frame, mix_into, EngineState, MixerConfig, MixerExit, MixerHandle,
    MixingEngine, SharedSource,
};
pub use sink::{AudioSink, SinkState};
pub use stats::MixerStats;

/// Result type for audio open operations.
pub type AudioResult<T> = Result<T, OpenError>;

/// Audio sample rate in Hz.
pub const SAMPLE_RATE: u32 = 44_100;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Number of frames counted by a read or write.
pub type FrameCount = usize;
