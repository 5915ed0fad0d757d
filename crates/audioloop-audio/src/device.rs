//! Platform device traits.
//!
//! Results mirror what PCM platform APIs hand back: a byte count on success
//! and a negative status code on failure.

use audioloop_ipc::SourceKind;

use crate::authorization::CaptureAuthorization;
use crate::format::AudioStreamSpec;

/// A platform recording stream.
pub trait CaptureDevice: Send {
    /// Begin recording.
    fn start(&mut self) -> Result<(), String>;

    /// Copy whatever is available into `buf` without blocking.
    ///
    /// Returns the number of bytes written (0 when nothing is buffered) or
    /// a negative platform code.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, i32>;

    /// Stop recording.
    fn stop(&mut self);

    /// Release the OS-level resource.
    fn release(&mut self);
}

/// A platform playback stream.
pub trait PlaybackDevice: Send {
    fn play(&mut self);

    fn pause(&mut self);

    /// Queue `buf` for playback, blocking until the device has room.
    ///
    /// Returns bytes accepted or a negative platform code.
    fn write(&mut self, buf: &[u8]) -> Result<usize, i32>;

    /// Output gain applied by the device (0.0 - 1.0).
    fn set_volume(&mut self, volume: f32);

    /// Drop any queued, not yet played data.
    fn flush(&mut self);

    fn stop(&mut self);

    fn release(&mut self);
}

/// Factory for capture and playback devices on one host.
pub trait AudioBackend: Send + Sync {
    /// Minimum capture buffer size in bytes recommended for `spec`.
    /// Non-positive values mean the configuration is unsupported.
    fn min_capture_buffer_size(&self, kind: SourceKind, spec: &AudioStreamSpec) -> i32;

    /// Minimum playback buffer size in bytes recommended for `spec`.
    fn min_playback_buffer_size(&self, spec: &AudioStreamSpec) -> i32;

    /// Open a recording stream for `kind`.
    fn open_capture(
        &self,
        kind: SourceKind,
        spec: &AudioStreamSpec,
        authorization: Option<&CaptureAuthorization>,
    ) -> Result<Box<dyn CaptureDevice>, String>;

    /// Open the playback stream.
    fn open_playback(&self, spec: &AudioStreamSpec) -> Result<Box<dyn PlaybackDevice>, String>;
}
