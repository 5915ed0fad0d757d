//! Output sink.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::device::{AudioBackend, PlaybackDevice};
use crate::error::{OpenError, WriteError};
use crate::format::AudioStreamSpec;
use crate::{AudioResult, FrameCount};

/// Lifecycle of the output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Uninitialized,
    Ready,
    Playing,
    Paused,
    Released,
}

struct SinkInner {
    device: Option<Box<dyn PlaybackDevice>>,
    state: SinkState,
    volume: f32,
}

/// The single stereo PCM output of a session.
///
/// All operations take `&self` and are serialized by one mutex, so the
/// focus callback may pause/resume while the mixer thread writes. A write
/// holds the mutex while the device blocks; teardown that must not wait on
/// it uses [`AudioSink::flush_stop_and_release_within`].
pub struct AudioSink {
    spec: AudioStreamSpec,
    buffer_size: usize,
    inner: Mutex<SinkInner>,
}

impl AudioSink {
    /// Acquire the playback device.
    #[instrument(name = "audio_sink_open", skip(backend))]
    pub fn open(backend: &dyn AudioBackend, spec: AudioStreamSpec) -> AudioResult<Self> {
        let min_buffer = backend.min_playback_buffer_size(&spec);
        if min_buffer <= 0 {
            warn!(min_buffer, "Invalid playback buffer size");
            return Err(OpenError::InvalidBufferSize(min_buffer));
        }
        let buffer_size = spec.bytes_for(spec.frames_in(min_buffer as usize * 2).max(1));

        let device = backend.open_playback(&spec).map_err(OpenError::DeviceInit)?;
        info!(buffer_bytes = buffer_size, "Output sink ready");

        Ok(Self {
            spec,
            buffer_size,
            inner: Mutex::new(SinkInner {
                device: Some(device),
                state: SinkState::Ready,
                volume: 1.0,
            }),
        })
    }

    /// Begin playback from `Ready` (or `Paused`).
    pub fn start_playing(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SinkState::Ready | SinkState::Paused) {
            if let Some(device) = inner.device.as_mut() {
                device.play();
            }
            inner.state = SinkState::Playing;
            debug!("Sink playing");
        }
    }

    /// Write `frame_count` interleaved frames from `buffer`.
    ///
    /// Blocks until the device accepts the data. Device errors are returned
    /// for logging only; the sink stays usable.
    pub fn write(&self, buffer: &[u8], frame_count: FrameCount) -> Result<FrameCount, WriteError> {
        let mut inner = self.inner.lock();
        if inner.state != SinkState::Playing {
            return Err(WriteError::NotPlaying(inner.state));
        }
        let bytes = self.spec.bytes_for(frame_count).min(buffer.len());
        let device = inner
            .device
            .as_mut()
            .ok_or(WriteError::NotPlaying(SinkState::Released))?;

        device
            .write(&buffer[..bytes])
            .map(|written| self.spec.frames_in(written))
            .map_err(WriteError::DeviceError)
    }

    /// Pause if currently playing.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SinkState::Playing {
            if let Some(device) = inner.device.as_mut() {
                device.pause();
            }
            inner.state = SinkState::Paused;
            debug!("Sink paused");
        }
    }

    /// Resume if currently paused.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SinkState::Paused {
            if let Some(device) = inner.device.as_mut() {
                device.play();
            }
            inner.state = SinkState::Playing;
            debug!("Sink resumed");
        }
    }

    /// Set the output gain (master volume), clamped to 0.0 - 1.0.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        let mut inner = self.inner.lock();
        if let Some(device) = inner.device.as_mut() {
            device.set_volume(volume);
        }
        inner.volume = volume;
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    /// Flush, stop and release the device. Safe to call repeatedly.
    pub fn flush_stop_and_release(&self) {
        release_inner(&mut self.inner.lock());
    }

    /// Like [`AudioSink::flush_stop_and_release`], but gives up after
    /// `timeout` if a write is still blocked in the device.
    ///
    /// Returns false when the sink was left alone; it is then released by
    /// its last owner on drop.
    pub fn flush_stop_and_release_within(&self, timeout: Duration) -> bool {
        match self.inner.try_lock_for(timeout) {
            Some(mut inner) => {
                release_inner(&mut inner);
                true
            }
            None => {
                warn!(?timeout, "Output sink busy in a device write, deferring release");
                false
            }
        }
    }

    pub fn state(&self) -> SinkState {
        self.inner.lock().state
    }

    pub fn spec(&self) -> &AudioStreamSpec {
        &self.spec
    }

    /// Playback buffer size in bytes (twice the platform minimum).
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

fn release_inner(inner: &mut SinkInner) {
    if inner.state == SinkState::Released {
        return;
    }
    if let Some(mut device) = inner.device.take() {
        if inner.state == SinkState::Playing {
            device.pause();
        }
        device.flush();
        device.stop();
        device.release();
    }
    inner.state = SinkState::Released;
    debug!("Output sink released");
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        release_inner(self.inner.get_mut());
    }
}
