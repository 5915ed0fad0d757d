//! Capture sources (system playback and microphone).

use tracing::{debug, info, instrument, warn};

use audioloop_ipc::SourceKind;

use crate::authorization::CaptureAuthorization;
use crate::device::{AudioBackend, CaptureDevice};
use crate::error::{OpenError, ReadError, StartError};
use crate::format::AudioStreamSpec;
use crate::{AudioResult, FrameCount};

/// Lifecycle of a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Uninitialized,
    Ready,
    Recording,
    /// A read returned a device error; the source is never read again.
    Failed,
    Released,
}

/// One live PCM input stream.
pub struct AudioSource {
    kind: SourceKind,
    spec: AudioStreamSpec,
    buffer: Vec<u8>,
    frames_buffered: FrameCount,
    /// Trailing bytes of a partial frame, prepended to the next read.
    carry: Vec<u8>,
    state: SourceState,
    device: Option<Box<dyn CaptureDevice>>,
}

impl AudioSource {
    /// Acquire the capture device for `kind`.
    ///
    /// System capture requires a valid `authorization`. The read buffer is
    /// sized to twice the platform minimum.
    #[instrument(name = "audio_source_open", skip(backend, authorization))]
    pub fn open(
        backend: &dyn AudioBackend,
        kind: SourceKind,
        spec: AudioStreamSpec,
        authorization: Option<&CaptureAuthorization>,
    ) -> AudioResult<Self> {
        if kind == SourceKind::SystemCapture && !authorization.is_some_and(|a| a.is_valid()) {
            return Err(OpenError::AuthorizationMissing);
        }

        let min_buffer = backend.min_capture_buffer_size(kind, &spec);
        if min_buffer <= 0 {
            warn!(source = %kind, min_buffer, "Invalid capture buffer size");
            return Err(OpenError::InvalidBufferSize(min_buffer));
        }

        // Whole frames only, and never less than one.
        let frames = spec.frames_in(min_buffer as usize * 2).max(1);
        let buffer = vec![0u8; spec.bytes_for(frames)];

        let device = backend
            .open_capture(kind, &spec, authorization)
            .map_err(OpenError::DeviceInit)?;

        info!(
            source = %kind,
            channels = spec.channel_count(),
            buffer_bytes = buffer.len(),
            "Capture source ready"
        );

        Ok(Self {
            kind,
            spec,
            buffer,
            frames_buffered: 0,
            carry: Vec::with_capacity(spec.bytes_per_frame()),
            state: SourceState::Ready,
            device: Some(device),
        })
    }

    /// Begin recording.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != SourceState::Ready {
            return Err(StartError::InvalidState(self.state));
        }
        let device = self
            .device
            .as_mut()
            .ok_or(StartError::InvalidState(self.state))?;

        match device.start() {
            Ok(()) => {
                self.state = SourceState::Recording;
                debug!(source = %self.kind, "Recording started");
                Ok(())
            }
            Err(e) => {
                self.state = SourceState::Failed;
                Err(StartError::Device(e))
            }
        }
    }

    /// Read whatever whole frames are available into `buf`.
    ///
    /// Returns 0 when nothing is buffered. A short read that ends inside a
    /// frame keeps the partial bytes for the next call, so channels never
    /// shift. `buf` must hold at least one frame. A device error marks the
    /// source `Failed` permanently.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<FrameCount, ReadError> {
        if self.state != SourceState::Recording {
            return Err(ReadError::NotRecording(self.state));
        }
        let device = self
            .device
            .as_mut()
            .ok_or(ReadError::NotRecording(self.state))?;

        let carried = self.carry.len();
        if buf.len() < carried.max(self.spec.bytes_per_frame()) {
            return Ok(0);
        }
        buf[..carried].copy_from_slice(&self.carry);

        match device.read(&mut buf[carried..]) {
            Ok(bytes) => {
                let total = carried + bytes.min(buf.len() - carried);
                let frames = self.spec.frames_in(total);
                let whole = self.spec.bytes_for(frames);
                self.carry.clear();
                self.carry.extend_from_slice(&buf[whole..total]);
                Ok(frames)
            }
            Err(code) => {
                warn!(source = %self.kind, code, "Capture read failed, marking source failed");
                self.state = SourceState::Failed;
                Err(ReadError::DeviceError(code))
            }
        }
    }

    /// Read into the source's own buffer; see [`AudioSource::pcm`].
    pub fn read(&mut self) -> Result<FrameCount, ReadError> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let result = self.read_into(&mut buffer);
        self.buffer = buffer;
        self.frames_buffered = *result.as_ref().unwrap_or(&0);
        result
    }

    /// Interleaved PCM16 bytes produced by the last [`AudioSource::read`].
    pub fn pcm(&self) -> &[u8] {
        &self.buffer[..self.spec.bytes_for(self.frames_buffered)]
    }

    /// Stop recording and release the device. Safe to call repeatedly.
    pub fn stop_and_release(&mut self) {
        if self.state == SourceState::Released {
            return;
        }
        if let Some(mut device) = self.device.take() {
            if self.state == SourceState::Recording {
                device.stop();
            }
            device.release();
        }
        self.frames_buffered = 0;
        self.carry.clear();
        self.state = SourceState::Released;
        debug!(source = %self.kind, "Capture source released");
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn spec(&self) -> &AudioStreamSpec {
        &self.spec
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Size of the owned read buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the mixer should keep reading this source.
    pub fn is_live(&self) -> bool {
        self.state == SourceState::Recording
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop_and_release();
    }
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("kind", &self.kind)
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("buffer_size", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, ReadStep};
    use audioloop_ipc::AuthorizationToken;

    fn auth() -> CaptureAuthorization {
        CaptureAuthorization::new(AuthorizationToken::new("ok"))
    }

    #[test]
    fn test_system_capture_requires_authorization() {
        let backend = MemoryBackend::new();
        let spec = AudioStreamSpec::system_capture();

        let err = AudioSource::open(&backend, SourceKind::SystemCapture, spec, None).unwrap_err();
        assert_eq!(err, OpenError::AuthorizationMissing);

        let revoked = auth();
        revoked.invalidate();
        let err = AudioSource::open(&backend, SourceKind::SystemCapture, spec, Some(&revoked))
            .unwrap_err();
        assert_eq!(err, OpenError::AuthorizationMissing);

        let source =
            AudioSource::open(&backend, SourceKind::SystemCapture, spec, Some(&auth())).unwrap();
        assert_eq!(source.state(), SourceState::Ready);
    }

    #[test]
    fn test_open_rejects_non_positive_buffer_size() {
        let backend = MemoryBackend::new();
        backend.set_min_buffer_size(SourceKind::MicCapture, 0);

        let err = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, OpenError::InvalidBufferSize(0));
    }

    #[test]
    fn test_open_reports_device_init_failure() {
        let backend = MemoryBackend::new();
        backend.fail_open_capture(SourceKind::MicCapture, "no microphone");

        let err = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, OpenError::DeviceInit("no microphone".to_string()));
    }

    #[test]
    fn test_buffer_is_twice_the_minimum() {
        let backend = MemoryBackend::new();
        backend.set_min_buffer_size(SourceKind::MicCapture, 1000);
        let source = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap();
        assert_eq!(source.buffer_size(), 2000);
    }

    #[test]
    fn test_read_returns_whole_frames() {
        let backend = MemoryBackend::new();
        let feed = backend.capture_feed(SourceKind::SystemCapture);
        let mut source = AudioSource::open(
            &backend,
            SourceKind::SystemCapture,
            AudioStreamSpec::system_capture(),
            Some(&auth()),
        )
        .unwrap();
        source.start().unwrap();

        // 2.5 stereo frames.
        feed.push(ReadStep::Data(vec![1u8; 10]));
        assert_eq!(source.read().unwrap(), 2);
        assert_eq!(source.pcm().len(), 8);

        assert_eq!(source.read().unwrap(), 0);
        assert!(source.pcm().is_empty());
    }

    fn samples(pcm: &[u8]) -> Vec<i16> {
        pcm.chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_short_reads_keep_channel_alignment() {
        let backend = MemoryBackend::new();
        let feed = backend.capture_feed(SourceKind::SystemCapture);
        let mut source = AudioSource::open(
            &backend,
            SourceKind::SystemCapture,
            AudioStreamSpec::system_capture(),
            Some(&auth()),
        )
        .unwrap();
        source.start().unwrap();

        // Three samples end halfway through the second frame.
        feed.push_samples(&[100, -100, 200]);
        feed.push_samples(&[-200, 300, -300]);

        assert_eq!(source.read().unwrap(), 1);
        assert_eq!(samples(source.pcm()), vec![100, -100]);
        assert_eq!(source.read().unwrap(), 2);
        assert_eq!(samples(source.pcm()), vec![200, -200, 300, -300]);
    }

    #[test]
    fn test_odd_byte_reads_on_mono_source() {
        let backend = MemoryBackend::new();
        let feed = backend.capture_feed(SourceKind::MicCapture);
        let mut source = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap();
        source.start().unwrap();

        let bytes: Vec<u8> = [1000i16, -2000].iter().flat_map(|s| s.to_le_bytes()).collect();
        feed.push(ReadStep::Data(bytes[..3].to_vec()));
        feed.push(ReadStep::Data(bytes[3..].to_vec()));

        assert_eq!(source.read().unwrap(), 1);
        assert_eq!(samples(source.pcm()), vec![1000]);
        assert_eq!(source.read().unwrap(), 1);
        assert_eq!(samples(source.pcm()), vec![-2000]);
    }

    #[test]
    fn test_read_error_fails_source_permanently() {
        let backend = MemoryBackend::new();
        let feed = backend.capture_feed(SourceKind::MicCapture);
        let mut source = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap();
        source.start().unwrap();

        feed.push(ReadStep::Error(-3));
        feed.push(ReadStep::Data(vec![0u8; 4]));
        assert_eq!(source.read(), Err(ReadError::DeviceError(-3)));
        assert_eq!(source.state(), SourceState::Failed);
        assert!(!source.is_live());
        assert_eq!(
            source.read(),
            Err(ReadError::NotRecording(SourceState::Failed))
        );
    }

    #[test]
    fn test_stop_and_release_is_idempotent() {
        let backend = MemoryBackend::new();
        let mut source = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap();
        source.start().unwrap();
        source.stop_and_release();
        source.stop_and_release();
        drop(source);

        let counters = backend.counters(SourceKind::MicCapture);
        assert_eq!(counters.stops, 1);
        assert_eq!(counters.releases, 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let backend = MemoryBackend::new();
        let mut source = AudioSource::open(
            &backend,
            SourceKind::MicCapture,
            AudioStreamSpec::mic_capture(),
            None,
        )
        .unwrap();
        source.start().unwrap();
        assert_eq!(
            source.start(),
            Err(StartError::InvalidState(SourceState::Recording))
        );
    }
}
