//! In-memory backend.
//!
//! Capture reads are scripted through [`CaptureFeed`]s, playback writes are
//! recorded, and every lifecycle call is counted. Used by the test suites
//! and by the dry-run mode of the `audioloop` binary.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use audioloop_ipc::SourceKind;

use crate::authorization::CaptureAuthorization;
use crate::device::{AudioBackend, CaptureDevice, PlaybackDevice};
use crate::format::AudioStreamSpec;

/// Default minimum buffer size reported for every endpoint, in bytes.
pub const DEFAULT_MIN_BUFFER: i32 = 3528;

/// One scripted capture read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// Bytes to hand out; anything that does not fit the caller's buffer
    /// stays queued for the next read.
    Data(Vec<u8>),

    /// A read that finds nothing buffered.
    Empty,

    /// A negative platform result.
    Error(i32),
}

/// Lifecycle call counts for one capture endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub opens: u32,
    pub starts: u32,
    pub reads: u64,
    pub stops: u32,
    pub releases: u32,
}

/// Lifecycle call counts for the playback endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackCounters {
    pub opens: u32,
    pub plays: u32,
    pub pauses: u32,
    pub writes: u64,
    pub flushes: u32,
    pub stops: u32,
    pub releases: u32,
}

struct CaptureSlot {
    min_buffer: i32,
    open_error: Option<String>,
    start_error: Option<String>,
    queue: VecDeque<ReadStep>,
    counters: DeviceCounters,
}

impl Default for CaptureSlot {
    fn default() -> Self {
        Self {
            min_buffer: DEFAULT_MIN_BUFFER,
            open_error: None,
            start_error: None,
            queue: VecDeque::new(),
            counters: DeviceCounters::default(),
        }
    }
}

struct PlaybackSlot {
    min_buffer: i32,
    open_error: Option<String>,
    written: Vec<u8>,
    volume: f32,
    playing: bool,
    write_errors: VecDeque<i32>,
    write_delay: Option<Duration>,
    paced: bool,
    keep_written: bool,
    counters: PlaybackCounters,
}

impl Default for PlaybackSlot {
    fn default() -> Self {
        Self {
            min_buffer: DEFAULT_MIN_BUFFER,
            open_error: None,
            written: Vec::new(),
            volume: 1.0,
            playing: false,
            write_errors: VecDeque::new(),
            write_delay: None,
            paced: false,
            keep_written: true,
            counters: PlaybackCounters::default(),
        }
    }
}

#[derive(Default)]
struct Shared {
    system: CaptureSlot,
    mic: CaptureSlot,
    playback: PlaybackSlot,
}

impl Shared {
    fn capture(&mut self, kind: SourceKind) -> &mut CaptureSlot {
        match kind {
            SourceKind::SystemCapture => &mut self.system,
            SourceKind::MicCapture => &mut self.mic,
        }
    }
}

/// Backend whose devices live entirely in memory.
///
/// Clones share the same devices, so a test can keep one clone for
/// inspection while the session owns another.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the minimum buffer size reported for a capture endpoint.
    pub fn set_min_buffer_size(&self, kind: SourceKind, bytes: i32) {
        self.shared.lock().capture(kind).min_buffer = bytes;
    }

    /// Override the minimum buffer size reported for playback.
    pub fn set_playback_min_buffer_size(&self, bytes: i32) {
        self.shared.lock().playback.min_buffer = bytes;
    }

    /// Make opening the capture endpoint fail with `message`.
    pub fn fail_open_capture(&self, kind: SourceKind, message: &str) {
        self.shared.lock().capture(kind).open_error = Some(message.to_string());
    }

    /// Make starting the capture endpoint fail with `message`.
    pub fn fail_start_capture(&self, kind: SourceKind, message: &str) {
        self.shared.lock().capture(kind).start_error = Some(message.to_string());
    }

    /// Make opening playback fail with `message`.
    pub fn fail_open_playback(&self, message: &str) {
        self.shared.lock().playback.open_error = Some(message.to_string());
    }

    /// Handle for scripting reads on a capture endpoint.
    pub fn capture_feed(&self, kind: SourceKind) -> CaptureFeed {
        CaptureFeed {
            shared: Arc::clone(&self.shared),
            kind,
        }
    }

    /// Scripted reads not consumed yet.
    pub fn pending_reads(&self, kind: SourceKind) -> usize {
        self.shared.lock().capture(kind).queue.len()
    }

    pub fn counters(&self, kind: SourceKind) -> DeviceCounters {
        self.shared.lock().capture(kind).counters
    }

    pub fn playback_counters(&self) -> PlaybackCounters {
        self.shared.lock().playback.counters
    }

    /// Every byte accepted by playback so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().playback.written.clone()
    }

    /// Accepted playback as interleaved `(left, right)` frames.
    pub fn written_frames(&self) -> Vec<(i16, i16)> {
        self.shared
            .lock()
            .playback
            .written
            .chunks_exact(4)
            .map(|f| {
                (
                    i16::from_le_bytes([f[0], f[1]]),
                    i16::from_le_bytes([f[2], f[3]]),
                )
            })
            .collect()
    }

    /// Output gain last set on the playback device.
    pub fn volume(&self) -> f32 {
        self.shared.lock().playback.volume
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().playback.playing
    }

    /// Make the next `count` writes fail with `code`.
    pub fn fail_next_writes(&self, code: i32, count: usize) {
        let mut shared = self.shared.lock();
        shared
            .playback
            .write_errors
            .extend(std::iter::repeat(code).take(count));
    }

    /// Block every write for `delay`, as a full device buffer would.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.shared.lock().playback.write_delay = delay;
    }

    /// Block each write for the real-time duration of the data written.
    pub fn set_paced(&self, paced: bool) {
        self.shared.lock().playback.paced = paced;
    }

    /// Whether accepted playback is kept for [`MemoryBackend::written`].
    pub fn set_keep_written(&self, keep: bool) {
        let mut shared = self.shared.lock();
        shared.playback.keep_written = keep;
        if !keep {
            shared.playback.written = Vec::new();
        }
    }
}

impl AudioBackend for MemoryBackend {
    fn min_capture_buffer_size(&self, kind: SourceKind, _spec: &AudioStreamSpec) -> i32 {
        self.shared.lock().capture(kind).min_buffer
    }

    fn min_playback_buffer_size(&self, _spec: &AudioStreamSpec) -> i32 {
        self.shared.lock().playback.min_buffer
    }

    fn open_capture(
        &self,
        kind: SourceKind,
        _spec: &AudioStreamSpec,
        _authorization: Option<&CaptureAuthorization>,
    ) -> Result<Box<dyn CaptureDevice>, String> {
        let mut shared = self.shared.lock();
        let slot = shared.capture(kind);
        if let Some(message) = slot.open_error.clone() {
            return Err(message);
        }
        slot.counters.opens += 1;

        Ok(Box::new(MemoryCapture {
            shared: Arc::clone(&self.shared),
            kind,
        }))
    }

    fn open_playback(&self, spec: &AudioStreamSpec) -> Result<Box<dyn PlaybackDevice>, String> {
        let mut shared = self.shared.lock();
        if let Some(message) = shared.playback.open_error.clone() {
            return Err(message);
        }
        shared.playback.counters.opens += 1;

        Ok(Box::new(MemoryPlayback {
            shared: Arc::clone(&self.shared),
            spec: *spec,
        }))
    }
}

/// Producer side of a memory capture endpoint.
#[derive(Clone)]
pub struct CaptureFeed {
    shared: Arc<Mutex<Shared>>,
    kind: SourceKind,
}

impl CaptureFeed {
    pub fn push(&self, step: ReadStep) {
        self.shared.lock().capture(self.kind).queue.push_back(step);
    }

    /// Queue little-endian PCM16 samples as one read.
    pub fn push_samples(&self, samples: &[i16]) {
        let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.push(ReadStep::Data(bytes));
    }

    /// Scripted reads not consumed yet.
    pub fn pending(&self) -> usize {
        self.shared.lock().capture(self.kind).queue.len()
    }
}

struct MemoryCapture {
    shared: Arc<Mutex<Shared>>,
    kind: SourceKind,
}

impl CaptureDevice for MemoryCapture {
    fn start(&mut self) -> Result<(), String> {
        let mut shared = self.shared.lock();
        let slot = shared.capture(self.kind);
        if let Some(message) = slot.start_error.clone() {
            return Err(message);
        }
        slot.counters.starts += 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, i32> {
        let mut shared = self.shared.lock();
        let slot = shared.capture(self.kind);
        slot.counters.reads += 1;

        match slot.queue.pop_front() {
            None | Some(ReadStep::Empty) => Ok(0),
            Some(ReadStep::Error(code)) => Err(code),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    slot.queue.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }

    fn stop(&mut self) {
        self.shared.lock().capture(self.kind).counters.stops += 1;
    }

    fn release(&mut self) {
        self.shared.lock().capture(self.kind).counters.releases += 1;
    }
}

struct MemoryPlayback {
    shared: Arc<Mutex<Shared>>,
    spec: AudioStreamSpec,
}

impl PlaybackDevice for MemoryPlayback {
    fn play(&mut self) {
        let mut shared = self.shared.lock();
        shared.playback.playing = true;
        shared.playback.counters.plays += 1;
    }

    fn pause(&mut self) {
        let mut shared = self.shared.lock();
        shared.playback.playing = false;
        shared.playback.counters.pauses += 1;
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, i32> {
        let delay = {
            let mut shared = self.shared.lock();
            let playback = &mut shared.playback;
            playback.counters.writes += 1;

            if let Some(code) = playback.write_errors.pop_front() {
                return Err(code);
            }
            if playback.keep_written {
                playback.written.extend_from_slice(buf);
            }

            let paced = playback.paced.then(|| {
                let frames = self.spec.frames_in(buf.len()) as u64;
                Duration::from_micros(frames * 1_000_000 / u64::from(self.spec.sample_rate))
            });
            playback.write_delay.or(paced)
        };

        // Block outside the lock, like a device draining its buffer.
        if let Some(delay) = delay {
            trace!(?delay, "Memory playback blocking");
            thread::sleep(delay);
        }
        Ok(buf.len())
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared.lock().playback.volume = volume;
    }

    fn flush(&mut self) {
        self.shared.lock().playback.counters.flushes += 1;
    }

    fn stop(&mut self) {
        let mut shared = self.shared.lock();
        shared.playback.playing = false;
        shared.playback.counters.stops += 1;
    }

    fn release(&mut self) {
        self.shared.lock().playback.counters.releases += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_data_stays_queued() {
        let backend = MemoryBackend::new();
        let feed = backend.capture_feed(SourceKind::MicCapture);
        let mut device = backend
            .open_capture(
                SourceKind::MicCapture,
                &AudioStreamSpec::mic_capture(),
                None,
            )
            .unwrap();

        feed.push(ReadStep::Data(vec![7u8; 6]));
        let mut buf = [0u8; 4];
        assert_eq!(device.read(&mut buf), Ok(4));
        assert_eq!(feed.pending(), 1);
        assert_eq!(device.read(&mut buf), Ok(2));
        assert_eq!(device.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_scripted_write_errors() {
        let backend = MemoryBackend::new();
        let mut device = backend
            .open_playback(&AudioStreamSpec::playback())
            .unwrap();
        backend.fail_next_writes(-6, 1);

        assert_eq!(device.write(&[0u8; 4]), Err(-6));
        assert_eq!(device.write(&[1u8; 4]), Ok(4));
        assert_eq!(backend.written(), vec![1u8; 4]);
        assert_eq!(backend.playback_counters().writes, 2);
    }
}
