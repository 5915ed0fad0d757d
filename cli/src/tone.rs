//! Test-tone feeder for the in-memory backend.

use std::f32::consts::TAU;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use audioloop_audio::backend::memory::CaptureFeed;
use audioloop_audio::backend::MemoryBackend;
use audioloop_ipc::SourceKind;

const CHUNK: Duration = Duration::from_millis(10);

/// Reads queued ahead of the mixer before the feeder waits.
const MAX_PENDING: usize = 8;

const AMPLITUDE: f32 = 4000.0;

struct Oscillator {
    phase: f32,
    step: f32,
}

impl Oscillator {
    fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate as f32,
        }
    }

    fn next_sample(&mut self) -> i16 {
        let sample = (self.phase.sin() * AMPLITUDE) as i16;
        self.phase = (self.phase + self.step) % TAU;
        sample
    }
}

/// Pushes a mono tone to the mic feed and a stereo tone to the system feed.
pub struct ToneFeeder {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ToneFeeder {
    pub fn spawn(backend: &MemoryBackend, sample_rate: u32) -> io::Result<Self> {
        let mic = backend.capture_feed(SourceKind::MicCapture);
        let system = backend.capture_feed(SourceKind::SystemCapture);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("audioloop-tone".to_string())
            .spawn(move || feed(mic, system, sample_rate, flag))?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }
}

impl Drop for ToneFeeder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn feed(mic: CaptureFeed, system: CaptureFeed, sample_rate: u32, running: Arc<AtomicBool>) {
    let frames = (sample_rate as u64 * CHUNK.as_millis() as u64 / 1000) as usize;
    let mut mic_tone = Oscillator::new(440.0, sample_rate);
    let mut system_left = Oscillator::new(660.0, sample_rate);
    let mut system_right = Oscillator::new(550.0, sample_rate);
    let mut mic_chunk = Vec::with_capacity(frames);
    let mut system_chunk = Vec::with_capacity(frames * 2);

    debug!(frames, "Tone feeder started");
    while running.load(Ordering::Acquire) {
        if mic.pending() < MAX_PENDING {
            mic_chunk.clear();
            mic_chunk.extend((0..frames).map(|_| mic_tone.next_sample()));
            mic.push_samples(&mic_chunk);
        }
        if system.pending() < MAX_PENDING {
            system_chunk.clear();
            for _ in 0..frames {
                system_chunk.push(system_left.next_sample());
                system_chunk.push(system_right.next_sample());
            }
            system.push_samples(&system_chunk);
        }
        thread::sleep(CHUNK);
    }
    debug!("Tone feeder stopped");
}
