//! Mixer counters.

use std::sync::atomic::{AtomicU64, Ordering};

use audioloop_ipc::{MixerStatistics, SourceKind};

/// Lock-free counters updated by the mixer thread.
#[derive(Default)]
pub struct MixerStats {
    iterations: AtomicU64,
    idle_iterations: AtomicU64,
    system_frames_read: AtomicU64,
    mic_frames_read: AtomicU64,
    frames_mixed: AtomicU64,
    frames_written: AtomicU64,
    frames_discarded: AtomicU64,
    write_errors: AtomicU64,
}

impl MixerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle(&self) {
        self.idle_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, kind: SourceKind, frames: usize) {
        let counter = match kind {
            SourceKind::SystemCapture => &self.system_frames_read,
            SourceKind::MicCapture => &self.mic_frames_read,
        };
        counter.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_mixed(&self, frames: usize) {
        self.frames_mixed.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, frames: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, frames: usize) {
        self.frames_discarded.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MixerStatistics {
        MixerStatistics {
            iterations: self.iterations.load(Ordering::Relaxed),
            idle_iterations: self.idle_iterations.load(Ordering::Relaxed),
            system_frames_read: self.system_frames_read.load(Ordering::Relaxed),
            mic_frames_read: self.mic_frames_read.load(Ordering::Relaxed),
            frames_mixed: self.frames_mixed.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}
