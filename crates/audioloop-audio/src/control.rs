//! Mutable mix controls shared between command handlers and the mixer.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::RwLock;

use audioloop_ipc::ControlSettings;

/// Values read by the mixer once per iteration.
pub type ControlSnapshot = ControlSettings;

/// Master volume, per-source gains and mic mute.
///
/// Each field is updated independently with last-write-wins semantics;
/// no ordering is guaranteed across fields.
pub struct ControlState {
    master_volume: RwLock<f32>,
    mic_gain_pct: AtomicI32,
    app_gain_pct: AtomicI32,
    mic_muted: AtomicBool,
}

impl ControlState {
    /// Create controls at their session defaults.
    pub fn new() -> Self {
        let defaults = ControlSettings::default();
        Self {
            master_volume: RwLock::new(defaults.master_volume),
            mic_gain_pct: AtomicI32::new(defaults.mic_gain_pct),
            app_gain_pct: AtomicI32::new(defaults.app_gain_pct),
            mic_muted: AtomicBool::new(defaults.mic_muted),
        }
    }

    /// Set master volume (0.0 - 1.0).
    pub fn set_master_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        *self.master_volume.write() = volume;
    }

    /// Set microphone gain percentage (0 - 100).
    pub fn set_mic_gain(&self, pct: i32) {
        self.mic_gain_pct.store(pct.clamp(0, 100), Ordering::SeqCst);
    }

    /// Set app audio gain percentage (0 - 100).
    pub fn set_app_gain(&self, pct: i32) {
        self.app_gain_pct.store(pct.clamp(0, 100), Ordering::SeqCst);
    }

    pub fn set_mic_muted(&self, muted: bool) {
        self.mic_muted.store(muted, Ordering::SeqCst);
    }

    /// Restore the session defaults {0.5, 0, 0, false}.
    pub fn reset(&self) {
        let defaults = ControlSettings::default();
        self.set_master_volume(defaults.master_volume);
        self.set_mic_gain(defaults.mic_gain_pct);
        self.set_app_gain(defaults.app_gain_pct);
        self.set_mic_muted(defaults.mic_muted);
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            master_volume: *self.master_volume.read(),
            mic_gain_pct: self.mic_gain_pct.load(Ordering::SeqCst),
            app_gain_pct: self.app_gain_pct.load(Ordering::SeqCst),
            mic_muted: self.mic_muted.load(Ordering::SeqCst),
        }
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_setters_clamp() {
        let controls = ControlState::new();
        controls.set_master_volume(3.0);
        controls.set_mic_gain(250);
        controls.set_app_gain(-5);

        let snapshot = controls.snapshot();
        assert_eq!(snapshot.master_volume, 1.0);
        assert_eq!(snapshot.mic_gain_pct, 100);
        assert_eq!(snapshot.app_gain_pct, 0);

        controls.set_master_volume(f32::NAN);
        assert_eq!(controls.snapshot().master_volume, 0.0);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let controls = ControlState::new();
        controls.set_master_volume(0.9);
        controls.set_mic_gain(40);
        controls.set_app_gain(60);
        controls.set_mic_muted(true);

        controls.reset();
        assert_eq!(controls.snapshot(), ControlSettings::default());
    }

    #[test]
    fn test_concurrent_writers_last_write_wins_per_field() {
        let controls = Arc::new(ControlState::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let controls = Arc::clone(&controls);
                thread::spawn(move || {
                    for pct in 0..=100 {
                        if i % 2 == 0 {
                            controls.set_mic_gain(pct);
                        } else {
                            controls.set_app_gain(pct);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = controls.snapshot();
        assert_eq!(snapshot.mic_gain_pct, 100);
        assert_eq!(snapshot.app_gain_pct, 100);
    }
}
