//! Output focus tracking.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use audioloop_ipc::FocusEvent;

/// Callback invoked on every focus change.
pub type FocusListener = Box<dyn Fn(FocusEvent) + Send + Sync + 'static>;

/// Passive listener for external playback-priority changes.
///
/// The arbiter never requests exclusive focus; it only records what the
/// platform reports so that playback can coexist with other producers.
pub struct FocusArbiter {
    gate: AtomicBool,
    listeners: Mutex<Vec<FocusListener>>,
}

impl FocusArbiter {
    /// Create an arbiter with the gate open.
    pub fn new() -> Self {
        Self {
            gate: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Add a callback for focus changes.
    pub fn register(&self, on_change: impl Fn(FocusEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(on_change));
    }

    /// Whether this process may currently render audio.
    pub fn current_gate(&self) -> bool {
        self.gate.load(Ordering::SeqCst)
    }

    /// Deliver an external focus change.
    pub fn notify(&self, event: FocusEvent) {
        let gate = event.gate();
        let previous = self.gate.swap(gate, Ordering::SeqCst);
        if previous != gate {
            info!(?event, gate, "Output focus changed");
        } else {
            debug!(?event, "Output focus event");
        }

        for listener in self.listeners.lock().iter() {
            listener(event);
        }
    }

    /// Drop all listeners and reopen the gate.
    pub fn release(&self) {
        self.listeners.lock().clear();
        self.gate.store(true, Ordering::SeqCst);
    }
}

impl Default for FocusArbiter {
    fn default() -> Self {
        Self::new()
    }
}
