//! Session state machine types.

use serde::{Deserialize, Serialize};

/// The current state of the capture/mix/render session.
///
/// ```text
/// Idle → AwaitingAuthorization → Starting → Running → Stopping → Idle
///              ↓                    ↓
///            Failed ──────────────────────────────────→ Idle
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session is active.
    #[default]
    Idle,

    /// Validating the capture-authorization handle for system audio.
    AwaitingAuthorization,

    /// Acquiring sources and sink.
    Starting {
        /// Current startup phase.
        phase: StartupPhase,
    },

    /// The mixing engine is running.
    Running {
        /// Whether system audio capture was opened for this session.
        system_audio: bool,
    },

    /// The session is being torn down.
    Stopping {
        /// Reason for stopping.
        reason: StopReason,
    },

    /// Session setup failed; the controller returns to `Idle` right after.
    Failed {
        /// Error message.
        message: String,
    },
}

impl SessionState {
    /// Returns true if no session is active.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the session is awaiting authorization or starting.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::AwaitingAuthorization | Self::Starting { .. })
    }

    /// Returns true if the mixing engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Returns true if the session is stopping.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::AwaitingAuthorization => "AwaitingAuthorization",
            Self::Starting { .. } => "Starting",
            Self::Running { .. } => "Running",
            Self::Stopping { .. } => "Stopping",
            Self::Failed { .. } => "Failed",
        }
    }
}

/// Startup phases, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Opening system/app playback capture (optional).
    OpenSystemCapture,

    /// Opening microphone capture.
    OpenMicCapture,

    /// Opening the output sink.
    OpenSink,

    /// Starting recording, playback and the mixer thread.
    StartEngine,
}

impl StartupPhase {
    /// The first phase of every session start.
    pub const FIRST: Self = Self::OpenSystemCapture;

    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::OpenSystemCapture => Some(Self::OpenMicCapture),
            Self::OpenMicCapture => Some(Self::OpenSink),
            Self::OpenSink => Some(Self::StartEngine),
            Self::StartEngine => None,
        }
    }

    /// Returns the previous phase, if any (for rollback).
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::OpenSystemCapture => None,
            Self::OpenMicCapture => Some(Self::OpenSystemCapture),
            Self::OpenSink => Some(Self::OpenMicCapture),
            Self::StartEngine => Some(Self::OpenSink),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenSystemCapture => "Opening system audio capture",
            Self::OpenMicCapture => "Opening microphone",
            Self::OpenSink => "Opening output",
            Self::StartEngine => "Starting mixer",
        }
    }
}

/// Reason for stopping a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// Explicit stop command.
    UserRequested,

    /// A new session was requested while this one was running.
    Restart,

    /// The capture authorization was revoked externally.
    AuthorizationRevoked,

    /// Every capture source failed; the mixer drained itself.
    SourcesLost,

    /// The mixer thread exited unexpectedly.
    EngineExited,

    /// The controller is shutting down.
    Shutdown,
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Session stopped by user".to_string(),
            Self::Restart => "Session restarted".to_string(),
            Self::AuthorizationRevoked => "Capture authorization revoked".to_string(),
            Self::SourcesLost => "All audio sources failed".to_string(),
            Self::EngineExited => "Mixer exited unexpectedly".to_string(),
            Self::Shutdown => "Controller shutting down".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_phases_walk_forward_and_back() {
        let mut phase = StartupPhase::FIRST;
        let mut forward = vec![phase];
        while let Some(next) = phase.next() {
            phase = next;
            forward.push(phase);
        }
        assert_eq!(forward.len(), 4);
        assert_eq!(phase, StartupPhase::StartEngine);

        let mut backward = vec![phase];
        while let Some(prev) = phase.previous() {
            phase = prev;
            backward.push(phase);
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Idle.is_idle());
        assert!(SessionState::AwaitingAuthorization.is_starting());
        assert!(SessionState::Running { system_audio: false }.is_running());
        assert!(SessionState::Stopping {
            reason: StopReason::UserRequested
        }
        .is_stopping());
        assert_eq!(
            SessionState::Failed {
                message: "no sink".into()
            }
            .name(),
            "Failed"
        );
    }
}
