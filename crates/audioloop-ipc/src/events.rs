//! Events sent from the session controller to the front end.

use serde::{Deserialize, Serialize};

use crate::state::{SessionState, StopReason};
use crate::types::{MixerStatistics, SourceKind, StatusReport, WarningType};

/// Events that the controller can send to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Controller loop is ready for commands.
    Ready,

    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SessionState>,

        /// Current state.
        current: Box<SessionState>,
    },

    /// A session is now running.
    SessionStarted {
        /// Whether system audio capture is part of the mix.
        system_audio: bool,
    },

    /// No session is active any more.
    SessionStopped {
        /// Why the session ended.
        reason: StopReason,
    },

    /// A capture source failed and was dropped from the mix.
    SourceFailed(SourceKind),

    /// The capture authorization was revoked.
    AuthorizationLost,

    /// Answer to `RequestStatus`.
    Status(StatusReport),

    /// Periodic mixer counters.
    Statistics(MixerStatistics),

    /// Runtime warning.
    Warning(WarningType),

    /// Error occurred.
    Error {
        /// Whether the controller can carry on.
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// Controller loop has shut down.
    Shutdown,
}
