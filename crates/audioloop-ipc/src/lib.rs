//! Typed control/status messages for audioloop.
//!
//! This crate defines the messages exchanged between the session controller
//! and whatever front end drives it (control widget, CLI, tests).

mod commands;
mod events;
mod state;
mod types;

pub use commands::{ControlCommand, ParseCommandError};
pub use events::SessionEvent;
pub use state::{SessionState, StartupPhase, StopReason};
pub use types::{
    AuthorizationToken, ControlSettings, FocusEvent, MixerStatistics, SessionConfig, SourceKind,
    StatusReport, WarningType,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (front end → controller).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (controller → front end).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<ControlCommand>, Receiver<ControlCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
