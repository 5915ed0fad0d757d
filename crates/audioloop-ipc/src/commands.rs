//! Commands sent from the front end to the session controller.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AuthorizationToken;

/// Commands that the front end can send to the session controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Set master output volume (0 - 100).
    SetMasterVolume(u8),

    /// Set microphone gain percentage (0 - 100).
    SetMicGain(i32),

    /// Set app/system audio gain percentage (0 - 100).
    SetAppGain(i32),

    /// Mute or unmute the microphone contribution.
    SetMicMuted(bool),

    /// Start a session. Without an authorization token the session runs
    /// microphone-only.
    StartSession {
        authorization: Option<AuthorizationToken>,
    },

    /// Stop the current session.
    StopSession,

    /// Request a status report.
    RequestStatus,

    /// Stop any session and end the controller loop.
    Shutdown,
}

/// Error returned when a console line cannot be parsed into a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("missing argument for {0}")]
    MissingArgument(&'static str),

    #[error("invalid argument for {command}: {value}")]
    InvalidArgument { command: &'static str, value: String },
}

fn parse_percent(command: &'static str, value: Option<&str>) -> Result<i32, ParseCommandError> {
    let value = value.ok_or(ParseCommandError::MissingArgument(command))?;
    match value.parse::<i32>() {
        Ok(pct) if (0..=100).contains(&pct) => Ok(pct),
        _ => Err(ParseCommandError::InvalidArgument {
            command,
            value: value.to_string(),
        }),
    }
}

fn parse_switch(command: &'static str, value: Option<&str>) -> Result<bool, ParseCommandError> {
    match value {
        Some("on" | "true" | "1") => Ok(true),
        Some("off" | "false" | "0") => Ok(false),
        Some(other) => Err(ParseCommandError::InvalidArgument {
            command,
            value: other.to_string(),
        }),
        None => Err(ParseCommandError::MissingArgument(command)),
    }
}

/// Parses the console syntax used by the `audioloop` binary, e.g.
/// `start`, `start <token>`, `volume 80`, `mic-gain 20`, `mute on`.
impl FromStr for ControlCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or(ParseCommandError::Empty)?;
        let arg = parts.next();

        match verb {
            "start" => Ok(Self::StartSession {
                authorization: arg.map(AuthorizationToken::new),
            }),
            "stop" => Ok(Self::StopSession),
            "status" => Ok(Self::RequestStatus),
            "quit" | "exit" | "shutdown" => Ok(Self::Shutdown),
            "volume" => parse_percent("volume", arg).map(|pct| Self::SetMasterVolume(pct as u8)),
            "mic-gain" => parse_percent("mic-gain", arg).map(Self::SetMicGain),
            "app-gain" => parse_percent("app-gain", arg).map(Self::SetAppGain),
            "mute" => parse_switch("mute", arg).map(Self::SetMicMuted),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}
