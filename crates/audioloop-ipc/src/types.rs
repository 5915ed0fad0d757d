//! Common types used across control/status messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::SessionState;

/// Which capture source a message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Application/system playback capture (stereo).
    SystemCapture,

    /// Microphone capture (mono).
    MicCapture,
}

impl SourceKind {
    /// Returns the display name for this source.
    pub fn name(self) -> &'static str {
        match self {
            Self::SystemCapture => "system",
            Self::MicCapture => "mic",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// External playback-priority change delivered to the focus arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusEvent {
    /// This process may render audio again.
    Gained,

    /// Another producer took the output for good.
    LostPermanently,

    /// Another producer took the output for a short while.
    LostTransient,

    /// Another producer took the output but would accept ducked playback.
    LostTransientDuckable,
}

impl FocusEvent {
    /// The focus gate value implied by this event.
    pub fn gate(self) -> bool {
        matches!(self, Self::Gained)
    }
}

/// Opaque token produced by the external capture-permission flow.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorizationToken(String);

impl AuthorizationToken {
    /// Wrap a token handed over by the permission flow.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token value, for the authorization provider only.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthorizationToken(..)")
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sample rate used by every endpoint (default: 44100).
    pub sample_rate: u32,

    /// Sleep applied when no source produced frames, in milliseconds (default: 10).
    pub idle_backoff_ms: u64,

    /// Upper bound on waiting for the mixer thread at stop, in milliseconds (default: 500).
    pub join_timeout_ms: u64,

    /// Fail the start instead of running mic-only when no authorization is supplied.
    pub require_system_audio: bool,

    /// Period of `Statistics` events while running, in milliseconds; 0 disables.
    pub stats_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            idle_backoff_ms: 10,
            join_timeout_ms: 500,
            require_system_audio: false,
            stats_interval_ms: 1000,
        }
    }
}

/// Current control values, as percentages where the UI uses them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Master volume (0.0 - 1.0).
    pub master_volume: f32,

    /// Microphone gain percentage (0 - 100).
    pub mic_gain_pct: i32,

    /// App audio gain percentage (0 - 100).
    pub app_gain_pct: i32,

    /// Whether the microphone contribution is muted.
    pub mic_muted: bool,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            master_volume: 0.5,
            mic_gain_pct: 0,
            app_gain_pct: 0,
            mic_muted: false,
        }
    }
}

/// Counters reported by the mixing engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerStatistics {
    /// Loop iterations since the session started.
    pub iterations: u64,

    /// Iterations where no source produced frames.
    pub idle_iterations: u64,

    /// Frames read from system capture.
    pub system_frames_read: u64,

    /// Frames read from the microphone.
    pub mic_frames_read: u64,

    /// Output frames produced by the mixer.
    pub frames_mixed: u64,

    /// Output frames accepted by the sink.
    pub frames_written: u64,

    /// Output frames dropped while the focus gate was closed.
    pub frames_discarded: u64,

    /// Sink writes that returned an error.
    pub write_errors: u64,
}

/// Answer to `RequestStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current session state.
    pub state: SessionState,

    /// Whether system audio capture is live and feeding the mixer.
    pub system_audio_contributing: bool,

    /// Whether the microphone is live and feeding the mixer.
    pub mic_contributing: bool,

    /// Whether the focus gate is currently open.
    pub focus_gate: bool,

    /// Current control values.
    pub controls: ControlSettings,

    /// Mixer counters for the current session.
    pub statistics: MixerStatistics,

    /// Session uptime in seconds.
    pub uptime_seconds: u64,
}

/// Types of runtime warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WarningType {
    /// Sink writes keep failing.
    SinkWriteErrors { count: u64 },

    /// Sources are live but nothing has been read for a while.
    SourcesStalled { idle_iterations: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_event_gate() {
        assert!(FocusEvent::Gained.gate());
        assert!(!FocusEvent::LostPermanently.gate());
        assert!(!FocusEvent::LostTransient.gate());
        assert!(!FocusEvent::LostTransientDuckable.gate());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AuthorizationToken::new("secret-grant");
        assert_eq!(format!("{:?}", token), "AuthorizationToken(..)");
        assert_eq!(token.as_str(), "secret-grant");
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "idle_backoff_ms": 1, "require_system_audio": true }"#)
                .unwrap();
        assert_eq!(config.idle_backoff_ms, 1);
        assert!(config.require_system_audio);
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.join_timeout_ms, 500);
    }

    #[test]
    fn test_control_defaults() {
        let controls = ControlSettings::default();
        assert_eq!(controls.master_volume, 0.5);
        assert_eq!(controls.mic_gain_pct, 0);
        assert_eq!(controls.app_gain_pct, 0);
        assert!(!controls.mic_muted);
    }
}
