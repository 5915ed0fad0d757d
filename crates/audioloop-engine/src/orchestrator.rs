//! Session controller: command loop and lifecycle state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use audioloop_audio::{
    AudioBackend, CaptureAuthorization, ControlState, FocusArbiter, MixerExit, MixerStats,
};
use audioloop_ipc::{
    AuthorizationToken, ControlCommand, SessionConfig, SessionEvent, SessionState, SourceKind,
    StatusReport, StopReason,
};

use crate::authorization::{AuthorizationError, AuthorizationProvider};
use crate::error::SessionError;
use crate::metrics::MetricsCollector;
use crate::state::{ResourceManager, SessionPlan};

/// How often the loop wakes up without commands.
const TICK: Duration = Duration::from_millis(100);

/// Per-session bookkeeping that is not a device resource.
struct ActiveSession {
    authorization: Option<CaptureAuthorization>,
    revoked: Option<Receiver<()>>,
    mixer_exit: Option<Receiver<MixerExit>>,
    started_at: Instant,
}

/// Owns one capture/mix/render session at a time.
pub struct SessionController {
    command_rx: Receiver<ControlCommand>,
    event_tx: Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    resource_manager: ResourceManager,
    authorizer: Box<dyn AuthorizationProvider>,
    controls: Arc<ControlState>,
    focus: Arc<FocusArbiter>,
    metrics: MetricsCollector,
    config: SessionConfig,
    session: Option<ActiveSession>,
}

impl SessionController {
    /// Create a controller.
    pub fn new(
        command_rx: Receiver<ControlCommand>,
        event_tx: Sender<SessionEvent>,
        backend: Arc<dyn AudioBackend>,
        authorizer: Box<dyn AuthorizationProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            command_rx,
            event_tx,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            resource_manager: ResourceManager::new(backend),
            authorizer,
            controls: Arc::new(ControlState::new()),
            focus: Arc::new(FocusArbiter::new()),
            metrics: MetricsCollector::new(Arc::new(MixerStats::new()), config.stats_interval_ms),
            config,
            session: None,
        }
    }

    /// The arbiter external focus changes are delivered to.
    pub fn focus(&self) -> Arc<FocusArbiter> {
        Arc::clone(&self.focus)
    }

    /// Shared view of the current state.
    pub fn state(&self) -> Arc<RwLock<SessionState>> {
        Arc::clone(&self.state)
    }

    /// Run the controller (blocking).
    #[instrument(name = "controller_run", skip(self))]
    pub fn run(&mut self) {
        info!("Session controller starting");
        self.send_event(SessionEvent::Ready);

        let commands = self.command_rx.clone();
        loop {
            let revoked = self
                .session
                .as_ref()
                .and_then(|s| s.revoked.clone())
                .unwrap_or_else(never);
            let mixer_exit = self
                .session
                .as_ref()
                .and_then(|s| s.mixer_exit.clone())
                .unwrap_or_else(never);

            crossbeam_channel::select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        info!("Command channel disconnected, shutting down");
                        self.stop_session(StopReason::Shutdown);
                        break;
                    }
                },
                recv(revoked) -> msg => match msg {
                    Ok(()) => self.on_authorization_revoked(),
                    Err(_) => {
                        // Provider dropped the grant; it can no longer be revoked.
                        if let Some(session) = self.session.as_mut() {
                            session.revoked = None;
                        }
                    }
                },
                recv(mixer_exit) -> msg => self.on_mixer_exit(msg.ok()),
                default(TICK) => self.on_tick(),
            }
        }

        info!("Session controller stopped");
    }

    /// Handle a command. Returns false if the controller should stop.
    fn handle_command(&mut self, command: ControlCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            ControlCommand::SetMasterVolume(volume) => {
                self.controls.set_master_volume(f32::from(volume) / 100.0)
            }
            ControlCommand::SetMicGain(pct) => self.controls.set_mic_gain(pct),
            ControlCommand::SetAppGain(pct) => self.controls.set_app_gain(pct),
            ControlCommand::SetMicMuted(muted) => self.controls.set_mic_muted(muted),
            ControlCommand::StartSession { authorization } => self.start_session(authorization),
            ControlCommand::StopSession => self.stop_session(StopReason::UserRequested),
            ControlCommand::RequestStatus => self.send_status(),
            ControlCommand::Shutdown => {
                self.stop_session(StopReason::Shutdown);
                self.send_event(SessionEvent::Shutdown);
                return false;
            }
        }

        true
    }

    /// Start a session, tearing down a running one first.
    #[instrument(name = "start_session", skip(self, token))]
    fn start_session(&mut self, token: Option<AuthorizationToken>) {
        {
            let state = self.state.read();
            if state.is_starting() || state.is_stopping() {
                debug!("Session is changing state, ignoring start command");
                return;
            }
        }
        if self.state.read().is_running() {
            self.stop_session(StopReason::Restart);
        }

        info!(system_audio = token.is_some(), "Starting session");
        self.controls.reset();
        self.metrics =
            MetricsCollector::new(Arc::new(MixerStats::new()), self.config.stats_interval_ms);

        let context = match token {
            Some(token) => {
                self.transition_to(SessionState::AwaitingAuthorization);
                match self.authorizer.acquire(&token) {
                    Ok(context) if context.authorization().is_valid() => Some(context),
                    Ok(_) => {
                        self.fail_start(SessionError::Authorization(AuthorizationError::Revoked));
                        return;
                    }
                    Err(e) => {
                        self.fail_start(e.into());
                        return;
                    }
                }
            }
            None if self.config.require_system_audio => {
                self.fail_start(SessionError::AuthorizationMissing);
                return;
            }
            None => {
                debug!("No authorization supplied, starting microphone-only");
                None
            }
        };
        let (authorization, revoked) = context.map(|c| c.into_parts()).unzip();

        let plan = SessionPlan {
            config: self.config.clone(),
            authorization: authorization.clone(),
            controls: Arc::clone(&self.controls),
            focus: Arc::clone(&self.focus),
            stats: Arc::clone(self.metrics.stats()),
            events: self.event_tx.clone(),
        };

        let result = self
            .resource_manager
            .initialize(&plan, |phase| self.transition_to(SessionState::Starting { phase }));

        match result {
            Ok(()) => {
                let system_audio = self.resource_manager.has_system_capture();
                self.session = Some(ActiveSession {
                    authorization,
                    revoked,
                    mixer_exit: self.resource_manager.mixer_exit(),
                    started_at: Instant::now(),
                });
                self.metrics.start();

                self.transition_to(SessionState::Running { system_audio });
                self.send_event(SessionEvent::SessionStarted { system_audio });
                info!(system_audio, "Session started");
            }
            Err(e) => {
                self.resource_manager.rollback();
                self.focus.release();
                if let Some(authorization) = authorization {
                    self.authorizer.release(&authorization);
                }
                self.fail_start(e);
            }
        }
    }

    /// Report a failed start and return to `Idle`.
    fn fail_start(&mut self, error: SessionError) {
        let message = error.to_string();
        error!("Session start failed: {}", message);

        self.transition_to(SessionState::Failed {
            message: message.clone(),
        });
        self.send_event(SessionEvent::Error {
            recoverable: true,
            message,
        });
        self.transition_to(SessionState::Idle);
    }

    /// Stop the session. A no-op when nothing is running.
    #[instrument(name = "stop_session", skip(self))]
    fn stop_session(&mut self, reason: StopReason) {
        {
            let state = self.state.read();
            if state.is_idle() || state.is_stopping() {
                debug!("Already idle or stopping, ignoring stop command");
                return;
            }
        }

        info!(?reason, "Stopping session");
        self.transition_to(SessionState::Stopping {
            reason: reason.clone(),
        });

        self.metrics.stop();

        // Joins the mixer, then releases sink and sources in reverse order.
        self.resource_manager.shutdown();
        self.focus.release();

        if let Some(session) = self.session.take() {
            if let Some(authorization) = session.authorization {
                self.authorizer.release(&authorization);
            }
            debug!(
                uptime_secs = session.started_at.elapsed().as_secs(),
                "Session resources released"
            );
        }

        self.transition_to(SessionState::Idle);
        self.send_event(SessionEvent::SessionStopped { reason });
        info!("Session stopped");
    }

    fn on_authorization_revoked(&mut self) {
        if !self.state.read().is_running() {
            return;
        }
        warn!("Capture authorization revoked, stopping session");
        self.send_event(SessionEvent::AuthorizationLost);
        self.stop_session(StopReason::AuthorizationRevoked);
    }

    fn on_mixer_exit(&mut self, exit: Option<MixerExit>) {
        match exit {
            Some(MixerExit::SourcesLost) => {
                warn!("All capture sources failed");
                self.stop_session(StopReason::SourcesLost);
            }
            None => {
                error!("Mixer thread ended without reporting why");
                self.send_event(SessionEvent::Error {
                    recoverable: true,
                    message: StopReason::EngineExited.message(),
                });
                self.stop_session(StopReason::EngineExited);
            }
        }
    }

    fn on_tick(&self) {
        if self.state.read().is_running() && self.metrics.report_due() {
            self.emit_statistics();
        }
    }

    fn emit_statistics(&self) {
        let statistics = self.metrics.snapshot();
        self.send_event(SessionEvent::Statistics(statistics));

        for warning in self.metrics.check_warnings(&statistics) {
            self.send_event(SessionEvent::Warning(warning));
        }

        self.metrics.mark_reported(&statistics);
    }

    fn send_status(&self) {
        let report = StatusReport {
            state: self.state.read().clone(),
            system_audio_contributing: self
                .resource_manager
                .is_contributing(SourceKind::SystemCapture),
            mic_contributing: self.resource_manager.is_contributing(SourceKind::MicCapture),
            focus_gate: self.focus.current_gate(),
            controls: self.controls.snapshot(),
            statistics: self.metrics.snapshot(),
            uptime_seconds: self.metrics.uptime_seconds(),
        };
        self.send_event(SessionEvent::Status(report));
    }

    fn transition_to(&self, new_state: SessionState) {
        let previous = {
            let mut state = self.state.write();
            let prev = state.clone();
            *state = new_state.clone();
            prev
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(SessionEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop_session(StopReason::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, JoinHandle};

    use audioloop_audio::backend::memory::{MemoryBackend, ReadStep};
    use audioloop_ipc::{FocusEvent, StartupPhase};

    use crate::authorization::TokenAuthorizationProvider;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        backend: MemoryBackend,
        provider: TokenAuthorizationProvider,
        focus: Arc<FocusArbiter>,
        commands: Sender<ControlCommand>,
        events: Receiver<SessionEvent>,
        thread: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn new(config: SessionConfig) -> Self {
            let backend = MemoryBackend::new();
            let provider = TokenAuthorizationProvider::new();
            let (commands, command_rx) = crossbeam_channel::unbounded();
            let (event_tx, events) = crossbeam_channel::unbounded();

            let mut controller = SessionController::new(
                command_rx,
                event_tx,
                Arc::new(backend.clone()),
                Box::new(provider.clone()),
                config,
            );
            let focus = controller.focus();
            let thread = thread::spawn(move || controller.run());

            let harness = Self {
                backend,
                provider,
                focus,
                commands,
                events,
                thread: Some(thread),
            };
            harness.expect(|e| matches!(e, SessionEvent::Ready));
            harness
        }

        fn default_config() -> SessionConfig {
            SessionConfig {
                idle_backoff_ms: 1,
                stats_interval_ms: 0,
                ..SessionConfig::default()
            }
        }

        fn send(&self, command: ControlCommand) {
            self.commands.send(command).unwrap();
        }

        fn start(&self, token: Option<&str>) {
            self.send(ControlCommand::StartSession {
                authorization: token.map(AuthorizationToken::new),
            });
        }

        /// Skip events until one matches, returning it.
        fn expect(&self, mut predicate: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
            let deadline = Instant::now() + WAIT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.events.recv_timeout(remaining) {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("expected event not received: {e}"),
                }
            }
        }

        /// Collect every event up to and including the first match.
        fn collect_until(
            &self,
            mut predicate: impl FnMut(&SessionEvent) -> bool,
        ) -> Vec<SessionEvent> {
            let mut seen = Vec::new();
            loop {
                let event = self
                    .events
                    .recv_timeout(WAIT)
                    .expect("event stream stalled");
                let done = predicate(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        fn status(&self) -> StatusReport {
            self.send(ControlCommand::RequestStatus);
            match self.expect(|e| matches!(e, SessionEvent::Status(_))) {
                SessionEvent::Status(report) => report,
                _ => unreachable!(),
            }
        }

        fn shutdown(mut self) {
            self.send(ControlCommand::Shutdown);
            self.expect(|e| matches!(e, SessionEvent::Shutdown));
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn is_started(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::SessionStarted { .. })
    }

    fn is_stopped(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::SessionStopped { .. })
    }

    fn is_error(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::Error { .. })
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { current, .. } => Some((**current).clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_mic_only_session_lifecycle() {
        let harness = Harness::new(Harness::default_config());
        harness
            .backend
            .capture_feed(SourceKind::MicCapture)
            .push_samples(&[1000; 100]);

        harness.start(None);
        let events = harness.collect_until(is_started);
        assert_eq!(
            states(&events),
            vec![
                SessionState::Starting {
                    phase: StartupPhase::OpenSystemCapture
                },
                SessionState::Starting {
                    phase: StartupPhase::OpenMicCapture
                },
                SessionState::Starting {
                    phase: StartupPhase::OpenSink
                },
                SessionState::Starting {
                    phase: StartupPhase::StartEngine
                },
                SessionState::Running {
                    system_audio: false
                },
            ]
        );
        assert_eq!(
            events.last(),
            Some(&SessionEvent::SessionStarted {
                system_audio: false
            })
        );

        let deadline = Instant::now() + WAIT;
        while harness.backend.written_frames().len() < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(harness
            .backend
            .written_frames()
            .iter()
            .all(|&f| f == (1000, 1000)));
        assert_eq!(harness.backend.written_frames().len(), 100);
        assert_eq!(harness.backend.volume(), 0.5);

        harness.send(ControlCommand::StopSession);
        let events = harness.collect_until(is_stopped);
        assert_eq!(
            events.last(),
            Some(&SessionEvent::SessionStopped {
                reason: StopReason::UserRequested
            })
        );
        assert_eq!(states(&events).last(), Some(&SessionState::Idle));
        assert_eq!(harness.backend.counters(SourceKind::SystemCapture).opens, 0);
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).releases, 1);
        assert_eq!(harness.backend.playback_counters().releases, 1);

        harness.shutdown();
    }

    #[test]
    fn test_required_system_audio_without_token_fails() {
        let harness = Harness::new(SessionConfig {
            require_system_audio: true,
            ..Harness::default_config()
        });

        harness.start(None);
        let events = harness.collect_until(|e| {
            matches!(e, SessionEvent::StateChanged { current, .. } if current.is_idle())
        });
        assert!(events.iter().any(is_error));
        assert!(matches!(
            states(&events).as_slice(),
            [SessionState::Failed { .. }, SessionState::Idle]
        ));
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).opens, 0);
        assert_eq!(harness.backend.playback_counters().opens, 0);

        harness.shutdown();
    }

    #[test]
    fn test_denied_authorization_returns_to_idle() {
        let harness = Harness::new(Harness::default_config());
        harness
            .provider
            .deny_with(AuthorizationError::Denied("user declined".into()));

        harness.start(Some("grant"));
        let events = harness.collect_until(|e| {
            matches!(e, SessionEvent::StateChanged { current, .. } if current.is_idle())
        });
        assert_eq!(
            states(&events)[0],
            SessionState::AwaitingAuthorization
        );
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Error { message, .. } if message.contains("user declined")
        )));
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).opens, 0);

        harness.shutdown();
    }

    #[test]
    fn test_sink_failure_releases_opened_sources() {
        let harness = Harness::new(Harness::default_config());
        harness.backend.fail_open_playback("output busy");

        harness.start(Some("grant"));
        let events = harness.collect_until(is_error);
        assert!(!events.iter().any(is_started));
        harness.expect(|e| {
            matches!(e, SessionEvent::StateChanged { current, .. } if current.is_idle())
        });

        assert_eq!(harness.backend.counters(SourceKind::SystemCapture).releases, 1);
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).releases, 1);
        assert_eq!(harness.provider.released(), 1);

        harness.send(ControlCommand::StopSession);
        assert_eq!(harness.status().state, SessionState::Idle);
        harness.shutdown();
    }

    #[test]
    fn test_revocation_stops_session() {
        let harness = Harness::new(Harness::default_config());

        harness.start(Some("grant"));
        let started = harness.expect(is_started);
        assert_eq!(started, SessionEvent::SessionStarted { system_audio: true });

        assert_eq!(harness.provider.revoke_all(), 1);
        harness.expect(|e| matches!(e, SessionEvent::AuthorizationLost));
        let stopped = harness.expect(is_stopped);
        assert_eq!(
            stopped,
            SessionEvent::SessionStopped {
                reason: StopReason::AuthorizationRevoked
            }
        );
        assert_eq!(harness.backend.counters(SourceKind::SystemCapture).releases, 1);
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).releases, 1);

        harness.shutdown();
    }

    #[test]
    fn test_engine_self_terminates_when_all_sources_fail() {
        let harness = Harness::new(Harness::default_config());
        harness
            .backend
            .capture_feed(SourceKind::SystemCapture)
            .push(ReadStep::Error(-1));
        harness
            .backend
            .capture_feed(SourceKind::MicCapture)
            .push(ReadStep::Error(-2));

        harness.start(Some("grant"));
        let events = harness.collect_until(is_stopped);
        assert!(events.contains(&SessionEvent::SourceFailed(SourceKind::SystemCapture)));
        assert!(events.contains(&SessionEvent::SourceFailed(SourceKind::MicCapture)));
        assert_eq!(
            events.last(),
            Some(&SessionEvent::SessionStopped {
                reason: StopReason::SourcesLost
            })
        );
        assert_eq!(harness.status().state, SessionState::Idle);

        harness.shutdown();
    }

    #[test]
    fn test_double_stop_tears_down_once() {
        let harness = Harness::new(Harness::default_config());
        harness.start(None);
        harness.expect(is_started);

        harness.send(ControlCommand::StopSession);
        harness.send(ControlCommand::StopSession);
        harness.expect(is_stopped);
        assert_eq!(harness.status().state, SessionState::Idle);

        let later: Vec<_> = harness.events.try_iter().collect();
        assert!(!later.iter().any(is_stopped));
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).releases, 1);
        assert_eq!(harness.backend.playback_counters().releases, 1);

        harness.shutdown();
    }

    #[test]
    fn test_start_while_running_restarts() {
        let harness = Harness::new(Harness::default_config());
        harness.start(None);
        harness.expect(is_started);

        harness.start(None);
        let events = harness.collect_until(is_started);
        assert!(events.contains(&SessionEvent::SessionStopped {
            reason: StopReason::Restart
        }));
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).opens, 2);
        assert_eq!(harness.backend.counters(SourceKind::MicCapture).releases, 1);
        assert_eq!(harness.backend.playback_counters().releases, 1);

        harness.shutdown();
    }

    #[test]
    fn test_status_reports_controls_and_sources() {
        let harness = Harness::new(Harness::default_config());
        harness.send(ControlCommand::SetMicGain(80));
        harness.start(None);
        harness.expect(is_started);

        // Controls are reset when a session starts.
        assert_eq!(harness.status().controls.mic_gain_pct, 0);

        harness.send(ControlCommand::SetMicGain(40));
        harness.send(ControlCommand::SetMasterVolume(90));
        harness.send(ControlCommand::SetMicMuted(true));
        let report = harness.status();
        assert_eq!(
            report.state,
            SessionState::Running {
                system_audio: false
            }
        );
        assert!(report.mic_contributing);
        assert!(!report.system_audio_contributing);
        assert!(report.focus_gate);
        assert_eq!(report.controls.mic_gain_pct, 40);
        assert_eq!(report.controls.master_volume, 0.9);
        assert!(report.controls.mic_muted);

        harness.focus.notify(FocusEvent::LostTransient);
        assert!(!harness.status().focus_gate);

        harness.shutdown();
    }

    #[test]
    fn test_statistics_are_reported_while_running() {
        let harness = Harness::new(SessionConfig {
            stats_interval_ms: 20,
            ..Harness::default_config()
        });
        harness.start(None);
        harness.expect(is_started);

        let event = harness.expect(|e| matches!(e, SessionEvent::Statistics(_)));
        match event {
            SessionEvent::Statistics(stats) => assert!(stats.iterations > 0),
            _ => unreachable!(),
        }

        harness.shutdown();
    }

    #[test]
    fn test_shutdown_stops_running_session() {
        let harness = Harness::new(Harness::default_config());
        harness.start(None);
        harness.expect(is_started);

        harness.send(ControlCommand::Shutdown);
        let stopped = harness.expect(is_stopped);
        assert_eq!(
            stopped,
            SessionEvent::SessionStopped {
                reason: StopReason::Shutdown
            }
        );
        harness.expect(|e| matches!(e, SessionEvent::Shutdown));
        assert_eq!(harness.backend.playback_counters().releases, 1);
    }
}
