//! Resource management and initialization tracking.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use audioloop_audio::{
    AudioBackend, AudioSink, AudioSource, AudioStreamSpec, CaptureAuthorization, ControlState,
    FocusArbiter, MixerConfig, MixerExit, MixerHandle, MixerStats, MixingEngine, SharedSource,
};
use audioloop_ipc::{SessionConfig, SessionEvent, SourceKind, StartupPhase};

use crate::error::{SessionError, SessionResult};

/// Everything a session start needs besides the backend.
pub struct SessionPlan {
    pub config: SessionConfig,
    pub authorization: Option<CaptureAuthorization>,
    pub controls: Arc<ControlState>,
    pub focus: Arc<FocusArbiter>,
    pub stats: Arc<MixerStats>,
    pub events: Sender<SessionEvent>,
}

impl SessionPlan {
    fn spec(&self, kind: SourceKind) -> AudioStreamSpec {
        AudioStreamSpec::for_source(kind).with_sample_rate(self.config.sample_rate)
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.join_timeout_ms)
    }
}

/// Resources that have been initialized during startup.
#[derive(Default)]
pub struct InitializedResources {
    /// Capture sessions.
    pub system_capture: Option<SharedSource>,
    pub mic_capture: Option<SharedSource>,

    /// Output sink.
    pub sink: Option<Arc<AudioSink>>,

    /// Running mixer thread.
    pub mixer: Option<MixerHandle>,
}

impl InitializedResources {
    /// Create empty resources.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Acquires session resources phase by phase and releases them in reverse.
pub struct ResourceManager {
    backend: Arc<dyn AudioBackend>,
    resources: Mutex<InitializedResources>,
    current_phase: Mutex<Option<StartupPhase>>,
    join_timeout: Mutex<Duration>,
}

impl ResourceManager {
    /// Create a resource manager over `backend`.
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            resources: Mutex::new(InitializedResources::new()),
            current_phase: Mutex::new(None),
            join_timeout: Mutex::new(Duration::from_millis(500)),
        }
    }

    /// Run every startup phase in order, reporting each one to `on_phase`.
    ///
    /// On error the phases already entered stay recorded; the caller is
    /// expected to [`rollback`](Self::rollback).
    #[instrument(name = "init_resources", skip(self, plan, on_phase))]
    pub fn initialize(
        &self,
        plan: &SessionPlan,
        mut on_phase: impl FnMut(StartupPhase),
    ) -> SessionResult<()> {
        *self.join_timeout.lock() = plan.join_timeout();
        let mut phase = StartupPhase::FIRST;

        loop {
            *self.current_phase.lock() = Some(phase);
            on_phase(phase);
            self.init_phase(plan, phase)?;

            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        Ok(())
    }

    /// Initialize a single phase.
    fn init_phase(&self, plan: &SessionPlan, phase: StartupPhase) -> SessionResult<()> {
        info!("Initializing phase: {}", phase.name());

        match phase {
            StartupPhase::OpenSystemCapture => self.open_system_capture(plan),
            StartupPhase::OpenMicCapture => self.open_mic_capture(plan),
            StartupPhase::OpenSink => self.open_sink(plan),
            StartupPhase::StartEngine => self.start_engine(plan),
        }
    }

    fn open_system_capture(&self, plan: &SessionPlan) -> SessionResult<()> {
        let Some(authorization) = plan.authorization.as_ref() else {
            debug!("No capture authorization, running microphone-only");
            return Ok(());
        };

        let kind = SourceKind::SystemCapture;
        match AudioSource::open(self.backend.as_ref(), kind, plan.spec(kind), Some(authorization)) {
            Ok(source) => {
                self.resources.lock().system_capture = Some(Arc::new(Mutex::new(source)));
                debug!("System capture initialized");
                Ok(())
            }
            Err(error) if plan.config.require_system_audio => {
                Err(SessionError::OpenSource { kind, error })
            }
            Err(error) => {
                warn!(%error, "System capture unavailable, continuing microphone-only");
                Ok(())
            }
        }
    }

    fn open_mic_capture(&self, plan: &SessionPlan) -> SessionResult<()> {
        let kind = SourceKind::MicCapture;
        let source = AudioSource::open(self.backend.as_ref(), kind, plan.spec(kind), None)
            .map_err(|error| SessionError::OpenSource { kind, error })?;

        self.resources.lock().mic_capture = Some(Arc::new(Mutex::new(source)));
        debug!("Microphone initialized");
        Ok(())
    }

    fn open_sink(&self, plan: &SessionPlan) -> SessionResult<()> {
        let spec = AudioStreamSpec::playback().with_sample_rate(plan.config.sample_rate);
        let sink = AudioSink::open(self.backend.as_ref(), spec).map_err(SessionError::OpenSink)?;

        self.resources.lock().sink = Some(Arc::new(sink));
        debug!("Output sink initialized");
        Ok(())
    }

    fn start_engine(&self, plan: &SessionPlan) -> SessionResult<()> {
        let mut resources = self.resources.lock();

        if let Some(system) = resources.system_capture.clone() {
            let started = system.lock().start();
            if let Err(error) = started {
                if plan.config.require_system_audio {
                    return Err(SessionError::StartSource {
                        kind: SourceKind::SystemCapture,
                        error,
                    });
                }
                warn!(%error, "System capture failed to start, continuing microphone-only");
                system.lock().stop_and_release();
                resources.system_capture = None;
            }
        }

        if let Some(mic) = resources.mic_capture.as_ref() {
            mic.lock().start().map_err(|error| SessionError::StartSource {
                kind: SourceKind::MicCapture,
                error,
            })?;
        }

        let sink = resources
            .sink
            .clone()
            .ok_or_else(|| SessionError::SpawnMixer("output sink missing".to_string()))?;
        sink.start_playing();

        let mixer = MixingEngine::new(
            resources.system_capture.clone(),
            resources.mic_capture.clone(),
            sink,
            Arc::clone(&plan.controls),
            Arc::clone(&plan.focus),
        )
        .with_stats(Arc::clone(&plan.stats))
        .with_events(plan.events.clone())
        .with_config(MixerConfig {
            idle_backoff: Duration::from_millis(plan.config.idle_backoff_ms),
            ..MixerConfig::default()
        })
        .start()
        .map_err(|e| SessionError::SpawnMixer(e.to_string()))?;

        resources.mixer = Some(mixer);
        debug!("Mixer started");
        Ok(())
    }

    /// Rollback resources from the current phase backwards.
    #[instrument(name = "rollback_resources", skip(self))]
    pub fn rollback(&self) {
        let current = *self.current_phase.lock();

        if let Some(mut phase) = current {
            loop {
                info!("Rolling back phase: {:?}", phase);
                self.rollback_phase(phase);

                match phase.previous() {
                    Some(prev) => phase = prev,
                    None => break,
                }
            }
        }

        *self.current_phase.lock() = None;
    }

    fn rollback_phase(&self, phase: StartupPhase) {
        let join_timeout = *self.join_timeout.lock();
        let mut resources = self.resources.lock();

        match phase {
            StartupPhase::StartEngine => {
                if let Some(mut mixer) = resources.mixer.take() {
                    if !mixer.stop(join_timeout) {
                        warn!("Mixer did not exit in time, releasing devices anyway");
                    }
                }
            }
            StartupPhase::OpenSink => {
                if let Some(sink) = resources.sink.take() {
                    if !sink.flush_stop_and_release_within(join_timeout) {
                        warn!("Output sink still in use, leaving release to its last owner");
                    }
                }
            }
            StartupPhase::OpenMicCapture => {
                if let Some(source) = resources.mic_capture.take() {
                    release_source(&source, join_timeout);
                }
            }
            StartupPhase::OpenSystemCapture => {
                if let Some(source) = resources.system_capture.take() {
                    release_source(&source, join_timeout);
                }
            }
        }
    }

    /// Shutdown all resources cleanly.
    #[instrument(name = "shutdown_resources", skip(self))]
    pub fn shutdown(&self) {
        info!("Shutting down all resources");
        self.rollback();
    }

    /// Whether system capture was acquired for the current session.
    pub fn has_system_capture(&self) -> bool {
        self.resources.lock().system_capture.is_some()
    }

    /// Whether `kind` is still feeding the running mixer.
    pub fn is_contributing(&self, kind: SourceKind) -> bool {
        self.resources
            .lock()
            .mixer
            .as_ref()
            .is_some_and(|mixer| mixer.is_live(kind))
    }

    /// Notification of the mixer ending on its own.
    pub fn mixer_exit(&self) -> Option<Receiver<MixerExit>> {
        self.resources
            .lock()
            .mixer
            .as_ref()
            .map(MixerHandle::exit_receiver)
    }
}

/// Release a source the mixer may still hold after a join timeout.
fn release_source(source: &SharedSource, timeout: Duration) {
    match source.try_lock_for(timeout) {
        Some(mut guard) => guard.stop_and_release(),
        None => warn!("Capture source still in use, leaving release to its last owner"),
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
