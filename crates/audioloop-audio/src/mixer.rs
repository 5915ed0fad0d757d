//! Real-time mixing of system and microphone capture into the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use audioloop_ipc::{FocusEvent, SessionEvent, SourceKind};

use crate::capture::AudioSource;
use crate::control::{ControlSnapshot, ControlState};
use crate::error::{ReadError, WriteError};
use crate::focus::FocusArbiter;
use crate::sink::AudioSink;
use crate::stats::MixerStats;
use crate::{FrameCount, BYTES_PER_SAMPLE};

/// A capture source shared between the controller and the mixer thread.
pub type SharedSource = Arc<Mutex<AudioSource>>;

/// Interval between checks while waiting for the mixer thread to exit.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Mixer thread lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Running,
    /// Every source failed; the loop is finishing its last iteration.
    Draining,
    Stopped,
}

/// Why the mixer thread ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerExit {
    /// No capture source is live any more.
    SourcesLost,
}

/// Mixer tuning.
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Sleep when no source produced frames.
    pub idle_backoff: Duration,

    /// Period of the stats summary log line.
    pub summary_interval: Duration,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_millis(10),
            summary_interval: Duration::from_secs(5),
        }
    }
}

/// Gain factor for a 0 - 100 percentage control: `1 + pct / 100`.
pub fn gain_factor(pct: i32) -> f32 {
    1.0 + pct as f32 / 100.0
}

/// Per-iteration multipliers derived from a control snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MixGains {
    app: f32,
    mic: f32,
}

impl MixGains {
    fn from_snapshot(controls: &ControlSnapshot) -> Self {
        Self {
            app: gain_factor(controls.app_gain_pct),
            mic: if controls.mic_muted {
                0.0
            } else {
                gain_factor(controls.mic_gain_pct)
            },
        }
    }
}

fn clamp_sample(value: f32) -> i16 {
    value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Mix one output frame.
///
/// `app` is a native stereo pair, `mic` a mono sample duplicated to both
/// channels. Each contribution is scaled by its gain, summed per channel and
/// clamped to the 16-bit range. Nothing is divided by the source count.
pub fn mix_frame(
    app: Option<(i16, i16)>,
    mic: Option<i16>,
    controls: &ControlSnapshot,
) -> (i16, i16) {
    mix_with_gains(app, mic, MixGains::from_snapshot(controls))
}

fn mix_with_gains(app: Option<(i16, i16)>, mic: Option<i16>, gains: MixGains) -> (i16, i16) {
    let mic = mic.map_or(0.0, |m| f32::from(m) * gains.mic);
    let (left, right) = app.map_or((0.0, 0.0), |(l, r)| {
        (f32::from(l) * gains.app, f32::from(r) * gains.app)
    });
    (clamp_sample(left + mic), clamp_sample(right + mic))
}

fn sample_at(pcm: &[u8], index: usize) -> i16 {
    let offset = index * BYTES_PER_SAMPLE;
    i16::from_le_bytes([pcm[offset], pcm[offset + 1]])
}

/// Mix up to `frames` frames of stereo app PCM and mono mic PCM into `out`
/// as interleaved stereo PCM16. Returns the number of frames produced.
///
/// A missing source contributes silence. `frames` is capped by the data
/// each present source actually holds.
pub fn mix_into(
    app_pcm: Option<&[u8]>,
    mic_pcm: Option<&[u8]>,
    frames: FrameCount,
    controls: &ControlSnapshot,
    out: &mut Vec<u8>,
) -> FrameCount {
    let gains = MixGains::from_snapshot(controls);
    let frames = frames
        .min(app_pcm.map_or(usize::MAX, |pcm| pcm.len() / (2 * BYTES_PER_SAMPLE)))
        .min(mic_pcm.map_or(usize::MAX, |pcm| pcm.len() / BYTES_PER_SAMPLE));

    out.clear();
    out.reserve(frames * 2 * BYTES_PER_SAMPLE);
    for i in 0..frames {
        let app = app_pcm.map(|pcm| (sample_at(pcm, i * 2), sample_at(pcm, i * 2 + 1)));
        let mic = mic_pcm.map(|pcm| sample_at(pcm, i));
        let (left, right) = mix_with_gains(app, mic, gains);
        out.extend_from_slice(&left.to_le_bytes());
        out.extend_from_slice(&right.to_le_bytes());
    }
    frames
}

/// Everything the mixer thread needs for one session.
pub struct MixingEngine {
    system: Option<SharedSource>,
    mic: Option<SharedSource>,
    sink: Arc<AudioSink>,
    controls: Arc<ControlState>,
    focus: Arc<FocusArbiter>,
    stats: Arc<MixerStats>,
    events: Option<Sender<SessionEvent>>,
    config: MixerConfig,
}

impl MixingEngine {
    /// Create an engine over already-started sources and a playing sink.
    pub fn new(
        system: Option<SharedSource>,
        mic: Option<SharedSource>,
        sink: Arc<AudioSink>,
        controls: Arc<ControlState>,
        focus: Arc<FocusArbiter>,
    ) -> Self {
        Self {
            system,
            mic,
            sink,
            controls,
            focus,
            stats: Arc::new(MixerStats::new()),
            events: None,
            config: MixerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MixerConfig) -> Self {
        self.config = config;
        self
    }

    /// Counters to update; lets the owner read them while running.
    pub fn with_stats(mut self, stats: Arc<MixerStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Where to report `SourceFailed` the iteration a source fails.
    pub fn with_events(mut self, events: Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the mixer thread.
    ///
    /// Also registers a focus listener that pauses/resumes the sink from the
    /// arbiter's context. The listener only holds a weak reference.
    #[instrument(name = "mixer_start", skip(self))]
    pub fn start(self) -> std::io::Result<MixerHandle> {
        let keep_running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(RwLock::new(EngineState::NotStarted));
        let live = Arc::new(LiveFlags {
            system: AtomicBool::new(self.system.is_some()),
            mic: AtomicBool::new(self.mic.is_some()),
        });
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);

        let weak_sink: Weak<AudioSink> = Arc::downgrade(&self.sink);
        self.focus.register(move |event| {
            if let Some(sink) = weak_sink.upgrade() {
                match event {
                    FocusEvent::Gained => sink.resume(),
                    FocusEvent::LostPermanently
                    | FocusEvent::LostTransient
                    | FocusEvent::LostTransientDuckable => sink.pause(),
                }
            }
        });

        info!(
            system = self.system.is_some(),
            mic = self.mic.is_some(),
            "Starting mixer"
        );

        let thread = {
            let keep_running = Arc::clone(&keep_running);
            let state = Arc::clone(&state);
            let live = Arc::clone(&live);
            thread::Builder::new()
                .name("audioloop-mixer".to_string())
                .spawn(move || mix_thread(self, keep_running, state, live, exit_tx))?
        };

        Ok(MixerHandle {
            thread: Some(thread),
            keep_running,
            state,
            live,
            exit_rx,
        })
    }
}

struct LiveFlags {
    system: AtomicBool,
    mic: AtomicBool,
}

impl LiveFlags {
    fn flag(&self, kind: SourceKind) -> &AtomicBool {
        match kind {
            SourceKind::SystemCapture => &self.system,
            SourceKind::MicCapture => &self.mic,
        }
    }
}

/// Control side of a running mixer thread.
pub struct MixerHandle {
    thread: Option<JoinHandle<()>>,
    keep_running: Arc<AtomicBool>,
    state: Arc<RwLock<EngineState>>,
    live: Arc<LiveFlags>,
    exit_rx: Receiver<MixerExit>,
}

impl MixerHandle {
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Whether `kind` is still feeding the mixer.
    pub fn is_live(&self, kind: SourceKind) -> bool {
        self.live.flag(kind).load(Ordering::SeqCst)
    }

    /// Receives a message when the thread ends on its own.
    pub fn exit_receiver(&self) -> Receiver<MixerExit> {
        self.exit_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the thread to stop and wait up to `timeout` for it.
    ///
    /// Returns false if the thread did not exit in time; it is then
    /// detached and will exit at its next flag check.
    #[instrument(name = "mixer_stop", skip(self))]
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.keep_running.store(false, Ordering::SeqCst);

        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                warn!(?timeout, "Mixer thread did not stop in time, detaching");
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL.min(deadline - now));
        }

        if thread.join().is_err() {
            error!("Mixer thread panicked");
        }
        debug!("Mixer thread joined");
        true
    }
}

impl Drop for MixerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop(Duration::from_millis(500));
        }
    }
}

/// Read one source; returns frames read this iteration.
fn read_source(
    source: Option<&mut AudioSource>,
    stats: &MixerStats,
    live: &LiveFlags,
    events: Option<&Sender<SessionEvent>>,
) -> FrameCount {
    let Some(source) = source else {
        return 0;
    };
    if !source.is_live() {
        return 0;
    }

    let kind = source.kind();
    match source.read() {
        Ok(frames) => {
            stats.record_read(kind, frames);
            frames
        }
        Err(e) => {
            live.flag(kind).store(false, Ordering::SeqCst);
            match e {
                ReadError::DeviceError(code) => {
                    warn!(source = %kind, code, "Source failed, dropping it from the mix");
                    if let Some(events) = events {
                        if let Err(e) = events.try_send(SessionEvent::SourceFailed(kind)) {
                            warn!("Failed to send event: {}", e);
                        }
                    }
                }
                ReadError::NotRecording(state) => {
                    debug!(source = %kind, ?state, "Source no longer recording");
                }
            }
            0
        }
    }
}

fn mix_thread(
    engine: MixingEngine,
    keep_running: Arc<AtomicBool>,
    state: Arc<RwLock<EngineState>>,
    live: Arc<LiveFlags>,
    exit_tx: Sender<MixerExit>,
) {
    debug!("Mixer thread started");
    *state.write() = EngineState::Running;

    let MixingEngine {
        system,
        mic,
        sink,
        controls,
        focus,
        stats,
        events,
        config,
    } = engine;

    let mut out = Vec::with_capacity(sink.buffer_size());
    let mut applied_volume: Option<f32> = None;
    let mut last_summary = Instant::now();
    let mut write_errors_logged: u64 = 0;

    while keep_running.load(Ordering::SeqCst) {
        stats.record_iteration();

        if last_summary.elapsed() >= config.summary_interval {
            let s = stats.snapshot();
            info!(
                "Mixer stats: mixed={}, written={}, discarded={}, idle={}, write_errors={}",
                s.frames_mixed,
                s.frames_written,
                s.frames_discarded,
                s.idle_iterations,
                s.write_errors
            );
            last_summary = Instant::now();
        }

        // One snapshot per iteration; master volume goes to the sink.
        let snapshot = controls.snapshot();
        if applied_volume != Some(snapshot.master_volume) {
            sink.set_volume(snapshot.master_volume);
            applied_volume = Some(snapshot.master_volume);
        }

        let gate = focus.current_gate();
        if gate {
            sink.resume();
        } else {
            sink.pause();
        }

        let mut system_guard = system.as_ref().map(|s| s.lock());
        let mut mic_guard = mic.as_ref().map(|s| s.lock());

        let app_frames = read_source(
            system_guard.as_deref_mut(),
            &stats,
            &live,
            events.as_ref(),
        );
        let mic_frames = read_source(mic_guard.as_deref_mut(), &stats, &live, events.as_ref());

        let system_live = system_guard.as_ref().is_some_and(|s| s.is_live());
        let mic_live = mic_guard.as_ref().is_some_and(|s| s.is_live());
        if !system_live && !mic_live {
            info!("No live capture source left, draining mixer");
            *state.write() = EngineState::Draining;
            let _ = exit_tx.try_send(MixerExit::SourcesLost);
            break;
        }

        if app_frames == 0 && mic_frames == 0 {
            drop(system_guard);
            drop(mic_guard);
            stats.record_idle();
            thread::sleep(config.idle_backoff);
            continue;
        }

        // Only sources that produced frames this iteration contribute.
        let frames_to_mix = match (app_frames, mic_frames) {
            (0, mic) => mic,
            (app, 0) => app,
            (app, mic) => app.min(mic),
        };
        let app_pcm = system_guard
            .as_ref()
            .filter(|_| app_frames > 0)
            .map(|s| s.pcm());
        let mic_pcm = mic_guard
            .as_ref()
            .filter(|_| mic_frames > 0)
            .map(|s| s.pcm());

        let frames = mix_into(app_pcm, mic_pcm, frames_to_mix, &snapshot, &mut out);
        drop(system_guard);
        drop(mic_guard);
        stats.record_mixed(frames);

        if !gate {
            trace!(frames, "Focus lost, discarding mixed frames");
            stats.record_discarded(frames);
            continue;
        }

        match sink.write(&out, frames) {
            Ok(written) => stats.record_written(written),
            Err(WriteError::NotPlaying(sink_state)) => {
                trace!(?sink_state, "Sink not playing, discarding mixed frames");
                stats.record_discarded(frames);
            }
            Err(WriteError::DeviceError(code)) => {
                stats.record_write_error();
                write_errors_logged += 1;
                if write_errors_logged <= 5 || write_errors_logged % 100 == 0 {
                    warn!(code, count = write_errors_logged, "Sink write error");
                }
            }
        }
    }

    *state.write() = EngineState::Stopped;
    let s = stats.snapshot();
    info!(
        "Mixer stopped: iterations={}, mixed={}, written={}, write_errors={}",
        s.iterations, s.frames_mixed, s.frames_written, s.write_errors
    );
}
