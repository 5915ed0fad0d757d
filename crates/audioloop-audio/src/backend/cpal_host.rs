//! Host audio through cpal.
//!
//! cpal streams are not `Send`, so each one lives on its own holder thread
//! and is driven through a small command channel. PCM crosses between the
//! realtime callbacks and the session through sample queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use audioloop_ipc::SourceKind;

use crate::authorization::CaptureAuthorization;
use crate::device::{AudioBackend, CaptureDevice, PlaybackDevice};
use crate::format::AudioStreamSpec;

/// Platform status reported when a stream callback signalled an error.
const STREAM_FAILED: i32 = -1;

/// Queue bound, in milliseconds of audio.
const QUEUE_MS: usize = 500;

/// Status reported when a playback write found no room before its deadline.
const STREAM_STALLED: i32 = -2;

/// Longest a playback write waits for room before re-checking the stream.
const WRITE_WAIT: Duration = Duration::from_millis(100);

/// Longest a single playback write may block in total.
const WRITE_DEADLINE: Duration = Duration::from_secs(1);

enum StreamCommand {
    Play,
    Pause,
    Close,
}

/// Owns the thread that owns a cpal stream.
struct StreamHolder {
    commands: Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHolder {
    /// Build a stream on a dedicated thread and wait for the outcome.
    fn spawn<F>(name: &str, build: F) -> Result<Self, String>
    where
        F: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (commands, command_rx) = crossbeam_channel::unbounded();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for command in command_rx.iter() {
                    let result = match command {
                        StreamCommand::Play => stream.play().map_err(|e| e.to_string()),
                        StreamCommand::Pause => stream.pause().map_err(|e| e.to_string()),
                        StreamCommand::Close => break,
                    };
                    if let Err(e) = result {
                        warn!("Stream command failed: {}", e);
                    }
                }
                debug!("Stream holder exiting");
            })
            .map_err(|e| format!("failed to spawn stream thread: {e}"))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err("stream thread exited before reporting".to_string()),
        }
    }

    fn send(&self, command: StreamCommand) {
        let _ = self.commands.send(command);
    }

    fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.send(StreamCommand::Close);
            if thread.join().is_err() {
                error!("Stream holder thread panicked");
            }
        }
    }
}

impl Drop for StreamHolder {
    fn drop(&mut self) {
        self.close();
    }
}

fn stream_config(spec: &AudioStreamSpec) -> StreamConfig {
    StreamConfig {
        channels: spec.channel_count() as u16,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn queue_capacity(spec: &AudioStreamSpec) -> usize {
    spec.sample_rate as usize * spec.channel_count() * QUEUE_MS / 1000
}

/// Backend for the default cpal host.
///
/// System capture opens a loopback stream on the default output device,
/// which hosts such as WASAPI support.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn min_buffer(spec: &AudioStreamSpec) -> i32 {
        // 20 ms period.
        spec.bytes_for(spec.sample_rate as usize / 50) as i32
    }
}

impl AudioBackend for CpalBackend {
    fn min_capture_buffer_size(&self, _kind: SourceKind, spec: &AudioStreamSpec) -> i32 {
        Self::min_buffer(spec)
    }

    fn min_playback_buffer_size(&self, spec: &AudioStreamSpec) -> i32 {
        Self::min_buffer(spec)
    }

    fn open_capture(
        &self,
        kind: SourceKind,
        spec: &AudioStreamSpec,
        authorization: Option<&CaptureAuthorization>,
    ) -> Result<Box<dyn CaptureDevice>, String> {
        if kind == SourceKind::SystemCapture && !authorization.is_some_and(|a| a.is_valid()) {
            return Err("system capture requires a valid authorization".to_string());
        }

        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let failed = Arc::new(AtomicBool::new(false));
        let capacity = queue_capacity(spec);
        let config = stream_config(spec);

        let holder = {
            let queue = Arc::clone(&queue);
            let failed = Arc::clone(&failed);
            StreamHolder::spawn(&format!("audioloop-capture-{}", kind.name()), move || {
                let host = cpal::default_host();
                let device = match kind {
                    SourceKind::SystemCapture => host.default_output_device(),
                    SourceKind::MicCapture => host.default_input_device(),
                }
                .ok_or_else(|| format!("no default device for {kind} capture"))?;
                let format = match kind {
                    SourceKind::SystemCapture => device.default_output_config(),
                    SourceKind::MicCapture => device.default_input_config(),
                }
                .map_err(|e| e.to_string())?
                .sample_format();

                info!(
                    source = %kind,
                    device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                    ?format,
                    "Opening capture stream"
                );
                match format {
                    SampleFormat::F32 => {
                        build_capture::<f32>(&device, &config, queue, capacity, failed)
                    }
                    SampleFormat::I16 => {
                        build_capture::<i16>(&device, &config, queue, capacity, failed)
                    }
                    SampleFormat::U16 => {
                        build_capture::<u16>(&device, &config, queue, capacity, failed)
                    }
                    other => Err(format!("unsupported sample format {other:?}")),
                }
            })?
        };

        Ok(Box::new(CpalCapture {
            holder,
            queue,
            failed,
        }))
    }

    fn open_playback(&self, spec: &AudioStreamSpec) -> Result<Box<dyn PlaybackDevice>, String> {
        let shared = Arc::new(PlaybackShared {
            queue: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            volume: AtomicU32::new(1.0f32.to_bits()),
            failed: AtomicBool::new(false),
        });
        let config = stream_config(spec);

        let holder = {
            let shared = Arc::clone(&shared);
            StreamHolder::spawn("audioloop-playback", move || {
                let host = cpal::default_host();
                let device = host
                    .default_output_device()
                    .ok_or_else(|| "no default output device".to_string())?;
                let format = device
                    .default_output_config()
                    .map_err(|e| e.to_string())?
                    .sample_format();

                info!(
                    device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                    ?format,
                    "Opening playback stream"
                );
                match format {
                    SampleFormat::F32 => build_playback::<f32>(&device, &config, shared),
                    SampleFormat::I16 => build_playback::<i16>(&device, &config, shared),
                    SampleFormat::U16 => build_playback::<u16>(&device, &config, shared),
                    other => Err(format!("unsupported sample format {other:?}")),
                }
            })?
        };

        Ok(Box::new(CpalPlayback {
            holder,
            shared,
            capacity: queue_capacity(spec),
        }))
    }
}

fn build_capture<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: Arc<Mutex<VecDeque<i16>>>,
    capacity: usize,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, String>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let on_data = move |data: &[T], _: &cpal::InputCallbackInfo| {
        let mut queue = queue.lock();
        queue.extend(data.iter().map(|&s| i16::from_sample_(s)));
        // Keep the newest audio if the reader falls behind.
        let excess = queue.len().saturating_sub(capacity);
        queue.drain(..excess);
    };
    let on_error = move |err| {
        error!("Capture stream error: {}", err);
        failed.store(true, Ordering::SeqCst);
    };

    device
        .build_input_stream(config, on_data, on_error, None)
        .map_err(|e| e.to_string())
}

fn build_playback<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<PlaybackShared>,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32>,
{
    let on_data = {
        let shared = Arc::clone(&shared);
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
            let mut queue = shared.queue.lock();
            for out in data.iter_mut() {
                let sample = queue.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                *out = T::from_sample_(sample * volume);
            }
            drop(queue);
            shared.space.notify_all();
        }
    };
    let on_error = move |err| {
        error!("Playback stream error: {}", err);
        shared.failed.store(true, Ordering::SeqCst);
        shared.space.notify_all();
    };

    device
        .build_output_stream(config, on_data, on_error, None)
        .map_err(|e| e.to_string())
}

struct CpalCapture {
    holder: StreamHolder,
    queue: Arc<Mutex<VecDeque<i16>>>,
    failed: Arc<AtomicBool>,
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<(), String> {
        self.holder.send(StreamCommand::Play);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, i32> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(STREAM_FAILED);
        }
        let mut queue = self.queue.lock();
        let samples = queue.len().min(buf.len() / 2);
        for (chunk, sample) in buf.chunks_exact_mut(2).zip(queue.drain(..samples)) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(samples * 2)
    }

    fn stop(&mut self) {
        self.holder.send(StreamCommand::Pause);
    }

    fn release(&mut self) {
        self.holder.close();
        self.queue.lock().clear();
    }
}

struct PlaybackShared {
    queue: Mutex<VecDeque<i16>>,
    space: Condvar,
    volume: AtomicU32,
    failed: AtomicBool,
}

struct CpalPlayback {
    holder: StreamHolder,
    shared: Arc<PlaybackShared>,
    capacity: usize,
}

impl PlaybackDevice for CpalPlayback {
    fn play(&mut self) {
        self.holder.send(StreamCommand::Play);
    }

    fn pause(&mut self) {
        self.holder.send(StreamCommand::Pause);
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, i32> {
        let mut samples = buf
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .peekable();

        let deadline = Instant::now() + WRITE_DEADLINE;
        let mut queued = 0;
        let mut queue = self.shared.queue.lock();
        while samples.peek().is_some() {
            if self.shared.failed.load(Ordering::SeqCst) {
                return Err(STREAM_FAILED);
            }
            let room = self.capacity.saturating_sub(queue.len());
            if room == 0 {
                let now = Instant::now();
                if now >= deadline {
                    warn!(queued, "Playback stream stalled, returning short write");
                    return if queued == 0 {
                        Err(STREAM_STALLED)
                    } else {
                        Ok(queued * 2)
                    };
                }
                self.shared
                    .space
                    .wait_for(&mut queue, WRITE_WAIT.min(deadline - now));
                continue;
            }
            let before = queue.len();
            queue.extend(samples.by_ref().take(room));
            queued += queue.len() - before;
        }
        Ok(queued * 2)
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn flush(&mut self) {
        self.shared.queue.lock().clear();
    }

    fn stop(&mut self) {
        self.holder.send(StreamCommand::Pause);
    }

    fn release(&mut self) {
        self.holder.close();
        self.shared.space.notify_all();
    }
}
