//! `audioloop` command-line front end.
//!
//! Runs one session controller, prints its events and reads control
//! commands from stdin.

mod console;
mod tone;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use audioloop_audio::backend::MemoryBackend;
use audioloop_audio::AudioBackend;
use audioloop_engine::{spawn_controller, SessionRegistry, TokenAuthorizationProvider};
use audioloop_ipc::{AuthorizationToken, ControlCommand, SessionConfig, SessionEvent};

use crate::tone::ToneFeeder;

/// audioloop command line arguments
#[derive(Parser, Debug)]
#[command(name = "audioloop")]
#[command(version, about = "Mix system audio and microphone into the output device", long_about = None)]
struct CliArgs {
    /// JSON session configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sample rate for every endpoint (overrides config)
    #[arg(long, value_name = "HZ")]
    sample_rate: Option<u32>,

    /// Mixer sleep when no source has data, in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    idle_backoff_ms: Option<u64>,

    /// Bound on waiting for the mixer at stop, in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    join_timeout_ms: Option<u64>,

    /// Statistics event period in milliseconds, 0 disables (overrides config)
    #[arg(long, value_name = "MS")]
    stats_interval_ms: Option<u64>,

    /// Refuse to start without system audio
    #[arg(long)]
    require_system_audio: bool,

    /// Use the in-memory backend fed with test tones
    #[arg(long)]
    dry_run: bool,

    /// Start a session right away
    #[arg(long)]
    start: bool,

    /// Authorization token for the initial session
    #[arg(long, value_name = "TOKEN", requires = "start")]
    token: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "audioloop=debug,audioloop_engine=debug,audioloop_audio=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &CliArgs) -> anyhow::Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => SessionConfig::default(),
    };

    if let Some(rate) = args.sample_rate {
        config.sample_rate = rate;
    }
    if let Some(ms) = args.idle_backoff_ms {
        config.idle_backoff_ms = ms;
    }
    if let Some(ms) = args.join_timeout_ms {
        config.join_timeout_ms = ms;
    }
    if let Some(ms) = args.stats_interval_ms {
        config.stats_interval_ms = ms;
    }
    if args.require_system_audio {
        config.require_system_audio = true;
    }
    anyhow::ensure!(config.sample_rate > 0, "sample rate must be positive");
    Ok(config)
}

fn build_backend(
    args: &CliArgs,
    config: &SessionConfig,
) -> anyhow::Result<(Arc<dyn AudioBackend>, Option<ToneFeeder>)> {
    #[cfg(feature = "cpal")]
    if !args.dry_run {
        info!("Using cpal audio backend");
        return Ok((Arc::new(audioloop_audio::backend::CpalBackend::new()), None));
    }
    #[cfg(not(feature = "cpal"))]
    if !args.dry_run {
        warn!("Built without the cpal feature; falling back to test tones");
    }

    let backend = MemoryBackend::new();
    backend.set_paced(true);
    backend.set_keep_written(false);
    let feeder =
        ToneFeeder::spawn(&backend, config.sample_rate).context("failed to start tone feeder")?;
    info!("Using in-memory backend with test tones");
    Ok((Arc::new(backend), Some(feeder)))
}

fn print_events(events: Receiver<SessionEvent>, json: bool) {
    for event in events {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => error!("Failed to encode event: {}", e),
            }
            continue;
        }

        match &event {
            SessionEvent::StateChanged { previous, current } => {
                println!("state: {} -> {}", previous.name(), current.name());
            }
            SessionEvent::SessionStopped { reason } => println!("stopped: {}", reason.message()),
            SessionEvent::Error {
                recoverable,
                message,
            } => println!("error (recoverable: {recoverable}): {message}"),
            other => println!("{other:?}"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging();

    info!("Starting audioloop v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let (backend, feeder) = build_backend(&args, &config)?;

    let provider = TokenAuthorizationProvider::new();
    let (handle, events) = spawn_controller(backend, Box::new(provider.clone()), config)
        .context("failed to spawn session controller")?;

    let registry = SessionRegistry::global();
    registry
        .install(handle)
        .context("failed to install session controller")?;

    let json = args.json;
    let printer = thread::Builder::new()
        .name("audioloop-events".to_string())
        .spawn(move || print_events(events, json))
        .context("failed to spawn event printer")?;

    if args.start {
        registry.send(ControlCommand::StartSession {
            authorization: args.token.map(AuthorizationToken::new),
        })?;
    }

    let result = console::run(io::stdin().lock(), registry, &provider);

    if let Err(e) = registry.shutdown() {
        warn!("Controller shutdown: {}", e);
    }
    if printer.join().is_err() {
        error!("Event printer panicked");
    }
    drop(feeder);

    info!("audioloop stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = CliArgs::parse_from([
            "audioloop",
            "--sample-rate",
            "48000",
            "--stats-interval-ms",
            "0",
            "--require-system-audio",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.stats_interval_ms, 0);
        assert!(config.require_system_audio);
        assert_eq!(config.join_timeout_ms, SessionConfig::default().join_timeout_ms);
    }

    #[test]
    fn test_token_requires_start() {
        assert!(CliArgs::try_parse_from(["audioloop", "--token", "abc"]).is_err());
        let args = CliArgs::try_parse_from(["audioloop", "--start", "--token", "abc"]).unwrap();
        assert_eq!(args.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_zero_sample_rate_is_rejected() {
        let args = CliArgs::parse_from(["audioloop", "--sample-rate", "0"]);
        let err = load_config(&args).unwrap_err();
        assert!(err.to_string().contains("sample rate"));
    }
}
