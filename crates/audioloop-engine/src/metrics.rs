//! Statistics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use audioloop_audio::MixerStats;
use audioloop_ipc::{MixerStatistics, WarningType};

/// New write errors between two reports that raise a warning.
const WRITE_ERROR_WARNING_THRESHOLD: u64 = 5;

/// Consecutive idle iterations between two reports that raise a warning.
const STALL_WARNING_ITERATIONS: u64 = 200;

/// Turns mixer counters into periodic reports and warnings.
pub struct MetricsCollector {
    stats: Arc<MixerStats>,
    start_time: RwLock<Option<Instant>>,
    last_report_time: RwLock<Instant>,
    report_interval: Option<Duration>,
    last_write_errors: AtomicU64,
    last_iterations: AtomicU64,
    last_idle_iterations: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector over `stats`; a zero interval disables reports.
    pub fn new(stats: Arc<MixerStats>, report_interval_ms: u64) -> Self {
        Self {
            stats,
            start_time: RwLock::new(None),
            last_report_time: RwLock::new(Instant::now()),
            report_interval: (report_interval_ms > 0)
                .then(|| Duration::from_millis(report_interval_ms)),
            last_write_errors: AtomicU64::new(0),
            last_iterations: AtomicU64::new(0),
            last_idle_iterations: AtomicU64::new(0),
        }
    }

    /// Start metrics collection.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn stats(&self) -> &Arc<MixerStats> {
        &self.stats
    }

    /// Seconds since `start`, or 0 when stopped.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time
            .read()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Get current statistics snapshot.
    pub fn snapshot(&self) -> MixerStatistics {
        self.stats.snapshot()
    }

    /// Whether a periodic report is due.
    pub fn report_due(&self) -> bool {
        match self.report_interval {
            Some(interval) => {
                self.start_time.read().is_some()
                    && self.last_report_time.read().elapsed() >= interval
            }
            None => false,
        }
    }

    /// Check for warnings since the last report.
    pub fn check_warnings(&self, current: &MixerStatistics) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let new_errors = current
            .write_errors
            .saturating_sub(self.last_write_errors.load(Ordering::Relaxed));
        if new_errors >= WRITE_ERROR_WARNING_THRESHOLD {
            warnings.push(WarningType::SinkWriteErrors {
                count: current.write_errors,
            });
        }

        let iterations = current
            .iterations
            .saturating_sub(self.last_iterations.load(Ordering::Relaxed));
        let idle = current
            .idle_iterations
            .saturating_sub(self.last_idle_iterations.load(Ordering::Relaxed));
        if iterations >= STALL_WARNING_ITERATIONS && idle == iterations {
            warnings.push(WarningType::SourcesStalled {
                idle_iterations: idle,
            });
        }

        if !warnings.is_empty() {
            debug!(?warnings, "Mixer warnings");
        }
        warnings
    }

    /// Record `reported` as the baseline for the next report.
    pub fn mark_reported(&self, reported: &MixerStatistics) {
        *self.last_report_time.write() = Instant::now();
        self.last_write_errors
            .store(reported.write_errors, Ordering::Relaxed);
        self.last_iterations
            .store(reported.iterations, Ordering::Relaxed);
        self.last_idle_iterations
            .store(reported.idle_iterations, Ordering::Relaxed);
    }
}
