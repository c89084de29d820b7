use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Initialize tracing for a process: JSON file layer plus plain stderr,
/// filtered by `SHOWRUNNER_LOG` (default `info`). Returns the appender
/// guard; dropping it flushes buffered lines, so callers keep it alive for
/// the process lifetime.
pub fn init_logging(
    process: &str,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(LoggingInitInfo, WorkerGuard)> {
    fs::create_dir_all(logs_dir)?;
    prune_old_logs(logs_dir, process, retention_days);

    let file_appender = tracing_appender::rolling::daily(logs_dir, format!("{process}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_env("SHOWRUNNER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow::anyhow!("tracing init failed: {err}"))?;

    let info = LoggingInitInfo {
        process: process.to_string(),
        logs_dir: logs_dir.display().to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };
    Ok((info, guard))
}

fn prune_old_logs(logs_dir: &Path, process: &str, retention_days: u64) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };
    let horizon = SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(retention_days * 24 * 3600));
    let Some(horizon) = horizon else { return };
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(process) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if let Ok(modified) = meta.modified() {
            if modified < horizon {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Process-local runtime counters. Carries no durable state and is safe to
/// reconstruct after a crash; the numbers describe this process only.
#[derive(Default)]
pub struct MetricsCollector {
    events_handled: AtomicU64,
    handler_failures: AtomicU64,
    handler_retries: AtomicU64,
    fallbacks: AtomicU64,
    escalations: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_timed_out: AtomicU64,
    cost_recorded_microdollars: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_handled: u64,
    pub handler_failures: u64,
    pub handler_retries: u64,
    pub fallbacks: u64,
    pub escalations: u64,
    pub tasks_dispatched: u64,
    pub tasks_timed_out: u64,
    pub cost_recorded: f64,
}

impl MetricsCollector {
    pub fn event_handled(&self) {
        self.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_retry(&self) {
        self.handler_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cost_recorded(&self, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        let micro = (amount * 1_000_000.0) as u64;
        self.cost_recorded_microdollars
            .fetch_add(micro, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_handled: self.events_handled.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_retries: self.handler_retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            cost_recorded: self.cost_recorded_microdollars.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
        }
    }
}

static METRICS: OnceLock<MetricsCollector> = OnceLock::new();
static LOG_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

/// The process-wide collector.
pub fn metrics() -> &'static MetricsCollector {
    METRICS.get_or_init(MetricsCollector::default)
}

/// Park the appender guard for processes that never drop it explicitly.
pub fn hold_log_guard(guard: WorkerGuard) {
    let slot = LOG_GUARD.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = slot.lock() {
        *slot = Some(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let collector = MetricsCollector::default();
        collector.event_handled();
        collector.event_handled();
        collector.handler_retry();
        collector.cost_recorded(12.5);
        collector.cost_recorded(-3.0);

        let snap = collector.snapshot();
        assert_eq!(snap.events_handled, 2);
        assert_eq!(snap.handler_retries, 1);
        assert!((snap.cost_recorded - 12.5).abs() < 1e-6);
    }
}
