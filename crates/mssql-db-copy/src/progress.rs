//! Periodic progress reporting for worker pool passes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback receiving progress snapshots.
pub type ProgressHook = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Shared counters of the running pass.
///
/// Written by the work queue, read by the reporter; values are informational.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    total: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    in_flight: AtomicUsize,
}

impl ProgressCounters {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicUsize::new(total),
            ..Self::default()
        }
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        self.in_flight.store(in_flight, Ordering::Relaxed);
    }

    pub fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the counters.
    pub fn snapshot(&self, pass: &str, started: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            pass: pass.to_string(),
            completed: self.completed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Point-in-time progress of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Pass name (`validate`, `drop_relationships`, `process_items`, ...).
    pub pass: String,
    pub completed: usize,
    pub total: usize,
    pub errors: usize,
    pub in_flight: usize,
    pub elapsed_ms: u64,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed_ms / 1000;
        write!(
            f,
            "{} of {} items are processed. Errors: {}. Elapsed: {:02}:{:02}:{:02}",
            self.completed,
            self.total,
            self.errors,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        )
    }
}

/// Ticker task emitting snapshots until the pass finishes.
pub struct ProgressReporter {
    pass: String,
    counters: Arc<ProgressCounters>,
    hook: Option<ProgressHook>,
    started: Instant,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start ticking every `interval`. The first tick fires one interval after start.
    pub fn start(
        pass: &str,
        counters: Arc<ProgressCounters>,
        interval: Duration,
        hook: Option<ProgressHook>,
    ) -> Self {
        let started = Instant::now();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_pass = pass.to_string();
        let task_counters = counters.clone();
        let task_hook = hook.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = task_counters.snapshot(&task_pass, started);
                        emit(task_hook.as_ref(), &snapshot);
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            pass: pass.to_string(),
            counters,
            hook,
            started,
            stop_tx,
            handle,
        }
    }

    /// Stop the ticker and emit the final snapshot.
    pub async fn finish(self) -> ProgressSnapshot {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            debug!("Progress ticker for {} ended abnormally: {}", self.pass, e);
        }

        let snapshot = self.counters.snapshot(&self.pass, self.started);
        emit(self.hook.as_ref(), &snapshot);
        snapshot
    }
}

fn emit(hook: Option<&ProgressHook>, snapshot: &ProgressSnapshot) {
    match hook {
        Some(hook) => hook(snapshot),
        None => debug!("[{}] {}", snapshot.pass, snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_snapshot_display() {
        let snapshot = ProgressSnapshot {
            pass: "process_items".into(),
            completed: 3,
            total: 10,
            errors: 1,
            in_flight: 2,
            elapsed_ms: 3_725_000,
        };
        assert_eq!(
            snapshot.to_string(),
            "3 of 10 items are processed. Errors: 1. Elapsed: 01:02:05"
        );
    }

    #[tokio::test]
    async fn test_reporter_emits_final_snapshot() {
        let seen: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: ProgressHook = Arc::new(move |s: &ProgressSnapshot| {
            sink.lock().unwrap().push(s.clone());
        });

        let counters = Arc::new(ProgressCounters::new(4));
        // Long interval so only the final snapshot is emitted.
        let reporter =
            ProgressReporter::start("test", counters.clone(), Duration::from_secs(3600), Some(hook));
        counters.add_completed();
        counters.add_completed();
        counters.add_error();

        let last = reporter.finish().await;
        assert_eq!(last.completed, 2);
        assert_eq!(last.errors, 1);
        assert_eq!(last.total, 4);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], last);
    }

    #[tokio::test]
    async fn test_reporter_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let sink = ticks.clone();
        let hook: ProgressHook = Arc::new(move |_: &ProgressSnapshot| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let reporter = ProgressReporter::start(
            "test",
            Arc::new(ProgressCounters::new(1)),
            Duration::from_millis(10),
            Some(hook),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        reporter.finish().await;

        // periodic ticks plus the final one
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
