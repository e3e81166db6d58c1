//! Fixed-size worker pool draining a [`WorkQueue`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::graph::DependencyGraph;
use super::item::MigrationItem;
use super::queue::WorkQueue;
use crate::error::{CopyError, Result};
use crate::progress::{ProgressCounters, ProgressHook, ProgressReporter};
use crate::runlog::{ItemLog, RunLog};

/// Failure recorded on items whose parents never completed.
pub const BLOCKED_MESSAGE: &str = "blocked by unsatisfied dependencies";

/// Failure recorded on items left queued when the error budget ran out.
pub const BUDGET_MESSAGE: &str = "not processed: error budget exhausted";

/// Work performed on one item by a pool pass.
///
/// Implementations resume from `item.status` so a retried item never
/// repeats a finished phase.
#[async_trait]
pub trait ItemAction: Send + Sync {
    async fn execute(&self, item: &mut MigrationItem, ctx: &mut ItemContext<'_>) -> Result<()>;
}

/// Per-attempt handle given to an [`ItemAction`].
pub struct ItemContext<'a> {
    queue: Option<&'a WorkQueue>,
    log: ItemLog,
}

impl<'a> ItemContext<'a> {
    fn new(queue: &'a WorkQueue, log: ItemLog) -> Self {
        Self {
            queue: Some(queue),
            log,
        }
    }

    /// Context not attached to a queue, for running an action directly.
    pub fn detached(log: ItemLog) -> Self {
        Self { queue: None, log }
    }

    /// Release the item's dependents now, before the action returns.
    ///
    /// Used once the item reached the phase other objects need. The pool
    /// still marks the item done on success; repeated releases are no-ops.
    pub fn release_dependents(&self, item: &MigrationItem) -> usize {
        self.queue
            .map_or(0, |queue| queue.release_dependents(item.id()))
    }

    /// Run log buffer of this attempt.
    pub fn log(&mut self) -> &mut ItemLog {
        &mut self.log
    }

    pub fn into_log(self) -> ItemLog {
        self.log
    }
}

/// Settings of one pool pass.
#[derive(Clone)]
pub struct PoolOptions {
    /// Number of concurrent workers (at least 1).
    pub workers: usize,

    /// Attempts per item, counting the first.
    pub max_attempts: u32,

    /// Failures after which no further items are dequeued.
    pub max_errors: usize,

    /// Requeue failed items until `max_attempts` is reached.
    pub retry_on_failure: bool,

    /// Progress tick interval.
    pub progress_interval: Duration,

    /// Receives progress snapshots; `None` logs them at debug level.
    pub progress_hook: Option<ProgressHook>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            max_errors: 100,
            retry_on_failure: true,
            progress_interval: Duration::from_secs(1),
            progress_hook: None,
        }
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("workers", &self.workers)
            .field("max_attempts", &self.max_attempts)
            .field("max_errors", &self.max_errors)
            .field("retry_on_failure", &self.retry_on_failure)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}

/// Outcome of one pool pass.
#[derive(Debug)]
pub struct PassReport {
    pub pass: String,

    /// Every item of the pass, whatever its outcome, ordered by object id.
    pub items: Vec<MigrationItem>,

    /// Successful attempts.
    pub completed: usize,

    /// Failed attempts, retries included.
    pub errors: usize,

    /// Items taken off the queue, retries included.
    pub dequeued: usize,

    /// Items failed because a parent never completed.
    pub blocked: usize,

    /// The error budget stopped the pass early.
    pub budget_exhausted: bool,

    pub elapsed: Duration,
}

impl PassReport {
    /// Items whose last attempt did not succeed.
    pub fn failed(&self) -> impl Iterator<Item = &MigrationItem> {
        self.items.iter().filter(|i| i.succeeded != Some(true))
    }
}

/// Runs an [`ItemAction`] over a dependency graph with W workers.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    options: PoolOptions,
}

impl WorkerPool {
    pub fn new(options: PoolOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Process every item of `graph` and wait for all workers to exit.
    pub async fn run<A>(
        &self,
        pass: &str,
        graph: DependencyGraph,
        action: Arc<A>,
        run_log: Arc<RunLog>,
    ) -> PassReport
    where
        A: ItemAction + ?Sized + 'static,
    {
        let started = Instant::now();
        let total = graph.len();
        let workers = self.options.workers.max(1);

        info!("Pass {}: {} items, {} workers", pass, total, workers);
        run_log.line(&format!("Pass {} started: {} items", pass, total));

        let counters = Arc::new(ProgressCounters::new(total));
        let reporter = ProgressReporter::start(
            pass,
            counters.clone(),
            self.options.progress_interval,
            self.options.progress_hook.clone(),
        );

        let queue = Arc::new(WorkQueue::new(graph, self.options.max_errors, counters));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = queue.clone();
            let action = action.clone();
            let run_log = run_log.clone();
            let options = self.options.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, &queue, action.as_ref(), &run_log, &options).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Pass {}: worker task ended abnormally: {}", pass, e);
            }
        }

        reporter.finish().await;

        let budget_exhausted = queue.budget_exhausted();
        let drained = queue.drain();

        let mut items = drained.finished;

        if !drained.queued.is_empty() {
            warn!(
                "Pass {}: error budget exhausted, {} items not processed",
                pass,
                drained.queued.len()
            );
        }
        for mut item in drained.queued {
            // Requeued items keep the error of their last attempt.
            let message = match (item.succeeded, item.last_error.take()) {
                (Some(false), Some(error)) => error,
                _ => BUDGET_MESSAGE.to_string(),
            };
            item.mark_failed(message);
            items.push(item);
        }

        let blocked = drained.unreleased.len();
        for mut item in drained.unreleased {
            warn!("Pass {}: {} {}", pass, item, BLOCKED_MESSAGE);
            item.mark_failed(BLOCKED_MESSAGE);
            items.push(item);
        }

        items.sort_unstable_by_key(|item| item.id());

        let report = PassReport {
            pass: pass.to_string(),
            items,
            completed: drained.completed,
            errors: drained.errors,
            dequeued: drained.dequeued,
            blocked,
            budget_exhausted,
            elapsed: started.elapsed(),
        };

        info!(
            "Pass {} finished in {:.1}s: {} succeeded, {} errors, {} blocked",
            pass,
            report.elapsed.as_secs_f64(),
            report.completed,
            report.errors,
            report.blocked
        );
        run_log.line(&format!(
            "Pass {} finished: {} succeeded, {} errors",
            pass, report.completed, report.errors
        ));

        report
    }
}

async fn worker_loop<A>(
    worker_id: usize,
    queue: &WorkQueue,
    action: &A,
    run_log: &RunLog,
    options: &PoolOptions,
) where
    A: ItemAction + ?Sized,
{
    while let Some(mut item) = queue.pop().await {
        item.attempts += 1;
        debug!(
            "Worker {} processing {} (attempt {}, {:?})",
            worker_id, item, item.attempts, item.status
        );

        let mut ctx = ItemContext::new(queue, run_log.item_log());
        ctx.log().line(format!(
            "{}: attempt {} from {:?}",
            item, item.attempts, item.status
        ));

        let outcome = AssertUnwindSafe(action.execute(&mut item, &mut ctx))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(CopyError::Action(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(()) => {
                item.mark_succeeded();
                debug!("Worker {} finished {} at {:?}", worker_id, item, item.status);
                ctx.log().line(format!("{}: succeeded at {:?}", item, item.status));
                run_log.write_item(ctx.into_log());
                queue.complete(item);
            }
            Err(e) => {
                let message = e.to_string();
                let retry = options.retry_on_failure && item.attempts < options.max_attempts;
                if retry {
                    warn!(
                        "{} failed (attempt {}/{}), retrying: {}",
                        item, item.attempts, options.max_attempts, message
                    );
                } else {
                    error!("{} failed: {}", item, message);
                }
                ctx.log().line(format!("{}: failed: {}", item, message));
                item.mark_failed(message);
                run_log.write_item(ctx.into_log());
                queue.fail(item, retry);
            }
        }
    }

    debug!("Worker {} exiting", worker_id);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker action panicked: {}", detail)
}
