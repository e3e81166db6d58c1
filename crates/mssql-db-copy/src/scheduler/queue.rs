//! Shared ready queue of a worker pool pass.
//!
//! All scheduling state (ready items, the dependency graph and the counters
//! that decide termination) lives in one [`QueueState`] behind one mutex, so
//! "mark done, compute released children, enqueue them" is a single atomic
//! step. Idle workers wait on a [`Notify`] and recheck the state whenever
//! work is pushed, an item finishes or the error budget runs out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use super::graph::DependencyGraph;
use super::item::MigrationItem;
use crate::catalog::ObjectId;
use crate::progress::ProgressCounters;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<MigrationItem>,
    graph: DependencyGraph,
    in_flight: usize,
    completed: usize,
    errors: usize,
    dequeued: usize,
    finished: Vec<MigrationItem>,
}

/// Items and counters left when a pass ends.
#[derive(Debug, Default)]
pub struct Drained {
    /// Items that ran to a terminal outcome (success or retries exhausted).
    pub finished: Vec<MigrationItem>,

    /// Items still queued when the error budget stopped dequeuing.
    pub queued: Vec<MigrationItem>,

    /// Items never released by the dependency graph.
    pub unreleased: Vec<MigrationItem>,

    pub completed: usize,
    pub errors: usize,
    pub dequeued: usize,
}

/// Multi-producer, multi-consumer queue of ready items.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_errors: usize,
    counters: Arc<ProgressCounters>,
}

impl WorkQueue {
    /// Create a queue seeded with the graph's currently ready items.
    pub fn new(mut graph: DependencyGraph, max_errors: usize, counters: Arc<ProgressCounters>) -> Self {
        let ready: VecDeque<_> = graph.take_ready().into();
        debug!(
            "Work queue seeded with {} ready items ({} waiting on dependencies)",
            ready.len(),
            graph.unreleased()
        );

        Self {
            state: Mutex::new(QueueState {
                ready,
                graph,
                ..QueueState::default()
            }),
            notify: Notify::new(),
            max_errors: max_errors.max(1),
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the next ready item.
    ///
    /// Waits while the queue is empty but other items are in flight, since
    /// they may still release or requeue work. Returns `None` once the queue
    /// is quiescent or the error budget is exhausted.
    pub async fn pop(&self) -> Option<MigrationItem> {
        loop {
            // Registered before the check so a wakeup between the check and
            // the await is not lost.
            let notified = self.notify.notified();

            {
                let mut state = self.lock();
                if state.errors >= self.max_errors {
                    return None;
                }
                if let Some(item) = state.ready.pop_front() {
                    state.in_flight += 1;
                    state.dequeued += 1;
                    self.counters.set_in_flight(state.in_flight);
                    return Some(item);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release the dependents of `id` while its item is still in flight.
    ///
    /// Returns the number of items released. Safe to call more than once.
    pub fn release_dependents(&self, id: ObjectId) -> usize {
        let mut state = self.lock();
        let released = state.graph.mark_done(id);
        let count = released.len();
        if count > 0 {
            debug!("Object {} released {} dependents", id, count);
            state.ready.extend(released);
            drop(state);
            self.notify.notify_waiters();
        }
        count
    }

    /// Finish an in-flight item that succeeded.
    pub fn complete(&self, item: MigrationItem) {
        let mut state = self.lock();
        let released = state.graph.mark_done(item.id());
        if !released.is_empty() {
            debug!("{} released {} dependents", item, released.len());
        }
        state.ready.extend(released);
        state.completed += 1;
        state.in_flight -= 1;
        state.finished.push(item);
        self.counters.add_completed();
        self.counters.set_in_flight(state.in_flight);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Finish an in-flight item that failed, requeueing it when `retry` is set.
    ///
    /// A failed item is never marked done, so its dependents stay blocked.
    pub fn fail(&self, item: MigrationItem, retry: bool) {
        let mut state = self.lock();
        state.errors += 1;
        state.in_flight -= 1;
        if retry {
            state.ready.push_back(item);
        } else {
            state.finished.push(item);
        }
        self.counters.add_error();
        self.counters.set_in_flight(state.in_flight);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Whether the failure count reached the budget.
    pub fn budget_exhausted(&self) -> bool {
        self.lock().errors >= self.max_errors
    }

    /// Take every item and counter out of the queue.
    ///
    /// Meant for after all workers exited; the queue is empty afterwards.
    pub fn drain(&self) -> Drained {
        let mut state = self.lock();
        let graph = std::mem::take(&mut state.graph);
        Drained {
            finished: std::mem::take(&mut state.finished),
            queued: state.ready.drain(..).collect(),
            unreleased: graph.into_unreleased(),
            completed: state.completed,
            errors: state.errors,
            dequeued: state.dequeued,
        }
    }
}
