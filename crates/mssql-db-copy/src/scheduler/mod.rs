//! Dependency-driven concurrent scheduling of migration items.
//!
//! A pass builds a [`DependencyGraph`] over its items and hands it to a
//! [`WorkerPool`]. Workers pull ready items from the shared [`WorkQueue`];
//! completing an item releases its dependents into the same queue, so the
//! schedule grows as the graph clears instead of following a precomputed
//! topological order.

mod graph;
mod item;
mod pool;
mod queue;

pub use graph::DependencyGraph;
pub use item::{all_succeeded, ItemStatus, MigrationItem};
pub use pool::{
    ItemAction, ItemContext, PassReport, PoolOptions, WorkerPool, BLOCKED_MESSAGE, BUDGET_MESSAGE,
};
pub use queue::{Drained, WorkQueue};
