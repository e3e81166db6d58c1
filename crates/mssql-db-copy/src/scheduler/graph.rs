//! Schema dependency tracking between migration items.
//!
//! The graph owns every item that has not been released to the work queue
//! yet. Releasing an item moves it out of the graph, so an item can be
//! handed out at most once no matter how many of its parents complete
//! concurrently; callers serialize access to the graph (the work queue keeps
//! it behind its state lock).

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::item::MigrationItem;
use crate::catalog::{Dependency, ObjectId};

/// Pre-computed parent/child edges plus the set of ids still pending.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Ids each object's definition references.
    parents_of: HashMap<ObjectId, HashSet<ObjectId>>,

    /// Reverse edges: objects referencing the key.
    children_of: HashMap<ObjectId, Vec<ObjectId>>,

    /// Items whose dependents are still blocked on them.
    pending: HashSet<ObjectId>,

    /// Items not yet released.
    parked: HashMap<ObjectId, MigrationItem>,

    /// Items the graph was built over, duplicates excluded.
    total: usize,
}

impl DependencyGraph {
    /// Build the graph over `items`.
    ///
    /// Edges are `(id, depends_on)` pairs and are assumed acyclic. Self-edges
    /// and edges from objects that are not items are dropped; edges to objects
    /// that are not items never block anything.
    pub fn build(items: Vec<MigrationItem>, edges: &[Dependency]) -> Self {
        let mut parked = HashMap::with_capacity(items.len());
        for item in items {
            let id = item.id();
            if parked.contains_key(&id) {
                warn!("Duplicate object id {} ({}), ignoring second copy", id, item);
                continue;
            }
            parked.insert(id, item);
        }

        let mut parents_of: HashMap<ObjectId, HashSet<ObjectId>> = HashMap::new();
        for edge in edges {
            if edge.id == edge.depends_on || !parked.contains_key(&edge.id) {
                continue;
            }
            parents_of.entry(edge.id).or_default().insert(edge.depends_on);
        }

        let mut children_of: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();
        for (child, parents) in &parents_of {
            for parent in parents {
                children_of.entry(*parent).or_default().push(*child);
            }
        }

        let pending = parked.keys().copied().collect();

        debug!(
            "Dependency graph: {} items, {} objects with dependencies",
            parked.len(),
            parents_of.len()
        );

        Self {
            parents_of,
            children_of,
            pending,
            total: parked.len(),
            parked,
        }
    }

    /// Graph over independent items: everything is ready at once.
    pub fn independent(items: Vec<MigrationItem>) -> Self {
        Self::build(items, &[])
    }

    /// True iff none of the object's parents are still pending.
    pub fn is_ready(&self, id: ObjectId) -> bool {
        parents_cleared(&self.parents_of, &self.pending, id)
    }

    /// Whether `id` still blocks its dependents.
    pub fn is_pending(&self, id: ObjectId) -> bool {
        self.pending.contains(&id)
    }

    /// Number of items in the graph, released or not.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of items not yet released.
    pub fn unreleased(&self) -> usize {
        self.parked.len()
    }

    /// Release every parked item that is ready now.
    ///
    /// Items come back ordered by object id.
    pub fn take_ready(&mut self) -> Vec<MigrationItem> {
        let mut ready: Vec<ObjectId> = self
            .parked
            .keys()
            .copied()
            .filter(|id| self.is_ready(*id))
            .collect();
        ready.sort_unstable();

        ready
            .into_iter()
            .filter_map(|id| self.parked.remove(&id))
            .collect()
    }

    /// Mark `id` done and release the children that became ready.
    ///
    /// Idempotent: a second call for the same id releases nothing.
    pub fn mark_done(&mut self, id: ObjectId) -> Vec<MigrationItem> {
        if !self.pending.remove(&id) {
            return Vec::new();
        }

        let Some(children) = self.children_of.get(&id) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for child in children {
            if !self.parked.contains_key(child)
                || !parents_cleared(&self.parents_of, &self.pending, *child)
            {
                continue;
            }
            if let Some(item) = self.parked.remove(child) {
                released.push(item);
            }
        }
        released
    }

    /// Consume the graph, returning items that were never released.
    pub fn into_unreleased(self) -> Vec<MigrationItem> {
        let mut items: Vec<_> = self.parked.into_values().collect();
        items.sort_unstable_by_key(|item| item.id());
        items
    }
}

fn parents_cleared(
    parents_of: &HashMap<ObjectId, HashSet<ObjectId>>,
    pending: &HashSet<ObjectId>,
    id: ObjectId,
) -> bool {
    parents_of
        .get(&id)
        .map_or(true, |parents| parents.iter().all(|p| !pending.contains(p)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ObjectKind, SqlObject};

    fn items(ids: &[ObjectId]) -> Vec<MigrationItem> {
        ids.iter()
            .map(|id| {
                MigrationItem::new(SqlObject::new(*id, "dbo", format!("T{}", id), ObjectKind::Table))
            })
            .collect()
    }

    fn ids(items: &[MigrationItem]) -> Vec<ObjectId> {
        let mut ids: Vec<_> = items.iter().map(|i| i.id()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_chain_releases_one_at_a_time() {
        // 3 -> 2 -> 1
        let edges = [Dependency::new(2, 1), Dependency::new(3, 2)];
        let mut graph = DependencyGraph::build(items(&[1, 2, 3]), &edges);

        assert_eq!(ids(&graph.take_ready()), vec![1]);
        assert!(!graph.is_ready(2));

        assert_eq!(ids(&graph.mark_done(1)), vec![2]);
        assert!(!graph.is_ready(3));
        assert_eq!(ids(&graph.mark_done(2)), vec![3]);
        assert!(graph.mark_done(3).is_empty());
        assert_eq!(graph.unreleased(), 0);
    }

    #[test]
    fn test_child_with_two_parents_released_after_last() {
        let edges = [Dependency::new(3, 1), Dependency::new(3, 2)];
        let mut graph = DependencyGraph::build(items(&[1, 2, 3]), &edges);

        assert_eq!(ids(&graph.take_ready()), vec![1, 2]);
        assert!(graph.mark_done(2).is_empty());
        assert_eq!(ids(&graph.mark_done(1)), vec![3]);
    }

    #[test]
    fn test_mark_done_is_idempotent() {
        let edges = [Dependency::new(2, 1)];
        let mut graph = DependencyGraph::build(items(&[1, 2]), &edges);
        graph.take_ready();

        assert_eq!(graph.mark_done(1).len(), 1);
        assert!(graph.mark_done(1).is_empty());
    }

    #[test]
    fn test_edges_to_unknown_objects_do_not_block() {
        // 99 is not an item (e.g. a synonym); 2 -> 2 is a self reference.
        let edges = [Dependency::new(1, 99), Dependency::new(2, 2)];
        let mut graph = DependencyGraph::build(items(&[1, 2]), &edges);
        assert_eq!(ids(&graph.take_ready()), vec![1, 2]);
    }

    #[test]
    fn test_edges_from_unknown_objects_are_dropped() {
        let edges = [Dependency::new(42, 1)];
        let graph = DependencyGraph::build(items(&[1]), &edges);
        assert!(graph.children_of.is_empty());
    }

    #[test]
    fn test_cycle_stays_unreleased() {
        let edges = [
            Dependency::new(1, 3),
            Dependency::new(2, 1),
            Dependency::new(3, 2),
        ];
        let mut graph = DependencyGraph::build(items(&[1, 2, 3, 4]), &edges);

        assert_eq!(ids(&graph.take_ready()), vec![4]);
        graph.mark_done(4);
        assert_eq!(ids(&graph.into_unreleased()), vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_parent_blocks_children() {
        let edges = [Dependency::new(2, 1)];
        let mut graph = DependencyGraph::build(items(&[1, 2]), &edges);
        graph.take_ready();
        // 1 never completes
        assert!(graph.is_pending(1));
        assert_eq!(ids(&graph.into_unreleased()), vec![2]);
    }

    #[test]
    fn test_independent_all_ready() {
        let mut graph = DependencyGraph::independent(items(&[5, 3, 4]));
        assert_eq!(graph.len(), 3);
        assert_eq!(ids(&graph.take_ready()), vec![3, 4, 5]);
        assert!(!graph.is_empty());
    }

    #[test]
    fn test_len_counts_released_and_done_items() {
        // 2 -> 1, 3 independent
        let edges = [Dependency::new(2, 1)];
        let mut graph = DependencyGraph::build(items(&[1, 2, 3, 3]), &edges);
        assert_eq!(graph.len(), 3);

        graph.take_ready();
        graph.mark_done(3);
        graph.mark_done(1);
        assert_eq!(graph.unreleased(), 0);
        assert_eq!(graph.len(), 3);
        assert!(!graph.is_empty());

        assert!(DependencyGraph::independent(Vec::new()).is_empty());
    }
}
