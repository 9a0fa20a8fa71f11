//! Queue snapshots: the scratch accounting substrate for victim selection.
//!
//! A [`QueueSnapshots`] arena mirrors the live queue tree at capture time.
//! Each captured queue owns independent copies of its resource vectors and an
//! owning index to its already-captured parent, so a whole tree duplicates in
//! one step and trial mutations on the copy can never leak into the original
//! or into live queues.
//!
//! Guarantees and maxima tighten downward: the effective value at any queue
//! is the component-wise minimum along its ancestor chain. The two derived
//! quantities driving victim selection are
//! [`remaining_guaranteed`](QueueSnapshots::remaining_guaranteed) (how far a
//! queue is from violating its effective guarantee) and
//! [`preemptable_resource`](QueueSnapshots::preemptable_resource) (how much
//! usage sits above the guarantee and may be taken away).

use std::collections::HashMap;
use std::sync::Arc;

use talon_resources::Resource;
use tracing::warn;

use crate::error::{PreemptionError, Result};
use crate::types::Allocation;

/// Captured state of one queue, fed into [`QueueSnapshots::capture`].
#[derive(Debug, Clone, Default)]
pub struct QueueSpec {
    queue_path: String,
    leaf: bool,
    allocated: Resource,
    preempting: Resource,
    max: Resource,
    guaranteed: Resource,
    potential_victims: Vec<Arc<Allocation>>,
}

impl QueueSpec {
    /// Describes a leaf queue.
    #[must_use]
    pub fn leaf(queue_path: impl Into<String>) -> Self {
        Self {
            queue_path: queue_path.into(),
            leaf: true,
            ..Self::default()
        }
    }

    /// Describes a branch (non-leaf) queue.
    #[must_use]
    pub fn branch(queue_path: impl Into<String>) -> Self {
        Self {
            queue_path: queue_path.into(),
            leaf: false,
            ..Self::default()
        }
    }

    /// Sets the allocated resources.
    #[must_use]
    pub fn with_allocated(mut self, allocated: Resource) -> Self {
        self.allocated = allocated;
        self
    }

    /// Sets the resources already flagged for preemption.
    #[must_use]
    pub fn with_preempting(mut self, preempting: Resource) -> Self {
        self.preempting = preempting;
        self
    }

    /// Sets the maximum resources.
    #[must_use]
    pub fn with_max(mut self, max: Resource) -> Self {
        self.max = max;
        self
    }

    /// Sets the guaranteed resources.
    #[must_use]
    pub fn with_guaranteed(mut self, guaranteed: Resource) -> Self {
        self.guaranteed = guaranteed;
        self
    }

    /// Sets the allocations eligible to be preempted from this queue.
    #[must_use]
    pub fn with_potential_victims(mut self, victims: Vec<Arc<Allocation>>) -> Self {
        self.potential_victims = victims;
        self
    }
}

/// One queue inside a [`QueueSnapshots`] arena.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    queue_path: String,
    leaf: bool,
    parent: Option<usize>,
    allocated: Resource,
    preempting: Resource,
    max: Resource,
    guaranteed: Resource,
    potential_victims: Vec<Arc<Allocation>>,
}

impl QueueSnapshot {
    /// Returns the fully qualified queue path.
    #[must_use]
    pub fn queue_path(&self) -> &str {
        &self.queue_path
    }

    /// True when this queue is a leaf.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Returns this queue's own allocated resources (children included).
    #[must_use]
    pub fn allocated_resource(&self) -> &Resource {
        &self.allocated
    }

    /// Returns the resources currently flagged for preemption.
    #[must_use]
    pub fn preempting_resource(&self) -> &Resource {
        &self.preempting
    }

    /// Returns this queue's own (uninherited) guaranteed resources.
    #[must_use]
    pub fn guaranteed_resource(&self) -> &Resource {
        &self.guaranteed
    }

    /// Returns this queue's own (uninherited) maximum resources.
    #[must_use]
    pub fn max_resource(&self) -> &Resource {
        &self.max
    }

    /// Returns the allocations eligible to be preempted from this queue.
    #[must_use]
    pub fn potential_victims(&self) -> &[Arc<Allocation>] {
        &self.potential_victims
    }
}

/// Snapshot arena for a queue tree.
///
/// Paths are dot-separated (`root.tenants.a`); a path without a dot is the
/// root. Parents must be captured before their children, which keeps
/// invariant "parent snapshots exist whenever a child does" true by
/// construction. Queries against paths missing from the arena are safe and
/// behave as an absent queue (empty guarantees, no-op mutations).
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshots {
    nodes: Vec<QueueSnapshot>,
    by_path: HashMap<String, usize>,
    ask_queue: Option<usize>,
}

impl QueueSnapshots {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures one queue into the arena.
    ///
    /// Re-capturing a path refreshes its state in place.
    ///
    /// # Errors
    ///
    /// Returns [`PreemptionError::SnapshotMissing`] if the parent derived
    /// from the queue path has not been captured yet.
    pub fn capture(&mut self, spec: QueueSpec) -> Result<()> {
        let parent = match spec.queue_path.rsplit_once('.') {
            Some((parent_path, _)) => {
                Some(self.index(parent_path).ok_or_else(|| {
                    PreemptionError::SnapshotMissing {
                        queue_path: parent_path.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let snapshot = QueueSnapshot {
            queue_path: spec.queue_path,
            leaf: spec.leaf,
            parent,
            allocated: spec.allocated,
            preempting: spec.preempting,
            max: spec.max,
            guaranteed: spec.guaranteed,
            potential_victims: spec.potential_victims,
        };

        if let Some(&idx) = self.by_path.get(&snapshot.queue_path) {
            self.nodes[idx] = snapshot;
        } else {
            self.by_path
                .insert(snapshot.queue_path.clone(), self.nodes.len());
            self.nodes.push(snapshot);
        }
        Ok(())
    }

    /// Marks the queue holding the triggering ask. Guarantee queries treat
    /// the ask queue's own branch less strictly than sibling branches.
    pub fn set_ask_queue(&mut self, queue_path: &str) {
        let idx = self.index(queue_path);
        if idx.is_none() {
            warn!(queue_path, "BUG: ask queue not present in snapshot arena");
        }
        self.ask_queue = idx;
    }

    /// Returns the path of the ask queue, if one is marked.
    #[must_use]
    pub fn ask_queue_path(&self) -> Option<&str> {
        self.ask_queue.map(|i| self.nodes[i].queue_path.as_str())
    }

    /// Produces a fully independent copy of the arena. Resource vectors are
    /// cloned; potential-victim lists stay shared (they are read-only during
    /// simulation).
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// True when `queue_path` has been captured.
    #[must_use]
    pub fn contains(&self, queue_path: &str) -> bool {
        self.by_path.contains_key(queue_path)
    }

    /// Looks up a captured queue.
    #[must_use]
    pub fn get(&self, queue_path: &str) -> Option<&QueueSnapshot> {
        self.index(queue_path).map(|i| &self.nodes[i])
    }

    /// Returns every captured path in sorted order.
    #[must_use]
    pub fn queue_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.by_path.keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    /// Returns the eligible victims of `queue_path`, empty when absent.
    #[must_use]
    pub fn potential_victims(&self, queue_path: &str) -> &[Arc<Allocation>] {
        self.index(queue_path)
            .map_or(&[], |i| self.nodes[i].potential_victims.as_slice())
    }

    /// Adds `resource` to the queue's allocation and to every ancestor.
    pub fn add_allocation(&mut self, queue_path: &str, resource: &Resource) {
        let mut cursor = self.index(queue_path);
        while let Some(idx) = cursor {
            self.nodes[idx].allocated.add_to(resource);
            cursor = self.nodes[idx].parent;
        }
    }

    /// Removes `resource` from the queue's allocation and from every
    /// ancestor. Exact inverse of [`QueueSnapshots::add_allocation`].
    pub fn remove_allocation(&mut self, queue_path: &str, resource: &Resource) {
        let mut cursor = self.index(queue_path);
        while let Some(idx) = cursor {
            self.nodes[idx].allocated.sub_from(resource);
            cursor = self.nodes[idx].parent;
        }
    }

    /// Effective guarantee at `queue_path`: the component-wise minimum of
    /// the queue's own guarantee and every ancestor's. Empty when the path
    /// is absent.
    #[must_use]
    pub fn effective_guaranteed(&self, queue_path: &str) -> Resource {
        self.fold_min(queue_path, |node| &node.guaranteed)
    }

    /// Effective maximum at `queue_path`, tightening downward like the
    /// guarantee.
    #[must_use]
    pub fn effective_max(&self, queue_path: &str) -> Resource {
        self.fold_min(queue_path, |node| &node.max)
    }

    fn fold_min<'a>(
        &'a self,
        queue_path: &str,
        field: impl Fn(&'a QueueSnapshot) -> &'a Resource,
    ) -> Resource {
        let mut cursor = self.index(queue_path);
        let mut acc: Option<Resource> = None;
        while let Some(idx) = cursor {
            let value = field(&self.nodes[idx]);
            acc = Some(match acc {
                Some(acc) => value.component_wise_min(&acc),
                None => value.clone(),
            });
            cursor = self.nodes[idx].parent;
        }
        acc.unwrap_or_default()
    }

    /// How far the queue is from violating its effective guarantee.
    ///
    /// `None` means no guarantee exists anywhere in the chain and the queue
    /// is unconstrained. A negative component means the queue is over its
    /// guarantee on that resource type.
    ///
    /// The ask queue's branch is treated asymmetrically: the ask queue's own
    /// remaining dominates its ancestors for the types it defines, and an
    /// ancestor it shares with the ask queue does not propagate its
    /// remaining downward while the ask queue still has headroom of its own.
    /// Sibling branches see the full hierarchical minimum, so their victims
    /// are checked strictly.
    #[must_use]
    pub fn remaining_guaranteed(&self, queue_path: &str) -> Option<Resource> {
        self.remaining_guaranteed_at(self.index(queue_path))
    }

    fn remaining_guaranteed_at(&self, cursor: Option<usize>) -> Option<Resource> {
        let idx = cursor?;
        let node = &self.nodes[idx];
        let parent = self.remaining_guaranteed_at(node.parent);

        // Without a guarantee here or above, the queue is unconstrained.
        if parent.as_ref().is_none_or(Resource::is_empty) && node.guaranteed.is_empty() {
            return None;
        }

        let used = node.allocated.sub_only_existing(&node.preempting);
        let remaining = node.guaranteed.sub_only_existing(&used);

        if let Some(ask_idx) = self.ask_queue {
            if ask_idx == idx && !remaining.is_empty() {
                return Some(match parent {
                    Some(parent) => remaining.merge_if_not_present(&parent),
                    None => remaining,
                });
            }
            if !remaining.is_empty()
                && self.is_ancestor_or_self(idx, ask_idx)
                && !self.flat_remaining(ask_idx).is_empty()
            {
                return None;
            }
        }

        Some(match parent {
            Some(parent) => remaining.component_wise_min(&parent),
            None => remaining,
        })
    }

    // Remaining guarantee of one queue in isolation, ignoring ancestors.
    fn flat_remaining(&self, idx: usize) -> Resource {
        let node = &self.nodes[idx];
        let used = node.allocated.sub_only_existing(&node.preempting);
        node.guaranteed.sub_only_existing(&used)
    }

    fn is_ancestor_or_self(&self, ancestor: usize, descendant: usize) -> bool {
        let mut cursor = Some(descendant);
        while let Some(idx) = cursor {
            if idx == ancestor {
                return true;
            }
            cursor = self.nodes[idx].parent;
        }
        false
    }

    /// How much usage above its guarantee may be taken from the queue.
    ///
    /// `None` when the queue has no usage at all; otherwise only strictly
    /// positive components survive. A queue fully within its guarantee
    /// short-circuits to the empty vector without consulting its parent:
    /// the verdict computed closest to the leaf has precedence.
    #[must_use]
    pub fn preemptable_resource(&self, queue_path: &str) -> Option<Resource> {
        self.preemptable_at(self.index(queue_path))
    }

    fn preemptable_at(&self, cursor: Option<usize>) -> Option<Resource> {
        let idx = cursor?;
        let node = &self.nodes[idx];
        if node.allocated.is_empty() {
            return None;
        }

        let actual = node.allocated.sub_only_existing(&node.preempting);
        let preemptable = actual
            .sub_only_existing(&node.guaranteed)
            .positive_components();
        if preemptable.is_empty() {
            return Some(preemptable);
        }

        // Types the parent does not consider over-used are irrelevant here;
        // the minimum is taken only over this queue's preemptable types.
        Some(match self.preemptable_at(node.parent) {
            Some(parent) => preemptable.component_wise_min_only_existing(&parent),
            None => preemptable,
        })
    }

    fn index(&self, queue_path: &str) -> Option<usize> {
        self.by_path.get(queue_path).copied()
    }
}
