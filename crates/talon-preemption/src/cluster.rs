//! Seams to the rest of the scheduler.
//!
//! The victim-selection core depends on small capability sets rather than on
//! concrete queue or node types: schedulability and availability queries for
//! nodes, eligible-victim capture and live-queue lookup for the queue tree,
//! and an outbound release notification. Each seam is a trait here, together
//! with a simple in-memory implementation useful for tests and simulations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use talon_resources::Resource;
use tracing::debug;

use crate::snapshot::QueueSnapshots;
use crate::types::{Allocation, AllocationKey, TerminationType};

/// Node-side queries used while building working state.
pub trait ClusterNode {
    /// Returns the node's identifier.
    fn node_id(&self) -> &str;

    /// True when the node currently accepts placements.
    fn is_schedulable(&self) -> bool;

    /// True when the node is reserved.
    fn is_reserved(&self) -> bool;

    /// True when the node is reserved for the given allocation.
    fn is_reserved_for(&self, allocation_key: &AllocationKey) -> bool;

    /// True when the node could hold `resource` at maximum capacity,
    /// ignoring current usage.
    fn fits_in_node(&self, resource: &Resource) -> bool;

    /// Returns the node's currently available resources.
    fn available_resource(&self) -> Resource;
}

/// Enumerates candidate nodes, visiting each node once per attempt.
pub trait NodeIterator {
    /// Calls `visit` for every node until exhaustion or until `visit`
    /// returns `false`.
    fn for_each_node(&mut self, visit: &mut dyn FnMut(&dyn ClusterNode) -> bool);
}

/// Queue-tree queries used by the preemptor.
pub trait QueueRegistry {
    /// Captures a snapshot tree of every queue holding allocations eligible
    /// to be preempted for `ask`, with the ask queue marked.
    fn find_eligible_preemption_victims(&self, queue_path: &str, ask: &Allocation)
        -> QueueSnapshots;

    /// Resolves the live queue owning the given application.
    fn find_queue_by_app_id(&self, application_id: &str) -> Option<Arc<dyn LiveQueue>>;
}

/// The live queue surface touched on commit.
pub trait LiveQueue: Send + Sync {
    /// Returns the queue's fully qualified path.
    fn queue_path(&self) -> &str;

    /// Flags `resource` as being preempted from this queue. This is the only
    /// live-state write the preemption core performs; the caller's locking
    /// discipline must cover it.
    fn inc_preempting_resource(&self, resource: &Resource);
}

/// Outbound notification that victims should be released.
pub trait ReleaseHandler: Send + Sync {
    /// Reports the final victim list with its termination type and a
    /// human-readable reason.
    fn notify_released(
        &self,
        victims: &[Arc<Allocation>],
        termination: TerminationType,
        reason: &str,
    );
}

/// A release handler that only records what it was told, useful for tests.
#[derive(Debug, Default)]
pub struct NoopReleaseHandler {
    released: Mutex<Vec<AllocationKey>>,
}

impl NoopReleaseHandler {
    /// Creates a new no-op handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the keys of every allocation released so far.
    #[must_use]
    pub fn released(&self) -> Vec<AllocationKey> {
        self.released.lock().clone()
    }
}

impl ReleaseHandler for NoopReleaseHandler {
    fn notify_released(
        &self,
        victims: &[Arc<Allocation>],
        termination: TerminationType,
        reason: &str,
    ) {
        debug!(count = victims.len(), %termination, reason, "noop release");
        let mut released = self.released.lock();
        released.extend(victims.iter().map(|v| v.allocation_key().clone()));
    }
}

/// A fixed in-memory node, useful for tests and simulations.
#[derive(Debug, Clone)]
pub struct StaticNode {
    node_id: String,
    schedulable: bool,
    reserved_for: Option<AllocationKey>,
    capacity: Resource,
    available: Resource,
}

impl StaticNode {
    /// Creates a schedulable node with the given total capacity, fully
    /// available.
    #[must_use]
    pub fn new(node_id: impl Into<String>, capacity: Resource) -> Self {
        let available = capacity.clone();
        Self {
            node_id: node_id.into(),
            schedulable: true,
            reserved_for: None,
            capacity,
            available,
        }
    }

    /// Overrides the currently available resources.
    #[must_use]
    pub fn with_available(mut self, available: Resource) -> Self {
        self.available = available;
        self
    }

    /// Sets whether the node accepts placements.
    #[must_use]
    pub const fn with_schedulable(mut self, schedulable: bool) -> Self {
        self.schedulable = schedulable;
        self
    }

    /// Reserves the node for the given allocation.
    #[must_use]
    pub fn with_reservation(mut self, allocation_key: AllocationKey) -> Self {
        self.reserved_for = Some(allocation_key);
        self
    }
}

impl ClusterNode for StaticNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn is_schedulable(&self) -> bool {
        self.schedulable
    }

    fn is_reserved(&self) -> bool {
        self.reserved_for.is_some()
    }

    fn is_reserved_for(&self, allocation_key: &AllocationKey) -> bool {
        self.reserved_for.as_ref() == Some(allocation_key)
    }

    fn fits_in_node(&self, resource: &Resource) -> bool {
        self.capacity.fits_in(resource)
    }

    fn available_resource(&self) -> Resource {
        self.available.clone()
    }
}

/// Iterates a fixed list of [`StaticNode`]s.
#[derive(Debug, Default)]
pub struct StaticNodeIterator {
    nodes: Vec<StaticNode>,
}

impl StaticNodeIterator {
    /// Creates an iterator over the given nodes.
    #[must_use]
    pub fn new(nodes: Vec<StaticNode>) -> Self {
        Self { nodes }
    }
}

impl NodeIterator for StaticNodeIterator {
    fn for_each_node(&mut self, visit: &mut dyn FnMut(&dyn ClusterNode) -> bool) {
        for node in &self.nodes {
            if !visit(node) {
                break;
            }
        }
    }
}

/// A live queue that records preempting-resource increments, useful for
/// tests and simulations.
#[derive(Debug)]
pub struct RecordingLiveQueue {
    queue_path: String,
    preempting: Mutex<Resource>,
}

impl RecordingLiveQueue {
    /// Creates a recording queue for the given path.
    #[must_use]
    pub fn new(queue_path: impl Into<String>) -> Self {
        Self {
            queue_path: queue_path.into(),
            preempting: Mutex::new(Resource::new()),
        }
    }

    /// Returns the total resource flagged as preempting so far.
    #[must_use]
    pub fn preempting_resource(&self) -> Resource {
        self.preempting.lock().clone()
    }
}

impl LiveQueue for RecordingLiveQueue {
    fn queue_path(&self) -> &str {
        &self.queue_path
    }

    fn inc_preempting_resource(&self, resource: &Resource) {
        self.preempting.lock().add_to(resource);
    }
}

/// A queue registry serving a pre-built snapshot tree, useful for tests and
/// simulations.
#[derive(Debug, Default)]
pub struct FixedQueueRegistry {
    snapshots: QueueSnapshots,
    queues_by_app: HashMap<String, Arc<RecordingLiveQueue>>,
}

impl FixedQueueRegistry {
    /// Creates a registry serving copies of `snapshots`.
    #[must_use]
    pub fn new(snapshots: QueueSnapshots) -> Self {
        Self {
            snapshots,
            queues_by_app: HashMap::new(),
        }
    }

    /// Associates an application with its live queue.
    pub fn register_application(
        &mut self,
        application_id: impl Into<String>,
        queue: Arc<RecordingLiveQueue>,
    ) {
        self.queues_by_app.insert(application_id.into(), queue);
    }
}

impl QueueRegistry for FixedQueueRegistry {
    fn find_eligible_preemption_victims(
        &self,
        queue_path: &str,
        _ask: &Allocation,
    ) -> QueueSnapshots {
        let mut snapshots = self.snapshots.duplicate();
        snapshots.set_ask_queue(queue_path);
        snapshots
    }

    fn find_queue_by_app_id(&self, application_id: &str) -> Option<Arc<dyn LiveQueue>> {
        self.queues_by_app
            .get(application_id)
            .map(|q| Arc::clone(q) as Arc<dyn LiveQueue>)
    }
}
