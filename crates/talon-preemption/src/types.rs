//! Core types for preemption victim selection.
//!
//! This module provides the data the selection algorithm operates on:
//! - [`AllocationKey`]: unique identifier of a placed or pending allocation
//! - [`Allocation`]: a running task (potential victim) or a pending ask
//! - [`AllocationResult`]: the admission decision produced on success
//! - [`PreemptionTunables`]: attempt throttling and oracle fan-out width

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use talon_resources::Resource;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier for an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationKey(String);

impl AllocationKey {
    /// Creates a new allocation key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generates a new random allocation key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable scheduling status of an allocation.
#[derive(Debug)]
struct AllocationStatus {
    triggered_preemption: bool,
    preempted: bool,
    preempt_check_time: DateTime<Utc>,
    last_failure: Option<&'static str>,
}

/// A task known to the scheduler: either a running allocation (and therefore
/// a potential preemption victim) or a pending ask.
///
/// Identity and placement are immutable for the duration of a preemption
/// cycle; the small status block is shared mutable state guarded by a lock,
/// since the same allocation appears in several working-state maps at once.
#[derive(Debug)]
pub struct Allocation {
    allocation_key: AllocationKey,
    application_id: String,
    node_id: String,
    queue_path: String,
    resource: Resource,
    create_time: DateTime<Utc>,
    originator: bool,
    allow_preempt_self: bool,
    allow_preempt_other: bool,
    required_node: Option<String>,
    status: RwLock<AllocationStatus>,
}

impl Allocation {
    /// Creates a new allocation.
    #[must_use]
    pub fn new(
        allocation_key: AllocationKey,
        application_id: impl Into<String>,
        node_id: impl Into<String>,
        queue_path: impl Into<String>,
        resource: Resource,
    ) -> Self {
        Self {
            allocation_key,
            application_id: application_id.into(),
            node_id: node_id.into(),
            queue_path: queue_path.into(),
            resource,
            create_time: Utc::now(),
            originator: false,
            allow_preempt_self: true,
            allow_preempt_other: false,
            required_node: None,
            status: RwLock::new(AllocationStatus {
                triggered_preemption: false,
                preempted: false,
                preempt_check_time: DateTime::UNIX_EPOCH,
                last_failure: None,
            }),
        }
    }

    /// Sets the creation time.
    #[must_use]
    pub const fn with_create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.create_time = create_time;
        self
    }

    /// Marks this allocation as the originating task of its application.
    #[must_use]
    pub const fn with_originator(mut self, originator: bool) -> Self {
        self.originator = originator;
        self
    }

    /// Sets whether this allocation may itself be preempted.
    #[must_use]
    pub const fn with_allow_preempt_self(mut self, allow: bool) -> Self {
        self.allow_preempt_self = allow;
        self
    }

    /// Sets whether this allocation may cause preemption of others.
    #[must_use]
    pub const fn with_allow_preempt_other(mut self, allow: bool) -> Self {
        self.allow_preempt_other = allow;
        self
    }

    /// Pins this allocation to a specific node. Asks with a required node
    /// are handled by a separate algorithm and skipped here.
    #[must_use]
    pub fn with_required_node(mut self, node_id: impl Into<String>) -> Self {
        self.required_node = Some(node_id.into());
        self
    }

    /// Returns the allocation key.
    #[must_use]
    pub fn allocation_key(&self) -> &AllocationKey {
        &self.allocation_key
    }

    /// Returns the owning application ID.
    #[must_use]
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Returns the node this allocation is placed on.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the path of the queue this allocation belongs to.
    #[must_use]
    pub fn queue_path(&self) -> &str {
        &self.queue_path
    }

    /// Returns the allocated resources.
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    /// True if this is the application's initiating task.
    #[must_use]
    pub const fn is_originator(&self) -> bool {
        self.originator
    }

    /// True if this allocation has opted into being preempted.
    #[must_use]
    pub const fn allow_preempt_self(&self) -> bool {
        self.allow_preempt_self
    }

    /// True if this allocation may trigger preemption of others.
    #[must_use]
    pub const fn allow_preempt_other(&self) -> bool {
        self.allow_preempt_other
    }

    /// Returns the required node, if any.
    #[must_use]
    pub fn required_node(&self) -> Option<&str> {
        self.required_node.as_deref()
    }

    /// True once this ask has triggered a preemption cycle.
    #[must_use]
    pub fn has_triggered_preemption(&self) -> bool {
        self.status.read().triggered_preemption
    }

    /// Marks this ask as having triggered preemption.
    pub fn mark_triggered_preemption(&self) {
        self.status.write().triggered_preemption = true;
    }

    /// True once this allocation has been selected as a victim.
    #[must_use]
    pub fn is_preempted(&self) -> bool {
        self.status.read().preempted
    }

    /// Flags this allocation as preempted.
    pub fn mark_preempted(&self) {
        self.status.write().preempted = true;
    }

    /// Returns the time of the last preemption eligibility check.
    #[must_use]
    pub fn preempt_check_time(&self) -> DateTime<Utc> {
        self.status.read().preempt_check_time
    }

    /// Records `now` as the last preemption eligibility check, throttling
    /// follow-up attempts for the frequency window.
    pub fn update_preempt_check_time(&self, now: DateTime<Utc>) {
        self.status.write().preempt_check_time = now;
    }

    /// Records a scheduling failure code against this ask.
    pub fn log_allocation_failure(&self, code: &'static str) {
        debug!(
            allocation_key = %self.allocation_key,
            application_id = %self.application_id,
            code,
            "allocation failure"
        );
        self.status.write().last_failure = Some(code);
    }

    /// Returns the last recorded failure code, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<&'static str> {
        self.status.read().last_failure
    }
}

/// How a released victim's termination is reported outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationType {
    /// The scheduler killed the allocation to make room for another ask.
    PreemptedByScheduler,
}

impl fmt::Display for TerminationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreemptedByScheduler => write!(f, "PREEMPTED_BY_SCHEDULER"),
        }
    }
}

/// Kind of admission decision carried by an [`AllocationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationResultKind {
    /// The ask is bound to a node pending actual resource release.
    Reserved,
}

/// Admission decision produced by a successful preemption attempt.
#[derive(Debug, Clone)]
pub struct AllocationResult {
    /// Kind of decision. Preemption only ever reserves.
    pub kind: AllocationResultKind,
    /// Node the ask was bound to.
    pub node_id: String,
    /// The ask that was placed.
    pub ask: std::sync::Arc<Allocation>,
}

impl AllocationResult {
    /// Creates a reserved result binding `ask` to `node_id`.
    #[must_use]
    pub fn reserved(node_id: impl Into<String>, ask: std::sync::Arc<Allocation>) -> Self {
        Self {
            kind: AllocationResultKind::Reserved,
            node_id: node_id.into(),
            ask,
        }
    }
}

/// Tunables for preemption attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionTunables {
    /// Minimum time between preemption attempts for the same ask.
    pub preempt_attempt_frequency: Duration,
    /// Number of predicate checks dispatched to the oracle per batch.
    pub preempt_check_concurrency: usize,
}

impl Default for PreemptionTunables {
    fn default() -> Self {
        Self {
            preempt_attempt_frequency: Duration::from_secs(15),
            preempt_check_concurrency: 10,
        }
    }
}

impl PreemptionTunables {
    /// Creates tunables with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-ask attempt throttle window.
    #[must_use]
    pub const fn with_attempt_frequency(mut self, frequency: Duration) -> Self {
        self.preempt_attempt_frequency = frequency;
        self
    }

    /// Sets the oracle fan-out width.
    #[must_use]
    pub const fn with_check_concurrency(mut self, concurrency: usize) -> Self {
        self.preempt_check_concurrency = concurrency;
        self
    }
}
