//! Preemption victim selection for the Talon hierarchical scheduler.
//!
//! When an ask cannot be placed because queues elsewhere in the hierarchy
//! sit above their guaranteed shares, `talon-preemption` decides whether
//! killing running allocations can make the ask fit, selects a concrete
//! victim set, and picks the node to reserve. Selection is correct rather
//! than optimal: victims free enough capacity on exactly one node, no
//! victim's queue is pushed below its inherited guarantee, the asking queue
//! does not overshoot its own guarantee, and results are stable under ties.
//!
//! # Features
//!
//! - **Queue snapshots**: an independent accounting arena per trial, so
//!   failed simulations never leak into live state
//! - **Two-pass node calculation**: shortfall-driven ordering, then a
//!   feasibility commit with the earliest sufficient prefix index
//! - **Predicate checks**: candidate nodes validated through a pluggable
//!   host-manager oracle with bounded fan-out
//! - **Queue-level top-up**: extra victims restore the asking queue's
//!   guarantee when node-local victims are not enough
//! - **Throttling**: per-ask preemption delay and attempt frequency
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use talon_preemption::{
//!     Allocation, AllocationKey, FixedQueueRegistry, NoopReleaseHandler, Preemptor,
//!     QueueSnapshots, QueueSpec, RecordingLiveQueue, Resource, StaticNode,
//!     StaticNodeIterator,
//! };
//!
//! // Two tenants under one parent: tenant b is over its guarantee with a
//! // 4-unit task on node-1, tenant a wants 4 units.
//! let victim = Arc::new(Allocation::new(
//!     AllocationKey::new("victim-1"),
//!     "app-b",
//!     "node-1",
//!     "root.b",
//!     Resource::new().with("memory", 4),
//! ));
//!
//! let mut snapshots = QueueSnapshots::new();
//! snapshots.capture(
//!     QueueSpec::branch("root")
//!         .with_guaranteed(Resource::new().with("memory", 10))
//!         .with_allocated(Resource::new().with("memory", 8)),
//! )?;
//! snapshots.capture(
//!     QueueSpec::leaf("root.a").with_guaranteed(Resource::new().with("memory", 5)),
//! )?;
//! snapshots.capture(
//!     QueueSpec::leaf("root.b")
//!         .with_guaranteed(Resource::new().with("memory", 5))
//!         .with_allocated(Resource::new().with("memory", 8))
//!         .with_potential_victims(vec![Arc::clone(&victim)]),
//! )?;
//!
//! let tenant_b = Arc::new(RecordingLiveQueue::new("root.b"));
//! let mut registry = FixedQueueRegistry::new(snapshots);
//! registry.register_application("app-b", Arc::clone(&tenant_b));
//!
//! let release = NoopReleaseHandler::new();
//! let mut nodes = StaticNodeIterator::new(vec![
//!     StaticNode::new("node-1", Resource::new().with("memory", 16))
//!         .with_available(Resource::new().with("memory", 0)),
//! ]);
//!
//! let ask = Arc::new(
//!     Allocation::new(
//!         AllocationKey::new("ask-1"),
//!         "app-a",
//!         "",
//!         "root.a",
//!         Resource::new().with("memory", 4),
//!     )
//!     .with_allow_preempt_other(true),
//! );
//!
//! let mut preemptor = Preemptor::new(
//!     ask,
//!     Resource::new(),
//!     Duration::from_secs(0),
//!     &registry,
//!     &mut nodes,
//!     &release,
//!     false,
//! );
//!
//! let result = preemptor.try_preemption()?;
//! assert_eq!(result.node_id, "node-1");
//! assert!(victim.is_preempted());
//! assert_eq!(
//!     tenant_b.preempting_resource(),
//!     Resource::new().with("memory", 4)
//! );
//! # Ok::<(), talon_preemption::PreemptionError>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Preemptor                    │
//! │  gate → feasibility → per-node calculation    │
//! │        → predicate checks → top-up → commit   │
//! │  ┌─────────────────┐  ┌────────────────────┐  │
//! │  │ QueueSnapshots  │  │ Predicate          │  │
//! │  │ (scratch arena) │  │ coordinator        │  │
//! │  └─────────────────┘  └────────────────────┘  │
//! └───────────────────────────────────────────────┘
//!    traits: QueueRegistry · NodeIterator ·
//!            PredicateOracle · ReleaseHandler
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod cluster;
pub mod error;
pub mod ordering;
pub mod predicate;
pub mod preemptor;
pub mod snapshot;
pub mod types;

pub use talon_resources::Resource;

pub use cluster::{
    ClusterNode, FixedQueueRegistry, LiveQueue, NodeIterator, NoopReleaseHandler, QueueRegistry,
    RecordingLiveQueue, ReleaseHandler, StaticNode, StaticNodeIterator,
};
pub use error::{PreemptionError, Result};
pub use ordering::{
    compare_node_victims, compare_victims, score_allocation, sort_victims_for_preemption,
    SCORE_FIT_MAX, SCORE_NO_PREEMPT, SCORE_ORIGINATOR, SCORE_UNFIT,
};
pub use predicate::{
    batch_predicate_checks, FixedPredicateOracle, PredicateArgs, PredicateCheckResult,
    PredicateOracle, PredicateResponse,
};
pub use preemptor::Preemptor;
pub use snapshot::{QueueSnapshot, QueueSnapshots, QueueSpec};
pub use types::{
    Allocation, AllocationKey, AllocationResult, AllocationResultKind, PreemptionTunables,
    TerminationType,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cluster::{
        ClusterNode, LiveQueue, NodeIterator, QueueRegistry, ReleaseHandler,
    };
    pub use crate::error::{PreemptionError, Result};
    pub use crate::predicate::{PredicateArgs, PredicateOracle, PredicateResponse};
    pub use crate::preemptor::Preemptor;
    pub use crate::snapshot::{QueueSnapshots, QueueSpec};
    pub use crate::types::{
        Allocation, AllocationKey, AllocationResult, PreemptionTunables, TerminationType,
    };
    pub use talon_resources::Resource;
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn res(pairs: &[(&str, i64)]) -> Resource {
        pairs.iter().fold(Resource::new(), |r, (k, v)| r.with(*k, *v))
    }

    fn running(
        key: &str,
        app: &str,
        node: &str,
        queue: &str,
        memory: i64,
        age_minutes: i64,
    ) -> Arc<Allocation> {
        Arc::new(
            Allocation::new(
                AllocationKey::new(key),
                app,
                node,
                queue,
                res(&[("memory", memory)]),
            )
            .with_create_time(Utc::now() - chrono::Duration::minutes(age_minutes)),
        )
    }

    #[test]
    fn full_preemption_workflow() {
        // tenant b holds 8 of the parent's 10 while tenant a, guaranteed 5,
        // holds nothing; two of b's tasks run on node-1, the newer one big
        // enough to cover the ask on its own
        let victim_new = running("victim-new", "app-b", "node-1", "root.b", 4, 2);
        let victim_old = running("victim-old", "app-b", "node-1", "root.b", 2, 10);

        let mut snapshots = QueueSnapshots::new();
        let captures = [
            QueueSpec::branch("root")
                .with_guaranteed(res(&[("memory", 10)]))
                .with_allocated(res(&[("memory", 8)])),
            QueueSpec::leaf("root.a").with_guaranteed(res(&[("memory", 5)])),
            QueueSpec::leaf("root.b")
                .with_guaranteed(res(&[("memory", 5)]))
                .with_allocated(res(&[("memory", 8)]))
                .with_potential_victims(vec![
                    Arc::clone(&victim_old),
                    Arc::clone(&victim_new),
                ]),
        ];
        for spec in captures {
            assert!(snapshots.capture(spec).is_ok());
        }

        let tenant_b = Arc::new(RecordingLiveQueue::new("root.b"));
        let mut registry = FixedQueueRegistry::new(snapshots);
        registry.register_application("app-b", Arc::clone(&tenant_b));

        let release = NoopReleaseHandler::new();
        let mut nodes = StaticNodeIterator::new(vec![StaticNode::new(
            "node-1",
            res(&[("memory", 16)]),
        )
        .with_available(res(&[("memory", 1)]))]);

        let ask = Arc::new(
            Allocation::new(
                AllocationKey::new("ask-1"),
                "app-a",
                "",
                "root.a",
                res(&[("memory", 3)]),
            )
            .with_allow_preempt_other(true)
            .with_create_time(Utc::now() - chrono::Duration::minutes(5)),
        );

        let mut preemptor = Preemptor::new(
            Arc::clone(&ask),
            res(&[("memory", 0)]),
            Duration::from_secs(0),
            &registry,
            &mut nodes,
            &release,
            false,
        );

        assert!(preemptor.check_preconditions());
        let result = preemptor.try_preemption();
        assert!(result.is_ok(), "preemption failed: {result:?}");
        let Ok(result) = result else { return };

        assert_eq!(result.kind, AllocationResultKind::Reserved);
        assert_eq!(result.node_id, "node-1");
        assert!(ask.has_triggered_preemption());

        // the newer task covers the ask on its own and is the only victim
        assert!(victim_new.is_preempted());
        assert!(!victim_old.is_preempted());
        assert_eq!(tenant_b.preempting_resource(), res(&[("memory", 4)]));
        assert_eq!(release.released(), vec![AllocationKey::new("victim-new")]);
    }

    #[test]
    fn gate_blocks_second_cycle_after_commit() {
        let registry = FixedQueueRegistry::new(QueueSnapshots::new());
        let release = NoopReleaseHandler::new();
        let mut nodes = StaticNodeIterator::new(Vec::new());

        let ask = Arc::new(
            Allocation::new(
                AllocationKey::new("ask-1"),
                "app-a",
                "",
                "root.a",
                res(&[("memory", 3)]),
            )
            .with_allow_preempt_other(true)
            .with_create_time(Utc::now() - chrono::Duration::minutes(5)),
        );
        ask.mark_triggered_preemption();

        let preemptor = Preemptor::new(
            Arc::clone(&ask),
            Resource::new(),
            Duration::from_secs(0),
            &registry,
            &mut nodes,
            &release,
            false,
        );
        assert!(!preemptor.check_preconditions());
    }
}
