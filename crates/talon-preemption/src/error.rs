//! Error types for preemption victim selection.

use thiserror::Error;

/// Result type for preemption operations.
pub type Result<T> = std::result::Result<T, PreemptionError>;

/// Errors that can end a preemption attempt.
///
/// Every variant is recoverable: the scheduler moves on to other asks and
/// retries after the attempt-frequency window.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreemptionError {
    /// Freeing every eligible victim would still leave the asking queue
    /// short of its guaranteed share.
    #[error("preemption cannot restore the asking queue guarantee")]
    DoesNotGuarantee,

    /// The selected victims do not cover the ask on every resource type the
    /// ask names.
    #[error("victim resources do not cover the ask: need {needed}, freed {freed}")]
    Shortfall {
        /// Resources the ask requires.
        needed: String,
        /// Resources the selected victims would free.
        freed: String,
    },

    /// No node produced a usable victim list, or the predicate oracle
    /// rejected every candidate node.
    #[error("no feasible node for preemption")]
    NoFeasibleNode,

    /// Queue-level top-up could not bring the asking queue back within its
    /// guarantee.
    #[error("additional victims cannot restore the asking queue guarantee")]
    InsufficientTopUp,

    /// Victim selection finished with an empty victim list.
    #[error("victim selection produced no victims")]
    NoVictims,

    /// A queue path expected in the snapshot map was missing. Indicates an
    /// internal inconsistency; logged with a `BUG:` prefix and recovered.
    #[error("queue snapshot missing for path: {queue_path}")]
    SnapshotMissing {
        /// Path of the queue that had no snapshot.
        queue_path: String,
    },
}

impl PreemptionError {
    /// Stable failure code surfaced to scheduling logs and allocation
    /// failure records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DoesNotGuarantee => "PreemptionDoesNotGuarantee",
            Self::Shortfall { .. } => "PreemptionShortfall",
            Self::NoFeasibleNode => "PreemptionNoFeasibleNode",
            Self::InsufficientTopUp => "PreemptionInsufficientTopUp",
            Self::NoVictims => "PreemptionNoVictims",
            Self::SnapshotMissing { .. } => "PreemptionSnapshotMissing",
        }
    }
}
