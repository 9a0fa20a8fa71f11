//! Predicate checks: validating candidate nodes with the host manager.
//!
//! Resource arithmetic alone cannot tell whether an ask can really run on a
//! node; placement constraints live with the host manager, modeled here as a
//! black-box [`PredicateOracle`]. The coordinator batches per-node candidates
//! through the oracle with bounded concurrency and folds the successful
//! results into the best solution, on the coordinator thread only.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ordering::{SCORE_FIT_MAX, SCORE_NO_PREEMPT, SCORE_ORIGINATOR, SCORE_UNFIT};
use crate::types::{Allocation, AllocationKey};

/// Arguments for one predicate check: would `allocation_key` fit on
/// `node_id` once the first `start_index + 1` entries of
/// `preempt_allocation_keys` are released?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateArgs {
    /// The ask being placed.
    pub allocation_key: AllocationKey,
    /// Candidate node.
    pub node_id: String,
    /// Ordered victim candidates on that node.
    pub preempt_allocation_keys: Vec<AllocationKey>,
    /// Index into the victim list at which the ask is expected to fit;
    /// `-1` when no preemption is required.
    pub start_index: i32,
}

/// Oracle verdict for one predicate check. The oracle may require a longer
/// victim prefix than estimated; `index` is the prefix end actually needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateResponse {
    /// Whether the ask can run on the node.
    pub success: bool,
    /// Index of the last victim that must be released, `-1` for none.
    pub index: i32,
}

/// External host-manager service validating node placements.
pub trait PredicateOracle: Send + Sync {
    /// Evaluates one predicate check.
    fn check(&self, args: &PredicateArgs) -> PredicateResponse;
}

/// An oracle answering from a fixed per-node table, useful for tests and
/// simulations. Nodes absent from the table succeed at the requested index.
#[derive(Debug, Default)]
pub struct FixedPredicateOracle {
    responses: HashMap<String, PredicateResponse>,
}

impl FixedPredicateOracle {
    /// Creates an oracle that accepts every node at its requested index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the response for one node.
    #[must_use]
    pub fn with_response(mut self, node_id: impl Into<String>, response: PredicateResponse) -> Self {
        self.responses.insert(node_id.into(), response);
        self
    }

    /// Pins a rejection for one node.
    #[must_use]
    pub fn with_rejection(self, node_id: impl Into<String>) -> Self {
        self.with_response(
            node_id,
            PredicateResponse {
                success: false,
                index: -1,
            },
        )
    }
}

impl PredicateOracle for FixedPredicateOracle {
    fn check(&self, args: &PredicateArgs) -> PredicateResponse {
        self.responses
            .get(&args.node_id)
            .copied()
            .unwrap_or(PredicateResponse {
                success: true,
                index: args.start_index,
            })
    }
}

/// Outcome of predicate evaluation for one node.
#[derive(Debug, Clone)]
pub struct PredicateCheckResult {
    /// The ask that was checked.
    pub allocation_key: AllocationKey,
    /// The node that was checked.
    pub node_id: String,
    /// Whether the node passed.
    pub success: bool,
    /// Index of the last victim required for the ask to fit, `-1` for none.
    pub index: i32,
    /// The victims to release, filled by
    /// [`populate_victims`](Self::populate_victims) after selection.
    pub victims: Vec<Arc<Allocation>>,
}

impl PredicateCheckResult {
    fn from_response(args: &PredicateArgs, response: PredicateResponse) -> Self {
        Self {
            allocation_key: args.allocation_key.clone(),
            node_id: args.node_id.clone(),
            success: response.success,
            index: response.index,
            victims: Vec::new(),
        }
    }

    /// Copies the required victim prefix out of the per-node candidate map.
    /// Inconsistencies between the result and the map invalidate the result
    /// rather than panic.
    pub fn populate_victims(&mut self, victims_by_node: &HashMap<String, Vec<Arc<Allocation>>>) {
        if !self.success {
            return;
        }
        let Some(victims) = victims_by_node.get(&self.node_id) else {
            warn!(node_id = %self.node_id, "BUG: node missing from victim map");
            self.success = false;
            self.index = -1;
            return;
        };
        let prefix_len = self.index.saturating_add(1).max(0);
        if prefix_len > victims.len() as i32 {
            warn!(
                node_id = %self.node_id,
                index = self.index,
                candidates = victims.len(),
                "BUG: predicate index overruns victim candidates"
            );
            self.success = false;
            self.index = -1;
            return;
        }
        self.victims = victims[..prefix_len.unsigned_abs() as usize].to_vec();
    }

    /// Penalty score of this solution; lower wins. High-order bits flag
    /// unusable or risky solutions, the low-order bits count the victims
    /// that would be released.
    #[must_use]
    pub fn solution_score(&self, allocations_by_node: &HashMap<String, Vec<Arc<Allocation>>>) -> u64 {
        if !self.success {
            return SCORE_UNFIT;
        }
        let Some(allocations) = allocations_by_node.get(&self.node_id) else {
            return SCORE_UNFIT;
        };
        if self.index < 0 {
            return 0;
        }

        let mut score = 0;
        let mut end = self.index.unsigned_abs() as usize;
        if end >= allocations.len() {
            score |= SCORE_FIT_MAX;
            let Some(last) = allocations.len().checked_sub(1) else {
                return score;
            };
            end = last;
        }
        score += end as u64 + 1;
        for allocation in &allocations[..=end] {
            if allocation.is_originator() {
                score |= SCORE_ORIGINATOR;
            }
            if !allocation.allow_preempt_self() {
                score |= SCORE_NO_PREEMPT;
            }
        }
        score
    }

    /// True when this solution scores below `other`.
    #[must_use]
    pub fn better_than(
        &self,
        other: &Self,
        allocations_by_node: &HashMap<String, Vec<Arc<Allocation>>>,
    ) -> bool {
        self.solution_score(allocations_by_node) < other.solution_score(allocations_by_node)
    }

    /// True when no high-order penalty bit is set: the node fits the ask at
    /// the estimated index with nothing objectionable in the victim prefix.
    #[must_use]
    pub fn is_satisfactory(
        &self,
        allocations_by_node: &HashMap<String, Vec<Arc<Allocation>>>,
    ) -> bool {
        self.solution_score(allocations_by_node) < SCORE_FIT_MAX
    }
}

/// Splits predicate checks into batches of at most `batch_size`.
#[must_use]
pub fn batch_predicate_checks(checks: &[PredicateArgs], batch_size: usize) -> Vec<Vec<PredicateArgs>> {
    checks
        .chunks(batch_size.max(1))
        .map(<[PredicateArgs]>::to_vec)
        .collect()
}

fn run_predicate_check(oracle: &dyn PredicateOracle, args: &PredicateArgs) -> PredicateCheckResult {
    PredicateCheckResult::from_response(args, oracle.check(args))
}

/// Evaluates candidate nodes through the oracle and returns the best
/// successful result, its victim prefix populated.
///
/// Checks are sorted by ascending start index (fewer victims preferred),
/// ties broken by node ID, then dispatched in batches of `concurrency`
/// concurrent oracle calls. Batching stops early once a satisfactory result
/// is in hand. Without an oracle registered, the best-sorted check is
/// assumed to pass.
pub(crate) fn check_preemption_predicates(
    oracle: Option<&dyn PredicateOracle>,
    mut checks: Vec<PredicateArgs>,
    victims_by_node: &HashMap<String, Vec<Arc<Allocation>>>,
    allocations_by_node: &HashMap<String, Vec<Arc<Allocation>>>,
    concurrency: usize,
) -> Option<PredicateCheckResult> {
    if checks.is_empty() {
        return None;
    }

    checks.sort_by(|left, right| {
        left.start_index
            .cmp(&right.start_index)
            .then_with(|| left.node_id.cmp(&right.node_id))
    });

    let Some(oracle) = oracle else {
        let check = &checks[0];
        debug!(
            node_id = %check.node_id,
            allocation_key = %check.allocation_key,
            "no predicate oracle registered, using first selected node"
        );
        let mut result = PredicateCheckResult::from_response(
            check,
            PredicateResponse {
                success: true,
                index: check.start_index,
            },
        );
        result.populate_victims(victims_by_node);
        return Some(result);
    };

    let mut best: Option<PredicateCheckResult> = None;
    for batch in batch_predicate_checks(&checks, concurrency) {
        let (tx, rx) = mpsc::sync_channel::<PredicateCheckResult>(batch.len());
        thread::scope(|scope| {
            for args in &batch {
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(run_predicate_check(oracle, args));
                });
            }
            drop(tx);

            // fold on this thread only
            for result in rx {
                if !result.success {
                    continue;
                }
                best = match best.take() {
                    None => Some(result),
                    Some(current) => {
                        if result.better_than(&current, allocations_by_node) {
                            Some(result)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
        });

        if best
            .as_ref()
            .is_some_and(|b| b.is_satisfactory(allocations_by_node))
        {
            break;
        }
    }

    if let Some(best) = best.as_mut() {
        best.populate_victims(victims_by_node);
    }
    best
}
