//! The preemptor: end-to-end victim selection for one ask.
//!
//! A [`Preemptor`] is built per ask per scheduling attempt and drives the
//! whole sequence: precondition gate, queue-guarantee feasibility, per-node
//! victim calculation, predicate checks through the oracle, queue-level
//! top-up, the final shortfall guard, and the commit that flags victims and
//! reserves the chosen node.
//!
//! A preemptor is not safe for concurrent use; the caller is expected to
//! hold the owning application's lock for the full attempt. Every trial
//! mutation happens on a freshly duplicated snapshot arena, so failed trials
//! leave no trace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use talon_resources::Resource;
use tracing::{debug, info, warn};

use crate::cluster::{NodeIterator, QueueRegistry, ReleaseHandler};
use crate::error::{PreemptionError, Result};
use crate::ordering::{compare_victims, sort_victims_for_preemption};
use crate::predicate::{check_preemption_predicates, PredicateArgs, PredicateOracle};
use crate::snapshot::QueueSnapshots;
use crate::types::{
    Allocation, AllocationKey, AllocationResult, PreemptionTunables, TerminationType,
};

/// Victim selection for a single ask.
pub struct Preemptor<'a> {
    ask: Arc<Allocation>,
    queue_path: String,
    headroom: Resource,
    preemption_delay: Duration,
    tunables: PreemptionTunables,
    registry: &'a dyn QueueRegistry,
    oracle: Option<&'a dyn PredicateOracle>,
    release: &'a dyn ReleaseHandler,
    iterator: &'a mut dyn NodeIterator,
    nodes_tried: bool,

    // lazily-populated working state, built once per attempt
    allocations_by_queue: Option<QueueSnapshots>,
    queue_by_alloc: HashMap<String, String>,
    allocations_by_node: HashMap<String, Vec<Arc<Allocation>>>,
    node_available: Option<HashMap<String, Resource>>,
}

impl<'a> Preemptor<'a> {
    /// Creates a preemptor for one ask.
    ///
    /// `headroom` is the asking queue's current headroom, `nodes_tried`
    /// records whether regular scheduling has already tried every node for
    /// this ask in the current cycle.
    pub fn new(
        ask: Arc<Allocation>,
        headroom: Resource,
        preemption_delay: Duration,
        registry: &'a dyn QueueRegistry,
        iterator: &'a mut dyn NodeIterator,
        release: &'a dyn ReleaseHandler,
        nodes_tried: bool,
    ) -> Self {
        let queue_path = ask.queue_path().to_string();
        Self {
            ask,
            queue_path,
            headroom,
            preemption_delay,
            tunables: PreemptionTunables::default(),
            registry,
            oracle: None,
            release,
            iterator,
            nodes_tried,
            allocations_by_queue: None,
            queue_by_alloc: HashMap::new(),
            allocations_by_node: HashMap::new(),
            node_available: None,
        }
    }

    /// Registers the predicate oracle. Without one, predicate checks are
    /// assumed to succeed.
    #[must_use]
    pub fn with_oracle(mut self, oracle: &'a dyn PredicateOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Overrides the default tunables.
    #[must_use]
    pub fn with_tunables(mut self, tunables: PreemptionTunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Sanity checks deciding whether preemption should be attempted for
    /// this ask at all. On success the ask's check time advances, so
    /// back-to-back scheduling cycles skip the ask for the attempt-frequency
    /// window.
    pub fn check_preconditions(&self) -> bool {
        let now = Utc::now();

        if !self.ask.allow_preempt_other() {
            return false;
        }

        if self.ask.has_triggered_preemption() {
            return false;
        }

        // required-node asks are handled by a separate algorithm
        if self.ask.required_node().is_some() {
            return false;
        }

        let delay = chrono::Duration::from_std(self.preemption_delay).unwrap_or_default();
        if now < self.ask.create_time() + delay {
            return false;
        }

        let frequency = chrono::Duration::from_std(self.tunables.preempt_attempt_frequency)
            .unwrap_or_default();
        if now < self.ask.preempt_check_time() + frequency {
            return false;
        }

        self.ask.update_preempt_check_time(now);
        true
    }

    /// Attempts preemption for the ask.
    ///
    /// On success the selected victims are flagged on their live queues, the
    /// release channel is notified, and the returned result reserves the
    /// chosen node for the ask.
    ///
    /// # Errors
    ///
    /// Every error is recoverable; see [`PreemptionError`] for the kinds.
    pub fn try_preemption(&mut self) -> Result<AllocationResult> {
        debug!(
            allocation_key = %self.ask.allocation_key(),
            queue_path = %self.queue_path,
            headroom = %self.headroom,
            "starting preemption attempt"
        );
        self.init_queue_snapshots();

        // validate that freeing victims can bring the asking queue within
        // its guarantee at all
        if !self.check_queue_guarantees() {
            let err = PreemptionError::DoesNotGuarantee;
            self.ask.log_allocation_failure(err.code());
            return Err(err);
        }

        self.init_working_state();

        // find a node and its victim list
        let (node_id, mut victims) = self.try_nodes().ok_or(PreemptionError::NoFeasibleNode)?;

        let fit_in = self
            .node_available
            .as_ref()
            .and_then(|nodes| nodes.get(&node_id))
            .is_some_and(|available| available.fits_in(self.ask.resource()));

        // queue-limit preemption may land on a node with enough free space;
        // nothing needs to be killed then
        if victims.is_empty() && fit_in {
            info!(
                allocation_key = %self.ask.allocation_key(),
                node_id = %node_id,
                "node fits ask without preemption, reserving"
            );
            return Ok(AllocationResult::reserved(node_id, Arc::clone(&self.ask)));
        }

        // node-level victims may leave the asking queue short of its own
        // guarantee; pick additional queue-level victims
        let extra = self
            .calculate_additional_victims(&victims)
            .ok_or(PreemptionError::InsufficientTopUp)?;
        victims.extend(extra);
        if victims.is_empty() {
            return Err(PreemptionError::NoVictims);
        }

        // More victims may have been collected than the ask needs: keep one
        // more only while part of the ask is still uncovered. When the
        // chosen node cannot host the ask on its own, victims on other
        // nodes cannot help one-node admission and are skipped entirely.
        let mut victims_total = Resource::new();
        let mut final_victims: Vec<Arc<Allocation>> = Vec::new();
        for victim in &victims {
            if !fit_in && victim.node_id() != node_id {
                continue;
            }
            if self
                .ask
                .resource()
                .strictly_greater_than_only_existing(&victims_total)
            {
                final_victims.push(Arc::clone(victim));
            }
            victims_total.add_to(victim.resource());
        }

        if self
            .ask
            .resource()
            .strictly_greater_than_only_existing(&victims_total)
        {
            let err = PreemptionError::Shortfall {
                needed: self.ask.resource().to_string(),
                freed: victims_total.to_string(),
            };
            self.ask.log_allocation_failure(err.code());
            return Err(err);
        }

        self.commit(&final_victims);

        info!(
            allocation_key = %self.ask.allocation_key(),
            node_id = %node_id,
            victim_count = final_victims.len(),
            "reserving node for ask after preemption"
        );
        Ok(AllocationResult::reserved(node_id, Arc::clone(&self.ask)))
    }

    fn init_queue_snapshots(&mut self) {
        if self.allocations_by_queue.is_some() {
            return;
        }
        self.allocations_by_queue = Some(
            self.registry
                .find_eligible_preemption_victims(&self.queue_path, &self.ask),
        );
    }

    /// Builds the per-cycle maps: victims by node, owning queue by
    /// allocation, and available resources per usable node.
    fn init_working_state(&mut self) {
        if self.node_available.is_some() {
            return;
        }
        self.init_queue_snapshots();
        let Some(snapshots) = self.allocations_by_queue.as_ref() else {
            warn!("BUG: queue snapshots not initialized");
            return;
        };

        let mut allocations_by_node: HashMap<String, Vec<Arc<Allocation>>> = HashMap::new();
        let mut queue_by_alloc: HashMap<String, String> = HashMap::new();
        for path in snapshots.queue_paths() {
            for allocation in snapshots.potential_victims(&path) {
                allocations_by_node
                    .entry(allocation.node_id().to_string())
                    .or_default()
                    .push(Arc::clone(allocation));
                queue_by_alloc.insert(allocation.allocation_key().as_str().to_string(), path.clone());
            }
        }

        // nodes that cannot host the ask at all take their victims out of
        // consideration with them
        let mut node_available: HashMap<String, Resource> = HashMap::new();
        let ask = Arc::clone(&self.ask);
        self.iterator.for_each_node(&mut |node| {
            if !node.is_schedulable()
                || (node.is_reserved() && !node.is_reserved_for(ask.allocation_key()))
                || !node.fits_in_node(ask.resource())
            {
                allocations_by_node.remove(node.node_id());
            } else {
                node_available.insert(node.node_id().to_string(), node.available_resource());
            }
            true
        });

        sort_victims_for_preemption(&mut allocations_by_node);

        self.allocations_by_node = allocations_by_node;
        self.queue_by_alloc = queue_by_alloc;
        self.node_available = Some(node_available);
    }

    /// Feasibility precheck: with the ask admitted, can removing eligible
    /// victims (in any order) bring the asking queue's remaining guarantee
    /// to at least zero?
    fn check_queue_guarantees(&self) -> bool {
        let Some(snapshots) = self.allocations_by_queue.as_ref() else {
            warn!("BUG: queue snapshots not initialized");
            return false;
        };
        let mut queues = snapshots.duplicate();
        if !queues.contains(&self.queue_path) {
            warn!(
                queue_path = %self.queue_path,
                "BUG: didn't find current queue in snapshot list"
            );
            return false;
        }

        queues.add_allocation(&self.queue_path, self.ask.resource());
        if remaining_is_non_negative(queues.remaining_guaranteed(&self.queue_path).as_ref()) {
            return true;
        }

        for path in queues.queue_paths() {
            let victims = queues.potential_victims(&path).to_vec();
            for victim in victims {
                queues.remove_allocation(&path, victim.resource());
                if remaining_is_non_negative(
                    queues.remaining_guaranteed(&self.queue_path).as_ref(),
                ) {
                    return true;
                }
            }
        }
        false
    }

    /// Computes the ordered victim list for one node and the index at which
    /// the prefix first makes the ask fit.
    ///
    /// `None` means the node is unusable; `Some((-1, []))` means the ask
    /// fits without preemption.
    fn calculate_victims_by_node(
        &self,
        node_available: &Resource,
        potential_victims: &[Arc<Allocation>],
    ) -> Option<(i32, Vec<Arc<Allocation>>)> {
        let ask_resource = self.ask.resource();
        let mut node_current_available = node_available.clone();

        // preemption may have been triggered by queue limits rather than
        // node capacity
        if node_current_available.fits_in(ask_resource) {
            return Some((-1, Vec::new()));
        }

        let Some(snapshots) = self.allocations_by_queue.as_ref() else {
            warn!("BUG: queue snapshots not initialized");
            return None;
        };
        let mut queues = snapshots.duplicate();
        if !queues.contains(&self.queue_path) {
            warn!(queue_path = %self.queue_path, "BUG: queue not found by name");
            return None;
        }

        // First pass: walk the candidates, dropping any whose removal would
        // push its queue below guarantee, and stopping once admitting more
        // would overshoot the asking queue's own guarantee. Candidates that
        // reduce the node shortfall go to the head of the list and adjust
        // the running node capacity; the rest are kept as a last resort.
        let mut head: Vec<Arc<Allocation>> = Vec::new();
        let mut tail: Vec<Arc<Allocation>> = Vec::new();
        for victim in potential_victims {
            let Some(victim_queue) = self.queue_by_alloc.get(victim.allocation_key().as_str())
            else {
                continue;
            };
            if !queues.contains(victim_queue) {
                continue;
            }

            let old_remaining = queues.remaining_guaranteed(victim_queue);
            queues.remove_allocation(victim_queue, victim.resource());
            let preemptable = queues.preemptable_resource(victim_queue);

            // the queue must have been over its guarantee before losing the
            // victim; no guarantee anywhere in its chain counts as over
            if preemptable_is_non_negative(preemptable.as_ref())
                && old_remaining
                    .as_ref()
                    .is_none_or(|r| Resource::zero().strictly_greater(r))
            {
                queues.add_allocation(&self.queue_path, victim.resource());
                let ask_remaining = queues.remaining_guaranteed(&self.queue_path);
                if ask_remaining
                    .as_ref()
                    .is_some_and(|r| Resource::zero().strictly_greater(r))
                {
                    // admitting this victim overshoots the asking queue
                    queues.remove_allocation(&self.queue_path, victim.resource());
                    queues.add_allocation(victim_queue, victim.resource());
                    break;
                }

                let shortfall = ask_resource.sub_eliminate_negative(&node_current_available);
                let new_available = node_current_available.add(victim.resource());
                let new_shortfall = ask_resource.sub_eliminate_negative(&new_available);
                if shortfall.equals_or_empty(&new_shortfall) {
                    queues.remove_allocation(&self.queue_path, victim.resource());
                    queues.add_allocation(victim_queue, victim.resource());
                    tail.push(Arc::clone(victim));
                } else {
                    node_current_available = new_available;
                    head.push(Arc::clone(victim));
                }
            } else {
                queues.add_allocation(victim_queue, victim.resource());
            }
        }
        head.extend(tail);
        if head.is_empty() {
            return None;
        }

        // Second pass: the order is now fixed. Re-validate each victim
        // against fresh queue state only (no ask-queue simulation), and
        // record the index at which the node first fits the ask.
        let mut node_current_available = node_available.clone();
        let mut queues = snapshots.duplicate();

        let mut results: Vec<Arc<Allocation>> = Vec::new();
        let mut index: i32 = -1;
        for victim in &head {
            let Some(victim_queue) = self.queue_by_alloc.get(victim.allocation_key().as_str())
            else {
                continue;
            };
            if !queues.contains(victim_queue) {
                continue;
            }

            let old_remaining = queues.remaining_guaranteed(victim_queue);
            queues.remove_allocation(victim_queue, victim.resource());
            let preemptable = queues.preemptable_resource(victim_queue);
            if preemptable_is_non_negative(preemptable.as_ref())
                && old_remaining
                    .as_ref()
                    .is_none_or(|r| Resource::zero().strictly_greater(r))
            {
                node_current_available.add_to(victim.resource());
                if index < 0 && node_current_available.fits_in(ask_resource) {
                    index = i32::try_from(results.len()).unwrap_or(i32::MAX);
                }
                results.push(Arc::clone(victim));
            } else {
                queues.add_allocation(victim_queue, victim.resource());
            }
        }

        if index < 0 {
            return None;
        }
        Some((index, results))
    }

    /// Evaluates every usable node and returns the best oracle-approved
    /// solution.
    fn try_nodes(&self) -> Option<(String, Vec<Arc<Allocation>>)> {
        let node_available = self.node_available.as_ref()?;

        let mut checks: Vec<PredicateArgs> = Vec::new();
        let mut victims_by_node: HashMap<String, Vec<Arc<Allocation>>> = HashMap::new();
        let no_allocations: Vec<Arc<Allocation>> = Vec::new();
        for (node_id, available) in node_available {
            let allocations = self
                .allocations_by_node
                .get(node_id)
                .unwrap_or(&no_allocations);
            let Some((index, victims)) = self.calculate_victims_by_node(available, allocations)
            else {
                continue;
            };
            let keys: Vec<AllocationKey> = victims
                .iter()
                .map(|victim| victim.allocation_key().clone())
                .collect();
            let victim_count = victims.len();
            victims_by_node.insert(node_id.clone(), victims);

            // a node needing no victims is only worth re-checking when
            // scheduling has not already tried it
            if victim_count > 0 || !self.nodes_tried {
                checks.push(PredicateArgs {
                    allocation_key: self.ask.allocation_key().clone(),
                    node_id: node_id.clone(),
                    preempt_allocation_keys: keys,
                    start_index: index,
                });
            }
        }

        let result = check_preemption_predicates(
            self.oracle,
            checks,
            &victims_by_node,
            &self.allocations_by_node,
            self.tunables.preempt_check_concurrency,
        )?;
        if result.success {
            Some((result.node_id, result.victims))
        } else {
            None
        }
    }

    /// Picks further queue-level victims until the asking queue's remaining
    /// guarantee is restored. Victim placement is irrelevant here; only
    /// queue accounting matters.
    fn calculate_additional_victims(
        &self,
        node_victims: &[Arc<Allocation>],
    ) -> Option<Vec<Arc<Allocation>>> {
        let Some(snapshots) = self.allocations_by_queue.as_ref() else {
            warn!("BUG: queue snapshots not initialized");
            return None;
        };
        let mut queues = snapshots.duplicate();
        if !queues.contains(&self.queue_path) {
            warn!(queue_path = %self.queue_path, "BUG: queue not found by name");
            return None;
        }

        // already-chosen node victims are treated as released
        let mut seen: HashSet<String> = HashSet::new();
        for victim in node_victims {
            if let Some(path) = self.queue_by_alloc.get(victim.allocation_key().as_str()) {
                if queues.contains(path) {
                    queues.remove_allocation(path, victim.resource());
                    seen.insert(victim.allocation_key().as_str().to_string());
                }
            }
        }

        let mut potential: Vec<Arc<Allocation>> = Vec::new();
        for path in queues.queue_paths() {
            for victim in queues.potential_victims(&path) {
                if seen.contains(victim.allocation_key().as_str()) {
                    continue;
                }
                potential.push(Arc::clone(victim));
            }
        }
        potential.sort_by(|left, right| compare_victims(left, right));

        let mut victims: Vec<Arc<Allocation>> = Vec::new();
        for victim in &potential {
            let Some(victim_queue) = self.queue_by_alloc.get(victim.allocation_key().as_str())
            else {
                continue;
            };
            if !queues.contains(victim_queue) {
                continue;
            }

            let old_remaining = queues.remaining_guaranteed(victim_queue);
            queues.remove_allocation(victim_queue, victim.resource());
            let preemptable = queues.preemptable_resource(victim_queue);
            if preemptable_is_non_negative(preemptable.as_ref())
                && old_remaining
                    .as_ref()
                    .is_none_or(|r| Resource::zero().strictly_greater(r))
            {
                let before_add = queues.remaining_guaranteed(&self.queue_path);
                queues.add_allocation(&self.queue_path, victim.resource());
                let after_add = queues.remaining_guaranteed(&self.queue_path);

                if after_add
                    .as_ref()
                    .is_some_and(|r| Resource::zero().strictly_greater(r))
                {
                    // one more victim would overshoot the asking queue
                    queues.remove_allocation(&self.queue_path, victim.resource());
                    queues.add_allocation(victim_queue, victim.resource());
                    break;
                }

                if option_equals_or_empty(before_add.as_ref(), after_add.as_ref()) {
                    // remaining guarantee did not move, the victim is useless
                    queues.remove_allocation(&self.queue_path, victim.resource());
                    queues.add_allocation(victim_queue, victim.resource());
                } else {
                    victims.push(Arc::clone(victim));
                }
            } else {
                queues.add_allocation(victim_queue, victim.resource());
            }
        }

        let final_remaining = queues.remaining_guaranteed(&self.queue_path);
        if remaining_is_non_negative(final_remaining.as_ref()) {
            Some(victims)
        } else {
            None
        }
    }

    /// Flags every final victim on its live queue and notifies the release
    /// channel. The preempting-resource increment is the only live-state
    /// write this core performs.
    fn commit(&self, final_victims: &[Arc<Allocation>]) {
        for victim in final_victims {
            if let Some(queue) = self.registry.find_queue_by_app_id(victim.application_id()) {
                queue.inc_preempting_resource(victim.resource());
                victim.mark_preempted();
                info!(
                    ask_allocation_key = %self.ask.allocation_key(),
                    ask_application_id = %self.ask.application_id(),
                    ask_queue = %self.queue_path,
                    victim_allocation_key = %victim.allocation_key(),
                    victim_application_id = %victim.application_id(),
                    victim_resource = %victim.resource(),
                    victim_node_id = %victim.node_id(),
                    victim_queue = %queue.queue_path(),
                    "preempting task"
                );
            } else {
                warn!(
                    victim_allocation_key = %victim.allocation_key(),
                    victim_application_id = %victim.application_id(),
                    "BUG: queue not found for preemption victim"
                );
            }
        }

        // don't preempt again for this ask
        self.ask.mark_triggered_preemption();

        self.release.notify_released(
            final_victims,
            TerminationType::PreemptedByScheduler,
            &format!(
                "preempting allocations to free up resources to run ask: {}",
                self.ask.allocation_key()
            ),
        );
    }
}

fn remaining_is_non_negative(remaining: Option<&Resource>) -> bool {
    remaining.is_some_and(|r| r.all_greater_or_equal(&Resource::zero()))
}

fn preemptable_is_non_negative(preemptable: Option<&Resource>) -> bool {
    preemptable.is_none_or(|p| p.all_greater_or_equal(&Resource::zero()))
}

fn option_equals_or_empty(left: Option<&Resource>, right: Option<&Resource>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => left.equals_or_empty(right),
        (Some(only), None) | (None, Some(only)) => only.is_empty(),
        (None, None) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FixedQueueRegistry, NoopReleaseHandler, StaticNodeIterator};
    use crate::snapshot::QueueSpec;
    use chrono::Duration as ChronoDuration;

    fn res(pairs: &[(&str, i64)]) -> Resource {
        pairs.iter().fold(Resource::new(), |r, (k, v)| r.with(*k, *v))
    }

    fn aged_ask(allow_preempt_other: bool) -> Arc<Allocation> {
        Arc::new(
            Allocation::new(
                AllocationKey::new("ask-1"),
                "app-ask",
                "",
                "root.tenants.a",
                res(&[("memory", 3)]),
            )
            .with_allow_preempt_other(allow_preempt_other)
            .with_create_time(Utc::now() - ChronoDuration::hours(1)),
        )
    }

    fn empty_registry() -> FixedQueueRegistry {
        FixedQueueRegistry::new(QueueSnapshots::new())
    }

    mod preconditions {
        use super::*;

        #[test]
        fn eligible_ask_passes_and_is_throttled() {
            let registry = empty_registry();
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let preemptor = Preemptor::new(
                aged_ask(true),
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );

            assert!(preemptor.check_preconditions());
            // second attempt within the frequency window is rejected
            assert!(!preemptor.check_preconditions());
        }

        #[test]
        fn ask_without_preempt_other_is_rejected() {
            let registry = empty_registry();
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let preemptor = Preemptor::new(
                aged_ask(false),
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            assert!(!preemptor.check_preconditions());
        }

        #[test]
        fn triggered_ask_is_rejected_without_touching_state() {
            let registry = empty_registry();
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let ask = aged_ask(true);
            ask.mark_triggered_preemption();
            let check_time = ask.preempt_check_time();

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
            assert_eq!(ask.preempt_check_time(), check_time);
        }

        #[test]
        fn required_node_ask_is_rejected() {
            let registry = empty_registry();
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let ask = Arc::new(
                Allocation::new(
                    AllocationKey::new("ask-1"),
                    "app-ask",
                    "",
                    "root.tenants.a",
                    res(&[("memory", 3)]),
                )
                .with_allow_preempt_other(true)
                .with_required_node("node-1")
                .with_create_time(Utc::now() - ChronoDuration::hours(1)),
            );
            let preemptor = Preemptor::new(
                ask,
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            assert!(!preemptor.check_preconditions());
        }

        #[test]
        fn young_ask_waits_for_preemption_delay() {
            let registry = empty_registry();
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let ask = Arc::new(
                Allocation::new(
                    AllocationKey::new("ask-1"),
                    "app-ask",
                    "",
                    "root.tenants.a",
                    res(&[("memory", 3)]),
                )
                .with_allow_preempt_other(true),
            );
            let preemptor = Preemptor::new(
                ask,
                Resource::new(),
                Duration::from_secs(3600),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            assert!(!preemptor.check_preconditions());
        }
    }

    mod victim_calculation {
        use super::*;

        /// root(g=10) with sibling tenants a (ask queue) and b, b over its
        /// guarantee through the given victims.
        fn preemption_fixture(
            victims: Vec<Arc<Allocation>>,
            b_allocated: Resource,
        ) -> FixedQueueRegistry {
            let mut snaps = QueueSnapshots::new();
            let total = b_allocated.clone();
            let captures = [
                QueueSpec::branch("root")
                    .with_guaranteed(res(&[("memory", 10)]))
                    .with_allocated(total.clone()),
                QueueSpec::branch("root.tenants").with_allocated(total),
                QueueSpec::leaf("root.tenants.a").with_guaranteed(res(&[("memory", 5)])),
                QueueSpec::leaf("root.tenants.b")
                    .with_guaranteed(res(&[("memory", 5)]))
                    .with_allocated(b_allocated)
                    .with_potential_victims(victims),
            ];
            for spec in captures {
                assert!(snaps.capture(spec).is_ok());
            }
            FixedQueueRegistry::new(snaps)
        }

        fn victim_on(key: &str, node: &str, queue: &str, resource: Resource) -> Arc<Allocation> {
            Arc::new(Allocation::new(
                AllocationKey::new(key),
                "app-b",
                node,
                queue,
                resource,
            ))
        }

        #[test]
        fn helpful_victim_is_committed_with_index() {
            let victim = victim_on("victim-1", "node-1", "root.tenants.b", res(&[("memory", 3)]));
            let registry =
                preemption_fixture(vec![Arc::clone(&victim)], res(&[("memory", 7)]));
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let mut preemptor = Preemptor::new(
                aged_ask(true),
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            preemptor.init_queue_snapshots();
            preemptor
                .queue_by_alloc
                .insert("victim-1".into(), "root.tenants.b".into());

            let outcome =
                preemptor.calculate_victims_by_node(&res(&[("memory", 0)]), &[victim]);
            let (index, victims) = match outcome {
                Some(pair) => pair,
                None => (i32::MIN, Vec::new()),
            };
            assert_eq!(index, 0);
            assert_eq!(victims.len(), 1);
        }

        #[test]
        fn node_that_fits_needs_no_victims() {
            let registry = preemption_fixture(Vec::new(), res(&[("memory", 7)]));
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let mut preemptor = Preemptor::new(
                aged_ask(true),
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            preemptor.init_queue_snapshots();

            let outcome = preemptor.calculate_victims_by_node(&res(&[("memory", 8)]), &[]);
            assert!(matches!(outcome, Some((-1, ref v)) if v.is_empty()));
        }

        #[test]
        fn unhelpful_small_victim_never_reaches_fit() {
            // victim frees 1 but the ask needs 3 on an empty node
            let victim = victim_on("victim-1", "node-1", "root.tenants.b", res(&[("memory", 1)]));
            let registry =
                preemption_fixture(vec![Arc::clone(&victim)], res(&[("memory", 7)]));
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let mut preemptor = Preemptor::new(
                aged_ask(true),
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            preemptor.init_queue_snapshots();
            preemptor
                .queue_by_alloc
                .insert("victim-1".into(), "root.tenants.b".into());

            let outcome =
                preemptor.calculate_victims_by_node(&res(&[("memory", 0)]), &[victim]);
            assert!(outcome.is_none());
        }

        #[test]
        fn orthogonal_resource_victim_goes_to_tail() {
            // the victim frees only vcore, the shortfall is memory: pass 1
            // keeps it as a last resort but pass 2 never reaches fit
            let victim = victim_on("victim-1", "node-1", "root.tenants.b", res(&[("vcore", 2)]));
            let registry = preemption_fixture(
                vec![Arc::clone(&victim)],
                res(&[("memory", 7), ("vcore", 2)]),
            );
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());
            let mut preemptor = Preemptor::new(
                aged_ask(true),
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            preemptor.init_queue_snapshots();
            preemptor
                .queue_by_alloc
                .insert("victim-1".into(), "root.tenants.b".into());

            let outcome =
                preemptor.calculate_victims_by_node(&res(&[("memory", 0)]), &[victim]);
            assert!(outcome.is_none());
        }

        #[test]
        fn overshooting_ask_queue_stops_pass_one() {
            // asking queue guarantee is tiny: admitting the 5-unit victim
            // would leave it negative, so pass 1 breaks with nothing
            let victim = victim_on("victim-1", "node-1", "root.b", res(&[("memory", 5)]));
            let mut snaps = QueueSnapshots::new();
            let captures = [
                QueueSpec::branch("root")
                    .with_guaranteed(res(&[("memory", 10)]))
                    .with_allocated(res(&[("memory", 9)])),
                QueueSpec::leaf("root.a").with_guaranteed(res(&[("memory", 2)])),
                QueueSpec::leaf("root.b")
                    .with_guaranteed(res(&[("memory", 8)]))
                    .with_allocated(res(&[("memory", 9)]))
                    .with_potential_victims(vec![Arc::clone(&victim)]),
            ];
            for spec in captures {
                assert!(snaps.capture(spec).is_ok());
            }
            let registry = FixedQueueRegistry::new(snaps);
            let release = NoopReleaseHandler::new();
            let mut nodes = StaticNodeIterator::new(Vec::new());

            let ask = Arc::new(
                Allocation::new(
                    AllocationKey::new("ask-1"),
                    "app-ask",
                    "",
                    "root.a",
                    res(&[("memory", 3)]),
                )
                .with_allow_preempt_other(true)
                .with_create_time(Utc::now() - ChronoDuration::hours(1)),
            );
            let mut preemptor = Preemptor::new(
                ask,
                Resource::new(),
                Duration::from_secs(0),
                &registry,
                &mut nodes,
                &release,
                false,
            );
            preemptor.init_queue_snapshots();
            preemptor
                .queue_by_alloc
                .insert("victim-1".into(), "root.b".into());

            let outcome =
                preemptor.calculate_victims_by_node(&res(&[("memory", 0)]), &[victim]);
            assert!(outcome.is_none());
        }
    }
}
