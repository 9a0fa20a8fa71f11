//! Victim ordering for stable, reproducible preemption preference.
//!
//! Two orders exist. The per-node order drives the walk over a node's
//! candidate list; the global order ranks candidates across all queues when
//! additional victims are picked. Both are total given stable sorts, so the
//! same inputs always select the same victims.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Allocation;

/// Penalty for a solution whose victim prefix overruns the candidate list.
pub const SCORE_FIT_MAX: u64 = 1 << 32;
/// Penalty for choosing an application's originating task.
pub const SCORE_ORIGINATOR: u64 = 1 << 33;
/// Penalty for choosing a task that has not opted into preemption.
pub const SCORE_NO_PREEMPT: u64 = 1 << 34;
/// Penalty for a node that does not fit the ask even after full preemption.
pub const SCORE_UNFIT: u64 = 1 << 35;

/// Relative preemption score for one allocation; lower scores make better
/// victims. Opted-in tasks rank first, application originators last. The
/// low-order bits are left free for small tie-breakers composed by callers.
#[must_use]
pub fn score_allocation(allocation: &Allocation) -> u64 {
    let mut score = 0;
    if allocation.is_originator() {
        score |= SCORE_ORIGINATOR;
    }
    if !allocation.allow_preempt_self() {
        score |= SCORE_NO_PREEMPT;
    }
    score
}

/// Global queue-wide victim order: ascending score, ties broken by later
/// creation time first (newest tasks lose the least work).
#[must_use]
pub fn compare_victims(left: &Allocation, right: &Allocation) -> Ordering {
    score_allocation(left)
        .cmp(&score_allocation(right))
        .then_with(|| right.create_time().cmp(&left.create_time()))
}

/// Per-node victim order: tasks that allow their own preemption first, then
/// non-originators, then newest first.
#[must_use]
pub fn compare_node_victims(left: &Allocation, right: &Allocation) -> Ordering {
    match (left.allow_preempt_self(), right.allow_preempt_self()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (left.is_originator(), right.is_originator()) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    right.create_time().cmp(&left.create_time())
}

/// Stable-sorts every node's candidate list into per-node victim order.
pub fn sort_victims_for_preemption(allocations_by_node: &mut HashMap<String, Vec<Arc<Allocation>>>) {
    for allocations in allocations_by_node.values_mut() {
        allocations.sort_by(|left, right| compare_node_victims(left, right));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AllocationKey;
    use chrono::{Duration, Utc};
    use talon_resources::Resource;

    fn victim(key: &str, age_secs: i64) -> Allocation {
        Allocation::new(
            AllocationKey::new(key),
            "app-1",
            "node-1",
            "root.a",
            Resource::new().with("memory", 1),
        )
        .with_create_time(Utc::now() - Duration::seconds(age_secs))
    }

    #[test]
    fn score_bits_are_disjoint() {
        assert_eq!(SCORE_FIT_MAX, 1 << 32);
        assert_eq!(SCORE_ORIGINATOR, 1 << 33);
        assert_eq!(SCORE_NO_PREEMPT, 1 << 34);
        assert_eq!(SCORE_UNFIT, 1 << 35);
    }

    #[test]
    fn score_reflects_flags() {
        assert_eq!(score_allocation(&victim("v", 0)), 0);
        assert_eq!(
            score_allocation(&victim("v", 0).with_originator(true)),
            SCORE_ORIGINATOR
        );
        assert_eq!(
            score_allocation(&victim("v", 0).with_allow_preempt_self(false)),
            SCORE_NO_PREEMPT
        );
        assert_eq!(
            score_allocation(
                &victim("v", 0)
                    .with_originator(true)
                    .with_allow_preempt_self(false)
            ),
            SCORE_ORIGINATOR | SCORE_NO_PREEMPT
        );
    }

    #[test]
    fn global_order_prefers_low_score_then_newest() {
        let opted_out = victim("old-no-preempt", 100).with_allow_preempt_self(false);
        let older = victim("older", 60);
        let newer = victim("newer", 10);

        assert_eq!(compare_victims(&newer, &opted_out), Ordering::Less);
        assert_eq!(compare_victims(&newer, &older), Ordering::Less);
        assert_eq!(compare_victims(&older, &newer), Ordering::Greater);
    }

    #[test]
    fn node_order_table() {
        let opted_in = victim("opted-in", 50);
        let opted_out = victim("opted-out", 50).with_allow_preempt_self(false);
        let originator = victim("originator", 50).with_originator(true);
        let newest = victim("newest", 1);

        // opt-in beats opt-out regardless of age
        assert_eq!(compare_node_victims(&opted_in, &opted_out), Ordering::Less);
        // non-originator beats originator
        assert_eq!(
            compare_node_victims(&originator, &opted_in),
            Ordering::Greater
        );
        // newest first among equals
        assert_eq!(compare_node_victims(&newest, &opted_in), Ordering::Less);
    }

    #[test]
    fn node_sort_is_stable_and_repeatable() {
        let build = || {
            vec![
                Arc::new(victim("originator", 30).with_originator(true)),
                Arc::new(victim("old", 90)),
                Arc::new(victim("no-preempt", 5).with_allow_preempt_self(false)),
                Arc::new(victim("new", 10)),
            ]
        };

        let order_of = |mut list: Vec<Arc<Allocation>>| {
            list.sort_by(|l, r| compare_node_victims(l, r));
            list.iter()
                .map(|a| a.allocation_key().as_str().to_string())
                .collect::<Vec<_>>()
        };

        let first = order_of(build());
        assert_eq!(first, vec!["new", "old", "originator", "no-preempt"]);
        // identical input, identical order
        assert_eq!(first, order_of(build()));
    }

    #[test]
    fn map_sort_covers_every_node() {
        let mut by_node: HashMap<String, Vec<Arc<Allocation>>> = HashMap::new();
        by_node.insert(
            "node-1".into(),
            vec![Arc::new(victim("a", 90)), Arc::new(victim("b", 10))],
        );
        by_node.insert(
            "node-2".into(),
            vec![
                Arc::new(victim("c", 5).with_originator(true)),
                Arc::new(victim("d", 50)),
            ],
        );

        sort_victims_for_preemption(&mut by_node);

        let keys = |node: &str| {
            by_node[node]
                .iter()
                .map(|a| a.allocation_key().as_str().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(keys("node-1"), vec!["b", "a"]);
        assert_eq!(keys("node-2"), vec!["d", "c"]);
    }
}
