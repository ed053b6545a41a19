//! The four bounded priority queues owned by one DQM.
//!
//! Enqueue never blocks: a full tier rejects the item so the submitter can
//! fail fast with `QueueFull`. Dequeue applies strict tier priority
//! (Cached, Fast, Medium, Slow) and FIFO within a tier. The queues are the
//! only mutable state shared between workers; the mutex is never held
//! across an await point.

#![allow(
    clippy::indexing_slicing,
    reason = "queues are a fixed four-element array indexed by Tier::index"
)]

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use super::work::{Tier, WorkItem};

pub(crate) struct TierQueues {
    queues: Mutex<[VecDeque<WorkItem>; 4]>,
    capacity: usize,
    notify: Notify,
}

impl TierQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item onto its tier, or hand it back when the tier is at
    /// capacity.
    pub(crate) fn push(&self, item: WorkItem) -> Result<(), WorkItem> {
        {
            let mut queues = self.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let queue = &mut queues[item.tier.index()];
            if queue.len() >= self.capacity {
                return Err(item);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the highest-priority eligible item for a worker.
    ///
    /// Non-lead workers never take lead-only items, and while a migration
    /// is active they stay off the Slow tier entirely; the lead serves only
    /// the migration during that window.
    pub(crate) fn pop(&self, lead: bool, migration_active: bool) -> Option<WorkItem> {
        let mut queues = self.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut found: Option<WorkItem> = None;
        for tier in Tier::PRIORITY {
            if migration_active && !lead && tier == Tier::Slow {
                continue;
            }
            let queue = &mut queues[tier.index()];
            let eligible = |item: &WorkItem| {
                if migration_active && lead {
                    item.lead_only
                } else {
                    lead || !item.lead_only
                }
            };
            if let Some(position) = queue.iter().position(eligible) {
                found = queue.remove(position);
                break;
            }
        }
        if found.is_some() && queues.iter().any(|q| !q.is_empty()) {
            // Another item is waiting; pass the wakeup on.
            self.notify.notify_one();
        }
        found
    }

    /// Wait for a wakeup after an empty pop.
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wake every worker, used on shutdown.
    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Remove every queued item, used when draining.
    pub(crate) fn drain(&self) -> Vec<WorkItem> {
        let mut queues = self.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out = Vec::new();
        for queue in queues.iter_mut() {
            out.extend(queue.drain(..));
        }
        out
    }

    /// Queue depths indexed by [`Tier::index`].
    pub(crate) fn depths(&self) -> [usize; 4] {
        let queues = self.queues.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        std::array::from_fn(|i| queues[i].len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use proptest::prelude::*;
    use rstest::rstest;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::*;
    use crate::dqm::work::{Payload, RetryPolicy};

    fn item(id: u64, tier: Tier) -> WorkItem {
        let (responder, _rx) = oneshot::channel();
        WorkItem {
            id,
            query_ref: 0,
            tier,
            payload: Payload::Query {
                sql: String::new(),
                params: Vec::new(),
                transactional: false,
            },
            deadline: Instant::now() + std::time::Duration::from_secs(30),
            retry: RetryPolicy::default(),
            lead_only: false,
            cancel: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicBool::new(false)),
            responder,
        }
    }

    #[rstest]
    fn strict_priority_across_tiers() {
        let queues = TierQueues::new(8);
        queues.push(item(1, Tier::Slow)).unwrap();
        queues.push(item(2, Tier::Medium)).unwrap();
        queues.push(item(3, Tier::Fast)).unwrap();
        queues.push(item(4, Tier::Cached)).unwrap();
        let order: Vec<u64> = std::iter::from_fn(|| queues.pop(true, false).map(|i| i.id)).collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
    }

    #[rstest]
    fn fifo_within_a_tier() {
        let queues = TierQueues::new(8);
        for id in 0..5 {
            queues.push(item(id, Tier::Fast)).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| queues.pop(false, false).map(|i| i.id)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[rstest]
    fn full_tier_rejects_without_blocking() {
        let queues = TierQueues::new(2);
        queues.push(item(1, Tier::Fast)).unwrap();
        queues.push(item(2, Tier::Fast)).unwrap();
        assert!(queues.push(item(3, Tier::Fast)).is_err());
        // Other tiers have independent capacity.
        queues.push(item(4, Tier::Slow)).unwrap();
    }

    #[rstest]
    fn non_lead_skips_lead_only_items() {
        let queues = TierQueues::new(8);
        let mut migration = item(1, Tier::Slow);
        migration.lead_only = true;
        queues.push(migration).unwrap();
        queues.push(item(2, Tier::Slow)).unwrap();
        assert_eq!(queues.pop(false, false).map(|i| i.id), Some(2));
        assert_eq!(queues.pop(true, false).map(|i| i.id), Some(1));
    }

    #[rstest]
    fn migration_window_restricts_both_sides() {
        let queues = TierQueues::new(8);
        let mut migration = item(1, Tier::Slow);
        migration.lead_only = true;
        queues.push(migration).unwrap();
        queues.push(item(2, Tier::Slow)).unwrap();
        queues.push(item(3, Tier::Fast)).unwrap();
        // Non-lead workers stay off the Slow tier but serve the read tiers.
        assert_eq!(queues.pop(false, true).map(|i| i.id), Some(3));
        assert_eq!(queues.pop(false, true).map(|i| i.id), None);
        // The lead serves only the migration.
        assert_eq!(queues.pop(true, true).map(|i| i.id), Some(1));
        assert_eq!(queues.pop(true, true).map(|i| i.id), None);
    }

    proptest! {
        /// Dequeue order within one tier is a prefix-preserving subsequence
        /// of enqueue order, whatever mix of tiers is pushed.
        #[test]
        fn dequeue_is_fifo_per_tier(tiers in proptest::collection::vec(0usize..4, 0..64)) {
            let queues = TierQueues::new(64);
            for (id, tier) in tiers.iter().enumerate() {
                let tier = [Tier::Slow, Tier::Medium, Tier::Fast, Tier::Cached][*tier];
                queues.push(item(id as u64, tier)).unwrap();
            }
            let mut last_seen: [Option<u64>; 4] = [None; 4];
            while let Some(popped) = queues.pop(true, false) {
                let slot = &mut last_seen[popped.tier.index()];
                if let Some(previous) = slot {
                    prop_assert!(popped.id > *previous);
                }
                *slot = Some(popped.id);
            }
        }
    }
}
