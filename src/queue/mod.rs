//! Event priority structures.
//!
//! Four interchangeable implementations behind one contract, selected once at
//! bootstrap; the chosen instance is the only one a run ever touches, so no
//! dispatch-kind branching happens on the hot path.

use std::sync::Arc;

use crate::config::{QueueKind, SimConfig};
use crate::event::{AgentId, Event, Time};
use crate::KernelError;

pub mod ladder;
pub mod skiplist;
pub mod three_tier;
pub mod two_tier_ladder;

pub use ladder::LadderQueue;
pub use skiplist::SkipListQueue;
pub use three_tier::ThreeTierQueue;
pub use two_tier_ladder::TwoTierLadderQueue;

/// Contract shared by all priority structures.
///
/// Ownership discipline: the caller tags the input side (`retain_input`)
/// before `enqueue`; a dequeue transfers the tag to the receiver's input
/// history untouched; `cancel_after`, `remove_agent`, and `drain` release the
/// tag of every event they discard, tag first, strong handle after.
pub trait EventQueue: Send {
    /// Registration hook; only the three-tier heap needs it ahead of time.
    fn add_agent(&mut self, _agent: AgentId) {}

    /// Insert one event keyed on its receive time.
    fn enqueue(&mut self, event: Arc<Event>);

    /// The earliest event without removing it.
    fn front(&mut self) -> Option<Arc<Event>>;

    /// Receive time and receiver of the earliest event.
    fn next_time(&mut self) -> Option<(Time, AgentId)>;

    /// Remove the complete batch of events sharing the earliest receive time
    /// and its receiver, appending them to `out`.
    fn dequeue_next_agent_batch(&mut self, out: &mut Vec<Arc<Event>>);

    /// Remove every event from `sender` with sent time `>= sent`, across the
    /// whole structure. Returns how many were cancelled; a released input
    /// tag hitting zero twice is a fatal invariant violation.
    fn cancel_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError>;

    /// Remove every event destined to `receiver` (deregistration). Returns
    /// how many were removed.
    fn remove_agent(&mut self, receiver: AgentId) -> Result<usize, KernelError>;

    /// Discard everything; used at finalize. Returns how many were dropped.
    fn drain(&mut self) -> Result<usize, KernelError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the structure the configuration asked for.
pub fn make_queue(config: &SimConfig) -> Box<dyn EventQueue> {
    match config.queue {
        QueueKind::ThreeTier => Box::new(ThreeTierQueue::new()),
        QueueKind::Ladder => Box::new(LadderQueue::new(config.lq_max_rungs)),
        QueueKind::TwoTierLadder => {
            Box::new(TwoTierLadderQueue::new(config.lq_max_rungs, config.lq_t2k))
        }
        QueueKind::LockFreeSkip => Box::new(SkipListQueue::new(
            config.lfpq_max_offset,
            config.max_threads,
        )),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::event::queue_order;

    pub fn ev(sender: AgentId, receiver: AgentId, sent: Time, recv: Time) -> Arc<Event> {
        let e = Event::new(sender, receiver, sent, recv, vec![]).unwrap();
        e.retain_input();
        e
    }

    /// The stable-sort dequeue law shared by every implementation: with no
    /// cancellations, batches drain in nondecreasing (recv, receiver) order
    /// and every enqueued event comes back exactly once.
    pub fn check_dequeue_law(queue: &mut dyn EventQueue, mut events: Vec<Arc<Event>>) {
        let total = events.len();
        for e in &events {
            queue.enqueue(Arc::clone(e));
        }
        assert_eq!(queue.len(), total);

        let mut drained: Vec<Arc<Event>> = Vec::with_capacity(total);
        let mut batch = Vec::new();
        while !queue.is_empty() {
            batch.clear();
            queue.dequeue_next_agent_batch(&mut batch);
            assert!(!batch.is_empty());
            let t = batch[0].recv_time();
            let who = batch[0].receiver();
            for e in &batch {
                assert_eq!(e.recv_time(), t);
                assert_eq!(e.receiver(), who);
            }
            if let Some(prev) = drained.last() {
                assert!(
                    prev.recv_time() <= t,
                    "dequeue went backwards: {} after {}",
                    t,
                    prev.recv_time()
                );
            }
            drained.append(&mut batch);
        }
        assert_eq!(drained.len(), total);

        events.sort_by(|a, b| queue_order(a, b));
        let mut sorted_drained = drained.clone();
        sorted_drained.sort_by(|a, b| queue_order(a, b));
        for (a, b) in events.iter().zip(sorted_drained.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        for e in drained {
            e.release_input().unwrap();
        }
    }
}
