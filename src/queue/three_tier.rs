//! Three-tier heap: a binary heap of agents over per-agent receive-time
//! buckets over event lists.
//!
//! Tier 1 is a hand-rolled min-heap keyed on each agent's next receive time
//! with a deterministic agent-id tie-break. Every sift writes the agent's new
//! slot into a cross-reference table, so re-keying one agent after an enqueue
//! or a batch dequeue costs one O(log A) sift instead of a search.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::event::{AgentId, Event, Time, TimeKey, TIME_INFINITY};
use crate::queue::EventQueue;
use crate::KernelError;

/// Tier 2 and 3: receive-time buckets for one agent. A bucket holds every
/// pending event with that exact receive time, dequeued as one batch.
#[derive(Default)]
struct AgentBuckets {
    buckets: BTreeMap<TimeKey, Vec<Arc<Event>>>,
    count: usize,
}

impl AgentBuckets {
    fn next_time(&self) -> Time {
        self.buckets
            .keys()
            .next()
            .map(|k| k.0)
            .unwrap_or(TIME_INFINITY)
    }

    fn push(&mut self, event: Arc<Event>) {
        self.buckets
            .entry(TimeKey(event.recv_time()))
            .or_default()
            .push(event);
        self.count += 1;
    }

    fn pop_bucket(&mut self) -> Option<Vec<Arc<Event>>> {
        let bucket = self.buckets.pop_first().map(|(_, b)| b);
        if let Some(b) = &bucket {
            self.count -= b.len();
        }
        bucket
    }

    fn cancel_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let mut removed = 0;
        for bucket in self.buckets.values_mut() {
            let mut idx = 0;
            while idx < bucket.len() {
                if bucket[idx].sender() == sender && bucket[idx].sent_time() >= sent {
                    let event = bucket.swap_remove(idx);
                    event.release_input()?;
                    removed += 1;
                } else {
                    idx += 1;
                }
            }
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        self.count -= removed;
        Ok(removed)
    }

    fn drain(&mut self) -> Result<usize, KernelError> {
        let mut dropped = 0;
        for (_, bucket) in std::mem::take(&mut self.buckets) {
            for e in bucket {
                e.release_input()?;
                dropped += 1;
            }
        }
        self.count = 0;
        Ok(dropped)
    }
}

/// The default single-thread priority structure.
pub struct ThreeTierQueue {
    /// Tier-1 heap of agent ids, ordered by (next receive time, agent id).
    heap: Vec<AgentId>,
    /// Cross-reference handles: agent id to its current tier-1 slot.
    slots: HashMap<AgentId, usize>,
    agents: HashMap<AgentId, AgentBuckets>,
    count: usize,
}

impl ThreeTierQueue {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
            agents: HashMap::new(),
            count: 0,
        }
    }

    fn key(&self, agent: AgentId) -> (Time, AgentId) {
        let t = self
            .agents
            .get(&agent)
            .map(|b| b.next_time())
            .unwrap_or(TIME_INFINITY);
        (t, agent)
    }

    fn before(&self, a: AgentId, b: AgentId) -> bool {
        let (ta, ia) = self.key(a);
        let (tb, ib) = self.key(b);
        match ta.total_cmp(&tb) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => ia < ib,
        }
    }

    fn place(&mut self, idx: usize) {
        let agent = self.heap[idx];
        self.slots.insert(agent, idx);
    }

    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.before(self.heap[idx], self.heap[parent]) {
                self.heap.swap(idx, parent);
                self.place(idx);
                idx = parent;
            } else {
                break;
            }
        }
        self.place(idx);
        idx
    }

    fn sift_down(&mut self, mut idx: usize) -> usize {
        loop {
            let left = 2 * idx + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < self.heap.len() && self.before(self.heap[right], self.heap[left]) {
                best = right;
            }
            if self.before(self.heap[best], self.heap[idx]) {
                self.heap.swap(idx, best);
                self.place(idx);
                idx = best;
            } else {
                break;
            }
        }
        self.place(idx);
        idx
    }

    /// Restore heap order around one agent after its next-time changed.
    fn update_heap(&mut self, agent: AgentId) {
        let idx = match self.slots.get(&agent) {
            Some(&i) => i,
            None => return,
        };
        let idx = self.sift_up(idx);
        self.sift_down(idx);
    }

    fn ensure_agent(&mut self, agent: AgentId) {
        if self.agents.contains_key(&agent) {
            return;
        }
        self.agents.insert(agent, AgentBuckets::default());
        self.heap.push(agent);
        let idx = self.heap.len() - 1;
        self.place(idx);
        self.sift_up(idx);
    }

    fn rebuild_heap(&mut self) {
        if self.heap.is_empty() {
            return;
        }
        for idx in (0..self.heap.len() / 2).rev() {
            self.sift_down(idx);
        }
        for idx in 0..self.heap.len() {
            self.place(idx);
        }
    }
}

impl Default for ThreeTierQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue for ThreeTierQueue {
    fn add_agent(&mut self, agent: AgentId) {
        self.ensure_agent(agent);
    }

    fn enqueue(&mut self, event: Arc<Event>) {
        let agent = event.receiver();
        self.ensure_agent(agent);
        if let Some(buckets) = self.agents.get_mut(&agent) {
            buckets.push(event);
        }
        self.count += 1;
        self.update_heap(agent);
    }

    fn front(&mut self) -> Option<Arc<Event>> {
        if self.count == 0 {
            return None;
        }
        let agent = *self.heap.first()?;
        self.agents
            .get(&agent)
            .and_then(|b| b.buckets.values().next())
            .and_then(|bucket| bucket.first())
            .map(Arc::clone)
    }

    fn next_time(&mut self) -> Option<(Time, AgentId)> {
        if self.count == 0 {
            return None;
        }
        let agent = *self.heap.first()?;
        let t = self.agents.get(&agent)?.next_time();
        Some((t, agent))
    }

    fn dequeue_next_agent_batch(&mut self, out: &mut Vec<Arc<Event>>) {
        if self.count == 0 {
            return;
        }
        let agent = match self.heap.first() {
            Some(&a) => a,
            None => return,
        };
        if let Some(bucket) = self.agents.get_mut(&agent).and_then(|b| b.pop_bucket()) {
            self.count -= bucket.len();
            out.extend(bucket);
        }
        self.update_heap(agent);
    }

    fn cancel_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let mut removed = 0;
        for buckets in self.agents.values_mut() {
            removed += buckets.cancel_after(sender, sent)?;
        }
        if removed > 0 {
            self.count -= removed;
            self.rebuild_heap();
        }
        Ok(removed)
    }

    fn remove_agent(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let removed = match self.agents.get_mut(&receiver) {
            Some(buckets) => buckets.drain()?,
            None => 0,
        };
        self.count -= removed;
        // The agent stays in tier 1 with an empty bucket map and sinks to the
        // bottom of the heap.
        self.update_heap(receiver);
        Ok(removed)
    }

    fn drain(&mut self) -> Result<usize, KernelError> {
        let mut dropped = 0;
        for buckets in self.agents.values_mut() {
            dropped += buckets.drain()?;
        }
        self.count = 0;
        self.rebuild_heap();
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::testutil::{check_dequeue_law, ev};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn batches_group_simultaneous_events_per_agent() {
        let mut q = ThreeTierQueue::new();
        for agent in [1u64, 2] {
            q.add_agent(agent);
        }
        q.enqueue(ev(9, 1, 0.0, 5.0));
        q.enqueue(ev(8, 1, 0.0, 5.0));
        q.enqueue(ev(9, 2, 0.0, 5.0));
        q.enqueue(ev(9, 1, 0.0, 6.0));

        let mut batch = Vec::new();
        q.dequeue_next_agent_batch(&mut batch);
        // Agent 1 wins the id tie-break and yields both time-5 events at once.
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.receiver() == 1 && e.recv_time() == 5.0));

        batch.clear();
        q.dequeue_next_agent_batch(&mut batch);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receiver(), 2);
        batch.clear();
        q.dequeue_next_agent_batch(&mut batch);
        assert_eq!(batch[0].recv_time(), 6.0);
    }

    #[test]
    fn cross_reference_slots_track_sifts() {
        let mut q = ThreeTierQueue::new();
        for agent in 0..16u64 {
            q.add_agent(agent);
            q.enqueue(ev(99, agent, 0.0, 100.0 - agent as f64));
        }
        for (agent, slot) in &q.slots {
            assert_eq!(q.heap[*slot], *agent);
        }
        // Agent 15 holds the minimum; make agent 3 earlier and check it
        // surfaces.
        q.enqueue(ev(99, 3, 0.0, 1.0));
        assert_eq!(q.next_time(), Some((1.0, 3)));
        for (agent, slot) in &q.slots {
            assert_eq!(q.heap[*slot], *agent);
        }
    }

    #[test]
    fn dequeue_law_holds_on_random_workload() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut events = Vec::new();
        for i in 0..500 {
            let receiver = rng.gen_range(0..10u64);
            let recv = rng.gen_range(0..50u64) as f64;
            events.push(ev(100 + i, receiver, 0.0, recv));
        }
        let mut q = ThreeTierQueue::new();
        check_dequeue_law(&mut q, events);
    }

    #[test]
    fn cancel_after_removes_only_matching_sender() {
        let mut q = ThreeTierQueue::new();
        q.enqueue(ev(1, 5, 2.0, 4.0));
        q.enqueue(ev(1, 6, 3.0, 7.0));
        q.enqueue(ev(2, 5, 3.0, 6.0));
        q.enqueue(ev(1, 5, 1.0, 3.0));
        let removed = q.cancel_after(1, 2.0).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(q.len(), 2);
        // The survivor from sender 1 was sent before the cutoff.
        assert_eq!(q.next_time(), Some((3.0, 5)));
    }

    #[test]
    fn remove_agent_empties_its_buckets() {
        let mut q = ThreeTierQueue::new();
        q.enqueue(ev(1, 5, 0.0, 4.0));
        q.enqueue(ev(1, 5, 0.0, 9.0));
        q.enqueue(ev(1, 6, 0.0, 5.0));
        assert_eq!(q.remove_agent(5).unwrap(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_time(), Some((5.0, 6)));
    }
}
