//! Ladder queue: an unsorted `Top` for the far future, a bounded stack of
//! bucketed `Rung`s, and a small fully sorted `Bottom` that feeds dequeues.
//!
//! Buckets too large to sort cheaply are carved into finer rungs, halving the
//! bucket width each spawn, until either the bucket drops under the split
//! threshold or the rung cap is hit; then it is sorted into bottom wholesale.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::event::{queue_order, AgentId, Event, Time, TIME_INFINITY};
use crate::queue::EventQueue;
use crate::KernelError;

/// Bucket split threshold: a carved bucket bigger than this spawns a rung.
pub(crate) const THRESH: usize = 50;
/// Rung bucket widths never shrink below this.
pub(crate) const MIN_BUCKET_WIDTH: f64 = 0.1;
/// Bottom sizes past this draw a capacity-pressure diagnostic.
const BOTTOM_SOFT_CAP: usize = 50_000;

/// Unsorted event list with range tracking; tier-3 of a rung.
#[derive(Default)]
struct Bucket {
    list: Vec<Arc<Event>>,
}

impl Bucket {
    fn push(&mut self, event: Arc<Event>) {
        self.list.push(event);
    }

    fn len(&self) -> usize {
        self.list.len()
    }

    fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn remove_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.list.len() {
            if self.list[idx].sender() == sender && self.list[idx].sent_time() >= sent {
                let event = self.list.swap_remove(idx);
                event.release_input()?;
                removed += 1;
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.list.len() {
            if self.list[idx].receiver() == receiver {
                let event = self.list.swap_remove(idx);
                event.release_input()?;
                removed += 1;
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }
}

/// Events at or beyond `top_start` live here unsorted until the ladder next
/// refills from the top.
struct Top {
    events: Vec<Arc<Event>>,
    min_ts: Time,
    max_ts: Time,
    top_start: Time,
}

impl Top {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            min_ts: TIME_INFINITY,
            max_ts: 0.0,
            top_start: 0.0,
        }
    }

    fn reset(&mut self, start: Time) {
        self.min_ts = TIME_INFINITY;
        self.max_ts = 0.0;
        self.top_start = start;
    }

    fn add(&mut self, event: Arc<Event>) {
        self.min_ts = self.min_ts.min(event.recv_time());
        self.max_ts = self.max_ts.max(event.recv_time());
        self.events.push(event);
    }

    /// Width that spreads the current contents across one bucket each.
    fn bucket_width(&self) -> f64 {
        if self.events.len() <= 1 {
            return MIN_BUCKET_WIDTH;
        }
        (self.max_ts - self.min_ts + self.events.len() as f64 - 1.0) / self.events.len() as f64
    }

    fn remove_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.events.len() {
            if self.events[idx].sender() == sender && self.events[idx].sent_time() >= sent {
                let event = self.events.swap_remove(idx);
                event.release_input()?;
                removed += 1;
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.events.len() {
            if self.events[idx].receiver() == receiver {
                let event = self.events.swap_remove(idx);
                event.release_input()?;
                removed += 1;
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }
}

/// One rung: equal-width buckets covering `[r_start, r_start + n*width)`.
struct Rung {
    buckets: Vec<Bucket>,
    r_start: Time,
    r_curr: Time,
    width: f64,
    curr_bucket: usize,
    count: usize,
}

impl Rung {
    fn from_events(events: Vec<Arc<Event>>, min_ts: Time, width: f64) -> Self {
        let mut rung = Self {
            buckets: Vec::new(),
            r_start: min_ts,
            r_curr: min_ts,
            width: width.max(MIN_BUCKET_WIDTH),
            curr_bucket: 0,
            count: 0,
        };
        for event in events {
            rung.enqueue(event);
        }
        rung
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn curr_time(&self) -> Time {
        self.r_curr
    }

    fn max_time(&self) -> Time {
        self.r_start + self.buckets.len() as f64 * self.width
    }

    fn bucket_index(&self, recv: Time) -> usize {
        ((recv - self.r_start) / self.width) as usize
    }

    fn can_contain(&self, event: &Event) -> bool {
        let recv = event.recv_time();
        recv >= self.r_start && self.bucket_index(recv) >= self.curr_bucket
    }

    fn enqueue(&mut self, event: Arc<Event>) {
        let idx = self.bucket_index(event.recv_time());
        if idx >= self.buckets.len() {
            self.buckets.resize_with(idx + 1, Bucket::default);
        }
        self.buckets[idx].push(event);
        self.count += 1;
    }

    /// Pop the next non-empty bucket, returning it with its start time.
    fn remove_next_bucket(&mut self) -> (Bucket, Time) {
        while self.curr_bucket < self.buckets.len() && self.buckets[self.curr_bucket].is_empty() {
            self.curr_bucket += 1;
        }
        debug_assert!(self.curr_bucket < self.buckets.len());
        let taken = std::mem::take(&mut self.buckets[self.curr_bucket]);
        self.count -= taken.len();
        let bkt_time = self.r_start + self.curr_bucket as f64 * self.width;
        self.curr_bucket += 1;
        self.r_curr = self.r_start + self.curr_bucket as f64 * self.width;
        (taken, bkt_time)
    }

    fn remove_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        if self.is_empty() || sent > self.max_time() {
            return Ok(0);
        }
        let mut removed = 0;
        for idx in self.curr_bucket..self.buckets.len() {
            if !self.buckets[idx].is_empty()
                && self.r_start + (idx as f64 + 1.0) * self.width >= sent
            {
                removed += self.buckets[idx].remove_after(sender, sent)?;
            }
        }
        self.count -= removed;
        Ok(removed)
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = 0;
        for idx in self.curr_bucket..self.buckets.len() {
            removed += self.buckets[idx].remove_receiver(receiver)?;
        }
        self.count -= removed;
        Ok(removed)
    }
}

/// Sorted dequeue staging area; holds at most a carved bucket's worth.
struct Bottom {
    sel: VecDeque<Arc<Event>>,
}

impl Bottom {
    fn new() -> Self {
        Self {
            sel: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.sel.len()
    }

    fn is_empty(&self) -> bool {
        self.sel.is_empty()
    }

    fn insert(&mut self, event: Arc<Event>) {
        let idx = self
            .sel
            .partition_point(|e| queue_order(e, &event) != std::cmp::Ordering::Greater);
        self.sel.insert(idx, event);
    }

    fn absorb(&mut self, bucket: Bucket) {
        let mut list = bucket.list;
        list.sort_by(|a, b| queue_order(a, b));
        if self.sel.is_empty() {
            self.sel = list.into();
        } else {
            for event in list {
                self.insert(event);
            }
        }
    }

    fn front(&self) -> Option<&Arc<Event>> {
        self.sel.front()
    }

    fn min_time(&self) -> Time {
        self.sel.front().map(|e| e.recv_time()).unwrap_or(0.0)
    }

    fn max_time(&self) -> Time {
        self.sel
            .back()
            .map(|e| e.recv_time())
            .unwrap_or(TIME_INFINITY)
    }

    fn time_range(&self) -> Time {
        if self.sel.len() < 2 {
            0.0
        } else {
            self.max_time() - self.min_time()
        }
    }

    /// Width that would spread the current contents one event per bucket.
    fn bucket_width(&self) -> f64 {
        if self.sel.len() <= 1 {
            return MIN_BUCKET_WIDTH;
        }
        (self.max_time() - self.min_time() + self.sel.len() as f64 - 1.0) / self.sel.len() as f64
    }

    fn dequeue_batch(&mut self, out: &mut Vec<Arc<Event>>) {
        let (receiver, time) = match self.sel.front() {
            Some(e) => (e.receiver(), e.recv_time()),
            None => return,
        };
        while self
            .sel
            .front()
            .map_or(false, |e| e.receiver() == receiver && e.recv_time() == time)
        {
            if let Some(e) = self.sel.pop_front() {
                out.push(e);
            }
        }
    }

    fn remove_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        if sent > self.max_time() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.sel.len() {
            if self.sel[idx].sender() == sender && self.sel[idx].sent_time() >= sent {
                if let Some(event) = self.sel.remove(idx) {
                    event.release_input()?;
                    removed += 1;
                }
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.sel.len() {
            if self.sel[idx].receiver() == receiver {
                if let Some(event) = self.sel.remove(idx) {
                    event.release_input()?;
                    removed += 1;
                }
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }

    fn take_all(&mut self) -> Vec<Arc<Event>> {
        std::mem::take(&mut self.sel).into()
    }
}

/// Bucketed multi-rung priority queue, optimized for bursts of near-future
/// events.
pub struct LadderQueue {
    top: Top,
    ladder: Vec<Rung>,
    bottom: Bottom,
    ladder_count: usize,
    max_rungs: usize,
    bottom_warned: bool,
}

impl LadderQueue {
    pub fn new(max_rungs: usize) -> Self {
        Self {
            top: Top::new(),
            ladder: Vec::new(),
            bottom: Bottom::new(),
            ladder_count: 0,
            max_rungs,
            bottom_warned: false,
        }
    }

    /// How many rungs are currently allocated; test hook for the rung cap.
    pub fn rung_count(&self) -> usize {
        self.ladder.len()
    }

    fn insert(&mut self, event: Arc<Event>) {
        if event.recv_time() > self.top.top_start {
            self.top.add(event);
            return;
        }
        // Find the first rung whose remaining range covers the event.
        for rung in self.ladder.iter_mut() {
            if rung.can_contain(&event) {
                rung.enqueue(event);
                self.ladder_count += 1;
                return;
            }
        }
        // Rollback replays can pile events up in bottom; re-bucket them into
        // a fresh rung when it gets expensive to keep sorted.
        if self.bottom.len() > THRESH
            && self.bottom.time_range() > 0.0
            && self.ladder.len() < self.max_rungs
        {
            self.create_rung_from_bottom();
            if let Some(rung) = self.ladder.last_mut() {
                if rung.can_contain(&event) {
                    rung.enqueue(event);
                    self.ladder_count += 1;
                    return;
                }
            }
        }
        if self.bottom.len() > BOTTOM_SOFT_CAP && !self.bottom_warned {
            self.bottom_warned = true;
            warn!(
                size = self.bottom.len(),
                min = self.bottom.min_time(),
                max = self.bottom.max_time(),
                rungs = self.ladder.len(),
                "ladder bottom under capacity pressure"
            );
        } else if self.bottom.len() <= BOTTOM_SOFT_CAP {
            self.bottom_warned = false;
        }
        self.bottom.insert(event);
    }

    fn create_rung_from_bottom(&mut self) {
        let width = match self.ladder.last() {
            Some(rung) => rung.width,
            None => self.bottom.bucket_width(),
        };
        // Replayed events can sit below the last rung's current time, so the
        // new rung starts at whichever is older.
        let ladder_floor = self
            .ladder
            .last()
            .map(|r| r.curr_time())
            .unwrap_or(TIME_INFINITY);
        let r_start = ladder_floor.min(self.bottom.min_time());
        let events = self.bottom.take_all();
        let n = events.len() as f64;
        let bkt_width = (width + n - 1.0) / n;
        self.ladder_count += events.len();
        self.ladder.push(Rung::from_events(events, r_start, bkt_width));
    }

    /// Carve buckets off the last rung, spawning finer rungs for oversized
    /// ones, until a sortable bucket emerges.
    fn recurse_rung(&mut self) -> Bucket {
        loop {
            let spawn_cap = self.ladder.len() < self.max_rungs;
            let rung = self
                .ladder
                .last_mut()
                .unwrap_or_else(|| unreachable!("recurse_rung on empty ladder"));
            let (bucket, bkt_time) = rung.remove_next_bucket();
            if bucket.len() > THRESH && spawn_cap && rung.width > MIN_BUCKET_WIDTH {
                let width = (rung.width + bucket.len() as f64 - 1.0) / bucket.len() as f64;
                self.ladder
                    .push(Rung::from_events(bucket.list, bkt_time, width));
                continue;
            }
            self.ladder_count -= bucket.len();
            return bucket;
        }
    }

    /// Refill bottom from the ladder (and the ladder from top) so dequeues
    /// always come off a sorted run.
    fn populate_bottom(&mut self) {
        while self.bottom.is_empty() {
            while matches!(self.ladder.last(), Some(r) if r.is_empty()) {
                self.ladder.pop();
            }
            if self.ladder_count == 0 {
                self.ladder.clear();
                if self.top.events.is_empty() {
                    return;
                }
                let width = self.top.bucket_width().max(MIN_BUCKET_WIDTH);
                let min_ts = self.top.min_ts;
                let next_start = self.top.max_ts;
                let events = std::mem::take(&mut self.top.events);
                self.ladder_count += events.len();
                self.top.reset(next_start);
                self.ladder.push(Rung::from_events(events, min_ts, width));
            }
            let bucket = self.recurse_rung();
            self.bottom.absorb(bucket);
        }
    }
}

impl EventQueue for LadderQueue {
    fn enqueue(&mut self, event: Arc<Event>) {
        self.insert(event);
    }

    fn front(&mut self) -> Option<Arc<Event>> {
        self.populate_bottom();
        self.bottom.front().map(Arc::clone)
    }

    fn next_time(&mut self) -> Option<(Time, AgentId)> {
        self.populate_bottom();
        self.bottom.front().map(|e| (e.recv_time(), e.receiver()))
    }

    fn dequeue_next_agent_batch(&mut self, out: &mut Vec<Arc<Event>>) {
        self.populate_bottom();
        self.bottom.dequeue_batch(out);
    }

    fn cancel_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let mut removed = self.top.remove_after(sender, sent)?;
        for rung in self.ladder.iter_mut() {
            let r = rung.remove_after(sender, sent)?;
            self.ladder_count -= r;
            removed += r;
        }
        Ok(removed + self.bottom.remove_after(sender, sent)?)
    }

    fn remove_agent(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = self.top.remove_receiver(receiver)?;
        for rung in self.ladder.iter_mut() {
            let r = rung.remove_receiver(receiver)?;
            self.ladder_count -= r;
            removed += r;
        }
        Ok(removed + self.bottom.remove_receiver(receiver)?)
    }

    fn drain(&mut self) -> Result<usize, KernelError> {
        let mut dropped = 0;
        for e in std::mem::take(&mut self.top.events) {
            e.release_input()?;
            dropped += 1;
        }
        self.top.reset(0.0);
        for mut rung in std::mem::take(&mut self.ladder) {
            for bucket in rung.buckets.drain(..) {
                for e in bucket.list {
                    e.release_input()?;
                    dropped += 1;
                }
            }
        }
        self.ladder_count = 0;
        for e in self.bottom.take_all() {
            e.release_input()?;
            dropped += 1;
        }
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.top.events.len() + self.ladder_count + self.bottom.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::testutil::{check_dequeue_law, ev};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn dequeue_law_holds_on_random_workload() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut events = Vec::new();
        for i in 0..800 {
            let receiver = rng.gen_range(0..20u64);
            let recv = rng.gen_range(0.0..200.0f64);
            events.push(ev(1000 + i, receiver, 0.0, recv));
        }
        let mut q = LadderQueue::new(8);
        check_dequeue_law(&mut q, events);
    }

    #[test]
    fn overflow_burst_stays_within_rung_cap_and_sorted() {
        // Ladder overflow scenario: 10k events for one receiver, uniform
        // receive times in [0, 1).
        let mut rng = StdRng::seed_from_u64(42);
        let mut q = LadderQueue::new(8);
        for i in 0..10_000u64 {
            q.enqueue(ev(i, 1, 0.0, rng.gen_range(0.0..1.0f64)));
        }
        let mut total = 0;
        let mut last = f64::NEG_INFINITY;
        let mut batch = Vec::new();
        while !q.is_empty() {
            assert!(q.rung_count() <= 8, "rung cap exceeded: {}", q.rung_count());
            batch.clear();
            q.dequeue_next_agent_batch(&mut batch);
            assert!(!batch.is_empty());
            assert!(batch[0].recv_time() >= last);
            last = batch[0].recv_time();
            total += batch.len();
            for e in &batch {
                e.release_input().unwrap();
            }
        }
        assert_eq!(total, 10_000);
    }

    #[test]
    fn cancel_after_reaches_all_three_regions() {
        let mut q = LadderQueue::new(8);
        // Force an initial spread: far-future events land in top.
        q.enqueue(ev(7, 1, 5.0, 90.0));
        q.enqueue(ev(7, 1, 6.0, 95.0));
        q.enqueue(ev(8, 1, 0.0, 50.0));
        // Dequeue once so the ladder and bottom materialize.
        let mut batch = Vec::new();
        q.dequeue_next_agent_batch(&mut batch);
        for e in batch.drain(..) {
            e.release_input().unwrap();
        }
        q.enqueue(ev(7, 2, 7.0, 60.0));
        let removed = q.cancel_after(7, 5.0).unwrap();
        assert_eq!(removed, 3);
        assert!(q.is_empty() || q.front().map(|e| e.sender()) == Some(8));
    }

    #[test]
    fn requeue_below_current_rung_goes_to_bottom() {
        let mut q = LadderQueue::new(8);
        for i in 0..200u64 {
            q.enqueue(ev(i, 1, 0.0, 10.0 + i as f64));
        }
        let mut batch = Vec::new();
        q.dequeue_next_agent_batch(&mut batch);
        assert_eq!(batch[0].recv_time(), 10.0);
        for e in batch.drain(..) {
            e.release_input().unwrap();
        }
        // A rollback replay arrives below every rung's current time.
        q.enqueue(ev(99, 1, 0.0, 10.5));
        assert_eq!(q.next_time().unwrap().0, 10.5);
    }
}
