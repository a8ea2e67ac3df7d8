//! Two-tier ladder queue: the ladder skeleton with every bucket partitioned
//! into sender-hashed sub-buckets, so a cancellation scan touches one
//! sub-bucket chain instead of whole buckets.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::event::{queue_order, AgentId, Event, Time, TIME_INFINITY};
use crate::queue::ladder::{MIN_BUCKET_WIDTH, THRESH};
use crate::queue::EventQueue;
use crate::KernelError;

const BOTTOM_SOFT_CAP: usize = 50_000;

/// A time bucket split into `t2k` sub-buckets hashed on the sender id.
struct T2Bucket {
    sub: Vec<Vec<Arc<Event>>>,
    count: usize,
}

impl T2Bucket {
    fn new(t2k: usize) -> Self {
        Self {
            sub: (0..t2k).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    fn slot(&self, sender: AgentId) -> usize {
        (sender as usize) % self.sub.len()
    }

    fn push(&mut self, event: Arc<Event>) {
        let slot = self.slot(event.sender());
        self.sub[slot].push(event);
        self.count += 1;
    }

    fn len(&self) -> usize {
        self.count
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn into_events(self) -> impl Iterator<Item = Arc<Event>> {
        self.sub.into_iter().flatten()
    }

    /// The point of the second tier: only the sender's sub-bucket is scanned.
    fn remove_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let slot = self.slot(sender);
        let chain = &mut self.sub[slot];
        let mut removed = 0;
        let mut idx = 0;
        while idx < chain.len() {
            if chain[idx].sender() == sender && chain[idx].sent_time() >= sent {
                let event = chain.swap_remove(idx);
                event.release_input()?;
                removed += 1;
            } else {
                idx += 1;
            }
        }
        self.count -= removed;
        Ok(removed)
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = 0;
        for chain in self.sub.iter_mut() {
            let mut idx = 0;
            while idx < chain.len() {
                if chain[idx].receiver() == receiver {
                    let event = chain.swap_remove(idx);
                    event.release_input()?;
                    removed += 1;
                } else {
                    idx += 1;
                }
            }
        }
        self.count -= removed;
        Ok(removed)
    }
}

struct T2Top {
    bucket: T2Bucket,
    min_ts: Time,
    max_ts: Time,
    top_start: Time,
}

impl T2Top {
    fn new(t2k: usize) -> Self {
        Self {
            bucket: T2Bucket::new(t2k),
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
        self.bucket.push(event);
    }

    fn bucket_width(&self) -> f64 {
        let n = self.bucket.len();
        if n <= 1 {
            return MIN_BUCKET_WIDTH;
        }
        (self.max_ts - self.min_ts + n as f64 - 1.0) / n as f64
    }
}

struct T2Rung {
    buckets: Vec<T2Bucket>,
    r_start: Time,
    r_curr: Time,
    width: f64,
    curr_bucket: usize,
    count: usize,
    t2k: usize,
}

impl T2Rung {
    fn from_events(
        events: impl Iterator<Item = Arc<Event>>,
        min_ts: Time,
        width: f64,
        t2k: usize,
    ) -> Self {
        let mut rung = Self {
            buckets: Vec::new(),
            r_start: min_ts,
            r_curr: min_ts,
            width: width.max(MIN_BUCKET_WIDTH),
            curr_bucket: 0,
            count: 0,
            t2k,
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
            let t2k = self.t2k;
            self.buckets.resize_with(idx + 1, || T2Bucket::new(t2k));
        }
        self.buckets[idx].push(event);
        self.count += 1;
    }

    fn remove_next_bucket(&mut self) -> (T2Bucket, Time) {
        while self.curr_bucket < self.buckets.len() && self.buckets[self.curr_bucket].is_empty() {
            self.curr_bucket += 1;
        }
        debug_assert!(self.curr_bucket < self.buckets.len());
        let taken = std::mem::replace(&mut self.buckets[self.curr_bucket], T2Bucket::new(self.t2k));
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

/// Sorted staging area identical in role to the plain ladder's bottom.
struct T2Bottom {
    sel: VecDeque<Arc<Event>>,
}

impl T2Bottom {
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

    fn absorb(&mut self, bucket: T2Bucket) {
        let mut list: Vec<Arc<Event>> = bucket.into_events().collect();
        list.sort_by(|a, b| queue_order(a, b));
        if self.sel.is_empty() {
            self.sel = list.into();
        } else {
            for event in list {
                self.insert(event);
            }
        }
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

/// Ladder queue whose cancellation scans are narrowed by sender hashing.
pub struct TwoTierLadderQueue {
    top: T2Top,
    ladder: Vec<T2Rung>,
    bottom: T2Bottom,
    ladder_count: usize,
    max_rungs: usize,
    t2k: usize,
    bottom_warned: bool,
}

impl TwoTierLadderQueue {
    pub fn new(max_rungs: usize, t2k: usize) -> Self {
        Self {
            top: T2Top::new(t2k),
            ladder: Vec::new(),
            bottom: T2Bottom::new(),
            ladder_count: 0,
            max_rungs,
            t2k,
            bottom_warned: false,
        }
    }

    pub fn rung_count(&self) -> usize {
        self.ladder.len()
    }

    fn insert(&mut self, event: Arc<Event>) {
        if event.recv_time() > self.top.top_start {
            self.top.add(event);
            return;
        }
        for rung in self.ladder.iter_mut() {
            if rung.can_contain(&event) {
                rung.enqueue(event);
                self.ladder_count += 1;
                return;
            }
        }
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
                rungs = self.ladder.len(),
                "two-tier ladder bottom under capacity pressure"
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
        self.ladder.push(T2Rung::from_events(
            events.into_iter(),
            r_start,
            bkt_width,
            self.t2k,
        ));
    }

    fn recurse_rung(&mut self) -> T2Bucket {
        loop {
            let spawn_cap = self.ladder.len() < self.max_rungs;
            let rung = self
                .ladder
                .last_mut()
                .unwrap_or_else(|| unreachable!("recurse_rung on empty ladder"));
            let (bucket, bkt_time) = rung.remove_next_bucket();
            if bucket.len() > THRESH && spawn_cap && rung.width > MIN_BUCKET_WIDTH {
                let width = (rung.width + bucket.len() as f64 - 1.0) / bucket.len() as f64;
                let t2k = self.t2k;
                self.ladder.push(T2Rung::from_events(
                    bucket.into_events(),
                    bkt_time,
                    width,
                    t2k,
                ));
                continue;
            }
            self.ladder_count -= bucket.len();
            return bucket;
        }
    }

    fn populate_bottom(&mut self) {
        while self.bottom.is_empty() {
            while matches!(self.ladder.last(), Some(r) if r.is_empty()) {
                self.ladder.pop();
            }
            if self.ladder_count == 0 {
                self.ladder.clear();
                if self.top.bucket.is_empty() {
                    return;
                }
                let width = self.top.bucket_width().max(MIN_BUCKET_WIDTH);
                let min_ts = self.top.min_ts;
                let next_start = self.top.max_ts;
                let bucket = std::mem::replace(&mut self.top.bucket, T2Bucket::new(self.t2k));
                self.ladder_count += bucket.len();
                self.top.reset(next_start);
                let t2k = self.t2k;
                self.ladder
                    .push(T2Rung::from_events(bucket.into_events(), min_ts, width, t2k));
            }
            let bucket = self.recurse_rung();
            self.bottom.absorb(bucket);
        }
    }
}

impl EventQueue for TwoTierLadderQueue {
    fn enqueue(&mut self, event: Arc<Event>) {
        self.insert(event);
    }

    fn front(&mut self) -> Option<Arc<Event>> {
        self.populate_bottom();
        self.bottom.sel.front().map(Arc::clone)
    }

    fn next_time(&mut self) -> Option<(Time, AgentId)> {
        self.populate_bottom();
        self.bottom
            .sel
            .front()
            .map(|e| (e.recv_time(), e.receiver()))
    }

    fn dequeue_next_agent_batch(&mut self, out: &mut Vec<Arc<Event>>) {
        self.populate_bottom();
        self.bottom.dequeue_batch(out);
    }

    fn cancel_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let mut removed = self.top.bucket.remove_after(sender, sent)?;
        for rung in self.ladder.iter_mut() {
            let r = rung.remove_after(sender, sent)?;
            self.ladder_count -= r;
            removed += r;
        }
        Ok(removed + self.bottom.remove_after(sender, sent)?)
    }

    fn remove_agent(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        let mut removed = self.top.bucket.remove_receiver(receiver)?;
        for rung in self.ladder.iter_mut() {
            let r = rung.remove_receiver(receiver)?;
            self.ladder_count -= r;
            removed += r;
        }
        Ok(removed + self.bottom.remove_receiver(receiver)?)
    }

    fn drain(&mut self) -> Result<usize, KernelError> {
        let mut dropped = 0;
        let top = std::mem::replace(&mut self.top.bucket, T2Bucket::new(self.t2k));
        for e in top.into_events() {
            e.release_input()?;
            dropped += 1;
        }
        self.top.reset(0.0);
        for rung in std::mem::take(&mut self.ladder) {
            for bucket in rung.buckets {
                for e in bucket.into_events() {
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
        self.top.bucket.len() + self.ladder_count + self.bottom.len()
    }
}
