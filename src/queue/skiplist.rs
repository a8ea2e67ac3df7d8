//! Lock-free priority queue for the multi-threaded rank: a Linden-Jonsson
//! skip list keyed on (receive time, receiver, insertion sequence).
//!
//! Deletion is two-phase: delete-min logically deletes by fetch-or'ing the tag
//! bit of the predecessor's bottom pointer and claiming the value with a CAS
//! to null; physical unlinking happens in batches once a traversal walks more
//! than `max_offset` deleted prefix nodes, after which `restructure` repairs
//! the express lanes. Cancellation claims values in place, leaving key nodes
//! as tombstones the delete prefix later absorbs.
//!
//! Reclamation is epoch based. Each thread owns one bit of a shared bitmap;
//! entry is an acquire-release read-modify-write, exit clears the bit and the
//! last thread out of an epoch swaps the pending/waiting free lists. A node is
//! only deallocated after sitting out one full epoch past its unlink, so no
//! reader inside a critical section can hold a stale pointer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst},
};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::event::{AgentId, Event, Time};
use crate::queue::EventQueue;
use crate::KernelError;

const NUM_LEVELS: usize = 32;

/// Composite key; the sequence number makes every key unique so simultaneous
/// events for one agent sit adjacent in insertion order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    time_bits: u64,
    agent: AgentId,
    seq: u64,
}

struct Node {
    key: Key,
    sender: AgentId,
    sent: Time,
    anti: bool,
    value: AtomicPtr<Event>,
    level: usize,
    inserting: AtomicBool,
    next: Vec<AtomicUsize>,
}

impl Node {
    fn alloc(
        key: Key,
        value: *mut Event,
        level: usize,
        sender: AgentId,
        sent: Time,
        anti: bool,
    ) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            sender,
            sent,
            anti,
            value: AtomicPtr::new(value),
            level,
            inserting: AtomicBool::new(true),
            next: (0..=level).map(|_| AtomicUsize::new(0)).collect(),
        }))
    }
}

fn marked(p: *mut Node) -> usize {
    p as usize | 1
}

fn unmark(raw: usize) -> *mut Node {
    (raw & !1) as *mut Node
}

fn is_marked(raw: usize) -> bool {
    raw & 1 == 1
}

/// Geometric level draw, each level half as likely as the one below.
fn random_level() -> usize {
    let bits: u64 = rand::thread_rng().gen();
    (bits.trailing_ones() as usize).min(NUM_LEVELS - 1)
}

static NEXT_QUEUE_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Per-queue reclamation bit owned by this thread.
    static THREAD_BITS: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
}

struct EpochGc {
    /// Threads currently inside a critical section.
    curr_state: AtomicU64,
    /// Threads that were active when the epoch last switched and have not
    /// exited since.
    epoch_state: AtomicU64,
    epoch_lock: Mutex<()>,
    pending: Mutex<Vec<usize>>,
    waiting: Mutex<Vec<usize>>,
}

/// The concurrent priority structure behind the multi-threaded scheduler.
pub struct SkipListQueue {
    head: *mut Node,
    tail: *mut Node,
    max_offset: usize,
    max_threads: usize,
    queue_id: usize,
    seq: AtomicU64,
    count: AtomicUsize,
    last_tid: AtomicUsize,
    gc: EpochGc,
}

unsafe impl Send for SkipListQueue {}
unsafe impl Sync for SkipListQueue {}

impl SkipListQueue {
    pub fn new(max_offset: usize, max_threads: usize) -> Self {
        let head = Node::alloc(
            Key {
                time_bits: 0,
                agent: 0,
                seq: 0,
            },
            ptr::null_mut(),
            NUM_LEVELS - 1,
            0,
            0.0,
            false,
        );
        let tail = Node::alloc(
            Key {
                time_bits: u64::MAX,
                agent: u64::MAX,
                seq: u64::MAX,
            },
            ptr::null_mut(),
            NUM_LEVELS - 1,
            0,
            0.0,
            false,
        );
        unsafe {
            (*head).inserting.store(false, Relaxed);
            (*tail).inserting.store(false, Relaxed);
            for i in 0..NUM_LEVELS {
                (&(*head).next)[i].store(tail as usize, Relaxed);
            }
        }
        Self {
            head,
            tail,
            max_offset,
            max_threads: max_threads.min(64),
            queue_id: NEXT_QUEUE_ID.fetch_add(1, Relaxed),
            seq: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            last_tid: AtomicUsize::new(0),
            gc: EpochGc {
                curr_state: AtomicU64::new(0),
                epoch_state: AtomicU64::new(0),
                epoch_lock: Mutex::new(()),
                pending: Mutex::new(Vec::new()),
                waiting: Mutex::new(Vec::new()),
            },
        }
    }

    /// Claim this thread's reclamation bit up front; the startup-declared
    /// thread cap is enforced here.
    pub fn register_thread(&self) -> Result<(), crate::KernelError> {
        let cap = self.max_threads;
        let id = self.queue_id;
        THREAD_BITS.with(|map| {
            let mut map = map.borrow_mut();
            if map.contains_key(&id) {
                return Ok(());
            }
            let idx = self.last_tid.fetch_add(1, SeqCst);
            if idx >= cap {
                return Err(crate::KernelError::TooManyThreads(cap));
            }
            map.insert(id, 1u64 << idx);
            Ok(())
        })
    }

    fn thread_bit(&self) -> u64 {
        let id = self.queue_id;
        THREAD_BITS.with(|map| {
            if let Some(bit) = map.borrow().get(&id) {
                return *bit;
            }
            let idx = self.last_tid.fetch_add(1, SeqCst);
            if idx >= self.max_threads {
                panic!(
                    "skip list configured for at most {} threads",
                    self.max_threads
                );
            }
            let bit = 1u64 << idx;
            map.borrow_mut().insert(id, bit);
            bit
        })
    }

    fn enter_critical(&self, bit: u64) {
        self.gc.curr_state.fetch_or(bit, AcqRel);
    }

    fn exit_critical(&self, bit: u64) {
        self.gc.curr_state.fetch_and(!bit, AcqRel);
        let old = self.gc.epoch_state.fetch_and(!bit, AcqRel);
        if old != 0 {
            return;
        }
        // The epoch set had already drained; one thread flips the epoch.
        if let Ok(_guard) = self.gc.epoch_lock.try_lock() {
            if self.gc.epoch_state.load(SeqCst) == 0 {
                self.gc_and_change_epoch();
            }
        }
    }

    /// Free the waiting list (a full epoch old), promote pending to waiting,
    /// and start the next epoch. Caller holds the epoch lock.
    fn gc_and_change_epoch(&self) {
        let mut waiting = self.gc.waiting.lock().unwrap_or_else(|e| e.into_inner());
        for raw in waiting.drain(..) {
            unsafe { Self::dealloc_node(raw as *mut Node) };
        }
        {
            let mut pending = self.gc.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::swap(&mut *pending, &mut *waiting);
        }
        drop(waiting);
        self.gc
            .epoch_state
            .store(self.gc.curr_state.load(SeqCst), SeqCst);
    }

    fn free_node(&self, node: *mut Node) {
        self.gc
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(node as usize);
    }

    unsafe fn dealloc_node(node: *mut Node) {
        let value = (*node).value.swap(ptr::null_mut(), SeqCst);
        if !value.is_null() {
            drop(Arc::from_raw(value as *const Event));
        }
        drop(Box::from_raw(node));
    }

    /// Find predecessors and successors of `key` at every level, recording
    /// the last logically deleted node seen on the bottom lane.
    unsafe fn locate_preds(
        &self,
        key: Key,
        preds: &mut [*mut Node; NUM_LEVELS],
        succs: &mut [*mut Node; NUM_LEVELS],
    ) -> *mut Node {
        let mut del: *mut Node = ptr::null_mut();
        let mut pred = self.head;
        let mut i = NUM_LEVELS - 1;
        loop {
            let mut raw = (&(*pred).next)[i].load(Acquire);
            let mut d = is_marked(raw);
            let mut succ = unmark(raw);
            // Skip forward while the successor sorts earlier, has a deleted
            // successor itself, or (bottom lane) was reached over a mark.
            while (*succ).key < key
                || is_marked((&(*succ).next)[0].load(Acquire))
                || (i == 0 && d)
            {
                if i == 0 && d {
                    del = succ;
                }
                pred = succ;
                raw = (&(*pred).next)[i].load(Acquire);
                d = is_marked(raw);
                succ = unmark(raw);
            }
            preds[i] = pred;
            succs[i] = succ;
            if i == 0 {
                break;
            }
            i -= 1;
        }
        del
    }

    /// Insert, CAS per level bottom-up. Keys are unique, so the duplicate
    /// short-circuit of the paper never fires.
    pub fn insert(&self, event: Arc<Event>) {
        let time = event.recv_time();
        debug_assert!(time >= 0.0, "skip list keys must be nonnegative times");
        let key = Key {
            time_bits: time.to_bits(),
            agent: event.receiver(),
            seq: self.seq.fetch_add(1, Relaxed),
        };
        let sender = event.sender();
        let sent = event.sent_time();
        let anti = event.is_anti();
        let bit = self.thread_bit();
        self.enter_critical(bit);

        let level = random_level();
        let value = Arc::into_raw(event) as *mut Event;
        let node = Node::alloc(key, value, level, sender, sent, anti);
        let mut preds = [ptr::null_mut(); NUM_LEVELS];
        let mut succs = [ptr::null_mut(); NUM_LEVELS];

        unsafe {
            let mut del;
            loop {
                del = self.locate_preds(key, &mut preds, &mut succs);
                (&(*node).next)[0].store(succs[0] as usize, Relaxed);
                if (&(*preds[0]).next)[0]
                    .compare_exchange(succs[0] as usize, node as usize, Release, Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            let mut i = 1;
            while i <= level {
                // A mark anywhere below means the node (or its insertion
                // point) is already being deleted; stop raising it.
                if is_marked((&(*node).next)[0].load(Acquire))
                    || is_marked((&(*succs[i]).next)[0].load(Acquire))
                    || succs[i] == del
                {
                    break;
                }
                (&(*node).next)[i].store(succs[i] as usize, Relaxed);
                if (&(*preds[i]).next)[i]
                    .compare_exchange(succs[i] as usize, node as usize, Release, Relaxed)
                    .is_ok()
                {
                    i += 1;
                } else {
                    del = self.locate_preds(key, &mut preds, &mut succs);
                    if succs[0] != node {
                        break;
                    }
                }
            }
            (*node).inserting.store(false, Release);
        }
        self.count.fetch_add(1, SeqCst);
        self.exit_critical(bit);
    }

    /// Pop the earliest live entry, batching physical unlinks.
    pub fn delete_min(&self) -> Option<Arc<Event>> {
        let bit = self.thread_bit();
        self.enter_critical(bit);

        let mut ret: Option<Arc<Event>> = None;
        unsafe {
            let obs_head_raw = (&(*self.head).next)[0].load(Acquire);
            let mut new_head: *mut Node = ptr::null_mut();
            let mut pred = self.head;
            let mut offset = 0usize;

            loop {
                offset += 1;
                let succ_raw = (&(*pred).next)[0].load(Acquire);
                let succ = unmark(succ_raw);
                if succ == self.tail {
                    self.exit_critical(bit);
                    return None;
                }
                // Never move the logical head past an in-flight insert.
                if new_head.is_null() && (*pred).inserting.load(Acquire) {
                    new_head = pred;
                }
                if is_marked(succ_raw) {
                    pred = succ;
                    continue;
                }
                // Logical delete: tag the bottom pointer, then claim the value.
                let old_raw = (&(*pred).next)[0].fetch_or(1, AcqRel);
                let old = unmark(old_raw);
                if !is_marked(old_raw) {
                    let value = (*old).value.swap(ptr::null_mut(), AcqRel);
                    if !value.is_null() {
                        ret = Some(Arc::from_raw(value as *const Event));
                        self.count.fetch_sub(1, SeqCst);
                    }
                }
                pred = old;
                if ret.is_some() {
                    break;
                }
            }

            if new_head.is_null() {
                new_head = pred;
            }
            if offset > self.max_offset
                && (&(*self.head).next)[0]
                    .compare_exchange(obs_head_raw, marked(new_head), AcqRel, Relaxed)
                    .is_ok()
            {
                self.restructure();
                let mut cur = unmark(obs_head_raw);
                while cur != new_head {
                    let next = unmark((&(*cur).next)[0].load(Acquire));
                    self.free_node(cur);
                    cur = next;
                }
            }
        }
        self.exit_critical(bit);
        ret
    }

    /// Swing the express-lane head pointers past the deleted prefix.
    unsafe fn restructure(&self) {
        let mut pred = self.head;
        let mut i = NUM_LEVELS - 1;
        while i > 0 {
            let h_raw = (&(*self.head).next)[i].load(Acquire);
            let h = unmark(h_raw);
            let mut cur = unmark((&(*pred).next)[i].load(Acquire));
            if !is_marked((&(*h).next)[0].load(Acquire)) {
                i -= 1;
                continue;
            }
            while is_marked((&(*cur).next)[0].load(Acquire)) {
                pred = cur;
                cur = unmark((&(*pred).next)[i].load(Acquire));
            }
            if (&(*self.head).next)[i]
                .compare_exchange(h_raw, cur as usize, AcqRel, Relaxed)
                .is_ok()
            {
                i -= 1;
            }
        }
    }

    /// Earliest live (time, receiver) without removing it. A racy snapshot by
    /// construction; callers use it for window checks, not ordering proofs.
    pub fn peek_key(&self) -> Option<(Time, AgentId)> {
        let bit = self.thread_bit();
        self.enter_critical(bit);
        let result = unsafe {
            let mut node = unmark((&(*self.head).next)[0].load(Acquire));
            loop {
                if node == self.tail {
                    break None;
                }
                if !(*node).value.load(Acquire).is_null() {
                    break Some((f64::from_bits((*node).key.time_bits), (*node).key.agent));
                }
                node = unmark((&(*node).next)[0].load(Acquire));
            }
        };
        self.exit_critical(bit);
        result
    }

    /// Claim every value from `sender` with sent time at or past the cutoff,
    /// leaving tombstone nodes for the delete prefix to absorb.
    pub fn cancel_after_shared(&self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        let bit = self.thread_bit();
        self.enter_critical(bit);
        let mut removed = 0;
        let mut result = Ok(());
        unsafe {
            let mut node = unmark((&(*self.head).next)[0].load(Acquire));
            while node != self.tail {
                // Anti-messages from the same rolled-back sender stay; they
                // still have positives of their own to annihilate.
                if !(*node).anti && (*node).sender == sender && (*node).sent >= sent {
                    let value = (*node).value.swap(ptr::null_mut(), AcqRel);
                    if !value.is_null() {
                        let event = Arc::from_raw(value as *const Event);
                        let released = event.release_input();
                        drop(event);
                        removed += 1;
                        self.count.fetch_sub(1, SeqCst);
                        if let Err(e) = released {
                            result = Err(e);
                            break;
                        }
                    }
                }
                node = unmark((&(*node).next)[0].load(Acquire));
            }
        }
        self.exit_critical(bit);
        result.map(|_| removed)
    }

    fn remove_receiver_shared(&self, receiver: AgentId) -> Result<usize, KernelError> {
        let bit = self.thread_bit();
        self.enter_critical(bit);
        let mut removed = 0;
        let mut result = Ok(());
        unsafe {
            let mut node = unmark((&(*self.head).next)[0].load(Acquire));
            while node != self.tail {
                if (*node).key.agent == receiver {
                    let value = (*node).value.swap(ptr::null_mut(), AcqRel);
                    if !value.is_null() {
                        let event = Arc::from_raw(value as *const Event);
                        let released = event.release_input();
                        drop(event);
                        removed += 1;
                        self.count.fetch_sub(1, SeqCst);
                        if let Err(e) = released {
                            result = Err(e);
                            break;
                        }
                    }
                }
                node = unmark((&(*node).next)[0].load(Acquire));
            }
        }
        self.exit_critical(bit);
        result.map(|_| removed)
    }

    pub fn shared_len(&self) -> usize {
        self.count.load(SeqCst)
    }

    /// Pop one batch of events sharing the earliest (time, receiver). Under
    /// contention two threads can split a batch; the second half surfaces as
    /// an equal-time arrival and the dispatch layer resolves it like any
    /// other straggler.
    pub fn pop_batch_shared(&self, out: &mut Vec<Arc<Event>>) {
        let first = match self.delete_min() {
            Some(e) => e,
            None => return,
        };
        let time = first.recv_time();
        let agent = first.receiver();
        out.push(first);
        while let Some((t, a)) = self.peek_key() {
            if t != time || a != agent {
                break;
            }
            match self.delete_min() {
                Some(e) if e.recv_time() == time && e.receiver() == agent => out.push(e),
                // A concurrent insert slipped an earlier event in; put it
                // back and stop extending the batch.
                Some(e) => {
                    self.insert(e);
                    break;
                }
                None => break,
            }
        }
    }
}

impl EventQueue for SkipListQueue {
    fn enqueue(&mut self, event: Arc<Event>) {
        self.insert(event);
    }

    fn front(&mut self) -> Option<Arc<Event>> {
        // Single-threaded use only: with no concurrent claimer the value
        // cannot be released between the null check and the refcount bump.
        let bit = self.thread_bit();
        self.enter_critical(bit);
        let result = unsafe {
            let mut node = unmark((&(*self.head).next)[0].load(Acquire));
            loop {
                if node == self.tail {
                    break None;
                }
                let value = (*node).value.load(Acquire);
                if !value.is_null() {
                    Arc::increment_strong_count(value as *const Event);
                    break Some(Arc::from_raw(value as *const Event));
                }
                node = unmark((&(*node).next)[0].load(Acquire));
            }
        };
        self.exit_critical(bit);
        result
    }

    fn next_time(&mut self) -> Option<(Time, AgentId)> {
        self.peek_key()
    }

    fn dequeue_next_agent_batch(&mut self, out: &mut Vec<Arc<Event>>) {
        self.pop_batch_shared(out);
    }

    fn cancel_after(&mut self, sender: AgentId, sent: Time) -> Result<usize, KernelError> {
        self.cancel_after_shared(sender, sent)
    }

    fn remove_agent(&mut self, receiver: AgentId) -> Result<usize, KernelError> {
        self.remove_receiver_shared(receiver)
    }

    fn drain(&mut self) -> Result<usize, KernelError> {
        let mut dropped = 0;
        while let Some(event) = self.delete_min() {
            event.release_input()?;
            dropped += 1;
        }
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.shared_len()
    }
}

impl Drop for SkipListQueue {
    fn drop(&mut self) {
        // Two idle epoch flips clear both free lists, then the live chain.
        {
            let _guard = self
                .gc
                .epoch_lock
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            self.gc.epoch_state.store(0, SeqCst);
            self.gc.curr_state.store(0, SeqCst);
            self.gc_and_change_epoch();
            self.gc_and_change_epoch();
        }
        unsafe {
            let mut cur = self.head;
            loop {
                let next = if cur == self.tail {
                    ptr::null_mut()
                } else {
                    unmark((&(*cur).next)[0].load(Relaxed))
                };
                let value = (*cur).value.swap(ptr::null_mut(), Relaxed);
                if !value.is_null() {
                    let event = Arc::from_raw(value as *const Event);
                    if let Err(e) = event.release_input() {
                        // Nothing to propagate out of a destructor.
                        tracing::error!(error = %e, "input tag underflow while dropping queue");
                    }
                    drop(event);
                }
                drop(Box::from_raw(cur));
                if next.is_null() {
                    break;
                }
                cur = next;
            }
        }
    }
}
