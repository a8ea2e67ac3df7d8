//! Core event type and its dual ownership counters.
//!
//! An [`Event`] is shared between the sender's output history, the receiver's
//! input side (scheduler queue or input history), and transiently the wire.
//! The `Arc<Event>` strong count is the general holder count;
//! [`Event::retain_input`] / [`Event::release_input`] maintain a second,
//! derived counter that tags which of those holders sit on the receiver's
//! input side. Rollback recovery uses the input tag to tell "cancel a pending
//! input" apart from "drop a retained output copy".

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering as MemOrd};
use std::sync::Arc;

use crate::KernelError;

/// Virtual time. IEEE-754 binary64, as carried on the wire and reduced by the
/// conservative GVT path.
pub type Time = f64;
/// Globally unique agent identifier.
pub type AgentId = u64;
/// Process rank within the communicator.
pub type Rank = u32;

pub const TIME_INFINITY: Time = f64::INFINITY;

/// Positive events carry model payloads; anti-messages cancel them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Sign {
    Positive = 0,
    Anti = 1,
}

/// Mattern color tag, alternated once per GVT round so in-flight events of the
/// closing round can be told apart from the next round's.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    White = 0,
    Red = 1,
}

impl Color {
    pub fn flip(self) -> Self {
        match self {
            Color::White => Color::Red,
            Color::Red => Color::White,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(raw: u8) -> Result<Self, KernelError> {
        match raw {
            0 => Ok(Color::White),
            1 => Ok(Color::Red),
            other => Err(KernelError::WireFormat(format!("bad color byte {other}"))),
        }
    }
}

/// A timestamped message between two agents.
///
/// Identity is the (sender, receiver, sent, recv) quadruple; an anti-message
/// equals its positive twin in all four fields with the sign flipped. The
/// color byte is stamped by the GVT manager when the event leaves the rank,
/// hence atomic.
#[derive(Debug)]
pub struct Event {
    sender: AgentId,
    receiver: AgentId,
    sent: Time,
    recv: Time,
    sign: Sign,
    color: AtomicU8,
    input_refs: AtomicU32,
    payload: Box<[u8]>,
}

impl Event {
    /// Create a positive event. Fails if the receive time precedes the sent
    /// time, which is a causality violation at the origin.
    pub fn new(
        sender: AgentId,
        receiver: AgentId,
        sent: Time,
        recv: Time,
        payload: Vec<u8>,
    ) -> Result<Arc<Self>, KernelError> {
        if recv < sent {
            return Err(KernelError::CausalityViolation { sent, recv });
        }
        Ok(Arc::new(Self {
            sender,
            receiver,
            sent,
            recv,
            sign: Sign::Positive,
            color: AtomicU8::new(Color::White as u8),
            input_refs: AtomicU32::new(0),
            payload: payload.into_boxed_slice(),
        }))
    }

    /// Reconstruct an event received off the wire. The color was stamped by
    /// the sending rank and must be preserved for the GVT counters.
    pub(crate) fn from_wire(
        sender: AgentId,
        receiver: AgentId,
        sent: Time,
        recv: Time,
        sign: Sign,
        color: Color,
        payload: Vec<u8>,
    ) -> Result<Arc<Self>, KernelError> {
        if recv < sent {
            return Err(KernelError::CausalityViolation { sent, recv });
        }
        Ok(Arc::new(Self {
            sender,
            receiver,
            sent,
            recv,
            sign,
            color: AtomicU8::new(color as u8),
            input_refs: AtomicU32::new(0),
            payload: payload.into_boxed_slice(),
        }))
    }

    /// The sign-flipped twin used to cancel this event on a rolled-back
    /// receiver. Identity fields are preserved; the payload is not carried.
    pub fn anti_twin(&self) -> Arc<Self> {
        Arc::new(Self {
            sender: self.sender,
            receiver: self.receiver,
            sent: self.sent,
            recv: self.recv,
            sign: Sign::Anti,
            color: AtomicU8::new(self.color.load(MemOrd::Relaxed)),
            input_refs: AtomicU32::new(0),
            payload: Box::new([]),
        })
    }

    pub fn sender(&self) -> AgentId {
        self.sender
    }

    pub fn receiver(&self) -> AgentId {
        self.receiver
    }

    pub fn sent_time(&self) -> Time {
        self.sent
    }

    pub fn recv_time(&self) -> Time {
        self.recv
    }

    pub fn sign(&self) -> Sign {
        self.sign
    }

    pub fn is_anti(&self) -> bool {
        self.sign == Sign::Anti
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Reinterpret the payload as a `Pod` value.
    pub fn payload_as<T: bytemuck::Pod>(&self) -> Result<T, KernelError> {
        bytemuck::try_pod_read_unaligned(&self.payload)
            .map_err(|e| KernelError::WireFormat(format!("payload cast: {e}")))
    }

    pub fn color(&self) -> Color {
        match self.color.load(MemOrd::Relaxed) {
            0 => Color::White,
            _ => Color::Red,
        }
    }

    pub(crate) fn set_color(&self, color: Color) {
        self.color.store(color as u8, MemOrd::Relaxed);
    }

    /// True when the two events share the identity quadruple.
    pub fn same_identity(&self, other: &Event) -> bool {
        self.sender == other.sender
            && self.receiver == other.receiver
            && self.sent == other.sent
            && self.recv == other.recv
    }

    /// True when `self` and `other` annihilate: same identity, opposite sign.
    pub fn cancels(&self, other: &Event) -> bool {
        self.sign != other.sign && self.same_identity(other)
    }

    /// Current input-side holder count.
    pub fn input_refs(&self) -> u32 {
        self.input_refs.load(MemOrd::Acquire)
    }

    /// Tag one more input-side holder (scheduler queue or input history).
    pub fn retain_input(&self) {
        self.input_refs.fetch_add(1, MemOrd::AcqRel);
    }

    /// Release one input-side tag. Must precede dropping the corresponding
    /// strong handle so a concurrent cancellation sees a consistent snapshot.
    /// Underflow means a holder double-released; the kernel cannot continue.
    pub fn release_input(&self) -> Result<(), KernelError> {
        let prev = self.input_refs.fetch_sub(1, MemOrd::AcqRel);
        if prev == 0 {
            // Leave the counter as found for the post-mortem.
            self.input_refs.fetch_add(1, MemOrd::AcqRel);
            tracing::error!(
                sender = self.sender,
                receiver = self.receiver,
                sent = self.sent,
                recv = self.recv,
                "input reference count underflow"
            );
            return Err(KernelError::InvariantViolation(format!(
                "input reference count underflow on event {} -> {} @ {}",
                self.sender, self.receiver, self.recv
            )));
        }
        Ok(())
    }
}

/// Deterministic queue order: receive time, then receiver, then sender, then
/// sent time. Every priority structure sorts with this so runs reproduce.
pub fn queue_order(a: &Event, b: &Event) -> Ordering {
    a.recv
        .total_cmp(&b.recv)
        .then_with(|| a.receiver.cmp(&b.receiver))
        .then_with(|| a.sender.cmp(&b.sender))
        .then_with(|| a.sent.total_cmp(&b.sent))
}

/// Total-ordered wrapper so `f64` timestamps can key ordered containers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TimeKey(pub Time);

impl Eq for TimeKey {}

impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}
