//! # Anachron
//!
//! A parallel discrete-event simulation kernel. Agents exchange timestamped
//! events across ranks and threads; the kernel serializes them in virtual-time
//! order under one of two synchronization regimes: optimistic Time Warp
//! (speculate, roll back on stragglers, commit below GVT) or conservative
//! lookahead-bounded execution.
//!
//! ## Architecture
//!
//! - [`sim`] - Rank orchestration: init, main loop, garbage collection, finalize
//! - [`scheduler`] - Agent selection, time-window throttling, rollback recovery
//! - [`queue`] - Pluggable event priority structures (heaps, ladders, lock-free skip list)
//! - [`gvt`] - Mattern colored-token GVT estimation
//! - [`comm`] - Rank-to-rank transport and the registration exchange
//! - [`agent`] - The agent trait and its execution context
//! - [`mt`] - Distributed multi-threaded rank over the shared lock-free queue

use thiserror::Error;

pub mod agent;
pub mod comm;
pub mod config;
pub mod event;
pub mod gvt;
pub mod mt;
pub mod queue;
pub mod scheduler;
pub mod sim;
pub mod telemetry;

pub mod prelude {
    pub use crate::agent::{Agent, AgentContext};
    pub use crate::comm::{ChannelTransport, Communicator, Transport};
    pub use crate::config::{QueueKind, SimConfig};
    pub use crate::event::{AgentId, Event, Rank, Sign, Time};
    pub use crate::sim::{RunStats, Simulation};
    pub use crate::KernelError;
    pub use bytemuck::{Pod, Zeroable};
}

/// Error enum covering every way a simulation can go sideways.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("event receive time {recv} precedes its sent time {sent} at the source")]
    CausalityViolation { sent: f64, recv: f64 },
    #[error("agent {agent} scheduled an event to itself at {recv}, below GVT {gvt}")]
    ScheduledInThePast { agent: u64, recv: f64, gvt: f64 },
    #[error("rollback to {target} reaches past the oldest retained snapshot of agent {agent}")]
    StateHistoryExhausted { agent: u64, target: f64 },
    #[error("GVT regressed from {from} to {to}")]
    GvtRegression { from: f64, to: f64 },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed wire message: {0}")]
    WireFormat(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown agent id {0}; was it registered before start?")]
    UnknownAgent(u64),
    #[error("worker thread panicked")]
    ThreadPanic,
    #[error("thread limit reached: the queue was configured for at most {0} threads")]
    TooManyThreads(usize),
}
