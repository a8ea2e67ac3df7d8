//! Agent selection, the time-window throttle, and rollback recovery.
//!
//! The scheduler owns the priority structure and every local agent runtime.
//! Incoming events (local emissions and remote arrivals alike) pass through
//! [`Scheduler::deliver`], which is where stragglers and anti-messages are
//! recognized; [`Scheduler::process_next`] implements the dispatch contract.
//! Events emitted while recovering or executing are handed back to the caller
//! for routing, so the scheduler never touches the transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::agent::{AgentContext, AgentRuntime};
use crate::event::{AgentId, Event, Time};
use crate::queue::EventQueue;
use crate::telemetry::EpochLog;
use crate::KernelError;

/// Outcome of one dispatch attempt.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// Queue empty or throttled by the window.
    NoWork,
    /// One batch delivered to one agent.
    Processed { agent: AgentId, time: Time },
}

/// Counters a run reports at the end.
#[derive(Clone, Debug, Default)]
pub struct SchedStats {
    pub batches: u64,
    pub delivered: u64,
    pub rollbacks: u64,
    pub cancelled: u64,
    pub annihilated: u64,
    pub pending_negatives: u64,
}

pub struct Scheduler {
    queue: Box<dyn EventQueue>,
    agents: HashMap<AgentId, AgentRuntime>,
    agent_order: Vec<AgentId>,
    /// Anti-messages whose positive has not arrived yet.
    pending_negatives: Vec<Arc<Event>>,
    time_window: Time,
    lookahead: Time,
    end_time: Time,
    batch: Vec<Arc<Event>>,
    pub epoch_log: EpochLog,
    pub stats: SchedStats,
    warned_pending_this_round: bool,
}

impl Scheduler {
    pub fn new(
        queue: Box<dyn EventQueue>,
        time_window: Time,
        lookahead: Time,
        end_time: Time,
        epoch_log: EpochLog,
    ) -> Self {
        Self {
            queue,
            agents: HashMap::new(),
            agent_order: Vec::new(),
            pending_negatives: Vec::new(),
            time_window,
            lookahead,
            end_time,
            batch: Vec::new(),
            epoch_log,
            stats: SchedStats::default(),
            warned_pending_this_round: false,
        }
    }

    pub fn register(&mut self, runtime: AgentRuntime) {
        self.queue.add_agent(runtime.id);
        self.agent_order.push(runtime.id);
        self.agent_order.sort_unstable();
        self.agents.insert(runtime.id, runtime);
    }

    pub fn agent_ids(&self) -> &[AgentId] {
        &self.agent_order
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.agents.get(&id)
    }

    pub fn agent_mut(&mut self, id: AgentId) -> Option<&mut AgentRuntime> {
        self.agents.get_mut(&id)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Receive time of the earliest undelivered event, the rank's LGVT input.
    pub fn next_event_time(&mut self) -> Option<Time> {
        self.queue.next_time().map(|(t, _)| t)
    }

    /// Run `initialize` on every agent in id order, then stamp the pre-start
    /// snapshot so any straggler can rewind to before the first batch.
    pub fn initialize_agents(
        &mut self,
        gvt: Time,
        out: &mut Vec<Arc<Event>>,
    ) -> Result<(), KernelError> {
        for id in self.agent_order.clone() {
            let rt = self
                .agents
                .get_mut(&id)
                .ok_or(KernelError::UnknownAgent(id))?;
            let mut ctx = AgentContext::new(id, rt.lvt, gvt, self.end_time, out);
            rt.behavior.initialize(&mut ctx);
            rt.save_state(f64::NEG_INFINITY);
        }
        Ok(())
    }

    /// Run `finalize` on every agent in id order. Emissions during finalize
    /// are discarded.
    pub fn finalize_agents(&mut self, gvt: Time) -> Result<(), KernelError> {
        let mut sink = Vec::new();
        for id in self.agent_order.clone() {
            let rt = self
                .agents
                .get_mut(&id)
                .ok_or(KernelError::UnknownAgent(id))?;
            let mut ctx = AgentContext::new(id, rt.lvt, gvt, self.end_time, &mut sink);
            rt.behavior.finalize(&mut ctx);
            sink.clear();
        }
        Ok(())
    }

    /// Deliver one event addressed to a local agent: annihilate, cancel,
    /// roll back, or enqueue. Anti-messages emitted by a triggered rollback
    /// are appended to `out` for routing.
    pub fn deliver(
        &mut self,
        event: Arc<Event>,
        gvt: Time,
        out: &mut Vec<Arc<Event>>,
    ) -> Result<(), KernelError> {
        let receiver = event.receiver();
        let lvt = self
            .agents
            .get(&receiver)
            .ok_or(KernelError::UnknownAgent(receiver))?
            .lvt;
        if event.recv_time() < gvt {
            return Err(KernelError::InvariantViolation(format!(
                "event for agent {receiver} at {} arrived below GVT {gvt}",
                event.recv_time()
            )));
        }

        if event.is_anti() {
            if event.recv_time() <= lvt {
                // The positive was already delivered: straggler recovery,
                // then sweep the queue for the sender's later sends.
                self.rollback(receiver, &event, out)?;
                self.stats.cancelled +=
                    self.queue.cancel_after(event.sender(), event.sent_time())? as u64;
            } else {
                let removed = self.queue.cancel_after(event.sender(), event.sent_time())?;
                self.stats.cancelled += removed as u64;
                if removed == 0 {
                    // Cancellation of nothing: the positive is still in
                    // flight. Park the negative until it shows up.
                    if !self.warned_pending_this_round {
                        self.warned_pending_this_round = true;
                        warn!(
                            sender = event.sender(),
                            receiver,
                            recv = event.recv_time(),
                            "anti-message arrived before its positive"
                        );
                    }
                    self.stats.pending_negatives += 1;
                    self.pending_negatives.push(event);
                }
            }
            return Ok(());
        }

        // Positive: a parked negative annihilates it on sight.
        if let Some(idx) = self
            .pending_negatives
            .iter()
            .position(|anti| anti.cancels(&event))
        {
            self.pending_negatives.swap_remove(idx);
            self.stats.annihilated += 1;
            return Ok(());
        }
        if event.recv_time() <= lvt {
            self.rollback(receiver, &event, out)?;
        }
        event.retain_input();
        self.queue.enqueue(event);
        Ok(())
    }

    /// Record a positive emission in the sender's output history so rollback
    /// can cancel it later.
    pub fn record_output(&mut self, event: Arc<Event>) -> Result<(), KernelError> {
        let sender = event.sender();
        self.agents
            .get_mut(&sender)
            .ok_or(KernelError::UnknownAgent(sender))?
            .output_history
            .push(event);
        Ok(())
    }

    /// The dispatch contract: find the next agent, honor the window, pull the
    /// batch, run the handler, snapshot. Emissions land in `out`.
    pub fn process_next(
        &mut self,
        gvt: Time,
        out: &mut Vec<Arc<Event>>,
    ) -> Result<Dispatch, KernelError> {
        let (time, agent) = match self.queue.next_time() {
            Some(front) => front,
            None => return Ok(Dispatch::NoWork),
        };
        if self.lookahead > 0.0 && time >= gvt + self.lookahead {
            // Conservative horizon: not yet safe with respect to remote
            // senders.
            return Ok(Dispatch::NoWork);
        }
        if self.time_window > 0.0 && time - gvt > self.time_window {
            return Ok(Dispatch::NoWork);
        }

        self.batch.clear();
        self.queue.dequeue_next_agent_batch(&mut self.batch);
        if self.batch.is_empty() {
            return Ok(Dispatch::NoWork);
        }
        let rt = self
            .agents
            .get_mut(&agent)
            .ok_or(KernelError::UnknownAgent(agent))?;
        if time <= rt.lvt {
            return Err(KernelError::InvariantViolation(format!(
                "agent {agent} scheduled at {time} at or below its LVT {}",
                rt.lvt
            )));
        }
        debug_assert!(self.batch.iter().all(|e| !e.is_anti()));

        rt.lvt = time;
        let batch_len = self.batch.len() as u64;
        let mut ctx = AgentContext::new(agent, time, gvt, self.end_time, out);
        rt.behavior.execute_task(&mut ctx, &self.batch);
        rt.save_state(time);
        // Input tags ride along from the queue into the input history.
        rt.input_history.append(&mut self.batch);

        self.epoch_log.advance(time);
        self.stats.batches += 1;
        self.stats.delivered += batch_len;
        Ok(Dispatch::Processed { agent, time })
    }

    /// Straggler recovery, steps 1-4 of the rollback protocol.
    fn rollback(
        &mut self,
        agent: AgentId,
        straggler: &Event,
        out: &mut Vec<Arc<Event>>,
    ) -> Result<(), KernelError> {
        let rt = self
            .agents
            .get_mut(&agent)
            .ok_or(KernelError::UnknownAgent(agent))?;
        debug!(
            agent,
            straggler = straggler.recv_time(),
            lvt = rt.lvt,
            "rollback"
        );

        // 1. Restore the newest state older than the straggler.
        let restored = rt.restore_before(straggler.recv_time())?;

        // 2. Re-queue replayable inputs; inputs the straggler itself cancels
        //    are dropped here.
        let mut replay = Vec::new();
        let inputs = std::mem::take(&mut rt.input_history);
        for e in inputs {
            if e.recv_time() <= restored {
                rt.input_history.push(e);
            } else if straggler.is_anti()
                && e.sender() == straggler.sender()
                && e.sent_time() >= straggler.sent_time()
            {
                e.release_input()?;
            } else {
                replay.push(e);
            }
        }

        // 3. Convert rolled-back sends into anti-messages, one per identity.
        let mut seen: HashSet<(AgentId, AgentId, u64, u64)> = HashSet::new();
        let outputs = std::mem::take(&mut rt.output_history);
        for e in outputs {
            if e.sent_time() <= restored {
                rt.output_history.push(e);
            } else {
                let key = (
                    e.receiver(),
                    e.sender(),
                    e.sent_time().to_bits(),
                    e.recv_time().to_bits(),
                );
                if seen.insert(key) {
                    out.push(e.anti_twin());
                }
            }
        }

        // 4. LVT was rewound by the restore; replay in forward order resumes
        //    from the priority structure.
        for e in replay {
            self.queue.enqueue(e);
        }
        self.epoch_log.rollback(restored);
        self.stats.rollbacks += 1;
        Ok(())
    }

    /// Commit below the new GVT: prune histories and snapshots, commit
    /// telemetry, and re-arm the per-round diagnostics.
    pub fn collect(&mut self, gvt: Time) -> Result<(), KernelError> {
        for rt in self.agents.values_mut() {
            rt.collect(gvt)?;
        }
        self.epoch_log.commit(gvt);
        self.warned_pending_this_round = false;
        Ok(())
    }

    /// Tear everything down at finalize; returns what was still held.
    pub fn drain(&mut self) -> Result<(usize, usize), KernelError> {
        let leftover = self.queue.drain()?;
        let negatives = self.pending_negatives.len();
        self.pending_negatives.clear();
        for rt in self.agents.values_mut() {
            for e in rt.input_history.drain(..) {
                e.release_input()?;
            }
            rt.output_history.clear();
            rt.state_history.clear();
        }
        Ok((leftover, negatives))
    }
}
