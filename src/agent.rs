//! The agent trait, its execution context, and the kernel-side runtime record
//! that carries local virtual time, the three histories, and snapshots.

use std::sync::Arc;

use crate::event::{AgentId, Event, Time, TIME_INFINITY};
use crate::KernelError;

/// An agent is an independent logical process with local state, driven
/// entirely by event delivery.
///
/// `execute_task` receives the whole batch of simultaneous events for one
/// virtual time and may schedule new events through the context. It must not
/// block or perform unbounded I/O, and all state the model depends on must be
/// covered by `snapshot`/`restore` - the kernel rewinds agents through those
/// two methods during rollback.
pub trait Agent: Send {
    /// Invoked once before the main loop; may already schedule events.
    fn initialize(&mut self, ctx: &mut AgentContext<'_>);

    /// Process one batch of simultaneous events. Ordering inside the batch is
    /// unspecified, so the handler must be commutative over it.
    fn execute_task(&mut self, ctx: &mut AgentContext<'_>, events: &[Arc<Event>]);

    /// Invoked once after the main loop ends, in agent-id order.
    fn finalize(&mut self, ctx: &mut AgentContext<'_>);

    /// Serialize the model state for the state history.
    fn snapshot(&self) -> Vec<u8>;

    /// Reinstall a state previously produced by `snapshot`.
    fn restore(&mut self, snapshot: &[u8]);
}

/// What an agent sees of the kernel while one of its hooks runs.
///
/// Emitted events are buffered here and routed by the scheduler after the
/// hook returns, so the routing rules in one place decide local enqueue
/// versus remote send.
pub struct AgentContext<'a> {
    id: AgentId,
    lvt: Time,
    gvt: Time,
    end_time: Time,
    outbox: &'a mut Vec<Arc<Event>>,
}

impl<'a> AgentContext<'a> {
    pub(crate) fn new(
        id: AgentId,
        lvt: Time,
        gvt: Time,
        end_time: Time,
        outbox: &'a mut Vec<Arc<Event>>,
    ) -> Self {
        Self {
            id,
            lvt,
            gvt,
            end_time,
            outbox,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.id
    }

    /// Local virtual time: the receive time of the batch being processed.
    pub fn lvt(&self) -> Time {
        self.lvt
    }

    /// The current global virtual time estimate.
    pub fn gvt(&self) -> Time {
        self.gvt
    }

    /// Schedule an event to `receiver` at virtual time `recv`.
    ///
    /// Returns `Ok(false)` when the event falls past the simulation end time
    /// and was silently dropped. Self-sends into the past (below GVT) and
    /// receive times below the current LVT are rejected.
    pub fn schedule_event(
        &mut self,
        receiver: AgentId,
        recv: Time,
        payload: Vec<u8>,
    ) -> Result<bool, KernelError> {
        if receiver == self.id && recv < self.gvt {
            return Err(KernelError::ScheduledInThePast {
                agent: self.id,
                recv,
                gvt: self.gvt,
            });
        }
        if recv > self.end_time {
            return Ok(false);
        }
        let event = Event::new(self.id, receiver, self.lvt, recv, payload)?;
        self.outbox.push(event);
        Ok(true)
    }

    /// `schedule_event` for a `Pod` payload.
    pub fn schedule_pod<T: bytemuck::Pod>(
        &mut self,
        receiver: AgentId,
        recv: Time,
        payload: &T,
    ) -> Result<bool, KernelError> {
        self.schedule_event(receiver, recv, bytemuck::bytes_of(payload).to_vec())
    }
}

/// One archived state, stamped with the LVT it was taken at.
#[derive(Debug)]
pub struct StateSnapshot {
    pub time: Time,
    pub bytes: Box<[u8]>,
}

/// Kernel-side record for one local agent: behavior, LVT, and the three
/// histories rollback and commitment operate on.
pub struct AgentRuntime {
    pub id: AgentId,
    pub lvt: Time,
    pub behavior: Box<dyn Agent>,
    /// Processed events retained for replay. Only events with receive time
    /// above GVT survive collection.
    pub input_history: Vec<Arc<Event>>,
    /// Sent events retained so rollback can issue anti-messages.
    pub output_history: Vec<Arc<Event>>,
    /// Snapshots in strictly increasing virtual-time order.
    pub state_history: Vec<StateSnapshot>,
}

impl AgentRuntime {
    pub fn new(id: AgentId, behavior: Box<dyn Agent>) -> Self {
        Self {
            id,
            lvt: 0.0,
            behavior,
            input_history: Vec::new(),
            output_history: Vec::new(),
            state_history: Vec::new(),
        }
    }

    /// Archive the current state at the given timestamp. The pre-start
    /// snapshot is stamped negative infinity so any straggler has a base to
    /// rewind to.
    pub fn save_state(&mut self, at: Time) {
        if let Some(last) = self.state_history.last_mut() {
            if last.time == at {
                // Re-snapshot of the same instant replaces, keeping the
                // history strictly monotone.
                last.bytes = self.behavior.snapshot().into_boxed_slice();
                return;
            }
            debug_assert!(last.time < at);
        }
        self.state_history.push(StateSnapshot {
            time: at,
            bytes: self.behavior.snapshot().into_boxed_slice(),
        });
    }

    /// Restore the newest snapshot strictly older than `target`, drop every
    /// later snapshot, and rewind LVT to the restored timestamp.
    pub fn restore_before(&mut self, target: Time) -> Result<Time, KernelError> {
        let idx = self
            .state_history
            .partition_point(|s| s.time < target)
            .checked_sub(1)
            .ok_or(KernelError::StateHistoryExhausted {
                agent: self.id,
                target,
            })?;
        self.behavior.restore(&self.state_history[idx].bytes);
        let restored = self.state_history[idx].time;
        self.state_history.truncate(idx + 1);
        self.lvt = restored;
        Ok(restored)
    }

    /// Reclaim history below the new GVT. The newest snapshot below GVT is
    /// kept as the rollback base; everything older goes. Input events release
    /// their input tag before their strong handle is dropped.
    pub fn collect(&mut self, gvt: Time) -> Result<(), KernelError> {
        let base = self
            .state_history
            .partition_point(|s| s.time < gvt)
            .saturating_sub(1);
        self.state_history.drain(..base);

        let mut idx = 0;
        while idx < self.input_history.len() {
            if self.input_history[idx].recv_time() < gvt {
                let event = self.input_history.swap_remove(idx);
                event.release_input()?;
            } else {
                idx += 1;
            }
        }
        self.output_history.retain(|e| e.sent_time() >= gvt);
        Ok(())
    }

    /// The timestamp below which this agent can no longer rewind.
    pub fn oldest_snapshot(&self) -> Time {
        self.state_history
            .first()
            .map(|s| s.time)
            .unwrap_or(TIME_INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: u64,
    }

    impl Agent for Counter {
        fn initialize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn execute_task(&mut self, _ctx: &mut AgentContext<'_>, events: &[Arc<Event>]) {
            self.count += events.len() as u64;
        }
        fn finalize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn snapshot(&self) -> Vec<u8> {
            self.count.to_le_bytes().to_vec()
        }
        fn restore(&mut self, snapshot: &[u8]) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(snapshot);
            self.count = u64::from_le_bytes(raw);
        }
    }

    fn runtime() -> AgentRuntime {
        let mut rt = AgentRuntime::new(7, Box::new(Counter { count: 0 }));
        rt.save_state(f64::NEG_INFINITY);
        rt
    }

    #[test]
    fn restore_picks_newest_snapshot_below_target() {
        let mut rt = runtime();
        for t in [1.0, 2.0, 5.0, 9.0] {
            rt.lvt = t;
            rt.save_state(t);
        }
        let restored = rt.restore_before(5.0).unwrap();
        assert_eq!(restored, 2.0);
        assert_eq!(rt.lvt, 2.0);
        // Snapshots at 5.0 and 9.0 are gone.
        assert_eq!(rt.state_history.last().unwrap().time, 2.0);
    }

    #[test]
    fn restore_below_oldest_snapshot_is_fatal() {
        let mut rt = AgentRuntime::new(7, Box::new(Counter { count: 0 }));
        rt.save_state(4.0);
        assert!(matches!(
            rt.restore_before(3.0),
            Err(KernelError::StateHistoryExhausted { .. })
        ));
    }

    #[test]
    fn collect_keeps_rollback_base_and_prunes_histories() {
        let mut rt = runtime();
        for t in [1.0, 2.0, 3.0, 4.0] {
            rt.lvt = t;
            rt.save_state(t);
        }
        for t in [1.0, 2.0, 3.0, 4.0] {
            let e = Event::new(1, 7, t - 0.5, t, vec![]).unwrap();
            e.retain_input();
            rt.input_history.push(e);
            rt.output_history
                .push(Event::new(7, 1, t, t + 1.0, vec![]).unwrap());
        }
        rt.collect(3.0).unwrap();
        // Base snapshot at 2.0 survives as the rewind floor.
        assert_eq!(rt.state_history.first().unwrap().time, 2.0);
        assert!(rt.input_history.iter().all(|e| e.recv_time() >= 3.0));
        assert!(rt.output_history.iter().all(|e| e.sent_time() >= 3.0));
    }

    #[test]
    fn context_drops_events_past_end_time_silently() {
        let mut outbox = Vec::new();
        let mut ctx = AgentContext::new(1, 5.0, 0.0, 10.0, &mut outbox);
        assert!(!ctx.schedule_event(2, 10.5, vec![]).unwrap());
        // The end time itself is still inside the simulated horizon.
        assert!(ctx.schedule_event(2, 10.0, vec![]).unwrap());
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn context_rejects_self_send_below_gvt() {
        let mut outbox = Vec::new();
        let mut ctx = AgentContext::new(1, 5.0, 4.0, 10.0, &mut outbox);
        assert!(matches!(
            ctx.schedule_event(1, 3.0, vec![]),
            Err(KernelError::ScheduledInThePast { .. })
        ));
    }
}
