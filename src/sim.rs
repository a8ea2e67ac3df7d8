//! Rank orchestration: bootstrap, the main loop, commitment, finalization.
//!
//! One `Simulation` instance runs one rank. The loop pumps the communicator,
//! dispatches one local batch, routes whatever the handler emitted, and lets
//! rank 0 drive GVT rounds; everything below each new GVT estimate is
//! committed and reclaimed. Termination is GVT reaching the configured end
//! time (or the stop hook).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::agent::{Agent, AgentRuntime};
use crate::comm::{Communicator, Incoming, Transport};
use crate::config::SimConfig;
use crate::event::{AgentId, Event, Time, TIME_INFINITY};
use crate::gvt::{GvtManager, GvtOutcome};
use crate::queue::make_queue;
use crate::scheduler::{Dispatch, Scheduler};
use crate::telemetry::EpochLog;
use crate::KernelError;

/// What a finished run reports back.
#[derive(Clone, Debug)]
pub struct RunStats {
    pub final_gvt: Time,
    pub batches: u64,
    pub delivered: u64,
    pub rollbacks: u64,
    pub cancelled: u64,
    pub annihilated: u64,
    pub gvt_rounds: u64,
    /// Events still sitting in the queue at finalize; zero on a completed run.
    pub drained_events: usize,
    /// Pending negatives drained at finalize (inter-rank ring-closure race).
    pub drained_negatives: usize,
    /// Events still held by agent histories after the final commit; zero on
    /// a completed run, nonzero only when stopped early.
    pub live_events: usize,
}

/// One simulation rank: agents, scheduler, GVT manager, communicator.
pub struct Simulation {
    config: SimConfig,
    comm: Communicator,
    scheduler: Scheduler,
    gvt: GvtManager,
    stop: Arc<AtomicBool>,
    started: bool,
}

impl Simulation {
    pub fn new(config: SimConfig, transport: Box<dyn Transport>) -> Result<Self, KernelError> {
        config.validate()?;
        let rank = transport.rank();
        let num_ranks = transport.num_ranks();
        let scheduler = Scheduler::new(
            make_queue(&config),
            config.time_window,
            config.lookahead,
            config.end_time,
            EpochLog::new(
                config.epoch_vtime_thresh,
                config.epoch_clock_thresh_ms,
                config.min_epoch_count,
            ),
        );
        Ok(Self {
            comm: Communicator::new(transport),
            scheduler,
            gvt: GvtManager::new(rank, num_ranks, 0.0),
            config,
            stop: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// Register a local agent. All registration happens before `run`.
    pub fn register(
        &mut self,
        id: AgentId,
        behavior: Box<dyn Agent>,
    ) -> Result<(), KernelError> {
        if self.started {
            return Err(KernelError::Config(
                "agents cannot be registered after the run started".into(),
            ));
        }
        if self.scheduler.agent(id).is_some() {
            return Err(KernelError::Config(format!("agent {id} registered twice")));
        }
        self.scheduler.register(AgentRuntime::new(id, behavior));
        Ok(())
    }

    /// Flag checked at the top of every loop iteration; setting it triggers a
    /// clean finalize.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn gvt(&self) -> Time {
        self.gvt.gvt()
    }

    pub fn lvt(&self, agent: AgentId) -> Option<Time> {
        self.scheduler.agent(agent).map(|rt| rt.lvt)
    }

    /// Run the rank to completion and finalize.
    pub fn run(&mut self) -> Result<RunStats, KernelError> {
        self.started = true;
        let rank = self.comm.rank();
        info!(
            rank,
            ranks = self.comm.num_ranks(),
            end_time = self.config.end_time,
            conservative = self.config.conservative(),
            "simulation starting"
        );

        self.comm.register_agents(self.scheduler.agent_ids())?;

        let mut routed = Vec::new();
        self.scheduler.initialize_agents(self.gvt.gvt(), &mut routed)?;
        self.route(routed)?;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                debug!(rank, "stop hook observed");
                break;
            }
            self.pump_network()?;

            let mut emitted = Vec::new();
            let worked = match self.scheduler.process_next(self.gvt.gvt(), &mut emitted)? {
                Dispatch::Processed { .. } => {
                    self.route(emitted)?;
                    true
                }
                Dispatch::NoWork => false,
            };

            let lgvt = self.local_floor();
            if self.config.conservative() {
                if !worked {
                    let outcome = self.gvt.force_update(&mut self.comm, lgvt)?;
                    self.apply(outcome)?;
                }
            } else {
                let outcome = self.gvt.maybe_start_round(
                    &mut self.comm,
                    lgvt,
                    self.config.gvt_period,
                    !worked,
                )?;
                self.apply(outcome)?;
            }

            // Strict: an event at exactly end time still gets delivered; the
            // drained queue then pushes GVT to infinity.
            if self.gvt.gvt() > self.config.end_time {
                break;
            }
            if !worked {
                std::thread::yield_now();
            }
        }
        self.finalize()
    }

    /// Receive time of the earliest undelivered local event.
    fn local_floor(&mut self) -> Time {
        self.scheduler.next_event_time().unwrap_or(TIME_INFINITY)
    }

    /// Drain the transport: account remote events with the GVT manager and
    /// hand them to the scheduler; feed protocol messages to the GVT manager.
    fn pump_network(&mut self) -> Result<(), KernelError> {
        while let Some((src, incoming)) = self.comm.poll()? {
            match incoming {
                Incoming::Event(event) => {
                    self.gvt.on_remote_receive(&event, src);
                    let mut emitted = Vec::new();
                    self.scheduler.deliver(event, self.gvt.gvt(), &mut emitted)?;
                    self.route(emitted)?;
                }
                Incoming::GvtControl(token) => {
                    let lgvt = self.local_floor();
                    let outcome = self.gvt.on_control(&mut self.comm, token, lgvt)?;
                    self.apply(outcome)?;
                }
                Incoming::GvtEstimate(estimate) => {
                    let outcome = self.gvt.on_estimate(&mut self.comm, estimate)?;
                    self.apply(outcome)?;
                }
                Incoming::GvtAck => {
                    let outcome = self.gvt.on_ack()?;
                    self.apply(outcome)?;
                }
            }
        }
        Ok(())
    }

    /// Route emitted events: local receivers go through the scheduler (which
    /// may cascade more anti-messages), remote receivers are colored,
    /// counted, and serialized. Positive emissions are retained in the
    /// sender's output history either way.
    fn route(&mut self, emitted: Vec<Arc<Event>>) -> Result<(), KernelError> {
        let mut pending = emitted;
        while let Some(event) = pending.pop() {
            if !event.is_anti() {
                self.scheduler.record_output(Arc::clone(&event))?;
            }
            if self.comm.is_local(event.receiver()) {
                self.scheduler
                    .deliver(event, self.gvt.gvt(), &mut pending)?;
            } else {
                let dst = self.comm.home_rank(event.receiver())?;
                self.gvt.on_remote_send(&event, dst);
                self.comm.send_event(&event, event.color())?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, outcome: GvtOutcome) -> Result<(), KernelError> {
        if let GvtOutcome::Adopted(gvt) = outcome {
            debug!(gvt, "gvt adopted");
            self.scheduler.collect(gvt)?;
        }
        Ok(())
    }

    /// Commit what remains, drain pending negatives, finalize agents in id
    /// order, and account for anything still alive.
    fn finalize(&mut self) -> Result<RunStats, KernelError> {
        let gvt = self.gvt.gvt();
        self.scheduler.collect(gvt)?;
        self.scheduler.finalize_agents(gvt)?;
        let live: usize = self
            .scheduler
            .agent_ids()
            .to_vec()
            .iter()
            .filter_map(|id| self.scheduler.agent(*id))
            .map(|rt| rt.input_history.len() + rt.output_history.len())
            .sum();
        let (drained_events, drained_negatives) = self.scheduler.drain()?;
        let stats = RunStats {
            final_gvt: gvt,
            batches: self.scheduler.stats.batches,
            delivered: self.scheduler.stats.delivered,
            rollbacks: self.scheduler.stats.rollbacks,
            cancelled: self.scheduler.stats.cancelled,
            annihilated: self.scheduler.stats.annihilated,
            gvt_rounds: self.gvt.rounds_completed(),
            drained_events,
            drained_negatives,
            live_events: live,
        };
        info!(
            rank = self.comm.rank(),
            final_gvt = stats.final_gvt,
            batches = stats.batches,
            rollbacks = stats.rollbacks,
            "simulation finalized"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentContext;
    use crate::comm::ChannelTransport;
    use crate::config::QueueKind;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    fn config(end_time: Time) -> SimConfig {
        SimConfig {
            end_time,
            gvt_period: 1.0,
            ..Default::default()
        }
    }

    fn single_rank(config: SimConfig) -> Simulation {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut mesh = ChannelTransport::mesh(1);
        Simulation::new(config, Box::new(mesh.pop().unwrap())).unwrap()
    }

    /// Schedules one event to itself every unit of virtual time.
    struct SelfPing {
        deliveries: Arc<AtomicU64>,
    }

    impl Agent for SelfPing {
        fn initialize(&mut self, ctx: &mut AgentContext<'_>) {
            ctx.schedule_event(ctx.agent_id(), 1.0, vec![]).unwrap();
        }
        fn execute_task(&mut self, ctx: &mut AgentContext<'_>, events: &[Arc<Event>]) {
            self.deliveries.fetch_add(events.len() as u64, Ordering::Relaxed);
            ctx.schedule_event(ctx.agent_id(), ctx.lvt() + 1.0, vec![])
                .unwrap();
        }
        fn finalize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn restore(&mut self, _snapshot: &[u8]) {}
    }

    fn run_self_ping(kind: QueueKind) {
        let deliveries = Arc::new(AtomicU64::new(0));
        let mut sim = single_rank(SimConfig {
            queue: kind,
            ..config(10.0)
        });
        sim.register(
            1,
            Box::new(SelfPing {
                deliveries: Arc::clone(&deliveries),
            }),
        )
        .unwrap();
        let stats = sim.run().unwrap();
        assert_eq!(deliveries.load(Ordering::Relaxed), 10);
        assert_eq!(sim.lvt(1), Some(10.0));
        assert_eq!(stats.rollbacks, 0);
        assert_eq!(stats.drained_events, 0);
        assert_eq!(stats.live_events, 0);
    }

    #[test]
    fn self_ping_three_tier() {
        run_self_ping(QueueKind::ThreeTier);
    }

    #[test]
    fn self_ping_ladder() {
        run_self_ping(QueueKind::Ladder);
    }

    #[test]
    fn self_ping_two_tier_ladder() {
        run_self_ping(QueueKind::TwoTierLadder);
    }

    #[test]
    fn self_ping_lock_free_skip() {
        run_self_ping(QueueKind::LockFreeSkip);
    }

    /// Passes a token to the next agent in a fixed cycle.
    struct RingHop {
        next: AgentId,
        deliveries: Arc<AtomicU64>,
    }

    impl Agent for RingHop {
        fn initialize(&mut self, ctx: &mut AgentContext<'_>) {
            if ctx.agent_id() == 1 {
                ctx.schedule_event(self.next, 1.0, vec![]).unwrap();
            }
        }
        fn execute_task(&mut self, ctx: &mut AgentContext<'_>, events: &[Arc<Event>]) {
            self.deliveries.fetch_add(events.len() as u64, Ordering::Relaxed);
            ctx.schedule_event(self.next, ctx.lvt() + 1.0, vec![]).unwrap();
        }
        fn finalize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn restore(&mut self, _snapshot: &[u8]) {}
    }

    #[test]
    fn three_agent_ring_on_two_ranks() {
        // Scenario: agents 1 and 3 on rank 0, agent 2 on rank 1, token cycle
        // 1 -> 2 -> 3 -> 1 until end time 100.
        let mut mesh = ChannelTransport::mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        let count0 = Arc::new(AtomicU64::new(0));
        let count1 = Arc::new(AtomicU64::new(0));

        let c0 = Arc::clone(&count0);
        let h0 = thread::spawn(move || {
            let mut sim = Simulation::new(config(100.0), Box::new(t0)).unwrap();
            sim.register(
                1,
                Box::new(RingHop {
                    next: 2,
                    deliveries: Arc::clone(&c0),
                }),
            )
            .unwrap();
            sim.register(
                3,
                Box::new(RingHop {
                    next: 1,
                    deliveries: Arc::clone(&c0),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let c1 = Arc::clone(&count1);
        let h1 = thread::spawn(move || {
            let mut sim = Simulation::new(config(100.0), Box::new(t1)).unwrap();
            sim.register(
                2,
                Box::new(RingHop {
                    next: 3,
                    deliveries: Arc::clone(&c1),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let s0 = h0.join().unwrap();
        let s1 = h1.join().unwrap();

        // One hop per unit: deliveries at t = 1..=100 across the cycle.
        let total = count0.load(Ordering::Relaxed) + count1.load(Ordering::Relaxed);
        assert_eq!(total, 100);
        assert!(s0.final_gvt >= 100.0);
        assert!(s1.final_gvt >= 100.0);
        for s in [&s0, &s1] {
            assert_eq!(s.drained_events, 0);
            assert_eq!(s.drained_negatives, 0);
            assert_eq!(s.live_events, 0);
        }
    }

    /// Rank 1 hosts agent B; ranks send it events out of order to force a
    /// straggler rollback (scenario: A at 5, then C at 3).
    struct Accumulator {
        seen: Arc<std::sync::Mutex<Vec<Time>>>,
        downstream: Option<AgentId>,
    }

    impl Agent for Accumulator {
        fn initialize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn execute_task(&mut self, ctx: &mut AgentContext<'_>, events: &[Arc<Event>]) {
            for _ in events {
                self.seen.lock().unwrap().push(ctx.lvt());
            }
            if let Some(to) = self.downstream {
                ctx.schedule_event(to, ctx.lvt() + 10.0, vec![]).unwrap();
            }
        }
        fn finalize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn snapshot(&self) -> Vec<u8> {
            let seen = self.seen.lock().unwrap();
            let mut bytes = Vec::with_capacity(seen.len() * 8);
            for t in seen.iter() {
                bytes.extend_from_slice(&t.to_le_bytes());
            }
            bytes
        }
        fn restore(&mut self, snapshot: &[u8]) {
            let mut seen = self.seen.lock().unwrap();
            seen.clear();
            for chunk in snapshot.chunks_exact(8) {
                seen.push(f64::from_le_bytes(chunk.try_into().unwrap()));
            }
        }
    }

    /// Emits one event at its trigger time, then stays quiet even across
    /// replays (later deliveries are downstream echoes, not triggers).
    struct OneShot {
        to: AgentId,
        at: Time,
        fire_at: Time,
        fired: bool,
    }

    impl Agent for OneShot {
        fn initialize(&mut self, ctx: &mut AgentContext<'_>) {
            ctx.schedule_event(ctx.agent_id(), self.fire_at, vec![]).unwrap();
        }
        fn execute_task(&mut self, ctx: &mut AgentContext<'_>, _events: &[Arc<Event>]) {
            if !self.fired && ctx.lvt() == self.fire_at {
                self.fired = true;
                ctx.schedule_event(self.to, self.at, vec![]).unwrap();
            }
        }
        fn finalize(&mut self, _ctx: &mut AgentContext<'_>) {}
        fn snapshot(&self) -> Vec<u8> {
            vec![self.fired as u8]
        }
        fn restore(&mut self, snapshot: &[u8]) {
            self.fired = snapshot.first().copied().unwrap_or(0) != 0;
        }
    }

    #[test]
    fn straggler_rolls_back_and_replays_in_order() {
        // A (agent 10, rank 0) sends B an event at virtual 5 before C
        // (agent 11, rank 0) sends one at virtual 3, so B on rank 1 may
        // speculatively run time 5, send downstream, and then see the
        // straggler. Committed order must come out 3 then 5 regardless of
        // which interleaving actually happened.
        let mut mesh = ChannelTransport::mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_b = Arc::clone(&seen);
        let h1 = thread::spawn(move || {
            let mut sim = Simulation::new(config(200.0), Box::new(t1)).unwrap();
            sim.register(
                2,
                Box::new(Accumulator {
                    seen: seen_b,
                    downstream: Some(10),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let h0 = thread::spawn(move || {
            let mut sim = Simulation::new(config(200.0), Box::new(t0)).unwrap();
            // A fires early in wall-clock, event lands at virtual 5.
            sim.register(
                10,
                Box::new(OneShot {
                    to: 2,
                    at: 5.0,
                    fire_at: 1.0,
                    fired: false,
                }),
            )
            .unwrap();
            // C fires later in wall-clock (virtual 2), event lands at 3.
            sim.register(
                11,
                Box::new(OneShot {
                    to: 2,
                    at: 3.0,
                    fire_at: 2.0,
                    fired: false,
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let s0 = h0.join().unwrap();
        let s1 = h1.join().unwrap();

        // Whatever interleaving happened, the committed order is 3 then 5.
        let seen = seen.lock().unwrap();
        let mut idx = Vec::new();
        for t in seen.iter() {
            if *t == 3.0 || *t == 5.0 {
                idx.push(*t);
            }
        }
        assert_eq!(idx, vec![3.0, 5.0]);
        for s in [&s0, &s1] {
            assert_eq!(s.drained_events, 0);
            assert_eq!(s.live_events, 0);
        }
    }

    #[test]
    fn conservative_two_ranks_exchange_to_the_end() {
        // GVT progress scenario: two ranks, one agent each, events every
        // unit until end time 50, lookahead 1.
        let mut mesh = ChannelTransport::mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        let count0 = Arc::new(AtomicU64::new(0));
        let count1 = Arc::new(AtomicU64::new(0));

        let conservative = SimConfig {
            lookahead: 1.0,
            ..config(50.0)
        };

        let cfg = conservative.clone();
        let c0 = Arc::clone(&count0);
        let h0 = thread::spawn(move || {
            let mut sim = Simulation::new(cfg, Box::new(t0)).unwrap();
            sim.register(
                1,
                Box::new(RingHop {
                    next: 2,
                    deliveries: Arc::clone(&c0),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let cfg = conservative.clone();
        let c1 = Arc::clone(&count1);
        let h1 = thread::spawn(move || {
            let mut sim = Simulation::new(cfg, Box::new(t1)).unwrap();
            sim.register(
                2,
                Box::new(RingHop {
                    next: 1,
                    deliveries: Arc::clone(&c1),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let s0 = h0.join().unwrap();
        let s1 = h1.join().unwrap();

        let total = count0.load(Ordering::Relaxed) + count1.load(Ordering::Relaxed);
        assert_eq!(total, 50);
        assert!(s0.final_gvt >= 50.0);
        assert!(s1.final_gvt >= 50.0);
        // The conservative invariants held: rollback machinery never fired.
        assert_eq!(s0.rollbacks, 0);
        assert_eq!(s1.rollbacks, 0);
    }

    #[test]
    fn optimistic_two_ranks_exchange_to_the_end() {
        // Same exchange as the conservative variant, under Time Warp: GVT
        // rounds must carry the run to the end and past it.
        let mut mesh = ChannelTransport::mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        let count0 = Arc::new(AtomicU64::new(0));
        let count1 = Arc::new(AtomicU64::new(0));

        let c0 = Arc::clone(&count0);
        let h0 = thread::spawn(move || {
            let mut sim = Simulation::new(config(50.0), Box::new(t0)).unwrap();
            sim.register(
                1,
                Box::new(RingHop {
                    next: 2,
                    deliveries: Arc::clone(&c0),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let c1 = Arc::clone(&count1);
        let h1 = thread::spawn(move || {
            let mut sim = Simulation::new(config(50.0), Box::new(t1)).unwrap();
            sim.register(
                2,
                Box::new(RingHop {
                    next: 1,
                    deliveries: Arc::clone(&c1),
                }),
            )
            .unwrap();
            sim.run().unwrap()
        });
        let s0 = h0.join().unwrap();
        let s1 = h1.join().unwrap();

        let total = count0.load(Ordering::Relaxed) + count1.load(Ordering::Relaxed);
        assert_eq!(total, 50);
        assert!(s0.final_gvt >= 50.0);
        assert!(s1.final_gvt >= 50.0);
        assert!(s0.gvt_rounds >= 1);
        for s in [&s0, &s1] {
            assert_eq!(s.drained_events, 0);
            assert_eq!(s.live_events, 0);
        }
    }

    #[test]
    fn stop_hook_finalizes_cleanly() {
        let deliveries = Arc::new(AtomicU64::new(0));
        let mut sim = single_rank(config(1_000_000.0));
        sim.register(
            1,
            Box::new(SelfPing {
                deliveries: Arc::clone(&deliveries),
            }),
        )
        .unwrap();
        let stop = sim.stop_handle();
        stop.store(true, Ordering::Relaxed);
        let stats = sim.run().unwrap();
        // Nothing dispatched; the initial self-event and its output-history
        // copy were still alive and get reported, not leaked silently.
        assert_eq!(stats.batches, 0);
        assert_eq!(stats.drained_events, 1);
        assert_eq!(stats.live_events, 1);
    }
}
