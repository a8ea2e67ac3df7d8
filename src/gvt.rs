//! Global Virtual Time estimation.
//!
//! The optimistic path runs Mattern's colored-token algorithm: every remote
//! send bumps a per-(color, destination) counter, every remote receive drops
//! the receiver's own entry, and a control token circulates the ring folding
//! those vectors until the closing color's in-flight sum drains to zero. The
//! initiator then broadcasts the estimate and adopts it only after every rank
//! acknowledged, which keeps the ring sound when it empties concurrently with
//! the broadcast.
//!
//! The conservative path skips the ring entirely: a blocking min-reduction
//! over rank LGVTs whenever the local kernel stalls.

use tracing::{debug, trace};

use crate::comm::{Communicator, GvtToken};
use crate::event::{Color, Event, Rank, Time, TIME_INFINITY};
use crate::KernelError;

/// Per-rank state of the GVT protocol.
pub struct GvtManager {
    rank: Rank,
    num_ranks: u32,
    gvt: Time,
    active_color: Color,
    /// Vector counters indexed [color][rank]: sends increment the
    /// destination entry, receives decrement our own.
    counts: [Vec<i64>; 2],
    /// Minimum receive time of events sent under the new color since this
    /// rank's cut.
    send_min: Time,
    /// Minimum receive time of remote sends since the last min-reduction;
    /// covers in-flight events on the conservative path.
    send_floor: Time,
    round_active: bool,
    acks_pending: u32,
    pending_estimate: Time,
    rounds_completed: u64,
    /// LGVT at which the last round started, for the period trigger.
    last_round_lgvt: Time,
}

/// What a completed protocol step asks the simulation to do.
#[derive(Debug, PartialEq)]
pub enum GvtOutcome {
    /// Nothing changed.
    Quiet,
    /// A new GVT took effect locally; commit and collect below it.
    Adopted(Time),
}

impl GvtManager {
    pub fn new(rank: Rank, num_ranks: u32, start_time: Time) -> Self {
        Self {
            rank,
            num_ranks,
            gvt: start_time,
            active_color: Color::White,
            counts: [vec![0; num_ranks as usize], vec![0; num_ranks as usize]],
            send_min: TIME_INFINITY,
            send_floor: TIME_INFINITY,
            round_active: false,
            acks_pending: 0,
            pending_estimate: TIME_INFINITY,
            rounds_completed: 0,
            last_round_lgvt: start_time,
        }
    }

    pub fn gvt(&self) -> Time {
        self.gvt
    }

    pub fn active_color(&self) -> Color {
        self.active_color
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    pub fn round_active(&self) -> bool {
        self.round_active
    }

    /// Stamp and account an outgoing remote event. Must be called for every
    /// event handed to the communicator.
    pub fn on_remote_send(&mut self, event: &Event, dst: Rank) {
        let color = self.active_color;
        event.set_color(color);
        self.counts[color.index()][dst as usize] += 1;
        self.send_floor = self.send_floor.min(event.recv_time());
        // Sends since this rank's cut cap how low the closing round's
        // estimate may go; the counter resets at the next cut.
        self.send_min = self.send_min.min(event.recv_time());
    }

    /// Account an incoming remote event before it is scheduled.
    pub fn on_remote_receive(&mut self, event: &Event, src: Rank) {
        let _ = src;
        self.counts[event.color().index()][self.rank as usize] -= 1;
    }

    /// Rank 0: open a round if none is running and the virtual clock moved
    /// at least `period` since the last one (or `force` is set).
    pub fn maybe_start_round(
        &mut self,
        comm: &mut Communicator,
        lgvt: Time,
        period: Time,
        force: bool,
    ) -> Result<GvtOutcome, KernelError> {
        if self.rank != 0 || self.round_active {
            return Ok(GvtOutcome::Quiet);
        }
        if !force && lgvt.is_finite() && lgvt - self.last_round_lgvt < period {
            return Ok(GvtOutcome::Quiet);
        }
        self.last_round_lgvt = lgvt;
        if self.num_ranks == 1 {
            // Degenerate ring: the local floor is the global floor.
            let outcome = self.adopt(lgvt)?;
            self.rounds_completed += 1;
            return Ok(outcome);
        }
        self.round_active = true;
        let old = self.active_color;
        self.active_color = old.flip();
        self.send_min = TIME_INFINITY;
        let mut token = GvtToken {
            color: old,
            counters: vec![0; self.num_ranks as usize],
            t_min: TIME_INFINITY,
        };
        self.fold_into(&mut token, lgvt);
        trace!(round = self.rounds_completed + 1, "gvt round opened");
        comm.send_control(self.next_in_ring(), &token)?;
        Ok(GvtOutcome::Quiet)
    }

    /// Handle the control token. Non-initiators fold and forward; the
    /// initiator completes the round once the closing color has drained,
    /// otherwise sends the token around again to pick up fresh receipts.
    pub fn on_control(
        &mut self,
        comm: &mut Communicator,
        mut token: GvtToken,
        lgvt: Time,
    ) -> Result<GvtOutcome, KernelError> {
        if self.rank != 0 {
            if self.active_color == token.color {
                // First sight of this round's token: this is our cut.
                self.active_color = self.active_color.flip();
                self.send_min = TIME_INFINITY;
            }
            self.fold_into(&mut token, lgvt);
            comm.send_control(self.next_in_ring(), &token)?;
            return Ok(GvtOutcome::Quiet);
        }

        self.fold_into(&mut token, lgvt);
        let in_flight: i64 = token.counters.iter().sum();
        if in_flight > 0 {
            // Mattern's waiting condition: closing-color events are still on
            // the wire somewhere; circulate again for the receipts.
            trace!(in_flight, "gvt token held, re-circulating");
            comm.send_control(self.next_in_ring(), &token)?;
            return Ok(GvtOutcome::Quiet);
        }
        if in_flight < 0 {
            return Err(KernelError::InvariantViolation(format!(
                "closing-color in-flight count went negative: {in_flight}"
            )));
        }
        self.complete_round(comm, token.t_min)
    }

    /// Non-initiators adopt the broadcast estimate and acknowledge.
    pub fn on_estimate(
        &mut self,
        comm: &mut Communicator,
        estimate: Time,
    ) -> Result<GvtOutcome, KernelError> {
        let outcome = self.adopt(estimate)?;
        comm.send_ack(0)?;
        Ok(outcome)
    }

    /// Initiator-side ack counting; the initiator's own GVT moves last.
    pub fn on_ack(&mut self) -> Result<GvtOutcome, KernelError> {
        if self.acks_pending == 0 {
            return Err(KernelError::InvariantViolation(
                "gvt acknowledgement with no broadcast outstanding".into(),
            ));
        }
        self.acks_pending -= 1;
        if self.acks_pending > 0 {
            return Ok(GvtOutcome::Quiet);
        }
        let estimate = self.pending_estimate;
        self.round_active = false;
        self.rounds_completed += 1;
        self.adopt(estimate)
    }

    /// Conservative / stall path: blocking min-reduction over the local time
    /// floor. Sends still on the wire are covered by `send_floor`, which
    /// resets once the round that counted them completes.
    pub fn force_update(
        &mut self,
        comm: &mut Communicator,
        lgvt: Time,
    ) -> Result<GvtOutcome, KernelError> {
        if self.num_ranks == 1 {
            return self.adopt(lgvt);
        }
        let contribution = lgvt.min(self.send_floor);
        let reduced = comm.all_reduce_min(contribution)?;
        self.send_floor = TIME_INFINITY;
        self.adopt(reduced)
    }

    fn complete_round(
        &mut self,
        comm: &mut Communicator,
        t_min: Time,
    ) -> Result<GvtOutcome, KernelError> {
        debug!(estimate = t_min, "gvt round converged");
        for dst in 1..self.num_ranks {
            comm.send_estimate(dst, t_min)?;
        }
        self.acks_pending = self.num_ranks - 1;
        self.pending_estimate = t_min;
        Ok(GvtOutcome::Quiet)
    }

    /// Fold this rank's closing-color vector and time floor into the token.
    fn fold_into(&mut self, token: &mut GvtToken, lgvt: Time) {
        let closing = token.color.index();
        for (entry, local) in token.counters.iter_mut().zip(&mut self.counts[closing]) {
            *entry += *local;
            *local = 0;
        }
        token.t_min = token.t_min.min(lgvt).min(self.send_min);
    }

    fn adopt(&mut self, estimate: Time) -> Result<GvtOutcome, KernelError> {
        if estimate < self.gvt {
            return Err(KernelError::GvtRegression {
                from: self.gvt,
                to: estimate,
            });
        }
        if estimate == self.gvt {
            return Ok(GvtOutcome::Quiet);
        }
        self.gvt = estimate;
        Ok(GvtOutcome::Adopted(estimate))
    }

    fn next_in_ring(&self) -> Rank {
        (self.rank + 1) % self.num_ranks
    }
}
