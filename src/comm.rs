//! Rank-to-rank transport and the registration exchange.
//!
//! The kernel consumes a small [`Transport`] contract: typed sends, a
//! non-blocking poll, and a blocking min-reduction, with exactly-once FIFO
//! delivery per (source, destination) pair - the GVT proof leans on that
//! ordering. [`ChannelTransport`] satisfies it in-process with one channel
//! per ordered rank pair; an MPI-backed implementation would slot in behind
//! the same trait.
//!
//! The wire format is fixed little-endian: u64 ids, IEEE-754 binary64 times,
//! one byte each for sign and color.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::trace;

use crate::event::{AgentId, Color, Event, Rank, Sign, Time};
use crate::KernelError;

/// Message classes the kernel exchanges between ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Event = 0,
    GvtControl = 1,
    GvtEstimate = 2,
    GvtAck = 3,
    AgentList = 4,
    AgentMap = 5,
}

/// Point-to-point best-effort transport between ranks.
pub trait Transport: Send {
    fn rank(&self) -> Rank;

    fn num_ranks(&self) -> u32;

    fn send(&self, to: Rank, kind: MsgKind, bytes: Vec<u8>) -> Result<(), KernelError>;

    /// Non-blocking receive from any peer.
    fn try_recv(&mut self) -> Result<Option<(Rank, MsgKind, Vec<u8>)>, KernelError>;

    /// Blocking min-reduction over one double; every rank must participate.
    fn all_reduce_min(&mut self, value: f64) -> Result<f64, KernelError>;
}

type Packet = (Rank, MsgKind, Vec<u8>);

/// In-process transport: one unbounded FIFO channel per ordered rank pair,
/// plus a dedicated channel pair for reductions so they never interleave with
/// event traffic.
pub struct ChannelTransport {
    rank: Rank,
    num_ranks: u32,
    senders: Vec<Option<Sender<Packet>>>,
    receivers: Vec<Option<Receiver<Packet>>>,
    reduce_senders: Vec<Option<Sender<f64>>>,
    reduce_receivers: Vec<Option<Receiver<f64>>>,
    next_poll: usize,
}

impl ChannelTransport {
    /// Build a fully connected mesh of `n` rank endpoints.
    pub fn mesh(n: u32) -> Vec<ChannelTransport> {
        let n = n as usize;
        // Outbound indexed [src][dst], inbound indexed [dst][src].
        let mut data_tx: Vec<Vec<Option<Sender<Packet>>>> = (0..n).map(|_| Vec::new()).collect();
        let mut data_rx: Vec<Vec<Option<Receiver<Packet>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut red_tx: Vec<Vec<Option<Sender<f64>>>> = (0..n).map(|_| Vec::new()).collect();
        let mut red_rx: Vec<Vec<Option<Receiver<f64>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    data_tx[src].push(None);
                    red_tx[src].push(None);
                    continue;
                }
                let (tx, rx) = unbounded();
                data_tx[src].push(Some(tx));
                data_rx[dst][src] = Some(rx);
                let (tx, rx) = unbounded();
                red_tx[src].push(Some(tx));
                red_rx[dst][src] = Some(rx);
            }
        }
        (0..n)
            .map(|rank| ChannelTransport {
                rank: rank as Rank,
                num_ranks: n as u32,
                senders: std::mem::take(&mut data_tx[rank]),
                receivers: std::mem::take(&mut data_rx[rank]),
                reduce_senders: std::mem::take(&mut red_tx[rank]),
                reduce_receivers: std::mem::take(&mut red_rx[rank]),
                next_poll: 0,
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> u32 {
        self.num_ranks
    }

    fn send(&self, to: Rank, kind: MsgKind, bytes: Vec<u8>) -> Result<(), KernelError> {
        let slot = self
            .senders
            .get(to as usize)
            .ok_or_else(|| KernelError::Transport(format!("no such rank {to}")))?;
        match slot {
            Some(tx) => {
                if tx.send((self.rank, kind, bytes)).is_err() {
                    // The peer already finalized and dropped its endpoint;
                    // anything still in flight is below its end time.
                    trace!(to, "send after peer finalize dropped");
                }
                Ok(())
            }
            None => Err(KernelError::Transport("send to self".into())),
        }
    }

    fn try_recv(&mut self) -> Result<Option<(Rank, MsgKind, Vec<u8>)>, KernelError> {
        let n = self.receivers.len();
        for step in 0..n {
            let idx = (self.next_poll + step) % n;
            if let Some(rx) = &self.receivers[idx] {
                match rx.try_recv() {
                    Ok(packet) => {
                        self.next_poll = (idx + 1) % n;
                        return Ok(Some(packet));
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                }
            }
        }
        Ok(None)
    }

    fn all_reduce_min(&mut self, value: f64) -> Result<f64, KernelError> {
        for slot in self.reduce_senders.iter().flatten() {
            if slot.send(value).is_err() {
                return Err(KernelError::Transport(
                    "peer left during min-reduction".into(),
                ));
            }
        }
        let mut acc = value;
        for rx in self.reduce_receivers.iter().flatten() {
            match rx.recv() {
                Ok(v) => acc = acc.min(v),
                Err(_) => {
                    return Err(KernelError::Transport(
                        "peer left during min-reduction".into(),
                    ))
                }
            }
        }
        Ok(acc)
    }
}

// ---- wire codec -----------------------------------------------------------

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn get_u64(buf: &[u8], at: &mut usize) -> Result<u64, KernelError> {
    let end = *at + 8;
    let raw: [u8; 8] = buf
        .get(*at..end)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| KernelError::WireFormat("truncated u64".into()))?;
    *at = end;
    Ok(u64::from_le_bytes(raw))
}

fn get_f64(buf: &[u8], at: &mut usize) -> Result<f64, KernelError> {
    Ok(f64::from_bits(get_u64(buf, at)?))
}

fn get_u8(buf: &[u8], at: &mut usize) -> Result<u8, KernelError> {
    let b = *buf
        .get(*at)
        .ok_or_else(|| KernelError::WireFormat("truncated byte".into()))?;
    *at += 1;
    Ok(b)
}

/// Encode an event for the wire, stamping the given color.
pub fn encode_event(event: &Event, color: Color) -> Vec<u8> {
    let mut buf = Vec::with_capacity(34 + event.payload().len());
    put_u64(&mut buf, event.sender());
    put_u64(&mut buf, event.receiver());
    put_f64(&mut buf, event.sent_time());
    put_f64(&mut buf, event.recv_time());
    buf.push(event.sign() as u8);
    buf.push(color as u8);
    buf.extend_from_slice(event.payload());
    buf
}

pub fn decode_event(buf: &[u8]) -> Result<Arc<Event>, KernelError> {
    let mut at = 0;
    let sender = get_u64(buf, &mut at)?;
    let receiver = get_u64(buf, &mut at)?;
    let sent = get_f64(buf, &mut at)?;
    let recv = get_f64(buf, &mut at)?;
    let sign = match get_u8(buf, &mut at)? {
        0 => Sign::Positive,
        1 => Sign::Anti,
        other => return Err(KernelError::WireFormat(format!("bad sign byte {other}"))),
    };
    let color = Color::from_u8(get_u8(buf, &mut at)?)?;
    Event::from_wire(sender, receiver, sent, recv, sign, color, buf[at..].to_vec())
}

/// The circulating GVT control token: old-round color, per-rank vector
/// counters, and the running t-min.
#[derive(Clone, Debug, PartialEq)]
pub struct GvtToken {
    pub color: Color,
    pub counters: Vec<i64>,
    pub t_min: Time,
}

pub fn encode_token(token: &GvtToken) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + token.counters.len() * 8);
    buf.push(token.color as u8);
    buf.push(token.counters.len() as u8);
    for c in &token.counters {
        put_u64(&mut buf, *c as u64);
    }
    put_f64(&mut buf, token.t_min);
    buf
}

pub fn decode_token(buf: &[u8]) -> Result<GvtToken, KernelError> {
    let mut at = 0;
    let color = Color::from_u8(get_u8(buf, &mut at)?)?;
    let len = get_u8(buf, &mut at)? as usize;
    let mut counters = Vec::with_capacity(len);
    for _ in 0..len {
        counters.push(get_u64(buf, &mut at)? as i64);
    }
    let t_min = get_f64(buf, &mut at)?;
    Ok(GvtToken {
        color,
        counters,
        t_min,
    })
}

fn encode_agent_list(agents: &[AgentId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(agents.len() * 8);
    for a in agents {
        put_u64(&mut buf, *a);
    }
    buf
}

fn decode_agent_list(buf: &[u8]) -> Result<Vec<AgentId>, KernelError> {
    let mut at = 0;
    let mut out = Vec::with_capacity(buf.len() / 8);
    while at < buf.len() {
        out.push(get_u64(buf, &mut at)?);
    }
    Ok(out)
}

fn encode_agent_map(map: &HashMap<AgentId, Rank>) -> Vec<u8> {
    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort();
    let mut buf = Vec::with_capacity(pairs.len() * 16);
    for (agent, rank) in pairs {
        put_u64(&mut buf, *agent);
        put_u64(&mut buf, *rank as u64);
    }
    buf
}

fn decode_agent_map(buf: &[u8]) -> Result<HashMap<AgentId, Rank>, KernelError> {
    let mut at = 0;
    let mut map = HashMap::new();
    while at < buf.len() {
        let agent = get_u64(buf, &mut at)?;
        let rank = get_u64(buf, &mut at)? as Rank;
        map.insert(agent, rank);
    }
    Ok(map)
}

/// A message the communicator has decoded for the kernel.
#[derive(Debug)]
pub enum Incoming {
    Event(Arc<Event>),
    GvtControl(GvtToken),
    GvtEstimate(Time),
    GvtAck,
}

/// Typed messaging over the transport plus the frozen agent-to-rank map.
pub struct Communicator {
    transport: Box<dyn Transport>,
    agent_map: HashMap<AgentId, Rank>,
}

impl Communicator {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            agent_map: HashMap::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn num_ranks(&self) -> u32 {
        self.transport.num_ranks()
    }

    /// One-shot registration exchange: every rank reports its local agent
    /// ids, rank 0 assembles the map and broadcasts it. After this returns
    /// the map is frozen and any rank can route any event.
    pub fn register_agents(&mut self, local: &[AgentId]) -> Result<(), KernelError> {
        let me = self.rank();
        let n = self.transport.num_ranks();
        if n == 1 {
            for a in local {
                self.agent_map.insert(*a, me);
            }
            return Ok(());
        }
        if me == 0 {
            for a in local {
                self.agent_map.insert(*a, 0);
            }
            let mut reported = 1;
            while reported < n {
                match self.transport.try_recv()? {
                    Some((src, MsgKind::AgentList, bytes)) => {
                        for a in decode_agent_list(&bytes)? {
                            if self.agent_map.insert(a, src).is_some() {
                                return Err(KernelError::InvariantViolation(format!(
                                    "agent {a} registered on more than one rank"
                                )));
                            }
                        }
                        reported += 1;
                    }
                    Some((src, kind, _)) => {
                        return Err(KernelError::Transport(format!(
                            "unexpected {kind:?} from rank {src} during registration"
                        )));
                    }
                    None => std::thread::yield_now(),
                }
            }
            let bytes = encode_agent_map(&self.agent_map);
            for dst in 1..n {
                self.transport.send(dst, MsgKind::AgentMap, bytes.clone())?;
            }
        } else {
            self.transport
                .send(0, MsgKind::AgentList, encode_agent_list(local))?;
            loop {
                match self.transport.try_recv()? {
                    Some((_, MsgKind::AgentMap, bytes)) => {
                        self.agent_map = decode_agent_map(&bytes)?;
                        break;
                    }
                    Some((src, kind, _)) => {
                        return Err(KernelError::Transport(format!(
                            "unexpected {kind:?} from rank {src} during registration"
                        )));
                    }
                    None => std::thread::yield_now(),
                }
            }
        }
        Ok(())
    }

    pub fn home_rank(&self, agent: AgentId) -> Result<Rank, KernelError> {
        self.agent_map
            .get(&agent)
            .copied()
            .ok_or(KernelError::UnknownAgent(agent))
    }

    pub fn is_local(&self, agent: AgentId) -> bool {
        self.agent_map.get(&agent) == Some(&self.rank())
    }

    /// Serialize and ship an event to its receiver's home rank. The payload
    /// is copied onto the wire; event pointers are never shared across ranks.
    pub fn send_event(&mut self, event: &Event, color: Color) -> Result<Rank, KernelError> {
        let dst = self.home_rank(event.receiver())?;
        self.transport
            .send(dst, MsgKind::Event, encode_event(event, color))?;
        Ok(dst)
    }

    pub fn send_control(&mut self, to: Rank, token: &GvtToken) -> Result<(), KernelError> {
        self.transport
            .send(to, MsgKind::GvtControl, encode_token(token))
    }

    pub fn send_estimate(&mut self, to: Rank, gvt: Time) -> Result<(), KernelError> {
        self.transport
            .send(to, MsgKind::GvtEstimate, gvt.to_le_bytes().to_vec())
    }

    pub fn send_ack(&mut self, to: Rank) -> Result<(), KernelError> {
        self.transport.send(to, MsgKind::GvtAck, Vec::new())
    }

    /// Non-blocking poll, decoding into kernel message types.
    pub fn poll(&mut self) -> Result<Option<(Rank, Incoming)>, KernelError> {
        match self.transport.try_recv()? {
            None => Ok(None),
            Some((src, MsgKind::Event, bytes)) => {
                Ok(Some((src, Incoming::Event(decode_event(&bytes)?))))
            }
            Some((src, MsgKind::GvtControl, bytes)) => {
                Ok(Some((src, Incoming::GvtControl(decode_token(&bytes)?))))
            }
            Some((src, MsgKind::GvtEstimate, bytes)) => {
                let mut at = 0;
                Ok(Some((src, Incoming::GvtEstimate(get_f64(&bytes, &mut at)?))))
            }
            Some((src, MsgKind::GvtAck, _)) => Ok(Some((src, Incoming::GvtAck))),
            Some((src, kind, _)) => Err(KernelError::Transport(format!(
                "unexpected {kind:?} from rank {src} after registration"
            ))),
        }
    }

    pub fn all_reduce_min(&mut self, value: f64) -> Result<f64, KernelError> {
        self.transport.all_reduce_min(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_wire_round_trip_preserves_identity_and_color() {
        let e = Event::new(3, 9, 1.5, 4.25, vec![7, 7, 7]).unwrap();
        let bytes = encode_event(&e, Color::Red);
        let back = decode_event(&bytes).unwrap();
        assert!(back.same_identity(&e));
        assert_eq!(back.color(), Color::Red);
        assert_eq!(back.payload(), &[7, 7, 7]);
        assert_eq!(back.sign(), Sign::Positive);
    }

    #[test]
    fn token_wire_round_trip() {
        let token = GvtToken {
            color: Color::White,
            counters: vec![3, -2, 0, 7],
            t_min: 12.5,
        };
        let back = decode_token(&encode_token(&token)).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn mesh_delivers_fifo_per_pair() {
        let mut mesh = ChannelTransport::mesh(2);
        let t1 = mesh.pop().unwrap();
        let mut t0 = mesh.pop().unwrap();
        for i in 0..10u8 {
            t1.send(0, MsgKind::Event, vec![i]).unwrap();
        }
        for i in 0..10u8 {
            let (src, kind, bytes) = t0.try_recv().unwrap().unwrap();
            assert_eq!(src, 1);
            assert_eq!(kind, MsgKind::Event);
            assert_eq!(bytes, vec![i]);
        }
        assert!(t0.try_recv().unwrap().is_none());
    }

    #[test]
    fn registration_freezes_the_same_map_on_all_ranks() {
        let mut mesh = ChannelTransport::mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        let h0 = thread::spawn(move || {
            let mut c = Communicator::new(Box::new(t0));
            c.register_agents(&[1, 2]).unwrap();
            c
        });
        let h1 = thread::spawn(move || {
            let mut c = Communicator::new(Box::new(t1));
            c.register_agents(&[3]).unwrap();
            c
        });
        let c0 = h0.join().unwrap();
        let c1 = h1.join().unwrap();
        for agent in [1u64, 2, 3] {
            assert_eq!(
                c0.home_rank(agent).unwrap(),
                c1.home_rank(agent).unwrap()
            );
        }
        assert!(c0.is_local(1));
        assert!(!c1.is_local(1));
        assert!(c1.is_local(3));
    }

    #[test]
    fn min_reduction_agrees_across_ranks() {
        let mut mesh = ChannelTransport::mesh(3);
        let mut handles = Vec::new();
        for (i, mut t) in mesh.drain(..).enumerate() {
            handles.push(thread::spawn(move || {
                t.all_reduce_min(10.0 + i as f64).unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), 10.0);
        }
    }
}
