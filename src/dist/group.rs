//! Collective operations over a [`Transport`].
//!
//! Every collective consumes one sequence number on every rank, so all ranks
//! must issue the same collectives in the same order. Sequence numbers carry
//! an epoch in the high 32 bits: rank 0 opens a new epoch with each command it
//! broadcasts, and anything left over from an older epoch (an abandoned
//! request) is discarded on arrival.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::transport::{decode_f32, encode_f32, Message, MessageKind, RecvError, Transport};
use crate::config::TimeoutConfig;
use crate::error::{ErrorCode, Result, TalkError};

const EPOCH_SHIFT: u32 = 32;

fn epoch_of(seq: u64) -> u64 {
    seq >> EPOCH_SHIFT
}

/// Handle on the process group for one rank.
pub struct ProcessGroup {
    transport: Box<dyn Transport>,
    epoch: u64,
    op: u64,
    stash: Vec<Message>,
    collective_timeout: Duration,
    gather_timeout: Duration,
}

impl ProcessGroup {
    pub fn new(transport: Box<dyn Transport>, timeouts: &TimeoutConfig) -> Self {
        Self {
            transport,
            epoch: 0,
            op: 0,
            stash: Vec::new(),
            collective_timeout: timeouts.collective(),
            gather_timeout: timeouts.gather(),
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Current epoch (number of commands seen).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn next_seq(&mut self) -> u64 {
        let seq = (self.epoch << EPOCH_SHIFT) | self.op;
        self.op += 1;
        seq
    }

    fn current_floor(&self) -> u64 {
        (self.epoch << EPOCH_SHIFT) | self.op.saturating_sub(1)
    }

    fn send(&self, dst: usize, seq: u64, kind: MessageKind, payload: Vec<u8>) -> Result<()> {
        self.transport
            .send(Message::new(self.rank(), dst, seq, kind, payload))
    }

    /// Takes the stashed message matching `(src, kind, seq)`, if any.
    fn take_stashed(&mut self, src: usize, kind: MessageKind, seq: u64) -> Option<Message> {
        let pos = self
            .stash
            .iter()
            .position(|m| m.src == src && m.kind == kind && m.seq == seq)?;
        Some(self.stash.swap_remove(pos))
    }

    /// Receives one message from each rank in `from` for the collective `seq`.
    ///
    /// Returns payloads in the order of `from`, or the ranks still missing at
    /// the deadline.
    fn collect(
        &mut self,
        from: &[usize],
        kind: MessageKind,
        seq: u64,
        timeout: Duration,
    ) -> std::result::Result<Vec<Vec<u8>>, Vec<usize>> {
        let mut got: Vec<Option<Vec<u8>>> = vec![None; from.len()];
        for (slot, &src) in got.iter_mut().zip(from) {
            if let Some(m) = self.take_stashed(src, kind, seq) {
                *slot = Some(m.payload);
            }
        }

        let deadline = Instant::now() + timeout;
        while got.iter().any(Option::is_none) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let msg = match self.transport.recv_timeout(remaining) {
                Ok(m) => m,
                Err(RecvError::Timeout) => break,
                Err(RecvError::Disconnected) => break,
            };
            if msg.seq < seq {
                trace!("Discarding stale {:?} from rank {} (seq {:#x})", msg.kind, msg.src, msg.seq);
                continue;
            }
            if msg.seq == seq && msg.kind == kind {
                if let Some(i) = from.iter().position(|&r| r == msg.src) {
                    if got[i].is_none() {
                        got[i] = Some(msg.payload);
                        continue;
                    }
                }
            }
            self.stash.push(msg);
        }

        if got.iter().all(Option::is_some) {
            Ok(got.into_iter().flatten().collect())
        } else {
            Err(from
                .iter()
                .zip(&got)
                .filter(|(_, g)| g.is_none())
                .map(|(&r, _)| r)
                .collect())
        }
    }

    /// Blocks until every rank has reached this barrier.
    pub fn barrier(&mut self) -> Result<()> {
        let seq = self.next_seq();
        let me = self.rank();
        let all: Vec<usize> = (0..self.world_size()).collect();
        for &dst in &all {
            self.send(dst, seq, MessageKind::Barrier, Vec::new())?;
        }
        let timeout = self.collective_timeout;
        self.collect(&all, MessageKind::Barrier, seq, timeout)
            .map_err(|missing| {
                TalkError::barrier_timeout("Barrier", &missing, timeout.as_millis())
            })?;
        trace!("Rank {} passed barrier {:#x}", me, seq);
        Ok(())
    }

    /// Rank 0 sends `payload` to every rank; every rank returns it.
    ///
    /// Non-root ranks pass `None`.
    pub fn broadcast(&mut self, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let seq = self.next_seq();
        if self.is_root() {
            let payload = payload.unwrap_or_default();
            for dst in 1..self.world_size() {
                self.send(dst, seq, MessageKind::Broadcast, payload.clone())?;
            }
            return Ok(payload);
        }
        let timeout = self.collective_timeout;
        self.collect(&[0], MessageKind::Broadcast, seq, timeout)
            .map(|mut v| v.remove(0))
            .map_err(|missing| {
                TalkError::barrier_timeout("Broadcast", &missing, timeout.as_millis())
            })
    }

    /// Rank 0 opens a new epoch and broadcasts a command to every rank.
    pub fn broadcast_command(&mut self, payload: Vec<u8>) -> Result<()> {
        if !self.is_root() {
            return Err(TalkError::new(
                ErrorCode::BarrierTimeout,
                "Only rank 0 issues commands",
            ));
        }
        self.epoch += 1;
        self.op = 0;
        let seq = self.next_seq();
        for dst in 1..self.world_size() {
            self.send(dst, seq, MessageKind::Command, payload.clone())?;
        }
        debug!("Rank 0 opened epoch {}", self.epoch);
        Ok(())
    }

    /// Waits for the next command from rank 0 and adopts its epoch.
    ///
    /// Returns `Ok(None)` if `timeout` elapses first (`None` waits forever).
    pub fn recv_command(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(pos) = self
                .stash
                .iter()
                .position(|m| m.kind == MessageKind::Command && m.src == 0 && epoch_of(m.seq) > self.epoch)
            {
                let cmd = self.stash.swap_remove(pos);
                self.adopt_epoch(cmd.seq);
                return Ok(Some(cmd.payload));
            }

            let wait = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining
                }
                None => Duration::from_secs(3600),
            };
            match self.transport.recv_timeout(wait) {
                Ok(msg) if epoch_of(msg.seq) > self.epoch => self.stash.push(msg),
                Ok(msg) => trace!("Discarding stale {:?} from rank {}", msg.kind, msg.src),
                Err(RecvError::Timeout) => {}
                Err(RecvError::Disconnected) => {
                    return Err(TalkError::new(
                        ErrorCode::BarrierTimeout,
                        "Process group transport closed while waiting for a command",
                    ))
                }
            }
        }
    }

    fn adopt_epoch(&mut self, seq: u64) {
        self.epoch = epoch_of(seq);
        self.op = (seq & ((1u64 << EPOCH_SHIFT) - 1)) + 1;
        let floor = self.current_floor();
        self.stash.retain(|m| m.seq >= floor);
        debug!("Rank {} adopted epoch {}", self.rank(), self.epoch);
    }

    /// Personalized exchange among `members` (which must include this rank).
    ///
    /// `chunks[i]` goes to `members[i]`; the result holds what `members[i]`
    /// sent here. Every rank of the group must call this once per round, each
    /// with its own member list.
    pub fn all_to_all_in(&mut self, members: &[usize], chunks: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let seq = self.next_seq();
        if chunks.len() != members.len() {
            return Err(TalkError::inference(format!(
                "all_to_all got {} chunks for {} members",
                chunks.len(),
                members.len()
            )));
        }
        for (&dst, chunk) in members.iter().zip(chunks) {
            self.send(dst, seq, MessageKind::AllToAll, encode_f32(&chunk))?;
        }
        let timeout = self.collective_timeout;
        let payloads = self
            .collect(members, MessageKind::AllToAll, seq, timeout)
            .map_err(|missing| {
                TalkError::barrier_timeout("All-to-all", &missing, timeout.as_millis())
            })?;
        Ok(payloads.iter().map(|p| decode_f32(p)).collect())
    }

    /// Personalized exchange among all ranks.
    pub fn all_to_all(&mut self, chunks: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let all: Vec<usize> = (0..self.world_size()).collect();
        self.all_to_all_in(&all, chunks)
    }

    /// Every rank receives every rank's `local`, in rank order.
    pub fn all_gather(&mut self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        let seq = self.next_seq();
        let all: Vec<usize> = (0..self.world_size()).collect();
        let bytes = encode_f32(local);
        for &dst in &all {
            self.send(dst, seq, MessageKind::AllGather, bytes.clone())?;
        }
        let timeout = self.collective_timeout;
        let payloads = self
            .collect(&all, MessageKind::AllGather, seq, timeout)
            .map_err(|missing| {
                TalkError::barrier_timeout("All-gather", &missing, timeout.as_millis())
            })?;
        Ok(payloads.iter().map(|p| decode_f32(p)).collect())
    }

    /// Sends `local` to rank 0. Rank 0 returns every rank's data in rank
    /// order; other ranks return `None` as soon as they have sent.
    pub fn gather(&mut self, local: Vec<f32>) -> Result<Option<Vec<Vec<f32>>>> {
        let seq = self.next_seq();
        self.send(0, seq, MessageKind::Gather, encode_f32(&local))?;
        drop(local);
        if !self.is_root() {
            return Ok(None);
        }
        let all: Vec<usize> = (0..self.world_size()).collect();
        let timeout = self.gather_timeout;
        let payloads = self
            .collect(&all, MessageKind::Gather, seq, timeout)
            .map_err(|missing| TalkError::gather_timeout(&missing, timeout.as_millis()))?;
        Ok(Some(payloads.iter().map(|p| decode_f32(p)).collect()))
    }

    /// Number of messages held for future collectives.
    pub fn pending(&self) -> usize {
        self.stash.len()
    }
}
