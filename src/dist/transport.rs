//! Point-to-point message transports underneath the process group.

use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{ErrorCode, Result, TalkError};

/// What a message belongs to. Collective kinds must match on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Barrier,
    Broadcast,
    Command,
    AllToAll,
    AllGather,
    Gather,
    Hello,
    Welcome,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Barrier => 0,
            MessageKind::Broadcast => 1,
            MessageKind::Command => 2,
            MessageKind::AllToAll => 3,
            MessageKind::AllGather => 4,
            MessageKind::Gather => 5,
            MessageKind::Hello => 6,
            MessageKind::Welcome => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => MessageKind::Barrier,
            1 => MessageKind::Broadcast,
            2 => MessageKind::Command,
            3 => MessageKind::AllToAll,
            4 => MessageKind::AllGather,
            5 => MessageKind::Gather,
            6 => MessageKind::Hello,
            7 => MessageKind::Welcome,
            _ => return None,
        })
    }
}

/// A tagged point-to-point message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub src: usize,
    pub dst: usize,
    pub seq: u64,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(src: usize, dst: usize, seq: u64, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            seq,
            kind,
            payload,
        }
    }
}

/// Why a receive returned without a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

/// Moves messages between the ranks of one process group.
///
/// Messages between a given pair of ranks arrive in send order. Sending to
/// the local rank is allowed and loops back.
pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn send(&self, msg: Message) -> Result<()>;

    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn send(&self, msg: Message) -> Result<()> {
        (**self).send(msg)
    }

    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvError> {
        (**self).recv_timeout(timeout)
    }
}

fn peer_gone(dst: usize) -> TalkError {
    TalkError::new(
        ErrorCode::BarrierTimeout,
        format!("Rank {} is no longer reachable", dst),
    )
}

/// Single-rank transport; every message loops back.
pub struct LoopbackTransport {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn send(&self, msg: Message) -> Result<()> {
        if msg.dst != 0 {
            return Err(peer_gone(msg.dst));
        }
        self.tx.send(msg).map_err(|_| peer_gone(0))
    }

    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RecvError::Timeout,
            RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }
}

/// In-process rank connected to its peers by crossbeam channels.
pub struct ChannelTransport {
    rank: usize,
    peers: Vec<Sender<Message>>,
    rx: Receiver<Message>,
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, msg: Message) -> Result<()> {
        let dst = msg.dst;
        let tx = self.peers.get(dst).ok_or_else(|| peer_gone(dst))?;
        tx.send(msg).map_err(|_| peer_gone(dst))
    }

    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RecvError::Timeout,
            RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }
}

/// Builds a fully connected mesh of `world_size` in-process ranks.
///
/// Element `i` of the result is rank `i`; move each into its own thread.
pub fn channel_mesh(world_size: usize) -> Vec<ChannelTransport> {
    let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
    rxs.into_iter()
        .enumerate()
        .map(|(rank, rx)| ChannelTransport {
            rank,
            peers: txs.clone(),
            rx,
        })
        .collect()
}

/// Little-endian f32 payload encoding.
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`encode_f32`]. Trailing bytes that do not form a value are ignored.
pub fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn loopback_delivers_to_self() {
        let t = LoopbackTransport::new();
        t.send(Message::new(0, 0, 7, MessageKind::Barrier, vec![1, 2]))
            .unwrap();
        let msg = t.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.payload, vec![1, 2]);
        assert!(t.send(Message::new(0, 1, 0, MessageKind::Barrier, vec![])).is_err());
    }

    #[test]
    fn loopback_times_out_when_empty() {
        let t = LoopbackTransport::new();
        assert_eq!(
            t.recv_timeout(Duration::from_millis(5)).unwrap_err(),
            RecvError::Timeout
        );
    }

    #[test]
    fn mesh_routes_between_threads() {
        let mut mesh = channel_mesh(3);
        let t2 = mesh.pop().unwrap();
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let h = thread::spawn(move || {
            let msg = t2.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(msg.src, 1);
            t2.send(Message::new(2, 0, msg.seq + 1, MessageKind::Gather, msg.payload))
                .unwrap();
        });
        t1.send(Message::new(1, 2, 1, MessageKind::Gather, vec![9]))
            .unwrap();
        let back = t0.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((back.src, back.seq, back.payload), (2, 2, vec![9]));
        h.join().unwrap();
    }

    #[test]
    fn f32_payloads() {
        let values = [1.5f32, -0.0, f32::MAX, 3.25e-8];
        let decoded = decode_f32(&encode_f32(&values));
        assert_eq!(decoded.len(), 4);
        for (a, b) in values.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn kind_codes() {
        for kind in [
            MessageKind::Barrier,
            MessageKind::Broadcast,
            MessageKind::Command,
            MessageKind::AllToAll,
            MessageKind::AllGather,
            MessageKind::Gather,
            MessageKind::Hello,
            MessageKind::Welcome,
        ] {
            assert_eq!(MessageKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(MessageKind::from_u8(200), None);
    }
}
