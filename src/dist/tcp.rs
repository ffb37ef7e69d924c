//! TCP transport with a rendezvous hub on rank 0.
//!
//! Rank 0 listens on the rendezvous address; every other rank connects to it,
//! introduces itself with a Hello frame and waits for Welcome. Frames between
//! two non-zero ranks are relayed by the hub.
//!
//! Frame layout (little endian): `len: u32 | src: u32 | dst: u32 | seq: u64 |
//! kind: u8 | payload[len]`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::transport::{Message, MessageKind, RecvError, Transport};
use crate::error::{ErrorCode, Result, TalkError};

const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 1;
const MAX_FRAME: usize = 1 << 30;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

type Link = Arc<Mutex<TcpStream>>;

fn write_frame(stream: &mut TcpStream, msg: &Message) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + msg.payload.len());
    buf.extend_from_slice(&(msg.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(msg.src as u32).to_le_bytes());
    buf.extend_from_slice(&(msg.dst as u32).to_le_bytes());
    buf.extend_from_slice(&msg.seq.to_le_bytes());
    buf.push(msg.kind.as_u8());
    buf.extend_from_slice(&msg.payload);
    stream.write_all(&buf)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let u32_at = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let len = u32_at(0) as usize;
    let src = u32_at(4) as usize;
    let dst = u32_at(8) as usize;
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&header[12..20]);
    let seq = u64::from_le_bytes(seq_bytes);
    let kind = MessageKind::from_u8(header[20])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown message kind"))?;
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Message::new(src, dst, seq, kind, payload))
}

/// One rank's endpoint of a TCP process group.
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    /// Hub: link per peer rank (index 0 unused). Peer: only index 0, the hub.
    links: Arc<Vec<Option<Link>>>,
    inbox_tx: Sender<Message>,
    inbox_rx: Receiver<Message>,
}

impl TcpTransport {
    /// Joins the group at `addr`, waiting at most `timeout` for rendezvous.
    ///
    /// Rank 0 binds `addr` and waits for all other ranks; other ranks connect
    /// with retries. Any failure is a GROUP_INIT error.
    pub fn join(rank: usize, world_size: usize, addr: &str, timeout: Duration) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TalkError::group_init(format!(
                "rank {} is outside a group of {}",
                rank, world_size
            )));
        }
        let deadline = Instant::now() + timeout;
        if rank == 0 {
            Self::host(world_size, addr, deadline)
        } else {
            Self::connect(rank, world_size, addr, deadline)
        }
    }

    fn host(world_size: usize, addr: &str, deadline: Instant) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| {
            TalkError::with_source(ErrorCode::GroupInit, format!("Cannot bind {}", addr), e)
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot poll listener", e))?;
        info!("Rendezvous hub listening on {} for {} peers", addr, world_size - 1);

        let mut streams: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();
        let mut joined = 1;
        while joined < world_size {
            if Instant::now() >= deadline {
                let missing: Vec<usize> = (1..world_size).filter(|r| streams[*r].is_none()).collect();
                return Err(TalkError::group_init(format!(
                    "ranks {:?} did not join before the rendezvous deadline",
                    missing
                )));
            }
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match handshake_hub(&mut stream, world_size, remaining) {
                        Ok(rank) if streams[rank].is_none() => {
                            debug!("Rank {} joined from {}", rank, peer);
                            streams[rank] = Some(stream);
                            joined += 1;
                        }
                        Ok(rank) => {
                            return Err(TalkError::group_init(format!(
                                "rank {} joined twice",
                                rank
                            )));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    return Err(TalkError::with_source(ErrorCode::GroupInit, "Accept failed", e));
                }
            }
        }

        let mut links: Vec<Option<Link>> = Vec::with_capacity(world_size);
        let mut readers = Vec::with_capacity(world_size);
        for stream in streams {
            match stream {
                Some(s) => {
                    let reader = s
                        .try_clone()
                        .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot clone stream", e))?;
                    readers.push(Some(reader));
                    links.push(Some(Arc::new(Mutex::new(s))));
                }
                None => {
                    readers.push(None);
                    links.push(None);
                }
            }
        }

        let links = Arc::new(links);
        let (inbox_tx, inbox_rx) = unbounded();
        for (rank, reader) in readers.into_iter().enumerate() {
            if let Some(reader) = reader {
                spawn_hub_reader(rank, reader, inbox_tx.clone(), Arc::clone(&links));
            }
        }

        // Everyone is connected; release the peers.
        for rank in 1..world_size {
            send_on(&links, rank, &Message::new(0, rank, 0, MessageKind::Welcome, Vec::new()))?;
        }
        info!("Process group of {} ranks ready", world_size);

        Ok(Self {
            rank: 0,
            world_size,
            links,
            inbox_tx,
            inbox_rx,
        })
    }

    fn connect(rank: usize, world_size: usize, addr: &str, deadline: Instant) -> Result<Self> {
        let mut stream = loop {
            let attempt = addr
                .to_socket_addrs()
                .and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))
                })
                .and_then(|sock| {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    TcpStream::connect_timeout(&sock, remaining.max(Duration::from_millis(1)))
                });
            match attempt {
                Ok(s) => break s,
                Err(e) if Instant::now() + CONNECT_RETRY < deadline => {
                    debug!("Rank {} waiting for hub at {}: {}", rank, addr, e);
                    thread::sleep(CONNECT_RETRY);
                }
                Err(e) => {
                    return Err(TalkError::with_source(
                        ErrorCode::GroupInit,
                        format!("Process group initialization failed: hub {} unreachable", addr),
                        e,
                    ));
                }
            }
        };
        let _ = stream.set_nodelay(true);

        let hello = Message::new(rank, 0, world_size as u64, MessageKind::Hello, Vec::new());
        write_frame(&mut stream, &hello)
            .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Hello failed", e))?;

        // Welcome is only sent once every rank has joined.
        let remaining = deadline.saturating_duration_since(Instant::now());
        stream
            .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
            .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot set timeout", e))?;
        match read_frame(&mut stream) {
            Ok(msg) if msg.kind == MessageKind::Welcome => {}
            Ok(msg) => {
                return Err(TalkError::group_init(format!(
                    "expected Welcome from hub, got {:?}",
                    msg.kind
                )))
            }
            Err(e) => {
                return Err(TalkError::with_source(
                    ErrorCode::GroupInit,
                    "Process group initialization failed: no Welcome before the rendezvous deadline",
                    e,
                ))
            }
        }
        stream
            .set_read_timeout(None)
            .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot clear timeout", e))?;

        let reader = stream
            .try_clone()
            .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot clone stream", e))?;
        let (inbox_tx, inbox_rx) = unbounded();
        spawn_peer_reader(rank, reader, inbox_tx.clone());

        info!("Rank {} joined process group of {}", rank, world_size);
        Ok(Self {
            rank,
            world_size,
            links: Arc::new(vec![Some(Arc::new(Mutex::new(stream)))]),
            inbox_tx,
            inbox_rx,
        })
    }
}

fn handshake_hub(stream: &mut TcpStream, world_size: usize, remaining: Duration) -> Result<usize> {
    stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1)))))
        .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot configure stream", e))?;
    let hello = read_frame(stream)
        .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "No Hello from peer", e))?;
    if hello.kind != MessageKind::Hello {
        return Err(TalkError::group_init(format!("expected Hello, got {:?}", hello.kind)));
    }
    if hello.seq != world_size as u64 {
        return Err(TalkError::group_init(format!(
            "rank {} expects a group of {}, hub has {}",
            hello.src, hello.seq, world_size
        )));
    }
    if hello.src == 0 || hello.src >= world_size {
        return Err(TalkError::group_init(format!(
            "peer announced invalid rank {}",
            hello.src
        )));
    }
    stream
        .set_read_timeout(None)
        .map_err(|e| TalkError::with_source(ErrorCode::GroupInit, "Cannot clear timeout", e))?;
    let _ = stream.set_nodelay(true);
    Ok(hello.src)
}

fn send_on(links: &[Option<Link>], index: usize, msg: &Message) -> Result<()> {
    let link = links
        .get(index)
        .and_then(|l| l.as_ref())
        .ok_or_else(|| TalkError::new(ErrorCode::BarrierTimeout, format!("No link to rank {}", msg.dst)))?;
    let mut stream = link
        .lock()
        .map_err(|_| TalkError::new(ErrorCode::BarrierTimeout, "Link lock poisoned"))?;
    write_frame(&mut stream, msg).map_err(|e| {
        TalkError::with_source(
            ErrorCode::BarrierTimeout,
            format!("Rank {} is no longer reachable", msg.dst),
            e,
        )
    })
}

fn spawn_hub_reader(peer: usize, mut stream: TcpStream, inbox: Sender<Message>, links: Arc<Vec<Option<Link>>>) {
    thread::spawn(move || loop {
        let msg = match read_frame(&mut stream) {
            Ok(m) => m,
            Err(e) => {
                debug!("Link to rank {} closed: {}", peer, e);
                return;
            }
        };
        if msg.dst == 0 {
            if inbox.send(msg).is_err() {
                return;
            }
        } else if let Err(e) = send_on(&links, msg.dst, &msg) {
            warn!("Dropping frame from rank {} to rank {}: {}", msg.src, msg.dst, e);
        }
    });
}

fn spawn_peer_reader(rank: usize, mut stream: TcpStream, inbox: Sender<Message>) {
    thread::spawn(move || loop {
        match read_frame(&mut stream) {
            Ok(msg) => {
                if inbox.send(msg).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Rank {} lost the hub: {}", rank, e);
                return;
            }
        }
    });
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, msg: Message) -> Result<()> {
        if msg.dst == self.rank {
            return self
                .inbox_tx
                .send(msg)
                .map_err(|_| TalkError::new(ErrorCode::BarrierTimeout, "Local inbox closed"));
        }
        let via = if self.rank == 0 { msg.dst } else { 0 };
        send_on(&self.links, via, &msg)
    }

    fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvError> {
        self.inbox_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => RecvError::Timeout,
            RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for link in self.links.iter().flatten() {
            if let Ok(stream) = link.lock() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> String {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    }

    #[test]
    fn three_ranks_exchange_through_hub() {
        let addr = free_addr();
        let timeout = Duration::from_secs(10);
        let peers: Vec<_> = (1..3)
            .map(|rank| {
                let addr = addr.clone();
                thread::spawn(move || {
                    let t = TcpTransport::join(rank, 3, &addr, timeout).unwrap();
                    let other = if rank == 1 { 2 } else { 1 };
                    t.send(Message::new(rank, other, 5, MessageKind::AllToAll, vec![rank as u8]))
                        .unwrap();
                    let msg = t.recv_timeout(Duration::from_secs(5)).unwrap();
                    assert_eq!(msg.src, other);
                    assert_eq!(msg.payload, vec![other as u8]);
                    t.send(Message::new(rank, 0, 6, MessageKind::Gather, vec![rank as u8; 3]))
                        .unwrap();
                    // Keep the link open until rank 0 has read.
                    let _ = t.recv_timeout(Duration::from_secs(5));
                })
            })
            .collect();

        let hub = TcpTransport::join(0, 3, &addr, timeout).unwrap();
        let mut got = vec![
            hub.recv_timeout(Duration::from_secs(5)).unwrap(),
            hub.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        got.sort_by_key(|m| m.src);
        assert_eq!(got[0].payload, vec![1, 1, 1]);
        assert_eq!(got[1].payload, vec![2, 2, 2]);
        for rank in 1..3 {
            hub.send(Message::new(0, rank, 7, MessageKind::Barrier, Vec::new()))
                .unwrap();
        }
        for p in peers {
            p.join().unwrap();
        }
    }

    #[test]
    fn hub_times_out_without_peers() {
        let addr = free_addr();
        let err = TcpTransport::join(0, 2, &addr, Duration::from_millis(200))
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::GroupInit);
        assert!(err.message.contains("[1]"));
    }

    #[test]
    fn peer_times_out_without_hub() {
        let addr = free_addr();
        let err = TcpTransport::join(1, 2, &addr, Duration::from_millis(300))
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::GroupInit);
    }

    #[test]
    fn rank_outside_group_rejected() {
        let err = TcpTransport::join(3, 2, "127.0.0.1:1", Duration::from_millis(10))
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::GroupInit);
    }
}
