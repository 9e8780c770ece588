//! Blocking rank-to-rank message transport.
//!
//! [`Messaging`] is the point-to-point primitive underneath every cross-stage
//! exchange: `send` blocks until the frame is handed to the transport,
//! `recv` blocks until a complete frame from the named peer has arrived.
//! Frames carry no sequence numbers. Within a training step both peers must
//! issue their per-micro-batch sends and receives in matching order; if the
//! loops fall out of lockstep the values are silently cross-wired rather
//! than rejected. Known hazard, left unguarded.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::codec::{decode_value, encode_value};
use crate::error::{PipelineError, Result};
use crate::value::Value;

pub trait Messaging: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Blocks until the frame is handed to the transport.
    fn send(&self, dst: usize, frame: &[u8]) -> Result<()>;
    /// Blocks until a complete frame from `src` has arrived.
    fn recv(&self, src: usize) -> Result<Vec<u8>>;
}

/// Sends one self-described value to `dst`.
pub fn send_value(mesh: &dyn Messaging, value: &Value, dst: usize) -> Result<()> {
    let frame = encode_value(value)?;
    debug!(rank = mesh.rank(), dst, bytes = frame.len(), "send value");
    mesh.send(dst, &frame)
}

/// Receives and reconstructs one value from `src`.
pub fn recv_value(mesh: &dyn Messaging, src: usize) -> Result<Value> {
    let frame = mesh.recv(src)?;
    debug!(rank = mesh.rank(), src, bytes = frame.len(), "recv value");
    decode_value(&frame)
}

// ---------------------------------------------------------------------------
// In-memory mesh: every stage runs as a thread of one process. Used by the
// integration tests and anywhere a single-machine run is enough.

pub struct MemoryMesh {
    rank: usize,
    world: usize,
    txs: Vec<Option<Sender<Vec<u8>>>>,
    rxs: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
}

/// Builds a fully connected in-memory mesh and returns one endpoint per rank.
pub fn memory_mesh(world: usize) -> Vec<MemoryMesh> {
    // chans[i][j] carries frames i -> j.
    let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = Vec::with_capacity(world);
    let mut receivers: Vec<Vec<Option<Receiver<Vec<u8>>>>> = Vec::with_capacity(world);
    for _ in 0..world {
        senders.push((0..world).map(|_| None).collect());
        receivers.push((0..world).map(|_| None).collect());
    }
    for i in 0..world {
        for j in 0..world {
            if i == j {
                continue;
            }
            let (tx, rx) = channel();
            senders[i][j] = Some(tx);
            // Endpoint j reads frames from i out of chans[i][j].
            receivers[j][i] = Some(rx);
        }
    }

    let mut endpoints = Vec::with_capacity(world);
    for (rank, (txs, rxs)) in senders.into_iter().zip(receivers).enumerate() {
        endpoints.push(MemoryMesh {
            rank,
            world,
            txs,
            rxs: rxs.into_iter().map(|r| r.map(Mutex::new)).collect(),
        });
    }
    endpoints
}

impl Messaging for MemoryMesh {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn send(&self, dst: usize, frame: &[u8]) -> Result<()> {
        let tx = self
            .txs
            .get(dst)
            .and_then(|t| t.as_ref())
            .ok_or_else(|| PipelineError::Transport(format!("rank {} has no channel to {dst}", self.rank)))?;
        tx.send(frame.to_vec())
            .map_err(|_| PipelineError::Transport(format!("peer {dst} disconnected")))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>> {
        let rx = self
            .rxs
            .get(src)
            .and_then(|r| r.as_ref())
            .ok_or_else(|| PipelineError::Transport(format!("rank {} has no channel from {src}", self.rank)))?;
        let rx = rx
            .lock()
            .map_err(|_| PipelineError::Transport("receiver lock poisoned".into()))?;
        rx.recv()
            .map_err(|_| PipelineError::Transport(format!("peer {src} disconnected")))
    }
}

// ---------------------------------------------------------------------------
// TCP mesh: one worker process per stage. Rank r listens on base_port + r,
// dials every lower rank, and identifies itself with a one-word handshake.
// Frames are length-prefixed byte blobs.

struct Peer {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

pub struct TcpMesh {
    rank: usize,
    world: usize,
    peers: HashMap<usize, Peer>,
}

const CONNECT_ATTEMPTS: u32 = 300;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

impl TcpMesh {
    /// Establishes the full mesh. Blocks until every peer is connected.
    pub fn connect(rank: usize, world: usize, host: &str, base_port: u16) -> Result<Self> {
        if rank >= world {
            return Err(PipelineError::Configuration(format!(
                "rank {rank} out of range for world size {world}"
            )));
        }
        let listener = TcpListener::bind((host, base_port + rank as u16))?;
        let mut peers = HashMap::new();

        // Dial every lower rank; they are already listening or soon will be.
        for peer_rank in 0..rank {
            let stream = Self::dial(host, base_port + peer_rank as u16)?;
            stream.set_nodelay(true)?;
            let mut writer = stream.try_clone()?;
            writer.write_all(&(rank as u64).to_le_bytes())?;
            writer.flush()?;
            debug!(rank, peer_rank, "connected to lower rank");
            peers.insert(
                peer_rank,
                Peer {
                    reader: Mutex::new(stream),
                    writer: Mutex::new(writer),
                },
            );
        }

        // Accept every higher rank and learn who dialed from the handshake.
        for _ in rank + 1..world {
            let (mut stream, _) = listener.accept()?;
            stream.set_nodelay(true)?;
            let mut word = [0u8; 8];
            stream.read_exact(&mut word)?;
            let peer_rank = u64::from_le_bytes(word) as usize;
            if peer_rank <= rank || peer_rank >= world {
                return Err(PipelineError::Transport(format!(
                    "unexpected handshake rank {peer_rank}"
                )));
            }
            let writer = stream.try_clone()?;
            debug!(rank, peer_rank, "accepted higher rank");
            peers.insert(
                peer_rank,
                Peer {
                    reader: Mutex::new(stream),
                    writer: Mutex::new(writer),
                },
            );
        }

        Ok(Self { rank, world, peers })
    }

    fn dial(host: &str, port: u16) -> Result<TcpStream> {
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect((host, port)) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(CONNECT_BACKOFF);
                }
            }
        }
        Err(PipelineError::Transport(format!(
            "could not reach {host}:{port}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn peer(&self, rank: usize) -> Result<&Peer> {
        self.peers.get(&rank).ok_or_else(|| {
            PipelineError::Transport(format!("rank {} has no connection to {rank}", self.rank))
        })
    }
}

impl Messaging for TcpMesh {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn send(&self, dst: usize, frame: &[u8]) -> Result<()> {
        let peer = self.peer(dst)?;
        let mut writer = peer
            .writer
            .lock()
            .map_err(|_| PipelineError::Transport("writer lock poisoned".into()))?;
        writer.write_all(&(frame.len() as u64).to_le_bytes())?;
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>> {
        let peer = self.peer(src)?;
        let mut reader = peer
            .reader
            .lock()
            .map_err(|_| PipelineError::Transport("reader lock poisoned".into()))?;
        let mut word = [0u8; 8];
        reader.read_exact(&mut word)?;
        let len = u64::from_le_bytes(word) as usize;
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame)?;
        Ok(frame)
    }
}
