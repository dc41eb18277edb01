//! The process group: peer locations and framed duplex connections.
//!
//! A cluster is a fixed set of processes, each reachable at a
//! `(host, port)` [`Location`]. The location table is broadcast by the
//! initiator at join time and never changes. Every pair of processes
//! shares exactly one TCP connection; the entry for the local process is
//! a distinguished marker with no connection.
//!
//! Connections are non-blocking. Reads accumulate into a frame decoder;
//! writes append to an outbound queue that the event loop flushes
//! opportunistically, so no send ever blocks the loop on a slow peer.

use crate::codec::{encode_frame, FrameDecoder};
use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::types::ProcId;

/// How much to read from a socket per attempt.
const READ_CHUNK: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Network address of one process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Location {
    /// Creates a location.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` form accepted by the socket APIs.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// What a non-blocking read pass observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEvent {
    /// New bytes were ingested.
    Bytes(usize),
    /// Nothing available right now.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// One framed duplex peer connection.
#[derive(Debug)]
pub(crate) struct Connection {
    stream: TcpStream,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    max_frame_length: usize,
}

impl Connection {
    /// Wraps an established stream, switching it to non-blocking mode.
    pub(crate) fn from_stream(stream: TcpStream, max_frame_length: usize) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(max_frame_length),
            outbox: Vec::new(),
            max_frame_length,
        })
    }

    /// Dials `location`, retrying while the peer's listener comes up.
    pub(crate) fn connect(
        location: &Location,
        attempts: u32,
        backoff: Duration,
        max_frame_length: usize,
    ) -> Result<Self> {
        let addr = location.addr();
        let mut last = Error::new(ErrorKind::Io);
        for _ in 0..attempts.max(1) {
            match TcpStream::connect(&addr) {
                Ok(stream) => return Self::from_stream(stream, max_frame_length),
                Err(err) => {
                    last = Error::from(err);
                    std::thread::sleep(backoff);
                }
            }
        }
        Err(last.with_context(format!("dialing {addr}")))
    }

    /// Appends one framed message to the outbound queue.
    pub(crate) fn queue_frame(&mut self, payload: &[u8]) -> Result<()> {
        encode_frame(payload, self.max_frame_length, &mut self.outbox)
    }

    /// Writes as much queued output as the socket accepts.
    pub(crate) fn try_flush(&mut self) -> Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(Error::new(ErrorKind::ConnectionClosed)),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reads whatever the socket has into the frame decoder.
    pub(crate) fn try_read(&mut self) -> Result<ReadEvent> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return if total > 0 {
                        Ok(ReadEvent::Bytes(total))
                    } else {
                        Ok(ReadEvent::Closed)
                    }
                }
                Ok(n) => {
                    self.decoder.ingest(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if total > 0 {
            Ok(ReadEvent::Bytes(total))
        } else {
            Ok(ReadEvent::Idle)
        }
    }

    /// Extracts the next buffered frame, if complete.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        self.decoder.next_frame()
    }

    /// True if undecoded inbound bytes are buffered.
    pub(crate) fn has_buffered(&self) -> bool {
        self.decoder.has_buffered()
    }

    /// True if outbound bytes are queued.
    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Discards the inbound buffer after a poisoned stream.
    pub(crate) fn drain_inbound(&mut self) {
        self.decoder.drain();
    }
}

// ---------------------------------------------------------------------------
// ProcGroup
// ---------------------------------------------------------------------------

/// One peer in the group.
#[derive(Debug)]
pub(crate) struct PeerEntry {
    pub(crate) id: ProcId,
    pub(crate) location: Location,
    /// `None` for the local process (distinguished marker) and for peers
    /// whose connection has not been established or has closed.
    pub(crate) conn: Option<Connection>,
}

/// The fixed set of processes in the cluster, indexed by process id.
#[derive(Debug)]
pub(crate) struct ProcGroup {
    self_id: ProcId,
    entries: Vec<PeerEntry>,
}

impl ProcGroup {
    pub(crate) fn new(self_id: ProcId, locations: Vec<Location>) -> Self {
        let entries = locations
            .into_iter()
            .enumerate()
            .map(|(i, location)| PeerEntry {
                id: ProcId::new(u32::try_from(i).unwrap_or(u32::MAX)),
                location,
                conn: None,
            })
            .collect();
        Self { self_id, entries }
    }

    pub(crate) fn self_id(&self) -> ProcId {
        self.self_id
    }

    /// Number of processes in the cluster, local included.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, peer: ProcId) -> bool {
        peer.index() < self.entries.len()
    }

    pub(crate) fn location(&self, peer: ProcId) -> Result<&Location> {
        self.entries
            .get(peer.index())
            .map(|e| &e.location)
            .ok_or_else(|| unknown_peer(peer))
    }

    /// Every process id in the group, in id order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = ProcId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    /// Attaches the connection for `peer`.
    pub(crate) fn attach(&mut self, peer: ProcId, conn: Connection) -> Result<()> {
        if peer == self.self_id {
            return Err(Error::new(ErrorKind::Internal)
                .with_context("attaching a connection to the local marker entry"));
        }
        let entry = self
            .entries
            .get_mut(peer.index())
            .ok_or_else(|| unknown_peer(peer))?;
        entry.conn = Some(conn);
        Ok(())
    }

    /// Removes and returns the connection for `peer`.
    pub(crate) fn detach(&mut self, peer: ProcId) -> Option<Connection> {
        self.entries.get_mut(peer.index()).and_then(|e| e.conn.take())
    }

    pub(crate) fn conn_mut(&mut self, peer: ProcId) -> Result<&mut Connection> {
        if peer == self.self_id {
            return Err(Error::new(ErrorKind::Internal)
                .with_context("the local process has no connection to itself"));
        }
        self.entries
            .get_mut(peer.index())
            .ok_or_else(|| unknown_peer(peer))?
            .conn
            .as_mut()
            .ok_or_else(|| {
                Error::new(ErrorKind::ConnectionClosed).with_context(format!("no link to {peer}"))
            })
    }

    /// Ids of peers with a live connection.
    pub(crate) fn connected(&self) -> Vec<ProcId> {
        self.entries
            .iter()
            .filter(|e| e.conn.is_some())
            .map(|e| e.id)
            .collect()
    }
}

fn unknown_peer(peer: ProcId) -> Error {
    Error::new(ErrorKind::UnknownPeer).with_context(format!("{peer} outside the location table"))
}
