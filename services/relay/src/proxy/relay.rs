//! Connection pairs and the relay engine.
//!
//! A [`ConnectionPair`] owns both legs of one relayed connection: the
//! accepted client stream and the dialed backend stream. Each leg keeps
//! an inbound buffer (bytes read from it) and an outbound buffer (bytes
//! waiting to be written to it). The engine waits on socket readiness,
//! drains whatever a readable leg has into its inbound buffer, and moves
//! that block to the peer's outbound buffer.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting --connect ok--> Established --EOF on X--> HalfClosed(X) --flush--> Closed
//!      |                          |
//!      +--connect err--+          +--error on X--> Failed(X) --------------> Closed
//!                      v
//!               Failed(Backend) -----------------------------------------> Closed
//! ```
//!
//! Releasing a leg always goes through the pair: the stream is taken out
//! of its slot first, so the peer can only observe "no partner" and
//! discard what it reads.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::dial::PendingDial;
use crate::error::RelayError;

/// Minimum free space reserved before each socket read.
const READ_CHUNK: usize = 8192;

/// Most bytes taken from one leg per readiness event, so one fast sender
/// cannot hold the reactor thread.
const READ_BUDGET: usize = 64 * 1024;

/// How long a flushed leg may keep sending before it is released anyway.
const LINGER_TIMEOUT: Duration = Duration::from_secs(30);

/// One side of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted, client-facing leg.
    Client,
    /// The dialed, backend-facing leg.
    Backend,
}

impl Side {
    /// The opposite leg.
    pub fn peer(self) -> Self {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Backend => f.write_str("backend"),
        }
    }
}

/// Lifecycle state of a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Client accepted, backend connect in flight.
    Connecting,
    /// Both legs live, bytes flowing.
    Established,
    /// The given leg signaled end-of-stream; flushing towards its peer.
    HalfClosed(Side),
    /// The given leg reported an error (or the dial failed).
    Failed(Side),
    /// Both legs released.
    Closed,
}

/// How a pair ended.
#[derive(Debug)]
pub enum PairTermination {
    /// Clean end-of-stream on the given leg; pending bytes were flushed.
    Eof(Side),
    /// The single backend connect attempt failed.
    DialFailed(RelayError),
    /// Read or write failure on an established pair.
    Failed(RelayError),
}

/// Final accounting for one pair.
#[derive(Debug)]
pub struct PairSummary {
    pub id: u64,
    pub termination: PairTermination,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub bytes_discarded: u64,
}

#[derive(Debug, Default)]
struct Leg {
    stream: Option<TcpStream>,
    inbound: BytesMut,
    outbound: BytesMut,
    bytes_written: u64,
}

impl Leg {
    fn with_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            ..Self::default()
        }
    }
}

enum ReadOutcome {
    /// Socket drained until it would block.
    Pending,
    /// Peer closed its write half.
    Eof,
}

enum Readiness {
    Readable(Side, io::Result<()>),
    Writable(Side, io::Result<()>),
}

/// Both legs of one relayed connection plus its state.
#[derive(Debug)]
pub struct ConnectionPair {
    id: u64,
    peer_addr: SocketAddr,
    state: PairState,
    client: Leg,
    backend: Leg,
    bytes_discarded: u64,
}

impl ConnectionPair {
    /// Create a pair for a freshly accepted client. Starts in `Connecting`.
    pub fn new(id: u64, client: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            state: PairState::Connecting,
            client: Leg::with_stream(client),
            backend: Leg::default(),
            bytes_discarded: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Whether the given leg still holds a live stream.
    #[cfg(test)]
    fn is_live(&self, side: Side) -> bool {
        self.leg(side).stream.is_some()
    }

    /// Drive the pair from `Connecting` to `Closed`.
    pub async fn run(mut self, dial: PendingDial) -> PairSummary {
        let termination = match self.connect(dial).await {
            Ok(()) => self.relay().await,
            Err(err) => PairTermination::DialFailed(err),
        };

        PairSummary {
            id: self.id,
            termination,
            bytes_to_backend: self.backend.bytes_written,
            bytes_from_backend: self.client.bytes_written,
            bytes_discarded: self.bytes_discarded,
        }
    }

    /// Make the single connect attempt for the backend leg.
    ///
    /// On failure the client leg is released and the pair is closed.
    pub async fn connect(&mut self, dial: PendingDial) -> Result<(), RelayError> {
        let backend_addr = dial.addr();
        match dial.connect().await {
            Ok(stream) => {
                self.backend.stream = Some(stream);
                self.transition(PairState::Established);
                debug!(
                    pair_id = self.id,
                    peer_addr = %self.peer_addr,
                    backend_addr = %backend_addr,
                    "Connected to backend"
                );
                Ok(())
            }
            Err(source) => {
                self.transition(PairState::Failed(Side::Backend));
                self.release(Side::Client);
                self.transition(PairState::Closed);
                Err(RelayError::Dial {
                    backend: backend_addr.to_string(),
                    source,
                })
            }
        }
    }

    /// Relay bytes until one leg closes or fails. Always ends `Closed`.
    pub async fn relay(&mut self) -> PairTermination {
        loop {
            let Some(readiness) = self.next_readiness().await else {
                let side = if self.client.stream.is_none() {
                    Side::Client
                } else {
                    Side::Backend
                };
                return self.fail(side, io::ErrorKind::NotConnected.into());
            };

            match readiness {
                Readiness::Readable(side, Ok(())) => match self.fill_inbound(side) {
                    Ok(ReadOutcome::Pending) => {
                        self.forward(side);
                        if let Err(err) = self.flush_outbound(side.peer()) {
                            return self.fail(side.peer(), err);
                        }
                    }
                    Ok(ReadOutcome::Eof) => return self.half_close(side).await,
                    Err(err) => return self.fail(side, err),
                },
                Readiness::Writable(side, Ok(())) => {
                    if let Err(err) = self.flush_outbound(side) {
                        return self.fail(side, err);
                    }
                }
                Readiness::Readable(side, Err(err)) | Readiness::Writable(side, Err(err)) => {
                    return self.fail(side, err);
                }
            }
        }
    }

    /// Wait for the next readiness event on either leg.
    ///
    /// Write interest is only registered for legs with pending output.
    async fn next_readiness(&self) -> Option<Readiness> {
        let client = self.client.stream.as_ref()?;
        let backend = self.backend.stream.as_ref()?;
        let client_pending = !self.client.outbound.is_empty();
        let backend_pending = !self.backend.outbound.is_empty();

        let readiness = tokio::select! {
            r = client.readable() => Readiness::Readable(Side::Client, r),
            r = backend.readable() => Readiness::Readable(Side::Backend, r),
            r = client.writable(), if client_pending => Readiness::Writable(Side::Client, r),
            r = backend.writable(), if backend_pending => Readiness::Writable(Side::Backend, r),
        };
        Some(readiness)
    }

    /// Read what is currently available on `side` into its inbound buffer,
    /// up to [`READ_BUDGET`] bytes. Leftover bytes keep the leg readable.
    fn fill_inbound(&mut self, side: Side) -> io::Result<ReadOutcome> {
        let Leg {
            stream, inbound, ..
        } = self.leg_mut(side);
        let Some(stream) = stream.as_ref() else {
            return Ok(ReadOutcome::Pending);
        };

        let mut read = 0;
        while read < READ_BUDGET {
            inbound.reserve(READ_CHUNK);
            let mut buf = (&mut *inbound).limit(READ_BUDGET - read);
            match stream.try_read_buf(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Pending)
    }

    /// Move `side`'s inbound bytes to its peer's outbound buffer.
    ///
    /// Once the peer is released the bytes are discarded instead.
    fn forward(&mut self, side: Side) {
        let (from, to) = self.legs_mut(side);
        if from.inbound.is_empty() {
            return;
        }

        if to.stream.is_some() {
            if to.outbound.is_empty() {
                to.outbound = from.inbound.split();
            } else {
                to.outbound.extend_from_slice(&from.inbound);
                from.inbound.clear();
            }
            return;
        }

        let dropped = from.inbound.len();
        from.inbound.clear();
        self.bytes_discarded += dropped as u64;
        trace!(pair_id = self.id, side = %side, bytes = dropped, "Discarded bytes, peer released");
    }

    /// Write as much of `side`'s outbound buffer as the socket accepts now.
    fn flush_outbound(&mut self, side: Side) -> io::Result<()> {
        let Leg {
            stream,
            outbound,
            bytes_written,
            ..
        } = self.leg_mut(side);
        let Some(stream) = stream.as_ref() else {
            outbound.clear();
            return Ok(());
        };

        while !outbound.is_empty() {
            match stream.try_write(&outbound[..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    outbound.advance(n);
                    *bytes_written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Clean end-of-stream on `side`: flush towards the peer, then close both.
    async fn half_close(&mut self, side: Side) -> PairTermination {
        self.transition(PairState::HalfClosed(side));
        self.forward(side);
        self.release(side);

        let peer = side.peer();
        if let Err(source) = self.flush_and_shutdown(peer).await {
            self.transition(PairState::Failed(peer));
            self.release(peer);
            self.transition(PairState::Closed);
            return PairTermination::Failed(RelayError::Transport { side: peer, source });
        }

        self.release(peer);
        self.transition(PairState::Closed);
        PairTermination::Eof(side)
    }

    /// Write the whole outbound buffer of `side`, then shut its write half.
    ///
    /// Its partner is already released, so whatever `side` sends meanwhile
    /// is read and discarded. A leg that stops reading until its own
    /// writes are consumed (an echo server) would otherwise never drain.
    /// After the shutdown the leg is drained to end-of-stream, bounded by
    /// [`LINGER_TIMEOUT`], so closing it does not reset unsent bytes.
    async fn flush_and_shutdown(&mut self, side: Side) -> io::Result<()> {
        let mut reading = true;
        loop {
            let leg = self.leg(side);
            let Some(stream) = leg.stream.as_ref() else {
                return Ok(());
            };
            if leg.outbound.is_empty() {
                break;
            }

            let readiness = tokio::select! {
                r = stream.readable(), if reading => Readiness::Readable(side, r),
                r = stream.writable() => Readiness::Writable(side, r),
            };
            match readiness {
                Readiness::Readable(_, r) => {
                    r?;
                    if let ReadOutcome::Eof = self.fill_inbound(side)? {
                        reading = false;
                    }
                    self.forward(side);
                }
                Readiness::Writable(_, r) => {
                    r?;
                    self.flush_outbound(side)?;
                }
            }
        }

        let pair_id = self.id;
        if let Some(stream) = self.leg_mut(side).stream.as_mut() {
            if let Err(e) = stream.shutdown().await {
                debug!(pair_id, side = %side, error = %e, "Shutdown after flush failed");
                return Ok(());
            }
        }

        if reading {
            match tokio::time::timeout(LINGER_TIMEOUT, self.drain_to_eof(side)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(pair_id, side = %side, error = %e, "Drain after shutdown failed")
                }
                Err(_) => debug!(pair_id, side = %side, "Leg still sending, releasing"),
            }
        }
        Ok(())
    }

    /// Read and discard from `side` until it reaches end-of-stream.
    async fn drain_to_eof(&mut self, side: Side) -> io::Result<()> {
        loop {
            let Some(stream) = self.leg(side).stream.as_ref() else {
                return Ok(());
            };
            stream.readable().await?;
            let outcome = self.fill_inbound(side)?;
            self.forward(side);
            if let ReadOutcome::Eof = outcome {
                return Ok(());
            }
        }
    }

    /// Error on `side`: release it, then its peer, without a final flush.
    fn fail(&mut self, side: Side, source: io::Error) -> PairTermination {
        self.transition(PairState::Failed(side));
        self.release(side);
        // Whatever the surviving leg already read has nowhere to go.
        self.forward(side.peer());
        self.release(side.peer());
        self.transition(PairState::Closed);
        PairTermination::Failed(RelayError::Transport { side, source })
    }

    /// Take the leg's stream out of the pair and close it. Idempotent.
    fn release(&mut self, side: Side) {
        let pair_id = self.id;
        let leg = self.leg_mut(side);
        if let Some(stream) = leg.stream.take() {
            leg.outbound.clear();
            drop(stream);
            trace!(pair_id, side = %side, "Leg released");
        }
    }

    fn transition(&mut self, next: PairState) {
        debug_assert_ne!(self.state, PairState::Closed, "pair closed twice");
        trace!(pair_id = self.id, from = ?self.state, to = ?next, "Pair state change");
        self.state = next;
    }

    fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Client => &self.client,
            Side::Backend => &self.backend,
        }
    }

    fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Client => &mut self.client,
            Side::Backend => &mut self.backend,
        }
    }

    /// `(side, peer)` legs, both mutable.
    fn legs_mut(&mut self, side: Side) -> (&mut Leg, &mut Leg) {
        match side {
            Side::Client => (&mut self.client, &mut self.backend),
            Side::Backend => (&mut self.backend, &mut self.client),
        }
    }
}
