//! TCP listener and connection handling.
//!
//! A listener binds one port, accepts clients, picks a backend from the
//! port's pool and registers a [`ConnectionPair`] with the reactor for
//! each accepted connection.
//!
//! - Connection-level routing: one backend per accepted connection
//! - One dial attempt per connection, no failover
//! - Accept errors that are not per-connection stop the reactor

use std::cell::Cell;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{BackendPool, BackendSelector};
use super::dial::PendingDial;
use super::relay::{ConnectionPair, PairSummary, PairTermination};
use crate::config::ListenerSpec;
use crate::error::RelayError;
use crate::reactor::{ReactorHandle, StopReason};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Backend connect attempts.
    pub dial_attempts: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures (including malformed addresses).
    pub backend_failed: AtomicU64,
    /// Pairs ended by a transport error.
    pub transport_failed: AtomicU64,
    /// Bytes relayed to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_backend: AtomicU64,
    /// Bytes read after the partner leg was gone.
    pub bytes_discarded: AtomicU64,
}

impl ListenerStats {
    fn record(&self, summary: &PairSummary) {
        match &summary.termination {
            PairTermination::DialFailed(_) => {
                self.backend_failed.fetch_add(1, Ordering::Relaxed);
            }
            PairTermination::Eof(_) => {
                self.backend_connected.fetch_add(1, Ordering::Relaxed);
            }
            PairTermination::Failed(_) => {
                self.backend_connected.fetch_add(1, Ordering::Relaxed);
                self.transport_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.bytes_to_backend
            .fetch_add(summary.bytes_to_backend, Ordering::Relaxed);
        self.bytes_from_backend
            .fetch_add(summary.bytes_from_backend, Ordering::Relaxed);
        self.bytes_discarded
            .fetch_add(summary.bytes_discarded, Ordering::Relaxed);
    }

    fn connection_finished(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bound listening port with its backend pool.
pub struct Listener {
    /// Configured port.
    port: u16,
    /// The TCP listener.
    listener: TcpListener,
    /// Backends for this port.
    pool: BackendPool,
    /// Shared backend selector.
    selector: Rc<BackendSelector>,
    /// Statistics.
    stats: Arc<ListenerStats>,
    /// Next connection pair id.
    next_pair_id: Cell<u64>,
}

impl Listener {
    /// Bind a listener for `spec` on `bind_host`.
    ///
    /// Must be called inside the reactor's runtime context.
    pub fn bind(
        spec: &ListenerSpec,
        bind_host: IpAddr,
        backlog: u32,
        selector: Rc<BackendSelector>,
    ) -> Result<Self, RelayError> {
        let port = u16::try_from(spec.port)
            .map_err(|_| RelayError::PortOutOfRange { port: spec.port })?;
        let addr = SocketAddr::new(bind_host, port);

        let listener = bind_socket(addr, backlog)
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(
            port = port,
            bind_addr = %local_addr,
            backend = %spec.pool.first(),
            backend_count = spec.pool.len(),
            "Listener bound"
        );

        Ok(Self {
            port,
            listener,
            pool: spec.pool.clone(),
            selector,
            stats: Arc::new(ListenerStats::default()),
            next_pair_id: Cell::new(1),
        })
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until a fatal accept error.
    ///
    /// A fatal error stops the reactor; per-connection accept failures are
    /// logged and skipped.
    pub async fn run(self: Rc<Self>, reactor: ReactorHandle) {
        info!(port = self.port, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr, &reactor),
                Err(e) => {
                    if handle_accept_error(self.port, e, &reactor).is_break() {
                        return;
                    }
                }
            }
        }
    }

    /// Turn one accepted client into a registered connection pair.
    fn on_accept(&self, client: TcpStream, peer_addr: SocketAddr, reactor: &ReactorHandle) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        let backend = self.selector.pick(&self.pool);
        info!(
            port = self.port,
            peer_addr = %peer_addr,
            backend = %backend,
            "Accepted connection"
        );

        self.stats.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let dial = match PendingDial::prepare(backend) {
            Ok(dial) => dial,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, error = %e, "Dial failed, dropping client");
                drop(client);
                return;
            }
        };

        let pair_id = self.next_pair_id.get();
        self.next_pair_id.set(pair_id + 1);

        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let pair = ConnectionPair::new(pair_id, client, peer_addr);
        let stats = Arc::clone(&self.stats);
        let span = tracing::info_span!("connection", port = self.port, pair_id, peer = %peer_addr);

        reactor.register(
            async move {
                let summary = pair.run(dial).await;
                match &summary.termination {
                    PairTermination::Eof(side) => debug!(
                        closed_by = %side,
                        bytes_to_backend = summary.bytes_to_backend,
                        bytes_from_backend = summary.bytes_from_backend,
                        "Connection closed"
                    ),
                    PairTermination::DialFailed(e) => {
                        warn!(error = %e, "Backend connection failed")
                    }
                    PairTermination::Failed(e) => debug!(
                        error = %e,
                        bytes_to_backend = summary.bytes_to_backend,
                        bytes_from_backend = summary.bytes_from_backend,
                        "Connection error"
                    ),
                }
                stats.record(&summary);
                stats.connection_finished();
            }
            .instrument(span),
        );
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        info!(port = self.port, "Listener released");
    }
}

/// Create a reusable listening socket.
fn bind_socket(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Decide what an accept failure means for the listener on `port`.
///
/// Per-connection failures are skipped. Anything else stops the reactor
/// with a fatal reason and ends the accept loop.
fn handle_accept_error(port: u16, e: io::Error, reactor: &ReactorHandle) -> ControlFlow<()> {
    if is_connection_error(&e) {
        debug!(port, error = %e, "Accept failed for one connection");
        return ControlFlow::Continue(());
    }

    let err = RelayError::Accept { port, source: e };
    error!(port, error = %err, "Listener failed, stopping");
    reactor.stop(StopReason::Fatal(Arc::new(err)));
    ControlFlow::Break(())
}

/// Accept errors that concern a single pending connection, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::BackendAddr;
    use crate::reactor::Reactor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::LocalSet;

    fn spec(port: u32, backends: Vec<BackendAddr>) -> ListenerSpec {
        ListenerSpec {
            port,
            pool: BackendPool::new(backends).unwrap(),
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_rejects_out_of_range_port() {
        let selector = Rc::new(BackendSelector::seeded(1));
        let err = Listener::bind(
            &spec(99999, vec![BackendAddr::new("127.0.0.1", 3100)]),
            localhost(),
            DEFAULT_BACKLOG,
            selector,
        )
        .err()
        .unwrap();
        assert_eq!(err.reason_code(), "port_out_of_range");
    }

    #[tokio::test]
    async fn test_bind_port_in_use() {
        let selector = Rc::new(BackendSelector::seeded(1));
        let first = Listener::bind(
            &spec(0, vec![BackendAddr::new("127.0.0.1", 3100)]),
            localhost(),
            DEFAULT_BACKLOG,
            Rc::clone(&selector),
        )
        .unwrap();
        let port = first.local_addr().unwrap().port();

        let err = Listener::bind(
            &spec(port as u32, vec![BackendAddr::new("127.0.0.1", 3100)]),
            localhost(),
            DEFAULT_BACKLOG,
            selector,
        )
        .err()
        .unwrap();
        assert_eq!(err.reason_code(), "bind_failed");
    }

    #[test]
    fn test_per_connection_accept_errors_are_skipped() {
        let reactor = ReactorHandle::new();
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            let flow = handle_accept_error(8000, io::Error::from(kind), &reactor);
            assert!(flow.is_continue(), "{:?} should not stop the listener", kind);
        }
        assert!(!reactor.is_stopped());
    }

    #[test]
    fn test_fd_exhaustion_stops_reactor_as_fatal() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        // EMFILE
        let flow = handle_accept_error(8000, io::Error::from_raw_os_error(24), &handle);
        assert!(flow.is_break());
        assert!(handle.is_stopped());

        match reactor.run() {
            StopReason::Fatal(err) => assert_eq!(err.reason_code(), "accept_failed"),
            other => panic!("Expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_accept_error_is_fatal() {
        let reactor = ReactorHandle::new();
        let flow = handle_accept_error(8000, io::Error::other("listener broke"), &reactor);
        assert!(flow.is_break());
        assert!(reactor.is_stopped());
    }

    #[tokio::test]
    async fn test_malformed_backend_drops_client() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let reactor = ReactorHandle::new();
                let listener = Rc::new(
                    Listener::bind(
                        &spec(0, vec![BackendAddr::new("backend.invalid", 3100)]),
                        localhost(),
                        DEFAULT_BACKLOG,
                        Rc::new(BackendSelector::seeded(1)),
                    )
                    .unwrap(),
                );
                let addr = listener.local_addr().unwrap();
                let stats = listener.stats();
                reactor.register(Rc::clone(&listener).run(reactor.clone()));

                let mut client = TcpStream::connect(addr).await.unwrap();
                let mut buf = [0u8; 8];
                let n = client.read(&mut buf).await.unwrap_or(0);
                assert_eq!(n, 0);

                assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
                assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 1);
                assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_accepted_connection_is_relayed() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let local = LocalSet::new();
        local
            .run_until(async move {
                let reactor = ReactorHandle::new();
                let listener = Rc::new(
                    Listener::bind(
                        &spec(
                            0,
                            vec![BackendAddr::new("127.0.0.1", backend_addr.port())],
                        ),
                        localhost(),
                        DEFAULT_BACKLOG,
                        Rc::new(BackendSelector::seeded(1)),
                    )
                    .unwrap(),
                );
                let addr = listener.local_addr().unwrap();
                let stats = listener.stats();
                reactor.register(Rc::clone(&listener).run(reactor.clone()));

                let mut client = TcpStream::connect(addr).await.unwrap();
                let (mut upstream, _) = backend.accept().await.unwrap();

                client.write_all(b"hello").await.unwrap();
                let mut buf = [0u8; 5];
                upstream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"hello");

                upstream.write_all(b"world").await.unwrap();
                client.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"world");

                drop(upstream);
                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());

                assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
                assert_eq!(stats.dial_attempts.load(Ordering::Relaxed), 1);
            })
            .await;
    }
}
