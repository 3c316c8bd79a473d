//! Outbound leg creation.
//!
//! Dialing happens in two steps. `prepare` resolves the selected backend
//! and creates the unconnected socket synchronously inside the accept
//! handler; a failure there releases the client before anything is
//! registered with the reactor. `connect` is the single asynchronous
//! connect attempt made by the pair while it is `Connecting`.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use super::backend::BackendAddr;
use crate::error::RelayError;

/// An unconnected backend-side socket and its destination.
#[derive(Debug)]
pub struct PendingDial {
    socket: TcpSocket,
    addr: SocketAddr,
}

impl PendingDial {
    /// Resolve `backend` and create an empty socket for it.
    ///
    /// Backend hosts must be IP literals; anything else is a malformed
    /// address and fails here.
    pub fn prepare(backend: &BackendAddr) -> Result<Self, RelayError> {
        let ip: IpAddr = backend.host.parse().map_err(|_| RelayError::Dial {
            backend: backend.to_string(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("malformed backend address '{}'", backend.host),
            ),
        })?;
        let addr = SocketAddr::new(ip, backend.port);

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|source| RelayError::Dial {
            backend: backend.to_string(),
            source,
        })?;

        Ok(Self { socket, addr })
    }

    /// Destination address of this dial.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Make the one connect attempt. There is no retry and no timeout.
    pub async fn connect(self) -> io::Result<TcpStream> {
        debug!(backend_addr = %self.addr, "Connecting to backend");
        self.socket.connect(self.addr).await
    }
}
