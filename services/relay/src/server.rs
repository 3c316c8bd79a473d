//! Startup: bind every configured listener and register it with the reactor.
//!
//! Binding is all-or-nothing. If any port fails, listeners bound so far
//! are dropped (closing their sockets) before the error is returned, so
//! the process never dispatches on a partial port set.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use tracing::info;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::proxy::{BackendSelector, Listener, ListenerStats};
use crate::reactor::Reactor;

/// A listener that is bound and registered.
#[derive(Debug, Clone)]
pub struct BoundListener {
    /// Configured port.
    pub port: u16,
    /// Actual local address (differs from `port` when it was 0).
    pub local_addr: SocketAddr,
    /// Live statistics.
    pub stats: Arc<ListenerStats>,
}

/// Bind all listeners from `config`, then register their accept loops.
pub fn start(config: &RelayConfig, reactor: &Reactor) -> Result<Vec<BoundListener>, RelayError> {
    let selector = Rc::new(match config.selection_seed {
        Some(seed) => {
            info!(seed = seed, "Backend selection seeded");
            BackendSelector::seeded(seed)
        }
        None => BackendSelector::from_entropy(),
    });

    let listeners = {
        let _guard = reactor.enter();
        config
            .listeners
            .iter()
            .map(|spec| {
                Listener::bind(spec, config.bind_host, config.backlog, Rc::clone(&selector))
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut bound = Vec::with_capacity(listeners.len());
    for listener in listeners {
        bound.push(BoundListener {
            port: listener.port(),
            local_addr: listener.local_addr()?,
            stats: listener.stats(),
        });
        reactor.register(Rc::new(listener).run(reactor.handle()));
    }

    info!(listener_count = bound.len(), "All listeners bound");
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config_for(ports: &[u32]) -> RelayConfig {
        let mut content = String::from("bind_host = \"127.0.0.1\"\n");
        for port in ports {
            content.push_str(&format!(
                "[[listeners]]\nport = {}\nbackends = [{{ host = \"127.0.0.1\", port = 3100 }}]\n",
                port
            ));
        }
        RelayConfig::from_toml_str(&content).unwrap()
    }

    #[test]
    fn test_start_binds_all_listeners() {
        let reactor = Reactor::new().unwrap();
        let bound = start(&config_for(&[0, 0]), &reactor).unwrap();

        assert_eq!(bound.len(), 2);
        assert_ne!(bound[0].local_addr.port(), 0);
        assert_eq!(reactor.handle().active_registrations(), 2);
    }

    #[test]
    fn test_out_of_range_port_releases_earlier_listeners() {
        let port = free_port();
        let reactor = Reactor::new().unwrap();

        let err = start(&config_for(&[port as u32, 99999]), &reactor).unwrap_err();
        assert_eq!(err.reason_code(), "port_out_of_range");
        assert_eq!(reactor.handle().active_registrations(), 0);

        // The first port was released, so it can be bound again.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_duplicate_port_fails_second_bind() {
        let port = free_port();
        let reactor = Reactor::new().unwrap();

        let err = start(&config_for(&[port as u32, port as u32]), &reactor).unwrap_err();
        assert_eq!(err.reason_code(), "bind_failed");

        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
