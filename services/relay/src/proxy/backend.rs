//! Backend pools and selection.
//!
//! Every listening port owns an immutable, non-empty pool of backends.
//! Each accepted connection picks one backend uniformly at random; there
//! is no health tracking, affinity, or retry against another entry.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::RelayError;

/// A single upstream destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    /// Host, expected to be an IP literal.
    pub host: String,
    /// Backend port.
    pub port: u16,
}

impl BackendAddr {
    /// Create a new backend address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Ordered, non-empty, immutable list of backends for one port.
///
/// Cloning shares the underlying slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPool {
    backends: Arc<[BackendAddr]>,
}

impl BackendPool {
    /// Create a pool. Fails if `backends` is empty.
    pub fn new(backends: Vec<BackendAddr>) -> Result<Self, RelayError> {
        if backends.is_empty() {
            return Err(RelayError::Config(
                "backend pool must contain at least one backend".to_string(),
            ));
        }
        Ok(Self {
            backends: backends.into(),
        })
    }

    /// Number of backends in the pool.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if the pool is empty (never true once constructed).
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// First configured backend (used for startup logging).
    pub fn first(&self) -> &BackendAddr {
        &self.backends[0]
    }
}

/// Picks one backend per accepted connection.
///
/// The random source is injected so selection is reproducible under a
/// fixed seed. The selector lives on the reactor thread, so interior
/// mutability is a `RefCell` rather than a lock.
pub struct BackendSelector<R = StdRng> {
    rng: RefCell<R>,
}

impl BackendSelector<StdRng> {
    /// Selector seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Selector with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> BackendSelector<R> {
    /// Selector over an arbitrary random source.
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng: RefCell::new(rng),
        }
    }

    /// Select a backend uniformly at random from `pool`.
    pub fn pick<'a>(&self, pool: &'a BackendPool) -> &'a BackendAddr {
        let index = self.rng.borrow_mut().random_range(0..pool.len());
        &pool.backends[index]
    }
}

impl<R> fmt::Debug for BackendSelector<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSelector").finish_non_exhaustive()
    }
}
