//! L4 TCP relay implementation.
//!
//! This module provides:
//! - TCP listener management
//! - Random backend selection per accepted connection
//! - Backend dialing
//! - The connection-pair relay engine
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> BackendSelector -> PendingDial -> ConnectionPair <-> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendSelector, Listener};
//!
//! let selector = Rc::new(BackendSelector::from_entropy());
//! let listener = Listener::bind(&spec, bind_host, DEFAULT_BACKLOG, selector)?;
//! reactor.register(Rc::new(listener).run(reactor.handle()));
//! ```

mod backend;
mod dial;
mod listener;
mod relay;

pub use backend::{BackendAddr, BackendPool, BackendSelector};
pub use dial::PendingDial;
pub use listener::{Listener, ListenerStats, DEFAULT_BACKLOG};
pub use relay::{ConnectionPair, PairState, PairSummary, PairTermination, Side};
