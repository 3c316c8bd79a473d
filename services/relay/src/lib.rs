pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod reactor;
pub mod server;

pub use config::{ListenerSpec, RelayConfig};
pub use error::RelayError;
pub use proxy::{
    BackendAddr, BackendPool, BackendSelector, ConnectionPair, Listener, ListenerStats,
    PairState, PairTermination, PendingDial, Side,
};
pub use reactor::{Reactor, ReactorHandle, StopReason};
pub use server::BoundListener;
