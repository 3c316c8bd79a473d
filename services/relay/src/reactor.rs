//! Single-threaded reactor.
//!
//! The reactor is a current-thread tokio runtime driving a `LocalSet`.
//! Every listener accept loop and every connection pair is registered as
//! a local task, so all socket callbacks run on one thread and shared
//! state needs no locks. `run` returns once a stop is requested (fatal
//! listener error, explicit request) or the process receives SIGINT or
//! SIGTERM; all registered tasks, and the sockets they own, are dropped
//! before it returns.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{EnterGuard, Runtime};
use tokio::sync::watch;
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Why the reactor stopped.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// `stop` was called without an error.
    Requested,
    /// The process received a termination signal.
    Signal(&'static str),
    /// A listener hit a fatal error.
    Fatal(Arc<RelayError>),
}

impl StopReason {
    /// Whether the process should exit non-zero.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StopReason::Fatal(_))
    }
}

/// Cloneable handle for registering work and stopping the reactor.
///
/// `stop` may be called from any thread; `register` must be called on the
/// reactor thread.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    stop_tx: Arc<watch::Sender<Option<StopReason>>>,
    registrations: Arc<AtomicUsize>,
}

impl ReactorHandle {
    /// Create a detached handle (no runtime attached yet).
    pub(crate) fn new() -> Self {
        let (stop_tx, _) = watch::channel(None);
        Self {
            stop_tx: Arc::new(stop_tx),
            registrations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a unit of I/O work with the reactor.
    ///
    /// The task is dropped, releasing whatever it owns, when it completes
    /// or when the reactor shuts down.
    pub fn register<F>(&self, work: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let registration = Registration::new(Arc::clone(&self.registrations));
        tokio::task::spawn_local(async move {
            let _registration = registration;
            work.await;
        });
    }

    /// Number of registered tasks still alive.
    pub fn active_registrations(&self) -> usize {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Request shutdown. The first reason wins.
    pub fn stop(&self, reason: StopReason) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            debug!(reason = ?reason, "Stop requested");
            *current = Some(reason);
            true
        });
    }

    /// Whether a stop has been requested.
    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop_tx.borrow().is_some()
    }

    async fn stopped(&self) -> StopReason {
        let mut stop_rx = self.stop_tx.subscribe();
        // The `watch::Ref` must be released before `stop_rx` goes away.
        let reason = match stop_rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(StopReason::Requested),
            // The sender lives in `self`, so this is unreachable in practice.
            Err(_) => StopReason::Requested,
        };
        reason
    }
}

/// Live-task counter guard.
struct Registration {
    counter: Arc<AtomicUsize>,
}

impl Registration {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The dispatch loop. Not `Send`; lives on the thread that runs it.
pub struct Reactor {
    // Dropped before the runtime so tasks release their sockets first.
    local: LocalSet,
    runtime: Runtime,
    handle: ReactorHandle,
}

impl Reactor {
    /// Build a current-thread runtime with IO and time drivers.
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            local: LocalSet::new(),
            runtime,
            handle: ReactorHandle::new(),
        })
    }

    /// Handle for registering work and stopping the reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Enter the runtime context, e.g. to bind sockets synchronously.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.runtime.enter()
    }

    /// Register work before `run` is called.
    pub fn register<F>(&self, work: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let _guard = self.local.enter();
        self.handle.register(work);
    }

    /// Dispatch until stopped, then drop every registered task.
    pub fn run(self) -> StopReason {
        let Reactor {
            local,
            runtime,
            handle,
        } = self;

        info!(
            registrations = handle.active_registrations(),
            "Starting dispatch"
        );

        let reason = local.block_on(&runtime, async {
            tokio::select! {
                reason = handle.stopped() => reason,
                signal = shutdown_signal() => StopReason::Signal(signal),
            }
        });

        if reason.is_fatal() {
            warn!(reason = ?reason, "Dispatch stopped on fatal error");
        } else {
            info!(reason = ?reason, "Dispatch stopped");
        }

        {
            let _guard = runtime.enter();
            drop(local);
        }
        drop(runtime);

        debug!(
            registrations = handle.active_registrations(),
            "Reactor released"
        );
        reason
    }
}

/// Wait for SIGINT or SIGTERM and return the signal's name.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
