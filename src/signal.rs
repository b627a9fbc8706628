//! Termination signal routing.
//!
//! A single process-wide `ctrlc` handler feeds every registered [`SignalRoutes`] owner. Each
//! owner holds a [`Shutdown`] context; delivering a signal sets its stop flag and pokes the
//! attached [`Canceller`] so a blocked readiness wait returns.
//!
//! The handler covers SIGINT, SIGTERM and SIGHUP and cannot tell them apart, so a delivery
//! reaches every owner registered for any of the three. With no owner registered the handler
//! terminates the process with [`UNROUTED_EXIT_STATUS`] whichever signal arrived; the default
//! disposition would also terminate it, but SIGTERM and SIGHUP would report 143 and 129.
use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use log::{info, warn};
use thiserror::Error;

use crate::protocol::Canceller;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to install signal handler: {0}")]
    Install(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Hangup,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [
        SignalKind::Interrupt,
        SignalKind::Terminate,
        SignalKind::Hangup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SignalKind::Interrupt => "SIGINT",
            SignalKind::Terminate => "SIGTERM",
            SignalKind::Hangup => "SIGHUP",
        }
    }
}

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    canceller: Mutex<Option<Canceller>>,
}

/// Cooperative stop flag shared between the dispatch loop and whoever asks it to stop.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Sets the flag and cancels any readiness wait it is attached to.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        if let Some(canceller) = lock(&self.inner.canceller).as_ref() {
            if let Err(e) = canceller.cancel() {
                warn!("failed to cancel readiness wait: {e}");
            }
        }
    }

    /// Links a readiness wait to this flag.
    pub fn attach(&self, canceller: Canceller) {
        let mut slot = lock(&self.inner.canceller);
        if self.is_requested() {
            if let Err(e) = canceller.cancel() {
                warn!("failed to cancel readiness wait: {e}");
            }
        }
        *slot = Some(canceller);
    }
}

struct Route {
    owner: u64,
    kind: SignalKind,
    shutdown: Shutdown,
}

/// Exit status used when a signal arrives and no owner is routed; 128 + SIGINT.
pub const UNROUTED_EXIT_STATUS: i32 = 130;

static ROUTES: Mutex<Vec<Route>> = Mutex::new(Vec::new());
static HANDLER: OnceLock<Result<(), String>> = OnceLock::new();
static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn install_handler() -> Result<(), SignalError> {
    HANDLER
        .get_or_init(|| {
            ctrlc::set_handler(|| {
                let delivered: usize = SignalKind::ALL.into_iter().map(deliver).sum();
                if delivered == 0 {
                    std::process::exit(UNROUTED_EXIT_STATUS);
                }
            })
            .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(SignalError::Install)
}

/// Requests shutdown on every owner registered for `kind`; returns how many were reached.
pub fn deliver(kind: SignalKind) -> usize {
    let routes = lock(&ROUTES);
    let mut delivered = 0;
    for route in routes.iter().filter(|r| r.kind == kind) {
        info!("signal occurred: {} (owner {})", kind.name(), route.owner);
        route.shutdown.request();
        delivered += 1;
    }
    delivered
}

/// The set of signals one owner listens to.
///
/// Dropping it removes every route it registered, leaving later owners unaffected.
pub struct SignalRoutes {
    owner: u64,
    shutdown: Shutdown,
}

impl SignalRoutes {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            shutdown,
        }
    }

    /// Routes `kind` to this owner. Returns `false` when it already was.
    pub fn connect(&mut self, kind: SignalKind) -> Result<bool, SignalError> {
        install_handler()?;

        let mut routes = lock(&ROUTES);
        if routes
            .iter()
            .any(|r| r.owner == self.owner && r.kind == kind)
        {
            return Ok(false);
        }

        routes.push(Route {
            owner: self.owner,
            kind,
            shutdown: self.shutdown.clone(),
        });
        Ok(true)
    }

    /// Stops routing `kind` to this owner. Returns `false` when it was not routed.
    pub fn disconnect(&mut self, kind: SignalKind) -> bool {
        let mut routes = lock(&ROUTES);
        let before = routes.len();
        routes.retain(|r| !(r.owner == self.owner && r.kind == kind));
        routes.len() != before
    }

    pub fn is_connected(&self, kind: SignalKind) -> bool {
        lock(&ROUTES)
            .iter()
            .any(|r| r.owner == self.owner && r.kind == kind)
    }
}

impl Drop for SignalRoutes {
    fn drop(&mut self) {
        lock(&ROUTES).retain(|r| r.owner != self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Family, Poller, Readiness, Socket, Timeout};

    #[test]
    fn connect_is_idempotent() {
        let mut routes = SignalRoutes::new(Shutdown::new());

        assert!(routes.connect(SignalKind::Interrupt).unwrap());
        assert!(!routes.connect(SignalKind::Interrupt).unwrap());
        assert!(routes.is_connected(SignalKind::Interrupt));

        assert!(routes.disconnect(SignalKind::Interrupt));
        assert!(!routes.disconnect(SignalKind::Interrupt));
    }

    #[test]
    fn delivery_reaches_owner_and_drop_unroutes() {
        let first = Shutdown::new();
        let second = Shutdown::new();

        let mut first_routes = SignalRoutes::new(first.clone());
        first_routes.connect(SignalKind::Hangup).unwrap();

        {
            let mut second_routes = SignalRoutes::new(second.clone());
            second_routes.connect(SignalKind::Hangup).unwrap();
        }

        assert!(deliver(SignalKind::Hangup) >= 1);
        assert!(first.is_requested());
        assert!(!second.is_requested());

        drop(first_routes);
        let third = Shutdown::new();
        let _third_routes = SignalRoutes::new(third.clone());
        deliver(SignalKind::Hangup);
        assert!(!third.is_requested());
    }

    #[test]
    fn request_cancels_attached_wait() {
        let mut listener = Socket::create(Family::Ipv4).unwrap();
        listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(1).unwrap();

        let mut poller = Poller::new().unwrap();
        let shutdown = Shutdown::new();
        shutdown.attach(poller.canceller());

        assert!(!shutdown.is_requested());
        shutdown.request();
        assert!(shutdown.is_requested());
        assert_eq!(
            poller.read_ready(&mut listener, Timeout::Infinite).unwrap(),
            Readiness::Pending
        );
    }
}
