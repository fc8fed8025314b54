//! Network availability plumbing.
//!
//! The pool consumes a boolean reachability signal published by an external
//! observer (OS reachability APIs, a connectivity prober, a test). While the
//! signal reads "unavailable" every send is buffered without consulting the
//! load balancer; a transition back to "available" triggers a queue drain.

use tokio::sync::watch;

/// Publisher half of the reachability signal.
pub struct NetworkStatusHandle {
    tx: watch::Sender<bool>,
}

impl NetworkStatusHandle {
    /// Publish a reachability transition. Repeated values are harmless; the
    /// pool only reacts to actual changes.
    pub fn set_available(&self, available: bool) {
        let _ = self.tx.send(available);
    }
}

/// Create a reachability signal pair. The receiver is handed to
/// [`ConnectionPool::new`](crate::pool::ConnectionPool::new); the handle
/// stays with the observer.
pub fn channel(initially_available: bool) -> (NetworkStatusHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(initially_available);
    (NetworkStatusHandle { tx }, rx)
}

/// A receiver that permanently reports an available network, for callers
/// without a reachability source.
pub fn always_available() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(true);
    rx
}
