//! Shutdown signaling shared by the dispatch engine and the scheduler,
//! broadcast to every listener at once.

/// A cooperative shutdown signal, broadcast to every listener at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Creates a shutdown broadcast pair. Every clone of the returned
/// `broadcast::Sender` can fire `Signal::Shutdown`; every subscriber
/// receives it exactly once.
#[must_use]
pub fn channel() -> (tokio::sync::broadcast::Sender<Signal>, tokio::sync::broadcast::Receiver<Signal>) {
    tokio::sync::broadcast::channel(1)
}
