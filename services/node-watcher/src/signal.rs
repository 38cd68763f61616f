//! Shutdown and cancellation signals.
//!
//! Both are plain `watch::Receiver<bool>` values: `true` means stop.

use tokio::sync::watch;

/// Receiver half of a shutdown or cancellation signal.
pub type Signal = watch::Receiver<bool>;

/// Wait until the signal is raised.
///
/// If every sender is dropped without raising the signal, nobody can raise
/// it any more and this never resolves.
pub async fn raised(signal: &mut Signal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A signal that is never raised.
pub fn never() -> Signal {
    let (_tx, rx) = watch::channel(false);
    rx
}
