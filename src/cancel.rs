//! Operator cancellation.
//!
//! A `watch` channel carrying a single `bool`. The [`CancelHandle`] side is owned by
//! whoever listens for the interrupt (Ctrl+C in `main`), the [`CancelToken`] side is
//! cloned into every wait of the scheduler so cancellation is seen within one tick.

use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tokio::sync::watch;

/// Sender side: requests cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side: observed by waits and poll loops.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was already requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Another token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive so `changed()` never resolves.
        std::mem::forget(tx);
        Self { rx }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` if cancellation was requested.
    pub fn check(&self) -> AppResult<()> {
        if self.is_cancelled() {
            Err(DaqError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested (never, if the handle was dropped).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, waking early with `Err(Cancelled)` on cancellation.
    pub async fn sleep(&self, duration: Duration) -> AppResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(DaqError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let (_handle, token) = cancel_pair();
        let start = tokio::time::Instant::now();
        token.sleep(Duration::from_secs(5)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_wakes_on_cancel() {
        let (handle, token) = cancel_pair();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = token.sleep(Duration::from_secs(600)).await;
        assert!(matches!(result, Err(DaqError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_is_not_cancellation() {
        let (handle, token) = cancel_pair();
        drop(handle);
        token.sleep(Duration::from_millis(50)).await.unwrap();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn check_reports_cancellation() {
        let (handle, token) = cancel_pair();
        assert!(token.check().is_ok());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(token.check(), Err(DaqError::Cancelled)));
        assert!(handle.token().is_cancelled());
    }
}
