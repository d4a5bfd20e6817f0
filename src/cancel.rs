//! Cooperative batch cancellation.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation signal shared by the scheduler loop and every
/// in-flight process attempt. Cancelling is idempotent; observers see the
/// flag flip exactly once.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Safe to call any number of times, from any clone.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_uncancelled() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_observed_by_clones() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        signal.cancel();
        signal.cancel(); // idempotent
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancelled().await;
    }
}
