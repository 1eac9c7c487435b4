//! Run cancellation signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, once-only cancellation flag shared by everything in a run.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Returns false if the run was already cancelled;
    /// the first reason wins.
    pub fn cancel(&self, reason: &str) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves with the reason once cancellation is requested.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.tx.subscribe();
        // The borrowed value must be released before any further await
        let reason = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .map(|r| r.clone().unwrap_or_default());
        match reason {
            Some(reason) => reason,
            // Unreachable while `self` holds the sender
            None => std::future::pending().await,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel("superseded"));
        assert!(!signal.cancel("operator"));
        assert_eq!(signal.reason().as_deref(), Some("superseded"));
        assert_eq!(signal.cancelled().await, "superseded");
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_cancel() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel("stop");
        assert_eq!(waiter.await.unwrap(), "stop");
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_cancelled_future_is_send() {
        let signal = CancelSignal::new();
        assert_send(signal.cancelled());
    }
}
