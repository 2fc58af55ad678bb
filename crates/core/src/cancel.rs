//! Cooperative cancellation.
//!
//! A `CancelToken` is threaded into every adapter and model call and checked
//! at each suspension point. Cancelling is idempotent and wakes all waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Cloneable cancellation handle shared by all workers of one task.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Safe to call more than once.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Error::Cancelled)` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once the token fires. Resolves immediately if already fired.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();
        timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_after_fire() {
        let token = CancelToken::new();
        token.cancel();
        timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already-fired token must not block");
    }
}
