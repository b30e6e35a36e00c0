//! Out-of-band connection failures.

use crate::error::{DriverError, PgError};
use std::sync::Arc;
use tokio::sync::watch;

/// Reporting side, handed to every connection's background task.
#[derive(Debug, Clone)]
pub(crate) struct FailureNotifier {
    tx: Arc<watch::Sender<Option<DriverError>>>,
}

impl FailureNotifier {
    pub(crate) fn channel() -> (Self, PoolFailures) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, PoolFailures { rx })
    }

    /// Record a failure. Only the first one is kept.
    pub(crate) fn notify(&self, error: DriverError) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(error);
            true
        });
    }
}

/// Resolves once any pooled connection fails in the background (e.g. the
/// server went away while the connection was idle).
#[derive(Debug, Clone)]
pub struct PoolFailures {
    rx: watch::Receiver<Option<DriverError>>,
}

impl PoolFailures {
    /// Wait for the first connection failure.
    ///
    /// Never resolves if the pool is dropped without a failure; race it
    /// against something else (`tokio::select!`) rather than awaiting it alone.
    pub async fn wait(&self) -> PgError {
        let mut rx = self.rx.clone();
        let failure = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match failure {
            Some(error) => PgError::Connection(error),
            None => std::future::pending().await,
        }
    }

    /// The failure reported so far, if any.
    pub fn current(&self) -> Option<PgError> {
        self.rx.borrow().clone().map(PgError::Connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_failure_wins() {
        let (notifier, failures) = FailureNotifier::channel();
        assert!(failures.current().is_none());

        notifier.notify(DriverError::new("server closed the connection unexpectedly"));
        notifier.notify(DriverError::new("second"));

        let err = failures.wait().await;
        assert_eq!(err.kind(), "E_PG_CONNECTION");
        assert_eq!(
            err.driver_error().map(DriverError::message),
            Some("server closed the connection unexpectedly")
        );
    }

    #[tokio::test]
    async fn waiters_registered_before_the_failure_are_woken() {
        let (notifier, failures) = FailureNotifier::channel();
        let waiter = tokio::spawn({
            let failures = failures.clone();
            async move { failures.wait().await }
        });
        tokio::task::yield_now().await;

        notifier.notify(DriverError::new("terminating connection").with_code("57P01"));
        let err = waiter.await.unwrap();
        assert_eq!(err.code(), Some("57P01"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_failure_never_resolves() {
        let (notifier, failures) = FailureNotifier::channel();
        drop(notifier);
        let waited = tokio::time::timeout(Duration::from_secs(60), failures.wait()).await;
        assert!(waited.is_err());
    }
}
