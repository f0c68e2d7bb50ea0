//! Idle expiry. Every accepted request resets the last-access time; a
//! background check shuts the server down once it has been idle longer
//! than the configured timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on the interval between idle checks.
const CHECK_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ExpiryManager {
    timeout: Option<Duration>,
    last_access: Mutex<Instant>,
}

impl ExpiryManager {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Record an access now.
    pub fn ping(&self) {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Whether the server has been idle for longer than the timeout.
    pub fn is_expired(&self) -> bool {
        self.timeout.is_some_and(|timeout| self.idle_for() > timeout)
    }
}

/// Middleware recording each request as an access.
pub async fn track_access(
    State(expiry): State<Arc<ExpiryManager>>,
    request: Request,
    next: Next,
) -> Response {
    expiry.ping();
    next.run(request).await
}

/// Periodically check for expiry and cancel `shutdown` when it happens.
/// Does nothing when no timeout is configured.
pub fn spawn_checker(expiry: Arc<ExpiryManager>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(timeout) = expiry.timeout() else {
            return;
        };
        let period = timeout.min(CHECK_PERIOD).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if expiry.is_expired() {
                        tracing::info!(idle = ?expiry.idle_for(), "idle timeout reached, shutting down");
                        shutdown.cancel();
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_idle_timeout() {
        let expiry = ExpiryManager::new(Some(Duration::from_secs(60)));
        assert!(!expiry.is_expired());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(expiry.is_expired());

        expiry.ping();
        assert!(!expiry.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_at_timeout_is_not_expired() {
        let expiry = ExpiryManager::new(Some(Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!expiry.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_never_expires() {
        let expiry = ExpiryManager::new(None);
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(!expiry.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn checker_cancels_on_expiry() {
        let expiry = Arc::new(ExpiryManager::new(Some(Duration::from_secs(60))));
        let shutdown = CancellationToken::new();
        let checker = spawn_checker(expiry, shutdown.clone());

        tokio::time::timeout(Duration::from_secs(200), shutdown.cancelled())
            .await
            .unwrap();
        checker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn checker_exits_on_shutdown() {
        let expiry = Arc::new(ExpiryManager::new(Some(Duration::from_secs(60))));
        let shutdown = CancellationToken::new();
        let checker = spawn_checker(expiry, shutdown.clone());
        shutdown.cancel();
        checker.await.unwrap();
    }
}
