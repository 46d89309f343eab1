//! Callback based rate limit client used by the filter.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::backend::RateLimitBackend;
use super::descriptor::Descriptor;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitStatus {
    /// The request is within its limits
    Ok,
    /// The decision service could not produce a verdict
    Error,
    /// At least one descriptor is over its limit
    OverLimit,
}

impl std::fmt::Display for LimitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitStatus::Ok => write!(f, "ok"),
            LimitStatus::Error => write!(f, "error"),
            LimitStatus::OverLimit => write!(f, "over_limit"),
        }
    }
}

/// Completion handler for a single limit call.
pub type LimitCallback = Box<dyn FnOnce(LimitStatus) + Send + 'static>;

/// A client issuing limit checks on behalf of one filter instance.
///
/// `limit` must invoke `callback` exactly once, either before returning or
/// later from another context, unless `cancel` is called first.
pub trait RateLimitClient: Send + Sync {
    /// Issue a limit check.
    fn limit(
        &self,
        callback: LimitCallback,
        domain: &str,
        descriptors: &[Descriptor],
        request_id: &str,
    );

    /// Cancel the outstanding limit check. Its callback will not fire.
    fn cancel(&self);
}

/// Default time allowed for a decision.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20);

/// Drives a `RateLimitBackend` on a tokio runtime.
///
/// Backend failures and timeouts complete with `LimitStatus::Error`.
pub struct AsyncRateLimitClient<B: RateLimitBackend + 'static> {
    backend: Arc<B>,
    timeout: Duration,
    runtime: Handle,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl<B: RateLimitBackend + 'static> AsyncRateLimitClient<B> {
    /// Create a client running calls on `runtime`.
    pub fn new(backend: Arc<B>, timeout: Duration, runtime: Handle) -> Self {
        Self {
            backend,
            timeout,
            runtime,
            in_flight: Mutex::new(None),
        }
    }

    /// Whether a call was issued and not yet cancelled or finished.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl<B: RateLimitBackend + 'static> RateLimitClient for AsyncRateLimitClient<B> {
    fn limit(
        &self,
        callback: LimitCallback,
        domain: &str,
        descriptors: &[Descriptor],
        request_id: &str,
    ) {
        let backend = self.backend.clone();
        let timeout = self.timeout;
        let domain = domain.to_string();
        let descriptors = descriptors.to_vec();
        let request_id = request_id.to_string();

        let handle = self.runtime.spawn(async move {
            let call = backend.should_rate_limit(&domain, &descriptors, &request_id);
            let status = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(domain = %domain, error = %e, "Rate limit call failed");
                    LimitStatus::Error
                }
                Err(_) => {
                    warn!(
                        domain = %domain,
                        timeout_ms = timeout.as_millis() as u64,
                        "Rate limit call timed out"
                    );
                    LimitStatus::Error
                }
            };
            callback(status);
        });

        *self.in_flight.lock() = Some(handle);
    }

    fn cancel(&self) {
        if let Some(handle) = self.in_flight.lock().take() {
            debug!("Cancelling outstanding rate limit call");
            handle.abort();
        }
    }
}

impl<B: RateLimitBackend + 'static> Drop for AsyncRateLimitClient<B> {
    fn drop(&mut self) {
        // A client dropped mid-call must not leave the RPC running.
        if let Some(handle) = self.in_flight.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FilterError, Result};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    enum Behavior {
        Reply(LimitStatus),
        Fail,
        Hang,
    }

    struct MockBackend {
        behavior: Behavior,
    }

    #[async_trait]
    impl RateLimitBackend for MockBackend {
        async fn should_rate_limit(
            &self,
            _domain: &str,
            _descriptors: &[Descriptor],
            _request_id: &str,
        ) -> Result<LimitStatus> {
            match self.behavior {
                Behavior::Reply(status) => Ok(status),
                Behavior::Fail => Err(FilterError::Grpc(tonic::Status::unavailable("down"))),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    fn client(behavior: Behavior, timeout: Duration) -> AsyncRateLimitClient<MockBackend> {
        AsyncRateLimitClient::new(Arc::new(MockBackend { behavior }), timeout, Handle::current())
    }

    fn issue(client: &AsyncRateLimitClient<MockBackend>) -> oneshot::Receiver<LimitStatus> {
        let (tx, rx) = oneshot::channel();
        client.limit(
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
            "domain",
            &[Descriptor::from_pairs([("key", "value")])],
            "request-id",
        );
        rx
    }

    #[tokio::test]
    async fn test_completes_with_backend_status() {
        let client = client(Behavior::Reply(LimitStatus::OverLimit), Duration::from_secs(1));
        assert_eq!(tokio_test::assert_ok!(issue(&client).await), LimitStatus::OverLimit);
    }

    #[tokio::test]
    async fn test_backend_error_completes_with_error() {
        let client = client(Behavior::Fail, Duration::from_secs(1));
        assert_eq!(issue(&client).await.unwrap(), LimitStatus::Error);
    }

    #[tokio::test]
    async fn test_timeout_completes_with_error() {
        let client = client(Behavior::Hang, Duration::from_millis(10));
        assert_eq!(issue(&client).await.unwrap(), LimitStatus::Error);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_completion() {
        let client = client(Behavior::Hang, Duration::from_secs(60));
        let rx = issue(&client);
        assert!(client.is_in_flight());

        client.cancel();

        // The aborted task drops the callback without calling it.
        tokio_test::assert_err!(rx.await);
        assert!(!client.is_in_flight());
    }

    #[tokio::test]
    async fn test_drop_aborts_outstanding_call() {
        let client = client(Behavior::Hang, Duration::from_secs(60));
        let rx = issue(&client);

        drop(client);

        tokio_test::assert_err!(rx.await);
    }

    #[test]
    fn test_limit_status_display() {
        assert_eq!(LimitStatus::Ok.to_string(), "ok");
        assert_eq!(LimitStatus::Error.to_string(), "error");
        assert_eq!(LimitStatus::OverLimit.to_string(), "over_limit");
    }
}
