//! Decision service backend trait.

use async_trait::async_trait;

use super::client::LimitStatus;
use super::descriptor::Descriptor;
use crate::error::Result;

/// Trait for rate limit decision service implementations.
///
/// This trait abstracts over the transport used to reach the decision
/// service so that `AsyncRateLimitClient` can drive any of them.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Ask the decision service whether the request is over limit.
    async fn should_rate_limit(
        &self,
        domain: &str,
        descriptors: &[Descriptor],
        request_id: &str,
    ) -> Result<LimitStatus>;
}
