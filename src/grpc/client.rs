//! Decision service backend speaking Envoy's rate limit gRPC API.

use async_trait::async_trait;
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument, trace};

use super::proto::envoy::extensions::common::ratelimit::v3::rate_limit_descriptor::Entry;
use super::{Code, RateLimitDescriptor, RateLimitRequest, RateLimitServiceClient};
use crate::error::Result;
use crate::ratelimit::{Descriptor, LimitStatus, RateLimitBackend};

/// Metadata key carrying the request id to the decision service.
const REQUEST_ID_METADATA: &str = "x-request-id";

impl From<&Descriptor> for RateLimitDescriptor {
    fn from(descriptor: &Descriptor) -> Self {
        Self {
            entries: descriptor
                .entries
                .iter()
                .map(|e| Entry {
                    key: e.key.clone(),
                    value: e.value.clone(),
                })
                .collect(),
        }
    }
}

impl From<Code> for LimitStatus {
    fn from(code: Code) -> Self {
        match code {
            Code::OverLimit => LimitStatus::OverLimit,
            Code::Ok | Code::Unknown => LimitStatus::Ok,
        }
    }
}

/// Build the wire request for a limit check.
pub(crate) fn build_request(
    domain: &str,
    descriptors: &[Descriptor],
    request_id: &str,
) -> tonic::Request<RateLimitRequest> {
    let mut request = tonic::Request::new(RateLimitRequest {
        domain: domain.to_string(),
        descriptors: descriptors.iter().map(RateLimitDescriptor::from).collect(),
        hits_addend: 0,
    });

    if !request_id.is_empty() {
        match request_id.parse::<MetadataValue<Ascii>>() {
            Ok(value) => {
                request.metadata_mut().insert(REQUEST_ID_METADATA, value);
            }
            Err(_) => trace!(request_id = %request_id, "Request id is not valid metadata"),
        }
    }

    request
}

/// Rate limit backend calling a remote `RateLimitService` over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcRateLimitBackend {
    client: RateLimitServiceClient,
}

impl GrpcRateLimitBackend {
    /// Create a backend over an existing channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            client: RateLimitServiceClient::new(channel),
        }
    }

    /// Create a backend that connects on first use.
    pub fn connect_lazy(address: &str, connect_timeout: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(address.to_string())?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        debug!(address = %address, "Rate limit service channel created");
        Ok(Self::new(channel))
    }
}

#[async_trait]
impl RateLimitBackend for GrpcRateLimitBackend {
    #[instrument(skip(self, descriptors), fields(descriptor_count = descriptors.len()))]
    async fn should_rate_limit(
        &self,
        domain: &str,
        descriptors: &[Descriptor],
        request_id: &str,
    ) -> Result<LimitStatus> {
        let mut client = self.client.clone();
        let response = client
            .should_rate_limit(build_request(domain, descriptors, request_id))
            .await?;

        let code = response.into_inner().overall_code();
        trace!(code = ?code, "Rate limit service replied");
        Ok(code.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_conversion_keeps_order() {
        let descriptor = Descriptor::from_pairs([("source", "a"), ("destination", "b")]);
        let proto = RateLimitDescriptor::from(&descriptor);

        assert_eq!(proto.entries.len(), 2);
        assert_eq!(proto.entries[0].key, "source");
        assert_eq!(proto.entries[0].value, "a");
        assert_eq!(proto.entries[1].key, "destination");
        assert_eq!(proto.entries[1].value, "b");
    }

    #[test]
    fn test_response_decodes_with_unknown_fields() {
        use crate::grpc::RateLimitResponse;
        use prost::Message;

        // overall_code = OVER_LIMIT, then an empty `statuses` entry (tag 2)
        let wire = [0x08, 0x02, 0x12, 0x00];
        let response = RateLimitResponse::decode(&wire[..]).unwrap();

        assert_eq!(response.overall_code(), Code::OverLimit);
        assert_eq!(LimitStatus::from(response.overall_code()), LimitStatus::OverLimit);
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(LimitStatus::from(Code::Ok), LimitStatus::Ok);
        assert_eq!(LimitStatus::from(Code::OverLimit), LimitStatus::OverLimit);
        assert_eq!(LimitStatus::from(Code::Unknown), LimitStatus::Ok);
    }

    #[test]
    fn test_build_request_with_request_id() {
        let descriptors = vec![Descriptor::from_pairs([("user", "bob")])];
        let request = build_request("edge", &descriptors, "abc-123");

        assert_eq!(
            request.metadata().get(REQUEST_ID_METADATA).unwrap(),
            "abc-123"
        );
        let message = request.get_ref();
        assert_eq!(message.domain, "edge");
        assert_eq!(message.descriptors.len(), 1);
        assert_eq!(message.hits_addend, 0);
    }

    #[test]
    fn test_build_request_without_request_id() {
        let request = build_request("edge", &[], "");
        assert!(request.metadata().get(REQUEST_ID_METADATA).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error() {
        let backend =
            GrpcRateLimitBackend::connect_lazy("http://127.0.0.1:1", Duration::from_millis(50))
                .unwrap();
        let descriptors = vec![Descriptor::from_pairs([("user", "bob")])];

        let result = backend.should_rate_limit("edge", &descriptors, "").await;
        tokio_test::assert_err!(result);
    }
}
