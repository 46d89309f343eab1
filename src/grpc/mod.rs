//! gRPC client for the Envoy rate limit service.

mod client;

pub use client::GrpcRateLimitBackend;

/// Wire messages and client stub of `envoy.service.ratelimit.v3`.
///
/// The items mirror what `tonic-build` generates from the Envoy protos, cut
/// down to the single unary method and the fields the filter reads or
/// writes. Field tags match the upstream protos, so unknown fields sent by
/// the service are skipped on decode.
pub mod proto {
    pub mod envoy {
        pub mod extensions {
            pub mod common {
                pub mod ratelimit {
                    pub mod v3 {
                        /// A list of hierarchical entries used to compute the limit key.
                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct RateLimitDescriptor {
                            #[prost(message, repeated, tag = "1")]
                            pub entries: Vec<rate_limit_descriptor::Entry>,
                        }

                        /// Nested message types in `RateLimitDescriptor`.
                        pub mod rate_limit_descriptor {
                            #[derive(Clone, PartialEq, ::prost::Message)]
                            pub struct Entry {
                                #[prost(string, tag = "1")]
                                pub key: String,
                                #[prost(string, tag = "2")]
                                pub value: String,
                            }
                        }
                    }
                }
            }
        }
        pub mod service {
            pub mod ratelimit {
                pub mod v3 {
                    use super::super::super::extensions::common::ratelimit::v3::RateLimitDescriptor;

                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct RateLimitRequest {
                        #[prost(string, tag = "1")]
                        pub domain: String,
                        #[prost(message, repeated, tag = "2")]
                        pub descriptors: Vec<RateLimitDescriptor>,
                        #[prost(uint32, tag = "3")]
                        pub hits_addend: u32,
                    }

                    #[derive(Clone, PartialEq, ::prost::Message)]
                    pub struct RateLimitResponse {
                        #[prost(enumeration = "rate_limit_response::Code", tag = "1")]
                        pub overall_code: i32,
                    }

                    /// Nested enum types in `RateLimitResponse`.
                    pub mod rate_limit_response {
                        #[derive(
                            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
                        )]
                        #[repr(i32)]
                        pub enum Code {
                            Unknown = 0,
                            Ok = 1,
                            OverLimit = 2,
                        }
                    }

                    /// Client for `RateLimitService`.
                    pub mod rate_limit_service_client {
                        use super::{RateLimitRequest, RateLimitResponse};
                        use tonic::transport::Channel;

                        #[derive(Clone)]
                        pub struct RateLimitServiceClient {
                            inner: tonic::client::Grpc<Channel>,
                        }

                        impl RateLimitServiceClient {
                            pub fn new(channel: Channel) -> Self {
                                Self {
                                    inner: tonic::client::Grpc::new(channel),
                                }
                            }

                            /// Determine whether rate limiting should take place.
                            pub async fn should_rate_limit(
                                &mut self,
                                request: impl tonic::IntoRequest<RateLimitRequest>,
                            ) -> Result<tonic::Response<RateLimitResponse>, tonic::Status> {
                                self.inner.ready().await.map_err(|e| {
                                    tonic::Status::new(
                                        tonic::Code::Unknown,
                                        format!("Service was not ready: {}", e),
                                    )
                                })?;
                                let codec = tonic::codec::ProstCodec::default();
                                let path = http::uri::PathAndQuery::from_static(
                                    "/envoy.service.ratelimit.v3.RateLimitService/ShouldRateLimit",
                                );
                                self.inner.unary(request.into_request(), path, codec).await
                            }
                        }

                        impl std::fmt::Debug for RateLimitServiceClient {
                            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                                write!(f, "RateLimitServiceClient {{ ... }}")
                            }
                        }
                    }
                }
            }
        }
    }
}

// Re-export commonly used types
pub use proto::envoy::extensions::common::ratelimit::v3::RateLimitDescriptor;
pub use proto::envoy::service::ratelimit::v3::{
    rate_limit_response::Code, rate_limit_service_client::RateLimitServiceClient,
    RateLimitRequest, RateLimitResponse,
};
