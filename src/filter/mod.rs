//! HTTP filter chain surface and the rate limit filter.
//!
//! The proxy drives each request through an ordered chain of decoder
//! filters. A filter may pause the chain from any hook and later resume it
//! through its callbacks, or end the request by sending a local response.

mod ratelimit;

pub use ratelimit::{Decision, Phase, RateLimitFilter, ENABLED_KEY, ENFORCING_KEY, REQUEST_ID_HEADER};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::router::RouteEntry;

/// Return value of `decode_headers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// Continue with the next filter
    Continue,
    /// Pause the chain until `continue_decoding` is called
    StopIteration,
}

/// Return value of `decode_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    /// Continue with the next filter
    Continue,
    /// Pause the chain and buffer the body
    StopIterationAndBuffer,
}

/// Return value of `decode_trailers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    /// Continue with the next filter
    Continue,
    /// Pause the chain
    StopIteration,
}

/// Flags recorded on a request for access logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseFlag {
    /// The request was rejected by the rate limit filter
    RateLimited,
}

/// Response headers sent downstream by a filter.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    /// Response status
    pub status: StatusCode,
    /// Headers other than the status
    pub headers: HeaderMap,
}

impl ResponseHeaders {
    /// Status-only response headers.
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

/// Observer fired when the downstream stream terminates early.
pub type ResetStreamCallback = Box<dyn FnOnce() + Send + 'static>;

/// What a decoder filter may ask of the stream it is attached to.
pub trait StreamDecoderFilterCallbacks: Send + Sync {
    /// The route the request resolved to.
    fn route(&self) -> Option<Arc<dyn RouteEntry>>;

    /// Resume a chain paused by this filter.
    fn continue_decoding(&self);

    /// Send response headers downstream.
    fn encode_headers(&self, headers: ResponseHeaders, end_stream: bool);

    /// Record a response flag for access logging.
    fn set_response_flag(&self, flag: ResponseFlag);

    /// Address of the downstream peer.
    fn downstream_address(&self) -> Option<IpAddr>;

    /// Register an observer for early stream termination.
    fn add_reset_stream_callback(&self, callback: ResetStreamCallback);
}

/// A request decoder filter.
pub trait StreamDecoderFilter: Send + Sync {
    /// Called with the request headers.
    fn decode_headers(&self, headers: &mut HeaderMap, end_stream: bool) -> FilterHeadersStatus;

    /// Called with each chunk of request body.
    fn decode_data(&self, data: &mut Bytes, end_stream: bool) -> Result<FilterDataStatus>;

    /// Called with the request trailers.
    fn decode_trailers(&self, trailers: &mut HeaderMap) -> Result<FilterTrailersStatus>;

    /// Attach the filter to its stream. Called once, before any decode hook.
    fn set_decoder_filter_callbacks(&self, callbacks: Arc<dyn StreamDecoderFilterCallbacks>);

    /// Called when the request is torn down.
    fn on_destroy(&self) {}
}
