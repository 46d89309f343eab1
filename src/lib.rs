//! Ratelimit Filter - Global rate limiting for a reverse proxy request pipeline
//!
//! This crate implements the HTTP decoder filter that admits or rejects
//! requests based on a verdict from an external rate limit service speaking
//! Envoy's global rate limiting API. Route and virtual host policies turn
//! each request into descriptors; the filter pauses the request while the
//! service decides, then resumes it or answers `429 Too Many Requests`.

pub mod config;
pub mod error;
pub mod filter;
pub mod grpc;
pub mod ratelimit;
pub mod router;
pub mod runtime;
pub mod stats;
pub mod upstream;
