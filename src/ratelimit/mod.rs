//! Descriptors, policies and the decision client contract.

mod backend;
mod client;
mod descriptor;
mod evaluator;
mod policy;

pub use backend::RateLimitBackend;
pub use client::{AsyncRateLimitClient, LimitCallback, LimitStatus, RateLimitClient, DEFAULT_TIMEOUT};
pub use descriptor::{Descriptor, DescriptorEntry};
pub use evaluator::{evaluate, populate_descriptors, route_key_runtime_key};
pub use policy::{
    HeaderMatcher, PolicyRule, RateLimitAction, RateLimitPolicy, RateLimitPolicyEntry,
    RequestContext, MAX_STAGE,
};
