//! The rate limit decoder filter.
//!
//! On request headers the filter evaluates the route and virtual host rate
//! limit policies into descriptors and, when any apply, asks the decision
//! service for a verdict while holding the chain. The verdict charges
//! cluster stats and either resumes the chain or answers 429.
//!
//! The client may complete inline, before `limit` returns, or later from
//! another thread. All phase changes happen under one lock, and the header
//! hook reads the phase back after the call returns, so an inline
//! completion never pauses or resumes the chain twice.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use tracing::{debug, error, trace, warn};

use super::{
    FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus, ResponseFlag, ResponseHeaders,
    StreamDecoderFilter, StreamDecoderFilterCallbacks,
};
use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::ratelimit::{
    populate_descriptors, route_key_runtime_key, LimitCallback, LimitStatus, RateLimitClient,
    RequestContext,
};
use crate::stats::{charge_response_stat, ResponseStatInfo};
use crate::upstream::ClusterInfo;

/// Runtime key gating the filter as a whole.
pub const ENABLED_KEY: &str = "ratelimit.http_filter_enabled";

/// Runtime key gating whether over limit verdicts are enforced.
pub const ENFORCING_KEY: &str = "ratelimit.http_filter_enforcing";

/// Request header forwarded to the decision service as the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

static TOO_MANY_REQUESTS: LazyLock<ResponseHeaders> =
    LazyLock::new(|| ResponseHeaders::with_status(StatusCode::TOO_MANY_REQUESTS));

/// Where a filter is in its lifecycle. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// No limit call issued
    Idle,
    /// A limit call is outstanding
    Calling,
    /// The verdict arrived and the request was let through
    Complete,
    /// The verdict arrived and a 429 was sent
    Responded,
}

/// How the filter disposed of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The filter is disabled by runtime
    PolicyDisabled,
    /// No route resolved for the request
    NoRoute,
    /// No rate limit policy produced a descriptor
    NoApplicablePolicy,
    /// The decision service allowed the request
    Allowed,
    /// The decision service failed; the request was let through
    DecisionError,
    /// Over limit and rejected with a 429
    OverLimitEnforced,
    /// Over limit but enforcement is disabled
    OverLimitNotEnforced,
    /// The stream ended before the verdict arrived
    Cancelled,
}

struct FilterState {
    phase: Phase,
    cluster: Option<Arc<ClusterInfo>>,
    initiating_call: bool,
    cancelled: bool,
    decision: Option<Decision>,
}

enum Completion {
    Respond,
    Resume,
    Nothing,
}

struct FilterInner {
    config: Arc<FilterConfig>,
    client: Box<dyn RateLimitClient>,
    callbacks: OnceLock<Arc<dyn StreamDecoderFilterCallbacks>>,
    state: Mutex<FilterState>,
}

/// Per request rate limit filter.
pub struct RateLimitFilter {
    inner: Arc<FilterInner>,
}

impl RateLimitFilter {
    /// Create a filter for one request.
    pub fn new(config: Arc<FilterConfig>, client: Box<dyn RateLimitClient>) -> Self {
        Self {
            inner: Arc::new(FilterInner {
                config,
                client,
                callbacks: OnceLock::new(),
                state: Mutex::new(FilterState {
                    phase: Phase::Idle,
                    cluster: None,
                    initiating_call: false,
                    cancelled: false,
                    decision: None,
                }),
            }),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// How the request was disposed of, once known.
    pub fn decision(&self) -> Option<Decision> {
        self.inner.state.lock().decision
    }

    /// Deliver the verdict of the outstanding limit call.
    ///
    /// The client's completion callback lands here. Completing a filter
    /// that has no outstanding call is a protocol violation.
    pub fn complete(&self, status: LimitStatus) -> Result<()> {
        self.inner.complete(status)
    }

    /// Handle early termination of the downstream stream.
    pub fn on_stream_reset(&self) {
        self.inner.cancel_outstanding();
    }

    fn completion_callback(&self) -> LimitCallback {
        let filter = Arc::downgrade(&self.inner);
        Box::new(move |status| deliver(&filter, status))
    }

    fn record(&self, decision: Decision) {
        self.inner.state.lock().decision = Some(decision);
    }
}

fn deliver(filter: &Weak<FilterInner>, status: LimitStatus) {
    match filter.upgrade() {
        Some(inner) => {
            if let Err(e) = inner.complete(status) {
                error!(error = %e, "Dropping rate limit completion");
            }
        }
        None => debug!(status = %status, "Rate limit completion after filter teardown"),
    }
}

impl FilterInner {
    fn complete(&self, status: LimitStatus) -> Result<()> {
        let completion = {
            let mut state = self.state.lock();

            if state.cancelled {
                debug!(status = %status, "Ignoring completion of a cancelled rate limit call");
                return Ok(());
            }
            if state.phase != Phase::Calling {
                return Err(FilterError::ProtocolViolation(format!(
                    "rate limit completion in phase {:?}",
                    state.phase
                )));
            }

            state.phase = Phase::Complete;
            self.charge_stats(state.cluster.as_deref(), status);

            let enforce = status == LimitStatus::OverLimit
                && self.config.runtime().feature_enabled(ENFORCING_KEY, 100);

            if enforce {
                state.phase = Phase::Responded;
                state.decision = Some(Decision::OverLimitEnforced);
                Completion::Respond
            } else {
                state.decision = Some(match status {
                    LimitStatus::Ok => Decision::Allowed,
                    LimitStatus::Error => Decision::DecisionError,
                    LimitStatus::OverLimit => Decision::OverLimitNotEnforced,
                });
                if state.initiating_call {
                    Completion::Nothing
                } else {
                    Completion::Resume
                }
            }
        };

        debug!(
            domain = %self.config.domain(),
            status = %status,
            "Rate limit call completed"
        );

        if matches!(completion, Completion::Nothing) {
            return Ok(());
        }

        let callbacks = self.callbacks.get().ok_or_else(|| {
            FilterError::ProtocolViolation("rate limit completion without stream callbacks".into())
        })?;

        match completion {
            Completion::Respond => {
                callbacks.encode_headers(TOO_MANY_REQUESTS.clone(), true);
                callbacks.set_response_flag(ResponseFlag::RateLimited);
            }
            Completion::Resume => callbacks.continue_decoding(),
            Completion::Nothing => {}
        }

        Ok(())
    }

    fn charge_stats(&self, cluster: Option<&ClusterInfo>, status: LimitStatus) {
        let Some(cluster) = cluster else {
            warn!(status = %status, "Upstream cluster unresolved, skipping rate limit stats");
            return;
        };

        let scope = cluster.stats_scope();
        match status {
            LimitStatus::Ok => scope.counter("ratelimit.ok").inc(),
            LimitStatus::Error => scope.counter("ratelimit.error").inc(),
            LimitStatus::OverLimit => {
                scope.counter("ratelimit.over_limit").inc();
                charge_response_stat(&ResponseStatInfo {
                    global_store: self.config.global_store(),
                    cluster_scope: scope,
                    status: TOO_MANY_REQUESTS.status,
                    internal_request: true,
                    request_vhost_name: "",
                    request_vcluster_name: "",
                });
            }
        }
    }

    fn cancel_outstanding(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Calling || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.decision = Some(Decision::Cancelled);
        }

        debug!(domain = %self.config.domain(), "Stream reset, cancelling rate limit call");
        self.client.cancel();
    }
}

impl StreamDecoderFilter for RateLimitFilter {
    fn decode_headers(&self, headers: &mut HeaderMap, _end_stream: bool) -> FilterHeadersStatus {
        let config = &self.inner.config;

        if !config.runtime().feature_enabled(ENABLED_KEY, 100) {
            trace!("Rate limit filter disabled by runtime");
            self.record(Decision::PolicyDisabled);
            return FilterHeadersStatus::Continue;
        }

        let Some(callbacks) = self.inner.callbacks.get() else {
            warn!("Rate limit filter has no stream callbacks");
            self.record(Decision::NoRoute);
            return FilterHeadersStatus::Continue;
        };
        let Some(route) = callbacks.route() else {
            trace!("No route for request");
            self.record(Decision::NoRoute);
            return FilterHeadersStatus::Continue;
        };

        let cluster = config.cm().get(route.cluster_name());
        if cluster.is_none() {
            warn!(cluster = %route.cluster_name(), "Rate limited route targets an unknown cluster");
        }

        let ctx = RequestContext {
            route: &*route,
            headers: &*headers,
            local_service_cluster: &config.local_info().cluster_name,
            remote_address: callbacks.downstream_address(),
        };
        let is_rule_enabled =
            |route_key: &str| config.runtime().feature_enabled(&route_key_runtime_key(route_key), 100);

        let mut descriptors = Vec::new();
        populate_descriptors(
            route.rate_limit_policy().entries(),
            config.stage(),
            &ctx,
            &is_rule_enabled,
            &mut descriptors,
        );
        populate_descriptors(
            route.virtual_host().rate_limit_policy().entries(),
            config.stage(),
            &ctx,
            &is_rule_enabled,
            &mut descriptors,
        );

        if descriptors.is_empty() {
            trace!(route = %route.name(), "No applicable rate limit descriptors");
            self.record(Decision::NoApplicablePolicy);
            return FilterHeadersStatus::Continue;
        }

        {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Calling;
            state.initiating_call = true;
            state.cluster = cluster;
        }

        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        debug!(
            domain = %config.domain(),
            stage = config.stage(),
            route = %route.name(),
            descriptor_count = descriptors.len(),
            "Issuing rate limit call"
        );
        self.inner.client.limit(
            self.completion_callback(),
            config.domain(),
            &descriptors,
            request_id,
        );

        let phase = {
            let mut state = self.inner.state.lock();
            state.initiating_call = false;
            state.phase
        };

        match phase {
            Phase::Calling | Phase::Responded => FilterHeadersStatus::StopIteration,
            Phase::Idle | Phase::Complete => FilterHeadersStatus::Continue,
        }
    }

    fn decode_data(&self, _data: &mut Bytes, _end_stream: bool) -> Result<FilterDataStatus> {
        match self.phase() {
            Phase::Responded => {
                error!("Request body decoded after rate limit response was sent");
                Err(FilterError::ProtocolViolation(
                    "decode_data after local reply".into(),
                ))
            }
            Phase::Calling => Ok(FilterDataStatus::StopIterationAndBuffer),
            Phase::Idle | Phase::Complete => Ok(FilterDataStatus::Continue),
        }
    }

    fn decode_trailers(&self, _trailers: &mut HeaderMap) -> Result<FilterTrailersStatus> {
        match self.phase() {
            Phase::Responded => {
                error!("Request trailers decoded after rate limit response was sent");
                Err(FilterError::ProtocolViolation(
                    "decode_trailers after local reply".into(),
                ))
            }
            Phase::Calling => Ok(FilterTrailersStatus::StopIteration),
            Phase::Idle | Phase::Complete => Ok(FilterTrailersStatus::Continue),
        }
    }

    fn set_decoder_filter_callbacks(&self, callbacks: Arc<dyn StreamDecoderFilterCallbacks>) {
        let filter = Arc::downgrade(&self.inner);
        callbacks.add_reset_stream_callback(Box::new(move || {
            if let Some(inner) = filter.upgrade() {
                inner.cancel_outstanding();
            }
        }));

        if self.inner.callbacks.set(callbacks).is_err() {
            warn!("Rate limit filter callbacks already set");
        }
    }

    fn on_destroy(&self) {
        self.inner.cancel_outstanding();
    }
}
