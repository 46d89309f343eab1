use anyhow::{anyhow, bail, Context};
use clap::Parser;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratelimit_filter::config::{FilterConfig, ServiceConfig};
use ratelimit_filter::filter::{
    FilterHeadersStatus, RateLimitFilter, ResetStreamCallback, ResponseFlag, ResponseHeaders,
    StreamDecoderFilter, StreamDecoderFilterCallbacks, REQUEST_ID_HEADER,
};
use ratelimit_filter::grpc::GrpcRateLimitBackend;
use ratelimit_filter::ratelimit::{
    evaluate, route_key_runtime_key, AsyncRateLimitClient, Descriptor, RequestContext,
};
use ratelimit_filter::router::{RouteEntry, RouteTable};
use ratelimit_filter::runtime::{Runtime, RuntimeLoader};
use ratelimit_filter::stats::Store;
use ratelimit_filter::upstream::StaticClusterManager;

/// Push a single request through the rate limit filter.
#[derive(Debug, Parser)]
#[command(name = "rlfilter", version, about)]
struct Args {
    /// Service configuration file (YAML)
    #[arg(short, long)]
    config: String,

    /// Route to resolve the request to, by name
    #[arg(short, long, conflicts_with = "path")]
    route: Option<String>,

    /// Request path, matched against route prefixes
    #[arg(short, long)]
    path: Option<String>,

    /// Request header as `name:value`, may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(HeaderName, HeaderValue)>,

    /// Downstream peer address
    #[arg(long)]
    remote_address: Option<IpAddr>,

    /// Request id forwarded to the rate limit service
    #[arg(long)]
    request_id: Option<String>,

    /// Only print the descriptors, do not call the service
    #[arg(long)]
    dry_run: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected name:value, got `{}`", raw))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| e.to_string())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|e| e.to_string())?;
    Ok((name, value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allowed,
    RateLimited,
}

/// Stream callbacks for a single synthetic request.
struct CliStream {
    route: Option<Arc<dyn RouteEntry>>,
    remote_address: Option<IpAddr>,
    verdict: Mutex<Option<oneshot::Sender<Verdict>>>,
    resets: Mutex<Vec<ResetStreamCallback>>,
}

impl CliStream {
    fn finish(&self, verdict: Verdict) {
        if let Some(tx) = self.verdict.lock().take() {
            let _ = tx.send(verdict);
        }
    }

    fn reset(&self) {
        let callbacks: Vec<ResetStreamCallback> = self.resets.lock().drain(..).collect();
        for callback in callbacks {
            callback();
        }
    }
}

impl StreamDecoderFilterCallbacks for CliStream {
    fn route(&self) -> Option<Arc<dyn RouteEntry>> {
        self.route.clone()
    }

    fn continue_decoding(&self) {
        self.finish(Verdict::Allowed);
    }

    fn encode_headers(&self, headers: ResponseHeaders, end_stream: bool) {
        info!(status = %headers.status, end_stream, "Local reply");
        self.finish(Verdict::RateLimited);
    }

    fn set_response_flag(&self, flag: ResponseFlag) {
        info!(flag = ?flag, "Response flag set");
    }

    fn downstream_address(&self) -> Option<IpAddr> {
        self.remote_address
    }

    fn add_reset_stream_callback(&self, callback: ResetStreamCallback) {
        self.resets.lock().push(callback);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = ServiceConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    info!(
        domain = %config.filter.domain,
        stage = config.filter.stage,
        node = %config.local_info.node_name,
        cluster = %config.local_info.cluster_name,
        "Configuration loaded"
    );

    let store = Store::new();
    let runtime = Arc::new(RuntimeLoader::with_overrides(config.runtime.clone()));
    let cm = Arc::new(StaticClusterManager::new(store.clone()));
    for cluster in &config.clusters {
        cm.add_cluster(cluster);
    }
    let routes = RouteTable::from_configs(config.virtual_hosts.clone())?;
    info!(routes = routes.len(), clusters = cm.len(), "Route table built");

    let route: Option<Arc<dyn RouteEntry>> = match (&args.route, &args.path) {
        (Some(name), _) => {
            let route: Arc<dyn RouteEntry> = routes
                .route(name)
                .ok_or_else(|| anyhow!("unknown route `{}`", name))?;
            Some(route)
        }
        (None, Some(path)) => routes.match_path(path).map(|r| r as Arc<dyn RouteEntry>),
        (None, None) => None,
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &args.headers {
        headers.append(name.clone(), value.clone());
    }
    if let Some(request_id) = &args.request_id {
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_str(request_id).context("invalid request id")?,
        );
    }

    if args.dry_run {
        let Some(route) = route else {
            bail!("--dry-run needs a route");
        };
        let descriptors = dry_run(
            &*route,
            &headers,
            &config.local_info.cluster_name,
            args.remote_address,
            config.filter.stage,
            runtime.as_ref(),
        );
        print_descriptors(&descriptors);
        return Ok(());
    }

    let filter_config = Arc::new(FilterConfig::new(
        config.filter.clone(),
        config.local_info.clone(),
        store.clone(),
        runtime,
        cm,
    )?);

    let backend = GrpcRateLimitBackend::connect_lazy(
        &config.rate_limit_service.address,
        Duration::from_millis(config.rate_limit_service.connect_timeout_ms),
    )?;
    let client = AsyncRateLimitClient::new(
        Arc::new(backend),
        filter_config.timeout(),
        Handle::current(),
    );

    let (tx, rx) = oneshot::channel();
    let stream = Arc::new(CliStream {
        route,
        remote_address: args.remote_address,
        verdict: Mutex::new(Some(tx)),
        resets: Mutex::new(Vec::new()),
    });

    let rate_limit_filter = RateLimitFilter::new(filter_config, Box::new(client));
    rate_limit_filter.set_decoder_filter_callbacks(stream.clone());

    let verdict = match rate_limit_filter.decode_headers(&mut headers, true) {
        FilterHeadersStatus::Continue => Verdict::Allowed,
        FilterHeadersStatus::StopIteration => {
            tokio::select! {
                verdict = rx => verdict.context("filter dropped without a verdict")?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, resetting stream");
                    stream.reset();
                    rate_limit_filter.on_destroy();
                    return Ok(());
                }
            }
        }
    };
    rate_limit_filter.on_destroy();

    if let Some(decision) = rate_limit_filter.decision() {
        info!(decision = ?decision, "Filter finished");
    }
    match verdict {
        Verdict::Allowed => println!("allowed"),
        Verdict::RateLimited => println!("rate limited"),
    }
    for (name, value) in store.counters() {
        println!("{} {}", name, value);
    }

    Ok(())
}

fn dry_run(
    route: &dyn RouteEntry,
    headers: &HeaderMap,
    local_service_cluster: &str,
    remote_address: Option<IpAddr>,
    stage: u64,
    runtime: &dyn Runtime,
) -> Vec<Descriptor> {
    let ctx = RequestContext {
        route,
        headers,
        local_service_cluster,
        remote_address,
    };
    let is_rule_enabled =
        |key: &str| runtime.feature_enabled(&route_key_runtime_key(key), 100);

    let mut descriptors = evaluate(
        route.rate_limit_policy().entries(),
        stage,
        &ctx,
        &is_rule_enabled,
    );
    descriptors.extend(evaluate(
        route.virtual_host().rate_limit_policy().entries(),
        stage,
        &ctx,
        &is_rule_enabled,
    ));
    descriptors
}

fn print_descriptors(descriptors: &[Descriptor]) {
    if descriptors.is_empty() {
        println!("no descriptors");
    }
    for descriptor in descriptors {
        println!("{}", descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let (name, value) = parse_header("X-User: bob").unwrap();
        assert_eq!(name, "x-user");
        assert_eq!(value, "bob");

        assert!(parse_header("no-colon").is_err());
        assert!(parse_header("bad name:v").is_err());
    }
}
