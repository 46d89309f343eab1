//! Descriptor evaluation over route and virtual host policies.

use tracing::trace;

use super::descriptor::Descriptor;
use super::policy::{PolicyRule, RequestContext};

/// Runtime key gating the rules that share `route_key`.
pub fn route_key_runtime_key(route_key: &str) -> String {
    format!("ratelimit.{}.http_filter_enabled", route_key)
}

/// Append the descriptors produced by `rules` for the request.
///
/// Only rules whose stage equals `stage` are considered. Rules with a
/// non-empty route key are skipped entirely when `is_rule_enabled` reports
/// the key disabled. Output order follows rule order.
pub fn populate_descriptors<'r, R, I, F>(
    rules: I,
    stage: u64,
    ctx: &RequestContext<'_>,
    is_rule_enabled: F,
    descriptors: &mut Vec<Descriptor>,
) where
    R: PolicyRule + ?Sized + 'r,
    I: IntoIterator<Item = &'r R>,
    F: Fn(&str) -> bool,
{
    for rule in rules {
        if rule.stage() != stage {
            continue;
        }

        let route_key = rule.route_key();
        if !route_key.is_empty() && !is_rule_enabled(route_key) {
            trace!(route_key = %route_key, "Rate limit rule disabled by runtime");
            continue;
        }

        rule.populate_descriptors(ctx, descriptors);
    }
}

/// Evaluate `rules` into a fresh descriptor list.
pub fn evaluate<'r, R, I, F>(
    rules: I,
    stage: u64,
    ctx: &RequestContext<'_>,
    is_rule_enabled: F,
) -> Vec<Descriptor>
where
    R: PolicyRule + ?Sized + 'r,
    I: IntoIterator<Item = &'r R>,
    F: Fn(&str) -> bool,
{
    let mut descriptors = Vec::new();
    populate_descriptors(rules, stage, ctx, is_rule_enabled, &mut descriptors);
    descriptors
}
