//! Traffic shifting. Weights follow the replica counts of the active
//! revisions; the mesh resources route the stable service host across
//! per-revision subsets.

use rollout_models::{
    MatchType, MeshRoutingSpec, RouteProvider, RuleType, TrafficRule, TrafficWeight,
};
use serde_json::{Value, json};

use crate::convention::{REVISION_LABEL_KEY, service_name};
use crate::errors::EngineError;
use crate::revision::ActiveRevision;

pub const VIRTUAL_SERVICE_KIND: &str = "VirtualService";
pub const DESTINATION_RULE_KIND: &str = "DestinationRule";
pub const TRAFFIC_SPLIT_KIND: &str = "TrafficSplit";

/// Match-type requirements differ per provider, and a bad rule set must
/// fail the rollout before anything is applied.
pub fn validate_rules(provider: RouteProvider, rules: &[TrafficRule]) -> Result<(), EngineError> {
    for rule in rules {
        match provider {
            RouteProvider::Istio => match rule.rule_type {
                // Port matching is numeric; any match type on the rule is
                // simply ignored when the match is rendered.
                RuleType::Port => {}
                _ => {
                    if rule.match_type.is_none() {
                        return Err(EngineError::Validation(format!(
                            "{} rules require a match type",
                            rule.rule_type.as_str()
                        )));
                    }
                }
            },
            RouteProvider::Smi => match rule.rule_type {
                RuleType::Authority | RuleType::Scheme | RuleType::Port => {
                    return Err(EngineError::Validation(format!(
                        "{} rules are not supported by the SMI provider",
                        rule.rule_type.as_str()
                    )));
                }
                _ => {}
            },
        }
    }
    Ok(())
}

/// Percentage split proportional to replica counts, rounded half-up.
/// Zero-weight entries are omitted and rounding drift is left alone, the
/// mesh normalizes routes itself. With nothing else active the new
/// revision takes everything.
pub fn compute_weights(active: &[ActiveRevision], new_revision: i32) -> Vec<TrafficWeight> {
    if active.is_empty() {
        return vec![TrafficWeight {
            revision: new_revision,
            weight: 100,
        }];
    }
    let total: i32 = active.iter().map(|a| a.replicas).sum();
    active
        .iter()
        .filter_map(|a| {
            let weight = ((a.replicas as f64) * 100.0 / (total as f64)).round() as i32;
            (weight > 0).then_some(TrafficWeight {
                revision: a.revision,
                weight,
            })
        })
        .collect()
}

fn subset_name(revision: i32) -> String {
    format!("r{revision}")
}

pub fn virtual_service(
    prefix: &str,
    mesh: &MeshRoutingSpec,
    weights: &[TrafficWeight],
) -> Value {
    let host = service_name(prefix);
    let hosts: Vec<&str> = if mesh.hosts.is_empty() {
        vec![host.as_str()]
    } else {
        mesh.hosts.iter().map(String::as_str).collect()
    };
    let route: Vec<Value> = weights
        .iter()
        .map(|w| {
            json!({
                "destination": { "host": host, "subset": subset_name(w.revision) },
                "weight": w.weight,
            })
        })
        .collect();
    let mut http = json!({ "route": route });
    let matches = rule_matches(&mesh.rules);
    if !matches.is_empty() {
        http["match"] = Value::Array(matches);
    }
    let mut spec = json!({ "hosts": hosts, "http": [http] });
    if !mesh.gateways.is_empty() {
        spec["gateways"] = json!(mesh.gateways);
    }
    json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": VIRTUAL_SERVICE_KIND,
        "metadata": { "name": host },
        "spec": spec,
    })
}

/// One subset per routed revision, plus the current revision so a follow-up
/// shift can reference it before it carries weight.
pub fn destination_rule(
    prefix: &str,
    weights: &[TrafficWeight],
    current_revision: i32,
) -> Value {
    let host = service_name(prefix);
    let mut revisions: Vec<i32> = weights.iter().map(|w| w.revision).collect();
    if !revisions.contains(&current_revision) {
        revisions.push(current_revision);
    }
    revisions.sort_unstable();
    let subsets: Vec<Value> = revisions
        .iter()
        .map(|rev| {
            json!({
                "name": subset_name(*rev),
                "labels": { REVISION_LABEL_KEY: rev.to_string() },
            })
        })
        .collect();
    json!({
        "apiVersion": "networking.istio.io/v1alpha3",
        "kind": DESTINATION_RULE_KIND,
        "metadata": { "name": host },
        "spec": { "host": host, "subsets": subsets },
    })
}

/// SMI splits the stable service across per-revision backend services.
pub fn traffic_split(prefix: &str, weights: &[TrafficWeight]) -> Value {
    let host = service_name(prefix);
    let backends: Vec<Value> = weights
        .iter()
        .map(|w| {
            json!({
                "service": format!("{}-{}", host, w.revision),
                "weight": w.weight,
            })
        })
        .collect();
    json!({
        "apiVersion": "split.smi-spec.io/v1alpha2",
        "kind": TRAFFIC_SPLIT_KIND,
        "metadata": { "name": host },
        "spec": { "service": host, "backends": backends },
    })
}

fn rule_matches(rules: &[TrafficRule]) -> Vec<Value> {
    let mut out = Vec::new();
    for rule in rules {
        for value in rule_values(rule) {
            if let Some(m) = istio_match(rule, &value) {
                out.push(m);
            }
        }
    }
    out
}

fn rule_values(rule: &TrafficRule) -> Vec<String> {
    if rule.values.is_empty() {
        rule.value.clone().into_iter().collect()
    } else {
        rule.values.clone()
    }
}

fn istio_match(rule: &TrafficRule, value: &str) -> Option<Value> {
    let matcher = |mt: MatchType| json!({ mt.istio_key(): value });
    match rule.rule_type {
        RuleType::Uri => Some(json!({ "uri": matcher(rule.match_type?) })),
        RuleType::Method => Some(json!({ "method": matcher(rule.match_type?) })),
        RuleType::Scheme => Some(json!({ "scheme": matcher(rule.match_type?) })),
        RuleType::Authority => Some(json!({ "authority": matcher(rule.match_type?) })),
        RuleType::Header => {
            let name = rule.name.clone()?;
            Some(json!({ "headers": { name: matcher(rule.match_type?) } }))
        }
        RuleType::Port => value.parse::<u32>().ok().map(|p| json!({ "port": p })),
    }
}
