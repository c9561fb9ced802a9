//! Naming and labeling conventions shared by every component. A versioned
//! controller is named `{prefix}-{revision}` and carries the revision as a
//! label; everything else (services, snapshot key, registry secret) derives
//! from the prefix or the stable release id.

pub const MANAGED_LABEL_KEY: &str = "rollouts.io/managed";
pub const RELEASE_LABEL_KEY: &str = "rollouts.io/release";
pub const REVISION_LABEL_KEY: &str = "rollouts.io/revision";

pub const APP_ANNOTATION_KEY: &str = "rollouts.io/app";
pub const SERVICE_ANNOTATION_KEY: &str = "rollouts.io/service";
pub const ENV_ANNOTATION_KEY: &str = "rollouts.io/env";

pub const SERVICE_NAME_PLACEHOLDER: &str = "${SERVICE_NAME}";
pub const SERVICE_PORT_PLACEHOLDER: &str = "${SERVICE_PORT}";
pub const PRIMARY_SERVICE_NAME_PLACEHOLDER: &str = "${PRIMARY_SERVICE_NAME}";
pub const PRIMARY_SERVICE_PORT_PLACEHOLDER: &str = "${PRIMARY_SERVICE_PORT}";
pub const STAGE_SERVICE_NAME_PLACEHOLDER: &str = "${STAGE_SERVICE_NAME}";
pub const STAGE_SERVICE_PORT_PLACEHOLDER: &str = "${STAGE_SERVICE_PORT}";
pub const CONFIG_MAP_NAME_PLACEHOLDER: &str = "${CONFIG_MAP_NAME}";
pub const SECRET_MAP_NAME_PLACEHOLDER: &str = "${SECRET_MAP_NAME}";

pub fn controller_name(prefix: &str, revision: i32) -> String {
    format!("{}-{}", prefix, revision)
}

/// Trailing `-<n>` suffix of a versioned controller name, if present.
pub fn revision_from_controller_name(name: &str) -> Option<i32> {
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

pub fn prefix_from_controller_name(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((prefix, suffix)) if suffix.parse::<i32>().is_ok() => prefix,
        _ => name,
    }
}

pub fn service_name(prefix: &str) -> String {
    prefix.to_string()
}

pub fn primary_service_name(prefix: &str) -> String {
    format!("{}-primary", prefix)
}

pub fn stage_service_name(prefix: &str) -> String {
    format!("{}-stage", prefix)
}

pub fn ingress_name(prefix: &str) -> String {
    format!("{}-ingress", prefix)
}

/// Durable snapshot record key. Derived from the stable release id so every
/// run of the same deployment target overwrites the same record.
pub fn snapshot_key(release_id: &str) -> String {
    format!("{}-rollout-state", sanitize_name(release_id))
}

pub fn registry_secret_name(registry_url: &str) -> String {
    format!("registry-{}", sanitize_name(registry_url))
}

/// Lowercases and squashes characters outside [a-z0-9-] so the result is a
/// usable DNS-1123 name fragment.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Valid Kubernetes label value: alphanumeric plus `-_.`, max 63 chars.
pub fn label_value(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect()
}
