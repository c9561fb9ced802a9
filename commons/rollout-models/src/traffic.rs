use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteProvider {
    #[serde(rename = "ISTIO")]
    Istio,
    #[serde(rename = "SMI")]
    Smi,
}

impl RouteProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Istio => "ISTIO",
            Self::Smi => "SMI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    #[serde(rename = "URI")]
    Uri,
    #[serde(rename = "METHOD")]
    Method,
    #[serde(rename = "HEADER")]
    Header,
    #[serde(rename = "SCHEME")]
    Scheme,
    #[serde(rename = "AUTHORITY")]
    Authority,
    #[serde(rename = "PORT")]
    Port,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uri => "URI",
            Self::Method => "METHOD",
            Self::Header => "HEADER",
            Self::Scheme => "SCHEME",
            Self::Authority => "AUTHORITY",
            Self::Port => "PORT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    #[serde(rename = "EXACT")]
    Exact,
    #[serde(rename = "PREFIX")]
    Prefix,
    #[serde(rename = "REGEX")]
    Regex,
}

impl MatchType {
    pub fn istio_key(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::Regex => "regex",
        }
    }
}

/// One traffic match rule. Which fields are mandatory depends on the
/// provider; see `traffic::validate_rules` in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRule {
    pub rule_type: RuleType,
    /// Header name for HEADER rules.
    pub name: Option<String>,
    pub value: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    pub match_type: Option<MatchType>,
}

/// Percentage of request traffic a mesh route sends to one revision's
/// destination subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficWeight {
    pub revision: i32,
    pub weight: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRoutingSpec {
    pub provider: RouteProvider,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub gateways: Vec<String>,
    #[serde(default)]
    pub rules: Vec<TrafficRule>,
}
