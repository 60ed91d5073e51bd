//! Request and decision types at the engine boundary.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An identified request presented for admission.
///
/// All attribute sources are optional; a request carrying none of the
/// attributes a policy matches on simply does not match that policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    /// Client address, matched by `ip:` clauses.
    #[serde(default)]
    pub ip: Option<String>,

    /// Request route or path, matched by `route:` clauses.
    #[serde(default)]
    pub route: Option<String>,

    /// Named headers, matched by `header:<name>` clauses. A header present
    /// with no value matches nothing, existence patterns included, since
    /// matching looks at the value.
    #[serde(default)]
    pub headers: Option<IndexMap<String, Option<String>>>,

    /// Free-form attributes, matched by `attr:<name>` clauses.
    #[serde(default)]
    pub attrs: Option<IndexMap<String, serde_json::Value>>,
}

/// The decision one policy contributed for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDecision {
    /// Whether this policy would admit the request.
    pub allowed: bool,

    /// How long the caller must wait before this policy would admit it,
    /// in milliseconds. Present only on a deny.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// The combined outcome of evaluating a request against every matched
/// policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Whether every enforcing policy admitted the request. A request
    /// matching zero policies is allowed unconditionally.
    pub allowed: bool,

    /// Maximum retry time across denying enforcing policies, in
    /// milliseconds. Present only on a deny.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Per-policy decisions in evaluation order (most specific first),
    /// including annotate-only policies that never block the outcome.
    #[serde(default)]
    pub per_policy_decisions: IndexMap<String, CheckDecision>,
}

impl CheckRequest {
    /// Convenience constructor for a request identified by client address.
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }
}

impl CheckResult {
    /// An unconditional allow (no policy matched, or all matched policies
    /// admitted the request).
    pub fn allowed(decisions: IndexMap<String, CheckDecision>) -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
            per_policy_decisions: decisions,
        }
    }

    /// A deny with the combined retry time.
    pub fn denied(
        retry_after_ms: Option<u64>,
        decisions: IndexMap<String, CheckDecision>,
    ) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
            per_policy_decisions: decisions,
        }
    }
}
