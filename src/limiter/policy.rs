//! Policy compilation and matching.
//!
//! Match expressions are compiled at load time into a small
//! tagged-variant matcher evaluated without reflection; malformed
//! expressions are rejected at load, never at request time.
//!
//! An expression is a whitespace-separated conjunction of clauses:
//!
//! - `ip:<pattern>` — match the client address
//! - `route:<pattern>` — match the request route
//! - `header:<name>=<pattern>` — match a named header
//! - `attr:<name>=<pattern>` — match a free-form attribute
//!
//! Patterns: `*` or empty (any value), `?` (value exists), a string
//! with a trailing `*` (prefix), anything else (exact).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::{PolicyAction, PolicySpec};
use crate::error::{FluxgateError, Result};

use super::gcra::RateParams;
use super::request::CheckRequest;

/// A policy compiled for the request path: its spec, the derived GCRA
/// constants, its matcher, and a precomputed specificity rank.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// The policy as configured.
    pub spec: PolicySpec,
    /// GCRA constants derived from rate and burst.
    pub params: RateParams,
    /// Compiled match expression.
    pub matcher: PolicyMatcher,
    /// (exact clause count, total clause count); higher ranks first.
    specificity: (usize, usize),
}

/// An immutable, versioned collection of compiled policies.
///
/// Replaced wholesale on reload; readers always observe one fully-formed
/// version.
#[derive(Debug)]
pub struct PolicySet {
    version: u64,
    policies: Vec<CompiledPolicy>,
}

/// One attribute clause of a match expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MatchClause {
    source: MatchSource,
    pattern: MatchPattern,
    /// Capture name: the attribute path this clause binds, used as the
    /// identity component fed into key derivation.
    name: String,
}

/// Which request attribute a clause reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum MatchSource {
    Ip,
    Route,
    Header,
    Attr,
}

/// Compiled pattern variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum MatchPattern {
    /// Matches any present value (wildcard).
    Any,
    /// Matches when the attribute is present, whatever its value.
    Exists,
    /// Matches values starting with the prefix.
    Prefix(String),
    /// Matches the value exactly.
    Equals(String),
}

/// A compiled match expression: the conjunction of its clauses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMatcher {
    clauses: Vec<MatchClause>,
}

impl PolicySet {
    /// Compile a policy list into an immutable set with the given version.
    ///
    /// Specs must already have passed numeric validation; this step
    /// rejects malformed match expressions.
    pub fn compile(specs: &[PolicySpec], version: u64) -> Result<Self> {
        let policies = specs
            .iter()
            .map(|spec| {
                let matcher = PolicyMatcher::parse(&spec.match_rule).map_err(|err| {
                    FluxgateError::Config(format!(
                        "policy {}: bad match expression: {err}",
                        spec.id
                    ))
                })?;
                let specificity = matcher.specificity();
                Ok(CompiledPolicy {
                    params: RateParams::new(spec.rate_per_second, spec.burst),
                    matcher,
                    specificity,
                    spec: spec.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { version, policies })
    }

    /// Version marker of this set, advanced on every reload.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Policies whose expression the request satisfies, most specific
    /// first (exact clauses outrank wildcards; ties keep declaration
    /// order), paired with the identity values each matcher captured.
    pub fn matching<'a>(
        &'a self,
        request: &CheckRequest,
    ) -> Vec<(&'a CompiledPolicy, IndexMap<String, String>)> {
        let mut matched: Vec<_> = self
            .policies
            .iter()
            .filter_map(|policy| {
                policy
                    .matcher
                    .captures(request)
                    .map(|captured| (policy, captured))
            })
            .collect();
        // Stable sort preserves declaration order within a rank.
        matched.sort_by(|(a, _), (b, _)| b.specificity.cmp(&a.specificity));
        matched
    }

    /// Ids of all policies in this set, for the rotation sweep's orphan
    /// reclamation.
    pub fn ids(&self) -> std::collections::HashSet<&str> {
        self.policies.iter().map(|p| p.spec.id.as_str()).collect()
    }
}

impl CompiledPolicy {
    /// Whether this policy blocks the overall outcome when it denies.
    pub fn enforces(&self) -> bool {
        self.spec.action == PolicyAction::Reject
    }
}

impl PolicyMatcher {
    /// Parse a match expression.
    pub fn parse(rule: &str) -> std::result::Result<Self, String> {
        let mut clauses = Vec::new();
        for token in rule.split_whitespace() {
            let clause = if let Some(rest) = token.strip_prefix("ip:") {
                MatchClause {
                    source: MatchSource::Ip,
                    pattern: MatchPattern::parse(rest)?,
                    name: "ip".to_string(),
                }
            } else if let Some(rest) = token.strip_prefix("route:") {
                MatchClause {
                    source: MatchSource::Route,
                    pattern: MatchPattern::parse(rest)?,
                    name: "route".to_string(),
                }
            } else if let Some(rest) = token.strip_prefix("header:") {
                let (name, pattern) = parse_named_clause(rest, "header")?;
                MatchClause {
                    source: MatchSource::Header,
                    pattern,
                    name,
                }
            } else if let Some(rest) = token.strip_prefix("attr:") {
                let (name, pattern) = parse_named_clause(rest, "attr")?;
                MatchClause {
                    source: MatchSource::Attr,
                    pattern,
                    name,
                }
            } else {
                return Err(format!("unsupported clause: {token}"));
            };
            clauses.push(clause);
        }

        if clauses.is_empty() {
            return Err("expression must contain at least one clause".to_string());
        }

        Ok(Self { clauses })
    }

    /// Evaluate the expression against a request. Returns the captured
    /// identity values when every clause matches, `None` otherwise.
    pub fn captures(&self, request: &CheckRequest) -> Option<IndexMap<String, String>> {
        let mut captured = IndexMap::new();
        for clause in &self.clauses {
            let value = match clause.source {
                MatchSource::Ip => request.ip.clone(),
                MatchSource::Route => request.route.clone(),
                MatchSource::Header => request
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(&clause.name))
                    .cloned()
                    .flatten(),
                MatchSource::Attr => request
                    .attrs
                    .as_ref()
                    .and_then(|attrs| attrs.get(&clause.name))
                    .map(attr_to_string),
            };
            let value = clause.pattern.filter(value)?;
            captured.insert(clause.name.clone(), value);
        }
        Some(captured)
    }

    /// (exact clause count, total clause count) — the rank used to order
    /// matched policies most-specific first.
    fn specificity(&self) -> (usize, usize) {
        let exact = self
            .clauses
            .iter()
            .filter(|c| matches!(c.pattern, MatchPattern::Equals(_)))
            .count();
        (exact, self.clauses.len())
    }
}

impl MatchPattern {
    fn parse(input: &str) -> std::result::Result<Self, String> {
        if input.is_empty() || input == "*" {
            return Ok(MatchPattern::Any);
        }
        if input == "?" {
            return Ok(MatchPattern::Exists);
        }
        if let Some(prefix) = input.strip_suffix('*') {
            return Ok(MatchPattern::Prefix(prefix.to_string()));
        }
        Ok(MatchPattern::Equals(input.to_string()))
    }

    /// Keep the value when it satisfies the pattern.
    fn filter(&self, value: Option<String>) -> Option<String> {
        match self {
            MatchPattern::Any | MatchPattern::Exists => value,
            MatchPattern::Equals(expected) => value.filter(|v| v == expected),
            MatchPattern::Prefix(prefix) => value.filter(|v| v.starts_with(prefix)),
        }
    }
}

fn parse_named_clause(
    input: &str,
    kind: &str,
) -> std::result::Result<(String, MatchPattern), String> {
    let mut parts = input.splitn(2, '=');
    let name = parts
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("{kind} clause missing a name"))?;
    let pattern = MatchPattern::parse(parts.next().unwrap_or("*").trim())?;
    Ok((name.to_string(), pattern))
}

fn attr_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyAction;

    fn spec(id: &str, rule: &str) -> PolicySpec {
        PolicySpec {
            id: id.to_string(),
            match_rule: rule.to_string(),
            rate_per_second: 10,
            burst: 5,
            window_seconds: 60,
            action: PolicyAction::Reject,
        }
    }

    fn request(ip: &str, route: &str) -> CheckRequest {
        CheckRequest {
            ip: Some(ip.to_string()),
            route: Some(route.to_string()),
            ..CheckRequest::default()
        }
    }

    #[test]
    fn test_wildcard_ip_captures_value() {
        let matcher = PolicyMatcher::parse("ip:*").unwrap();
        let captured = matcher.captures(&request("10.0.0.1", "/")).unwrap();
        assert_eq!(captured.get("ip").unwrap(), "10.0.0.1");
    }

    #[test]
    fn test_missing_attribute_does_not_match() {
        let matcher = PolicyMatcher::parse("ip:*").unwrap();
        assert!(matcher.captures(&CheckRequest::default()).is_none());
    }

    #[test]
    fn test_prefix_route_match() {
        let matcher = PolicyMatcher::parse("route:/api/*").unwrap();
        assert!(matcher.captures(&request("1.1.1.1", "/api/users")).is_some());
        assert!(matcher.captures(&request("1.1.1.1", "/static/a")).is_none());
    }

    #[test]
    fn test_conjunction_of_clauses() {
        let matcher = PolicyMatcher::parse("ip:* route:/login").unwrap();
        assert!(matcher.captures(&request("1.1.1.1", "/login")).is_some());
        assert!(matcher.captures(&request("1.1.1.1", "/logout")).is_none());
    }

    #[test]
    fn test_header_exists_pattern() {
        let matcher = PolicyMatcher::parse("header:x-api-key=?").unwrap();
        let mut headers = IndexMap::new();
        headers.insert("x-api-key".to_string(), Some("abc".to_string()));
        let req = CheckRequest {
            headers: Some(headers),
            ..CheckRequest::default()
        };
        let captured = matcher.captures(&req).unwrap();
        assert_eq!(captured.get("x-api-key").unwrap(), "abc");
        assert!(matcher.captures(&CheckRequest::default()).is_none());
    }

    #[test]
    fn test_header_without_value_matches_nothing() {
        // Matching (and key derivation) needs a value to capture, so a
        // header carried with `null` fails even the existence pattern.
        let matcher = PolicyMatcher::parse("header:x-api-key=?").unwrap();
        let mut headers = IndexMap::new();
        headers.insert("x-api-key".to_string(), None);
        let req = CheckRequest {
            headers: Some(headers),
            ..CheckRequest::default()
        };
        assert!(matcher.captures(&req).is_none());
    }

    #[test]
    fn test_attr_exact_match() {
        let matcher = PolicyMatcher::parse("attr:tenant=acme").unwrap();
        let mut attrs = IndexMap::new();
        attrs.insert("tenant".to_string(), serde_json::json!("acme"));
        let req = CheckRequest {
            attrs: Some(attrs),
            ..CheckRequest::default()
        };
        assert!(matcher.captures(&req).is_some());
    }

    #[test]
    fn test_malformed_expression_rejected() {
        assert!(PolicyMatcher::parse("").is_err());
        assert!(PolicyMatcher::parse("bogus:*").is_err());
        assert!(PolicyMatcher::parse("header:=x").is_err());
    }

    #[test]
    fn test_compile_rejects_bad_expression() {
        let set = PolicySet::compile(&[spec("p", "nope")], 1);
        assert!(set.is_err());
    }

    #[test]
    fn test_matching_orders_exact_before_wildcard() {
        let set = PolicySet::compile(
            &[
                spec("wide", "ip:*"),
                spec("narrow", "ip:* route:/login"),
                spec("exact", "route:/login"),
            ],
            1,
        )
        .unwrap();

        let matched = set.matching(&request("10.0.0.1", "/login"));
        let ids: Vec<&str> = matched.iter().map(|(p, _)| p.spec.id.as_str()).collect();
        // "narrow" and "exact" both carry one exact clause; "narrow" has
        // more clauses so it ranks first. "wide" is pure wildcard.
        assert_eq!(ids, vec!["narrow", "exact", "wide"]);
    }

    #[test]
    fn test_matching_ties_keep_declaration_order() {
        let set = PolicySet::compile(&[spec("first", "ip:*"), spec("second", "ip:*")], 1).unwrap();
        let matched = set.matching(&request("10.0.0.1", "/"));
        let ids: Vec<&str> = matched.iter().map(|(p, _)| p.spec.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_no_match_returns_empty() {
        let set = PolicySet::compile(&[spec("p", "route:/admin")], 1).unwrap();
        assert!(set.matching(&request("1.1.1.1", "/public")).is_empty());
    }
}
