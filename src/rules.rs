//! Rule Engine (spec component 4.1).
//!
//! The source WPR tool dispatches on string-tagged rules at runtime; here
//! the five supported (predicate, action) pairs are a closed tagged union,
//! compiled once into the matchers the rest of the pipeline consults. This
//! generalizes the teacher's single regex-rewrite rule
//! (`app/gateway.rs`'s `RouteRule`) to the five rule shapes the spec
//! defines, keeping the same "compile once, match per request" posture.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;

use crate::error::{Result, WprError};

/// One rule as supplied by the host application, before compilation. The
/// declarative 4-tuple the spec describes (`predicate_tag, predicate_args,
/// action_tag, action_args`) collapses naturally into Serde's internally
/// tagged enum representation, so a rule file is just a JSON array of
/// these.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action")]
pub enum RuleSpec {
    /// `urlMatches(regex*) -> sendStatus(code)`
    SendStatus {
        url_patterns: Vec<String>,
        status: u16,
    },
    /// `urlMatches(regex*) -> removeGroupsFromURL`
    RemoveGroupsFromUrl { url_patterns: Vec<String> },
    /// `urlMatches(regex*) -> removeHeader(name)`
    RemoveHeader {
        url_patterns: Vec<String>,
        header: String,
    },
    /// `isFetchPath(prefix, suffix*) -> replaceCallback`
    ReplaceCallback { prefix: String, suffix: String },
    /// `isFetchPath(paths*) -> ignorePath`
    IgnorePath { paths: Vec<String> },
}

/// The Rule Engine's compiled, immutable state. Requires no locking once
/// built (§5: "the rule engine's compiled state is immutable after compile").
#[derive(Debug, Default)]
pub struct CompiledRules {
    pub error_paths: Vec<(Regex, u16)>,
    pub paths_to_edit: Vec<Regex>,
    pub undesirable_headers: Vec<(Regex, String)>,
    pub callback_paths: Vec<(String, String)>,
    pub ignore_paths: HashSet<String>,
}

/// Outcome of applying the request-time rules to a normalized request.
pub struct RequestRuleResult {
    /// Set when a `sendStatus` rule matched: the Origin Fetcher must not
    /// be consulted (invariant 3).
    pub error_status: Option<u16>,
    pub excluded_headers: HashSet<String>,
    pub normalized_path: String,
}

pub fn compile(rules: &[RuleSpec]) -> Result<CompiledRules> {
    let mut compiled = CompiledRules::default();

    for rule in rules {
        match rule {
            RuleSpec::SendStatus { url_patterns, status } => {
                for p in url_patterns {
                    let re = Regex::new(p)
                        .map_err(|e| WprError::RuleCompile(format!("{p}: {e}")))?;
                    compiled.error_paths.push((re, *status));
                }
            }
            RuleSpec::RemoveGroupsFromUrl { url_patterns } => {
                for p in url_patterns {
                    let re = Regex::new(p)
                        .map_err(|e| WprError::RuleCompile(format!("{p}: {e}")))?;
                    if has_nested_capturing_groups(p) {
                        return Err(WprError::RuleCompile(format!(
                            "removeGroupsFromURL pattern must not contain nested capturing groups: {p}"
                        )));
                    }
                    compiled.paths_to_edit.push(re);
                }
            }
            RuleSpec::RemoveHeader { url_patterns, header } => {
                for p in url_patterns {
                    let re = Regex::new(p)
                        .map_err(|e| WprError::RuleCompile(format!("{p}: {e}")))?;
                    compiled
                        .undesirable_headers
                        .push((re, header.to_ascii_lowercase()));
                }
            }
            RuleSpec::ReplaceCallback { prefix, suffix } => {
                compiled
                    .callback_paths
                    .push((prefix.clone(), suffix.clone()));
            }
            RuleSpec::IgnorePath { paths } => {
                compiled.ignore_paths.extend(paths.iter().cloned());
            }
        }
    }

    Ok(compiled)
}

/// A coarse nested-capturing-group check: counts unescaped `(` that are not
/// part of a non-capturing `(?...)` group, and flags more than one.
fn has_nested_capturing_groups(pattern: &str) -> bool {
    let mut depth = 0;
    let mut capturing_count = 0;
    let mut chars = pattern.chars().peekable();
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '(' => {
                let is_non_capturing = chars.peek() == Some(&'?');
                if !is_non_capturing {
                    if depth > 0 {
                        capturing_count += 1;
                    }
                    depth += 1;
                } else {
                    depth += 1;
                }
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    capturing_count > 0
}

/// Apply request-time rules: short-circuit status, excluded headers and
/// the `host+full_path` normalized-path erasure. `host_and_path` is the
/// concatenation of `host` and `full_path` the predicates match against.
pub fn apply_request_rules(
    compiled: &CompiledRules,
    host_and_path: &str,
) -> RequestRuleResult {
    // sendStatus takes precedence over all other actions (spec 4.1 edge case).
    for (re, status) in &compiled.error_paths {
        if re.is_match(host_and_path) {
            return RequestRuleResult {
                error_status: Some(*status),
                excluded_headers: HashSet::new(),
                normalized_path: host_and_path.to_string(),
            };
        }
    }

    let mut excluded_headers = HashSet::new();
    for (re, header) in &compiled.undesirable_headers {
        if re.is_match(host_and_path) {
            excluded_headers.insert(header.clone());
        }
    }

    let normalized_path = erase_groups(compiled, host_and_path);

    RequestRuleResult {
        error_status: None,
        excluded_headers,
        normalized_path,
    }
}

/// Erase every captured sub-group from `host_and_path`, left-to-right,
/// using the first matching `paths_to_edit` pattern (first match wins).
fn erase_groups(compiled: &CompiledRules, host_and_path: &str) -> String {
    for re in &compiled.paths_to_edit {
        if let Some(caps) = re.captures(host_and_path) {
            let mut out = String::with_capacity(host_and_path.len());
            let mut last_end = 0;
            for i in 1..caps.len() {
                if let Some(m) = caps.get(i) {
                    out.push_str(&host_and_path[last_end..m.start()]);
                    last_end = m.end();
                }
            }
            out.push_str(&host_and_path[last_end..]);
            return out;
        }
    }
    host_and_path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_status_short_circuits() {
        let compiled = compile(&[RuleSpec::SendStatus {
            url_patterns: vec![r"evil\.com/.*".to_string()],
            status: 503,
        }])
        .unwrap();
        let result = apply_request_rules(&compiled, "evil.com/anything");
        assert_eq!(result.error_status, Some(503));
    }

    #[test]
    fn group_erasure_matches_scenario_e() {
        let compiled = compile(&[RuleSpec::RemoveGroupsFromUrl {
            url_patterns: vec![r"(.*\.)?foo\.com/bar.*(qux=1&).*".to_string()],
        }])
        .unwrap();

        let a = apply_request_rules(&compiled, "abc.foo.com/bart?qux=1&z");
        let b = apply_request_rules(&compiled, "xyz.foo.com/bart?qux=1&z");
        assert_eq!(a.normalized_path, b.normalized_path);
        assert_eq!(a.normalized_path, "foo.com/bart?z");
    }

    #[test]
    fn rejects_nested_capturing_groups() {
        let err = compile(&[RuleSpec::RemoveGroupsFromUrl {
            url_patterns: vec![r"(a(b))".to_string()],
        }])
        .unwrap_err();
        assert!(matches!(err, WprError::RuleCompile(_)));
    }

    #[test]
    fn remove_header_only_when_path_matches() {
        let compiled = compile(&[RuleSpec::RemoveHeader {
            url_patterns: vec![r"example\.com/secret".to_string()],
            header: "X-Auth".to_string(),
        }])
        .unwrap();
        let hit = apply_request_rules(&compiled, "example.com/secret");
        assert!(hit.excluded_headers.contains("x-auth"));
        let miss = apply_request_rules(&compiled, "example.com/public");
        assert!(miss.excluded_headers.is_empty());
    }
}
