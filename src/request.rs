//! Request Normalizer (spec component 4.2).

use bytes::Bytes;

use crate::archive::ArchivedRequest;
use crate::error::{Result, WprError};
use crate::rules::{apply_request_rules, CompiledRules};

/// A parsed-but-not-yet-fingerprinted HTTP request, as handed off by the
/// Connection Server's wire parser.
pub struct RawRequest<'a> {
    pub method: &'a str,
    /// Origin-form request target, e.g. `/a/b?c=d#frag`.
    pub target: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: Bytes,
    pub is_ssl: bool,
}

/// Outcome of normalizing a request: either a short-circuit status (a
/// rule-compiled `sendStatus` match, or a missing-Host error) or a fully
/// built fingerprint ready for archive lookup / origin fetch.
pub enum Normalized {
    ShortCircuit { status: u16 },
    Request(ArchivedRequest),
}

/// Build the canonical `ArchivedRequest` fingerprint for `raw`, consulting
/// the compiled rule set for the short-circuit, header-exclusion and
/// URL-group-erasure behavior.
pub fn normalize(compiled: &CompiledRules, raw: &RawRequest) -> Result<Normalized> {
    let host = raw
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.trim().to_string())
        .ok_or(WprError::MissingHost)?;

    let host_and_path = format!("{host}{}", raw.target);
    let rule_result = apply_request_rules(compiled, &host_and_path);

    if let Some(status) = rule_result.error_status {
        return Ok(Normalized::ShortCircuit { status });
    }

    let mut headers: Vec<(String, String)> = raw
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .filter(|(k, _)| !rule_result.excluded_headers.contains(k))
        .collect();
    headers.sort();

    let normalized_path = rule_result
        .normalized_path
        .strip_prefix(&host)
        .unwrap_or(&rule_result.normalized_path)
        .to_string();

    Ok(Normalized::Request(ArchivedRequest {
        method: raw.method.to_string(),
        host,
        full_path: raw.target.to_string(),
        normalized_path,
        body: raw.body.clone(),
        headers,
        is_ssl: raw.is_ssl,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{compile, RuleSpec};

    #[test]
    fn missing_host_is_an_error() {
        let compiled = compile(&[]).unwrap();
        let raw = RawRequest {
            method: "GET",
            target: "/a",
            headers: vec![],
            body: Bytes::new(),
            is_ssl: false,
        };
        assert!(matches!(
            normalize(&compiled, &raw),
            Err(WprError::MissingHost)
        ));
    }

    #[test]
    fn send_status_rule_short_circuits_before_fingerprint() {
        let compiled = compile(&[RuleSpec::SendStatus {
            url_patterns: vec![r"evil\.com/.*".to_string()],
            status: 503,
        }])
        .unwrap();
        let raw = RawRequest {
            method: "GET",
            target: "/anything",
            headers: vec![("Host", "evil.com")],
            body: Bytes::new(),
            is_ssl: false,
        };
        match normalize(&compiled, &raw).unwrap() {
            Normalized::ShortCircuit { status } => assert_eq!(status, 503),
            Normalized::Request(_) => panic!("expected short-circuit"),
        }
    }

    #[test]
    fn excluded_headers_are_dropped_from_fingerprint() {
        let compiled = compile(&[RuleSpec::RemoveHeader {
            url_patterns: vec![r"example\.com/.*".to_string()],
            header: "X-Auth".to_string(),
        }])
        .unwrap();
        let raw = RawRequest {
            method: "GET",
            target: "/a",
            headers: vec![("Host", "example.com"), ("X-Auth", "secret")],
            body: Bytes::new(),
            is_ssl: false,
        };
        match normalize(&compiled, &raw).unwrap() {
            Normalized::Request(req) => {
                assert!(!req.headers.iter().any(|(k, _)| k == "x-auth"));
            }
            Normalized::ShortCircuit { .. } => panic!("expected a built request"),
        }
    }
}
