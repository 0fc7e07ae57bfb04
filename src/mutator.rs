//! Response Mutator (spec component 4.5).
//!
//! Runs the four rewrite stages in order, always producing a copy when a
//! stage changes anything — the archived `ArchivedResponse` is never
//! mutated in place (spec §9 "deep copying on mutation").

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use regex::Regex;

use crate::archive::{ArchivedRequest, ArchivedResponse};
use crate::config::WprConfig;
use crate::rules::CompiledRules;

pub fn apply_mutations(
    compiled: &CompiledRules,
    req: &ArchivedRequest,
    resp: &ArchivedResponse,
    cfg: &WprConfig,
) -> ArchivedResponse {
    let mut out = resp.clone();

    if let Some(newkey) = matches_callback_path(compiled, req) {
        out = rewrite_callback(&out, &newkey);
    }

    if compiled.ignore_paths.contains(path_only(&req.full_path)) {
        out = rewrite_ignore_path_params(&out, req);
    }

    if cfg.inject_script.is_some() && content_type_starts_with(&out, "text/html") {
        out = inject_script(&out, cfg.inject_script.as_deref().unwrap());
    }

    if cfg.scramble_images && content_type_starts_with(&out, "image/") {
        out = scramble_images(&out);
    }

    out
}

fn path_only(full_path: &str) -> &str {
    full_path.split(['?', '#']).next().unwrap_or(full_path)
}

fn content_type_starts_with(resp: &ArchivedResponse, prefix: &str) -> bool {
    resp.header("content-type")
        .map(|v| v.to_ascii_lowercase().starts_with(prefix))
        .unwrap_or(false)
}

/// If the request's `host+full_path` matches a `callback_paths` entry,
/// return the `newkey` extracted from the substring after the last
/// `callback=_xdc_._` occurrence.
fn matches_callback_path(compiled: &CompiledRules, req: &ArchivedRequest) -> Option<String> {
    let host_and_path = req.host_and_path();
    let matched = compiled.callback_paths.iter().any(|(prefix, suffix)| {
        host_and_path.contains(prefix.as_str()) && host_and_path.contains(suffix.as_str())
    });
    if !matched {
        return None;
    }
    let marker = "callback=_xdc_._";
    let idx = host_and_path.rfind(marker)?;
    let rest = &host_and_path[idx + marker.len()..];
    let newkey: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if newkey.is_empty() {
        None
    } else {
        Some(newkey)
    }
}

fn rewrite_callback(resp: &ArchivedResponse, newkey: &str) -> ArchivedResponse {
    let body = concat_body(resp);
    let text = match std::str::from_utf8(&body) {
        Ok(t) => t,
        Err(_) => return resp.clone(),
    };
    let re = Regex::new(r"_xdc_\._(.{9})").unwrap();
    if let Some(caps) = re.captures(text) {
        let old_token = format!("_xdc_._{}", &caps[1]);
        let new_token = format!("_xdc_._{newkey}");
        let rewritten = text.replace(&old_token, &new_token);
        return with_single_chunk_body(resp, Bytes::from(rewritten.into_bytes()));
    }
    resp.clone()
}

fn rewrite_ignore_path_params(resp: &ArchivedResponse, req: &ArchivedRequest) -> ArchivedResponse {
    let query = req.full_path.split_once('?').map(|(_, q)| q).unwrap_or("");
    let ech = extract_query_param(query, "ech");
    let psi = extract_query_param(query, "psi");

    let body = concat_body(resp);
    let text = match std::str::from_utf8(&body) {
        Ok(t) => t.to_string(),
        Err(_) => return resp.clone(),
    };

    let mut rewritten = text;
    if let Some(ech) = ech {
        let re = Regex::new(r"ech=\d+").unwrap();
        rewritten = re.replacen(&rewritten, 1, format!("ech={ech}").as_str()).into_owned();
    }
    if let Some(psi) = psi {
        let re = Regex::new(r"psi=[A-Za-z0-9_.]+").unwrap();
        rewritten = re.replacen(&rewritten, 1, format!("psi={psi}").as_str()).into_owned();
    }

    with_single_chunk_body(resp, Bytes::from(rewritten.into_bytes()))
}

fn extract_query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name { Some(v) } else { None }
    })
}

/// Inject `script` immediately after the first of `<head>` or `<html>`.
/// Idempotent: a sentinel comment wrapping the injected script prevents a
/// second injection from taking effect (invariant 6).
fn inject_script(resp: &ArchivedResponse, script: &str) -> ArchivedResponse {
    const SENTINEL: &str = "<!-- wpr-injected-script -->";
    let body = concat_body(resp);
    let text = match std::str::from_utf8(&body) {
        Ok(t) => t,
        Err(_) => return resp.clone(),
    };
    if text.contains(SENTINEL) {
        return resp.clone();
    }

    let injected = format!("{SENTINEL}<script>{script}</script>");
    let rewritten = if let Some(idx) = text.to_ascii_lowercase().find("<head>") {
        let insert_at = idx + "<head>".len();
        format!("{}{}{}", &text[..insert_at], injected, &text[insert_at..])
    } else if let Some(idx) = text.to_ascii_lowercase().find("<html>") {
        let insert_at = idx + "<html>".len();
        format!("{}{}{}", &text[..insert_at], injected, &text[insert_at..])
    } else {
        return resp.clone();
    };

    with_single_chunk_body(resp, Bytes::from(rewritten.into_bytes()))
}

/// Pseudo-randomly shuffle the pixel buffer of an `image/*` response,
/// reseeded per-response from a stable hash of its bytes so the shuffle
/// is reproducible across repeated mutator passes on the same input.
fn scramble_images(resp: &ArchivedResponse) -> ArchivedResponse {
    let body = concat_body(resp);
    let format = match image::guess_format(&body) {
        Ok(f) => f,
        Err(_) => return resp.clone(),
    };
    let img = match image::load_from_memory_with_format(&body, format) {
        Ok(img) => img,
        Err(_) => return resp.clone(),
    };

    let mut rgba = img.to_rgba8();
    let seed = stable_seed(&body);
    let mut rng = StdRng::seed_from_u64(seed);
    let pixels = rgba.as_mut();
    let pixel_count = pixels.len() / 4;
    for i in (1..pixel_count).rev() {
        let j = rng.gen_range(0..=i);
        for k in 0..4 {
            pixels.swap(i * 4 + k, j * 4 + k);
        }
    }

    let mut out_bytes: Vec<u8> = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out_bytes);
    if rgba.write_to(&mut cursor, format).is_err() {
        return resp.clone();
    }

    with_single_chunk_body(resp, Bytes::from(out_bytes))
}

fn stable_seed(bytes: &[u8]) -> u64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

fn concat_body(resp: &ArchivedResponse) -> Bytes {
    if resp.response_data.len() == 1 {
        return resp.response_data[0].clone();
    }
    let mut out = Vec::with_capacity(resp.total_body_len());
    for chunk in &resp.response_data {
        out.extend_from_slice(chunk);
    }
    Bytes::from(out)
}

fn with_single_chunk_body(resp: &ArchivedResponse, body: Bytes) -> ArchivedResponse {
    let mut out = resp.clone();
    out.response_data = vec![body];
    if !out.chunked {
        out.delays.data_ms = vec![out.delays.data_ms.first().copied().unwrap_or(0)];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Delays;
    use crate::rules::{compile, RuleSpec};

    fn base_request(full_path: &str) -> ArchivedRequest {
        ArchivedRequest {
            method: "GET".to_string(),
            host: "example.com".to_string(),
            full_path: full_path.to_string(),
            normalized_path: full_path.to_string(),
            body: Bytes::new(),
            headers: vec![],
            is_ssl: false,
        }
    }

    fn base_response(body: &str) -> ArchivedResponse {
        ArchivedResponse {
            version: 11,
            status: 200,
            reason: "OK".to_string(),
            headers: vec![],
            response_data: vec![Bytes::from(body.to_string())],
            delays: Delays::default(),
            chunked: false,
            recorded_at: 0,
        }
    }

    #[test]
    fn callback_rewrite_matches_scenario_b() {
        let compiled = compile(&[RuleSpec::ReplaceCallback {
            prefix: "example.com/fetch".to_string(),
            suffix: "?callback=_xdc_._".to_string(),
        }])
        .unwrap();
        let req = base_request("/fetch?callback=_xdc_._newkey9");
        let resp = base_response("_xdc_._abc123xyz(1,2,3)");
        let cfg = WprConfig::default();

        let out = apply_mutations(&compiled, &req, &resp, &cfg);
        let body = std::str::from_utf8(&out.response_data[0]).unwrap();
        assert_eq!(body, "_xdc_._newkey9(1,2,3)");
    }

    #[test]
    fn script_injection_is_idempotent() {
        let compiled = compile(&[]).unwrap();
        let req = base_request("/page.html");
        let mut resp = base_response("<html><head></head><body></body></html>");
        resp.headers.push(("content-type".to_string(), "text/html".to_string()));
        let mut cfg = WprConfig::default();
        cfg.inject_script = Some("console.log('hi')".to_string());

        let once = apply_mutations(&compiled, &req, &resp, &cfg);
        let twice = apply_mutations(&compiled, &req, &once, &cfg);
        assert_eq!(once.response_data[0], twice.response_data[0]);
    }
}
