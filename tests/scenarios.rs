//! End-to-end scenario tests (spec 8's lettered scenarios), driven
//! against the in-memory archive backend with no real sockets, per the
//! ambient test-tooling plan: most scenarios only need the pipeline
//! pieces wired together, and the one timing-sensitive scenario uses a
//! paused Tokio clock instead of racing the wall clock.

use std::sync::Arc;

use bytes::Bytes;
use webpagereplay::archive::{ArchivedRequest, ArchivedResponse, ArchiveBackend, Delays, InMemoryArchive};
use webpagereplay::config::WprConfig;
use webpagereplay::fetch::{Fetch, ReplayFetch};
use webpagereplay::request::{normalize, Normalized, RawRequest};
use webpagereplay::rules::{compile, RuleSpec};
use webpagereplay::tls::{CertCache, RootCa};

fn req(host: &str, path: &str) -> ArchivedRequest {
    ArchivedRequest {
        method: "GET".to_string(),
        host: host.to_string(),
        full_path: path.to_string(),
        normalized_path: path.to_string(),
        body: Bytes::new(),
        headers: vec![],
        is_ssl: false,
    }
}

/// Scenario A: chunked round-trip with per-chunk delays. Verifies both
/// the exact wire framing and that the second chunk is not written
/// before its recorded delay has elapsed, using a paused clock so the
/// assertion is deterministic.
#[tokio::test(start_paused = true)]
async fn scenario_a_chunked_round_trip_respects_delays() {
    let resp = ArchivedResponse {
        version: 11,
        status: 200,
        reason: "OK".to_string(),
        headers: vec![],
        response_data: vec![Bytes::from_static(b"AB"), Bytes::from_static(b"CDEF")],
        delays: Delays { connect_ms: 0, headers_ms: 0, data_ms: vec![0, 50] },
        chunked: true,
        recorded_at: 0,
    };
    let cfg = WprConfig { use_delays: true, ..Default::default() };

    let start = tokio::time::Instant::now();
    let mut out: Vec<u8> = Vec::new();
    webpagereplay::writer::write_response(&mut out, &resp, &cfg).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= std::time::Duration::from_millis(50), "second chunk must not precede its recorded delay");

    let text = String::from_utf8(out).unwrap();
    assert!(text.ends_with("2\r\nAB\r\n4\r\nCDEF\r\n0\r\n\r\n"));
}

/// Scenario C: closest-match fallback toggles between a substituted hit
/// and a clean miss.
#[tokio::test]
async fn scenario_c_closest_match_toggle() {
    let archive = Arc::new(InMemoryArchive::new());
    let stored = ArchivedRequest { normalized_path: "/a".to_string(), full_path: "/a?v=1".to_string(), ..req("example.com", "/a?v=1") };
    archive.put(
        stored,
        ArchivedResponse {
            version: 11,
            status: 200,
            reason: "OK".to_string(),
            headers: vec![],
            response_data: vec![Bytes::from_static(b"v1-body")],
            delays: Delays::default(),
            chunked: false,
            recorded_at: 0,
        },
    );

    let miss = ArchivedRequest { normalized_path: "/a".to_string(), full_path: "/a?v=2".to_string(), ..req("example.com", "/a?v=2") };

    let strict = ReplayFetch { archive: archive.clone(), use_closest_match: false, use_diff_on_unknown_requests: false };
    assert!(strict.fetch(&miss).await.is_none());

    let lenient = ReplayFetch { archive, use_closest_match: true, use_diff_on_unknown_requests: false };
    let hit = lenient.fetch(&miss).await.expect("closest match should substitute");
    assert_eq!(hit.response_data[0], Bytes::from_static(b"v1-body"));
}

/// Scenario D: a `sendStatus` rule short-circuits before any archive or
/// origin consultation happens — `normalize` never builds a fingerprint.
#[test]
fn scenario_d_rule_short_circuit_skips_fingerprinting() {
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
        Normalized::Request(_) => panic!("expected a short-circuit, origin should never be consulted"),
    }
}

/// Scenario E: two hostnames that only differ in the erased subdomain
/// group land on the same archive fingerprint — recording under one
/// subdomain must be retrievable by a replay request against the other.
#[test]
fn scenario_e_group_erasure_unifies_fingerprints() {
    let compiled = compile(&[RuleSpec::RemoveGroupsFromUrl {
        url_patterns: vec![r"(.*\.)?foo\.com/bar.*(qux=1&).*".to_string()],
    }])
    .unwrap();

    let a = RawRequest {
        method: "GET",
        target: "/bart?qux=1&z",
        headers: vec![("Host", "abc.foo.com")],
        body: Bytes::new(),
        is_ssl: false,
    };
    let b = RawRequest {
        method: "GET",
        target: "/bart?qux=1&z",
        headers: vec![("Host", "xyz.foo.com")],
        body: Bytes::new(),
        is_ssl: false,
    };

    let (Normalized::Request(fp_a), Normalized::Request(fp_b)) =
        (normalize(&compiled, &a).unwrap(), normalize(&compiled, &b).unwrap())
    else {
        panic!("expected both to normalize to fingerprints");
    };
    assert_eq!(fp_a, fp_b, "fingerprints must be fully equal, not just same normalized_path");

    let archive = InMemoryArchive::new();
    archive.put(
        fp_a,
        ArchivedResponse {
            version: 11,
            status: 200,
            reason: "OK".to_string(),
            headers: vec![],
            response_data: vec![Bytes::from_static(b"recorded-under-abc")],
            delays: Delays::default(),
            chunked: false,
            recorded_at: 0,
        },
    );
    let replayed = archive.get(&fp_b).expect("recording under abc.foo.com must replay under xyz.foo.com");
    assert_eq!(replayed.response_data[0], Bytes::from_static(b"recorded-under-abc"));
}

/// Scenario F: concurrent handshakes to the same hostname mint at most
/// one leaf certificate (CertCache's double-checked insertion).
#[test]
fn scenario_f_concurrent_handshakes_mint_one_cert() {
    let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
    let key = openssl::pkey::PKey::from_rsa(rsa).unwrap();
    let mut name_builder = openssl::x509::X509Name::builder().unwrap();
    name_builder.append_entry_by_text("CN", "Test Root CA").unwrap();
    let name = name_builder.build();
    let mut builder = openssl::x509::X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    let mut serial = openssl::bn::BigNum::new().unwrap();
    serial.rand(63, openssl::bn::MsbOption::MAYBE_ZERO, false).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(3650).unwrap()).unwrap();
    builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
    let root = Arc::new(RootCa { cert: builder.build(), key });

    let cache = Arc::new(CertCache::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let root = root.clone();
            std::thread::spawn(move || cache.get_or_mint("a.example", &root.cert, &root.key).unwrap())
        })
        .collect();

    let serials: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().cert.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string())
        .collect();
    assert_eq!(cache.len(), 1);
    assert!(serials.windows(2).all(|w| w[0] == w[1]));
}
