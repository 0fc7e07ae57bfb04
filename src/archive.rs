//! Data model (spec §3) and Archive Store (spec component 4.3).

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The fingerprint key used to look up archived responses.
///
/// Equality and hashing are defined over `(method, normalized_path, is_ssl,
/// body, header projection)`; `Hash` and `Eq` are implemented by hand rather
/// than derived because the `headers` field must be compared
/// order-insensitively, `full_path` must not participate at all (only
/// `normalized_path` does), and the raw `host` field is excluded entirely.
/// `removeGroupsFromURL` rules erase captured groups from the combined
/// `host+full_path` string to produce `normalized_path`, which already
/// carries whatever host discriminator survives erasure (spec 8.E: `GET
/// abc.foo.com/bart?qux=1&z` and `GET xyz.foo.com/bart?qux=1&z` both erase
/// to `normalized_path` "foo.com/bart?z"). Keeping the raw, un-erased
/// `host` in the projection would defeat that erasure and split the two
/// requests back into separate archive entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRequest {
    pub method: String,
    pub host: String,
    pub full_path: String,
    pub normalized_path: String,
    pub body: Bytes,
    /// Lower-cased header names, excluded_headers already removed.
    pub headers: Vec<(String, String)>,
    pub is_ssl: bool,
}

impl ArchivedRequest {
    /// The `host+full_path` string the rule engine's predicates match
    /// against.
    pub fn host_and_path(&self) -> String {
        format!("{}{}", self.host, self.full_path)
    }

    /// A canonical, order-independent projection of the header list used
    /// for equality/hash.
    fn header_projection(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        headers.sort();
        headers
    }
}

impl PartialEq for ArchivedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.normalized_path == other.normalized_path
            && self.is_ssl == other.is_ssl
            && self.body == other.body
            && self.header_projection() == other.header_projection()
    }
}
impl Eq for ArchivedRequest {}

impl std::hash::Hash for ArchivedRequest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.method.hash(state);
        self.normalized_path.hash(state);
        self.is_ssl.hash(state);
        self.body.hash(state);
        self.header_projection().hash(state);
    }
}

/// Per-chunk / per-phase replay timings, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delays {
    pub connect_ms: u64,
    pub headers_ms: u64,
    /// One entry per element of `ArchivedResponse::response_data`.
    pub data_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedResponse {
    /// `major*10+minor`, e.g. `11` for HTTP/1.1.
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// One element for non-chunked responses, N elements for chunked.
    pub response_data: Vec<Bytes>,
    pub delays: Delays,
    /// Whether `transfer-encoding: chunked` was present at capture time.
    pub chunked: bool,
    /// Unix timestamp (seconds) the archive entry was recorded/loaded at,
    /// used by the Response Writer to shift `last-modified`/`expires`.
    pub recorded_at: i64,
}

impl ArchivedResponse {
    pub fn total_body_len(&self) -> usize {
        self.response_data.iter().map(|c| c.len()).sum()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Archive Store operations (spec 4.3).
pub trait ArchiveBackend: Send + Sync {
    fn contains(&self, req: &ArchivedRequest) -> bool;
    fn get(&self, req: &ArchivedRequest) -> Option<ArchivedResponse>;
    fn put(&self, req: ArchivedRequest, resp: ArchivedResponse);
    /// Nearest match by `(host, normalized_path)`, ignoring body and
    /// headers. Deterministic tie-break: lexicographically least
    /// `(method, host, normalized_path)` (open question (b), resolved).
    fn closest(&self, req: &ArchivedRequest) -> Option<ArchivedRequest>;
    /// Human-readable unified-style diff between `req` and its nearest
    /// archived peer, or `None` if there is no peer to diff against.
    fn diff(&self, req: &ArchivedRequest) -> Option<String>;
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ArchivedRequest, ArchivedResponse>,
}

/// In-memory archive, guarded by a single `RwLock` per §5 ("use a
/// read/write lock or equivalent").
#[derive(Default)]
pub struct InMemoryArchive {
    inner: RwLock<Inner>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let entries: Vec<(ArchivedRequest, ArchivedResponse)> = serde_json::from_str(&text)?;
        Ok(InMemoryArchive {
            inner: RwLock::new(Inner {
                entries: entries.into_iter().collect(),
            }),
        })
    }

    pub fn save_to_path(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let guard = self.inner.read().unwrap();
        let entries: Vec<(&ArchivedRequest, &ArchivedResponse)> = guard.entries.iter().collect();
        let text = serde_json::to_string_pretty(&entries)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArchiveBackend for InMemoryArchive {
    fn contains(&self, req: &ArchivedRequest) -> bool {
        self.inner.read().unwrap().entries.contains_key(req)
    }

    fn get(&self, req: &ArchivedRequest) -> Option<ArchivedResponse> {
        self.inner.read().unwrap().entries.get(req).cloned()
    }

    fn put(&self, req: ArchivedRequest, resp: ArchivedResponse) {
        self.inner.write().unwrap().entries.insert(req, resp);
    }

    fn closest(&self, req: &ArchivedRequest) -> Option<ArchivedRequest> {
        let guard = self.inner.read().unwrap();
        let mut best: Option<&ArchivedRequest> = None;
        for candidate in guard.entries.keys() {
            if candidate.host == req.host && candidate.normalized_path == req.normalized_path {
                best = match best {
                    None => Some(candidate),
                    Some(current) => {
                        let key_candidate = (&candidate.method, &candidate.host, &candidate.normalized_path);
                        let key_current = (&current.method, &current.host, &current.normalized_path);
                        if key_candidate < key_current {
                            Some(candidate)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
        }
        best.cloned()
    }

    fn diff(&self, req: &ArchivedRequest) -> Option<String> {
        let peer = self.closest(req)?;
        let mut out = String::new();
        out.push_str(&format!("--- miss {} {}\n", req.method, req.host_and_path()));
        out.push_str(&format!("+++ archived {} {}\n", peer.method, peer.host_and_path()));
        if req.full_path != peer.full_path {
            out.push_str(&format!("-{}\n+{}\n", req.full_path, peer.full_path));
        }
        if req.body != peer.body {
            out.push_str(&format!(
                "-body({} bytes)\n+body({} bytes)\n",
                req.body.len(),
                peer.body.len()
            ));
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str, host: &str, path: &str) -> ArchivedRequest {
        ArchivedRequest {
            method: method.to_string(),
            host: host.to_string(),
            full_path: path.to_string(),
            normalized_path: path.to_string(),
            body: Bytes::new(),
            headers: vec![],
            is_ssl: false,
        }
    }

    fn resp(body: &str) -> ArchivedResponse {
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
    fn put_then_get_round_trips() {
        let archive = InMemoryArchive::new();
        let r = req("GET", "example.com", "/a");
        archive.put(r.clone(), resp("hello"));
        assert!(archive.contains(&r));
        let got = archive.get(&r).unwrap();
        assert_eq!(got.response_data[0], Bytes::from_static(b"hello"));
    }

    #[test]
    fn closest_match_ignores_query_difference_when_normalized() {
        let archive = InMemoryArchive::new();
        let mut stored = req("GET", "example.com", "/a?v=1");
        stored.normalized_path = "/a".to_string();
        archive.put(stored.clone(), resp("v1-body"));

        let mut miss = req("GET", "example.com", "/a?v=2");
        miss.normalized_path = "/a".to_string();

        let nearest = archive.closest(&miss).expect("should find nearest");
        assert_eq!(nearest.full_path, "/a?v=1");
    }
}
