//! Origin Fetcher (spec component 4.4) and the record/replay `Fetch`
//! abstraction (spec §9 "global fetch-mode switching").
//!
//! The teacher repo never needs a generic outbound HTTP client (it either
//! forwards raw bytes via `pingora::upstreams::peer::HttpPeer`, or
//! terminates HTTP itself for its own gateway endpoints); replay needs byte-
//! exact control over chunk boundaries and per-chunk arrival timing that
//! those abstractions don't expose, so this is hand-rolled on `httparse`
//! over a plain `tokio::net::TcpStream` / `tokio-openssl` stream, in the
//! same "parse bytes by hand" idiom the teacher uses for SNI/Host sniffing
//! in `app/proxy_sni.rs` and `app/proxy_host.rs`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::archive::{ArchivedRequest, ArchivedResponse, Delays};
use crate::error::{Result, WprError};

/// Injected DNS lookup callback (spec §6). The default implementation
/// delegates to `dns_lookup::lookup_host`, already a teacher dependency.
pub type DnsLookup = Arc<dyn Fn(&str) -> Option<IpAddr> + Send + Sync>;

pub fn default_dns_lookup() -> DnsLookup {
    Arc::new(|host: &str| {
        dns_lookup::lookup_host(host)
            .ok()
            .and_then(|ips| ips.into_iter().next())
    })
}

const MAX_RETRIES: u32 = 3;

/// Perform a real upstream HTTP request for `req`, returning `None` once
/// the retry budget (spec: <= 3 total retries) is exhausted.
pub async fn fetch_from_origin(req: &ArchivedRequest, dns: &DnsLookup) -> Option<ArchivedResponse> {
    for _attempt in 0..=MAX_RETRIES {
        match try_fetch_once(req, dns).await {
            Ok(resp) => return Some(resp),
            Err(e) => {
                log::warn!("origin fetch attempt failed for {}: {e}", req.host_and_path());
            }
        }
    }
    None
}

async fn try_fetch_once(req: &ArchivedRequest, dns: &DnsLookup) -> Result<ArchivedResponse> {
    let (host, port) = split_host_port(&req.host, req.is_ssl);
    let ip = dns(&host).ok_or_else(|| WprError::OriginFetch(format!("dns lookup failed for {host}")))?;

    let t_start = Instant::now();
    let mut stream = TcpStream::connect((ip, port))
        .await
        .map_err(|e| WprError::OriginFetch(format!("connect failed: {e}")))?;
    let connect_delay_ms = t_start.elapsed().as_millis() as u64;

    let request_bytes = build_request_bytes(req);
    stream
        .write_all(&request_bytes)
        .await
        .map_err(|e| WprError::OriginFetch(format!("write failed: {e}")))?;
    let t_sent = Instant::now();

    let mut reader = BufferedReader::new(stream);
    let (status, reason, version, headers) = read_status_and_headers(&mut reader).await?;
    let headers_delay_ms = t_sent.elapsed().as_millis() as u64;

    let chunked = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));
    let content_length: Option<usize> = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok());

    let (response_data, data_ms) = if chunked {
        read_chunked_body(&mut reader).await?
    } else {
        let body = read_fixed_body(&mut reader, content_length).await?;
        (vec![body], vec![0])
    };

    Ok(ArchivedResponse {
        version,
        status,
        reason,
        headers,
        response_data,
        delays: Delays {
            connect_ms: connect_delay_ms,
            headers_ms: headers_delay_ms,
            data_ms,
        },
        chunked,
        recorded_at: unix_now(),
    })
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn split_host_port(host: &str, is_ssl: bool) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(if is_ssl { 443 } else { 80 })),
        None => (host.to_string(), if is_ssl { 443 } else { 80 }),
    }
}

fn build_request_bytes(req: &ArchivedRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + req.body.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, req.full_path).as_bytes());
    for (k, v) in &req.headers {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    if !req.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")) && !req.body.is_empty() {
        out.extend_from_slice(format!("content-length: {}\r\n", req.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

/// A small buffered reader over an async stream, used because `httparse`
/// needs the whole header block in one contiguous slice before it can
/// parse it, and chunk reads need precise byte counts afterward.
struct BufferedReader<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: tokio::io::AsyncRead + Unpin> BufferedReader<S> {
    fn new(stream: S) -> Self {
        Self { stream, buf: BytesMut::with_capacity(8192) }
    }

    async fn fill_more(&mut self) -> Result<usize> {
        let mut tmp = [0u8; 4096];
        let n = self
            .stream
            .read(&mut tmp)
            .await
            .map_err(|e| WprError::OriginFetch(format!("read failed: {e}")))?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// Read exactly `n` bytes, consuming any data already buffered first.
    async fn read_exact_bytes(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.fill_more().await? == 0 {
                return Err(WprError::OriginFetch("premature EOF".to_string()));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read a single CRLF-terminated line, consuming it (and the CRLF)
    /// from the buffer.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance_past_crlf();
                return String::from_utf8(line.to_vec())
                    .map_err(|_| WprError::OriginFetch("non-utf8 line".to_string()));
            }
            if self.fill_more().await? == 0 {
                return Err(WprError::OriginFetch("premature EOF reading line".to_string()));
            }
        }
    }

    async fn read_to_eof(&mut self) -> Result<Bytes> {
        loop {
            if self.fill_more().await? == 0 {
                break;
            }
        }
        Ok(std::mem::replace(&mut self.buf, BytesMut::new()).freeze())
    }
}

trait AdvancePastCrlf {
    fn advance_past_crlf(&mut self);
}
impl AdvancePastCrlf for BytesMut {
    fn advance_past_crlf(&mut self) {
        if self.first() == Some(&b'\r') {
            let _ = self.split_to(1);
        }
        if self.first() == Some(&b'\n') {
            let _ = self.split_to(1);
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").or_else(|| {
        buf.iter().position(|&b| b == b'\n')
    })
}

async fn read_status_and_headers<S: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufferedReader<S>,
) -> Result<(u16, String, u8, Vec<(String, String)>)> {
    // Accumulate raw lines preserving duplicates and joining continuations,
    // per spec 4.4 ("Headers are captured preserving duplicates... using
    // the raw header line list rather than a collapsing map").
    let status_line = reader.read_line().await?;
    let mut parts = status_line.splitn(3, ' ');
    let http_version = parts.next().unwrap_or("HTTP/1.1");
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WprError::OriginFetch(format!("bad status line: {status_line}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    let version = if http_version.contains("1.0") { 10 } else { 11 };

    let mut raw_lines: Vec<String> = Vec::new();
    loop {
        let line = reader.read_line().await?;
        if line.is_empty() {
            break;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !raw_lines.is_empty() {
            let last = raw_lines.last_mut().unwrap();
            last.push_str("\n ");
            last.push_str(line.trim());
        } else {
            raw_lines.push(line);
        }
    }

    let mut headers = Vec::with_capacity(raw_lines.len());
    for line in raw_lines {
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => log::warn!("dropping malformed response header line: {line:?}"),
        }
    }

    Ok((status, reason, version, headers))
}

async fn read_fixed_body<S: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufferedReader<S>,
    content_length: Option<usize>,
) -> Result<Bytes> {
    match content_length {
        Some(len) => reader.read_exact_bytes(len).await,
        None => reader.read_to_eof().await,
    }
}

async fn read_chunked_body<S: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufferedReader<S>,
) -> Result<(Vec<Bytes>, Vec<u64>)> {
    let mut chunks = Vec::new();
    let mut delays = Vec::new();
    let mut t_prev_end = Instant::now();

    loop {
        let size_line = reader.read_line().await?;
        // Strip chunk-extensions (`;...`) using the semicolon index
        // (open question (a): the source's `chunk_extention_pos` typo is
        // not replicated here).
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| WprError::OriginFetch(format!("bad chunk size line: {size_line:?}")))?;

        if size == 0 {
            // Drain and discard any trailers up to the terminating blank line.
            loop {
                let trailer = reader.read_line().await?;
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }

        let first_byte_delay = t_prev_end.elapsed().as_millis() as u64;
        let chunk = reader.read_exact_bytes(size).await?;
        // trailing CRLF after the chunk data
        let _ = reader.read_line().await?;
        t_prev_end = Instant::now();

        chunks.push(chunk);
        delays.push(first_byte_delay);
    }

    Ok((chunks, delays))
}

/// Fetch strategy: record dials the real origin, replay consults the
/// archive. Modeled as the spec recommends (§9): an interface with two
/// implementations and a thread-safe mode switch, rather than flipping a
/// raw function pointer at runtime.
#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, req: &ArchivedRequest) -> Option<ArchivedResponse>;
}

pub struct RecordFetch {
    pub archive: Arc<dyn crate::archive::ArchiveBackend>,
    pub dns: DnsLookup,
}

#[async_trait::async_trait]
impl Fetch for RecordFetch {
    async fn fetch(&self, req: &ArchivedRequest) -> Option<ArchivedResponse> {
        let resp = fetch_from_origin(req, &self.dns).await?;
        self.archive.put(req.clone(), resp.clone());
        Some(resp)
    }
}

pub struct ReplayFetch {
    pub archive: Arc<dyn crate::archive::ArchiveBackend>,
    pub use_closest_match: bool,
    pub use_diff_on_unknown_requests: bool,
}

#[async_trait::async_trait]
impl Fetch for ReplayFetch {
    async fn fetch(&self, req: &ArchivedRequest) -> Option<ArchivedResponse> {
        if let Some(resp) = self.archive.get(req) {
            return Some(resp);
        }
        if self.use_diff_on_unknown_requests {
            if let Some(diff) = self.archive.diff(req) {
                log::info!("replay miss for {}:\n{diff}", req.host_and_path());
            }
        }
        if self.use_closest_match {
            if let Some(nearest) = self.archive.closest(req) {
                log::info!(
                    "replay miss for {} substituted with nearest match {}",
                    req.host_and_path(),
                    nearest.host_and_path()
                );
                return self.archive.get(&nearest);
            }
        }
        None
    }
}

/// Thread-safe record/replay switch (spec §9 "controllable" fetch).
pub struct ControllableFetch {
    record: Arc<RecordFetch>,
    replay: Arc<ReplayFetch>,
    recording: AtomicBool,
    // held only so callers can inspect which mode is active without
    // racing the atomic read against a concurrent setter.
    _lock: RwLock<()>,
}

impl ControllableFetch {
    pub fn new(record: Arc<RecordFetch>, replay: Arc<ReplayFetch>, start_in_record_mode: bool) -> Self {
        Self {
            record,
            replay,
            recording: AtomicBool::new(start_in_record_mode),
            _lock: RwLock::new(()),
        }
    }

    pub fn set_record_mode(&self) {
        let _guard = self._lock.write().unwrap();
        self.recording.store(true, Ordering::SeqCst);
    }

    pub fn set_replay_mode(&self) {
        let _guard = self._lock.write().unwrap();
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Fetch for ControllableFetch {
    async fn fetch(&self, req: &ArchivedRequest) -> Option<ArchivedResponse> {
        let _guard = self._lock.read().unwrap();
        if self.recording.load(Ordering::SeqCst) {
            drop(_guard);
            self.record.fetch(req).await
        } else {
            drop(_guard);
            self.replay.fetch(req).await
        }
    }
}
