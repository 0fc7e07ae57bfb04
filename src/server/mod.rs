//! Connection Server (spec component 4.7).
//!
//! Built on `pingora::apps::ServerApp` over a raw `Stream`, the same shape
//! the teacher uses in `app/proxy.rs`, rather than `pingora::proxy::
//! ProxyHttp`: WPR needs to decide, per request, whether to dial upstream
//! at all (never, on a rule `sendStatus` or an archive hit) and needs
//! byte-exact control of chunked framing and replay-timed pacing that the
//! higher-level proxy trait does not expose. Request parsing is therefore
//! hand-rolled on `httparse`, mirroring the teacher's own byte-level
//! `extract_http_host` (`app/proxy_host.rs`).

pub mod listeners;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use pingora::apps::ServerApp;
use pingora::protocols::Stream;
use pingora::server::ShutdownWatch;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::archive::ArchivedResponse;
use crate::config::WprConfig;
use crate::fetch::Fetch;
use crate::mutator;
use crate::request::{normalize, Normalized, RawRequest};
use crate::rules::CompiledRules;
use crate::shaping::{ActiveRequestCount, ShapedStream};

const MAX_REQUEST_LINE_LEN: usize = 65_536;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared, immutable-after-construction state handed to every connection.
pub struct WprContext {
    pub compiled_rules: Arc<CompiledRules>,
    pub fetcher: Arc<dyn Fetch>,
    pub config: Arc<WprConfig>,
    pub active_requests: ActiveRequestCount,
    /// True when the origin dial for this listener should use TLS —
    /// either because the client's own connection is HTTPS (single-cert
    /// and MITM variants) or because the listener is the HTTP-to-HTTPS
    /// bridge, which always dials upstream over TLS regardless of how
    /// the client connected (open question (c)).
    pub is_ssl: bool,
}

impl WprContext {
    fn shaped<S>(&self, inner: S) -> ShapedStream<S> {
        ShapedStream::new(inner, self.config.down_bandwidth, self.config.up_bandwidth, self.active_requests.clone())
    }
}

pub struct WprApp {
    pub ctx: Arc<WprContext>,
}

#[async_trait]
impl ServerApp for WprApp {
    async fn process_new(
        &self,
        stream: Stream,
        _shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let mut shaped = self.ctx.shaped(stream);
        if let Err(e) = handle_connection(&mut shaped, &self.ctx).await {
            log::debug!("connection closed: {e}");
        }
        None
    }
}

pub(crate) async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
    ctx: &WprContext,
) -> crate::error::Result<()> {
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let request = match read_request(stream, &mut buf).await? {
            Some(r) => r,
            None => return Ok(()), // connection closed between requests
        };

        let _guard = ctx.active_requests.enter();

        match request {
            ParsedRequest::TooLong => {
                write_error_response(stream, 414, "Request-URI Too Long").await?;
                return Ok(());
            }
            ParsedRequest::Ok { method, target, headers, body } => {
                let raw = RawRequest {
                    method: &method,
                    target: &target,
                    headers: headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
                    body,
                    is_ssl: ctx.is_ssl,
                };

                let mut keep_alive = !headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));

                match normalize(&ctx.compiled_rules, &raw) {
                    Ok(Normalized::ShortCircuit { status }) => {
                        write_error_response(stream, status, reason_phrase(status)).await?;
                    }
                    Ok(Normalized::Request(archived_req)) => {
                        let response = ctx.fetcher.fetch(&archived_req).await;
                        let response = match response {
                            Some(resp) => resp,
                            None => synthetic_not_found(),
                        };
                        let mutated = mutator::apply_mutations(&ctx.compiled_rules, &archived_req, &response, &ctx.config);
                        // spec 4.6: a downgraded HTTP/1.0 response always closes the
                        // connection, regardless of what the request asked for.
                        if mutated.version == 10 {
                            keep_alive = false;
                        }
                        crate::writer::write_response(stream, &mutated, &ctx.config).await?;
                    }
                    Err(e) => {
                        let status = e.status_code().unwrap_or(400);
                        write_error_response(stream, status, reason_phrase(status)).await?;
                    }
                }

                if !keep_alive {
                    return Ok(());
                }
            }
        }
    }
}

enum ParsedRequest {
    Ok { method: String, target: String, headers: Vec<(String, String)>, body: Bytes },
    TooLong,
}

async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> crate::error::Result<Option<ParsedRequest>> {
    loop {
        if let Some(header_end) = find_header_end(buf) {
            if header_end > MAX_REQUEST_LINE_LEN {
                return Ok(Some(ParsedRequest::TooLong));
            }

            let mut headers_storage = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers_storage);
            let status = req
                .parse(&buf[..header_end])
                .map_err(|e| crate::error::WprError::MalformedRequest(e.to_string()))?;
            if status.is_partial() {
                return Err(crate::error::WprError::MalformedRequest("incomplete request".to_string()));
            }

            let method = req.method.unwrap_or("GET").to_string();
            let target = req.path.unwrap_or("/").to_string();
            let headers: Vec<(String, String)> = req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
                .collect();

            let chunked = headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));

            buf.advance_to(header_end);

            // spec 4.2: transfer-encoding: chunked request bodies are
            // dechunked before hashing, same as archived response bodies.
            let body = if chunked {
                read_chunked_request_body(stream, buf).await?
            } else {
                let content_length: usize = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse().ok())
                    .unwrap_or(0);

                while buf.len() < content_length {
                    let mut tmp = [0u8; 4096];
                    let n = tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut tmp))
                        .await
                        .map_err(|_| crate::error::WprError::MalformedRequest("idle timeout".to_string()))?
                        .map_err(crate::error::WprError::ArchiveIo)?;
                    if n == 0 {
                        return Err(crate::error::WprError::MalformedRequest("premature EOF in body".to_string()));
                    }
                    buf.extend_from_slice(&tmp[..n]);
                }
                buf.split_to(content_length).freeze()
            };

            return Ok(Some(ParsedRequest::Ok { method, target, headers, body }));
        }

        if buf.len() > MAX_REQUEST_LINE_LEN {
            return Ok(Some(ParsedRequest::TooLong));
        }

        let mut tmp = [0u8; 4096];
        let read = tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut tmp)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(crate::error::WprError::ArchiveIo(e)),
            Err(_) => return Ok(None), // idle timeout: close quietly
        };
        if n == 0 {
            return Ok(None); // clean close between requests
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Dechunk a `transfer-encoding: chunked` request body, filling `buf` from
/// `stream` as needed. `buf` holds whatever bytes already followed the
/// request headers; on return it holds any bytes read past the terminating
/// `0\r\n\r\n` chunk, ready for the next request on the same connection.
async fn read_chunked_request_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> crate::error::Result<Bytes> {
    async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> crate::error::Result<()> {
        let mut tmp = [0u8; 4096];
        let n = tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut tmp))
            .await
            .map_err(|_| crate::error::WprError::MalformedRequest("idle timeout".to_string()))?
            .map_err(crate::error::WprError::ArchiveIo)?;
        if n == 0 {
            return Err(crate::error::WprError::MalformedRequest("premature EOF in chunked body".to_string()));
        }
        buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    let mut body = BytesMut::new();
    loop {
        // Chunk-size line, ignoring any chunk-extension after `;` (open
        // question (a)).
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            fill(stream, buf).await?;
        };
        let size_line = String::from_utf8_lossy(&buf[..line_end]).to_string();
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| crate::error::WprError::MalformedRequest(format!("bad chunk size: {size_line}")))?;
        buf.advance_to(line_end + 2);

        while buf.len() < size + 2 {
            fill(stream, buf).await?;
        }
        body.extend_from_slice(&buf[..size]);
        buf.advance_to(size + 2); // chunk data plus trailing CRLF

        if size == 0 {
            return Ok(body.freeze());
        }
    }
}

fn find_header_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

trait AdvanceTo {
    fn advance_to(&mut self, n: usize);
}
impl AdvanceTo for BytesMut {
    fn advance_to(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}

fn synthetic_not_found() -> ArchivedResponse {
    ArchivedResponse {
        version: 11,
        status: 404,
        reason: "Not Found".to_string(),
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        response_data: vec![Bytes::from_static(b"Not Found")],
        delays: crate::archive::Delays::default(),
        chunked: false,
        recorded_at: 0,
    }
}

async fn write_error_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: u16,
    reason: &str,
) -> crate::error::Result<()> {
    let body = format!("{status} {reason}");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(crate::error::WprError::ArchiveIo)?;
    stream.flush().await.map_err(crate::error::WprError::ArchiveIo)?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        404 => "Not Found",
        414 => "Request-URI Too Long",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunked_request_body_is_dechunked_before_hashing() {
        let mut stream = std::io::Cursor::new(b"3\r\nfoo\r\n4\r\nbar!\r\n0\r\n\r\nTRAILING".to_vec());
        let mut buf = BytesMut::new();
        let body = read_chunked_request_body(&mut stream, &mut buf).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"foobar!"));
        assert_eq!(&buf[..], b"TRAILING");
    }
}
