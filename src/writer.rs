//! Response Writer (spec component 4.6).

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::archive::ArchivedResponse;
use crate::config::WprConfig;
use crate::error::{Result, WprError};

const DEFAULT_SERVER_HEADER: &str = "WebPageReplay";

/// Serialize `resp` back to `out`, applying header rewriting, framing and
/// (if `use_delays`) replay-timed pacing, exactly as spec 4.6 describes.
pub async fn write_response<W: AsyncWrite + Unpin>(
    out: &mut W,
    resp: &ArchivedResponse,
    cfg: &WprConfig,
) -> Result<()> {
    if cfg.delay_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(cfg.delay_ms)).await;
    }

    let body_len: usize = resp.total_body_len();
    let synthesize_length = !resp.chunked
        && !resp.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length"));

    let status_line = status_line(resp);
    out.write_all(status_line.as_bytes())
        .await
        .map_err(|e| WprError::Tls(format!("write failed: {e}")))?; // reuse generic I/O error kind

    for (name, value) in rewritten_headers(resp, cfg, synthesize_length, body_len) {
        out.write_all(format!("{name}: {value}\r\n").as_bytes())
            .await
            .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;
    }
    out.write_all(b"\r\n")
        .await
        .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;

    if cfg.use_delays && resp.delays.headers_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(resp.delays.headers_ms)).await;
    }

    if resp.chunked {
        write_chunked(out, resp, cfg).await?;
    } else {
        for chunk in &resp.response_data {
            out.write_all(chunk)
                .await
                .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;
        }
    }

    out.flush().await.map_err(|e| WprError::Tls(format!("flush failed: {e}")))?;
    Ok(())
}

fn status_line(resp: &ArchivedResponse) -> String {
    let proto = if resp.version == 10 { "HTTP/1.0" } else { "HTTP/1.1" };
    format!("{proto} {} {}\r\n", resp.status, resp.reason)
}

/// Drop `date`/`server` from the archive, add our own `Server:`, shift
/// `last-modified`/`expires` forward by the time elapsed since the
/// archive was recorded, and set/override `content-length` or
/// `transfer-encoding` per the framing decision table.
fn rewritten_headers(
    resp: &ArchivedResponse,
    cfg: &WprConfig,
    synthesize_length: bool,
    body_len: usize,
) -> Vec<(String, String)> {
    let now = Utc::now();
    let recorded_at = DateTime::<Utc>::from_timestamp(resp.recorded_at, 0).unwrap_or(now);
    let shift = now.signed_duration_since(recorded_at);

    let mut headers: Vec<(String, String)> = Vec::with_capacity(resp.headers.len() + 3);
    for (name, value) in &resp.headers {
        let lname = name.to_ascii_lowercase();
        match lname.as_str() {
            "date" | "server" | "transfer-encoding" | "connection" => continue,
            "content-length" if resp.chunked => continue,
            "last-modified" | "expires" => {
                if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
                    let shifted = parsed.with_timezone(&Utc) + shift;
                    headers.push((name.clone(), shifted.to_rfc2822()));
                } else {
                    headers.push((name.clone(), value.clone()));
                }
            }
            _ => headers.push((name.clone(), value.clone())),
        }
    }

    let server_value = resp
        .header("server")
        .map(|s| s.to_string())
        .unwrap_or_else(|| DEFAULT_SERVER_HEADER.to_string());
    headers.push(("server".to_string(), server_value));
    headers.push(("date".to_string(), now.to_rfc2822()));

    if resp.chunked {
        headers.push(("transfer-encoding".to_string(), "chunked".to_string()));
    } else if synthesize_length {
        headers.push(("content-length".to_string(), body_len.to_string()));
    }

    if resp.version == 10 {
        // spec 4.6: downgrading to HTTP/1.0 forces the connection closed,
        // since 1.0 has no standard keep-alive negotiation.
        headers.push(("connection".to_string(), "close".to_string()));
    }

    headers
}

async fn write_chunked<W: AsyncWrite + Unpin>(out: &mut W, resp: &ArchivedResponse, cfg: &WprConfig) -> Result<()> {
    for (i, chunk) in resp.response_data.iter().enumerate() {
        if cfg.use_delays {
            out.flush().await.map_err(|e| WprError::Tls(format!("flush failed: {e}")))?;
            let delay = resp.delays.data_ms.get(i).copied().unwrap_or(0);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
        }
        let header = format!("{:x}\r\n", chunk.len());
        out.write_all(header.as_bytes())
            .await
            .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;
        out.write_all(chunk)
            .await
            .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;
        out.write_all(b"\r\n")
            .await
            .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;
    }
    out.write_all(b"0\r\n\r\n")
        .await
        .map_err(|e| WprError::Tls(format!("write failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Delays;
    use bytes::Bytes;

    fn chunked_response() -> ArchivedResponse {
        ArchivedResponse {
            version: 11,
            status: 200,
            reason: "OK".to_string(),
            headers: vec![],
            response_data: vec![Bytes::from_static(b"AB"), Bytes::from_static(b"CDEF")],
            delays: Delays { connect_ms: 0, headers_ms: 0, data_ms: vec![0, 0] },
            chunked: true,
            recorded_at: 0,
        }
    }

    #[tokio::test]
    async fn chunked_framing_matches_scenario_a() {
        let resp = chunked_response();
        let cfg = WprConfig { use_delays: false, ..Default::default() };
        let mut out: Vec<u8> = Vec::new();
        write_response(&mut out, &resp, &cfg).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("2\r\nAB\r\n4\r\nCDEF\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn non_chunked_without_content_length_gets_one_synthesized() {
        let resp = ArchivedResponse {
            version: 11,
            status: 200,
            reason: "OK".to_string(),
            headers: vec![],
            response_data: vec![Bytes::from_static(b"hello")],
            delays: Delays::default(),
            chunked: false,
            recorded_at: 0,
        };
        let cfg = WprConfig { use_delays: false, ..Default::default() };
        let mut out: Vec<u8> = Vec::new();
        write_response(&mut out, &resp, &cfg).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 5"));
    }

    #[tokio::test]
    async fn http_10_downgrades_status_line() {
        let mut resp = chunked_response();
        resp.version = 10;
        let cfg = WprConfig { use_delays: false, ..Default::default() };
        let mut out: Vec<u8> = Vec::new();
        write_response(&mut out, &resp, &cfg).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
    }
}
