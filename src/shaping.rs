//! Bandwidth-shaped I/O (spec component 4.7's "rate-limiting streams").
//!
//! The token-bucket primitives themselves are named in the spec as an
//! external collaborator ("we consume its rate-limited I/O interface") —
//! this module is the consumption side: a thin `AsyncRead`/`AsyncWrite`
//! wrapper plus the minimal token bucket needed to drive it, since no
//! crate in the corpus provides one. It composes at the plaintext layer,
//! above TLS, per §9 ("wrap... between the TLS socket and the HTTP
//! parser/emitter").

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::Bandwidth;

/// Live count of in-flight requests, consulted by the limiter so bandwidth
/// divides fairly across them (spec §4.7).
#[derive(Clone, Default)]
pub struct ActiveRequestCount(Arc<AtomicU64>);

impl ActiveRequestCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// RAII guard: increments on creation, decrements on drop, matching
    /// the "guaranteed-release scope" the spec calls for.
    pub fn enter(&self) -> ActiveRequestGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveRequestGuard(self.0.clone())
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ActiveRequestGuard(Arc<AtomicU64>);

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TokenBucket {
    bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        Self { bytes_per_sec, tokens: bytes_per_sec as f64, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64).min(self.bytes_per_sec as f64);
        self.last_refill = now;
    }

    /// Bytes that may be transferred right now without exceeding the rate,
    /// given `active` concurrent requests sharing this bucket fairly.
    fn available(&mut self, active: u64) -> usize {
        self.refill();
        let share = self.tokens / active.max(1) as f64;
        share.max(0.0) as usize
    }

    fn consume(&mut self, n: usize) {
        self.tokens = (self.tokens - n as f64).max(0.0);
    }
}

/// Wraps a plaintext stream with optional up/down bandwidth shaping.
pub struct ShapedStream<S> {
    inner: S,
    read_bucket: Option<TokenBucket>,
    write_bucket: Option<TokenBucket>,
    active: ActiveRequestCount,
}

impl<S> ShapedStream<S> {
    pub fn new(inner: S, down_bandwidth: Bandwidth, up_bandwidth: Bandwidth, active: ActiveRequestCount) -> Self {
        Self {
            inner,
            read_bucket: match down_bandwidth {
                Bandwidth::Unlimited => None,
                Bandwidth::BytesPerSec(bps) => Some(TokenBucket::new(bps)),
            },
            write_bucket: match up_bandwidth {
                Bandwidth::Unlimited => None,
                Bandwidth::BytesPerSec(bps) => Some(TokenBucket::new(bps)),
            },
            active,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShapedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Some(bucket) = &mut this.read_bucket {
            let allowed = bucket.available(this.active.get());
            if allowed == 0 {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let mut limited = buf.take(allowed);
            let poll = Pin::new(&mut this.inner).poll_read(cx, &mut limited);
            let n = limited.filled().len();
            drop(limited);
            if let Poll::Ready(Ok(())) = &poll {
                unsafe {
                    buf.assume_init(n);
                }
                buf.advance(n);
                bucket.consume(n);
            }
            poll
        } else {
            Pin::new(&mut this.inner).poll_read(cx, buf)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShapedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Some(bucket) = &mut this.write_bucket {
            let allowed = bucket.available(this.active.get()).max(1).min(buf.len().max(1));
            let poll = Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed.min(buf.len())]);
            if let Poll::Ready(Ok(n)) = &poll {
                bucket.consume(*n);
            }
            poll
        } else {
            Pin::new(&mut this.inner).poll_write(cx, buf)
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
