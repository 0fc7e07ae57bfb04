//! Listener bootstrap (spec component 4.7's four variants): plain HTTP,
//! HTTPS with a single static certificate, HTTPS MITM with per-SNI minted
//! leaves, and the HTTP-to-HTTPS bridge.
//!
//! Grounded directly in the teacher's `service/proxy.rs` (`Service::
//! with_listeners("name", Listeners::tcp(addr), App::new(...))` for plain
//! TCP, `Listeners::tls(addr, cert, key)` for single-cert TLS) and
//! `system/server.rs` (one `pingora::server::Server`, `.bootstrap()`,
//! `.add_services()`, `.run(RunArgs::default())` per listener, each on its
//! own OS thread). The MITM variant has no teacher precedent — pingora's
//! `Listeners::tls` only accepts a fixed cert/key pair, not a per-SNI
//! callback — so it terminates TLS itself: accept a bare TCP stream via
//! `Listeners::tcp`, then drive the handshake with `tokio-openssl` using
//! an `SslAcceptor` whose `servername_callback` mints (or reuses) a leaf
//! from the shared `CertCache` before the handshake completes.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use openssl::ssl::{NameType, SniError, SslAcceptor, SslMethod, SslRef};
use pingora::apps::ServerApp;
use pingora::protocols::Stream;
use pingora::server::{RunArgs, Server};
use pingora::services::listening::Service;
use pingora::listeners::Listeners;

use crate::tls::{CertCache, RootCa};

use super::{handle_connection, WprApp, WprContext};

/// Run a single listener-variant service to completion on its own
/// `pingora::server::Server`, mirroring the teacher's per-component
/// thread-per-listener bootstrap in `system/server.rs`.
fn run_service(name: &str, service: Box<dyn pingora::services::Service>) -> std::io::Result<()> {
    let mut server = Server::new(None).map_err(|e| std::io::Error::other(format!("{name}: {e}")))?;
    server.bootstrap();
    server.add_services(vec![service]);
    log::info!("{name} listener started");
    server.run(RunArgs::default());
    Ok(())
}

/// Plain HTTP listener (spec 4.7 variant 1). No TLS at all; `ctx.is_ssl`
/// is whatever the caller configured (false for ordinary plain HTTP,
/// true for the HTTP-to-HTTPS bridge, which speaks plain HTTP to the
/// client but must still dial the origin over TLS).
pub fn plain_http_service(addr: &str, ctx: Arc<WprContext>) -> Service<WprApp> {
    Service::with_listeners("WPR HTTP".to_string(), Listeners::tcp(addr), WprApp { ctx })
}

pub fn run_plain_http(addr: &str, ctx: Arc<WprContext>) -> std::io::Result<()> {
    run_service("WPR HTTP", Box::new(plain_http_service(addr, ctx)))
}

/// The HTTP-to-HTTPS bridge is structurally the plain listener; the
/// distinction is entirely in `ctx.is_ssl`, which the caller must set to
/// `true` so the origin fetcher in `fetch.rs` dials port 443 with TLS.
pub fn run_http_to_https_bridge(addr: &str, ctx: Arc<WprContext>) -> std::io::Result<()> {
    run_service("WPR HTTP-to-HTTPS", Box::new(plain_http_service(addr, ctx)))
}

/// HTTPS listener terminated with one static certificate (spec 4.7
/// variant 2) — pingora's own `Listeners::tls` does the handshake before
/// `WprApp` ever sees a byte, identical to the teacher's
/// `proxy_service_tls`.
pub fn https_single_cert_service(
    addr: &str,
    cert_path: &str,
    key_path: &str,
    ctx: Arc<WprContext>,
) -> crate::error::Result<Service<WprApp>> {
    let listeners = Listeners::tls(addr, cert_path, key_path)
        .map_err(|e| crate::error::WprError::Tls(format!("failed to load {cert_path}/{key_path}: {e}")))?;
    Ok(Service::with_listeners("WPR HTTPS".to_string(), listeners, WprApp { ctx }))
}

pub fn run_https_single_cert(
    addr: &str,
    cert_path: &str,
    key_path: &str,
    ctx: Arc<WprContext>,
) -> crate::error::Result<()> {
    let service = https_single_cert_service(addr, cert_path, key_path, ctx)?;
    run_service("WPR HTTPS", Box::new(service)).map_err(crate::error::WprError::Bind)
}

/// HTTPS MITM listener (spec 4.7 variant 3 / component 4.8): accepts a
/// plain TCP stream via pingora, then performs the TLS handshake itself
/// so each SNI hostname can get its own minted leaf from `CertCache`.
pub struct WprMitmApp {
    ctx: Arc<WprContext>,
    acceptor: SslAcceptor,
}

impl WprMitmApp {
    pub fn new(ctx: Arc<WprContext>, root_ca: Arc<RootCa>, certs: Arc<CertCache>) -> crate::error::Result<Self> {
        let acceptor = build_sni_acceptor(root_ca, certs)?;
        Ok(Self { ctx, acceptor })
    }
}

#[async_trait]
impl ServerApp for WprMitmApp {
    async fn process_new(
        &self,
        stream: Stream,
        _shutdown: &pingora::server::ShutdownWatch,
    ) -> Option<Stream> {
        let ssl = match openssl::ssl::Ssl::new(self.acceptor.context()) {
            Ok(ssl) => ssl,
            Err(e) => {
                log::warn!("failed to create SSL session: {e}");
                return None;
            }
        };

        let mut tls_stream = match tokio_openssl::SslStream::new(ssl, stream) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("failed to wrap stream for TLS MITM: {e}");
                return None;
            }
        };

        if let Err(e) = Pin::new(&mut tls_stream).accept().await {
            log::debug!("MITM handshake failed: {e}");
            return None;
        }

        let mut shaped = self.ctx.shaped(tls_stream);
        if let Err(e) = handle_connection(&mut shaped, &self.ctx).await {
            log::debug!("MITM connection closed: {e}");
        }
        None
    }
}

/// Build a fresh `SslAcceptor` whose `servername_callback` mints (or
/// reuses) a per-hostname leaf cert signed by `root_ca`, installing it on
/// the session before the handshake proceeds (spec 4.8 invariant 5: at
/// most one generation per hostname, enforced by `CertCache` itself).
fn build_sni_acceptor(root_ca: Arc<RootCa>, certs: Arc<CertCache>) -> crate::error::Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .map_err(|e| crate::error::WprError::Tls(format!("acceptor init failed: {e}")))?;

    // A placeholder leaf so the acceptor has *a* certificate configured
    // before the first ClientHello; the SNI callback below swaps in the
    // real per-host leaf for every connection.
    let placeholder = crate::tls::mint_leaf_cert("wpr-bootstrap", &root_ca.cert, &root_ca.key)?;
    builder
        .set_private_key(&placeholder.key)
        .map_err(|e| crate::error::WprError::Tls(e.to_string()))?;
    builder
        .set_certificate(&placeholder.cert)
        .map_err(|e| crate::error::WprError::Tls(e.to_string()))?;

    builder.set_servername_callback(move |ssl: &mut SslRef, _alert| {
        let hostname = match ssl.servername(NameType::HOST_NAME) {
            Some(h) => h.to_string(),
            None => return Ok(()),
        };
        let leaf = match certs.get_or_mint(&hostname, &root_ca.cert, &root_ca.key) {
            Ok(leaf) => leaf,
            Err(e) => {
                log::warn!("failed to mint leaf for {hostname}: {e}");
                return Err(SniError::ALERT_FATAL);
            }
        };
        if ssl.set_certificate(&leaf.cert).is_err() || ssl.set_private_key(&leaf.key).is_err() {
            return Err(SniError::ALERT_FATAL);
        }
        Ok(())
    });

    Ok(builder.build())
}

pub fn run_https_mitm(addr: &str, app: WprMitmApp) -> std::io::Result<()> {
    let listeners = Listeners::tcp(addr);
    let service = Service::with_listeners("WPR HTTPS MITM".to_string(), listeners, app);
    run_service("WPR HTTPS MITM", Box::new(service))
}
