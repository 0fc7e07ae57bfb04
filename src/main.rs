//! Binary entrypoint: loads configuration and rules, compiles the rule
//! engine, builds the record/replay fetcher, and spawns the listener
//! variants the configuration calls for — one per OS thread, mirroring
//! the teacher's `system/server.rs` thread-per-component bootstrap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use webpagereplay::archive::InMemoryArchive;
use webpagereplay::config::WprConfig;
use webpagereplay::error::WprError;
use webpagereplay::fetch::{default_dns_lookup, ControllableFetch, RecordFetch, ReplayFetch};
use webpagereplay::rules::{compile, RuleSpec};
use webpagereplay::server::listeners;
use webpagereplay::server::WprContext;
use webpagereplay::shaping::ActiveRequestCount;
use webpagereplay::tls::{CertCache, RootCa};

const DEFAULT_CONFIG_PATH: &str = "wpr.toml";
const DEFAULT_RULES_PATH: &str = "rules.json";
const DEFAULT_ARCHIVE_PATH: &str = "archive.json";

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run() -> webpagereplay::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        WprConfig::load_from_path(&config_path)?
    } else {
        log::warn!("{config_path} not found, starting with documented defaults");
        WprConfig::default()
    };
    let config = Arc::new(config);

    let rules = if std::path::Path::new(DEFAULT_RULES_PATH).exists() {
        let text = std::fs::read_to_string(DEFAULT_RULES_PATH)?;
        serde_json::from_str::<Vec<RuleSpec>>(&text).map_err(|e| WprError::RuleCompile(e.to_string()))?
    } else {
        Vec::new()
    };
    let compiled_rules = Arc::new(compile(&rules)?);

    let archive = Arc::new(if std::path::Path::new(DEFAULT_ARCHIVE_PATH).exists() {
        InMemoryArchive::load_from_path(DEFAULT_ARCHIVE_PATH)?
    } else {
        InMemoryArchive::new()
    });

    let dns = default_dns_lookup();
    let record = Arc::new(RecordFetch {
        archive: archive.clone() as Arc<dyn webpagereplay::archive::ArchiveBackend>,
        dns,
    });
    let replay = Arc::new(ReplayFetch {
        archive: archive.clone() as Arc<dyn webpagereplay::archive::ArchiveBackend>,
        use_closest_match: config.use_closest_match,
        use_diff_on_unknown_requests: config.use_diff_on_unknown_requests,
    });
    let fetcher: Arc<dyn webpagereplay::fetch::Fetch> =
        Arc::new(ControllableFetch::new(record, replay, config.use_record_mode));

    let active_requests = ActiveRequestCount::new();

    install_shutdown_handler(archive);

    let addr = format!("{}:{}", config.host, config.port);
    let protocol = if config.is_ssl { "https" } else { "http" };
    log::info!("{protocol} server started on {addr}");

    let mut handles = Vec::new();

    if config.is_ssl {
        let root_ca_path = config
            .https_root_ca_cert_path
            .clone()
            .ok_or_else(|| WprError::Config("is_ssl requires https_root_ca_cert_path".to_string()))?;
        let root_ca = Arc::new(RootCa::load_from_path(&root_ca_path)?);
        let certs = Arc::new(CertCache::new());

        let ctx = Arc::new(WprContext {
            compiled_rules: compiled_rules.clone(),
            fetcher: fetcher.clone(),
            config: config.clone(),
            active_requests: active_requests.clone(),
            is_ssl: true,
        });

        let app = listeners::WprMitmApp::new(ctx, root_ca, certs)?;
        let mitm_addr = addr.clone();
        handles.push(std::thread::spawn(move || {
            if let Err(e) = listeners::run_https_mitm(&mitm_addr, app) {
                log::error!("HTTPS MITM listener failed: {e}");
            }
        }));
    } else {
        let ctx = Arc::new(WprContext {
            compiled_rules: compiled_rules.clone(),
            fetcher: fetcher.clone(),
            config: config.clone(),
            active_requests: active_requests.clone(),
            is_ssl: false,
        });
        let plain_addr = addr.clone();
        handles.push(std::thread::spawn(move || {
            if let Err(e) = listeners::run_plain_http(&plain_addr, ctx) {
                log::error!("HTTP listener failed: {e}");
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// Flush the in-memory archive to disk on Ctrl-C, the same "stop
/// gracefully on signal" behavior the teacher wires up via `ctrlc` in its
/// own `main.rs`.
fn install_shutdown_handler(archive: Arc<InMemoryArchive>) {
    let flushed = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if flushed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = archive.save_to_path(DEFAULT_ARCHIVE_PATH) {
            log::error!("failed to save archive on shutdown: {e}");
        }
        log::info!("shutting down");
        std::process::exit(0);
    })
    .expect("failed to install Ctrl-C handler");
}
