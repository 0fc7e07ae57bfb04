//! TLS MITM (spec component 4.8).
//!
//! Certificate minting uses the `openssl` crate, already a teacher
//! dependency (vendored feature, pulled in for `pingora`'s TLS). The
//! async handshake itself is driven by `tokio-openssl` wrapping the raw
//! `pingora::protocols::Stream`, with an SNI `servername_callback` that
//! performs the double-checked `CertCache` lookup/insert described in
//! §4.8 before the handshake completes — the same "cache artifacts keyed
//! by a per-connection identity" shape the teacher uses in
//! `system/prottp/app/tls_tools.rs` (there keyed by a config checksum,
//! here keyed by SNI hostname).

use std::collections::HashMap;
use std::sync::RwLock;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509NameBuilder, X509};

use crate::error::{Result, WprError};

const LEAF_VALIDITY_BACK_HOURS: u32 = 1;
const LEAF_VALIDITY_FORWARD_DAYS: u32 = 365;

#[derive(Clone)]
pub struct LeafCert {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// Mapping SNI hostname -> minted leaf certificate. Shared across all
/// connections for that host, lifetime equals the server process (spec
/// §3). Read-mostly: a plain `RwLock<HashMap<..>>` gives unsynchronized
/// concurrent reads after publication and exclusive writes, matching §4.8.
#[derive(Default)]
pub struct CertCache {
    entries: RwLock<HashMap<String, LeafCert>>,
}

impl CertCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached leaf for `hostname`, minting and inserting one
    /// under the configured root CA if absent. At-most-one generation per
    /// hostname via double-checked locking (invariant 5).
    pub fn get_or_mint(
        &self,
        hostname: &str,
        root_cert: &X509,
        root_key: &PKey<Private>,
    ) -> Result<LeafCert> {
        if let Some(existing) = self.entries.read().unwrap().get(hostname) {
            return Ok(existing.clone());
        }

        let mut guard = self.entries.write().unwrap();
        if let Some(existing) = guard.get(hostname) {
            return Ok(existing.clone());
        }

        let leaf = mint_leaf_cert(hostname, root_cert, root_key)?;
        guard.insert(hostname.to_string(), leaf.clone());
        Ok(leaf)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

/// A loaded root CA: certificate + private key, parsed from a single
/// PEM-concatenated file path (spec §6 "TLS material").
pub struct RootCa {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl RootCa {
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let pem = std::fs::read(path)?;
        let cert = X509::from_pem(&pem).map_err(|e| WprError::Tls(format!("bad root cert: {e}")))?;
        let key = PKey::private_key_from_pem(&pem).map_err(|e| WprError::Tls(format!("bad root key: {e}")))?;
        Ok(RootCa { cert, key })
    }
}

pub(crate) fn mint_leaf_cert(hostname: &str, root_cert: &X509, root_key: &PKey<Private>) -> Result<LeafCert> {
    let rsa = Rsa::generate(2048).map_err(|e| WprError::Tls(format!("keygen failed: {e}")))?;
    let key = PKey::from_rsa(rsa).map_err(|e| WprError::Tls(format!("keygen failed: {e}")))?;

    let mut name_builder: X509NameBuilder = X509Name::builder().map_err(|e| WprError::Tls(e.to_string()))?;
    name_builder
        .append_entry_by_text("CN", hostname)
        .map_err(|e| WprError::Tls(e.to_string()))?;
    let name = name_builder.build();

    let mut builder = X509::builder().map_err(|e| WprError::Tls(e.to_string()))?;
    builder.set_version(2).map_err(|e| WprError::Tls(e.to_string()))?;
    builder.set_subject_name(&name).map_err(|e| WprError::Tls(e.to_string()))?;
    builder
        .set_issuer_name(root_cert.subject_name())
        .map_err(|e| WprError::Tls(e.to_string()))?;
    builder.set_pubkey(&key).map_err(|e| WprError::Tls(e.to_string()))?;

    let mut serial = BigNum::new().map_err(|e| WprError::Tls(e.to_string()))?;
    serial
        .rand(63, MsbOption::MAYBE_ZERO, false)
        .map_err(|e| WprError::Tls(e.to_string()))?;
    let serial = serial.to_asn1_integer().map_err(|e| WprError::Tls(e.to_string()))?;
    builder.set_serial_number(&serial).map_err(|e| WprError::Tls(e.to_string()))?;

    let not_before = Asn1Time::days_from_now(0)
        .and_then(|_| Asn1Time::seconds_from_now(-((LEAF_VALIDITY_BACK_HOURS as i32) * 3600)))
        .map_err(|e| WprError::Tls(e.to_string()))?;
    let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_FORWARD_DAYS)
        .map_err(|e| WprError::Tls(e.to_string()))?;
    builder.set_not_before(&not_before).map_err(|e| WprError::Tls(e.to_string()))?;
    builder.set_not_after(&not_after).map_err(|e| WprError::Tls(e.to_string()))?;

    let san = SubjectAlternativeName::new()
        .dns(hostname)
        .build(&builder.x509v3_context(Some(root_cert), None))
        .map_err(|e| WprError::Tls(e.to_string()))?;
    builder.append_extension(san).map_err(|e| WprError::Tls(e.to_string()))?;

    builder
        .sign(root_key, MessageDigest::sha256())
        .map_err(|e| WprError::Tls(format!("signing failed: {e}")))?;

    Ok(LeafCert { cert: builder.build(), key })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_root() -> RootCa {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut name_builder = X509Name::builder().unwrap();
        name_builder.append_entry_by_text("CN", "Test Root CA").unwrap();
        let name = name_builder.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        let mut serial = BigNum::new().unwrap();
        serial.rand(63, MsbOption::MAYBE_ZERO, false).unwrap();
        builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(3650).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        RootCa { cert: builder.build(), key }
    }

    #[test]
    fn mints_distinct_certs_per_hostname() {
        let root = self_signed_root();
        let cache = CertCache::new();
        let a = cache.get_or_mint("a.example", &root.cert, &root.key).unwrap();
        let b = cache.get_or_mint("b.example", &root.cert, &root.key).unwrap();
        assert_ne!(a.cert.to_pem().unwrap(), b.cert.to_pem().unwrap());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn repeated_lookup_reuses_cached_cert() {
        let root = self_signed_root();
        let cache = CertCache::new();
        let first = cache.get_or_mint("a.example", &root.cert, &root.key).unwrap();
        let second = cache.get_or_mint("a.example", &root.cert, &root.key).unwrap();
        assert_eq!(first.cert.to_pem().unwrap(), second.cert.to_pem().unwrap());
        assert_eq!(cache.len(), 1);
    }
}
