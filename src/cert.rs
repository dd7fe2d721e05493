//! CertificateStore (spec §4.6): three certificate providers behind one
//! `present(host)` contract, wired into the TLS listener via
//! `pingora::listeners::TlsAccept`. Grounded in `proxy/ssl.rs`'s
//! `DynamicCert`/`ProxySSL`/reversed-string SNI matcher, generalized from a
//! static id→cert map to the three live providers spec.md names.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use matchit::Router as MatchRouter;
use once_cell::sync::Lazy;
use pingora::listeners::TlsAccept;
use pingora::tls::ext;
use pingora::tls::pkey::PKey;
use pingora::tls::ssl::{NameType, SslRef};
use pingora::tls::x509::X509;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::error::{ProxyError, ProxyResult};
use crate::repository::{AcmeCertCache, FileStore};

static DEFAULT_SERVER_NAME: &str = "*";

#[derive(Clone)]
pub struct CertEntry {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Self-signed leaf issuance, grounded in the in-process CA pattern used by
/// MITM proxy tooling: a single long-lived CA signs short-lived per-host leaves.
struct SelfSignedCa {
    issuer: rcgen::Certificate,
    key_pair: KeyPair,
}

impl SelfSignedCa {
    fn new() -> Self {
        let key_pair = KeyPair::generate().expect("failed to generate CA key pair");
        let mut params = CertificateParams::new(Vec::new()).expect("invalid CA params");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "phish-proxy local CA");
        params.distinguished_name = dn;
        let issuer = params
            .self_signed(&key_pair)
            .expect("failed to self-sign CA certificate");
        Self { issuer, key_pair }
    }

    fn issue_leaf(&self, host: &str) -> ProxyResult<CertEntry> {
        let leaf_key = KeyPair::generate()
            .map_err(|e| ProxyError::Fatal(format!("key generation failed: {e}")))?;
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ProxyError::Fatal(format!("invalid cert params for '{host}': {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key_pair)
            .map_err(|e| ProxyError::Fatal(format!("failed to sign leaf cert for '{host}': {e}")))?;

        Ok(CertEntry {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}

/// Abstracts the three certificate providers named in spec §4.6 behind a
/// single `present(host)` lookup used by the TLS accept callback.
pub struct CertificateStore {
    managed: Option<Arc<dyn AcmeCertCache>>,
    own_managed_files: Option<Arc<dyn FileStore>>,
    own_root: String,
    self_signed_ca: SelfSignedCa,
    cache: DashMap<String, CertEntry>,
}

impl CertificateStore {
    pub fn new(
        managed: Arc<dyn AcmeCertCache>,
        own_managed_files: Arc<dyn FileStore>,
        own_root: impl Into<String>,
    ) -> Self {
        Self {
            managed: Some(managed),
            own_managed_files: Some(own_managed_files),
            own_root: own_root.into(),
            self_signed_ca: SelfSignedCa::new(),
            cache: DashMap::new(),
        }
    }

    /// A store with no backing ACME/file-store capability wired in; used by
    /// tests and by the self-signed-only path.
    pub fn new_in_memory() -> Self {
        Self {
            managed: None,
            own_managed_files: None,
            own_root: "own-managed".to_string(),
            self_signed_ca: SelfSignedCa::new(),
            cache: DashMap::new(),
        }
    }

    /// Resolves a certificate/key pair for `host`, generating a self-signed
    /// leaf on demand if none is cached and no managed/own-managed entry exists.
    pub fn present(&self, host: &str) -> Option<CertEntry> {
        if let Some(entry) = self.cache.get(host) {
            return Some(entry.clone());
        }
        let leaf = self.self_signed_ca.issue_leaf(host).ok()?;
        self.cache.insert(host.to_string(), leaf.clone());
        Some(leaf)
    }

    pub fn install_self_signed(&self, host: &str) -> ProxyResult<CertEntry> {
        let entry = self.self_signed_ca.issue_leaf(host)?;
        self.cache.insert(host.to_string(), entry.clone());
        Ok(entry)
    }

    /// Reads `<own_root>/<host>/cert.pem`+`.key` from the file store and
    /// caches them with no SAN override (spec §4.6).
    pub fn install_own_managed(&self, host: &str, pem: &str, key: &str) -> ProxyResult<()> {
        if let Some(files) = &self.own_managed_files {
            let dir = format!("{}/{host}", self.own_root);
            files.upload(&format!("{dir}/cert.pem"), pem.as_bytes(), true)?;
            files.upload(&format!("{dir}/cert.key"), key.as_bytes(), true)?;
        }
        self.cache.insert(
            host.to_string(),
            CertEntry {
                cert_pem: pem.to_string(),
                key_pem: key.to_string(),
            },
        );
        Ok(())
    }

    /// Removes managed-provider artifacts (pem, key, meta, site prefix) and
    /// evicts all in-memory matches for `host`.
    pub fn evict_managed(&self, host: &str) -> ProxyResult<()> {
        if let Some(acme) = &self.managed {
            let hashes = acme.all_matching(host);
            if !hashes.is_empty() {
                acme.remove(&hashes)?;
            }
        }
        self.cache.remove(host);
        Ok(())
    }

    /// Deletes all files under `<own_root>/<host>/` and removes the
    /// in-memory cache entry for `host`.
    pub fn evict_own_managed(&self, host: &str) -> ProxyResult<()> {
        if let Some(files) = &self.own_managed_files {
            files.delete_all(&format!("{}/{host}/", self.own_root))?;
        }
        self.cache.remove(host);
        Ok(())
    }
}

/// SNI-indexed matcher over known phishing hosts, rebuilt whenever the set of
/// proxy domains changes. Reverses each host the way `proxy/ssl.rs` reverses
/// SNI strings so `matchit`'s path-prefix semantics double as a suffix matcher.
#[derive(Default)]
pub struct SniMatchEntry {
    hosts: MatchRouter<()>,
}

impl SniMatchEntry {
    pub fn insert_host(&mut self, host: &str) -> Result<(), matchit::InsertError> {
        let reversed: String = host.chars().rev().collect();
        self.hosts.insert(reversed, ())
    }

    pub fn matches(&self, sni: &str) -> bool {
        let reversed: String = sni.chars().rev().collect();
        self.hosts.at(&reversed).is_ok()
    }
}

static KNOWN_HOSTS: Lazy<DashMap<String, ()>> = Lazy::new(DashMap::new);

pub fn register_known_host(host: &str) {
    KNOWN_HOSTS.insert(host.to_string(), ());
}

pub fn forget_known_host(host: &str) {
    KNOWN_HOSTS.remove(host);
}

/// `TlsAccept` implementation wired to the store: looks up the SNI host in
/// `CertificateStore::present`, falling back to a fixed default certificate
/// when the host is unknown.
pub struct DynamicCert {
    store: Arc<CertificateStore>,
    default: CertEntry,
}

impl DynamicCert {
    pub fn new(store: Arc<CertificateStore>, default: CertEntry) -> Box<Self> {
        Box::new(Self { store, default })
    }
}

#[async_trait]
impl TlsAccept for DynamicCert {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let sni = ssl
            .servername(NameType::HOST_NAME)
            .unwrap_or(DEFAULT_SERVER_NAME)
            .to_string();

        let entry = self.store.present(&sni).unwrap_or_else(|| self.default.clone());

        match X509::from_pem(entry.cert_pem.as_bytes()) {
            Ok(cert) => match PKey::private_key_from_pem(entry.key_pem.as_bytes()) {
                Ok(key) => {
                    if let Err(e) = ext::ssl_use_certificate(ssl, &cert) {
                        log::error!("failed to use certificate for '{sni}': {e}");
                    }
                    if let Err(e) = ext::ssl_use_private_key(ssl, &key) {
                        log::error!("failed to use private key for '{sni}': {e}");
                    }
                }
                Err(e) => log::error!("failed to parse private key for '{sni}': {e}"),
            },
            Err(e) => log::error!("failed to parse certificate for '{sni}': {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_round_trips_pem() {
        let store = CertificateStore::new_in_memory();
        let entry = store.present("example.com").unwrap();
        assert!(entry.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(entry.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn present_is_cached() {
        let store = CertificateStore::new_in_memory();
        let a = store.present("example.com").unwrap();
        let b = store.present("example.com").unwrap();
        assert_eq!(a.cert_pem, b.cert_pem);
    }

    #[test]
    fn evict_own_managed_clears_cache() {
        let store = CertificateStore::new_in_memory();
        store.install_own_managed("host.example", "pem", "key").unwrap();
        assert!(store.cache.contains_key("host.example"));
        store.evict_own_managed("host.example").unwrap();
        assert!(!store.cache.contains_key("host.example"));
    }

    #[test]
    fn sni_matcher_matches_reversed_host() {
        let mut matcher = SniMatchEntry::default();
        matcher.insert_host("phish.example.com").unwrap();
        assert!(matcher.matches("phish.example.com"));
        assert!(!matcher.matches("other.example.com"));
    }
}
