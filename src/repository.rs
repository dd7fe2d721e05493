//! Repository and capability contracts consumed by the proxy core.
//!
//! The storage layer, file storage, and ACME/cert-cache implementations
//! live outside this crate's scope (see spec §6); this module only
//! defines the traits the core calls through, plus light in-memory
//! doubles used by the unit tests colocated with each component.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::ProxyDomain;
use crate::error::ProxyResult;

/// Repository contract for proxy domains (§6).
pub trait DomainRepository: Send + Sync {
    fn get_by_name(&self, name: &str) -> ProxyResult<Option<ProxyDomain>>;
    fn get_by_id(&self, id: &str) -> ProxyResult<Option<ProxyDomain>>;
    fn get_by_proxy_id(&self, proxy_id: &str) -> ProxyResult<Vec<ProxyDomain>>;
    fn insert(&self, domain: ProxyDomain) -> ProxyResult<ProxyDomain>;
    fn update_by_id(&self, domain: ProxyDomain) -> ProxyResult<ProxyDomain>;
    fn delete_by_id(&self, id: &str) -> ProxyResult<()>;
}

/// File-store contract (§6): paths are always rooted under an opaque
/// "own-managed certificates root" joined with a host name.
pub trait FileStore: Send + Sync {
    fn upload(&self, path: &str, bytes: &[u8], overwrite: bool) -> ProxyResult<()>;
    fn delete(&self, path: &str) -> ProxyResult<()>;
    fn delete_all(&self, path_prefix: &str) -> ProxyResult<()>;
}

/// ACME/cert-cache contract (§6) consulted by the managed TLS provider.
pub trait AcmeCertCache: Send + Sync {
    fn exists(&self, key: &str) -> bool;
    fn delete(&self, key: &str) -> ProxyResult<()>;
    fn cache_unmanaged_pem(&self, pem: &str, key: &str, sans: &[String]) -> ProxyResult<String>;
    fn all_matching(&self, host: &str) -> Vec<String>;
    fn remove(&self, hashes: &[String]) -> ProxyResult<()>;
}

/// Audit sink (§6): invoked on every authorization decision and mutating operation.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event_name: &str, ip: &str, user_id: &str, authorized: bool, details: &str);
}

/// Default audit sink: a single structured log line per event, matching
/// the teacher's logging conventions (info for allowed, warn for denied).
pub struct LoggingAuditSink;

impl AuditSink for LoggingAuditSink {
    fn emit(&self, event_name: &str, ip: &str, user_id: &str, authorized: bool, details: &str) {
        if authorized {
            log::info!(
                event = event_name, ip = ip, user_id = user_id, authorized = true, details = details;
                "audit event"
            );
        } else {
            log::warn!(
                event = event_name, ip = ip, user_id = user_id, authorized = false, details = details;
                "audit event denied"
            );
        }
    }
}

/// In-memory `DomainRepository` double, used by unit tests across
/// `config`, `domain`, and `pipeline`.
#[derive(Default)]
pub struct InMemoryDomainRepository {
    by_id: Mutex<HashMap<String, ProxyDomain>>,
}

impl InMemoryDomainRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DomainRepository for InMemoryDomainRepository {
    fn get_by_name(&self, name: &str) -> ProxyResult<Option<ProxyDomain>> {
        let map = self.by_id.lock().unwrap();
        Ok(map.values().find(|d| d.name == name).cloned())
    }

    fn get_by_id(&self, id: &str) -> ProxyResult<Option<ProxyDomain>> {
        let map = self.by_id.lock().unwrap();
        Ok(map.get(id).cloned())
    }

    fn get_by_proxy_id(&self, proxy_id: &str) -> ProxyResult<Vec<ProxyDomain>> {
        let map = self.by_id.lock().unwrap();
        Ok(map
            .values()
            .filter(|d| d.proxy_id == proxy_id)
            .cloned()
            .collect())
    }

    fn insert(&self, domain: ProxyDomain) -> ProxyResult<ProxyDomain> {
        let mut map = self.by_id.lock().unwrap();
        map.insert(domain.id.clone(), domain.clone());
        Ok(domain)
    }

    fn update_by_id(&self, domain: ProxyDomain) -> ProxyResult<ProxyDomain> {
        let mut map = self.by_id.lock().unwrap();
        map.insert(domain.id.clone(), domain.clone());
        Ok(domain)
    }

    fn delete_by_id(&self, id: &str) -> ProxyResult<()> {
        let mut map = self.by_id.lock().unwrap();
        map.remove(id);
        Ok(())
    }
}
