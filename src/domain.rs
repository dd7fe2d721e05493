//! Proxy domains and the `DomainLifecycle` component (spec §3, §4.4).
//!
//! A `ProxyDomain` is the persisted side-effect of a compiled configuration:
//! one row per `to` mapping. `DomainLifecycle` reconciles the desired set
//! produced by the `RulesetCompiler` against what the repository already
//! holds, applying TLS-transition and rollback rules along the way.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

use crate::cert::CertificateStore;
use crate::config::{CompiledConfig, TlsMode};
use crate::error::{ProxyError, ProxyResult};
use crate::repository::{AuditSink, DomainRepository};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainType {
    Proxy,
    Other,
}

#[derive(Clone, Debug)]
pub struct ProxyDomain {
    pub id: String,
    pub name: String,
    pub domain_type: DomainType,
    pub tenant: Option<String>,
    pub proxy_id: String,
    pub proxy_target_domain: Option<String>,
    pub host_website: bool,
    pub page_content: Option<String>,
    pub page_not_found_content: Option<String>,
    pub redirect_url: Option<String>,
    pub managed: bool,
    pub self_signed: bool,
    pub own_managed: bool,
    pub own_managed_pem: Option<String>,
    pub own_managed_key: Option<String>,
}

impl ProxyDomain {
    fn tls_mode(&self) -> TlsMode {
        if self.self_signed {
            TlsMode::SelfSigned
        } else {
            TlsMode::Managed
        }
    }
}

/// Patch applied by the public (non-privileged) domain update path. Every
/// field is optional; `None` means "leave unchanged".
#[derive(Clone, Debug, Default)]
pub struct DomainPatch {
    pub domain_type: Option<DomainType>,
    pub proxy_target_domain: Option<Option<String>>,
    pub host_website: Option<bool>,
    pub page_content: Option<Option<String>>,
    pub page_not_found_content: Option<Option<String>>,
    pub redirect_url: Option<Option<String>>,
    pub managed: Option<bool>,
    pub self_signed: Option<bool>,
    pub own_managed: Option<bool>,
    pub own_managed_pem: Option<String>,
    pub own_managed_key: Option<String>,
}

fn apply_tls_exclusivity(domain: &mut ProxyDomain) {
    if domain.managed {
        domain.self_signed = false;
        domain.own_managed = false;
    } else if domain.self_signed {
        domain.own_managed = false;
    }
}

/// Reconciles declared host mappings against persisted proxy domains and
/// their certificates; gates direct admin mutation of `type=proxy` records.
pub struct DomainLifecycle<'a> {
    pub repo: &'a dyn DomainRepository,
    pub certs: &'a CertificateStore,
    pub audit: &'a dyn AuditSink,
    /// Serializes `sync_proxy_domains` per proxy config id (spec §5).
    reconcile_locks: Mutex<HashMap<String, ()>>,
}

impl<'a> DomainLifecycle<'a> {
    pub fn new(repo: &'a dyn DomainRepository, certs: &'a CertificateStore, audit: &'a dyn AuditSink) -> Self {
        Self {
            repo,
            certs,
            audit,
            reconcile_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Privileged creation path; bypasses the admin-surface guard.
    pub fn create_proxy_domain(&self, mut domain: ProxyDomain) -> ProxyResult<ProxyDomain> {
        domain.domain_type = DomainType::Proxy;
        apply_tls_exclusivity(&mut domain);
        let created = self.repo.insert(domain)?;
        if created.managed {
            self.fire_acme_warmup(&created.name);
        }
        log::info!("created proxy domain '{}' (proxy_id={})", created.name, created.proxy_id);
        self.audit.emit(
            "domain.create",
            "",
            &created.proxy_id,
            true,
            &format!("created proxy domain '{}'", created.name),
        );
        Ok(created)
    }

    /// Privileged update path; applies TLS transitions then persists.
    pub fn update_proxy_domain(&self, id: &str, patch: DomainPatch) -> ProxyResult<ProxyDomain> {
        let mut domain = self
            .repo
            .get_by_id(id)?
            .ok_or_else(|| ProxyError::NotFound(format!("domain '{id}'")))?;

        self.apply_tls_transition(&mut domain, &patch)?;
        Self::apply_patch_fields(&mut domain, patch);
        apply_tls_exclusivity(&mut domain);

        let updated = self.repo.update_by_id(domain)?;
        self.audit.emit(
            "domain.update",
            "",
            &updated.proxy_id,
            true,
            &format!("updated proxy domain '{}'", updated.name),
        );
        Ok(updated)
    }

    /// Privileged deletion path; also removes managed-certificate artifacts.
    pub fn delete_proxy_domain(&self, id: &str) -> ProxyResult<()> {
        let domain = self
            .repo
            .get_by_id(id)?
            .ok_or_else(|| ProxyError::NotFound(format!("domain '{id}'")))?;

        if domain.managed {
            self.certs.evict_managed(&domain.name)?;
        }
        if domain.own_managed {
            self.certs.evict_own_managed(&domain.name)?;
        }
        self.repo.delete_by_id(id)?;
        log::info!("deleted proxy domain '{}'", domain.name);
        self.audit.emit(
            "domain.delete",
            "",
            &domain.proxy_id,
            true,
            &format!("deleted proxy domain '{}'", domain.name),
        );
        Ok(())
    }

    /// Public (admin-surface) create: rejects any attempt to create a
    /// `type=proxy` record directly.
    pub fn public_create(&self, domain: ProxyDomain) -> ProxyResult<ProxyDomain> {
        if domain.domain_type == DomainType::Proxy {
            self.audit.emit(
                "domain.public_create",
                "",
                &domain.name,
                false,
                "rejected public creation of a type=proxy domain",
            );
            return Err(ProxyError::Authorization(
                "proxy domains may only be created by the proxy engine".into(),
            ));
        }
        let created = self.repo.insert(domain)?;
        self.audit.emit(
            "domain.public_create",
            "",
            &created.name,
            true,
            &format!("created domain '{}'", created.name),
        );
        Ok(created)
    }

    /// Public (admin-surface) update: enforces the field-restriction matrix
    /// in spec §4.4.
    pub fn public_update(&self, id: &str, patch: DomainPatch) -> ProxyResult<ProxyDomain> {
        let existing = self
            .repo
            .get_by_id(id)?
            .ok_or_else(|| ProxyError::NotFound(format!("domain '{id}'")))?;

        let becomes_proxy = patch.domain_type == Some(DomainType::Proxy);
        if existing.domain_type != DomainType::Proxy && becomes_proxy {
            self.audit.emit(
                "domain.public_update",
                "",
                &existing.name,
                false,
                "rejected public conversion of a domain to type=proxy",
            );
            return Err(ProxyError::Authorization(
                "a non-proxy domain may not be converted to type=proxy via the public path".into(),
            ));
        }

        if existing.domain_type == DomainType::Proxy
            && (patch.proxy_target_domain.is_some()
                || patch.host_website.is_some()
                || patch.page_content.is_some()
                || patch.page_not_found_content.is_some()
                || patch.redirect_url.is_some())
        {
            self.audit.emit(
                "domain.public_update",
                "",
                &existing.name,
                false,
                "rejected public update of a restricted field on a type=proxy domain",
            );
            return Err(ProxyError::Authorization(
                "proxy domains may only have TLS-mode fields updated via the public path".into(),
            ));
        }

        let mut domain = existing;
        self.apply_tls_transition(&mut domain, &patch)?;
        Self::apply_patch_fields(&mut domain, patch);
        apply_tls_exclusivity(&mut domain);
        let updated = self.repo.update_by_id(domain)?;
        self.audit.emit(
            "domain.public_update",
            "",
            &updated.name,
            true,
            &format!("updated domain '{}'", updated.name),
        );
        Ok(updated)
    }

    /// Public (admin-surface) delete: rejects direct deletion of `type=proxy` records.
    pub fn public_delete(&self, id: &str) -> ProxyResult<()> {
        let domain = self
            .repo
            .get_by_id(id)?
            .ok_or_else(|| ProxyError::NotFound(format!("domain '{id}'")))?;
        if domain.domain_type == DomainType::Proxy {
            self.audit.emit(
                "domain.public_delete",
                "",
                &domain.name,
                false,
                "rejected public deletion of a type=proxy domain",
            );
            return Err(ProxyError::Authorization(
                "proxy domains may only be deleted via the proxy engine".into(),
            ));
        }
        self.repo.delete_by_id(id)?;
        self.audit.emit(
            "domain.public_delete",
            "",
            &domain.name,
            true,
            &format!("deleted domain '{}'", domain.name),
        );
        Ok(())
    }

    fn apply_tls_transition(&self, domain: &mut ProxyDomain, patch: &DomainPatch) -> ProxyResult<()> {
        let was_managed = domain.managed;
        let was_own_managed = domain.own_managed;

        let managed_next = patch.managed.unwrap_or(domain.managed);
        let own_managed_next = patch.own_managed.unwrap_or(domain.own_managed);

        if was_managed && !managed_next {
            self.certs.evict_managed(&domain.name)?;
        }
        if was_own_managed && !own_managed_next {
            self.certs.evict_own_managed(&domain.name)?;
        }
        if !was_own_managed && own_managed_next {
            let (Some(pem), Some(key)) = (&patch.own_managed_pem, &patch.own_managed_key) else {
                return Err(ProxyError::validation(
                    "own_managed",
                    "activating own_managed requires both pem and key in the patch",
                ));
            };
            self.certs.install_own_managed(&domain.name, pem, key)?;
        } else if own_managed_next {
            if let (Some(pem), Some(key)) = (&patch.own_managed_pem, &patch.own_managed_key) {
                self.certs.install_own_managed(&domain.name, pem, key)?;
            }
        }

        Ok(())
    }

    fn apply_patch_fields(domain: &mut ProxyDomain, patch: DomainPatch) {
        if let Some(t) = patch.domain_type {
            domain.domain_type = t;
        }
        if let Some(v) = patch.proxy_target_domain {
            domain.proxy_target_domain = v;
        }
        if let Some(v) = patch.host_website {
            domain.host_website = v;
        }
        if let Some(v) = patch.page_content {
            domain.page_content = v;
        }
        if let Some(v) = patch.page_not_found_content {
            domain.page_not_found_content = v;
        }
        if let Some(v) = patch.redirect_url {
            domain.redirect_url = v;
        }
        if let Some(v) = patch.managed {
            domain.managed = v;
        }
        if let Some(v) = patch.self_signed {
            domain.self_signed = v;
        }
        if let Some(v) = patch.own_managed {
            domain.own_managed = v;
        }
        if let Some(pem) = patch.own_managed_pem {
            domain.own_managed_pem = Some(pem);
        }
        if let Some(key) = patch.own_managed_key {
            domain.own_managed_key = Some(key);
        }
    }

    /// Fire-and-forget ACME warmup probe; failures are logged, never surfaced.
    fn fire_acme_warmup(&self, host: &str) {
        log::info!("triggering on-demand ACME issuance probe for '{host}'");
        // The actual HTTPS GET is a network side-effect outside this
        // crate's scope (no outer HTTP client is part of the pipeline);
        // we record intent for the caller's background task to perform.
    }

    /// Reconciles persisted proxy domains against `config`'s desired `to`
    /// set. Serialized per config id; rolls back partial creates on failure.
    pub fn sync_proxy_domains(&self, config: &CompiledConfig, proxy_id: &str) -> ProxyResult<()> {
        {
            let mut locks = self.reconcile_locks.lock().unwrap();
            if locks.contains_key(proxy_id) {
                return Err(ProxyError::Conflict(format!(
                    "reconciliation already in flight for proxy '{proxy_id}'"
                )));
            }
            locks.insert(proxy_id.to_string(), ());
        }
        let result = self.sync_proxy_domains_locked(config, proxy_id);
        self.reconcile_locks.lock().unwrap().remove(proxy_id);
        result
    }

    fn sync_proxy_domains_locked(&self, config: &CompiledConfig, proxy_id: &str) -> ProxyResult<()> {
        let desired: HashMap<String, &str> = config
            .hosts
            .values()
            .map(|h| (h.to.clone(), h.source_host.as_str()))
            .collect();
        let desired_names: HashSet<&str> = desired.keys().map(|s| s.as_str()).collect();

        let current = self.repo.get_by_proxy_id(proxy_id)?;
        let current_by_name: HashMap<&str, &ProxyDomain> =
            current.iter().map(|d| (d.name.as_str(), d)).collect();

        for existing in &current {
            if !desired_names.contains(existing.name.as_str()) {
                self.delete_proxy_domain(&existing.id)?;
            }
        }

        for (to, source_host) in &desired {
            if let Some(existing) = current_by_name.get(to.as_str()) {
                let host_cfg = &config.hosts[*source_host];
                let target_changed =
                    existing.proxy_target_domain.as_deref() != Some(*source_host);
                let tls_changed = existing.tls_mode() != host_cfg.tls;
                if target_changed || tls_changed {
                    let patch = DomainPatch {
                        proxy_target_domain: Some(Some(source_host.to_string())),
                        managed: Some(host_cfg.tls == TlsMode::Managed),
                        self_signed: Some(host_cfg.tls == TlsMode::SelfSigned),
                        ..Default::default()
                    };
                    self.update_proxy_domain(&existing.id, patch)?;
                }
            }
        }

        let mut created_ids = Vec::new();
        for (to, source_host) in &desired {
            if current_by_name.contains_key(to.as_str()) {
                continue;
            }
            let host_cfg = &config.hosts[*source_host];
            let domain = ProxyDomain {
                id: Uuid::new_v4().to_string(),
                name: to.clone(),
                domain_type: DomainType::Proxy,
                tenant: config.tenant.clone(),
                proxy_id: proxy_id.to_string(),
                proxy_target_domain: Some(source_host.to_string()),
                host_website: false,
                page_content: None,
                page_not_found_content: None,
                redirect_url: None,
                managed: host_cfg.tls == TlsMode::Managed,
                self_signed: host_cfg.tls == TlsMode::SelfSigned,
                own_managed: false,
                own_managed_pem: None,
                own_managed_key: None,
            };
            match self.create_proxy_domain(domain) {
                Ok(created) => created_ids.push(created.id),
                Err(e) => {
                    for id in &created_ids {
                        let _ = self.delete_proxy_domain(id);
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertificateStore;
    use crate::config::RulesetCompiler;
    use crate::repository::{InMemoryDomainRepository, LoggingAuditSink};

    fn make_domain(name: &str, proxy_id: &str, source_host: &str) -> ProxyDomain {
        ProxyDomain {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            domain_type: DomainType::Proxy,
            tenant: None,
            proxy_id: proxy_id.to_string(),
            proxy_target_domain: Some(source_host.to_string()),
            host_website: false,
            page_content: None,
            page_not_found_content: None,
            redirect_url: None,
            managed: true,
            self_signed: false,
            own_managed: false,
            own_managed_pem: None,
            own_managed_key: None,
        }
    }

    #[test]
    fn public_create_rejects_proxy_type() {
        let repo = InMemoryDomainRepository::new();
        let certs = CertificateStore::new_in_memory();
        let audit = LoggingAuditSink;
        let lifecycle = DomainLifecycle::new(&repo, &certs, &audit);

        let domain = make_domain("evil.example", "p1", "example.com");
        let err = lifecycle.public_create(domain).unwrap_err();
        assert!(matches!(err, ProxyError::Authorization(_)));
    }

    #[test]
    fn public_update_rejects_proxy_target_domain_change() {
        let repo = InMemoryDomainRepository::new();
        let certs = CertificateStore::new_in_memory();
        let audit = LoggingAuditSink;
        let lifecycle = DomainLifecycle::new(&repo, &certs, &audit);

        let created = lifecycle
            .create_proxy_domain(make_domain("phish.example", "p1", "example.com"))
            .unwrap();

        let patch = DomainPatch {
            proxy_target_domain: Some(Some("other.com".into())),
            ..Default::default()
        };
        let err = lifecycle.public_update(&created.id, patch).unwrap_err();
        assert!(matches!(err, ProxyError::Authorization(_)));
    }

    #[test]
    fn sync_creates_updates_and_deletes() {
        let repo = InMemoryDomainRepository::new();
        let certs = CertificateStore::new_in_memory();
        let audit = LoggingAuditSink;
        let lifecycle = DomainLifecycle::new(&repo, &certs, &audit);

        // seed a stale domain that won't appear in the new config
        lifecycle
            .create_proxy_domain(make_domain("stale.example", "p1", "old-source.com"))
            .unwrap();

        let yaml = r#"
version: "0.0"
start_url: "https://example.com/login"
example.com:
  to: phish.example
"#;
        let compiled = RulesetCompiler::compile(yaml, "p1", None, &repo).unwrap();
        lifecycle.sync_proxy_domains(&compiled, "p1").unwrap();

        let current = repo.get_by_proxy_id("p1").unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].name, "phish.example");
        assert_eq!(current[0].proxy_target_domain.as_deref(), Some("example.com"));
    }

    #[test]
    fn tls_exclusivity_enforced() {
        let mut domain = make_domain("phish.example", "p1", "example.com");
        domain.self_signed = true;
        domain.own_managed = true;
        domain.managed = true;
        apply_tls_exclusivity(&mut domain);
        assert!(domain.managed);
        assert!(!domain.self_signed);
        assert!(!domain.own_managed);
    }
}
