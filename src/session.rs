//! SessionManager and ProxySession (spec §4.2).
//!
//! Concurrent maps keyed by string, grounded in the teacher's `DashMap`
//! global-registry idiom (`proxy/ssl.rs`'s `SSL_MAP`, `proxy/route.rs`'s
//! route tables). Per-session atomic flags avoid a per-session lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::CompiledHostConfig;

/// Value captured by a capture rule: `rule_name -> field -> value`.
pub type CapturedData = HashMap<String, HashMap<String, String>>;

pub struct ProxySession {
    pub id: String,
    pub campaign_id: Option<String>,
    pub recipient_id: Option<String>,
    pub campaign_recipient_id: Option<String>,
    pub domain_name: String,
    pub proxy_id: String,
    pub resolved_target_host: String,
    pub host_config: Arc<CompiledHostConfig>,
    pub created_at: Instant,
    pub required_captures: Mutex<HashSet<String>>,
    pub captured: Mutex<CapturedData>,
    pub next_page_type: Mutex<String>,
    pub is_complete: AtomicBool,
    pub cookie_bundle_submitted: AtomicBool,
}

impl ProxySession {
    pub fn new(
        id: String,
        domain_name: String,
        proxy_id: String,
        resolved_target_host: String,
        host_config: Arc<CompiledHostConfig>,
    ) -> Self {
        let required_captures = host_config
            .ruleset
            .capture
            .iter()
            .filter(|c| c.required)
            .map(|c| c.name.clone())
            .collect();
        Self {
            id,
            campaign_id: None,
            recipient_id: None,
            campaign_recipient_id: None,
            domain_name,
            proxy_id,
            resolved_target_host,
            host_config,
            created_at: Instant::now(),
            required_captures: Mutex::new(required_captures),
            captured: Mutex::new(HashMap::new()),
            next_page_type: Mutex::new(String::new()),
            is_complete: AtomicBool::new(false),
            cookie_bundle_submitted: AtomicBool::new(false),
        }
    }

    /// Records `value` under `rule_name`/`field`; clears the rule from the
    /// required-capture set and flips `is_complete` when it empties.
    pub fn record_capture(&self, rule_name: &str, field: &str, value: String) {
        {
            let mut captured = self.captured.lock().unwrap();
            captured
                .entry(rule_name.to_string())
                .or_default()
                .insert(field.to_string(), value);
        }
        let became_empty = {
            let mut required = self.required_captures.lock().unwrap();
            required.remove(rule_name);
            required.is_empty()
        };
        if became_empty {
            self.is_complete.store(true, Ordering::SeqCst);
        }
    }

    pub fn set_next_page_type(&self, page_type: impl Into<String>) {
        *self.next_page_type.lock().unwrap() = page_type.into();
    }
}

/// Concurrent session store plus the recipient back-index and the unbounded
/// URL-rewrite memo (spec §4.2, open question 9a: sizing left to the caller).
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<ProxySession>>,
    recipient_index: DashMap<String, String>,
    url_mappings: DashMap<String, String>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ProxySession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn store(&self, session_id: String, session: Arc<ProxySession>) {
        self.sessions.insert(session_id, session);
    }

    /// Removes the session and, if present, its recipient back-mapping.
    pub fn delete(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            if let Some(recipient) = &session.campaign_recipient_id {
                self.recipient_index.remove(recipient);
            }
        }
    }

    pub fn get_by_recipient(&self, campaign_recipient_id: &str) -> Option<String> {
        self.recipient_index
            .get(campaign_recipient_id)
            .map(|id| id.clone())
    }

    pub fn store_recipient_mapping(&self, campaign_recipient_id: String, session_id: String) {
        self.recipient_index.insert(campaign_recipient_id, session_id);
    }

    pub fn store_url_mapping(&self, rewritten: String, original: String) {
        self.url_mappings.insert(rewritten, original);
    }

    pub fn get_url_mapping(&self, rewritten: &str) -> Option<String> {
        self.url_mappings.get(rewritten).map(|v| v.clone())
    }

    /// Snapshot-insensitive iteration: concurrent insertions during the call
    /// may or may not be observed.
    pub fn range(&self, mut f: impl FnMut(&str, &Arc<ProxySession>)) {
        for entry in self.sessions.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn clear_for_proxy(&self, proxy_id: &str) {
        let to_delete: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().proxy_id == proxy_id)
            .map(|e| e.key().clone())
            .collect();
        for id in to_delete {
            self.delete(&id);
        }
    }

    pub fn clear_for_domains(&self, names: &HashSet<String>) {
        let to_delete: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| names.contains(&e.value().domain_name))
            .map(|e| e.key().clone())
            .collect();
        for id in to_delete {
            self.delete(&id);
        }
    }

    pub fn cleanup_expired(&self, max_age: Duration) {
        let now = Instant::now();
        let to_delete: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| now.duration_since(e.value().created_at) > max_age)
            .map(|e| e.key().clone())
            .collect();
        for id in to_delete {
            self.delete(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessControl, AccessMode, CompiledRuleset, HostScheme, OnDeny, TlsMode};

    fn host_config() -> Arc<CompiledHostConfig> {
        Arc::new(CompiledHostConfig {
            source_host: "example.com".into(),
            to: "phish.example".into(),
            scheme: HostScheme::Https,
            tls: TlsMode::Managed,
            access: AccessControl {
                mode: AccessMode::Private,
                on_deny: OnDeny::Status(404),
            },
            ruleset: CompiledRuleset::default(),
        })
    }

    #[test]
    fn delete_removes_recipient_mapping() {
        let mgr = SessionManager::new();
        let mut session = ProxySession::new(
            "s1".into(),
            "phish.example".into(),
            "p1".into(),
            "example.com".into(),
            host_config(),
        );
        session.campaign_recipient_id = Some("r1".into());
        let session = Arc::new(session);
        mgr.store("s1".into(), session);
        mgr.store_recipient_mapping("r1".into(), "s1".into());

        mgr.delete("s1");
        assert!(mgr.get("s1").is_none());
        assert!(mgr.get_by_recipient("r1").is_none());
    }

    #[test]
    fn required_capture_completion_flips_is_complete() {
        let mut host = (*host_config()).clone();
        host.ruleset.capture.push(crate::config::CompiledCapture {
            name: "user".into(),
            method: None,
            path: None,
            find: vec![],
            engine: crate::config::CaptureEngine::Regex,
            from: crate::config::CaptureFrom::Any,
            required: true,
            is_navigation_marker: false,
        });
        let session = ProxySession::new(
            "s1".into(),
            "phish.example".into(),
            "p1".into(),
            "example.com".into(),
            Arc::new(host),
        );
        assert!(!session.is_complete.load(Ordering::SeqCst));
        session.record_capture("user", "value", "alice".into());
        assert!(session.is_complete.load(Ordering::SeqCst));
    }

    #[test]
    fn clear_for_proxy_only_removes_matching_sessions() {
        let mgr = SessionManager::new();
        mgr.store(
            "s1".into(),
            Arc::new(ProxySession::new(
                "s1".into(),
                "phish.example".into(),
                "p1".into(),
                "example.com".into(),
                host_config(),
            )),
        );
        mgr.store(
            "s2".into(),
            Arc::new(ProxySession::new(
                "s2".into(),
                "other.example".into(),
                "p2".into(),
                "other.com".into(),
                host_config(),
            )),
        );
        mgr.clear_for_proxy("p1");
        assert!(mgr.get("s1").is_none());
        assert!(mgr.get("s2").is_some());
    }
}
