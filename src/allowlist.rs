//! AllowList (spec §4.3): a concurrent key→expiry map gating private-mode
//! access, with a background sweep grounded in pingora's
//! `BackgroundService`/`background_service()` pattern (the same shutdown-aware
//! task shape the teacher uses for health checks).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use uuid::Uuid;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Concurrent key → UNIX expiry-seconds map; key is `"{ip}-{cfg_id}"`.
#[derive(Default)]
pub struct AllowList {
    entries: DashMap<String, i64>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ip: &str, cfg_id: &str) -> String {
        format!("{ip}-{cfg_id}")
    }

    pub fn add(&self, ip: &str, cfg_id: &str, ttl: Duration) {
        let expiry = now_unix() + ttl.as_secs() as i64;
        self.entries.insert(Self::key(ip, cfg_id), expiry);
    }

    /// Returns true iff an unexpired entry exists; expired entries are
    /// removed cooperatively on read.
    pub fn is_allowed(&self, ip: &str, cfg_id: &str) -> bool {
        let key = Self::key(ip, cfg_id);
        let Some(entry) = self.entries.get(&key) else {
            return false;
        };
        let expiry = *entry;
        drop(entry);
        if expiry <= now_unix() {
            self.entries.remove(&key);
            false
        } else {
            true
        }
    }

    /// Iterates and deletes every entry whose expiry has passed.
    pub fn clear_expired(&self) {
        let now = now_unix();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
        }
    }

    /// Deletes every key whose scanned-from-the-right UUID suffix equals `cfg_id`.
    ///
    /// Keys hold IPv6 addresses containing `-` in the host portion, so the
    /// config-id boundary is found by scanning right-to-left for a `-`
    /// followed by exactly 36 characters that parse as a UUID.
    pub fn clear_for_config(&self, cfg_id: &str) {
        let to_delete: Vec<String> = self
            .entries
            .iter()
            .filter(|e| Self::parse_cfg_id(e.key()).as_deref() == Some(cfg_id))
            .map(|e| e.key().clone())
            .collect();
        for key in to_delete {
            self.entries.remove(&key);
        }
    }

    /// Parses the trailing `-{uuid}` suffix off `key`, scanning right-to-left.
    fn parse_cfg_id(key: &str) -> Option<String> {
        let bytes = key.as_bytes();
        for (i, b) in bytes.iter().enumerate().rev() {
            if *b == b'-' {
                let candidate = &key[i + 1..];
                if candidate.len() == 36 && Uuid::parse_str(candidate).is_ok() {
                    return Some(candidate.to_string());
                }
            }
        }
        None
    }

    /// Logical `created_at` for an entry, assuming the default TTL (spec §9
    /// open question b: persist explicitly if variable TTLs are introduced).
    pub fn created_at(&self, ip: &str, cfg_id: &str) -> Option<i64> {
        self.entries
            .get(&Self::key(ip, cfg_id))
            .map(|e| *e - DEFAULT_TTL.as_secs() as i64)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background sweep task; cancellable via the shutdown watch pingora's
/// service runner provides to every `BackgroundService`.
pub struct AllowListSweeper {
    pub allow_list: Arc<AllowList>,
    pub interval: Duration,
}

impl AllowListSweeper {
    pub fn new(allow_list: Arc<AllowList>) -> Self {
        Self {
            allow_list,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[async_trait]
impl BackgroundService for AllowListSweeper {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.allow_list.clear_expired();
                    log::debug!("allow-list sweep completed, {} entries remain", self.allow_list.len());
                }
                _ = shutdown.changed() => {
                    log::info!("allow-list sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_is_allowed() {
        let list = AllowList::new();
        list.add("1.2.3.4", "cfg1", Duration::from_secs(60));
        assert!(list.is_allowed("1.2.3.4", "cfg1"));
        assert!(!list.is_allowed("1.2.3.4", "cfg2"));
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let list = AllowList::new();
        list.add("1.2.3.4", "cfg1", Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!list.is_allowed("1.2.3.4", "cfg1"));
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn clear_for_config_parses_uuid_suffix() {
        let list = AllowList::new();
        let cfg_id = Uuid::new_v4().to_string();
        list.add("::1", &cfg_id, Duration::from_secs(60));
        list.add("1.2.3.4", "other-cfg", Duration::from_secs(60));
        list.clear_for_config(&cfg_id);
        assert!(!list.is_allowed("::1", &cfg_id));
        assert!(list.is_allowed("1.2.3.4", "other-cfg"));
    }

    #[test]
    fn clear_expired_sweeps_all_stale_entries() {
        let list = AllowList::new();
        list.add("1.1.1.1", "cfg1", Duration::from_secs(0));
        list.add("2.2.2.2", "cfg2", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(1100));
        list.clear_expired();
        assert_eq!(list.len(), 1);
    }
}
