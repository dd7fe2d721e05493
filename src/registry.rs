//! Global phishing-host → compiled-config registry.
//!
//! Grounded in `proxy/ssl.rs`'s `Lazy<DashMap<..>>` + reload-by-retain
//! pattern: each config apply replaces every entry it previously owned in
//! one pass, the same way the teacher's `MapOperations::reload_resources`
//! replaces a resource set keyed by id.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::config::{CompiledConfig, CompiledHostConfig};

#[derive(Clone)]
pub struct RegisteredHost {
    pub host_config: Arc<CompiledHostConfig>,
    pub config: Arc<CompiledConfig>,
    pub proxy_id: String,
}

static HOST_MAP: Lazy<DashMap<String, RegisteredHost>> = Lazy::new(DashMap::new);
static CONFIG_MAP: Lazy<DashMap<String, Arc<CompiledConfig>>> = Lazy::new(DashMap::new);

/// Looks up the compiled host config for an inbound phishing host (`to`).
pub fn lookup(to: &str) -> Option<RegisteredHost> {
    HOST_MAP.get(to).map(|entry| entry.clone())
}

/// Registers (or re-registers) a compiled config under `proxy_id`, replacing
/// whatever hosts that proxy previously owned.
pub fn register_config(config: Arc<CompiledConfig>, proxy_id: String) {
    HOST_MAP.retain(|_, v| v.proxy_id != proxy_id);
    for host_config in config.hosts.values() {
        HOST_MAP.insert(
            host_config.to.clone(),
            RegisteredHost {
                host_config: Arc::new(host_config.clone()),
                config: config.clone(),
                proxy_id: proxy_id.clone(),
            },
        );
    }
    log::info!("registered {} host(s) for proxy '{proxy_id}'", config.hosts.len());
    CONFIG_MAP.insert(proxy_id, config);
}

pub fn remove_config(proxy_id: &str) {
    HOST_MAP.retain(|_, v| v.proxy_id != proxy_id);
    CONFIG_MAP.remove(proxy_id);
    log::info!("removed proxy '{proxy_id}' from the registry");
}

pub fn get_config(proxy_id: &str) -> Option<Arc<CompiledConfig>> {
    CONFIG_MAP.get(proxy_id).map(|v| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryDomainRepository;
    use crate::config::RulesetCompiler;

    fn compile(yaml: &str, name: &str) -> Arc<CompiledConfig> {
        let repo = InMemoryDomainRepository::new();
        Arc::new(RulesetCompiler::compile(yaml, name, None, &repo).unwrap())
    }

    #[test]
    fn register_then_lookup() {
        let yaml = r#"
version: "0.0"
example.com:
  to: phish.example
"#;
        let cfg = compile(yaml, "reg-test-1");
        register_config(cfg, "reg-test-1".into());
        let found = lookup("phish.example").unwrap();
        assert_eq!(found.host_config.source_host, "example.com");
        remove_config("reg-test-1");
        assert!(lookup("phish.example").is_none());
    }

    #[test]
    fn re_register_drops_stale_hosts() {
        let yaml_a = r#"
version: "0.0"
a.com:
  to: pa.example
"#;
        let yaml_b = r#"
version: "0.0"
b.com:
  to: pb.example
"#;
        register_config(compile(yaml_a, "reg-test-2"), "reg-test-2".into());
        register_config(compile(yaml_b, "reg-test-2"), "reg-test-2".into());
        assert!(lookup("pa.example").is_none());
        assert!(lookup("pb.example").is_some());
        remove_config("reg-test-2");
    }
}
