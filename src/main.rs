//! Bootstraps the reverse-proxy engine: compiles the ruleset, reconciles
//! proxy domains, and wires the request pipeline into a pingora server.

#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora::services::background::background_service;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::{Opt, ServerConf};
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use phish_proxy::allowlist::{AllowList, AllowListSweeper};
use phish_proxy::cert::{CertificateStore, DynamicCert};
use phish_proxy::config::RulesetCompiler;
use phish_proxy::domain::DomainLifecycle;
use phish_proxy::pipeline::ProxyPipeline;
use phish_proxy::registry;
use phish_proxy::repository::{InMemoryDomainRepository, LoggingAuditSink};
use phish_proxy::session::SessionManager;

const SERVICE_NAME: &str = "phish-proxy";

fn main() {
    phish_proxy::logging::init_env_logger();

    let opt = Opt::parse_args();
    let server_conf =
        ServerConf::new_with_opt_override(&opt).expect("failed to build server configuration");

    let proxy_id = std::env::var("PHISH_PROXY_ID").unwrap_or_else(|_| "default".to_string());
    let ruleset_path =
        std::env::var("PHISH_PROXY_RULESET").unwrap_or_else(|_| "ruleset.yaml".to_string());
    let ruleset_yaml = std::fs::read_to_string(&ruleset_path)
        .unwrap_or_else(|e| panic!("failed to read ruleset file '{ruleset_path}': {e}"));

    // Storage, the file store, and the ACME cache are external to this core
    // (spec §6); the in-memory repository and a cache-less certificate store
    // stand in as the bootstrap default until a real persistence layer is wired in.
    let repo = InMemoryDomainRepository::new();
    let certs = CertificateStore::new_in_memory();
    let audit: Arc<dyn phish_proxy::repository::AuditSink> = Arc::new(LoggingAuditSink);

    log::info!("compiling ruleset '{ruleset_path}' for proxy '{proxy_id}'...");
    let compiled = RulesetCompiler::compile(&ruleset_yaml, &proxy_id, None, &repo)
        .unwrap_or_else(|e| panic!("failed to compile ruleset '{ruleset_path}': {e}"));

    log::info!("reconciling proxy domains...");
    let lifecycle = DomainLifecycle::new(&repo, &certs, audit.as_ref());
    lifecycle
        .sync_proxy_domains(&compiled, &proxy_id)
        .unwrap_or_else(|e| panic!("failed to reconcile proxy domains: {e}"));

    let certs = Arc::new(certs);
    let compiled = Arc::new(compiled);
    registry::register_config(compiled, proxy_id);

    let sessions = Arc::new(SessionManager::new());
    let allow_list = Arc::new(AllowList::new());

    let mut server = Server::new_with_opt_and_conf(Some(opt), server_conf);

    log::info!("adding allow-list sweeper...");
    let sweeper = background_service(
        "allow-list sweeper",
        AllowListSweeper::new(allow_list.clone()),
    );
    server.add_service(sweeper);

    let pipeline = ProxyPipeline::new(sessions, allow_list, audit);
    let mut http_service =
        http_proxy_service_with_name(&server.configuration, pipeline, SERVICE_NAME);

    let listen_addr =
        std::env::var("PHISH_PROXY_LISTEN").unwrap_or_else(|_| "0.0.0.0:443".to_string());
    let default_cert = certs
        .present("*")
        .expect("failed to mint default self-signed certificate");
    let dynamic_cert = DynamicCert::new(certs, default_cert);
    let mut tls_settings =
        TlsSettings::with_callbacks(dynamic_cert).expect("TLS callback setup shouldn't fail");
    tls_settings.enable_h2();
    http_service.add_tls_with_settings(&listen_addr, None, tls_settings);

    log::info!("bootstrapping...");
    server.bootstrap();

    log::info!("adding services...");
    server.add_service(http_service);

    log::info!("starting server on {listen_addr}...");
    server.run_forever();
}
