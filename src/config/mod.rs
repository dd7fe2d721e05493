//! Proxy configuration compiler (spec §4.1).
//!
//! Parses a YAML policy document into a compiled, defaulted,
//! regex-populated ruleset suitable for zero-allocation per-request
//! lookup. Grounded in the teacher's `config::Config::from_yaml` /
//! `load_from_yaml` pipeline (fs read -> serde_yaml -> validator ->
//! cross-field checks), but re-targeted at spec §3's schema.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ProxyError, ProxyResult};
use crate::repository::DomainRepository;

/// A field that accepts either a single string or a list of strings (spec §9).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn as_slice(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(s) => vec![s.as_str()],
            OneOrMany::Many(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

// ---------------------------------------------------------------------
// Raw (as-parsed) document shape
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawRuleset {
    #[serde(default)]
    pub tls: Option<RawTls>,
    #[serde(default)]
    pub access: Option<RawAccess>,
    #[serde(default)]
    pub capture: Vec<RawCapture>,
    #[serde(default)]
    pub rewrite: Vec<RawRewrite>,
    #[serde(default)]
    pub response: Vec<RawResponse>,
    #[serde(default)]
    pub rewrite_urls: Vec<RawUrlRewrite>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
pub struct RawHostConfig {
    #[validate(length(min = 1, message = "phishing host ('to') must not be empty"))]
    pub to: String,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub tls: Option<RawTls>,
    #[serde(default)]
    pub access: Option<RawAccess>,
    #[serde(default)]
    pub capture: Vec<RawCapture>,
    #[serde(default)]
    pub rewrite: Vec<RawRewrite>,
    #[serde(default)]
    pub response: Vec<RawResponse>,
    #[serde(default)]
    pub rewrite_urls: Vec<RawUrlRewrite>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawTls {
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawAccess {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub on_deny: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawCapture {
    pub name: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub find: Option<OneOrMany>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawRewrite {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub find: Option<String>,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Attribute name for the `setAttr`/`removeAttr` dom actions.
    #[serde(default)]
    pub attr: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawUrlRewrite {
    pub find: String,
    #[serde(default)]
    pub replace: String,
    #[serde(default)]
    pub query: Vec<QueryRename>,
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueryRename {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawResponse {
    pub path: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub forward: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawDocument {
    pub version: String,
    /// Optional upstream forward-proxy URL (spec §6), e.g. `"https://fwd.example:8080"`.
    #[serde(default)]
    pub proxy: Option<String>,
    /// The campaign's starting URL; identifies the source host the lure
    /// begins on. Defaults to the lexicographically first mapped host
    /// when omitted (spec §3).
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub global: RawRuleset,
    #[serde(flatten)]
    pub hosts: HashMap<String, RawHostConfig>,
}

// ---------------------------------------------------------------------
// Compiled (validated, defaulted, regex-populated) shape
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Managed,
    SelfSigned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Public,
    Private,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OnDeny {
    Allow,
    Status(u16),
    Redirect(String),
}

#[derive(Clone, Debug)]
pub struct AccessControl {
    pub mode: AccessMode,
    pub on_deny: OnDeny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureEngine {
    Regex,
    Header,
    Cookie,
    Json,
    Form,
    Urlencoded,
    Formdata,
    Multipart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureFrom {
    RequestBody,
    RequestHeader,
    ResponseBody,
    ResponseHeader,
    Cookie,
    Any,
}

#[derive(Clone, Debug)]
pub struct CompiledCapture {
    pub name: String,
    pub method: Option<String>,
    pub path: Option<Arc<Regex>>,
    pub find: Vec<String>,
    pub engine: CaptureEngine,
    pub from: CaptureFrom,
    pub required: bool,
    /// A capture with a path and no `find` only records the visit (spec §3).
    pub is_navigation_marker: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewriteEngine {
    Regex,
    Dom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewriteFrom {
    RequestBody,
    RequestHeader,
    ResponseBody,
    ResponseHeader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomAction {
    SetText,
    SetHtml,
    SetAttr,
    RemoveAttr,
    AddClass,
    RemoveClass,
    Remove,
}

#[derive(Clone, Debug)]
pub enum DomTarget {
    First,
    Last,
    All,
    Indices(Vec<usize>),
    Range(usize, usize),
}

#[derive(Clone, Debug)]
pub struct CompiledRewrite {
    pub engine: RewriteEngine,
    pub from: RewriteFrom,
    // regex engine
    pub find_regex: Option<Arc<Regex>>,
    pub replace: String,
    // dom engine
    pub selector: Option<String>,
    pub action: Option<DomAction>,
    pub target: DomTarget,
    pub attr: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CompiledUrlRewrite {
    pub find: Arc<Regex>,
    pub replace: String,
    pub query: Vec<QueryRename>,
    pub filter: HashSet<String>,
}

#[derive(Clone, Debug)]
pub struct CompiledResponse {
    pub path: Arc<Regex>,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub forward: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CompiledRuleset {
    pub capture: Vec<CompiledCapture>,
    pub rewrite: Vec<CompiledRewrite>,
    pub response: Vec<CompiledResponse>,
    pub rewrite_urls: Vec<CompiledUrlRewrite>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamProxyScheme {
    Http,
    Https,
    Socks5,
}

#[derive(Clone, Debug)]
pub struct UpstreamProxyConfig {
    pub scheme: UpstreamProxyScheme,
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostScheme {
    Http,
    Https,
}

#[derive(Clone, Debug)]
pub struct CompiledHostConfig {
    pub source_host: String,
    pub to: String,
    pub scheme: HostScheme,
    pub tls: TlsMode,
    pub access: AccessControl,
    pub ruleset: CompiledRuleset,
}

#[derive(Clone, Debug)]
pub struct CompiledConfig {
    pub name: String,
    pub tenant: Option<String>,
    pub start_url: String,
    pub start_host: String,
    pub upstream_proxy: Option<UpstreamProxyConfig>,
    pub hosts: HashMap<String, CompiledHostConfig>,
}

impl CompiledConfig {
    pub fn required_capture_names(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for host in self.hosts.values() {
            for c in &host.ruleset.capture {
                if c.required {
                    out.insert(c.name.clone());
                }
            }
        }
        out
    }
}

/// Compiles a named YAML policy document into an executable ruleset.
pub struct RulesetCompiler;

impl RulesetCompiler {
    /// Parses, validates, defaults, and compiles `yaml` into a `CompiledConfig`.
    ///
    /// `name` and `tenant` identify the owning proxy config (used for the
    /// `to`-collision check against persisted domains); `repo` is the
    /// domain repository contract (spec §6).
    pub fn compile(
        yaml: &str,
        name: &str,
        tenant: Option<&str>,
        repo: &dyn DomainRepository,
    ) -> ProxyResult<CompiledConfig> {
        let doc: RawDocument = serde_yaml::from_str(yaml)
            .map_err(|e| ProxyError::validation("yaml", format!("failed to parse: {e}")))?;

        if doc.version != "0.0" {
            return Err(ProxyError::validation(
                "version",
                format!("unsupported version '{}', expected \"0.0\"", doc.version),
            ));
        }

        let upstream_proxy = Self::validate_upstream_proxy(doc.proxy.as_deref())?;

        if doc.hosts.is_empty() {
            return Err(ProxyError::validation(
                "hosts",
                "at least one host mapping is required",
            ));
        }

        // Capture-name uniqueness across global + all hosts (spec invariant #1 / S4).
        let mut seen_names: HashSet<String> = HashSet::new();
        for c in doc.global.capture.iter().chain(
            doc.hosts
                .values()
                .flat_map(|h| h.capture.iter()),
        ) {
            if !seen_names.insert(c.name.clone()) {
                return Err(ProxyError::validation(
                    "proxyConfig",
                    format!("duplicate capture name '{}'", c.name),
                ));
            }
        }

        // Start-URL host must be a mapped source host (spec invariant #3 / S3).
        // `start_url` is its own top-level key, distinct from `proxy` (the
        // optional upstream forward-proxy); when omitted, the fallback must
        // be deterministic, so it's the lexicographically first host key
        // rather than arbitrary `HashMap` iteration order.
        let start_url = doc.start_url.clone().unwrap_or_else(|| {
            let mut keys: Vec<&String> = doc.hosts.keys().collect();
            keys.sort();
            keys.first().map(|s| s.to_string()).unwrap_or_default()
        });
        let start_host = Self::extract_host(&start_url);
        if !doc.hosts.contains_key(&start_host) {
            return Err(ProxyError::validation(
                "proxyConfig",
                format!("start url host '{start_host}' is not a mapped source host"),
            ));
        }

        let global_ruleset = Self::compile_ruleset(&doc.global, "global")?;

        let mut hosts = HashMap::new();
        for (source_host, raw_host) in doc.hosts.iter() {
            raw_host.validate().map_err(|e| {
                ProxyError::validation(format!("hosts.{source_host}"), e.to_string())
            })?;

            Self::check_to_collision(&raw_host.to, name, &start_host, repo)?;

            let scheme = match raw_host.scheme.as_deref().unwrap_or("https") {
                "http" => HostScheme::Http,
                "https" => HostScheme::Https,
                other => {
                    return Err(ProxyError::validation(
                        format!("hosts.{source_host}.scheme"),
                        format!("scheme must be http or https, got '{other}'"),
                    ))
                }
            };

            let tls = Self::compile_tls(raw_host.tls.as_ref())?;
            let access = Self::compile_access(raw_host.access.as_ref())?;
            let host_ruleset = Self::compile_ruleset_from_host(raw_host, source_host)?;

            let ruleset = CompiledRuleset {
                capture: global_ruleset
                    .capture
                    .iter()
                    .cloned()
                    .chain(host_ruleset.capture)
                    .collect(),
                rewrite: global_ruleset
                    .rewrite
                    .iter()
                    .cloned()
                    .chain(host_ruleset.rewrite)
                    .collect(),
                response: global_ruleset
                    .response
                    .iter()
                    .cloned()
                    .chain(host_ruleset.response)
                    .collect(),
                rewrite_urls: global_ruleset
                    .rewrite_urls
                    .iter()
                    .cloned()
                    .chain(host_ruleset.rewrite_urls)
                    .collect(),
            };

            hosts.insert(
                source_host.clone(),
                CompiledHostConfig {
                    source_host: source_host.clone(),
                    to: raw_host.to.clone(),
                    scheme,
                    tls,
                    access,
                    ruleset,
                },
            );
        }

        Ok(CompiledConfig {
            name: name.to_string(),
            tenant: tenant.map(|s| s.to_string()),
            start_url,
            start_host,
            upstream_proxy,
            hosts,
        })
    }

    /// Host extraction per spec §4.1 step 5: split on `://` else on first `/` else whole string.
    fn extract_host(start_url: &str) -> String {
        let without_scheme = start_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(start_url);
        without_scheme
            .split_once('/')
            .map(|(host, _)| host)
            .unwrap_or(without_scheme)
            .to_string()
    }

    fn validate_upstream_proxy(proxy: Option<&str>) -> ProxyResult<Option<UpstreamProxyConfig>> {
        let Some(proxy) = proxy else { return Ok(None) };
        if !proxy.contains("://") {
            return Ok(None);
        }
        let scheme = proxy
            .split_once("://")
            .map(|(s, _)| s)
            .unwrap_or_default();
        let scheme = match scheme {
            "http" => UpstreamProxyScheme::Http,
            "https" => UpstreamProxyScheme::Https,
            "socks5" => UpstreamProxyScheme::Socks5,
            "socks4" => {
                return Err(ProxyError::validation(
                    "upstream_proxy",
                    "socks4 is not supported",
                ))
            }
            other => {
                return Err(ProxyError::validation(
                    "upstream_proxy",
                    format!("unsupported scheme '{other}'"),
                ))
            }
        };
        Ok(Some(UpstreamProxyConfig {
            scheme,
            url: proxy.to_string(),
        }))
    }

    /// Collision check per spec §3: a `to` may not collide with a non-proxy
    /// domain; it may be reused only by the same proxy.
    fn check_to_collision(
        to: &str,
        config_name: &str,
        start_host: &str,
        repo: &dyn DomainRepository,
    ) -> ProxyResult<()> {
        let Some(existing) = repo
            .get_by_name(to)
            .map_err(|e| ProxyError::Fatal(e.to_string()))?
        else {
            return Ok(());
        };
        if existing.domain_type != crate::domain::DomainType::Proxy {
            return Err(ProxyError::Conflict(format!(
                "'{to}' is already bound to a non-proxy domain"
            )));
        }
        if existing.proxy_target_domain.as_deref() != Some(start_host) {
            return Err(ProxyError::Conflict(format!(
                "'{to}' is already bound to another proxy config (requested by '{config_name}')"
            )));
        }
        Ok(())
    }

    fn compile_tls(raw: Option<&RawTls>) -> ProxyResult<TlsMode> {
        match raw.and_then(|t| t.mode.as_deref()).unwrap_or("managed") {
            "managed" => Ok(TlsMode::Managed),
            "self-signed" => Ok(TlsMode::SelfSigned),
            other => Err(ProxyError::validation(
                "tls.mode",
                format!("unknown TLS mode '{other}'"),
            )),
        }
    }

    fn compile_access(raw: Option<&RawAccess>) -> ProxyResult<AccessControl> {
        let mode = match raw.and_then(|a| a.mode.as_deref()).unwrap_or("private") {
            "public" => AccessMode::Public,
            "private" => AccessMode::Private,
            other => {
                return Err(ProxyError::validation(
                    "access.mode",
                    format!("unknown access mode '{other}'"),
                ))
            }
        };
        let on_deny_str = raw
            .and_then(|a| a.on_deny.as_deref())
            .unwrap_or("404")
            .to_string();
        let on_deny = Self::parse_on_deny(&on_deny_str)?;
        Ok(AccessControl { mode, on_deny })
    }

    /// Accepts `"allow"`, bare integer 100..599, bare `http(s)://URL`
    /// (length >= 10), or legacy `redirect:URL` (spec §4.1).
    fn parse_on_deny(value: &str) -> ProxyResult<OnDeny> {
        if value == "allow" {
            return Ok(OnDeny::Allow);
        }
        if let Ok(code) = value.parse::<u16>() {
            if (100..=599).contains(&code) {
                return Ok(OnDeny::Status(code));
            }
            return Err(ProxyError::validation(
                "access.on_deny",
                format!("status code {code} out of range 100..599"),
            ));
        }
        if (value.starts_with("http://") || value.starts_with("https://")) && value.len() >= 10 {
            return Ok(OnDeny::Redirect(value.to_string()));
        }
        if let Some(url) = value.strip_prefix("redirect:") {
            if url.starts_with("http://") || url.starts_with("https://") {
                return Ok(OnDeny::Redirect(url.to_string()));
            }
            return Err(ProxyError::validation(
                "access.on_deny",
                "legacy redirect: form requires a valid http(s) scheme",
            ));
        }
        Err(ProxyError::validation(
            "access.on_deny",
            format!("invalid on_deny value '{value}'"),
        ))
    }

    fn compile_ruleset_from_host(
        raw: &RawHostConfig,
        field_prefix: &str,
    ) -> ProxyResult<CompiledRuleset> {
        let wrapper = RawRuleset {
            tls: None,
            access: None,
            capture: raw.capture.clone(),
            rewrite: raw.rewrite.clone(),
            response: raw.response.clone(),
            rewrite_urls: raw.rewrite_urls.clone(),
        };
        Self::compile_ruleset(&wrapper, field_prefix)
    }

    fn compile_ruleset(raw: &RawRuleset, field_prefix: &str) -> ProxyResult<CompiledRuleset> {
        let mut capture = Vec::with_capacity(raw.capture.len());
        for c in &raw.capture {
            capture.push(Self::compile_capture(c, field_prefix)?);
        }

        let mut rewrite = Vec::with_capacity(raw.rewrite.len());
        for r in &raw.rewrite {
            rewrite.push(Self::compile_rewrite(r, field_prefix)?);
        }

        let mut response = Vec::with_capacity(raw.response.len());
        for r in &raw.response {
            response.push(Self::compile_response(r, field_prefix)?);
        }

        let mut rewrite_urls = Vec::with_capacity(raw.rewrite_urls.len());
        for u in &raw.rewrite_urls {
            rewrite_urls.push(Self::compile_url_rewrite(u, field_prefix)?);
        }

        Ok(CompiledRuleset {
            capture,
            rewrite,
            response,
            rewrite_urls,
        })
    }

    fn compile_capture(raw: &RawCapture, field_prefix: &str) -> ProxyResult<CompiledCapture> {
        let from = match raw.from.as_deref().unwrap_or("any") {
            "request_body" => CaptureFrom::RequestBody,
            "request_header" => CaptureFrom::RequestHeader,
            "response_body" => CaptureFrom::ResponseBody,
            "response_header" => CaptureFrom::ResponseHeader,
            "cookie" => CaptureFrom::Cookie,
            "any" => CaptureFrom::Any,
            other => {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.capture.{}.from", raw.name),
                    format!("unknown capture surface '{other}'"),
                ))
            }
        };

        let default_engine = if from == CaptureFrom::Cookie {
            "cookie"
        } else {
            "regex"
        };
        let engine = match raw.engine.as_deref().unwrap_or(default_engine) {
            "regex" => CaptureEngine::Regex,
            "header" => CaptureEngine::Header,
            "cookie" => CaptureEngine::Cookie,
            "json" => CaptureEngine::Json,
            "form" => CaptureEngine::Form,
            "urlencoded" => CaptureEngine::Urlencoded,
            "formdata" => CaptureEngine::Formdata,
            "multipart" => CaptureEngine::Multipart,
            other => {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.capture.{}.engine", raw.name),
                    format!("unknown capture engine '{other}'"),
                ))
            }
        };

        let path = raw
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| {
                Regex::new(p)
                    .map(Arc::new)
                    .map_err(|e| {
                        ProxyError::validation(
                            format!("{field_prefix}.capture.{}.path", raw.name),
                            format!("invalid regex '{p}': {e}"),
                        )
                    })
            })
            .transpose()?;

        let find: Vec<String> = raw
            .find
            .as_ref()
            .map(|f| f.as_slice().into_iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        let is_navigation_marker = path.is_some() && find.is_empty();

        Ok(CompiledCapture {
            name: raw.name.clone(),
            method: raw.method.clone(),
            path,
            find,
            engine,
            from,
            required: raw.required.unwrap_or(true),
            is_navigation_marker,
        })
    }

    fn compile_rewrite(raw: &RawRewrite, field_prefix: &str) -> ProxyResult<CompiledRewrite> {
        let engine = match raw.engine.as_deref().unwrap_or("regex") {
            "regex" => RewriteEngine::Regex,
            "dom" => RewriteEngine::Dom,
            other => {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.rewrite.engine"),
                    format!("unknown rewrite engine '{other}'"),
                ))
            }
        };

        if engine == RewriteEngine::Dom {
            let action_str = raw.action.as_deref().ok_or_else(|| {
                ProxyError::validation(
                    format!("{field_prefix}.rewrite.action"),
                    "dom rewrite rules require 'action'",
                )
            })?;
            let action = match action_str {
                "setText" => DomAction::SetText,
                "setHtml" => DomAction::SetHtml,
                "setAttr" => DomAction::SetAttr,
                "removeAttr" => DomAction::RemoveAttr,
                "addClass" => DomAction::AddClass,
                "removeClass" => DomAction::RemoveClass,
                "remove" => DomAction::Remove,
                other => {
                    return Err(ProxyError::validation(
                        format!("{field_prefix}.rewrite.action"),
                        format!("unknown dom action '{other}'"),
                    ))
                }
            };
            if raw.replace.is_none()
                && !matches!(action, DomAction::RemoveAttr | DomAction::Remove)
            {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.rewrite.replace"),
                    "dom rewrite rules require 'replace' unless action is removeAttr/remove",
                ));
            }
            if matches!(action, DomAction::SetAttr | DomAction::RemoveAttr) && raw.attr.is_none() {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.rewrite.attr"),
                    "setAttr/removeAttr dom rewrite rules require 'attr'",
                ));
            }
            let target = Self::parse_dom_target(raw.target.as_deref().unwrap_or("all"))?;
            return Ok(CompiledRewrite {
                engine,
                from: RewriteFrom::ResponseBody,
                find_regex: None,
                replace: raw.replace.clone().unwrap_or_default(),
                selector: raw.find.clone(),
                action: Some(action),
                target,
                attr: raw.attr.clone(),
            });
        }

        let pattern = raw.find.as_deref().ok_or_else(|| {
            ProxyError::validation(
                format!("{field_prefix}.rewrite.find"),
                "regex rewrite rules require 'find'",
            )
        })?;
        let find_regex = Regex::new(pattern).map(Arc::new).map_err(|e| {
            ProxyError::validation(
                format!("{field_prefix}.rewrite.find"),
                format!("invalid regex '{pattern}': {e}"),
            )
        })?;

        let from = match raw.from.as_deref().unwrap_or("response_body") {
            "request_body" => RewriteFrom::RequestBody,
            "request_header" => RewriteFrom::RequestHeader,
            "response_body" => RewriteFrom::ResponseBody,
            "response_header" => RewriteFrom::ResponseHeader,
            other => {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.rewrite.from"),
                    format!("unknown rewrite surface '{other}'"),
                ))
            }
        };

        Ok(CompiledRewrite {
            engine,
            from,
            find_regex: Some(find_regex),
            replace: raw.replace.clone().unwrap_or_default(),
            selector: None,
            action: None,
            target: DomTarget::All,
            attr: None,
        })
    }

    fn parse_dom_target(value: &str) -> ProxyResult<DomTarget> {
        match value {
            "first" => Ok(DomTarget::First),
            "last" => Ok(DomTarget::Last),
            "all" => Ok(DomTarget::All),
            v if v.contains('-') => {
                let (a, b) = v.split_once('-').unwrap();
                let (a, b) = (a.parse().ok(), b.parse().ok());
                match (a, b) {
                    (Some(a), Some(b)) => Ok(DomTarget::Range(a, b)),
                    _ => Err(ProxyError::validation(
                        "rewrite.target",
                        format!("invalid range target '{value}'"),
                    )),
                }
            }
            v if v.contains(',') => {
                let indices: Result<Vec<usize>, _> =
                    v.split(',').map(|s| s.trim().parse()).collect();
                indices
                    .map(DomTarget::Indices)
                    .map_err(|_| ProxyError::validation("rewrite.target", format!("invalid index list '{value}'")))
            }
            other => Err(ProxyError::validation(
                "rewrite.target",
                format!("invalid dom target '{other}'"),
            )),
        }
    }

    fn compile_url_rewrite(
        raw: &RawUrlRewrite,
        field_prefix: &str,
    ) -> ProxyResult<CompiledUrlRewrite> {
        let find = Regex::new(&raw.find).map(Arc::new).map_err(|e| {
            ProxyError::validation(
                format!("{field_prefix}.rewrite_urls.find"),
                format!("invalid regex '{}': {e}", raw.find),
            )
        })?;

        let mut seen = HashSet::new();
        for q in &raw.query {
            if !seen.insert(q.from.clone()) {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.rewrite_urls.query"),
                    format!("duplicate query rename source '{}'", q.from),
                ));
            }
        }

        Ok(CompiledUrlRewrite {
            find,
            replace: raw.replace.clone(),
            query: raw.query.clone(),
            filter: raw.filter.iter().cloned().collect(),
        })
    }

    fn compile_response(raw: &RawResponse, field_prefix: &str) -> ProxyResult<CompiledResponse> {
        for name in raw.headers.keys() {
            if name.contains(':') || name.contains('\r') || name.contains('\n') {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.response.headers"),
                    format!("invalid header name '{name}'"),
                ));
            }
        }
        for value in raw.headers.values() {
            if value.contains('\r') || value.contains('\n') {
                return Err(ProxyError::validation(
                    format!("{field_prefix}.response.headers"),
                    "header values must not contain CR/LF",
                ));
            }
        }

        let path = Regex::new(&raw.path).map(Arc::new).map_err(|e| {
            ProxyError::validation(
                format!("{field_prefix}.response.path"),
                format!("invalid regex '{}': {e}", raw.path),
            )
        })?;

        Ok(CompiledResponse {
            path,
            status: raw.status.unwrap_or(200),
            headers: raw.headers.clone(),
            body: raw.body.clone(),
            forward: raw.forward,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryDomainRepository;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn compile(yaml: &str) -> ProxyResult<CompiledConfig> {
        let repo = InMemoryDomainRepository::new();
        RulesetCompiler::compile(yaml, "my-proxy", None, &repo)
    }

    #[test]
    fn compiles_minimal_config() {
        init_log();
        let yaml = r#"
version: "0.0"
start_url: "https://example.com/login"
example.com:
  to: phish.example
"#;
        let cfg = compile(yaml).unwrap();
        assert_eq!(cfg.start_host, "example.com");
        assert_eq!(cfg.hosts["example.com"].to, "phish.example");
        assert_eq!(cfg.hosts["example.com"].scheme, HostScheme::Https);
        assert_eq!(cfg.hosts["example.com"].tls, TlsMode::Managed);
        assert_eq!(cfg.hosts["example.com"].access.mode, AccessMode::Private);
    }

    #[test]
    fn rejects_unsupported_version() {
        let yaml = "version: \"1.0\"\nexample.com:\n  to: phish.example\n";
        let err = compile(yaml).unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn rejects_socks4_upstream_proxy() {
        let yaml = r#"
version: "0.0"
proxy: "socks4://1.2.3.4:1080"
example.com:
  to: phish.example
"#;
        let err = compile(yaml).unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn rejects_duplicate_capture_names() {
        // S4
        let yaml = r#"
version: "0.0"
global:
  capture:
    - name: "x"
      path: "^/a$"
example.com:
  to: phish.example
  capture:
    - name: "x"
      path: "^/b$"
"#;
        let err = compile(yaml).unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn start_url_host_must_be_mapped() {
        // S3
        let yaml = r#"
version: "0.0"
start_url: "https://auth.example.com/login"
example.com:
  to: phish.example
"#;
        let err = compile(yaml).unwrap_err();
        match err {
            ProxyError::Validation { field, message } => {
                assert_eq!(field, "proxyConfig");
                assert!(message.contains("auth.example.com"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn proxy_and_start_url_are_independent_keys() {
        // A legitimate forward-proxy config must not be misread as start_url.
        let yaml = r#"
version: "0.0"
proxy: "https://fwd.example:8080"
start_url: "https://example.com/login"
example.com:
  to: phish.example
"#;
        let cfg = compile(yaml).unwrap();
        assert_eq!(cfg.start_host, "example.com");
        assert_eq!(cfg.upstream_proxy.unwrap().url, "https://fwd.example:8080");
    }

    #[test]
    fn start_host_fallback_is_deterministic_with_multiple_hosts() {
        let yaml = r#"
version: "0.0"
zebra.example:
  to: phish-zebra.example
apple.example:
  to: phish-apple.example
"#;
        let cfg = compile(yaml).unwrap();
        assert_eq!(cfg.start_host, "apple.example");
    }

    #[test]
    fn on_deny_accepts_all_forms() {
        assert_eq!(RulesetCompiler::parse_on_deny("allow").unwrap(), OnDeny::Allow);
        assert_eq!(
            RulesetCompiler::parse_on_deny("404").unwrap(),
            OnDeny::Status(404)
        );
        assert_eq!(
            RulesetCompiler::parse_on_deny("https://example.com/deny").unwrap(),
            OnDeny::Redirect("https://example.com/deny".to_string())
        );
        assert_eq!(
            RulesetCompiler::parse_on_deny("redirect:https://example.com/deny").unwrap(),
            OnDeny::Redirect("https://example.com/deny".to_string())
        );
        assert!(RulesetCompiler::parse_on_deny("bogus").is_err());
        assert!(RulesetCompiler::parse_on_deny("700").is_err());
    }

    #[test]
    fn navigation_marker_has_path_and_no_find() {
        let yaml = r#"
version: "0.0"
example.com:
  to: phish.example
  capture:
    - name: "visit"
      path: "^/login$"
"#;
        let cfg = compile(yaml).unwrap();
        let capture = &cfg.hosts["example.com"].ruleset.capture[0];
        assert!(capture.is_navigation_marker);
        assert!(capture.required);
    }

    #[test]
    fn default_idempotence() {
        // Property #2: compiling an already-defaulted config is a no-op.
        let yaml = r#"
version: "0.0"
example.com:
  to: phish.example
  scheme: https
  tls:
    mode: managed
  access:
    mode: private
    on_deny: "404"
"#;
        let a = compile(yaml).unwrap();
        let b = compile(yaml).unwrap();
        assert_eq!(a.hosts["example.com"].scheme, b.hosts["example.com"].scheme);
        assert_eq!(a.hosts["example.com"].tls, b.hosts["example.com"].tls);
    }
}
