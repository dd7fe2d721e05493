//! The `ProxyHttp` request pipeline (spec §4.5), wired against `pingora_proxy`
//! the way the teacher's `service::http::HttpService` is: one `ProxyHttp`
//! impl owning every filter-chain hook, a per-request `CTX` carrying the
//! matched route and accumulated state, and a plain `HttpPeer::new` dial
//! since this proxy has exactly one upstream per host rather than the
//! teacher's load-balanced upstream groups.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType, OrErr, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};
use uuid::Uuid;

use crate::allowlist::AllowList;
use crate::capture::{self, CaptureSurface};
use crate::config::{AccessMode, CaptureFrom, CompiledResponse, OnDeny, RewriteFrom};
use crate::registry::{self, RegisteredHost};
use crate::repository::{AuditSink, LoggingAuditSink};
use crate::rewrite;
use crate::session::{ProxySession, SessionManager};
use crate::utils::request::{get_client_ip, get_cookie_value, get_request_host};

pub const SESSION_COOKIE_NAME: &str = "__pp_session";

/// Parses a `Cookie:` header value into `(name, value)` pairs.
fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Per-request state threaded through every filter-chain hook.
pub struct ProxyContext {
    pub host: Option<RegisteredHost>,
    pub session: Option<Arc<ProxySession>>,
    pub is_new_session: bool,
    pub pending_response: Option<CompiledResponse>,
    pub access_denied: bool,
    pub client_ip: String,
    pub req_body: Vec<u8>,
    pub resp_body: Vec<u8>,
    pub tries: usize,
    pub request_start: Instant,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            host: None,
            session: None,
            is_new_session: false,
            pending_response: None,
            access_denied: false,
            client_ip: String::new(),
            req_body: Vec::new(),
            resp_body: Vec::new(),
            tries: 0,
            request_start: Instant::now(),
        }
    }
}

/// Entry point for every inbound connection, routing on the `to` host the
/// TLS/HTTP listener accepted the request for.
pub struct ProxyPipeline {
    pub sessions: Arc<SessionManager>,
    pub allow_list: Arc<AllowList>,
    pub audit: Arc<dyn AuditSink>,
}

impl Default for ProxyPipeline {
    fn default() -> Self {
        Self {
            sessions: Arc::new(SessionManager::default()),
            allow_list: Arc::new(AllowList::default()),
            audit: Arc::new(LoggingAuditSink),
        }
    }
}

impl ProxyPipeline {
    pub fn new(
        sessions: Arc<SessionManager>,
        allow_list: Arc<AllowList>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sessions,
            allow_list,
            audit,
        }
    }

    fn write_compiled_response(
        &self,
        headers: &mut ResponseHeader,
        resp: &CompiledResponse,
    ) -> Result<()> {
        for (name, value) in &resp.headers {
            headers.insert_header(name.clone(), value.as_str())?;
        }
        headers.insert_header(header::CONTENT_LENGTH, resp.body.len().to_string())?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for ProxyPipeline {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    async fn early_request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<()> {
        ctx.client_ip = get_client_ip(session);
        let Some(host) = get_request_host(session.req_header()).map(str::to_string) else {
            return Ok(());
        };
        ctx.host = registry::lookup(&host);
        Ok(())
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let Some(host) = ctx.host.clone() else {
            session.respond_error(404).await?;
            return Ok(true);
        };

        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.as_str().to_string();

        // Step 1: response-rule short-circuit.
        for resp in &host.host_config.ruleset.response {
            if !resp.path.is_match(&path) {
                continue;
            }
            if !resp.forward {
                let mut headers = ResponseHeader::build_no_case(resp.status, Some(2))?;
                self.write_compiled_response(&mut headers, resp)?;
                session.write_response_header(Box::new(headers), false).await?;
                session
                    .write_response_body(Some(Bytes::copy_from_slice(resp.body.as_bytes())), true)
                    .await?;
                return Ok(true);
            }
            ctx.pending_response = Some(resp.clone());
            break;
        }

        // Step 2: session resolution / creation.
        let existing_cookie =
            get_cookie_value(session.req_header(), SESSION_COOKIE_NAME).map(str::to_string);
        let existing_session = existing_cookie.as_deref().and_then(|id| self.sessions.get(id));
        let session_existed_before = existing_session.is_some();

        let proxy_session = existing_session.unwrap_or_else(|| {
            ctx.is_new_session = true;
            let id = Uuid::new_v4().to_string();
            let fresh = Arc::new(ProxySession::new(
                id.clone(),
                host.host_config.to.clone(),
                host.proxy_id.clone(),
                host.host_config.source_host.clone(),
                host.host_config.clone(),
            ));
            self.sessions.store(id, fresh.clone());
            fresh
        });
        ctx.session = Some(proxy_session.clone());

        // Step 3: access control.
        let allowed = match host.host_config.access.mode {
            AccessMode::Public => true,
            AccessMode::Private => {
                session_existed_before
                    || self.allow_list.is_allowed(&ctx.client_ip, &host.proxy_id)
            }
        };
        if !allowed {
            ctx.access_denied = true;
            self.audit.emit(
                "access.check",
                &ctx.client_ip,
                &host.proxy_id,
                false,
                &format!("denied private access to '{}'", host.host_config.source_host),
            );
            if !matches!(host.host_config.access.on_deny, OnDeny::Allow) {
                // A deny blocks forwarding but never suppresses a pending
                // response-rule body: that body still ships to the client
                // instead of the deny status/redirect.
                if let Some(pending) = &ctx.pending_response {
                    let mut headers = ResponseHeader::build_no_case(pending.status, Some(2))?;
                    self.write_compiled_response(&mut headers, pending)?;
                    session.write_response_header(Box::new(headers), false).await?;
                    session
                        .write_response_body(Some(Bytes::copy_from_slice(pending.body.as_bytes())), true)
                        .await?;
                    return Ok(true);
                }
            }
            match &host.host_config.access.on_deny {
                OnDeny::Allow => {}
                OnDeny::Status(code) => {
                    session.respond_error(*code).await?;
                    return Ok(true);
                }
                OnDeny::Redirect(url) => {
                    let mut headers = ResponseHeader::build_no_case(302, Some(1))?;
                    headers.insert_header(header::LOCATION, url.as_str())?;
                    session.write_response_header(Box::new(headers), false).await?;
                    session.write_response_body(Some(Bytes::new()), true).await?;
                    return Ok(true);
                }
            }
        } else if host.host_config.access.mode == AccessMode::Private {
            self.audit.emit(
                "access.check",
                &ctx.client_ip,
                &host.proxy_id,
                true,
                &format!("allowed private access to '{}'", host.host_config.source_host),
            );
        }

        // Step 4: request-side header/cookie captures (body captures run in
        // `request_body_filter` once the body is fully buffered).
        let req_header = session.req_header().clone();
        let headers: Vec<(String, String)> = req_header
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let cookie_header = req_header
            .headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let cookies = parse_cookie_header(cookie_header);

        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let cookie_refs: Vec<(&str, &str)> =
            cookies.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let header_surface = CaptureSurface {
            headers: header_refs,
            cookies: cookie_refs,
            body: None,
            content_type: None,
        };
        capture::run_captures(
            &host.host_config.ruleset.capture,
            CaptureFrom::RequestHeader,
            &method,
            &path,
            &header_surface,
            &proxy_session,
        )
        .await;
        capture::run_captures(
            &host.host_config.ruleset.capture,
            CaptureFrom::Cookie,
            &method,
            &path,
            &header_surface,
            &proxy_session,
        )
        .await;

        // Step 5: request-side header rewrite + URL rewrite (body rewrite
        // happens once the body is buffered).
        let req_header_mut = session.req_header_mut();
        let current_headers: Vec<(http::HeaderName, String)> = req_header_mut
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.clone(), v.to_string())))
            .collect();
        for (name, value) in current_headers {
            let rewritten = rewrite::apply_regex_rewrites(
                &host.host_config.ruleset.rewrite,
                RewriteFrom::RequestHeader,
                &value,
            );
            if rewritten != value {
                req_header_mut.insert_header(name, rewritten)?;
            }
        }

        if let Some(path_and_query) = req_header_mut.uri.path_and_query().cloned() {
            let query = path_and_query.query().unwrap_or("");
            let mut new_path = path_and_query.path().to_string();
            let mut new_query = query.to_string();
            for url_rewrite in &host.host_config.ruleset.rewrite_urls {
                let (p, q) = rewrite::apply_url_rewrite(url_rewrite, &new_path, &new_query);
                new_path = p;
                new_query = q;
            }
            let new_uri = if new_query.is_empty() {
                new_path
            } else {
                format!("{new_path}?{new_query}")
            };
            if let Ok(uri) = new_uri.parse() {
                req_header_mut.set_uri(uri);
            }
        }

        Ok(false)
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(host) = ctx.host.clone() else {
            return Ok(());
        };
        if let Some(chunk) = body.take() {
            ctx.req_body.extend_from_slice(&chunk);
        }
        if !end_of_stream {
            return Ok(());
        }

        if let Some(proxy_session) = ctx.session.clone() {
            let surface = CaptureSurface {
                headers: Vec::new(),
                cookies: Vec::new(),
                body: Some(&ctx.req_body),
                content_type: None,
            };
            capture::run_captures(
                &host.host_config.ruleset.capture,
                CaptureFrom::RequestBody,
                "",
                "",
                &surface,
                &proxy_session,
            )
            .await;
        }

        let text = String::from_utf8_lossy(&ctx.req_body).into_owned();
        let rewritten = rewrite::apply_regex_rewrites(
            &host.host_config.ruleset.rewrite,
            RewriteFrom::RequestBody,
            &text,
        );
        *body = Some(Bytes::from(rewritten));
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let host = ctx
            .host
            .as_ref()
            .ok_or_else(|| Error::new(ErrorType::HTTPStatus(404)))?;
        let tls = host.host_config.scheme == crate::config::HostScheme::Https;
        let address = format!(
            "{}:{}",
            host.host_config.source_host,
            if tls { 443 } else { 80 }
        );
        let peer = HttpPeer::new(address, tls, host.host_config.source_host.clone());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(host) = &ctx.host {
            upstream_request.insert_header(header::HOST, host.host_config.source_host.as_str())?;
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(host) = ctx.host.clone() else {
            return Ok(());
        };

        // Step 7 (header surface) and step 8 (header rewrite) run here,
        // against the upstream response headers, before any body arrives.
        if let Some(proxy_session) = ctx.session.clone() {
            let headers: Vec<(String, String)> = upstream_response
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect();
            let header_refs: Vec<(&str, &str)> =
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let surface = CaptureSurface {
                headers: header_refs,
                cookies: Vec::new(),
                body: None,
                content_type: None,
            };
            capture::run_captures(
                &host.host_config.ruleset.capture,
                CaptureFrom::ResponseHeader,
                "",
                "",
                &surface,
                &proxy_session,
            )
            .await;
        }

        let current_headers: Vec<(http::HeaderName, String)> = upstream_response
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.clone(), v.to_string())))
            .collect();
        for (name, value) in current_headers {
            let rewritten = rewrite::apply_regex_rewrites(
                &host.host_config.ruleset.rewrite,
                RewriteFrom::ResponseHeader,
                &value,
            );
            if rewritten != value {
                upstream_response.insert_header(name, rewritten)?;
            }
        }

        // Step 9: session cookie write for newly-minted sessions.
        if ctx.is_new_session {
            if let Some(proxy_session) = &ctx.session {
                upstream_response.append_header(
                    header::SET_COOKIE,
                    format!("{SESSION_COOKIE_NAME}={}; Path=/; HttpOnly", proxy_session.id),
                )?;
            }
        }

        // Step 1 / step 10: a pending forwarding response-rule overrides the
        // upstream status and headers (body is replaced in the body filter).
        if let Some(pending) = &ctx.pending_response {
            upstream_response
                .set_status(pending.status)
                .or_err(ErrorType::InternalError, "invalid pending status")?;
            for (name, value) in &pending.headers {
                upstream_response.insert_header(name.clone(), value.as_str())?;
            }
        }

        upstream_response.remove_header(&header::CONTENT_LENGTH);
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        let Some(host) = ctx.host.clone() else {
            return Ok(None);
        };

        if let Some(chunk) = body.take() {
            ctx.resp_body.extend_from_slice(&chunk);
        }
        if !end_of_stream {
            return Ok(None);
        }

        if let Some(pending) = ctx.pending_response.take() {
            *body = Some(Bytes::copy_from_slice(pending.body.as_bytes()));
            return Ok(None);
        }

        if let Some(proxy_session) = ctx.session.clone() {
            let surface = CaptureSurface {
                headers: Vec::new(),
                cookies: Vec::new(),
                body: Some(&ctx.resp_body),
                content_type: None,
            };
            // `run_captures` only truly suspends on external I/O inside the
            // multipart engine, and response bodies are already fully
            // buffered bytes by this point, so blocking on it here is safe
            // even though this hook is not async.
            futures_executor::block_on(capture::run_captures(
                &host.host_config.ruleset.capture,
                CaptureFrom::ResponseBody,
                "",
                "",
                &surface,
                &proxy_session,
            ));
        }

        let text = String::from_utf8_lossy(&ctx.resp_body).into_owned();
        let regex_rewritten = rewrite::apply_regex_rewrites(
            &host.host_config.ruleset.rewrite,
            RewriteFrom::ResponseBody,
            &text,
        );
        let dom_rewritten =
            rewrite::apply_dom_rewrites(&host.host_config.ruleset.rewrite, &regex_rewritten)
                .unwrap_or(regex_rewritten);

        *body = Some(Bytes::from(dom_rewritten));
        Ok(None)
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if let Some(err) = e {
            log::warn!(client_ip = ctx.client_ip.as_str(); "request failed: {err}");
        } else {
            log::info!(
                client_ip = ctx.client_ip.as_str(),
                elapsed_ms = ctx.request_start.elapsed().as_millis() as u64;
                "request completed"
            );
        }
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        const MAX_RETRIES: usize = 1;
        if ctx.tries < MAX_RETRIES {
            ctx.tries += 1;
            e.set_retry(true);
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_cookie_header_splits_pairs() {
        let cookies = parse_cookie_header("a=1; b=2;  c=3");
        assert_eq!(
            cookies,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn parse_cookie_header_ignores_malformed_pairs() {
        let cookies = parse_cookie_header("a=1; noequalssign; b=2");
        assert_eq!(
            cookies,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn parse_cookie_header_empty_yields_empty() {
        assert!(parse_cookie_header("").is_empty());
    }

    #[test]
    fn write_compiled_response_sets_headers_and_content_length() {
        let pipeline = ProxyPipeline::new(
            Arc::new(SessionManager::new()),
            Arc::new(AllowList::new()),
            Arc::new(LoggingAuditSink),
        );
        let mut headers_map = HashMap::new();
        headers_map.insert("x-custom".to_string(), "value".to_string());
        let resp = CompiledResponse {
            path: Arc::new(regex::Regex::new("^/$").unwrap()),
            status: 200,
            headers: headers_map,
            body: "hello world".to_string(),
            forward: false,
        };
        let mut headers = ResponseHeader::build_no_case(200, Some(2)).unwrap();
        pipeline.write_compiled_response(&mut headers, &resp).unwrap();
        assert_eq!(
            headers.headers.get("x-custom").unwrap().to_str().unwrap(),
            "value"
        );
        assert_eq!(
            headers.headers.get("content-length").unwrap().to_str().unwrap(),
            "11"
        );
    }

    #[test]
    fn new_ctx_starts_with_no_host_or_session() {
        let pipeline = ProxyPipeline::new(
            Arc::new(SessionManager::new()),
            Arc::new(AllowList::new()),
            Arc::new(LoggingAuditSink),
        );
        let ctx = pipeline.new_ctx();
        assert!(ctx.host.is_none());
        assert!(ctx.session.is_none());
        assert!(!ctx.is_new_session);
        assert_eq!(ctx.tries, 0);
    }
}
