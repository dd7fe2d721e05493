//! Capture-rule evaluation (spec §4.5 steps 4 and 7).
//!
//! Each capture rule names a `from` surface and an `engine`; this module
//! pulls zero or more named fields off that surface and records them onto
//! the session. Regex `find` patterns are per-rule data only known at
//! compile time, so compiled patterns are cached process-wide the way the
//! teacher caches its route matchers rather than recompiled per request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{CaptureEngine, CaptureFrom, CompiledCapture};
use crate::session::ProxySession;

static REGEX_CACHE: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

fn cached_regex(pattern: &str) -> Option<Arc<Regex>> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return Some(re.clone());
    }
    let re = Arc::new(Regex::new(pattern).ok()?);
    REGEX_CACHE.insert(pattern.to_string(), re.clone());
    Some(re)
}

/// The data available on one side (request or response) of the exchange.
#[derive(Default)]
pub struct CaptureSurface<'a> {
    pub headers: Vec<(&'a str, &'a str)>,
    pub cookies: Vec<(&'a str, &'a str)>,
    pub body: Option<&'a [u8]>,
    pub content_type: Option<&'a str>,
}

/// Runs every capture rule whose method/path/`from` match the current
/// request, recording any extracted fields onto `session`.
///
/// `side` identifies which concrete surface `from: any` should resolve to
/// when the rule doesn't name a surface explicitly (request-body during the
/// request phase, response-body during the response phase).
pub async fn run_captures(
    captures: &[CompiledCapture],
    side: CaptureFrom,
    method: &str,
    path: &str,
    surface: &CaptureSurface<'_>,
    session: &ProxySession,
) {
    for capture in captures {
        if !method_matches(capture, method) || !path_matches(capture, path) {
            continue;
        }

        if capture.is_navigation_marker {
            session.record_capture(&capture.name, "visited", "true".to_string());
            continue;
        }

        let applies = match capture.from {
            CaptureFrom::Any => true,
            other => other == side,
        };
        if !applies {
            continue;
        }

        for (field, value) in extract_fields(capture, surface).await {
            session.record_capture(&capture.name, &field, value);
        }
    }
}

fn method_matches(capture: &CompiledCapture, method: &str) -> bool {
    capture
        .method
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case(method))
        .unwrap_or(true)
}

fn path_matches(capture: &CompiledCapture, path: &str) -> bool {
    capture
        .path
        .as_ref()
        .map(|re| re.is_match(path))
        .unwrap_or(true)
}

async fn extract_fields(
    capture: &CompiledCapture,
    surface: &CaptureSurface<'_>,
) -> HashMap<String, String> {
    match capture.engine {
        CaptureEngine::Regex => extract_regex(capture, surface),
        CaptureEngine::Header => extract_named(&capture.find, &surface.headers),
        CaptureEngine::Cookie => extract_named(&capture.find, &surface.cookies),
        CaptureEngine::Json => extract_json(capture, surface),
        CaptureEngine::Form | CaptureEngine::Urlencoded => extract_urlencoded(capture, surface),
        CaptureEngine::Formdata | CaptureEngine::Multipart => {
            extract_multipart(capture, surface).await
        }
    }
}

fn extract_named(names: &[String], pairs: &[(&str, &str)]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in names {
        if let Some((_, v)) = pairs.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            out.insert(name.clone(), (*v).to_string());
        }
    }
    out
}

/// A pattern with named groups contributes one field per named group;
/// otherwise the whole match is recorded under the pattern string itself.
fn extract_regex(capture: &CompiledCapture, surface: &CaptureSurface<'_>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(body) = surface.body else {
        return out;
    };
    let text = String::from_utf8_lossy(body);
    for pattern in &capture.find {
        let Some(re) = cached_regex(pattern) else {
            continue;
        };
        let Some(caps) = re.captures(&text) else {
            continue;
        };
        let names: Vec<&str> = re.capture_names().flatten().collect();
        if names.is_empty() {
            if let Some(m) = caps.get(0) {
                out.insert(pattern.clone(), m.as_str().to_string());
            }
        } else {
            for name in names {
                if let Some(m) = caps.name(name) {
                    out.insert(name.to_string(), m.as_str().to_string());
                }
            }
        }
    }
    out
}

/// `find` entries are dot-separated JSON paths (e.g. `"user.email"`).
fn extract_json(capture: &CompiledCapture, surface: &CaptureSurface<'_>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(body) = surface.body else {
        return out;
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return out;
    };
    for path in &capture.find {
        if let Some(v) = json_path(&value, path) {
            out.insert(path.clone(), json_scalar_to_string(v));
        }
    }
    out
}

fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn json_scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_urlencoded(
    capture: &CompiledCapture,
    surface: &CaptureSurface<'_>,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(body) = surface.body else {
        return out;
    };
    for (k, v) in url::form_urlencoded::parse(body) {
        if capture.find.iter().any(|f| f == k.as_ref()) {
            out.insert(k.into_owned(), v.into_owned());
        }
    }
    out
}

async fn extract_multipart(
    capture: &CompiledCapture,
    surface: &CaptureSurface<'_>,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let (Some(body), Some(content_type)) = (surface.body, surface.content_type) else {
        return out;
    };
    let Ok(boundary) = multer::parse_boundary(content_type) else {
        return out;
    };
    let owned = Bytes::copy_from_slice(body);
    let stream = futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(owned) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(name) = field.name().map(|s| s.to_string()) else {
            continue;
        };
        if !capture.find.iter().any(|f| f == &name) {
            continue;
        }
        if let Ok(bytes) = field.bytes().await {
            out.insert(name, String::from_utf8_lossy(&bytes).to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureEngine, CaptureFrom};
    use std::sync::Arc;

    fn cap(name: &str, engine: CaptureEngine, from: CaptureFrom, find: Vec<&str>) -> CompiledCapture {
        CompiledCapture {
            name: name.to_string(),
            method: None,
            path: None,
            find: find.into_iter().map(String::from).collect(),
            engine,
            from,
            required: true,
            is_navigation_marker: false,
        }
    }

    fn host_config_with(captures: Vec<CompiledCapture>) -> Arc<crate::config::CompiledHostConfig> {
        use crate::config::*;
        Arc::new(CompiledHostConfig {
            source_host: "example.com".into(),
            to: "phish.example".into(),
            scheme: HostScheme::Https,
            tls: TlsMode::Managed,
            access: AccessControl {
                mode: AccessMode::Private,
                on_deny: OnDeny::Status(404),
            },
            ruleset: CompiledRuleset {
                capture: captures,
                ..Default::default()
            },
        })
    }

    #[tokio::test]
    async fn regex_capture_extracts_named_group() {
        let c = cap(
            "creds",
            CaptureEngine::Regex,
            CaptureFrom::RequestBody,
            vec![r#"username=(?P<username>[^&]+)"#],
        );
        let body = b"username=alice&password=hunter2".to_vec();
        let surface = CaptureSurface {
            body: Some(&body),
            ..Default::default()
        };
        let session = crate::session::ProxySession::new(
            "s1".into(),
            "phish.example".into(),
            "p1".into(),
            "example.com".into(),
            host_config_with(vec![c.clone()]),
        );
        run_captures(&[c], CaptureFrom::RequestBody, "POST", "/login", &surface, &session).await;
        let captured = session.captured.lock().unwrap();
        assert_eq!(captured["creds"]["username"], "alice");
    }

    #[tokio::test]
    async fn urlencoded_capture_extracts_named_fields() {
        let c = cap(
            "login",
            CaptureEngine::Urlencoded,
            CaptureFrom::RequestBody,
            vec!["password"],
        );
        let body = b"username=alice&password=hunter2".to_vec();
        let surface = CaptureSurface {
            body: Some(&body),
            ..Default::default()
        };
        let session = crate::session::ProxySession::new(
            "s1".into(),
            "phish.example".into(),
            "p1".into(),
            "example.com".into(),
            host_config_with(vec![c.clone()]),
        );
        run_captures(&[c], CaptureFrom::RequestBody, "POST", "/login", &surface, &session).await;
        let captured = session.captured.lock().unwrap();
        assert_eq!(captured["login"]["password"], "hunter2");
    }

    #[tokio::test]
    async fn cookie_capture_extracts_named_cookie() {
        let c = cap("sid", CaptureEngine::Cookie, CaptureFrom::Cookie, vec!["session"]);
        let surface = CaptureSurface {
            cookies: vec![("session", "abc123")],
            ..Default::default()
        };
        let session = crate::session::ProxySession::new(
            "s1".into(),
            "phish.example".into(),
            "p1".into(),
            "example.com".into(),
            host_config_with(vec![c.clone()]),
        );
        run_captures(&[c], CaptureFrom::Cookie, "GET", "/", &surface, &session).await;
        let captured = session.captured.lock().unwrap();
        assert_eq!(captured["sid"]["session"], "abc123");
    }

    #[tokio::test]
    async fn navigation_marker_records_visit_without_find() {
        let mut c = cap("visit_login", CaptureEngine::Regex, CaptureFrom::Any, vec![]);
        c.path = Some(Arc::new(Regex::new("^/login$").unwrap()));
        c.is_navigation_marker = true;
        let surface = CaptureSurface::default();
        let session = crate::session::ProxySession::new(
            "s1".into(),
            "phish.example".into(),
            "p1".into(),
            "example.com".into(),
            host_config_with(vec![c.clone()]),
        );
        run_captures(&[c], CaptureFrom::RequestBody, "GET", "/login", &surface, &session).await;
        let captured = session.captured.lock().unwrap();
        assert_eq!(captured["visit_login"]["visited"], "true");
    }
}
