//! Rewrite-rule application (spec §4.5 steps 5 and 8) plus path/query
//! rewriting for outbound `Location`-style URLs.
//!
//! Regex rewrites are a straightforward find/replace over a buffered body
//! or header value. Dom rewrites stream the body through a single
//! `lol_html::rewrite_str` pass, grounded in its documented dynamic-selector
//! pattern (`Cow::Owned(selector.parse().unwrap())` paired with
//! `ElementContentHandlers`) since rule selectors are only known at config
//! load time, not at compile time the way the crate's `element!` macro
//! expects.

use std::borrow::Cow;
use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;

use lol_html::html_content::{ContentType, Element};
use lol_html::{ElementContentHandlers, RewriteStrSettings};

use crate::config::{CompiledRewrite, CompiledUrlRewrite, DomAction, DomTarget, RewriteEngine, RewriteFrom};
use crate::error::{ProxyError, ProxyResult};

/// Applies every regex rewrite matching `from`, in rule order.
pub fn apply_regex_rewrites(rewrites: &[CompiledRewrite], from: RewriteFrom, input: &str) -> String {
    let mut current = input.to_string();
    for rule in rewrites {
        if rule.engine != RewriteEngine::Regex || rule.from != from {
            continue;
        }
        if let Some(re) = &rule.find_regex {
            current = re.replace_all(&current, rule.replace.as_str()).into_owned();
        }
    }
    current
}

/// Applies every dom rewrite rule to `html`, in rule order, via one
/// `lol_html::rewrite_str` pass per rule (rules can target overlapping
/// selectors, so each must see the previous rule's output).
pub fn apply_dom_rewrites(rewrites: &[CompiledRewrite], html: &str) -> ProxyResult<String> {
    let dom_rules: Vec<&CompiledRewrite> = rewrites
        .iter()
        .filter(|r| r.engine == RewriteEngine::Dom)
        .collect();

    let mut current = html.to_string();
    for rule in dom_rules {
        current = apply_one_dom_rewrite(rule, &current)?;
    }
    Ok(current)
}

fn apply_one_dom_rewrite(rule: &CompiledRewrite, html: &str) -> ProxyResult<String> {
    let selector_str = rule.selector.as_deref().unwrap_or("*");
    let selector = selector_str
        .parse()
        .map_err(|_| ProxyError::Fatal(format!("invalid dom selector '{selector_str}'")))?;

    let action = rule.action.ok_or_else(|| {
        ProxyError::Fatal("dom rewrite rule compiled without an action".to_string())
    })?;
    let replace = rule.replace.clone();
    let attr = rule.attr.clone();
    let target = rule.target.clone();

    // Elements are visited in document order; `seen` tracks how many of this
    // rule's matches have been seen so far, so first/last/indices/range can
    // be applied without a second pass.
    let seen = Rc::new(Cell::new(0usize));
    let total_hint = match &target {
        DomTarget::Last => None, // requires a full count; resolved via a pre-count pass below
        _ => Some(()),
    };
    let _ = total_hint;

    let total = if matches!(target, DomTarget::Last) {
        count_matches(selector_str, html)?
    } else {
        0
    };

    let handler = move |el: &mut Element| {
        let index = seen.get();
        seen.set(index + 1);
        if !target_includes(&target, index, total) {
            return Ok(());
        }
        apply_dom_action(el, action, &replace, attr.as_deref())
    };

    let settings = RewriteStrSettings {
        element_content_handlers: vec![(
            Cow::Owned(selector),
            ElementContentHandlers::default().element(handler),
        )],
        ..RewriteStrSettings::new()
    };

    lol_html::rewrite_str(html, settings)
        .map_err(|e| ProxyError::Fatal(format!("dom rewrite failed: {e}")))
}

fn count_matches(selector_str: &str, html: &str) -> ProxyResult<usize> {
    let selector = selector_str
        .parse()
        .map_err(|_| ProxyError::Fatal(format!("invalid dom selector '{selector_str}'")))?;
    let count = Rc::new(Cell::new(0usize));
    let counter = count.clone();
    let settings = RewriteStrSettings {
        element_content_handlers: vec![(
            Cow::Owned(selector),
            ElementContentHandlers::default().element(move |_el: &mut Element| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        )],
        ..RewriteStrSettings::new()
    };
    lol_html::rewrite_str(html, settings)
        .map_err(|e| ProxyError::Fatal(format!("dom rewrite count pass failed: {e}")))?;
    Ok(count.get())
}

fn target_includes(target: &DomTarget, index: usize, total: usize) -> bool {
    match target {
        DomTarget::All => true,
        DomTarget::First => index == 0,
        DomTarget::Last => index + 1 == total,
        DomTarget::Indices(indices) => indices.contains(&index),
        DomTarget::Range(start, end) => index >= *start && index <= *end,
    }
}

fn apply_dom_action(
    el: &mut Element,
    action: DomAction,
    replace: &str,
    attr: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match action {
        DomAction::SetText => el.set_inner_content(replace, ContentType::Text),
        DomAction::SetHtml => el.set_inner_content(replace, ContentType::Html),
        DomAction::SetAttr => {
            let name = attr.ok_or("setAttr rule missing attribute name")?;
            el.set_attribute(name, replace)?;
        }
        DomAction::RemoveAttr => {
            let name = attr.ok_or("removeAttr rule missing attribute name")?;
            el.remove_attribute(name);
        }
        DomAction::AddClass => {
            let existing = el.get_attribute("class").unwrap_or_default();
            let mut classes: HashSet<&str> = existing.split_whitespace().collect();
            classes.insert(replace);
            el.set_attribute("class", &classes.into_iter().collect::<Vec<_>>().join(" "))?;
        }
        DomAction::RemoveClass => {
            let existing = el.get_attribute("class").unwrap_or_default();
            let remaining: Vec<&str> = existing
                .split_whitespace()
                .filter(|c| *c != replace)
                .collect();
            el.set_attribute("class", &remaining.join(" "))?;
        }
        DomAction::Remove => el.remove(),
    }
    Ok(())
}

/// Rewrites an outbound path+query per spec §4.5 step 8: `find` is matched
/// against the path, `replace` substitutes it, matching query keys are
/// renamed, and when `filter` is non-empty only the listed keys survive.
pub fn apply_url_rewrite(rule: &CompiledUrlRewrite, path: &str, query: &str) -> (String, String) {
    let new_path = rule.find.replace_all(path, rule.replace.as_str()).into_owned();

    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| rule.filter.is_empty() || rule.filter.contains(k))
        .map(|(k, v)| {
            let renamed = rule
                .query
                .iter()
                .find(|q| q.from == k)
                .map(|q| q.to.clone())
                .unwrap_or(k);
            (renamed, v)
        })
        .collect();

    // Rewrite is deterministic even when the source had no query at all but
    // a rename rule still injects a static pair is out of scope: only
    // present keys are ever renamed or dropped.
    let new_query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.drain(..))
        .finish();

    (new_path, new_query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompiledUrlRewrite, QueryRename};
    use regex::Regex;
    use std::sync::Arc;

    fn regex_rewrite(from: RewriteFrom, find: &str, replace: &str) -> CompiledRewrite {
        CompiledRewrite {
            engine: RewriteEngine::Regex,
            from,
            find_regex: Some(Arc::new(Regex::new(find).unwrap())),
            replace: replace.to_string(),
            selector: None,
            action: None,
            target: DomTarget::All,
            attr: None,
        }
    }

    fn dom_rewrite(selector: &str, action: DomAction, replace: &str, attr: Option<&str>, target: DomTarget) -> CompiledRewrite {
        CompiledRewrite {
            engine: RewriteEngine::Dom,
            from: RewriteFrom::ResponseBody,
            find_regex: None,
            replace: replace.to_string(),
            selector: Some(selector.to_string()),
            action: Some(action),
            target,
            attr: attr.map(String::from),
        }
    }

    #[test]
    fn regex_rewrite_replaces_matching_surface_only() {
        let rules = vec![
            regex_rewrite(RewriteFrom::ResponseBody, "bank\\.com", "phish.example"),
            regex_rewrite(RewriteFrom::RequestBody, "unused", "nope"),
        ];
        let out = apply_regex_rewrites(&rules, RewriteFrom::ResponseBody, "go to bank.com now");
        assert_eq!(out, "go to phish.example now");
    }

    #[test]
    fn dom_set_text_rewrites_all_by_default() {
        let rules = vec![dom_rewrite("span.name", DomAction::SetText, "Redacted", None, DomTarget::All)];
        let html = "<p><span class=\"name\">Alice</span> and <span class=\"name\">Bob</span></p>";
        let out = apply_dom_rewrites(&rules, html).unwrap();
        assert_eq!(out.matches("Redacted").count(), 2);
    }

    #[test]
    fn dom_set_attr_targets_first_only() {
        let rules = vec![dom_rewrite(
            "a",
            DomAction::SetAttr,
            "https://phish.example",
            Some("href"),
            DomTarget::First,
        )];
        let html = r#"<a href="https://real.example/a">A</a><a href="https://real.example/b">B</a>"#;
        let out = apply_dom_rewrites(&rules, html).unwrap();
        assert!(out.contains(r#"href="https://phish.example""#));
        assert!(out.contains(r#"href="https://real.example/b""#));
    }

    #[test]
    fn dom_remove_strips_element() {
        let rules = vec![dom_rewrite("script", DomAction::Remove, "", None, DomTarget::All)];
        let html = "<html><body><script>evil()</script><p>hi</p></body></html>";
        let out = apply_dom_rewrites(&rules, html).unwrap();
        assert!(!out.contains("script"));
        assert!(out.contains("<p>hi</p>"));
    }

    #[test]
    fn url_rewrite_renames_and_filters_query() {
        let rule = CompiledUrlRewrite {
            find: Arc::new(Regex::new("^/old-login$").unwrap()),
            replace: "/login".to_string(),
            query: vec![QueryRename {
                from: "ref".to_string(),
                to: "source".to_string(),
            }],
            filter: ["debug".to_string()].into_iter().collect(),
        };
        let (path, query) = apply_url_rewrite(&rule, "/old-login", "ref=email&debug=1");
        assert_eq!(path, "/login");
        assert_eq!(query, "debug=1");
    }
}
