// src/rules.rs

//! Declarative response-rewrite rules.
//!
//! A rule matches when every predicate in its `when` clause holds. The body
//! predicate is special: when the body has not been read yet the rule is
//! reported as needing it instead of failing, so callers only buffer bodies
//! that could actually change the outcome.

use std::collections::BTreeMap;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::actions::Action;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub when: Option<When>,
    #[serde(default)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct When {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_includes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, HeaderExpectation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_includes: Option<String>,
}

/// What a `headers` entry requires of the request header.
///
/// Written as `true` or `""` in JSON for [`HeaderExpectation::Present`] and as
/// a string for a case-insensitive substring match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HeaderValueRepr", into = "HeaderValueRepr")]
pub enum HeaderExpectation {
    Present,
    Contains(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum HeaderValueRepr {
    Flag(bool),
    Text(String),
}

impl From<HeaderValueRepr> for HeaderExpectation {
    fn from(repr: HeaderValueRepr) -> Self {
        match repr {
            HeaderValueRepr::Flag(true) => HeaderExpectation::Present,
            HeaderValueRepr::Flag(false) => HeaderExpectation::Contains("false".to_string()),
            HeaderValueRepr::Text(text) if text.is_empty() => HeaderExpectation::Present,
            HeaderValueRepr::Text(text) => HeaderExpectation::Contains(text),
        }
    }
}

impl From<HeaderExpectation> for HeaderValueRepr {
    fn from(expectation: HeaderExpectation) -> Self {
        match expectation {
            HeaderExpectation::Present => HeaderValueRepr::Flag(true),
            HeaderExpectation::Contains(text) => HeaderValueRepr::Text(text),
        }
    }
}

/// The request/response facts a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    pub method: &'a str,
    pub url: &'a str,
    /// Response content type, parameters included
    pub content_type: &'a str,
    /// Request headers
    pub headers: &'a HeaderMap,
    /// Decoded response body, once read
    pub body_text: Option<&'a str>,
}

impl<'a> MatchContext<'a> {
    pub fn with_body(self, body_text: &'a str) -> Self {
        MatchContext {
            body_text: Some(body_text),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Match,
    NoMatch,
    NeedsBody,
}

/// Lowercased media type with parameters stripped.
///
/// # Examples
///
/// ```
/// use packet_forge::rules::normalize_content_type;
///
/// assert_eq!(normalize_content_type("Text/HTML; charset=utf-8"), "text/html");
/// ```
pub fn normalize_content_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Joined values of `name`; a header sent empty counts as absent.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let joined = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.trim().is_empty() {
        return None;
    }
    Some(joined)
}

pub fn evaluate(rule: &Rule, ctx: &MatchContext<'_>) -> Evaluation {
    if !rule.enabled {
        return Evaluation::NoMatch;
    }
    let Some(when) = rule.when.as_ref() else {
        return Evaluation::NoMatch;
    };

    if let Some(method) = when.method.as_deref() {
        if !method.eq_ignore_ascii_case(ctx.method) {
            return Evaluation::NoMatch;
        }
    }

    if let Some(needle) = when.url_includes.as_deref() {
        if !ctx.url.contains(needle) {
            return Evaluation::NoMatch;
        }
    }

    if let Some(expected) = when.content_type.as_deref() {
        if normalize_content_type(expected) != normalize_content_type(ctx.content_type) {
            return Evaluation::NoMatch;
        }
    }

    if let Some(headers) = when.headers.as_ref() {
        for (name, expectation) in headers {
            let Some(actual) = header_value(ctx.headers, &name.to_ascii_lowercase()) else {
                return Evaluation::NoMatch;
            };
            if let HeaderExpectation::Contains(needle) = expectation {
                if !actual.to_lowercase().contains(&needle.to_lowercase()) {
                    return Evaluation::NoMatch;
                }
            }
        }
    }

    if let Some(needle) = when.body_includes.as_deref().map(str::trim) {
        if !needle.is_empty() {
            match ctx.body_text {
                None => return Evaluation::NeedsBody,
                Some(body) => {
                    if !body.to_lowercase().contains(&needle.to_lowercase()) {
                        return Evaluation::NoMatch;
                    }
                }
            }
        }
    }

    Evaluation::Match
}

/// Rules split by evaluation outcome, in input order.
#[derive(Debug, Default)]
pub struct Candidates<'r> {
    pub matches: Vec<&'r Rule>,
    pub needs_body: Vec<&'r Rule>,
}

pub fn collect_rule_candidates<'r>(rules: &'r [Rule], ctx: &MatchContext<'_>) -> Candidates<'r> {
    let mut candidates = Candidates::default();
    for rule in rules {
        match evaluate(rule, ctx) {
            Evaluation::Match => candidates.matches.push(rule),
            Evaluation::NeedsBody => candidates.needs_body.push(rule),
            Evaluation::NoMatch => {}
        }
    }
    candidates
}

/// Highest priority rule; the first one wins a tie.
pub fn select_best_rule<'r>(rules: &[&'r Rule]) -> Option<&'r Rule> {
    let mut best: Option<&'r Rule> = None;
    for &rule in rules {
        match best {
            Some(current) if rule.priority <= current.priority => {}
            _ => best = Some(rule),
        }
    }
    best
}

/// Best matching rule for a fully known context.
///
/// # Examples
///
/// ```
/// use http::HeaderMap;
/// use packet_forge::rules::{select_rule, MatchContext, Rule};
///
/// let rules: Vec<Rule> = serde_json::from_str(r#"[
///     {"id": "a", "when": {"urlIncludes": "/test"}, "priority": 1},
///     {"id": "b", "when": {"urlIncludes": "/test"}, "priority": 10}
/// ]"#).unwrap();
///
/// let headers = HeaderMap::new();
/// let ctx = MatchContext {
///     method: "GET",
///     url: "https://example.com/test",
///     content_type: "",
///     headers: &headers,
///     body_text: None,
/// };
/// assert_eq!(select_rule(&rules, &ctx).map(|r| r.id.as_str()), Some("b"));
/// ```
pub fn select_rule<'r>(rules: &'r [Rule], ctx: &MatchContext<'_>) -> Option<&'r Rule> {
    select_best_rule(&collect_rule_candidates(rules, ctx).matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn rules(json: &str) -> Vec<Rule> {
        serde_json::from_str(json).unwrap()
    }

    fn ctx<'a>(method: &'a str, url: &'a str, content_type: &'a str, headers: &'a HeaderMap) -> MatchContext<'a> {
        MatchContext {
            method,
            url,
            content_type,
            headers,
            body_text: None,
        }
    }

    #[test]
    fn test_matches_method_and_url() {
        let rule = &rules(r#"[{"when": {"method": "GET", "urlIncludes": "/assets/"}}]"#)[0];
        let headers = HeaderMap::new();
        assert_eq!(
            evaluate(rule, &ctx("get", "https://example.com/assets/app.js", "", &headers)),
            Evaluation::Match
        );
        assert_eq!(
            evaluate(rule, &ctx("POST", "https://example.com/assets/app.js", "", &headers)),
            Evaluation::NoMatch
        );
    }

    #[test]
    fn test_url_includes_is_case_sensitive() {
        let rule = &rules(r#"[{"when": {"urlIncludes": "/Assets"}}]"#)[0];
        let headers = HeaderMap::new();
        assert_eq!(
            evaluate(rule, &ctx("GET", "https://example.com/assets", "", &headers)),
            Evaluation::NoMatch
        );
    }

    #[test]
    fn test_content_type() {
        let headers = HeaderMap::new();
        let png = &rules(r#"[{"when": {"contentType": "image/png"}}]"#)[0];
        assert_eq!(
            evaluate(png, &ctx("GET", "https://e.com/a.png", "image/jpeg", &headers)),
            Evaluation::NoMatch
        );

        let html = &rules(r#"[{"when": {"contentType": "Text/Html"}}]"#)[0];
        assert_eq!(
            evaluate(html, &ctx("GET", "https://e.com", "text/html; charset=utf-8", &headers)),
            Evaluation::Match
        );
    }

    #[test]
    fn test_headers() {
        let rule = &rules(r#"[{"when": {"headers": {"User-Agent": "mozilla", "Accept": true, "X-Empty": ""}}}]"#)[0];
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        assert_eq!(evaluate(rule, &ctx("GET", "/", "", &headers)), Evaluation::NoMatch);

        headers.insert("x-empty", HeaderValue::from_static(""));
        assert_eq!(evaluate(rule, &ctx("GET", "/", "", &headers)), Evaluation::Match);

        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        assert_eq!(evaluate(rule, &ctx("GET", "/", "", &headers)), Evaluation::NoMatch);
    }

    #[test]
    fn test_body_includes() {
        let rule = &rules(r#"[{"when": {"urlIncludes": "/test", "bodyIncludes": "Hello"}}]"#)[0];
        let headers = HeaderMap::new();
        let base = ctx("GET", "https://e.com/test", "", &headers);
        assert_eq!(evaluate(rule, &base), Evaluation::NeedsBody);
        assert_eq!(evaluate(rule, &base.with_body("Say hello world")), Evaluation::Match);
        assert_eq!(evaluate(rule, &base.with_body("goodbye")), Evaluation::NoMatch);

        // a failing cheap predicate wins over the body requirement
        let other = ctx("GET", "https://e.com/other", "", &headers);
        assert_eq!(evaluate(rule, &other), Evaluation::NoMatch);

        let blank = &rules(r#"[{"when": {"bodyIncludes": "   "}}]"#)[0];
        assert_eq!(evaluate(blank, &base), Evaluation::Match);
    }

    #[test]
    fn test_disabled_or_missing_when() {
        let set = rules(r#"[{"enabled": false, "when": {}}, {"id": "no-when"}, {"when": {}}]"#);
        let headers = HeaderMap::new();
        let c = ctx("GET", "/", "", &headers);
        assert_eq!(evaluate(&set[0], &c), Evaluation::NoMatch);
        assert_eq!(evaluate(&set[1], &c), Evaluation::NoMatch);
        assert_eq!(evaluate(&set[2], &c), Evaluation::Match);
    }

    #[test]
    fn test_collect_candidates() {
        let set = rules(
            r#"[
                {"id": "a", "when": {"urlIncludes": "/test", "bodyIncludes": "hello"}},
                {"id": "b", "when": {"urlIncludes": "/other"}},
                {"id": "c", "when": {"urlIncludes": "/te"}}
            ]"#,
        );
        let headers = HeaderMap::new();
        let result = collect_rule_candidates(&set, &ctx("GET", "https://e.com/test", "", &headers));
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].id, "c");
        assert_eq!(result.needs_body.len(), 1);
        assert_eq!(result.needs_body[0].id, "a");
    }

    #[test]
    fn test_select_prefers_priority_then_order() {
        let set = rules(
            r#"[
                {"id": "a", "when": {"urlIncludes": "/test"}, "priority": 1},
                {"id": "b", "when": {"urlIncludes": "/test"}, "priority": 10},
                {"id": "c", "when": {"urlIncludes": "/test"}, "priority": 10},
                {"id": "d", "enabled": false, "when": {"urlIncludes": "/test"}, "priority": 99}
            ]"#,
        );
        let headers = HeaderMap::new();
        let selected = select_rule(&set, &ctx("GET", "https://e.com/test", "", &headers));
        assert_eq!(selected.map(|r| r.id.as_str()), Some("b"));

        let ties = rules(r#"[{"id": "x", "when": {}}, {"id": "y", "when": {}}]"#);
        let selected = select_rule(&ties, &ctx("GET", "/", "", &headers));
        assert_eq!(selected.map(|r| r.id.as_str()), Some("x"));
    }

    #[test]
    fn test_select_best_empty() {
        assert!(select_best_rule(&[]).is_none());
    }

    #[test]
    fn test_empty_header_value_is_absent() {
        let rules = rules(r#"[{"id": "auth", "when": {"headers": {"Authorization": ""}}}]"#);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static(""));
        assert!(select_rule(&rules, &ctx("GET", "/", "", &headers)).is_none());

        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        assert!(select_rule(&rules, &ctx("GET", "/", "", &headers)).is_some());
    }

    #[test]
    fn test_header_expectation_serde() {
        let when: When = serde_json::from_str(r#"{"headers": {"a": true, "b": "x", "c": ""}}"#).unwrap();
        let headers = when.headers.unwrap();
        assert_eq!(headers["a"], HeaderExpectation::Present);
        assert_eq!(headers["b"], HeaderExpectation::Contains("x".into()));
        assert_eq!(headers["c"], HeaderExpectation::Present);
    }
}
