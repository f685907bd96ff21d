//! Redaction of sensitive request and response data.
//!
//! Every log event and every captured snapshot passes through a [`Sanitizer`]
//! before it leaves the crate. Sensitive header, query-parameter and JSON
//! body field values are replaced with the literal `[REDACTED]`.

use std::collections::HashSet;

use http::HeaderMap;
use serde_json::Value;
use url::Url;

/// Replacement literal for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Bodies larger than this are never inspected or rewritten.
const MAX_INSPECTED_BODY: usize = 10 * 1024;

const DEFAULT_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api-key",
    "x-auth-token",
    "cookie",
    "set-cookie",
    "x-csrf-token",
    "x-xsrf-token",
    "proxy-authorization",
    "x-access-token",
];

const DEFAULT_QUERY: &[&str] = &[
    "token",
    "api_key",
    "apikey",
    "password",
    "secret",
    "access_token",
    "refresh_token",
    "auth",
    "key",
    "credential",
];

const DEFAULT_BODY_FIELDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_token",
    "accesstoken",
    "refresh_token",
    "refreshtoken",
    "credential",
    "credentials",
    "private_key",
    "privatekey",
];

const STRICT_EXTRA_HEADERS: &[&str] =
    &["x-session-token", "x-client-secret", "x-amz-security-token"];

const STRICT_EXTRA_QUERY: &[&str] = &["session", "sig", "signature", "code"];

const STRICT_EXTRA_BODY_FIELDS: &[&str] =
    &["client_secret", "clientsecret", "session_token", "sessiontoken", "pin"];

/// Enumerates sensitive keys for the three redaction contexts.
///
/// Matching is case-insensitive in all three contexts. The [`default`]
/// preset covers the common credential-bearing keys, [`strict`] is a
/// superset of it, and [`none`] disables redaction entirely (intended for
/// local debugging only).
///
/// [`default`]: Sanitizer::default
/// [`strict`]: Sanitizer::strict
/// [`none`]: Sanitizer::none
#[derive(Debug, Clone)]
pub struct Sanitizer {
    headers: HashSet<String>,
    query: HashSet<String>,
    body_fields: HashSet<String>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::from_sets(DEFAULT_HEADERS, DEFAULT_QUERY, DEFAULT_BODY_FIELDS)
    }
}

impl Sanitizer {
    fn from_sets(
        headers: &[&str],
        query: &[&str],
        body_fields: &[&str],
    ) -> Self {
        Self {
            headers: headers.iter().map(|s| (*s).to_owned()).collect(),
            query: query.iter().map(|s| (*s).to_owned()).collect(),
            body_fields: body_fields.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// A sanitizer that redacts nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::from_sets(&[], &[], &[])
    }

    /// A superset of the default key sets.
    #[must_use]
    pub fn strict() -> Self {
        let mut s = Self::default();
        s.headers.extend(STRICT_EXTRA_HEADERS.iter().map(|h| (*h).to_owned()));
        s.query.extend(STRICT_EXTRA_QUERY.iter().map(|q| (*q).to_owned()));
        s.body_fields
            .extend(STRICT_EXTRA_BODY_FIELDS.iter().map(|f| (*f).to_owned()));
        s
    }

    /// Adds a sensitive header name to the set.
    pub fn redact_header(&mut self, name: &str) {
        self.headers.insert(name.to_ascii_lowercase());
    }

    /// Adds a sensitive query parameter name to the set.
    pub fn redact_query(&mut self, name: &str) {
        self.query.insert(name.to_ascii_lowercase());
    }

    /// Adds a sensitive JSON body field name to the set.
    pub fn redact_body_field(&mut self, name: &str) {
        self.body_fields.insert(name.to_ascii_lowercase());
    }

    fn is_sensitive_header(&self, name: &str) -> bool {
        self.headers.contains(&name.to_ascii_lowercase())
    }

    fn is_sensitive_query(&self, name: &str) -> bool {
        self.query.contains(&name.to_ascii_lowercase())
    }

    fn is_sensitive_field(&self, name: &str) -> bool {
        self.body_fields.contains(&name.to_ascii_lowercase())
    }

    /// Produces a redacted copy of a header map as name/value pairs.
    pub fn headers(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| {
                let rendered = if self.is_sensitive_header(name.as_str()) {
                    REDACTED.to_owned()
                } else {
                    value.to_str().unwrap_or(REDACTED).to_owned()
                };
                (name.as_str().to_owned(), rendered)
            })
            .collect()
    }

    /// Renders a URL with sensitive query parameter values redacted.
    pub fn url(&self, url: &Url) -> String {
        if url.query().is_none() {
            return url.to_string();
        }
        let mut redacted = url.clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let value = if self.is_sensitive_query(&k) {
                    REDACTED.to_owned()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), value)
            })
            .collect();
        redacted.set_query(None);
        {
            let mut serializer = redacted.query_pairs_mut();
            for (k, v) in &pairs {
                serializer.append_pair(k, v);
            }
        }
        redacted.to_string()
    }

    /// Redacts sensitive fields inside a JSON body.
    ///
    /// Returns `None` when the body is left untouched: larger than 10 KiB,
    /// not declared as `application/json`, or not parseable as JSON. The
    /// walk is recursive across objects and arrays.
    pub fn body(
        &self,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Option<Vec<u8>> {
        if body.len() > MAX_INSPECTED_BODY {
            return None;
        }
        let is_json = content_type
            .is_some_and(|ct| ct.split(';').next() == Some("application/json"));
        if !is_json {
            return None;
        }
        let mut value: Value = serde_json::from_slice(body).ok()?;
        self.redact_value(&mut value);
        serde_json::to_vec(&value).ok()
    }

    fn redact_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.is_sensitive_field(key) {
                        *child = Value::String(REDACTED.to_owned());
                    } else {
                        self.redact_value(child);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_value(item);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{AUTHORIZATION, CONTENT_TYPE};

    #[test]
    fn default_redacts_authorization_header() {
        let sanitizer = Sanitizer::default();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());

        let rendered = sanitizer.headers(&headers);
        let auth =
            rendered.iter().find(|(name, _)| name == "authorization").unwrap();
        assert_eq!(auth.1, REDACTED);
        let ct =
            rendered.iter().find(|(name, _)| name == "content-type").unwrap();
        assert_eq!(ct.1, "application/json");
    }

    #[test]
    fn header_match_is_case_insensitive() {
        let sanitizer = Sanitizer::default();
        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", "s3cr3t".parse().unwrap());
        let rendered = sanitizer.headers(&headers);
        assert_eq!(rendered[0].1, REDACTED);
    }

    #[test]
    fn url_query_values_are_redacted() {
        let sanitizer = Sanitizer::default();
        let url =
            Url::parse("https://api.example.com/x?token=xyz&page=2").unwrap();
        let rendered = sanitizer.url(&url);
        assert!(rendered.contains("token=%5BREDACTED%5D"));
        assert!(rendered.contains("page=2"));
        assert!(!rendered.contains("xyz"));
    }

    #[test]
    fn url_without_query_is_untouched() {
        let sanitizer = Sanitizer::default();
        let url = Url::parse("https://api.example.com/items").unwrap();
        assert_eq!(sanitizer.url(&url), "https://api.example.com/items");
    }

    #[test]
    fn json_body_is_redacted_recursively() {
        let sanitizer = Sanitizer::default();
        let body = serde_json::json!({
            "user": "amy",
            "password": "hunter2",
            "nested": { "apiKey": "k", "list": [{ "secret": "s" }] }
        });
        let out = sanitizer
            .body(
                serde_json::to_vec(&body).unwrap().as_slice(),
                Some("application/json"),
            )
            .unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["password"], REDACTED);
        assert_eq!(parsed["nested"]["apiKey"], REDACTED);
        assert_eq!(parsed["nested"]["list"][0]["secret"], REDACTED);
        assert_eq!(parsed["user"], "amy");
    }

    #[test]
    fn non_json_bodies_are_skipped() {
        let sanitizer = Sanitizer::default();
        assert!(sanitizer.body(b"password=hunter2", Some("text/plain")).is_none());
        assert!(sanitizer.body(b"{}", None).is_none());
    }

    #[test]
    fn oversized_bodies_are_skipped() {
        let sanitizer = Sanitizer::default();
        let body = vec![b'a'; MAX_INSPECTED_BODY + 1];
        assert!(sanitizer.body(&body, Some("application/json")).is_none());
    }

    #[test]
    fn strict_is_a_superset_of_default() {
        let default = Sanitizer::default();
        let strict = Sanitizer::strict();
        for name in &default.headers {
            assert!(strict.headers.contains(name));
        }
        for name in &default.query {
            assert!(strict.query.contains(name));
        }
        for name in &default.body_fields {
            assert!(strict.body_fields.contains(name));
        }
        assert!(strict.headers.len() > default.headers.len());
    }

    #[test]
    fn none_preset_redacts_nothing() {
        let sanitizer = Sanitizer::none();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(sanitizer.headers(&headers)[0].1, "Bearer abc");
    }
}
