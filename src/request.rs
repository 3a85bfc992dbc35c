//! The request echo included next to the query diagnostics.

use std::collections::{BTreeMap, BTreeSet};

use http::header::CONTENT_TYPE;
use http::request::Parts;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::DebuggerError;

/// Body keys never echoed back.
pub const DEFAULT_REDACTED_KEYS: &[&str] = &[
    "password",
    "confirm_password",
    "password_confirmation",
    "_token",
    "_method",
    "_destination",
    "destination",
    "_modal",
];

/// Which body keys and headers are dropped from [`RequestInfo`].
///
/// Matching is case-insensitive. Redacted entries are removed, not masked.
#[derive(Debug, Clone)]
pub struct RedactionRules {
    keys: BTreeSet<String>,
    headers: BTreeSet<String>,
}

impl Default for RedactionRules {
    fn default() -> Self {
        Self {
            keys: DEFAULT_REDACTED_KEYS.iter().map(|k| k.to_string()).collect(),
            headers: BTreeSet::new(),
        }
    }
}

impl RedactionRules {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.insert(key.into().to_ascii_lowercase());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase());
        self
    }

    pub fn is_key_redacted(&self, key: &str) -> bool {
        self.keys.contains(&key.to_ascii_lowercase())
    }

    pub fn is_header_redacted(&self, name: &str) -> bool {
        self.headers.contains(&name.to_ascii_lowercase())
    }
}

/// Body fields and headers of the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestInfo {
    pub body: Map<String, JsonValue>,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl RequestInfo {
    /// Build the echo from the request head and its buffered body.
    ///
    /// Query-string parameters and body fields are merged, the body winning
    /// on conflicting keys. JSON object and urlencoded form bodies are
    /// understood; any other body contributes no fields.
    pub fn from_parts(parts: &Parts, body: &[u8], rules: &RedactionRules) -> Self {
        let mut fields = parts
            .uri
            .query()
            .map(|q| parse_form(q.as_bytes()))
            .unwrap_or_default();

        match parse_body(parts, body) {
            Ok(body_fields) => fields.extend(body_fields),
            Err(e) => tracing::debug!(error = %e, "Request body not included in debug output"),
        }
        fields.retain(|key, _| !rules.is_key_redacted(key));

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &parts.headers {
            if rules.is_header_redacted(name.as_str()) {
                continue;
            }
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            body: fields,
            headers,
        }
    }
}

fn parse_body(parts: &Parts, body: &[u8]) -> Result<Map<String, JsonValue>, DebuggerError> {
    if body.is_empty() {
        return Ok(Map::new());
    }

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return Ok(parse_form(body));
    }
    if is_json_media_type(&content_type) {
        return match serde_json::from_slice(body)? {
            JsonValue::Object(map) => Ok(map),
            _ => Err(DebuggerError::NotAnObject),
        };
    }
    Err(DebuggerError::UnsupportedBody(content_type))
}

fn parse_form(input: &[u8]) -> Map<String, JsonValue> {
    url::form_urlencoded::parse(input)
        .map(|(k, v)| (k.into_owned(), JsonValue::String(v.into_owned())))
        .collect()
}

/// `application/json`, `application/problem+json` and the like.
pub(crate) fn is_json_media_type(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or_default().trim();
    essence.ends_with("/json") || essence.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parts(uri: &str, content_type: Option<&str>) -> Parts {
        let mut builder = http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("accept", "application/json")
            .header("x-trace", "a")
            .header("x-trace", "b")
            .header("authorization", "Bearer secret");
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_json_body_redacted() {
        let body = json!({
            "email": "a@example.com",
            "password": "hunter2",
            "password_confirmation": "hunter2",
            "_token": "csrf",
            "_method": "PUT",
            "destination": "/home",
            "Password": "still secret",
        });
        let info = RequestInfo::from_parts(
            &parts("/users", Some("application/json")),
            body.to_string().as_bytes(),
            &RedactionRules::default(),
        );

        assert_eq!(info.body, json!({"email": "a@example.com"}).as_object().unwrap().clone());
    }

    #[test]
    fn test_form_body_merges_query() {
        let info = RequestInfo::from_parts(
            &parts("/users?page=2&name=query", Some("application/x-www-form-urlencoded")),
            b"name=form&confirm_password=x&tags=a%20b",
            &RedactionRules::default(),
        );

        assert_eq!(info.body.get("page"), Some(&json!("2")));
        assert_eq!(info.body.get("name"), Some(&json!("form")));
        assert_eq!(info.body.get("tags"), Some(&json!("a b")));
        assert!(!info.body.contains_key("confirm_password"));
    }

    #[test]
    fn test_unparseable_body_contributes_nothing() {
        let rules = RedactionRules::default();
        let info = RequestInfo::from_parts(&parts("/?q=1", Some("application/json")), b"{oops", &rules);
        assert_eq!(info.body.len(), 1);

        let info = RequestInfo::from_parts(&parts("/", Some("text/plain")), b"password=x", &rules);
        assert!(info.body.is_empty());

        let info = RequestInfo::from_parts(&parts("/", Some("application/json")), b"[1, 2]", &rules);
        assert!(info.body.is_empty());
    }

    #[test]
    fn test_headers_grouped_by_name() {
        let info = RequestInfo::from_parts(&parts("/", None), b"", &RedactionRules::default());
        assert_eq!(info.headers["x-trace"], vec!["a", "b"]);
        assert_eq!(info.headers["authorization"], vec!["Bearer secret"]);

        let rules = RedactionRules::default().with_header("Authorization");
        let info = RequestInfo::from_parts(&parts("/", None), b"", &rules);
        assert!(!info.headers.contains_key("authorization"));
    }

    #[test]
    fn test_custom_redacted_key() {
        let rules = RedactionRules::default().with_key("API_KEY");
        assert!(rules.is_key_redacted("api_key"));
        assert!(rules.is_key_redacted("_TOKEN"));
        assert!(!rules.is_key_redacted("email"));
    }

    #[test]
    fn test_json_media_types() {
        assert!(is_json_media_type("application/json"));
        assert!(is_json_media_type("application/json; charset=utf-8"));
        assert!(is_json_media_type("application/problem+json"));
        assert!(!is_json_media_type("text/html"));
        assert!(!is_json_media_type("application/jsonp"));
    }
}
