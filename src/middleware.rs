//! Axum middleware that runs each request inside a capture and decorates
//! JSON responses with the diagnostics.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{
        header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE},
        request::Parts,
        HeaderMap,
    },
    middleware::Next,
    response::Response,
};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value as JsonValue};

use crate::analyzer::{Analyzer, DiagnosticSummary};
use crate::callsite::{BacktraceResolver, CallSiteResolver};
use crate::config::DebuggerConfig;
use crate::error::{DebuggerError, Result};
use crate::gate::{ActivationGate, EnvGate};
use crate::recorder::{DebugCapture, QueryRecorder};
use crate::request::{is_json_media_type, RequestInfo};

/// Top-level key merged into JSON responses.
pub const DEBUGGER_KEY: &str = "debugger";

/// Shared debugger state, handed to [`debugger_middleware`] as axum state.
///
/// # Example
///
/// ```rust,ignore
/// use axum::{middleware, routing::get, Router};
/// use sea_orm_debugger::{debugger_middleware, ApiDebugger, DebuggerConfig};
///
/// let debugger = ApiDebugger::new(DebuggerConfig::default());
/// let app = Router::new()
///     .route("/users", get(list_users))
///     .layer(middleware::from_fn_with_state(debugger, debugger_middleware));
/// ```
#[derive(Clone)]
pub struct ApiDebugger {
    gate: Arc<dyn ActivationGate>,
    resolver: Arc<dyn CallSiteResolver>,
    config: Arc<DebuggerConfig>,
}

impl ApiDebugger {
    /// Gate on `APP_DEBUG` and attribute call sites from backtraces.
    pub fn new(config: DebuggerConfig) -> Self {
        let resolver = BacktraceResolver::new(config.excluded_paths.clone(), config.call_site_limit);
        Self {
            gate: Arc::new(EnvGate::default()),
            resolver: Arc::new(resolver),
            config: Arc::new(config),
        }
    }

    pub fn with_gate(mut self, gate: impl ActivationGate + 'static) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    pub fn with_resolver(mut self, resolver: impl CallSiteResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    pub fn recorder(&self) -> QueryRecorder {
        QueryRecorder::new(
            self.gate.clone(),
            self.resolver.clone(),
            Analyzer::from_config(&self.config),
        )
    }

    /// The `{"debugger": {"queries": .., "request": ..}}` payload.
    pub fn payload(summary: &DiagnosticSummary, request: &RequestInfo) -> JsonValue {
        json!({
            DEBUGGER_KEY: {
                "queries": summary,
                "request": request,
            }
        })
    }

    /// Buffer the request body for the echo and put it back.
    ///
    /// Bodies declared or found to be larger than the configured limit, and
    /// bodies whose stream fails, are left out of the echo. The handler still
    /// receives every byte (or the same stream error) it would have seen
    /// without the debugger.
    async fn capture_request(&self, req: Request) -> (Request, RequestInfo) {
        let (parts, body) = req.into_parts();
        let limit = self.config.max_body_bytes;

        if declared_length(&parts).is_some_and(|len| len > limit) {
            let error = DebuggerError::TooLarge { limit };
            tracing::debug!(error = %error, "Request body not echoed");
            let info = RequestInfo::from_parts(&parts, &[], &self.config.redaction);
            return (Request::from_parts(parts, body), info);
        }

        match buffer_body(body, limit).await {
            Buffered::Complete(bytes) => {
                let info = RequestInfo::from_parts(&parts, &bytes, &self.config.redaction);
                (Request::from_parts(parts, Body::from(bytes)), info)
            }
            Buffered::Replayed(body) => {
                let info = RequestInfo::from_parts(&parts, &[], &self.config.redaction);
                (Request::from_parts(parts, body), info)
            }
        }
    }
}

enum Buffered {
    Complete(Bytes),
    /// The chunks read so far chained with the rest of the original stream.
    Replayed(Body),
}

async fn buffer_body(body: Body, limit: usize) -> Buffered {
    let mut frames = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(chunk) => {
                total += chunk.len();
                chunks.push(chunk);
                if total > limit {
                    let error = DebuggerError::TooLarge { limit };
                    tracing::debug!(error = %error, "Request body not echoed");
                    let read = stream::iter(chunks.into_iter().map(Ok));
                    return Buffered::Replayed(Body::from_stream(read.chain(frames)));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not buffer request body");
                let read = chunks.into_iter().map(Ok).chain(std::iter::once(Err(e)));
                return Buffered::Replayed(Body::from_stream(stream::iter(read)));
            }
        }
    }

    match chunks.len() {
        0 => Buffered::Complete(Bytes::new()),
        1 => Buffered::Complete(chunks.swap_remove(0)),
        _ => Buffered::Complete(Bytes::from(chunks.concat())),
    }
}

impl std::fmt::Debug for ApiDebugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiDebugger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Capture the queries of one request and merge them into its JSON response.
///
/// The response is returned unmodified when debugging is inactive, the
/// client did not ask for JSON, or the body is not a JSON object.
pub async fn debugger_middleware(
    State(debugger): State<ApiDebugger>,
    mut req: Request,
    next: Next,
) -> Response {
    let capture = debugger.recorder().start_capture();
    req.extensions_mut().insert(capture.clone());
    if !capture.is_listening() {
        return next.run(req).await;
    }

    if !expects_json(req.headers()) {
        return capture.scope(next.run(req)).await;
    }
    let (req, request_info) = debugger.capture_request(req).await;

    let response = capture.scope(next.run(req)).await;

    if !debugger.is_active() {
        return response;
    }
    decorate(response, &capture, &request_info).await
}

async fn decorate(response: Response, capture: &DebugCapture, request: &RequestInfo) -> Response {
    if !is_json_response(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %DebuggerError::from(e), "Could not read response body");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let mut object = match parse_object(&bytes) {
        Ok(object) => object,
        Err(e) => {
            tracing::debug!(error = %e, "Response left undecorated");
            return Response::from_parts(parts, Body::from(bytes));
        }
    };

    let summary = capture.summary();
    log_summary(&summary);

    if let JsonValue::Object(payload) = ApiDebugger::payload(&summary, request) {
        object.extend(payload);
    }
    match serde_json::to_vec(&object) {
        Ok(decorated) => {
            parts.headers.remove(CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(decorated))
        }
        Err(e) => {
            tracing::error!(error = %DebuggerError::from(e), "Could not encode decorated response");
            Response::from_parts(parts, Body::from(bytes))
        }
    }
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, JsonValue>> {
    match serde_json::from_slice(bytes)? {
        JsonValue::Object(object) => Ok(object),
        _ => Err(DebuggerError::NotAnObject),
    }
}

fn log_summary(summary: &DiagnosticSummary) {
    for group in &summary.repeated_queries {
        tracing::warn!(
            count = group.count,
            sql = %group.sql,
            "Repeated query detected (possible N+1)"
        );
    }
    tracing::debug!(
        count = summary.count,
        time_ms = summary.time,
        slow = summary.slow_queries.len(),
        "Request query diagnostics"
    );
}

fn declared_length(parts: &Parts) -> Option<usize> {
    parts
        .headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn is_json_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| is_json_media_type(&v.to_ascii_lowercase()))
        .unwrap_or(false)
}

/// Whether the client wants a JSON answer.
///
/// True when the preferred `Accept` media type (highest `q`, header order
/// breaking ties) is JSON, or for an XHR (not PJAX) request that accepts any
/// content type.
pub fn expects_json(headers: &HeaderMap) -> bool {
    let acceptable = acceptable_content_types(headers);
    let first = acceptable.first().map(String::as_str);

    if first.is_some_and(|t| t.contains("/json") || t.contains("+json")) {
        return true;
    }

    let is_xhr = headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"));
    let is_pjax = headers.contains_key("x-pjax");
    let accepts_any = match first {
        None => true,
        Some(t) => t == "*/*" || t == "*",
    };

    is_xhr && !is_pjax && accepts_any
}

/// `Accept` media types, most preferred first.
fn acceptable_content_types(headers: &HeaderMap) -> Vec<String> {
    let mut types: Vec<(String, f32)> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|entry| {
            let mut params = entry.split(';');
            let media = params.next()?.trim().to_ascii_lowercase();
            if media.is_empty() {
                return None;
            }
            let quality = params
                .filter_map(|p| p.split_once('='))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("q"))
                .and_then(|(_, v)| v.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((media, quality))
        })
        .collect();

    // stable: equal qualities keep header order
    types.sort_by(|a, b| b.1.total_cmp(&a.1));
    types.into_iter().map(|(media, _)| media).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_expects_json_from_accept() {
        assert!(expects_json(&headers(&[("accept", "application/json")])));
        assert!(expects_json(&headers(&[("accept", "application/vnd.api+json, text/html")])));
        assert!(!expects_json(&headers(&[("accept", "text/html, application/json")])));
        assert!(!expects_json(&headers(&[])));
    }

    #[test]
    fn test_expects_json_honours_quality() {
        assert!(expects_json(&headers(&[("accept", "text/html;q=0.5, application/json")])));
        assert!(expects_json(&headers(&[("accept", "text/html; q=0.9, application/json; q=1")])));
        assert!(!expects_json(&headers(&[("accept", "application/json;q=0.1, text/html")])));
        assert!(expects_json(&headers(&[
            ("accept", "text/html;q=0.2"),
            ("accept", "application/problem+json"),
        ])));
    }

    #[test]
    fn test_acceptable_content_types_order() {
        let types = acceptable_content_types(&headers(&[(
            "accept",
            "text/plain;q=0.5, text/html, */*;q=0.1, application/xml",
        )]));
        assert_eq!(types, vec!["text/html", "application/xml", "text/plain", "*/*"]);
    }

    #[test]
    fn test_expects_json_from_xhr() {
        assert!(expects_json(&headers(&[("x-requested-with", "XMLHttpRequest")])));
        assert!(expects_json(&headers(&[
            ("x-requested-with", "XMLHttpRequest"),
            ("accept", "*/*"),
        ])));
        assert!(!expects_json(&headers(&[
            ("x-requested-with", "XMLHttpRequest"),
            ("x-pjax", "true"),
        ])));
        assert!(!expects_json(&headers(&[
            ("x-requested-with", "XMLHttpRequest"),
            ("accept", "text/html"),
        ])));
        assert!(expects_json(&headers(&[
            ("x-requested-with", "XMLHttpRequest"),
            ("accept", "text/html;q=0.3, */*"),
        ])));
    }

    #[test]
    fn test_json_response_detection() {
        assert!(is_json_response(&headers(&[("content-type", "application/json")])));
        assert!(is_json_response(&headers(&[("content-type", "Application/JSON; charset=utf-8")])));
        assert!(!is_json_response(&headers(&[("content-type", "text/html")])));
        assert!(!is_json_response(&headers(&[])));
    }

    #[test]
    fn test_parse_object() {
        assert!(parse_object(br#"{"a": 1}"#).is_ok());
        assert!(matches!(parse_object(b"[1]"), Err(DebuggerError::NotAnObject)));
        assert!(matches!(parse_object(b"<html>"), Err(DebuggerError::Json(_))));
    }

    #[test]
    fn test_payload_shape() {
        let summary = Analyzer::default().analyze(&[]);
        let payload = ApiDebugger::payload(&summary, &RequestInfo::default());
        assert_eq!(
            payload,
            json!({
                "debugger": {
                    "queries": {
                        "count": 0,
                        "time": 0.0,
                        "data": [],
                        "long_queries": [],
                        "repeated_queries": [],
                    },
                    "request": {"body": {}, "headers": {}},
                }
            })
        );
    }
}
