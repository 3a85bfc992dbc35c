//! Per-request query buffers.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::analyzer::{Analyzer, DiagnosticSummary};
use crate::callsite::CallSiteResolver;
use crate::event::{self, QueryEvent, QueryListener};
use crate::gate::ActivationGate;

/// One captured statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    pub sql: String,
    pub bindings: Vec<JsonValue>,
    /// Elapsed time in milliseconds.
    pub time: f64,
    /// Application call sites, innermost first.
    pub trace: Vec<String>,
}

/// Hands out one [`DebugCapture`] per request.
///
/// Cheap to clone; shared by every request the service handles. It holds no
/// query data itself.
#[derive(Clone)]
pub struct QueryRecorder {
    gate: Arc<dyn ActivationGate>,
    resolver: Arc<dyn CallSiteResolver>,
    analyzer: Analyzer,
}

impl QueryRecorder {
    pub fn new(
        gate: Arc<dyn ActivationGate>,
        resolver: Arc<dyn CallSiteResolver>,
        analyzer: Analyzer,
    ) -> Self {
        Self {
            gate,
            resolver,
            analyzer,
        }
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    /// Begin capturing for a new request.
    ///
    /// The returned capture starts empty. When the gate is inactive it is
    /// inert: scoping work with it installs no listener.
    pub fn start_capture(&self) -> DebugCapture {
        let listening = self.gate.is_active();
        tracing::trace!(listening, "Starting query capture");

        DebugCapture {
            state: Arc::new(CaptureState {
                listening,
                records: Mutex::new(Vec::new()),
                resolver: self.resolver.clone(),
                analyzer: self.analyzer.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for QueryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRecorder")
            .field("analyzer", &self.analyzer)
            .finish_non_exhaustive()
    }
}

struct CaptureState {
    listening: bool,
    records: Mutex<Vec<QueryRecord>>,
    resolver: Arc<dyn CallSiteResolver>,
    analyzer: Analyzer,
}

/// The query buffer of a single request.
///
/// Clones share the same buffer; the middleware keeps one handle and puts
/// another in the request extensions, so handlers can take it as
/// `Extension<DebugCapture>`. The buffer is freed when the last handle goes
/// away with the request.
#[derive(Clone)]
pub struct DebugCapture {
    state: Arc<CaptureState>,
}

impl DebugCapture {
    /// Whether the gate was active when this capture started.
    pub fn is_listening(&self) -> bool {
        self.state.listening
    }

    /// Run `fut` with this capture subscribed to statement events.
    pub async fn scope<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        if !self.state.listening {
            return fut.await;
        }
        event::scope(self.listener(), fut).await
    }

    /// Run `f` with this capture subscribed to statement events.
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.state.listening {
            return f();
        }
        event::sync_scope(self.listener(), f)
    }

    fn listener(&self) -> Arc<dyn QueryListener> {
        Arc::new(self.clone())
    }

    /// Append a record for a statement that just executed.
    pub fn on_query_executed(&self, sql: &str, bindings: &[JsonValue], elapsed_ms: f64) {
        let trace = self.state.resolver.resolve();

        if elapsed_ms > self.state.analyzer.slow_query_threshold_ms() {
            tracing::warn!(
                elapsed_ms,
                threshold_ms = self.state.analyzer.slow_query_threshold_ms(),
                sql = %sql,
                call_site = trace.first().map(String::as_str).unwrap_or("<unknown>"),
                "Slow query detected"
            );
        } else {
            tracing::debug!(elapsed_ms, sql = %sql, "Query captured");
        }

        self.state.records.lock().push(QueryRecord {
            sql: sql.to_string(),
            bindings: bindings.to_vec(),
            time: elapsed_ms,
            trace,
        });
    }

    /// Snapshot of the records captured so far.
    pub fn buffer(&self) -> Vec<QueryRecord> {
        self.state.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.state.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Analyze the records captured so far.
    pub fn summary(&self) -> DiagnosticSummary {
        let records = self.state.records.lock();
        self.state.analyzer.analyze(&records)
    }
}

impl QueryListener for DebugCapture {
    fn on_query_executed(&self, event: &QueryEvent) {
        DebugCapture::on_query_executed(self, &event.sql, &event.bindings, event.elapsed_ms);
    }
}

impl std::fmt::Debug for DebugCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugCapture")
            .field("listening", &self.state.listening)
            .field("records", &self.len())
            .finish()
    }
}
