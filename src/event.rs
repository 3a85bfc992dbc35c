//! Statement events and their request-scoped subscription.
//!
//! A listener is subscribed for the duration of one future (or closure) via
//! [`scope`] / [`sync_scope`]. The subscription lives in a task-local slot,
//! so two requests handled concurrently never see each other's statements,
//! and it ends as soon as the scoped future completes or is dropped.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value as JsonValue;

tokio::task_local! {
    static LISTENER: Arc<dyn QueryListener>;
}

/// One successfully executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub sql: String,
    pub bindings: Vec<JsonValue>,
    pub elapsed_ms: f64,
}

/// Receives every statement executed inside its scope.
///
/// Called synchronously on the task that issued the statement, after the
/// statement completed. Implementations must not block.
pub trait QueryListener: Send + Sync {
    fn on_query_executed(&self, event: &QueryEvent);
}

/// Run `fut` with `listener` subscribed to statement events.
pub fn scope<F>(listener: Arc<dyn QueryListener>, fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    LISTENER.scope(listener, fut)
}

/// Run `f` with `listener` subscribed to statement events.
pub fn sync_scope<R>(listener: Arc<dyn QueryListener>, f: impl FnOnce() -> R) -> R {
    LISTENER.sync_scope(listener, f)
}

/// Whether a listener is subscribed in the current scope.
pub fn is_listening() -> bool {
    LISTENER.try_with(|_| ()).is_ok()
}

/// Hand an event to the listener in scope, if any.
///
/// The event is only built when someone is listening. A panicking listener
/// is contained here so the statement that triggered it still succeeds.
pub(crate) fn dispatch(build: impl FnOnce() -> QueryEvent) {
    let Ok(listener) = LISTENER.try_with(Arc::clone) else {
        return;
    };
    let event = build();

    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_query_executed(&event)));
    if let Err(payload) = outcome {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::warn!(
            sql = %event.sql,
            reason = %reason,
            "Query listener panicked; event dropped"
        );
    }
}
