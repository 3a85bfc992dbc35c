//! # sea-orm-debugger
//!
//! Request-scoped SQL diagnostics for SeaORM services built on axum.
//!
//! While debugging is enabled, every statement executed during a request is
//! recorded with its bindings, elapsed time and the application call site
//! that issued it. When the client asked for JSON, the response body gets a
//! `debugger` key with the query count, total time, slow queries, and
//! statements that ran more than once (the usual sign of an N+1 pattern).
//!
//! ## Features
//!
//! - **Request isolation**: captures live in a task-local scope; concurrent
//!   requests never see each other's statements
//! - **N+1 detection**: repeated statements grouped with the call site of
//!   every occurrence
//! - **Slow queries**: statements over a configurable threshold (10ms)
//! - **Request echo**: body fields and headers, with passwords and CSRF
//!   tokens removed
//! - **Fail closed**: nothing is captured or exposed unless `APP_DEBUG` is on
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use axum::{middleware, routing::get, Router};
//! use sea_orm::Database;
//! use sea_orm_debugger::prelude::*;
//!
//! let db = Database::connect("postgres://localhost/mydb").await?.with_debugger();
//! let debugger = ApiDebugger::new(DebuggerConfig::default());
//!
//! let app = Router::new()
//!     .route("/users", get(list_users))
//!     .layer(middleware::from_fn_with_state(debugger, debugger_middleware))
//!     .with_state(db);
//! ```
//!
//! ## Output
//!
//! ```json
//! {
//!   "data": [],
//!   "debugger": {
//!     "queries": {
//!       "count": 3,
//!       "time": 31.0,
//!       "data": [{ "sql": "...", "bindings": [1], "time": 5.0, "trace": ["src/users.rs:42"] }],
//!       "long_queries": [],
//!       "repeated_queries": [{ "sql": "...", "count": 2, "backtrace": [["src/users.rs:42"], ["src/users.rs:42"]] }]
//!     },
//!     "request": { "body": {}, "headers": { "accept": ["application/json"] } }
//!   }
//! }
//! ```
//!
//! Statements issued from a `tokio::spawn`ed task run outside the request's
//! scope; wrap the spawned future with [`DebugCapture::scope`] to include
//! them.

mod analyzer;
mod callsite;
mod config;
mod connection;
mod error;
pub mod event;
mod gate;
mod middleware;
mod recorder;
mod request;

pub use analyzer::{round_ms, Analyzer, DiagnosticSummary, RepeatedQueryGroup};
pub use callsite::{BacktraceResolver, CallSiteResolver, NoopResolver};
pub use config::{DebuggerConfig, GroupingKey, DEFAULT_EXCLUDED_PATHS};
pub use connection::{DebugConnection, DebugExt};
pub use error::DebuggerError;
pub use event::{QueryEvent, QueryListener};
pub use gate::{ActivationGate, EnvGate, StaticGate, DEFAULT_DEBUG_VAR};
pub use middleware::{debugger_middleware, expects_json, ApiDebugger, DEBUGGER_KEY};
pub use recorder::{DebugCapture, QueryRecord, QueryRecorder};
pub use request::{RedactionRules, RequestInfo, DEFAULT_REDACTED_KEYS};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        debugger_middleware, ApiDebugger, DebugCapture, DebugConnection, DebugExt, DebuggerConfig,
    };
}
