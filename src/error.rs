//! Errors raised while assembling debug output.
//!
//! None of these reach the client: the middleware logs them and falls back
//! to the undecorated request or response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("failed to read body: {0}")]
    Body(#[from] axum::Error),

    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON body is not an object")]
    NotAnObject,

    #[error("unsupported content type {0:?}")]
    UnsupportedBody(String),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

pub type Result<T> = std::result::Result<T, DebuggerError>;
