//! Configuration for query capture and analysis.

use crate::request::RedactionRules;

/// Path markers identifying frames that belong to dependencies rather than
/// application code.
pub const DEFAULT_EXCLUDED_PATHS: &[&str] = &[
    "/.cargo/registry/",
    "/.cargo/git/",
    "/rustc/",
    "/.rustup/",
    "/vendor/",
];

/// How the analyzer decides that two statements are "the same query".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupingKey {
    /// Statement text only. Two executions of one parameterized query with
    /// different values land in the same group (N+1 fan-out).
    #[default]
    Sql,
    /// Statement text and binding values.
    SqlAndBindings,
}

/// Configuration options for the debugger.
///
/// # Example
///
/// ```rust
/// use sea_orm_debugger::{DebuggerConfig, GroupingKey};
///
/// let config = DebuggerConfig::default()
///     .with_slow_query_threshold_ms(25.0)
///     .with_grouping(GroupingKey::SqlAndBindings)
///     .with_redacted_key("api_secret");
/// ```
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// Queries strictly slower than this (in milliseconds) are reported in
    /// `long_queries`.
    /// Default: `10.0`
    pub slow_query_threshold_ms: f64,

    /// Grouping key for repeated-query detection.
    /// Default: [`GroupingKey::Sql`]
    pub grouping: GroupingKey,

    /// Frames whose source path contains any of these markers are dropped
    /// from call sites.
    /// Default: [`DEFAULT_EXCLUDED_PATHS`]
    pub excluded_paths: Vec<String>,

    /// Maximum number of call-site frames kept per query.
    /// Default: `None` (all application frames)
    pub call_site_limit: Option<usize>,

    /// Body keys and headers removed from the request echo.
    pub redaction: RedactionRules,

    /// Request bodies larger than this are not buffered for the request echo.
    /// Default: 1 MiB
    pub max_body_bytes: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 10.0,
            grouping: GroupingKey::Sql,
            excluded_paths: DEFAULT_EXCLUDED_PATHS.iter().map(|p| p.to_string()).collect(),
            call_site_limit: None,
            redaction: RedactionRules::default(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl DebuggerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the slow query threshold in milliseconds.
    pub fn with_slow_query_threshold_ms(mut self, threshold_ms: f64) -> Self {
        self.slow_query_threshold_ms = threshold_ms;
        self
    }

    /// Choose how repeated queries are grouped.
    pub fn with_grouping(mut self, grouping: GroupingKey) -> Self {
        self.grouping = grouping;
        self
    }

    /// Treat frames under `marker` as dependency code.
    pub fn with_excluded_path(mut self, marker: impl Into<String>) -> Self {
        self.excluded_paths.push(marker.into());
        self
    }

    /// Keep at most `limit` call-site frames per query.
    pub fn with_call_site_limit(mut self, limit: Option<usize>) -> Self {
        self.call_site_limit = limit;
        self
    }

    /// Remove an additional body key from the request echo.
    pub fn with_redacted_key(mut self, key: impl Into<String>) -> Self {
        self.redaction = self.redaction.with_key(key);
        self
    }

    /// Remove a header from the request echo.
    pub fn with_redacted_header(mut self, name: impl Into<String>) -> Self {
        self.redaction = self.redaction.with_header(name);
        self
    }

    /// Set the largest request body buffered for the request echo.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Local development: short call sites, tighter slow threshold.
    pub fn development() -> Self {
        Self {
            slow_query_threshold_ms: 5.0,
            call_site_limit: Some(10),
            ..Self::default()
        }
    }

    /// Shared environments: authentication headers are not echoed back.
    pub fn production() -> Self {
        Self::default()
            .with_redacted_header("authorization")
            .with_redacted_header("cookie")
            .with_redacted_header("proxy-authorization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DebuggerConfig::default();
        assert_eq!(config.slow_query_threshold_ms, 10.0);
        assert_eq!(config.grouping, GroupingKey::Sql);
        assert!(config.call_site_limit.is_none());
        assert!(config.excluded_paths.iter().any(|p| p == "/.cargo/registry/"));
    }

    #[test]
    fn test_config_builder() {
        let config = DebuggerConfig::new()
            .with_slow_query_threshold_ms(50.0)
            .with_grouping(GroupingKey::SqlAndBindings)
            .with_excluded_path("/third_party/")
            .with_max_body_bytes(4096);

        assert_eq!(config.slow_query_threshold_ms, 50.0);
        assert_eq!(config.grouping, GroupingKey::SqlAndBindings);
        assert!(config.excluded_paths.iter().any(|p| p == "/third_party/"));
        assert_eq!(config.max_body_bytes, 4096);
    }

    #[test]
    fn test_production_config() {
        let config = DebuggerConfig::production();
        assert!(config.redaction.is_header_redacted("Authorization"));
        assert!(config.redaction.is_key_redacted("password"));
    }
}
