//! Slow and repeated query detection over a finished buffer.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{DebuggerConfig, GroupingKey};
use crate::recorder::QueryRecord;

/// Diagnostics for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticSummary {
    pub count: usize,
    /// Total elapsed milliseconds, rounded to 2 decimals.
    pub time: f64,
    #[serde(rename = "data")]
    pub records: Vec<QueryRecord>,
    #[serde(rename = "long_queries")]
    pub slow_queries: Vec<QueryRecord>,
    #[serde(rename = "repeated_queries")]
    pub repeated_queries: Vec<RepeatedQueryGroup>,
}

/// A statement that ran more than once in the same request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatedQueryGroup {
    pub sql: String,
    pub count: usize,
    /// Call sites of every occurrence, in execution order.
    pub backtrace: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    slow_query_threshold_ms: f64,
    grouping: GroupingKey,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::from_config(&DebuggerConfig::default())
    }
}

impl Analyzer {
    pub fn new(slow_query_threshold_ms: f64, grouping: GroupingKey) -> Self {
        Self {
            slow_query_threshold_ms,
            grouping,
        }
    }

    pub fn from_config(config: &DebuggerConfig) -> Self {
        Self::new(config.slow_query_threshold_ms, config.grouping)
    }

    pub fn slow_query_threshold_ms(&self) -> f64 {
        self.slow_query_threshold_ms
    }

    pub fn analyze(&self, records: &[QueryRecord]) -> DiagnosticSummary {
        let total: f64 = records.iter().map(|r| r.time).sum();

        DiagnosticSummary {
            count: records.len(),
            time: round_ms(total),
            records: records.to_vec(),
            slow_queries: self.slow_queries(records),
            repeated_queries: self.repeated_queries(records),
        }
    }

    fn slow_queries(&self, records: &[QueryRecord]) -> Vec<QueryRecord> {
        records
            .iter()
            .filter(|r| r.time > self.slow_query_threshold_ms)
            .cloned()
            .collect()
    }

    fn repeated_queries(&self, records: &[QueryRecord]) -> Vec<RepeatedQueryGroup> {
        // first-seen order
        let mut groups: Vec<RepeatedQueryGroup> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in records {
            let slot = *index.entry(self.group_key(record)).or_insert_with(|| {
                groups.push(RepeatedQueryGroup {
                    sql: record.sql.clone(),
                    count: 0,
                    backtrace: Vec::new(),
                });
                groups.len() - 1
            });
            let group = &mut groups[slot];
            group.count += 1;
            group.backtrace.push(record.trace.clone());
        }

        groups.retain(|g| g.count > 1);
        groups
    }

    fn group_key(&self, record: &QueryRecord) -> String {
        match self.grouping {
            GroupingKey::Sql => record.sql.clone(),
            GroupingKey::SqlAndBindings => {
                // Value arrays always serialize.
                let bindings = serde_json::to_string(&record.bindings).unwrap_or_default();
                format!("{}\u{0}{}", record.sql, bindings)
            }
        }
    }
}

/// Round milliseconds to 2 decimal places, halves away from zero.
///
/// Applied to the binary `f64` value, so inputs that are not exactly
/// representable (e.g. `1.005`) round according to their stored value.
pub fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}
