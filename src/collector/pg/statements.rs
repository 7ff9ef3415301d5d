//! pg_stat_statements collection.

use std::sync::Arc;

use tracing::debug;

use crate::config::EngineConfig;
use crate::diagnostics::MetricsSink;
use crate::job::{JobRoutine, RunContext};
use crate::row::{Row, Value};
use crate::statement_metrics::StatementMetrics;

use super::queries::{STATEMENTS_EXTENSION_QUERY, build_statements_query};
use super::{PgCollectError, PgConnection, query_signature, text};

/// Cumulative pg_stat_statements columns reported as per-interval counts.
pub const STATEMENT_METRIC_COLUMNS: &[&str] = &[
    "calls",
    "total_exec_time",
    "total_plan_time",
    "rows",
    "shared_blks_hit",
    "shared_blks_read",
    "shared_blks_dirtied",
    "shared_blks_written",
    "local_blks_hit",
    "local_blks_read",
    "local_blks_written",
    "temp_blks_read",
    "temp_blks_written",
    "wal_records",
    "wal_bytes",
];

/// A statement is only reported for an interval in which it was executed.
const EXECUTION_INDICATORS: &[&str] = &["calls"];

/// (query signature, database, user)
type StatementKey = (String, String, String);

/// Reports per-query deltas of pg_stat_statements counters.
///
/// Statements that differ only in their `queryid` (e.g. the same text run by
/// different roles mapped to one user) share a key and are summed.
pub struct StatementMetricsJob {
    conn: PgConnection,
    engine: StatementMetrics<StatementKey>,
    sink: Arc<dyn MetricsSink>,
    metric_prefix: String,
    extension_checked: bool,
}

impl StatementMetricsJob {
    pub fn new(
        conn: PgConnection,
        engine: &EngineConfig,
        metric_prefix: impl Into<String>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            conn,
            engine: StatementMetrics::from_config(engine),
            sink,
            metric_prefix: metric_prefix.into(),
            extension_checked: false,
        }
    }

    fn metric(&self, name: &str) -> String {
        format!("{}.queries.{}", self.metric_prefix, name)
    }

    fn ensure_extension(&mut self) -> Result<(), PgCollectError> {
        if self.extension_checked {
            return Ok(());
        }
        if self.conn.query_rows(STATEMENTS_EXTENSION_QUERY)?.is_empty() {
            return Err(PgCollectError::MissingExtension("pg_stat_statements"));
        }
        self.extension_checked = true;
        Ok(())
    }

    /// Computes derivatives of one snapshot and submits them.
    fn report(&mut self, rows: Vec<Row>, tags: &[String]) {
        let raw_rows = rows.len();
        let rows = rows.into_iter().map(|mut row| {
            let signature = query_signature(text(&row, "query"));
            row.insert("query_signature", signature);
            row
        });
        let result = self.engine.compute_derivative_rows_with_indicators(
            rows,
            STATEMENT_METRIC_COLUMNS,
            EXECUTION_INDICATORS,
            statement_key,
        );

        for row in &result.rows {
            let mut row_tags = tags.to_vec();
            row_tags.push(format!("db:{}", text(row, "datname")));
            row_tags.push(format!("user:{}", text(row, "usename")));
            row_tags.push(format!("query_signature:{}", text(row, "query_signature")));
            for column in STATEMENT_METRIC_COLUMNS {
                if let Some(value) = row.number(column).and_then(Value::as_f64) {
                    self.sink.count(&self.metric(column), value, &row_tags);
                }
            }
        }

        self.sink
            .gauge(&self.metric("raw_rows"), raw_rows as f64, tags);
        self.sink
            .gauge(&self.metric("emitted_rows"), result.rows.len() as f64, tags);
        for column in &result.dropped_metrics {
            let mut dropped_tags = tags.to_vec();
            dropped_tags.push(format!("metric:{column}"));
            self.sink
                .count(&self.metric("dropped_metrics"), 1.0, &dropped_tags);
        }
        debug!(
            raw_rows,
            emitted_rows = result.rows.len(),
            reset_keys = result.reset_keys,
            tracked = self.engine.tracked_keys(),
            "statement metrics collected"
        );
    }
}

fn statement_key(row: &Row) -> StatementKey {
    (
        text(row, "query_signature").to_string(),
        text(row, "datname").to_string(),
        text(row, "usename").to_string(),
    )
}

impl JobRoutine for StatementMetricsJob {
    type Error = PgCollectError;

    fn run(&mut self, ctx: &RunContext) -> Result<(), PgCollectError> {
        let result = self.ensure_extension().and_then(|()| {
            let query = build_statements_query(self.conn.server_version_num());
            self.conn.query_rows(&query)
        });
        match result {
            Ok(rows) => {
                self.report(rows, ctx.tags());
                Ok(())
            }
            Err(e) => {
                self.extension_checked = false;
                Err(e)
            }
        }
    }

    fn is_expected(&self, err: &PgCollectError) -> bool {
        err.is_expected()
    }

    fn shutdown(&mut self) {
        self.conn.close();
        self.engine.reset();
    }
}
