//! pg_stat_activity sampling.

use std::sync::Arc;

use tracing::debug;

use crate::cache::RateLimitingTtlCache;
use crate::config::CacheConfig;
use crate::diagnostics::MetricsSink;
use crate::error::ConfigError;
use crate::job::{JobRoutine, RunContext};
use crate::row::{Row, Value};

use super::queries::ACTIVITY_QUERY;
use super::{PgCollectError, PgConnection, query_signature, text};

/// Samples active sessions.
///
/// Every run reports the number of active sessions. A session running a given
/// query in a given database is reported as a sample at most once per cache
/// TTL, no matter how many runs observe it.
pub struct ActivitySamplesJob {
    conn: PgConnection,
    sink: Arc<dyn MetricsSink>,
    metric_prefix: String,
    seen: RateLimitingTtlCache<(String, String)>,
}

impl ActivitySamplesJob {
    pub fn new(
        conn: PgConnection,
        samples: &CacheConfig,
        metric_prefix: impl Into<String>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            conn,
            sink,
            metric_prefix: metric_prefix.into(),
            seen: RateLimitingTtlCache::from_config(samples)?,
        })
    }

    fn metric(&self, name: &str) -> String {
        format!("{}.activity.{}", self.metric_prefix, name)
    }

    fn report(&self, rows: Vec<Row>, tags: &[String]) {
        self.sink
            .gauge(&self.metric("active_sessions"), rows.len() as f64, tags);

        let mut emitted = 0usize;
        for row in &rows {
            let signature = query_signature(text(row, "query"));
            let datname = text(row, "datname");
            if !self.seen.acquire((signature.clone(), datname.to_string())) {
                continue;
            }
            let mut sample_tags = tags.to_vec();
            sample_tags.push(format!("db:{datname}"));
            sample_tags.push(format!("user:{}", text(row, "usename")));
            sample_tags.push(format!("state:{}", text(row, "state")));
            sample_tags.push(format!("query_signature:{signature}"));
            let wait_event = text(row, "wait_event");
            if !wait_event.is_empty() {
                sample_tags.push(format!(
                    "wait_event:{}:{}",
                    text(row, "wait_event_type"),
                    wait_event
                ));
            }
            let duration = row
                .number("query_duration_secs")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            self.sink
                .gauge(&self.metric("sample.duration"), duration, &sample_tags);
            emitted += 1;
        }
        debug!(
            sessions = rows.len(),
            emitted,
            suppressed = rows.len() - emitted,
            "activity sampled"
        );
    }
}

impl JobRoutine for ActivitySamplesJob {
    type Error = PgCollectError;

    fn run(&mut self, ctx: &RunContext) -> Result<(), PgCollectError> {
        let rows = self.conn.query_rows(ACTIVITY_QUERY)?;
        self.report(rows, ctx.tags());
        Ok(())
    }

    fn is_expected(&self, err: &PgCollectError) -> bool {
        err.is_expected()
    }

    fn shutdown(&mut self) {
        self.conn.close();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use std::thread;
    use std::time::Duration;

    fn job(sink: &Arc<MemorySink>, ttl_secs: f64) -> ActivitySamplesJob {
        ActivitySamplesJob::new(
            PgConnection::with_connection_string("host=localhost"),
            &CacheConfig {
                max_size: 100,
                ttl_secs,
            },
            "dbm.postgres",
            sink.clone(),
        )
        .unwrap()
    }

    fn session(pid: i32, db: &str, query: &str) -> Row {
        Row::new()
            .with("pid", pid)
            .with("datname", db)
            .with("usename", "app")
            .with("state", "active")
            .with("query", query)
            .with("wait_event_type", "Lock")
            .with("wait_event", "relation")
            .with("query_duration_secs", 1.5)
    }

    #[test]
    fn rejects_invalid_cache_config() {
        let sink = Arc::new(MemorySink::new());
        let result = ActivitySamplesJob::new(
            PgConnection::with_connection_string("host=localhost"),
            &CacheConfig {
                max_size: 0,
                ttl_secs: 1.0,
            },
            "dbm.postgres",
            sink,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_samples_are_suppressed_within_ttl() {
        let sink = Arc::new(MemorySink::new());
        let job = job(&sink, 60.0);
        let snapshot = vec![
            session(1, "app", "SELECT 1"),
            session(2, "app", "SELECT 1"),
            session(3, "billing", "SELECT 1"),
        ];
        job.report(snapshot.clone(), &[]);
        job.report(snapshot, &[]);

        assert_eq!(
            sink.named("dbm.postgres.activity.active_sessions")
                .iter()
                .map(|s| s.value)
                .collect::<Vec<_>>(),
            [3.0, 3.0]
        );
        let samples = sink.named("dbm.postgres.activity.sample.duration");
        assert_eq!(samples.len(), 2);
        assert!(samples[0].tags.contains(&"wait_event:Lock:relation".to_string()));
        assert_eq!(samples[0].value, 1.5);
    }

    #[test]
    fn samples_reappear_after_ttl() {
        let sink = Arc::new(MemorySink::new());
        let job = job(&sink, 0.1);
        job.report(vec![session(1, "app", "SELECT 1")], &[]);
        thread::sleep(Duration::from_millis(150));
        job.report(vec![session(1, "app", "SELECT 1")], &[]);

        assert_eq!(sink.named("dbm.postgres.activity.sample.duration").len(), 2);
    }

    #[test]
    fn shutdown_clears_suppression() {
        let sink = Arc::new(MemorySink::new());
        let mut job = job(&sink, 60.0);
        job.report(vec![session(1, "app", "SELECT 1")], &[]);
        job.shutdown();
        job.report(vec![session(1, "app", "SELECT 1")], &[]);

        assert_eq!(sink.named("dbm.postgres.activity.sample.duration").len(), 2);
    }
}
