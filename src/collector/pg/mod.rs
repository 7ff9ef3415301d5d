//! PostgreSQL collection routines.
//!
//! Two routines are provided, each meant to be driven by its own
//! [`AsyncJob`](crate::job::AsyncJob):
//! - [`StatementMetricsJob`] - per-query derivatives from `pg_stat_statements`;
//! - [`ActivitySamplesJob`] - deduplicated samples of `pg_stat_activity`.
//!
//! Both own a [`PgConnection`] that connects lazily and reconnects on the
//! next run after any failure.

mod activity;
mod queries;
mod statements;

use postgres::types::Type;
use postgres::{Client, NoTls};
use thiserror::Error;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::row::{Row, Value};

pub use activity::ActivitySamplesJob;
pub use statements::{STATEMENT_METRIC_COLUMNS, StatementMetricsJob};

/// Error type for PostgreSQL collection.
#[derive(Debug, Error)]
pub enum PgCollectError {
    /// Environment variable not set.
    #[error("PostgreSQL: {0} not set")]
    EnvNotSet(String),
    /// Connection failed.
    #[error("PostgreSQL: {0}")]
    Connection(String),
    /// Query execution failed.
    #[error("PostgreSQL query error: {0}")]
    Query(String),
    /// A required extension is not installed in the connected database.
    #[error("PostgreSQL: extension {0} is not installed")]
    MissingExtension(&'static str),
    /// A column could not be converted to a row value.
    #[error("PostgreSQL: cannot decode column {column}: {reason}")]
    Decode { column: String, reason: String },
}

impl PgCollectError {
    /// Failures caused by the monitored server rather than by this process.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PgCollectError::Connection(_)
                | PgCollectError::Query(_)
                | PgCollectError::MissingExtension(_)
        )
    }
}

/// Lazily established connection to one PostgreSQL server.
///
/// Connects using the standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
pub struct PgConnection {
    connection_string: String,
    client: Option<Client>,
    server_version_num: Option<i32>,
}

impl PgConnection {
    pub fn from_env() -> Result<Self, PgCollectError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PgCollectError> {
        let user = lookup("PGUSER")
            .or_else(|| lookup("USER"))
            .ok_or_else(|| PgCollectError::EnvNotSet("PGUSER or USER".to_string()))?;
        let host = lookup("PGHOST").unwrap_or_else(|| "localhost".to_string());
        let port = lookup("PGPORT").unwrap_or_else(|| "5432".to_string());
        let password = lookup("PGPASSWORD").unwrap_or_default();
        let database = lookup("PGDATABASE").unwrap_or_else(|| user.clone());

        let mut connection_string = format!("host={host} port={port} user={user} dbname={database}");
        if !password.is_empty() {
            connection_string.push_str(&format!(" password={password}"));
        }
        Ok(Self::with_connection_string(connection_string))
    }

    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: None,
            server_version_num: None,
        }
    }

    /// Server version as reported by `server_version_num`, once connected.
    pub fn server_version_num(&self) -> Option<i32> {
        self.server_version_num
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Runs `sql` and converts every result row. Any query failure drops the
    /// connection; the next call reconnects.
    pub fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>, PgCollectError> {
        let client = self.client()?;
        match client.query(sql, &[]) {
            Ok(rows) => rows.iter().map(convert_row).collect(),
            Err(e) => {
                self.close();
                Err(PgCollectError::Query(format_postgres_error(&e)))
            }
        }
    }

    pub fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("PostgreSQL connection closed");
        }
        self.server_version_num = None;
    }

    fn client(&mut self) -> Result<&mut Client, PgCollectError> {
        if self.client.is_none() {
            let mut client = Client::connect(&self.connection_string, NoTls)
                .map_err(|e| PgCollectError::Connection(format_postgres_error(&e)))?;
            self.server_version_num = client
                .query_one("SHOW server_version_num", &[])
                .ok()
                .and_then(|row| row.try_get::<_, String>(0).ok())
                .and_then(|v| v.parse::<i32>().ok());
            info!(server_version_num = ?self.server_version_num, "connected to PostgreSQL");
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| PgCollectError::Connection("not connected".to_string()))
    }
}

fn convert_row(row: &postgres::Row) -> Result<Row, PgCollectError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.type_()).map_err(|e| PgCollectError::Decode {
            column: column.name().to_string(),
            reason: e.to_string(),
        })?;
        out.insert(column.name(), value);
    }
    Ok(out)
}

fn column_value(row: &postgres::Row, idx: usize, ty: &Type) -> Result<Value, postgres::Error> {
    let value: Value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(i64::from).into()
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into()
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.into()
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.into()
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.into()
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into()
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.into()
    } else {
        row.try_get::<_, Option<String>>(idx)?.into()
    };
    Ok(value)
}

/// Stable identifier of a query text, as 16 hex digits of its xxh3 hash.
pub fn query_signature(query: &str) -> String {
    format!("{:016x}", xxh3_64(query.as_bytes()))
}

/// Text value of `column`, or `""` when missing or not text.
fn text<'a>(row: &'a Row, column: &str) -> &'a str {
    row.get(column).and_then(Value::as_str).unwrap_or("")
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
