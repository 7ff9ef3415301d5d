//! SQL used by the PostgreSQL routines.

pub(super) const STATEMENTS_EXTENSION_QUERY: &str =
    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'";

/// Builds version-aware query for pg_stat_statements.
///
/// Every counter is cast to `bigint` or `double precision` so it decodes as a
/// number regardless of server version.
pub(super) fn build_statements_query(server_version_num: Option<i32>) -> String {
    let v = server_version_num.unwrap_or(0);
    let (total_exec_time_expr, total_plan_time_expr, wal_records_expr, wal_bytes_expr) =
        if v >= 130000 {
            (
                "s.total_exec_time",
                "s.total_plan_time",
                "s.wal_records",
                "s.wal_bytes",
            )
        } else {
            ("s.total_time", "0", "0", "0")
        };

    format!(
        r#"
            SELECT
                COALESCE(d.datname, '') as datname,
                COALESCE(r.rolname, '') as usename,
                COALESCE(s.query, '') as query,
                s.calls::bigint as calls,
                {total_exec_time_expr}::double precision as total_exec_time,
                {total_plan_time_expr}::double precision as total_plan_time,
                s.rows::bigint as rows,
                s.shared_blks_hit::bigint as shared_blks_hit,
                s.shared_blks_read::bigint as shared_blks_read,
                s.shared_blks_dirtied::bigint as shared_blks_dirtied,
                s.shared_blks_written::bigint as shared_blks_written,
                s.local_blks_hit::bigint as local_blks_hit,
                s.local_blks_read::bigint as local_blks_read,
                s.local_blks_written::bigint as local_blks_written,
                s.temp_blks_read::bigint as temp_blks_read,
                s.temp_blks_written::bigint as temp_blks_written,
                {wal_records_expr}::bigint as wal_records,
                {wal_bytes_expr}::bigint as wal_bytes
            FROM pg_stat_statements s
            LEFT JOIN pg_database d ON d.oid = s.dbid
            LEFT JOIN pg_roles r ON r.oid = s.userid
        "#
    )
}

/// Non-idle client sessions other than our own.
pub(super) const ACTIVITY_QUERY: &str = r#"
    SELECT
        pid,
        COALESCE(datname, '') as datname,
        COALESCE(usename, '') as usename,
        COALESCE(application_name, '') as application_name,
        COALESCE(state, '') as state,
        COALESCE(query, '') as query,
        COALESCE(wait_event_type, '') as wait_event_type,
        COALESCE(wait_event, '') as wait_event,
        COALESCE(EXTRACT(EPOCH FROM (now() - query_start)), 0)::double precision as query_duration_secs
    FROM pg_stat_activity
    WHERE backend_type = 'client backend'
      AND state IS NOT NULL
      AND state <> 'idle'
      AND pid <> pg_backend_pid()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_query_uses_exec_time_on_13_plus() {
        let q = build_statements_query(Some(150004));
        assert!(q.contains("s.total_exec_time::double precision"));
        assert!(q.contains("s.wal_bytes::bigint"));
        assert!(!q.contains("s.total_time"));
    }

    #[test]
    fn statements_query_falls_back_before_13() {
        let q = build_statements_query(Some(120010));
        assert!(q.contains("s.total_time::double precision as total_exec_time"));
        assert!(q.contains("0::bigint as wal_bytes"));

        // Unknown version is treated as old.
        assert_eq!(build_statements_query(None), q);
    }
}
