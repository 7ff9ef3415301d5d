//! Derivative metrics over successive snapshots of cumulative counters.
//!
//! Database statistics views (`pg_stat_statements`, `performance_schema`,
//! `sys.dm_exec_query_stats`, ...) expose counters that only grow until the
//! server resets them. [`StatementMetrics`] keeps the last merged snapshot per
//! key and turns each new snapshot into the increase since the previous one.
//!
//! Rules applied per key:
//! - duplicates of a key within one snapshot are merged (metric columns summed);
//! - the first snapshot only establishes the baseline;
//! - a key whose metric deltas are all zero is omitted;
//! - a key with any negative delta (counter reset) is skipped and re-baselined;
//! - a counter missing from the baseline is baselined alone, other counters
//!   of the key still report;
//! - non-numeric counters are dropped and reported;
//! - keys seen for the first time are baseline-only;
//! - keys missing from a snapshot are forgotten, after an optional grace period.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::row::{Row, Value};

/// Result of one [`StatementMetrics::compute_derivative_rows`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivativeRows {
    /// One row per key with a non-zero, non-negative delta set.
    pub rows: Vec<Row>,
    /// Metric columns that could not be merged across duplicate rows of at
    /// least one key and were excluded for that key.
    pub dropped_metrics: BTreeSet<String>,
    /// Number of keys skipped this round because a counter went backwards.
    pub reset_keys: usize,
}

#[derive(Debug, Clone)]
struct TrackedRow {
    row: Row,
    missed_cycles: u32,
}

/// Per-key snapshot state for derivative computation.
///
/// Not internally synchronized: one engine per collection routine, with
/// snapshots applied in observation order.
#[derive(Debug, Clone)]
pub struct StatementMetrics<K> {
    previous: HashMap<K, TrackedRow>,
    baselined: bool,
    stale_after_cycles: u32,
}

impl<K> Default for StatementMetrics<K> {
    fn default() -> Self {
        Self {
            previous: HashMap::new(),
            baselined: false,
            stale_after_cycles: 0,
        }
    }
}

impl<K: Hash + Eq + Clone> StatementMetrics<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new().with_stale_after_cycles(config.stale_after_cycles)
    }

    /// Keep keys missing from a snapshot for up to `cycles` further calls
    /// before evicting them. `0` forgets them immediately.
    pub fn with_stale_after_cycles(mut self, cycles: u32) -> Self {
        self.stale_after_cycles = cycles;
        self
    }

    /// Number of keys currently held as baseline.
    pub fn tracked_keys(&self) -> usize {
        self.previous.len()
    }

    /// Forgets all state; the next non-empty call is a baseline again.
    pub fn reset(&mut self) {
        self.previous.clear();
        self.previous.shrink_to_fit();
        self.baselined = false;
    }

    /// Computes the per-key increase of `metric_columns` since the previous call.
    ///
    /// Non-metric columns are carried through from the current row.
    pub fn compute_derivative_rows<I, F>(
        &mut self,
        rows: I,
        metric_columns: &[&str],
        key_fn: F,
    ) -> DerivativeRows
    where
        I: IntoIterator<Item = Row>,
        F: Fn(&Row) -> K,
    {
        self.compute_derivative_rows_with_indicators(rows, metric_columns, &[], key_fn)
    }

    /// Like [`compute_derivative_rows`](Self::compute_derivative_rows), but a
    /// key is only emitted if at least one of `execution_indicators` moved
    /// (e.g. `calls`). An empty indicator list disables the check.
    pub fn compute_derivative_rows_with_indicators<I, F>(
        &mut self,
        rows: I,
        metric_columns: &[&str],
        execution_indicators: &[&str],
        key_fn: F,
    ) -> DerivativeRows
    where
        I: IntoIterator<Item = Row>,
        F: Fn(&Row) -> K,
    {
        let metrics: HashSet<&str> = metric_columns.iter().copied().collect();
        let (merged, dropped_metrics) = merge_duplicate_rows(rows, &metrics, &key_fn);
        if !dropped_metrics.is_empty() {
            warn!(
                dropped = ?dropped_metrics,
                "metric columns could not be merged across duplicate rows"
            );
        }

        let mut result = DerivativeRows {
            dropped_metrics,
            ..Default::default()
        };

        // Nothing observed: keep tracking what we have.
        if merged.is_empty() {
            return result;
        }

        if !self.baselined {
            self.previous = merged
                .into_iter()
                .map(|(key, row)| (key, TrackedRow { row, missed_cycles: 0 }))
                .collect();
            self.baselined = true;
            return result;
        }

        let mut next = HashMap::with_capacity(merged.len());
        for (key, row) in merged {
            if let Some(prev) = self.previous.get(&key) {
                match diff_row(&prev.row, &row, &metrics, execution_indicators) {
                    RowDelta::Changed(delta) => result.rows.push(delta),
                    RowDelta::Unchanged => {}
                    RowDelta::Reset => result.reset_keys += 1,
                }
            }
            next.insert(key, TrackedRow { row, missed_cycles: 0 });
        }

        if self.stale_after_cycles > 0 {
            for (key, mut tracked) in self.previous.drain() {
                if next.contains_key(&key) {
                    continue;
                }
                tracked.missed_cycles += 1;
                if tracked.missed_cycles <= self.stale_after_cycles {
                    next.insert(key, tracked);
                }
            }
        }
        self.previous = next;

        if result.reset_keys > 0 {
            debug!(
                keys = result.reset_keys,
                "counter reset detected, re-baselined affected keys"
            );
        }
        result
    }
}

enum RowDelta {
    Changed(Row),
    Unchanged,
    Reset,
}

fn diff_row(prev: &Row, curr: &Row, metrics: &HashSet<&str>, indicators: &[&str]) -> RowDelta {
    let mut out = Row::new();
    let mut changed = false;

    for (column, value) in curr.iter() {
        if !metrics.contains(column) {
            out.insert(column, value.clone());
            continue;
        }
        // A counter not tracked in the baseline only baselines this call.
        let Some(delta) = prev.number(column).and_then(|p| value.checked_sub(p)) else {
            continue;
        };
        let d = delta.as_f64().unwrap_or(0.0);
        if d < 0.0 {
            return RowDelta::Reset;
        }
        changed |= d != 0.0;
        out.insert(column, delta);
    }

    if !changed {
        return RowDelta::Unchanged;
    }
    if !indicators.is_empty()
        && indicators
            .iter()
            .all(|c| out.number(c).and_then(Value::as_f64).unwrap_or(0.0) == 0.0)
    {
        return RowDelta::Unchanged;
    }
    RowDelta::Changed(out)
}

/// Merges rows sharing a key: metric columns are summed, other columns keep
/// the first-seen value. A metric column that is non-numeric, or missing in
/// some of the duplicates, is removed for that key and reported.
fn merge_duplicate_rows<K, I, F>(
    rows: I,
    metrics: &HashSet<&str>,
    key_fn: &F,
) -> (IndexMap<K, Row>, BTreeSet<String>)
where
    K: Hash + Eq,
    I: IntoIterator<Item = Row>,
    F: Fn(&Row) -> K,
{
    let mut merged: IndexMap<K, Row> = IndexMap::new();
    let mut dropped = BTreeSet::new();

    for row in rows {
        let key = key_fn(&row);
        let Some(acc) = merged.get_mut(&key) else {
            merged.insert(key, row);
            continue;
        };

        for &column in metrics {
            let sum = match (acc.get(column), row.get(column)) {
                (None, None) => continue,
                (Some(a), Some(b)) if a.is_numeric() && b.is_numeric() => a.checked_add(b),
                _ => None,
            };
            match sum {
                Some(sum) => acc.insert(column, sum),
                None => {
                    acc.remove(column);
                    dropped.insert(column.to_string());
                }
            }
        }

        for (column, value) in row {
            if !metrics.contains(column.as_str()) && !acc.contains(&column) {
                acc.insert(column, value);
            }
        }
    }

    for row in merged.values_mut() {
        for &column in metrics {
            if row.get(column).is_some_and(|v| !v.is_numeric()) {
                row.remove(column);
                dropped.insert(column.to_string());
            }
        }
    }

    (merged, dropped)
}
