//! Decoding `SUBSCRIBE ... WITH (PROGRESS)` output rows into coalesced
//! [`RowEvent`]s (§3, §4.2).
//!
//! Every row Materialize emits for a subscribed relation carries `mz_timestamp`
//! and `mz_diff` ahead of the relation's own columns; a progress-only row
//! carries `mz_timestamp` with `mz_progressed = true` and no diff. This module
//! turns that wire shape into the gateway's own [`tycostream_protocol`] types
//! and folds same-timestamp diffs for one key into one logical change.

use std::collections::{BTreeMap, HashMap};

use tokio_postgres::Row as PgRow;
use tycostream_protocol::{ColumnValue, DataType, Frontier, Key, Row, RowEvent, RowKind, Source};

use crate::error::UpstreamError;

/// One decoded diff line: `+1` for an appearing row, `-1` for a
/// disappearing one. Materialize never emits other magnitudes for a
/// `SUBSCRIBE` against a view with a declared key.
pub struct Diff {
    pub timestamp: i64,
    pub sign: i64,
    pub row: Row,
}

/// Either a progress marker or a diff line, as read off the wire.
pub enum WireEvent {
    Progress { timestamp: i64 },
    Diff(Diff),
}

/// Decode one row returned by a `SUBSCRIBE` cursor `FETCH`. Column order is
/// `mz_timestamp, mz_diff, <relation columns in schema order>`; a progress
/// row has `mz_diff` null.
pub fn decode_row(pg_row: &PgRow, source: &Source) -> Result<WireEvent, UpstreamError> {
    let timestamp: i64 = pg_row
        .try_get("mz_timestamp")
        .map_err(|e| UpstreamError::Fatal(format!("missing mz_timestamp column: {e}")))?;

    let diff: Option<i64> = pg_row
        .try_get("mz_diff")
        .map_err(|e| UpstreamError::Fatal(format!("reading mz_diff column: {e}")))?;

    let Some(sign) = diff else {
        return Ok(WireEvent::Progress { timestamp });
    };

    let mut columns = BTreeMap::new();
    for column in &source.columns {
        let value = decode_value(pg_row, &column.name, column.data_type)?;
        columns.insert(column.name.clone(), value);
    }

    Ok(WireEvent::Diff(Diff {
        timestamp,
        sign,
        row: Row(columns),
    }))
}

fn decode_value(pg_row: &PgRow, name: &str, data_type: DataType) -> Result<ColumnValue, UpstreamError> {
    macro_rules! get {
        ($ty:ty, $variant:expr) => {
            pg_row
                .try_get::<_, Option<$ty>>(name)
                .map(|v| v.map_or(ColumnValue::Null, $variant))
                .map_err(|e| UpstreamError::Fatal(format!("column {name:?}: {e}")))
        };
    }

    match data_type {
        DataType::Integer => get!(i32, ColumnValue::Integer),
        DataType::BigInt => pg_row
            .try_get::<_, Option<i64>>(name)
            .map(|v| v.map_or(ColumnValue::Null, |v| ColumnValue::BigInt(v as i128)))
            .map_err(|e| UpstreamError::Fatal(format!("column {name:?}: {e}"))),
        DataType::Float => get!(f64, ColumnValue::Float),
        DataType::String => get!(String, ColumnValue::String),
        DataType::Uuid => get!(uuid::Uuid, ColumnValue::Uuid),
        DataType::Timestamp => get!(chrono::NaiveDateTime, ColumnValue::Timestamp),
        DataType::Date => get!(chrono::NaiveDate, ColumnValue::Date),
        DataType::Time => get!(chrono::NaiveTime, ColumnValue::Time),
        DataType::Boolean => get!(bool, ColumnValue::Boolean),
        DataType::Json => pg_row
            .try_get::<_, Option<serde_json::Value>>(name)
            .map(|v| v.map_or(ColumnValue::Null, |v| ColumnValue::Json(v.to_string())))
            .map_err(|e| UpstreamError::Fatal(format!("column {name:?}: {e}"))),
        DataType::Array => get!(String, ColumnValue::Array),
    }
}

/// Folds same-timestamp diffs for a key into one [`RowEvent`], per §9's
/// documented resolution of the coalescing edge cases:
/// - a lone `+1` for a key already present in the cache is an Update against
///   the cached pre-state, not a second Insert;
/// - `-1` immediately followed by `+1` for the same key is always an Update;
/// - a net-zero sequence (`+1` then `-1`, or churn that cancels out) that
///   still changes the row's values is an Update against the first row seen
///   this timestamp; a true no-op sequence produces nothing.
pub struct Coalescer<'a> {
    pk_column: &'a str,
    pending: HashMap<Key, Vec<Diff>>,
}

impl<'a> Coalescer<'a> {
    pub fn new(pk_column: &'a str) -> Self {
        Coalescer {
            pk_column,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, diff: Diff) {
        let key = diff.row.key(self.pk_column);
        self.pending.entry(key).or_insert_with(Vec::new).push(diff);
    }

    /// Drain all buffered diffs into coalesced events as of `timestamp`,
    /// consulting `was_present` to resolve the lone-`+1` ambiguity.
    pub fn drain(
        &mut self,
        timestamp: Frontier,
        was_present: impl Fn(&Key) -> bool,
    ) -> Vec<RowEvent> {
        let mut events = Vec::with_capacity(self.pending.len());
        for (key, diffs) in self.pending.drain() {
            let net: i64 = diffs.iter().map(|d| d.sign).sum();
            let first_row = &diffs[0].row;
            let last_row = &diffs[diffs.len() - 1].row;
            let previously_in_cache = was_present(&key);

            let event = if net > 0 {
                if previously_in_cache {
                    Some(update_event(&key, first_row, last_row, self.pk_column, timestamp))
                } else {
                    Some(RowEvent {
                        kind: RowKind::Insert,
                        key: key.clone(),
                        row_after: last_row.clone(),
                        changed_fields: None,
                        frontier_token: timestamp,
                    })
                }
            } else if net < 0 {
                Some(RowEvent {
                    kind: RowKind::Delete,
                    key: key.clone(),
                    row_after: last_row.only_key(self.pk_column),
                    changed_fields: None,
                    frontier_token: timestamp,
                })
            } else if previously_in_cache && first_row != last_row {
                Some(update_event(&key, first_row, last_row, self.pk_column, timestamp))
            } else {
                None
            };

            if let Some(event) = event {
                events.push(event);
            }
        }
        events
    }
}

fn update_event(key: &Key, before: &Row, after: &Row, pk_column: &str, timestamp: Frontier) -> RowEvent {
    RowEvent {
        kind: RowKind::Update,
        key: key.clone(),
        row_after: after.clone(),
        changed_fields: Some(before.diff(after, pk_column)),
        frontier_token: timestamp,
    }
}
