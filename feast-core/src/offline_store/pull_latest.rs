//! The "latest row per entity" query over a half-open time window.
//!
//! Exactly one row survives per distinct join key tuple: the one with the greatest event
//! timestamp, then the greatest created timestamp. Rows outside `[start, end)` are excluded.
//! On a full tie the row that comes last in the source wins. SQL backends express "last in the
//! source" through a tiebreak column (`rowid` for SQLite) and [`select_latest`] through input order,
//! so re-running the same query always selects the same row.

use crate::error::{FeastError, Result};
use crate::model::{FeatureView, HashEntityKey};
use crate::types::{EntityKey, Value};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct PullLatestQuery {
    pub table: String,
    pub join_key_columns: Vec<String>,
    pub feature_columns: Vec<String>,
    pub event_timestamp_column: String,
    pub created_timestamp_column: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A row returned by an offline source. Values are positional: `join_values` follow
/// [`PullLatestQuery::join_key_columns`] and `feature_values` follow
/// [`PullLatestQuery::feature_columns`].
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub join_values: Vec<Value>,
    pub feature_values: Vec<Value>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

impl SourceRow {
    fn rank(&self) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
        (self.event_ts, self.created_ts)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullLatestQueryBuilder {
    table: String,
    join_key_columns: Vec<String>,
    feature_columns: Vec<String>,
    event_timestamp_column: String,
    created_timestamp_column: Option<String>,
}

impl PullLatestQueryBuilder {
    pub fn new(table: impl Into<String>, event_timestamp_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event_timestamp_column: event_timestamp_column.into(),
            ..Default::default()
        }
    }

    /// Source columns of a feature view, with field mapping reversed so that columns are
    /// requested under their names in the source table.
    pub fn for_view(view: &FeatureView) -> Self {
        let source = &view.source;
        Self {
            table: source.table.clone(),
            join_key_columns: view
                .entity_columns
                .iter()
                .map(|c| source.source_column(&c.name).to_string())
                .collect(),
            feature_columns: view
                .features
                .iter()
                .map(|f| source.source_column(&f.name).to_string())
                .collect(),
            event_timestamp_column: source.event_timestamp_column.clone(),
            created_timestamp_column: source.created_timestamp_column.clone(),
        }
    }

    pub fn join_keys<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn features<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.feature_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn created_timestamp_column(mut self, column: Option<String>) -> Self {
        self.created_timestamp_column = column;
        self
    }

    pub fn build(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<PullLatestQuery> {
        if start > end {
            return Err(FeastError::InvalidWindow { start, end });
        }
        if self.table.is_empty() {
            return Err(FeastError::config("pull latest query needs a source table"));
        }
        if self.event_timestamp_column.is_empty() {
            return Err(FeastError::config(format!(
                "source table {} has no event timestamp column",
                self.table
            )));
        }
        Ok(PullLatestQuery {
            table: self.table,
            join_key_columns: self.join_key_columns,
            feature_columns: self.feature_columns,
            event_timestamp_column: self.event_timestamp_column,
            created_timestamp_column: self.created_timestamp_column,
            start,
            end,
        })
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl PullLatestQuery {
    pub fn selected_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .join_key_columns
            .iter()
            .chain(self.feature_columns.iter())
            .map(String::as_str)
            .collect();
        columns.push(&self.event_timestamp_column);
        if let Some(created) = &self.created_timestamp_column {
            columns.push(created);
        }
        columns
    }

    /// Renders the query as SQL with two positional parameters, the window start and end.
    /// `tiebreak` is an expression ordered descending after the timestamps.
    pub fn to_sql(&self, tiebreak: Option<&str>) -> String {
        self.to_sql_with(tiebreak, str::to_string)
    }

    /// Same as [`to_sql`](Self::to_sql), except that every timestamp comparison and ordering
    /// goes through `timestamp`, applied to the quoted column. The window parameters must be
    /// bound in whatever form that expression yields.
    pub fn to_sql_with<F>(&self, tiebreak: Option<&str>, timestamp: F) -> String
    where
        F: Fn(&str) -> String,
    {
        let columns = self
            .selected_columns()
            .into_iter()
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(", ");
        let partition_by = if self.join_key_columns.is_empty() {
            String::new()
        } else {
            format!(
                "PARTITION BY {} ",
                self.join_key_columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let event = timestamp(&quote_identifier(&self.event_timestamp_column));
        let mut order_by = vec![format!("{} DESC", event)];
        if let Some(created) = &self.created_timestamp_column {
            order_by.push(format!("{} DESC", timestamp(&quote_identifier(created))));
        }
        if let Some(tiebreak) = tiebreak {
            order_by.push(format!("{} DESC", tiebreak));
        }
        format!(
            "SELECT {columns} FROM (SELECT {columns}, ROW_NUMBER() OVER ({partition_by}ORDER BY {order_by}) AS _feast_row \
             FROM {table} WHERE {event} >= ? AND {event} < ?) WHERE _feast_row = 1",
            columns = columns,
            partition_by = partition_by,
            order_by = order_by.join(", "),
            table = quote_identifier(&self.table),
            event = event,
        )
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Evaluates the pull-latest contract over rows already in memory. Output follows the order
/// in which each entity key first appears.
pub fn select_latest<I>(query: &PullLatestQuery, rows: I) -> Vec<SourceRow>
where
    I: IntoIterator<Item = SourceRow>,
{
    let mut index: HashMap<HashEntityKey, usize> = HashMap::default();
    let mut latest: Vec<SourceRow> = Vec::new();
    for row in rows {
        if !query.contains(row.event_ts) {
            continue;
        }
        let key = HashEntityKey(Arc::new(EntityKey::new(
            query.join_key_columns.clone(),
            row.join_values.clone(),
        )));
        match index.get(&key) {
            Some(&i) => {
                if row.rank() >= latest[i].rank() {
                    latest[i] = row;
                }
            }
            None => {
                index.insert(key, latest.len());
                latest.push(row);
            }
        }
    }
    latest
}
