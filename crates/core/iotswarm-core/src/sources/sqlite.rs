//! SQLite data source
//!
//! Each table holds one row per reading with a `site_id` column, a
//! `date_time` text column in `YYYY-MM-DD HH:MM:SS[.fff]` layout, and any
//! number of value columns. RFC 3339 values with an offset are accepted as
//! well. Queries run on the connection's background thread through
//! `tokio-rusqlite`.
//!
//! For simulation the source replays each site's rows in time order, one per
//! [`DataSource::next_reading`] call, and wraps around after the last row.

use crate::{
    error::{IotSwarmError, IotSwarmResult},
    traits::DataSource,
    types::{
        newer_than, parse_timestamp, Record, SiteId, TableName, SITE_COLUMN, TIMESTAMP_COLUMN,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::ValueRef;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

/// Row as read from SQLite, before the timestamp is parsed
type RawRow = (Option<String>, Map<String, Value>);

/// Largest UTC offset a stored `date_time` may carry, rounded up
const MAX_OFFSET_SLACK_HOURS: i64 = 24;

/// Data source reading from a SQLite database file
pub struct SqliteDataSource {
    conn: Connection,
    name: String,
    /// Replay position per (table, site): the offset of the next row to send
    cursors: Mutex<HashMap<(TableName, SiteId), u64>>,
}

impl SqliteDataSource {
    /// Open the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> IotSwarmResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).await.map_err(|e| {
            IotSwarmError::connection(format!("failed to open {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), "Opened SQLite data source");
        Ok(Self {
            conn,
            name: format!("sqlite:{}", path.display()),
            cursors: Mutex::default(),
        })
    }

    /// Open a private in-memory database
    pub async fn open_in_memory() -> IotSwarmResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| IotSwarmError::connection(e.to_string()))?;
        Ok(Self {
            conn,
            name: "sqlite::memory:".to_string(),
            cursors: Mutex::default(),
        })
    }

    /// Run a batch of SQL statements, used to seed fixtures
    pub async fn execute_batch(&self, sql: &str) -> IotSwarmResult<()> {
        let sql = sql.to_string();
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(map_call_error)
    }

    async fn query_rows(
        &self,
        sql: String,
        site_id: String,
        bound: Option<String>,
    ) -> IotSwarmResult<Vec<RawRow>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let columns: Vec<String> =
                    stmt.column_names().into_iter().map(String::from).collect();

                let rows = match &bound {
                    Some(bound) => stmt
                        .query_map(rusqlite::params![site_id, bound], |row| read_row(row, &columns))?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map(rusqlite::params![site_id], |row| read_row(row, &columns))?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await
            .map_err(map_call_error)
    }

    /// The site's row at `offset` in time order
    async fn row_at(&self, table: &str, site_id: &str, offset: u64) -> IotSwarmResult<Option<Record>> {
        let sql = format!(
            "SELECT * FROM \"{table}\" WHERE {SITE_COLUMN} = ?1 \
             ORDER BY {TIMESTAMP_COLUMN} ASC LIMIT 1 OFFSET {offset}"
        );
        let rows = self.query_rows(sql, site_id.to_string(), None).await?;
        Ok(into_records(rows, table, site_id)?.pop())
    }

    /// Forget every replay position; the next reading of each site is its oldest row
    pub async fn rewind(&self) {
        self.cursors.lock().await.clear();
    }
}

/// Check that `name` can be spliced into SQL as a table name
pub fn validate_identifier(name: &str) -> IotSwarmResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(IotSwarmError::config(format!("invalid table name '{name}'")))
    }
}

fn map_call_error(err: tokio_rusqlite::Error) -> IotSwarmError {
    match err {
        tokio_rusqlite::Error::ConnectionClosed => {
            IotSwarmError::connection("SQLite connection closed")
        }
        other => IotSwarmError::query(other),
    }
}

fn read_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<RawRow> {
    let mut time = None;
    let mut values = Map::new();

    for (idx, column) in columns.iter().enumerate() {
        let value = row.get_ref(idx)?;
        if column.eq_ignore_ascii_case(TIMESTAMP_COLUMN) {
            if let ValueRef::Text(text) = value {
                time = Some(String::from_utf8_lossy(text).into_owned());
            }
        } else if !column.eq_ignore_ascii_case(SITE_COLUMN) {
            values.insert(column.clone(), to_json(value));
        }
    }

    Ok((time, values))
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
    }
}

fn into_records(rows: Vec<RawRow>, table: &str, site_id: &str) -> IotSwarmResult<Vec<Record>> {
    rows.into_iter()
        .map(|(time, values)| {
            let text = time.ok_or_else(|| {
                IotSwarmError::serialization(format!(
                    "{table}/{site_id}: row without a {TIMESTAMP_COLUMN} value"
                ))
            })?;
            let timestamp = parse_timestamp(&text).ok_or_else(|| {
                IotSwarmError::serialization(format!(
                    "{table}/{site_id}: unparseable {TIMESTAMP_COLUMN} '{text}'"
                ))
            })?;
            Ok(Record { timestamp, values })
        })
        .collect()
}

#[async_trait]
impl DataSource for SqliteDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_sites(&self, table: &str) -> IotSwarmResult<BTreeSet<SiteId>> {
        validate_identifier(table)?;
        let sql = format!(
            "SELECT DISTINCT CAST({SITE_COLUMN} AS TEXT) FROM \"{table}\" WHERE {SITE_COLUMN} IS NOT NULL"
        );

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let sites = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(sites)
            })
            .await
            .map_err(map_call_error)
    }

    async fn fetch_since(
        &self,
        table: &str,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> IotSwarmResult<Vec<Record>> {
        validate_identifier(table)?;
        // Text comparison is only coarse, the strict bound is applied after
        // parsing. The slack keeps rows stored with a UTC offset whose local
        // date or hour sorts before the UTC bound.
        let sql = format!(
            "SELECT * FROM \"{table}\" WHERE {SITE_COLUMN} = ?1 AND {TIMESTAMP_COLUMN} >= ?2 \
             ORDER BY {TIMESTAMP_COLUMN} ASC"
        );
        let bound = since
            .checked_sub_signed(Duration::hours(MAX_OFFSET_SLACK_HOURS))
            .unwrap_or(since)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let rows = self
            .query_rows(sql, site_id.to_string(), Some(bound))
            .await?;
        let records = into_records(rows, table, site_id)?;
        Ok(newer_than(records, since))
    }

    async fn latest(&self, table: &str, site_id: &str) -> IotSwarmResult<Option<Record>> {
        validate_identifier(table)?;
        let sql = format!(
            "SELECT * FROM \"{table}\" WHERE {SITE_COLUMN} = ?1 \
             ORDER BY {TIMESTAMP_COLUMN} DESC LIMIT 1"
        );

        let rows = self.query_rows(sql, site_id.to_string(), None).await?;
        let mut records = into_records(rows, table, site_id)?;
        if records.is_empty() {
            warn!(table, site_id, "No rows found for site");
        }
        Ok(records.pop())
    }

    async fn next_reading(&self, table: &str, site_id: &str) -> IotSwarmResult<Option<Record>> {
        validate_identifier(table)?;
        let key = (table.to_string(), site_id.to_string());

        // Held across the query so concurrent callers never share a position
        let mut cursors = self.cursors.lock().await;
        let mut offset = cursors.get(&key).copied().unwrap_or(0);

        let mut record = self.row_at(table, site_id, offset).await?;
        if record.is_none() && offset > 0 {
            debug!(table, site_id, rows = offset, "Reached the last row, starting over");
            offset = 0;
            record = self.row_at(table, site_id, offset).await?;
        }

        match record {
            Some(_) => {
                cursors.insert(key, offset + 1);
            }
            None => {
                cursors.remove(&key);
                warn!(table, site_id, "No rows found for site");
            }
        }
        Ok(record)
    }
}
