//! Event-log store: SQLite-backed extraction with a composable predicate.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

use crate::events::{
    format_timestamp, parse_timestamp, EventError, ImpressionRecord, ItemRecord, ViewRecord,
    IMPRESSION_TABLE, ITEM_TABLE, VIEW_TABLE,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("extraction from {table} returned zero rows for a bounded range")]
    EmptyExtraction { table: &'static str },
}

/// Builds the extraction query for a table. Bounds are inclusive on both
/// ends and ANDed with any extra predicate, in that order.
pub fn compose_query(
    table: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    extra_predicate: Option<&str>,
) -> String {
    let mut clauses = Vec::new();
    if let Some(from) = from {
        clauses.push(format!("logged_at >= '{}'", format_timestamp(from)));
    }
    if let Some(to) = to {
        clauses.push(format!("logged_at <= '{}'", format_timestamp(to)));
    }
    if let Some(extra) = extra_predicate {
        clauses.push(extra.to_string());
    }

    let mut sql = format!("SELECT * FROM {table}");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql
}

/// Read-side handle over the event warehouse tables.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    /// Creates the warehouse tables when absent. Used by ingestion tooling
    /// and tests; extraction never mutates.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS impression_log (
                impression_id TEXT NOT NULL,
                logged_at TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                app_code INTEGER NOT NULL,
                os_version TEXT NOT NULL,
                is_4g INTEGER NOT NULL,
                is_click INTEGER
            );
            CREATE TABLE IF NOT EXISTS view_log (
                logged_at TEXT NOT NULL,
                device_type TEXT NOT NULL,
                session_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS mst_item (
                item_id INTEGER NOT NULL,
                item_price INTEGER NOT NULL,
                category_1 INTEGER NOT NULL,
                category_2 INTEGER NOT NULL,
                category_3 INTEGER NOT NULL,
                product_type INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn insert_impression(&self, row: &ImpressionRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO impression_log
             (impression_id, logged_at, user_id, app_code, os_version, is_4g, is_click)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                row.impression_id,
                format_timestamp(row.logged_at),
                row.user_id,
                row.app_code,
                row.os_version,
                row.is_4g,
                row.is_click,
            ],
        )?;
        Ok(())
    }

    pub fn insert_view(&self, row: &ViewRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO view_log (logged_at, device_type, session_id, user_id, item_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                format_timestamp(row.logged_at),
                row.device_type,
                row.session_id,
                row.user_id,
                row.item_id,
            ],
        )?;
        Ok(())
    }

    pub fn insert_item(&self, row: &ItemRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO mst_item
             (item_id, item_price, category_1, category_2, category_3, product_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                row.item_id,
                row.item_price,
                row.category_1,
                row.category_2,
                row.category_3,
                row.product_type,
            ],
        )?;
        Ok(())
    }

    /// Bounded extraction of impressions. Zero rows inside a bounded range
    /// abort the run before anything downstream can train on nothing.
    pub fn extract_impressions(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ImpressionRecord>, StoreError> {
        let sql = compose_query(IMPRESSION_TABLE, from, to, None);
        info!(
            component = "store",
            event = "store.extract.start",
            table = IMPRESSION_TABLE,
            sql = %sql
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let logged_at: String = row.get("logged_at")?;
            out.push(ImpressionRecord {
                impression_id: row.get("impression_id")?,
                logged_at: parse_timestamp(IMPRESSION_TABLE, &logged_at)?,
                user_id: row.get("user_id")?,
                app_code: row.get("app_code")?,
                os_version: row.get("os_version")?,
                is_4g: row.get("is_4g")?,
                is_click: row.get("is_click")?,
            });
        }

        self.finish_extraction(IMPRESSION_TABLE, out.len(), from.is_some() || to.is_some())?;
        Ok(out)
    }

    pub fn extract_views(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ViewRecord>, StoreError> {
        let sql = compose_query(VIEW_TABLE, from, to, None);
        info!(
            component = "store",
            event = "store.extract.start",
            table = VIEW_TABLE,
            sql = %sql
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let logged_at: String = row.get("logged_at")?;
            out.push(ViewRecord {
                logged_at: parse_timestamp(VIEW_TABLE, &logged_at)?,
                device_type: row.get("device_type")?,
                session_id: row.get("session_id")?,
                user_id: row.get("user_id")?,
                item_id: row.get("item_id")?,
            });
        }

        self.finish_extraction(VIEW_TABLE, out.len(), from.is_some() || to.is_some())?;
        Ok(out)
    }

    /// Full-table extraction of the item dimension.
    pub fn extract_items(&self) -> Result<Vec<ItemRecord>, StoreError> {
        let sql = compose_query(ITEM_TABLE, None, None, None);
        info!(
            component = "store",
            event = "store.extract.start",
            table = ITEM_TABLE,
            sql = %sql
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ItemRecord {
                item_id: row.get("item_id")?,
                item_price: row.get("item_price")?,
                category_1: row.get("category_1")?,
                category_2: row.get("category_2")?,
                category_3: row.get("category_3")?,
                product_type: row.get("product_type")?,
            });
        }

        self.finish_extraction(ITEM_TABLE, out.len(), false)?;
        Ok(out)
    }

    fn finish_extraction(
        &self,
        table: &'static str,
        row_count: usize,
        bounded: bool,
    ) -> Result<(), StoreError> {
        if bounded && row_count == 0 {
            return Err(StoreError::EmptyExtraction { table });
        }
        info!(
            component = "store",
            event = "store.extract.finish",
            table,
            row_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_timestamp;
    use tempfile::NamedTempFile;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(IMPRESSION_TABLE, raw).unwrap()
    }

    #[test]
    fn unbounded_query_has_no_where_clause() {
        assert_eq!(
            compose_query("test_table", None, None, None),
            "SELECT * FROM test_table"
        );
    }

    #[test]
    fn bounded_query_uses_inclusive_comparisons_on_both_ends() {
        let sql = compose_query(
            "test_table",
            Some(ts("2018-11-12 00:00:00")),
            Some(ts("2018-12-10 00:00:00")),
            None,
        );
        assert_eq!(
            sql,
            "SELECT * FROM test_table WHERE logged_at >= '2018-11-12 00:00:00' \
             AND logged_at <= '2018-12-10 00:00:00'"
        );
    }

    #[test]
    fn extra_predicate_is_anded_after_the_bounds() {
        let sql = compose_query(
            "impression_feature",
            None,
            None,
            Some("version='20181210000000'"),
        );
        assert_eq!(
            sql,
            "SELECT * FROM impression_feature WHERE version='20181210000000'"
        );

        let sql = compose_query(
            "impression_feature",
            Some(ts("2018-12-01 00:00:00")),
            None,
            Some("version='20181210000000'"),
        );
        assert_eq!(
            sql,
            "SELECT * FROM impression_feature WHERE logged_at >= '2018-12-01 00:00:00' \
             AND version='20181210000000'"
        );
    }

    #[test]
    fn bounded_extraction_with_no_rows_fails() {
        let file = NamedTempFile::new().unwrap();
        let store = EventStore::open(file.path()).unwrap();
        store.ensure_schema().unwrap();

        let err = store
            .extract_impressions(Some(ts("2018-11-12 00:00:00")), Some(ts("2018-12-10 00:00:00")))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::EmptyExtraction {
                table: IMPRESSION_TABLE
            }
        ));
    }

    #[test]
    fn extraction_round_trips_records_inside_the_bounds() {
        let file = NamedTempFile::new().unwrap();
        let store = EventStore::open(file.path()).unwrap();
        store.ensure_schema().unwrap();

        let inside = ImpressionRecord {
            impression_id: "imp-1".to_string(),
            logged_at: ts("2018-12-01 10:00:00"),
            user_id: 101,
            app_code: 7,
            os_version: "latest".to_string(),
            is_4g: 1,
            is_click: Some(0),
        };
        let outside = ImpressionRecord {
            impression_id: "imp-2".to_string(),
            logged_at: ts("2019-01-01 10:00:00"),
            ..inside.clone()
        };
        store.insert_impression(&inside).unwrap();
        store.insert_impression(&outside).unwrap();

        let rows = store
            .extract_impressions(Some(ts("2018-11-12 00:00:00")), Some(ts("2018-12-10 00:00:00")))
            .unwrap();
        assert_eq!(rows, vec![inside]);
    }

    #[test]
    fn item_extraction_allows_an_empty_table() {
        let file = NamedTempFile::new().unwrap();
        let store = EventStore::open(file.path()).unwrap();
        store.ensure_schema().unwrap();

        assert!(store.extract_items().unwrap().is_empty());
    }
}
