//! Online user-feature store backing the serving path.
//!
//! One row per (user, feature version) carrying the precomputed windowed
//! aggregates and item attributes. A missing user is an empty result,
//! never an error; the serving path fills the gaps through schema
//! coercion.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FeatureStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserFeatureRow {
    pub user_id: i64,
    pub version: String,
    pub previous_impression_count: Option<i64>,
    pub previous_view_count: Option<i64>,
    pub item_id: Option<i64>,
    pub device_type: Option<String>,
    pub item_price: Option<i64>,
    pub category_1: Option<i64>,
    pub category_2: Option<i64>,
    pub category_3: Option<i64>,
    pub product_type: Option<i64>,
    /// Unix seconds after which the row may be evicted.
    pub expired_at: i64,
}

#[derive(Debug)]
pub struct OnlineFeatureStore {
    conn: Connection,
}

impl OnlineFeatureStore {
    pub fn open(path: &Path) -> Result<Self, FeatureStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS user_features (
                user_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                previous_impression_count INTEGER,
                previous_view_count INTEGER,
                item_id INTEGER,
                device_type TEXT,
                item_price INTEGER,
                category_1 INTEGER,
                category_2 INTEGER,
                category_3 INTEGER,
                product_type INTEGER,
                expired_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, version)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn put_rows(&self, rows: &[UserFeatureRow]) -> Result<(), FeatureStoreError> {
        for row in rows {
            self.conn.execute(
                "INSERT OR REPLACE INTO user_features
                 (user_id, version, previous_impression_count, previous_view_count,
                  item_id, device_type, item_price, category_1, category_2, category_3,
                  product_type, expired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    row.user_id,
                    row.version,
                    row.previous_impression_count,
                    row.previous_view_count,
                    row.item_id,
                    row.device_type,
                    row.item_price,
                    row.category_1,
                    row.category_2,
                    row.category_3,
                    row.product_type,
                    row.expired_at,
                ],
            )?;
        }
        info!(
            component = "feature_store",
            event = "feature_store.put.finish",
            row_count = rows.len()
        );
        Ok(())
    }

    /// Fetches the row for the given version, or the highest version when
    /// `version` is `None`. Absent users are `Ok(None)`.
    pub fn get_latest_or_versioned(
        &self,
        user_id: i64,
        version: Option<&str>,
    ) -> Result<Option<UserFeatureRow>, FeatureStoreError> {
        let row = match version {
            Some(version) => self
                .conn
                .query_row(
                    "SELECT * FROM user_features WHERE user_id = ?1 AND version = ?2",
                    rusqlite::params![user_id, version],
                    read_row,
                )
                .optional()?,
            None => self
                .conn
                .query_row(
                    "SELECT * FROM user_features WHERE user_id = ?1
                     ORDER BY version DESC LIMIT 1",
                    rusqlite::params![user_id],
                    read_row,
                )
                .optional()?,
        };
        Ok(row)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<UserFeatureRow> {
    Ok(UserFeatureRow {
        user_id: row.get("user_id")?,
        version: row.get("version")?,
        previous_impression_count: row.get("previous_impression_count")?,
        previous_view_count: row.get("previous_view_count")?,
        item_id: row.get("item_id")?,
        device_type: row.get("device_type")?,
        item_price: row.get("item_price")?,
        category_1: row.get("category_1")?,
        category_2: row.get("category_2")?,
        category_3: row.get("category_3")?,
        product_type: row.get("product_type")?,
        expired_at: row.get("expired_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_row(user_id: i64, version: &str) -> UserFeatureRow {
        UserFeatureRow {
            user_id,
            version: version.to_string(),
            previous_impression_count: Some(2),
            previous_view_count: Some(3),
            item_id: Some(201),
            device_type: Some("android".to_string()),
            item_price: Some(100),
            category_1: Some(1),
            category_2: Some(2),
            category_3: Some(3),
            product_type: Some(4),
            expired_at: 1_700_000_000,
        }
    }

    #[test]
    fn missing_user_is_an_empty_result() {
        let file = NamedTempFile::new().unwrap();
        let store = OnlineFeatureStore::open(file.path()).unwrap();
        assert_eq!(store.get_latest_or_versioned(999, None).unwrap(), None);
        assert_eq!(
            store
                .get_latest_or_versioned(999, Some("20230101000000"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn latest_lookup_prefers_the_highest_version() {
        let file = NamedTempFile::new().unwrap();
        let store = OnlineFeatureStore::open(file.path()).unwrap();
        store
            .put_rows(&[
                sample_row(101, "20230101000000"),
                sample_row(101, "20230105000000"),
            ])
            .unwrap();

        let row = store.get_latest_or_versioned(101, None).unwrap().unwrap();
        assert_eq!(row.version, "20230105000000");
    }

    #[test]
    fn versioned_lookup_pins_the_exact_version() {
        let file = NamedTempFile::new().unwrap();
        let store = OnlineFeatureStore::open(file.path()).unwrap();
        store
            .put_rows(&[
                sample_row(101, "20230101000000"),
                sample_row(101, "20230105000000"),
            ])
            .unwrap();

        let row = store
            .get_latest_or_versioned(101, Some("20230101000000"))
            .unwrap()
            .unwrap();
        assert_eq!(row.version, "20230101000000");
    }

    #[test]
    fn nullable_aggregates_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let store = OnlineFeatureStore::open(file.path()).unwrap();
        let row = UserFeatureRow {
            previous_impression_count: None,
            item_id: None,
            device_type: None,
            ..sample_row(202, "20230101000000")
        };
        store.put_rows(std::slice::from_ref(&row)).unwrap();
        assert_eq!(store.get_latest_or_versioned(202, None).unwrap(), Some(row));
    }

    #[test]
    fn re_materializing_a_version_replaces_the_row() {
        let file = NamedTempFile::new().unwrap();
        let store = OnlineFeatureStore::open(file.path()).unwrap();
        store.put_rows(&[sample_row(101, "20230101000000")]).unwrap();
        let updated = UserFeatureRow {
            previous_view_count: Some(9),
            ..sample_row(101, "20230101000000")
        };
        store.put_rows(std::slice::from_ref(&updated)).unwrap();
        assert_eq!(
            store
                .get_latest_or_versioned(101, Some("20230101000000"))
                .unwrap(),
            Some(updated)
        );
    }
}
