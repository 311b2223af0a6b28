//! Append-only model registry keyed by (model, version).
//!
//! The latest version of a model is the lexicographic maximum of its
//! version strings. Versions are `%Y%m%d%H%M%S` stamps, so lexicographic
//! and chronological order coincide; write order is irrelevant.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("model {model} version {version} is already registered")]
    DuplicateVersion { model: String, version: String },
    #[error("metadata is not serializable: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Sqlite(err)
    }
}

pub struct ModelRegistry {
    conn: Connection,
}

impl ModelRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS model_registry (
                model TEXT NOT NULL,
                version TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (model, version)
            );
            ",
        )?;
        Ok(Self { conn })
    }

    /// Appends one registry entry. A second write for the same
    /// (model, version) is a conflict, never an overwrite, which is what
    /// serializes concurrent pipeline runs for the same model.
    pub fn register(
        &self,
        model: &str,
        version: &str,
        storage_key: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        let result = self.conn.execute(
            "INSERT INTO model_registry (model, version, storage_key, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            rusqlite::params![model, version, storage_key, serde_json::to_string(metadata)?],
        );
        match result {
            Ok(_) => {
                info!(
                    component = "registry",
                    event = "registry.register",
                    model,
                    version,
                    storage_key
                );
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(RegistryError::DuplicateVersion {
                    model: model.to_string(),
                    version: version.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn latest_version(&self, model: &str) -> Result<Option<String>, RegistryError> {
        let version = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM model_registry WHERE model = ?1",
                [model],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        info!(
            component = "registry",
            event = "registry.latest_version",
            model,
            version = version.as_deref().unwrap_or("<none>")
        );
        Ok(version)
    }

    pub fn storage_key(&self, model: &str, version: &str) -> Result<Option<String>, RegistryError> {
        Ok(self
            .conn
            .query_row(
                "SELECT storage_key FROM model_registry WHERE model = ?1 AND version = ?2",
                [model, version],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn metadata(
        &self,
        model: &str,
        version: &str,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT metadata FROM model_registry WHERE model = ?1 AND version = ?2",
                [model, version],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
