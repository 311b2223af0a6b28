//! Filesystem artifact store: the run-output side of the pipeline.
//!
//! Keys are slash paths under a root directory. Writes go through a tmp
//! file plus rename so a crashed run never leaves a half-written model
//! payload behind a registered storage key.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::frame::FeatureFrame;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("invalid artifact key '{0}'")]
    InvalidKey(String),
    #[error("I/O error for {key}: {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },
    #[error("CSV error for {key}: {source}")]
    Csv { key: String, source: csv::Error },
}

/// Key prefix for one pipeline run: `{job_type}/{version}`.
#[derive(Debug, Clone)]
pub struct RunArtifact {
    key_prefix: String,
}

impl RunArtifact {
    pub fn new(job_type: &str, version: &str) -> Self {
        Self {
            key_prefix: format!("{job_type}/{version}"),
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn key(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.key_prefix)
    }
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ArtifactError::Io {
                key: key.to_string(),
                source,
            })?;
        }
        write_atomic(&path, bytes).map_err(|source| ArtifactError::Io {
            key: key.to_string(),
            source,
        })?;
        info!(
            component = "artifacts",
            event = "artifacts.put",
            key,
            bytes = bytes.len()
        );
        Ok(())
    }

    pub fn get_bytes(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(key)?;
        if !path.exists() {
            return Err(ArtifactError::NotFound(key.to_string()));
        }
        fs::read(&path).map_err(|source| ArtifactError::Io {
            key: key.to_string(),
            source,
        })
    }

    /// Auxiliary uploads only: a failure is logged and reported as
    /// `false`, never propagated. The training decision must not depend
    /// on anything written through here.
    pub fn put_best_effort(&self, key: &str, bytes: &[u8]) -> bool {
        match self.put_bytes(key, bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    component = "artifacts",
                    event = "artifacts.put.failed",
                    key,
                    error = %err
                );
                false
            }
        }
    }

    pub fn put_frame_csv(&self, key: &str, frame: &FeatureFrame) -> Result<(), ArtifactError> {
        let bytes = frame_to_csv(key, frame)?;
        self.put_bytes(key, &bytes)
    }

    pub fn put_frame_csv_best_effort(&self, key: &str, frame: &FeatureFrame) -> bool {
        match self.put_frame_csv(key, frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    component = "artifacts",
                    event = "artifacts.put.failed",
                    key,
                    error = %err
                );
                false
            }
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn frame_to_csv(key: &str, frame: &FeatureFrame) -> Result<Vec<u8>, ArtifactError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let wrap = |source: csv::Error| ArtifactError::Csv {
        key: key.to_string(),
        source,
    };
    writer.write_record(frame.columns()).map_err(wrap)?;
    for row in frame.rows() {
        let rendered: Vec<String> = row.iter().map(|cell| cell.render()).collect();
        writer.write_record(&rendered).map_err(wrap)?;
    }
    writer
        .into_inner()
        .map_err(|err| ArtifactError::Io {
            key: key.to_string(),
            source: err.into_error(),
        })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)
}
