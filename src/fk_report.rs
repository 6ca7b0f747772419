//! Deferred report of foreign keys that could not be resolved during a run.
//!
//! Each entry is appended by rewriting the whole array into a temporary file
//! in the same directory and renaming it over the report, so a crash leaves
//! either the previous or the new complete file behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

use crate::entity::EntityType;

pub const REPORT_FILE_NAME: &str = "invalid-fk-report.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidFkRecord {
    pub timestamp: DateTime<Utc>,
    /// Entity holding the dangling reference.
    pub collection: String,
    /// Legacy id of the referencing record.
    pub record_id: String,
    pub fk_field: String,
    pub fk_value: String,
    pub target_collection: String,
}

impl InvalidFkRecord {
    pub fn new(
        collection: EntityType,
        record_id: &str,
        fk_field: &str,
        fk_value: &str,
        target_collection: EntityType,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            collection: collection.as_str().to_string(),
            record_id: record_id.to_string(),
            fk_field: fk_field.to_string(),
            fk_value: fk_value.to_string(),
            target_collection: target_collection.as_str().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a report array: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct InvalidFkReporter {
    path: PathBuf,
    recorded: AtomicU64,
}

impl InvalidFkReporter {
    /// Reporter writing into `export_dir`. Entries already present in the
    /// file are preserved.
    pub fn new(export_dir: &Path) -> Self {
        Self {
            path: export_dir.join(REPORT_FILE_NAME),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this reporter.
    pub fn recorded_count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn load(&self) -> Result<Vec<InvalidFkRecord>, ReportError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ReportError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|source| ReportError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Append one entry. A corrupt existing file is moved aside rather than
    /// silently discarded.
    pub fn record(&self, entry: InvalidFkRecord) -> Result<(), ReportError> {
        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(ReportError::Parse { source, .. }) => {
                let aside = self.path.with_extension("json.corrupt");
                warn!(
                    target: "transit_migrate",
                    event = "fk_report_corrupt",
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %source
                );
                fs::rename(&self.path, &aside).map_err(|source| ReportError::Write {
                    path: aside.clone(),
                    source,
                })?;
                Vec::new()
            }
            Err(other) => return Err(other),
        };
        entries.push(entry);
        self.replace(&entries)?;
        self.recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn replace(&self, entries: &[InvalidFkRecord]) -> Result<(), ReportError> {
        let write_err = |source: io::Error| ReportError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        let json = serde_json::to_vec_pretty(entries).map_err(|err| write_err(err.into()))?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }
}
