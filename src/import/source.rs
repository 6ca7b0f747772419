use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::rows::RawRecord;
use crate::entity::EntityType;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} does not contain a JSON array")]
    NotAnArray { path: PathBuf },
}

/// All records of one entity, concatenated across its origin files.
#[derive(Debug, Default)]
pub struct SourceSet {
    pub records: Vec<RawRecord>,
    pub files_read: Vec<String>,
    pub files_missing: Vec<String>,
    /// Array elements that were not JSON objects.
    pub rejected: usize,
}

impl SourceSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parse one origin file. `Ok(None)` when the file does not exist.
fn read_array(path: &Path) -> Result<Option<Vec<Value>>, SourceError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: Value = serde_json::from_str(&text).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Array(items) => Ok(Some(items)),
        _ => Err(SourceError::NotAnArray {
            path: path.to_path_buf(),
        }),
    }
}

pub fn load_source(export_dir: &Path, entity: EntityType) -> Result<SourceSet, SourceError> {
    let mut set = SourceSet::default();
    for file in entity.source_files() {
        let path = export_dir.join(file);
        let Some(items) = read_array(&path)? else {
            warn!(
                target: "transit_migrate",
                event = "source_file_missing",
                entity = %entity,
                path = %path.display()
            );
            set.files_missing.push((*file).to_string());
            continue;
        };

        for item in items {
            match item {
                Value::Object(map) => set.records.push(RawRecord::new(map, *file)),
                _ => set.rejected += 1,
            }
        }
        set.files_read.push((*file).to_string());
    }

    if set.rejected > 0 {
        warn!(
            target: "transit_migrate",
            event = "source_non_object_rejected",
            entity = %entity,
            rejected = set.rejected
        );
    }
    Ok(set)
}

/// Number of array elements across the entity's origin files. Missing files
/// count zero.
pub fn count_source(export_dir: &Path, entity: EntityType) -> Result<u64, SourceError> {
    let mut total = 0u64;
    for file in entity.source_files() {
        if let Some(items) = read_array(&export_dir.join(file))? {
            total += items.len() as u64;
        }
    }
    Ok(total)
}
