use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::source::count_source;
use crate::entity::EntityType;
use crate::mapping::{MappingError, MappingStore};
use crate::store::{StoreError, TargetStore};

pub const DEFAULT_TOLERANCE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    Pass,
    Warn,
    Fail,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pass => "PASS",
            ValidationStatus::Warn => "WARN",
            ValidationStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRow {
    pub table: EntityType,
    /// `None` when an origin file could not be read or parsed.
    pub source_count: Option<u64>,
    pub target_count: i64,
    pub mapping_count: i64,
    pub status: ValidationStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub rows: Vec<ValidationRow>,
}

impl ValidationReport {
    pub fn has_failures(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.status == ValidationStatus::Fail)
    }

    pub fn count(&self, status: ValidationStatus) -> usize {
        self.rows.iter().filter(|row| row.status == status).count()
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("target count failed: {0}")]
    Store(#[from] StoreError),
    #[error("mapping count failed: {0}")]
    Mapping(#[from] MappingError),
}

/// Compare source and target counts. `tolerance` is the accepted relative
/// difference, as a fraction of the source count.
pub fn classify(source: Option<u64>, target: i64, tolerance: f64) -> ValidationStatus {
    let Some(source) = source else {
        return ValidationStatus::Warn;
    };
    let target = target.max(0) as u64;
    match (source, target) {
        (0, 0) => ValidationStatus::Pass,
        (0, _) => ValidationStatus::Warn,
        (_, 0) => ValidationStatus::Fail,
        (source, target) => {
            let diff = source.abs_diff(target) as f64;
            if diff <= source as f64 * tolerance {
                ValidationStatus::Pass
            } else {
                ValidationStatus::Warn
            }
        }
    }
}

pub async fn validate_export(
    export_dir: &Path,
    store: &dyn TargetStore,
    mappings: &MappingStore,
    tolerance: f64,
) -> Result<ValidationReport, ValidationError> {
    let mut report = ValidationReport::default();
    for entity in EntityType::ALL {
        let source_count = match count_source(export_dir, entity) {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(
                    target: "transit_migrate",
                    event = "validate_source_unreadable",
                    entity = %entity,
                    error = %err
                );
                None
            }
        };
        let target_count = store.count(entity).await?;
        let mapping_count = mappings.count(entity).await?;
        report.rows.push(ValidationRow {
            table: entity,
            source_count,
            target_count,
            mapping_count,
            status: classify(source_count, target_count, tolerance),
        });
    }
    Ok(report)
}
