use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::batch::import_batched;
use super::rows::{transform, ImportUnit, RawRecord};
use super::source::{load_source, SourceError, SourceSet};
use crate::entity::{EntityType, ImportStrategy};
use crate::fk_report::{InvalidFkRecord, InvalidFkReporter, ReportError};
use crate::mapping::{MappingError, MappingStore};
use crate::progress::ProgressLog;
use crate::store::{StoreError, TargetStore};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Collaborators shared by every importer of one run.
#[derive(Clone, Copy)]
pub struct ImportContext<'a> {
    pub store: &'a dyn TargetStore,
    pub mappings: &'a MappingStore,
    pub reporter: &'a InvalidFkReporter,
    pub export_dir: &'a Path,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub source_records: u64,
    pub imported: u64,
    /// Already-mapped legacy ids and natural keys already present.
    pub duplicates: u64,
    /// Duplicates whose legacy id was mapped onto the surviving row.
    pub linked_duplicates: u64,
    pub failed: u64,
    pub invalid_foreign_keys: u64,
    pub truncated_fields: u64,
}

impl ImportOutcome {
    pub(super) fn for_source(source: &SourceSet) -> Self {
        Self {
            source_records: (source.records.len() + source.rejected) as u64,
            failed: source.rejected as u64,
            ..Self::default()
        }
    }

    pub fn skipped(&self) -> u64 {
        self.duplicates + self.failed
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("failed to write invalid foreign key report: {0}")]
    Report(#[from] ReportError),
}

/// Import every record of one entity from the export directory.
pub async fn import_entity(
    ctx: &ImportContext<'_>,
    entity: EntityType,
    force_per_record: bool,
) -> Result<ImportOutcome, ImportError> {
    let source = load_source(ctx.export_dir, entity)?;
    info!(
        target: "transit_migrate",
        event = "import_entity_start",
        entity = %entity,
        records = source.records.len(),
        files = ?source.files_read
    );

    match (entity.strategy(), force_per_record) {
        (ImportStrategy::Batched, false) => import_batched(ctx, entity, &source).await,
        _ => import_per_record(ctx, entity, &source).await,
    }
}

pub(super) async fn import_per_record(
    ctx: &ImportContext<'_>,
    entity: EntityType,
    source: &SourceSet,
) -> Result<ImportOutcome, ImportError> {
    let mut outcome = ImportOutcome::for_source(source);
    let mut progress = ProgressLog::new(entity, source.records.len());

    for raw in &source.records {
        import_one(ctx, entity, raw, &mut outcome).await?;
        progress.advance(1);
    }

    Ok(outcome)
}

async fn import_one(
    ctx: &ImportContext<'_>,
    entity: EntityType,
    raw: &RawRecord,
    outcome: &mut ImportOutcome,
) -> Result<(), ImportError> {
    if let Some(legacy_id) = raw.legacy_id() {
        if ctx.mappings.resolve(&legacy_id, entity).await?.is_some() {
            outcome.duplicates += 1;
            return Ok(());
        }
    }

    let Some(mut unit) = prepare_unit(entity, raw, outcome) else {
        return Ok(());
    };
    for fk in unit.foreign_keys.clone() {
        let resolved = ctx.mappings.resolve(&fk.legacy_value, fk.target).await?;
        unit.set_foreign_key(&fk, resolved);
    }
    outcome.truncated_fields += u64::from(unit.truncated);

    insert_unit(ctx, &unit, outcome).await?;
    Ok(())
}

/// Transform a record, counting it failed when that is impossible.
pub(super) fn prepare_unit(
    entity: EntityType,
    raw: &RawRecord,
    outcome: &mut ImportOutcome,
) -> Option<ImportUnit> {
    match transform(entity, raw) {
        Ok(unit) => Some(unit),
        Err(err) => {
            let legacy_id = raw.legacy_id().unwrap_or_else(|| "<none>".to_string());
            warn!(
                target: "transit_migrate",
                event = "record_rejected",
                entity = %entity,
                origin = raw.origin(),
                legacy_id = %legacy_id,
                error = %err
            );
            outcome.failed += 1;
            None
        }
    }
}

/// Report the references of a stored unit that were left null.
pub(super) fn report_unresolved(
    reporter: &InvalidFkReporter,
    unit: &ImportUnit,
    outcome: &mut ImportOutcome,
) -> Result<(), ReportError> {
    for fk in &unit.unresolved {
        warn!(
            target: "transit_migrate",
            event = "foreign_key_unresolved",
            entity = %unit.entity,
            legacy_id = %unit.legacy_id,
            column = fk.column,
            value = %fk.legacy_value,
            target_entity = %fk.target
        );
        reporter.record(InvalidFkRecord::new(
            unit.entity,
            &unit.legacy_id,
            fk.column,
            &fk.legacy_value,
            fk.target,
        ))?;
        outcome.invalid_foreign_keys += 1;
    }
    Ok(())
}

/// Insert one unit and map it, returning the new row id. Null references
/// are reported only for stored rows. Unique violations count as
/// duplicates and get linked to the surviving row; other failures are
/// logged and counted.
pub(super) async fn insert_unit(
    ctx: &ImportContext<'_>,
    unit: &ImportUnit,
    outcome: &mut ImportOutcome,
) -> Result<Option<Uuid>, ImportError> {
    match ctx.store.insert(unit.entity, &unit.fields).await {
        Ok(target_id) => {
            record_mapping(ctx.mappings, unit, target_id).await?;
            report_unresolved(ctx.reporter, unit, outcome)?;
            outcome.imported += 1;
            return Ok(Some(target_id));
        }
        Err(err) if err.is_unique_violation() => {
            outcome.duplicates += 1;
            if link_duplicate(ctx, unit).await? {
                outcome.linked_duplicates += 1;
            }
        }
        Err(err) => {
            warn!(
                target: "transit_migrate",
                event = "record_insert_failed",
                entity = %unit.entity,
                legacy_id = %unit.legacy_id,
                error = %err
            );
            outcome.failed += 1;
        }
    }
    Ok(None)
}

pub(super) async fn record_mapping(
    mappings: &MappingStore,
    unit: &ImportUnit,
    target_id: Uuid,
) -> Result<(), MappingError> {
    match mappings.record(&unit.legacy_id, target_id, unit.entity).await {
        Ok(()) => Ok(()),
        Err(MappingError::Duplicate { .. }) => {
            warn!(
                target: "transit_migrate",
                event = "mapping_already_present",
                entity = %unit.entity,
                legacy_id = %unit.legacy_id
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Map a duplicate's legacy id onto the row already holding its natural key.
async fn link_duplicate(ctx: &ImportContext<'_>, unit: &ImportUnit) -> Result<bool, ImportError> {
    let (Some(column), Some(key)) = (unit.entity.natural_key_column(), unit.natural_key.as_deref())
    else {
        return Ok(false);
    };
    let Some(existing) = ctx.store.find_id(unit.entity, column, key).await? else {
        return Ok(false);
    };
    match ctx.mappings.record(&unit.legacy_id, existing, unit.entity).await {
        Ok(()) => Ok(true),
        Err(MappingError::Duplicate { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteTargetStore;
    use crate::test_support::{ready_pool, write_export};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _db: TempDir,
        export: TempDir,
        store: SqliteTargetStore,
        mappings: MappingStore,
        reporter: InvalidFkReporter,
    }

    impl Harness {
        async fn new() -> Self {
            let (db, pool) = ready_pool().await;
            let export = TempDir::new().unwrap();
            let reporter = InvalidFkReporter::new(export.path());
            Self {
                _db: db,
                store: SqliteTargetStore::new(pool.clone()),
                mappings: MappingStore::new(pool),
                reporter,
                export,
            }
        }

        fn ctx(&self) -> ImportContext<'_> {
            ImportContext {
                store: &self.store,
                mappings: &self.mappings,
                reporter: &self.reporter,
                export_dir: self.export.path(),
                batch_size: DEFAULT_BATCH_SIZE,
            }
        }
    }

    #[tokio::test]
    async fn second_run_imports_nothing_new() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "operators.json",
            &json!([
                {"id": "op-1", "code": "PT", "name": "Phuong Trang"},
                {"id": "op-2", "code": "TB", "name": "Thanh Buoi"}
            ]),
        );

        let first = import_entity(&h.ctx(), EntityType::Operators, false).await.unwrap();
        assert_eq!(first.imported, 2);

        let second = import_entity(&h.ctx(), EntityType::Operators, false).await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(h.store.count(EntityType::Operators).await.unwrap(), 2);
        assert_eq!(h.mappings.count(EntityType::Operators).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unresolved_reference_is_reported_once_and_left_null() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "drivers.json",
            &json!([{
                "id": "drv-1",
                "license_number": "B2-0001",
                "full_name": "Tran Van B",
                "operator_id": "op-ghost"
            }]),
        );

        let outcome = import_entity(&h.ctx(), EntityType::Drivers, false).await.unwrap();
        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.invalid_foreign_keys, 1);

        let report = h.reporter.load().unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].record_id, "drv-1");
        assert_eq!(report[0].fk_field, "operator_id");
        assert_eq!(report[0].target_collection, "operators");

        let operator: Option<String> =
            sqlx::query_scalar("SELECT operator_id FROM drivers WHERE legacy_id = 'drv-1'")
                .fetch_one(h.store.pool())
                .await
                .unwrap();
        assert_eq!(operator, None);
    }

    #[tokio::test]
    async fn references_resolve_through_mappings() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "operators.json",
            &json!([{"id": "op-1", "code": "PT", "name": "Phuong Trang"}]),
        );
        write_export(
            h.export.path(),
            "drivers.json",
            &json!([{"id": "drv-1", "licenseNumber": "B2-1", "fullName": "A", "operatorId": "op-1"}]),
        );

        import_entity(&h.ctx(), EntityType::Operators, false).await.unwrap();
        import_entity(&h.ctx(), EntityType::Drivers, false).await.unwrap();

        let operator_id = h.mappings.resolve("op-1", EntityType::Operators).await.unwrap();
        let stored: Option<String> =
            sqlx::query_scalar("SELECT operator_id FROM drivers WHERE legacy_id = 'drv-1'")
                .fetch_one(h.store.pool())
                .await
                .unwrap();
        assert_eq!(stored, operator_id.map(|id| id.to_string()));
        assert!(h.reporter.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn natural_key_duplicate_links_legacy_id_to_survivor() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "operators.json",
            &json!([{"id": "op-app", "code": "PT", "name": "Phuong Trang"}]),
        );
        write_export(
            h.export.path(),
            "datasheet_operators.json",
            &json!([{"id": "op-sheet", "code": " pt ", "name": "Phuong Trang Co"}]),
        );

        let outcome = import_entity(&h.ctx(), EntityType::Operators, false).await.unwrap();
        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.linked_duplicates, 1);
        assert_eq!(
            h.mappings.resolve("op-sheet", EntityType::Operators).await.unwrap(),
            h.mappings.resolve("op-app", EntityType::Operators).await.unwrap()
        );
    }

    #[tokio::test]
    async fn records_without_id_or_required_fields_fail_individually() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "users.json",
            &json!([
                {"username": "nobody"},
                {"id": "u-1"},
                {"id": "u-2", "username": "Dispatcher1"},
                "not an object"
            ]),
        );

        let outcome = import_entity(&h.ctx(), EntityType::Users, false).await.unwrap();
        assert_eq!(outcome.source_records, 4);
        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.skipped(), 3);
    }

    #[tokio::test]
    async fn missing_source_is_an_empty_success() {
        let h = Harness::new().await;
        let outcome = import_entity(&h.ctx(), EntityType::Shifts, false).await.unwrap();
        assert_eq!(outcome, ImportOutcome::default());
    }

    #[tokio::test]
    async fn unparseable_source_is_an_entity_error() {
        let h = Harness::new().await;
        std::fs::write(h.export.path().join("routes.json"), "{{").unwrap();
        let err = import_entity(&h.ctx(), EntityType::Routes, false).await.unwrap_err();
        assert!(matches!(err, ImportError::Source(SourceError::Parse { .. })));
        assert_eq!(h.store.count(EntityType::Routes).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_with_dangling_reference_is_not_reported() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "drivers.json",
            &json!([{"id": "drv-app", "license_number": "B2-0001", "full_name": "Tran Van B"}]),
        );
        write_export(
            h.export.path(),
            "datasheet_drivers.json",
            &json!([{
                "id": "drv-sheet",
                "license_number": "B2-0001",
                "full_name": "Tran Van B",
                "operator_id": "op-ghost"
            }]),
        );

        let outcome = import_entity(&h.ctx(), EntityType::Drivers, false).await.unwrap();
        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.invalid_foreign_keys, 0);
        assert!(h.reporter.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn absurd_timestamp_falls_back_instead_of_aborting() {
        let h = Harness::new().await;
        write_export(
            h.export.path(),
            "shifts.json",
            &json!([{"id": "s1", "name": "Ca 1", "created_at": -1e30}]),
        );

        let outcome = import_entity(&h.ctx(), EntityType::Shifts, false).await.unwrap();
        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.failed, 0);
    }
}
