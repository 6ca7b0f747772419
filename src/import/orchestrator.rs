use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::execute::{import_entity, ImportContext};
use super::table_order::import_levels;
use crate::entity::{EntityType, ImportStrategy};
use crate::error::{AppError, AppResult, EXIT_OK, EXIT_PARTIAL_FAILURE};
use crate::store::StoreError;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Import a single entity instead of all of them.
    pub only: Option<EntityType>,
    /// Use the per-record strategy for every entity.
    pub force_per_record: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityImportResult {
    pub table: EntityType,
    pub level: u8,
    pub strategy: ImportStrategy,
    pub imported: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub invalid_foreign_keys: u64,
    pub truncated_fields: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<EntityImportResult>,
    pub total_imported: u64,
    pub total_skipped: u64,
    pub failed_entities: usize,
    pub invalid_foreign_keys: u64,
    /// The run stopped early on an interrupt.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed_entities == 0 && !self.interrupted {
            EXIT_OK
        } else {
            EXIT_PARTIAL_FAILURE
        }
    }
}

fn not_initialized(err: StoreError) -> AppError {
    let app = AppError::new(
        AppError::DB_NOT_INITIALIZED,
        "target database is missing required tables",
    );
    match err {
        StoreError::NotInitialized(missing) => app.with_context("missing", missing.join(",")),
        other => app.with_cause(AppError::new(AppError::UNKNOWN_CODE, other.to_string())),
    }
}

/// Run every importer level by level. Only an unusable target store is
/// fatal; entity failures are recorded and the run moves on. `cancel` is
/// checked between entities.
pub async fn run_migration(
    ctx: &ImportContext<'_>,
    options: &RunOptions,
    cancel: &AtomicBool,
) -> AppResult<RunSummary> {
    ctx.store.ensure_ready().await.map_err(not_initialized)?;

    let started_at = Utc::now();
    let mut results = Vec::new();
    let mut interrupted = false;

    'levels: for (level, entities) in import_levels() {
        let entities: Vec<EntityType> = entities
            .into_iter()
            .filter(|entity| options.only.map_or(true, |only| only == *entity))
            .collect();
        if entities.is_empty() {
            continue;
        }
        info!(
            target: "transit_migrate",
            event = "level_start",
            level,
            entities = ?entities
        );

        for entity in entities {
            if cancel.load(Ordering::SeqCst) {
                warn!(target: "transit_migrate", event = "run_interrupted", next_entity = %entity);
                interrupted = true;
                break 'levels;
            }
            results.push(run_entity(ctx, entity, level, options.force_per_record).await);
        }
    }

    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        total_imported: results.iter().map(|r| r.imported).sum(),
        total_skipped: results.iter().map(|r| r.skipped).sum(),
        failed_entities: results.iter().filter(|r| !r.success).count(),
        invalid_foreign_keys: results.iter().map(|r| r.invalid_foreign_keys).sum(),
        results,
        interrupted,
    };
    info!(
        target: "transit_migrate",
        event = "run_done",
        imported = summary.total_imported,
        skipped = summary.total_skipped,
        failed_entities = summary.failed_entities,
        invalid_foreign_keys = summary.invalid_foreign_keys,
        interrupted = summary.interrupted
    );
    Ok(summary)
}

async fn run_entity(
    ctx: &ImportContext<'_>,
    entity: EntityType,
    level: u8,
    force_per_record: bool,
) -> EntityImportResult {
    let started = Instant::now();
    let strategy = if force_per_record {
        ImportStrategy::PerRecord
    } else {
        entity.strategy()
    };
    let outcome = import_entity(ctx, entity, force_per_record).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(outcome) => {
            info!(
                target: "transit_migrate",
                event = "entity_done",
                entity = %entity,
                imported = outcome.imported,
                duplicates = outcome.duplicates,
                failed = outcome.failed,
                duration_ms
            );
            EntityImportResult {
                table: entity,
                level,
                strategy,
                imported: outcome.imported,
                skipped: outcome.skipped(),
                duplicates: outcome.duplicates,
                failed: outcome.failed,
                invalid_foreign_keys: outcome.invalid_foreign_keys,
                truncated_fields: outcome.truncated_fields,
                success: true,
                error: None,
                duration_ms,
            }
        }
        Err(err) => {
            error!(
                target: "transit_migrate",
                event = "entity_failed",
                entity = %entity,
                error = %err
            );
            EntityImportResult {
                table: entity,
                level,
                strategy,
                imported: 0,
                skipped: 0,
                duplicates: 0,
                failed: 0,
                invalid_foreign_keys: 0,
                truncated_fields: 0,
                success: false,
                error: Some(err.to_string()),
                duration_ms,
            }
        }
    }
}
