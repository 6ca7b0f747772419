//! Grouped-insert strategy for the large entities.
//!
//! Lookups are preloaded once per entity; records already present by legacy
//! id or natural key are dropped in memory, the rest go out in groups of
//! `batch_size`. A rejected group is replayed one record at a time.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use super::execute::{
    insert_unit, prepare_unit, report_unresolved, ImportContext, ImportError, ImportOutcome,
};
use super::rows::ImportUnit;
use super::source::SourceSet;
use crate::entity::EntityType;
use crate::mapping::MappingRecord;
use crate::progress::ProgressLog;
use crate::store::Record;

/// Run-scoped copy of the mappings of every referenced entity.
#[derive(Debug, Default)]
struct MappingCache {
    by_entity: HashMap<EntityType, HashMap<String, Uuid>>,
}

impl MappingCache {
    async fn load(ctx: &ImportContext<'_>, targets: BTreeSet<EntityType>) -> Result<Self, ImportError> {
        let mut by_entity = HashMap::new();
        for target in targets {
            by_entity.insert(target, ctx.mappings.preload_all(target).await?);
        }
        Ok(Self { by_entity })
    }

    fn resolve(&self, target: EntityType, legacy_id: &str) -> Option<Uuid> {
        self.by_entity.get(&target)?.get(legacy_id).copied()
    }
}

/// What the in-memory filter decided for one unit.
enum Admission {
    Insert(ImportUnit),
    /// Already stored under another legacy id; map onto that row.
    Alias(MappingRecord),
    /// Shares a natural key with a unit admitted earlier in this run. Mapped
    /// onto that unit's row, or inserted itself if that unit fails.
    Deferred(ImportUnit),
    Duplicate,
}

struct Filter {
    mapped: HashMap<String, Uuid>,
    rows_by_legacy: HashMap<String, Uuid>,
    rows_by_key: HashMap<String, Uuid>,
    seen_legacy: HashSet<String>,
    seen_keys: HashSet<String>,
}

impl Filter {
    async fn load(ctx: &ImportContext<'_>, entity: EntityType) -> Result<Self, ImportError> {
        let mapped = ctx.mappings.preload_all(entity).await?;
        let rows_by_legacy = ctx.store.column_index(entity, "legacy_id").await?;
        let rows_by_key = match entity.natural_key_column() {
            Some(column) => ctx.store.column_index(entity, column).await?,
            None => HashMap::new(),
        };
        Ok(Self {
            mapped,
            rows_by_legacy,
            rows_by_key,
            seen_legacy: HashSet::new(),
            seen_keys: HashSet::new(),
        })
    }

    fn already_mapped(&self, legacy_id: &str) -> bool {
        self.mapped.contains_key(legacy_id) || self.seen_legacy.contains(legacy_id)
    }

    fn admit(&mut self, unit: ImportUnit) -> Admission {
        if self.already_mapped(&unit.legacy_id) {
            return Admission::Duplicate;
        }
        self.seen_legacy.insert(unit.legacy_id.clone());

        if let Some(existing) = self.rows_by_legacy.get(&unit.legacy_id) {
            return Admission::Alias(MappingRecord::new(unit.legacy_id, *existing));
        }
        if let Some(key) = unit.natural_key.clone() {
            if let Some(existing) = self.rows_by_key.get(&key) {
                return Admission::Alias(MappingRecord::new(unit.legacy_id, *existing));
            }
            if !self.seen_keys.insert(key) {
                return Admission::Deferred(unit);
            }
        }
        Admission::Insert(unit)
    }
}

pub(super) async fn import_batched(
    ctx: &ImportContext<'_>,
    entity: EntityType,
    source: &SourceSet,
) -> Result<ImportOutcome, ImportError> {
    let started = Instant::now();
    let mut outcome = ImportOutcome::for_source(source);
    let mut filter = Filter::load(ctx, entity).await?;

    let mut pending: Vec<ImportUnit> = Vec::new();
    let mut aliases: Vec<MappingRecord> = Vec::new();
    let mut deferred: Vec<ImportUnit> = Vec::new();

    for raw in &source.records {
        if raw.legacy_id().is_some_and(|id| filter.already_mapped(&id)) {
            outcome.duplicates += 1;
            continue;
        }
        let Some(unit) = prepare_unit(entity, raw, &mut outcome) else {
            continue;
        };
        match filter.admit(unit) {
            Admission::Insert(unit) => pending.push(unit),
            Admission::Alias(pair) => {
                outcome.duplicates += 1;
                aliases.push(pair);
            }
            Admission::Deferred(unit) => deferred.push(unit),
            Admission::Duplicate => outcome.duplicates += 1,
        }
    }

    let targets: BTreeSet<EntityType> = pending
        .iter()
        .chain(&deferred)
        .flat_map(|unit| unit.foreign_keys.iter().map(|fk| fk.target))
        .collect();
    let cache = MappingCache::load(ctx, targets).await?;
    for unit in &mut pending {
        for fk in unit.foreign_keys.clone() {
            unit.set_foreign_key(&fk, cache.resolve(fk.target, &fk.legacy_value));
        }
        outcome.truncated_fields += u64::from(unit.truncated);
    }

    let batch_size = ctx.batch_size.max(1);
    let mut progress = ProgressLog::new(entity, pending.len());
    let mut inserted_keys: HashMap<String, Uuid> = HashMap::new();

    for chunk in pending.chunks(batch_size) {
        let records: Vec<Record> = chunk.iter().map(|unit| unit.fields.clone()).collect();
        match ctx.store.insert_many(entity, &records).await {
            Ok(ids) => {
                let pairs: Vec<MappingRecord> = chunk
                    .iter()
                    .zip(&ids)
                    .map(|(unit, id)| MappingRecord::new(unit.legacy_id.clone(), *id))
                    .collect();
                ctx.mappings.record_many(entity, &pairs).await?;
                outcome.imported += ids.len() as u64;
                for (unit, id) in chunk.iter().zip(ids) {
                    report_unresolved(ctx.reporter, unit, &mut outcome)?;
                    if let Some(key) = &unit.natural_key {
                        inserted_keys.insert(key.clone(), id);
                    }
                }
            }
            Err(err) => {
                warn!(
                    target: "transit_migrate",
                    event = "batch_insert_fallback",
                    entity = %entity,
                    batch = chunk.len(),
                    error = %err
                );
                for unit in chunk {
                    if let Some(id) = insert_unit(ctx, unit, &mut outcome).await? {
                        if let Some(key) = &unit.natural_key {
                            inserted_keys.insert(key.clone(), id);
                        }
                    }
                }
            }
        }
        progress.advance(chunk.len());
    }

    for mut unit in deferred {
        let Some(key) = unit.natural_key.clone() else {
            continue;
        };
        if let Some(id) = inserted_keys.get(&key) {
            outcome.duplicates += 1;
            aliases.push(MappingRecord::new(unit.legacy_id, *id));
            continue;
        }
        // The unit holding this key was not stored; this one takes its place.
        for fk in unit.foreign_keys.clone() {
            unit.set_foreign_key(&fk, cache.resolve(fk.target, &fk.legacy_value));
        }
        outcome.truncated_fields += u64::from(unit.truncated);
        if let Some(id) = insert_unit(ctx, &unit, &mut outcome).await? {
            inserted_keys.insert(key, id);
        }
    }
    if !aliases.is_empty() {
        outcome.linked_duplicates += ctx.mappings.record_many(entity, &aliases).await? as u64;
    }

    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        outcome.imported as f64 / elapsed
    } else {
        outcome.imported as f64
    };
    info!(
        target: "transit_migrate",
        event = "batch_import_done",
        entity = %entity,
        imported = outcome.imported,
        duplicates = outcome.duplicates,
        failed = outcome.failed,
        batch_size,
        records_per_sec = format!("{rate:.0}")
    );

    Ok(outcome)
}
