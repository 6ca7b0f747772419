//! Persistent legacy id to target id translation.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entity::EntityType;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("{entity_type} `{legacy_id}` is already mapped")]
    Duplicate {
        legacy_id: String,
        entity_type: EntityType,
    },
    #[error("mapping table error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("mapped target id {0:?} is not a uuid")]
    InvalidTargetId(String),
}

/// One `(legacy id, target id)` pair waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub legacy_id: String,
    pub target_id: Uuid,
}

impl MappingRecord {
    pub fn new(legacy_id: impl Into<String>, target_id: Uuid) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            target_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MappingStore {
    pool: SqlitePool,
}

fn parse_target(raw: String) -> Result<Uuid, MappingError> {
    Uuid::parse_str(&raw).map_err(|_| MappingError::InvalidTargetId(raw))
}

impl MappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn resolve(
        &self,
        legacy_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<Uuid>, MappingError> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT target_id FROM id_mappings WHERE legacy_id = ?1 AND entity_type = ?2",
        )
        .bind(legacy_id)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        found.map(parse_target).transpose()
    }

    /// Write one mapping. An existing `(legacy_id, entity_type)` pair is
    /// reported as [`MappingError::Duplicate`] and left untouched.
    pub async fn record(
        &self,
        legacy_id: &str,
        target_id: Uuid,
        entity_type: EntityType,
    ) -> Result<(), MappingError> {
        let result = sqlx::query(
            "INSERT INTO id_mappings (legacy_id, entity_type, target_id, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(legacy_id)
        .bind(entity_type.as_str())
        .bind(target_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(MappingError::Duplicate {
                    legacy_id: legacy_id.to_string(),
                    entity_type,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write a batch of mappings in one statement. When the grouped write is
    /// rejected every pair is retried alone and duplicates are skipped.
    /// Returns how many mappings were written.
    pub async fn record_many(
        &self,
        entity_type: EntityType,
        pairs: &[MappingRecord],
    ) -> Result<usize, MappingError> {
        if pairs.is_empty() {
            return Ok(0);
        }

        let created_at = Utc::now().to_rfc3339();
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO id_mappings (legacy_id, entity_type, target_id, created_at) ",
        );
        builder.push_values(pairs, |mut row, pair| {
            row.push_bind(pair.legacy_id.clone())
                .push_bind(entity_type.as_str())
                .push_bind(pair.target_id.to_string())
                .push_bind(created_at.clone());
        });

        match builder.build().execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected() as usize),
            Err(err) => {
                debug!(
                    target: "transit_migrate",
                    event = "mapping_batch_fallback",
                    entity = %entity_type,
                    pairs = pairs.len(),
                    error = %err
                );
                let mut written = 0;
                for pair in pairs {
                    match self.record(&pair.legacy_id, pair.target_id, entity_type).await {
                        Ok(()) => written += 1,
                        Err(MappingError::Duplicate { .. }) => {
                            warn!(
                                target: "transit_migrate",
                                event = "mapping_duplicate_skipped",
                                entity = %entity_type,
                                legacy_id = %pair.legacy_id
                            );
                        }
                        Err(other) => return Err(other),
                    }
                }
                Ok(written)
            }
        }
    }

    /// Every mapping of one entity type, for run-scoped caches.
    pub async fn preload_all(
        &self,
        entity_type: EntityType,
    ) -> Result<HashMap<String, Uuid>, MappingError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT legacy_id, target_id FROM id_mappings WHERE entity_type = ?1",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(legacy, target)| Ok((legacy, parse_target(target)?)))
            .collect()
    }

    pub async fn count(&self, entity_type: EntityType) -> Result<i64, MappingError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM id_mappings WHERE entity_type = ?1")
            .bind(entity_type.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
