//! Target store interface and the SQLite implementation used by the CLI.
//!
//! The importers only ever talk to [`TargetStore`]; identifiers that reach a
//! SQL string come either from [`EntityType::table`] (allow-listed by
//! construction) or are checked against [`is_safe_column`].

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::{EntityType, MAPPING_TABLE};

/// Target-shaped column values of one row, keyed by column name.
pub type Record = Map<String, Value>;

static COLUMN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("column name regex"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}: {message}")]
    UniqueViolation { table: String, message: String },
    #[error("database error on {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("column name {column:?} rejected for table {table}")]
    InvalidColumn { table: String, column: String },
    #[error("stored id {value:?} in {table} is not a uuid")]
    InvalidId { table: String, value: String },
    #[error("target schema is missing tables: {}", .0.join(", "))]
    NotInitialized(Vec<String>),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }

    pub(crate) fn from_sqlx(table: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::UniqueViolation {
                    table: table.to_string(),
                    message: db.message().to_string(),
                };
            }
        }
        StoreError::Database {
            table: table.to_string(),
            source: err,
        }
    }
}

/// Generic relational sink the importers write through.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Fails with [`StoreError::NotInitialized`] when any target table is absent.
    async fn ensure_ready(&self) -> Result<(), StoreError>;

    /// Insert one row and return its generated primary key.
    async fn insert(&self, entity: EntityType, record: &Record) -> Result<Uuid, StoreError>;

    /// Insert all rows in one statement. Either every row is written and the
    /// ids come back in input order, or none is.
    async fn insert_many(
        &self,
        entity: EntityType,
        records: &[Record],
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Overwrite the given columns of one row. Returns whether the row exists.
    async fn update(
        &self,
        entity: EntityType,
        id: Uuid,
        changes: &Record,
    ) -> Result<bool, StoreError>;

    /// Primary key of the row whose `column` equals `value`.
    async fn find_id(
        &self,
        entity: EntityType,
        column: &str,
        value: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Every non-null value of `column`, mapped to its row id.
    async fn column_index(
        &self,
        entity: EntityType,
        column: &str,
    ) -> Result<HashMap<String, Uuid>, StoreError>;

    async fn count(&self, entity: EntityType) -> Result<i64, StoreError>;

    /// Delete every row of each table in the order given, then every id
    /// mapping, in one transaction. Returns rows deleted per table.
    async fn clear_tables(
        &self,
        order: &[EntityType],
    ) -> Result<Vec<(&'static str, u64)>, StoreError>;
}

pub fn is_safe_column(column: &str) -> bool {
    COLUMN_NAME.is_match(column)
}

fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn checked_column(entity: EntityType, column: &str) -> Result<String, StoreError> {
    if is_safe_column(column) {
        Ok(quote_ident(column))
    } else {
        Err(StoreError::InvalidColumn {
            table: entity.table().to_string(),
            column: column.to_string(),
        })
    }
}

fn parse_id(entity: EntityType, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::InvalidId {
        table: entity.table().to_string(),
        value: raw.to_string(),
    })
}

/// Bind a JSON value as the closest SQLite storage class. Nested arrays and
/// objects are stored as their JSON text.
fn push_json_bind(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push_bind(Option::<String>::None);
        }
        Value::Bool(b) => {
            builder.push_bind(i64::from(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                builder.push_bind(i);
            } else {
                builder.push_bind(n.as_f64());
            }
        }
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        other => {
            builder.push_bind(other.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTargetStore {
    pool: SqlitePool,
}

impl SqliteTargetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn column_list(
        entity: EntityType,
        records: &[Record],
    ) -> Result<Vec<String>, StoreError> {
        let names: BTreeSet<&str> = records
            .iter()
            .flat_map(|record| record.keys().map(String::as_str))
            .filter(|name| *name != "id")
            .collect();
        names
            .into_iter()
            .map(|name| {
                checked_column(entity, name)?;
                Ok(name.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl TargetStore for SqliteTargetStore {
    async fn ensure_ready(&self) -> Result<(), StoreError> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&self.pool)
                .await
                .map_err(|err| StoreError::from_sqlx("sqlite_master", err))?;

        let missing: Vec<String> = EntityType::ALL
            .iter()
            .map(|entity| entity.table())
            .chain(std::iter::once(MAPPING_TABLE))
            .filter(|table| !existing.iter().any(|name| name == table))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized(missing))
        }
    }

    async fn insert(&self, entity: EntityType, record: &Record) -> Result<Uuid, StoreError> {
        let ids = self.insert_many(entity, std::slice::from_ref(record)).await?;
        ids.into_iter().next().ok_or_else(|| StoreError::Database {
            table: entity.table().to_string(),
            source: sqlx::Error::RowNotFound,
        })
    }

    async fn insert_many(
        &self,
        entity: EntityType,
        records: &[Record],
    ) -> Result<Vec<Uuid>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let columns = Self::column_list(entity, records)?;
        let ids: Vec<Uuid> = records.iter().map(|_| Uuid::now_v7()).collect();

        let mut builder = QueryBuilder::<Sqlite>::new("INSERT INTO ");
        builder.push(quote_ident(entity.table()));
        builder.push(" (\"id\"");
        for column in &columns {
            builder.push(", ");
            builder.push(quote_ident(column));
        }
        builder.push(") VALUES ");

        for (index, (record, id)) in records.iter().zip(&ids).enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.push("(");
            builder.push_bind(id.to_string());
            for column in &columns {
                builder.push(", ");
                push_json_bind(&mut builder, record.get(column).unwrap_or(&Value::Null));
            }
            builder.push(")");
        }

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx(entity.table(), err))?;

        Ok(ids)
    }

    async fn update(
        &self,
        entity: EntityType,
        id: Uuid,
        changes: &Record,
    ) -> Result<bool, StoreError> {
        if changes.is_empty() {
            return Ok(false);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE ");
        builder.push(quote_ident(entity.table()));
        builder.push(" SET ");
        for (index, (column, value)) in changes.iter().filter(|(c, _)| *c != "id").enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.push(checked_column(entity, column)?);
            builder.push(" = ");
            push_json_bind(&mut builder, value);
        }
        builder.push(" WHERE \"id\" = ");
        builder.push_bind(id.to_string());

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx(entity.table(), err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_id(
        &self,
        entity: EntityType,
        column: &str,
        value: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let sql = format!(
            "SELECT \"id\" FROM {} WHERE {} = ?1 LIMIT 1",
            quote_ident(entity.table()),
            checked_column(entity, column)?
        );
        let found: Option<String> = sqlx::query_scalar(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx(entity.table(), err))?;
        found.map(|raw| parse_id(entity, &raw)).transpose()
    }

    async fn column_index(
        &self,
        entity: EntityType,
        column: &str,
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        let sql = format!(
            "SELECT CAST({col} AS TEXT), \"id\" FROM {table} WHERE {col} IS NOT NULL",
            col = checked_column(entity, column)?,
            table = quote_ident(entity.table())
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx(entity.table(), err))?;

        rows.into_iter()
            .map(|(key, raw_id)| Ok((key, parse_id(entity, &raw_id)?)))
            .collect()
    }

    async fn count(&self, entity: EntityType) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(entity.table()));
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| StoreError::from_sqlx(entity.table(), err))
    }

    async fn clear_tables(
        &self,
        order: &[EntityType],
    ) -> Result<Vec<(&'static str, u64)>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::from_sqlx("transaction", err))?;

        let tables = order
            .iter()
            .map(|entity| entity.table())
            .chain(std::iter::once(MAPPING_TABLE));
        let mut cleared = Vec::with_capacity(order.len() + 1);
        for table in tables {
            let sql = format!("DELETE FROM {}", quote_ident(table));
            let result = sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::from_sqlx(table, err))?;
            cleared.push((table, result.rows_affected()));
        }

        tx.commit()
            .await
            .map_err(|err| StoreError::from_sqlx("transaction", err))?;
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ready_pool;
    use serde_json::json;

    fn operator(code: &str, name: &str) -> Record {
        let mut record = Record::new();
        record.insert("code".into(), json!(code));
        record.insert("name".into(), json!(name));
        record.insert("is_active".into(), json!(true));
        record.insert("legacy_id".into(), json!(format!("legacy-{code}")));
        record
    }

    #[tokio::test]
    async fn insert_many_returns_ids_in_input_order() {
        let (_dir, pool) = ready_pool().await;
        let store = SqliteTargetStore::new(pool.clone());
        let ids = store
            .insert_many(
                EntityType::Operators,
                &[operator("OP1", "First"), operator("OP2", "Second")],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let first = store
            .find_id(EntityType::Operators, "code", "OP1")
            .await
            .unwrap();
        assert_eq!(first, Some(ids[0]));
        let active: i64 = sqlx::query_scalar("SELECT is_active FROM operators WHERE code = 'OP2'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn failing_row_rejects_the_whole_group() {
        let (_dir, pool) = ready_pool().await;
        let store = SqliteTargetStore::new(pool);
        let mut broken = operator("OP3", "Broken");
        broken.insert("name".into(), Value::Null);

        let err = store
            .insert_many(EntityType::Operators, &[operator("OP2", "Fine"), broken])
            .await
            .unwrap_err();
        assert!(!err.is_unique_violation());
        assert_eq!(store.count(EntityType::Operators).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_natural_key_is_classified_as_unique_violation() {
        let (_dir, pool) = ready_pool().await;
        let store = SqliteTargetStore::new(pool);
        store
            .insert(EntityType::Operators, &operator("OP1", "First"))
            .await
            .unwrap();
        let err = store
            .insert(EntityType::Operators, &operator("OP1", "Again"))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn update_and_column_index() {
        let (_dir, pool) = ready_pool().await;
        let store = SqliteTargetStore::new(pool);
        let id = store
            .insert(EntityType::Operators, &operator("OP9", "Nine"))
            .await
            .unwrap();

        let mut changes = Record::new();
        changes.insert("name".into(), json!("Renamed"));
        assert!(store.update(EntityType::Operators, id, &changes).await.unwrap());
        assert!(!store
            .update(EntityType::Operators, Uuid::now_v7(), &changes)
            .await
            .unwrap());

        let index = store
            .column_index(EntityType::Operators, "legacy_id")
            .await
            .unwrap();
        assert_eq!(index.get("legacy-OP9"), Some(&id));
    }

    #[tokio::test]
    async fn unsafe_column_names_never_reach_sql() {
        let (_dir, pool) = ready_pool().await;
        let store = SqliteTargetStore::new(pool);
        let err = store
            .find_id(EntityType::Vehicles, "plate_number = '' OR 1=1 --", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidColumn { .. }));
    }

    #[tokio::test]
    async fn ensure_ready_lists_missing_tables() {
        let (_dir, pool) = crate::test_support::empty_pool().await;
        let store = SqliteTargetStore::new(pool);
        match store.ensure_ready().await.unwrap_err() {
            StoreError::NotInitialized(missing) => {
                assert!(missing.contains(&"operators".to_string()));
                assert!(missing.contains(&MAPPING_TABLE.to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
