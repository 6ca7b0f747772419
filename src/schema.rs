//! Dev-only bootstrap of the reference target schema into an empty SQLite
//! file. Real targets are provisioned out of band.

use anyhow::Context;
use sha2::{Digest, Sha256};
use sqlx::{Executor, SqlitePool};
use tracing::{error, info};

static SCHEMA_FILES: &[(&str, &str)] = &[(
    "0001_transit_schema.sql",
    include_str!("../migrations/0001_transit_schema.sql"),
)];

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    match trimmed.char_indices().nth(120) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply every schema file not yet recorded in `schema_migrations`.
/// Returns the number of files applied.
pub async fn bootstrap_schema(pool: &SqlitePool) -> anyhow::Result<usize> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version    TEXT PRIMARY KEY,\
           applied_at TEXT NOT NULL,\
           checksum   TEXT NOT NULL\
         )",
    )
    .await
    .context("create schema_migrations")?;

    let mut applied_files = 0;
    for (filename, raw_sql) in SCHEMA_FILES {
        let cleaned = strip_comments(raw_sql);
        let checksum = format!("{:x}", Sha256::digest(cleaned.as_bytes()));

        let stored: Option<String> =
            sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE version = ?1")
                .bind(*filename)
                .fetch_optional(pool)
                .await?;
        if let Some(stored) = stored {
            if stored != checksum {
                anyhow::bail!("schema file {} edited after application", filename);
            }
            info!(target: "transit_migrate", event = "schema_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "transit_migrate", event = "schema_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }
        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)",
        )
        .bind(*filename)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(target: "transit_migrate", event = "schema_file_applied", file = %filename);
        applied_files += 1;
    }

    Ok(applied_files)
}
