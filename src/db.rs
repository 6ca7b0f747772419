use std::str::FromStr;

use anyhow::{Context, Result as AnyResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite};

/// The migration issues calls serially; the pool only needs headroom for
/// the occasional overlapping acquire.
pub const MAX_CONNECTIONS: u32 = 4;

/// Open the target store. `create` is only set by the schema bootstrap;
/// every other command requires the database to exist already.
pub async fn open_target_pool(url: &str, create: bool) -> AnyResult<Pool<Sqlite>> {
    let url = if url.starts_with("sqlite:") {
        url.to_string()
    } else {
        format!("sqlite://{url}")
    };
    let opts = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("parse database url {url}"))?
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .with_context(|| format!("open target database {url}"))?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "transit_migrate",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if fks.0 != 1 {
        warn!(
            target: "transit_migrate",
            event = "db_open_warning",
            msg = "foreign_keys pragma is off; constraint violations will not be detected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_database_is_not_created_without_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.sqlite3");
        let err = open_target_pool(path.to_str().unwrap(), false).await;
        assert!(err.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn opened_pool_enforces_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.sqlite3");
        let pool = open_target_pool(path.to_str().unwrap(), true).await.unwrap();
        let fks: i64 = sqlx::query_scalar("PRAGMA foreign_keys;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fks, 1);
    }
}
