use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::import::{DEFAULT_BATCH_SIZE, DEFAULT_TOLERANCE};

pub const ENV_DB: &str = "TRANSIT_MIGRATE_DB";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_EXPORT_ROOT: &str = "TRANSIT_MIGRATE_EXPORT_ROOT";
pub const ENV_LOG: &str = "TRANSIT_MIGRATE_LOG";
pub const DEFAULT_LOG_FILTER: &str = "transit_migrate=info,sqlx=warn";
pub const DEFAULT_EXPORT_ROOT: &str = "exports";
pub const MAX_BATCH_SIZE: usize = 1000;

/// Values supplied on the command line, before environment fallbacks.
#[derive(Debug, Clone, Default)]
pub struct ConfigInput {
    pub db: Option<String>,
    pub export_root: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub tolerance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrateConfig {
    pub database_url: String,
    pub export_root: PathBuf,
    pub batch_size: usize,
    pub tolerance: f64,
}

/// Result of reading `.env`, kept until logging is installed.
#[derive(Debug)]
pub enum DotenvOutcome {
    Loaded(PathBuf),
    NotFound,
    Unreadable(dotenvy::Error),
}

impl DotenvOutcome {
    pub fn log(&self) {
        match self {
            DotenvOutcome::Loaded(path) => {
                debug!(target: "transit_migrate", event = "dotenv_loaded", path = %path.display())
            }
            DotenvOutcome::NotFound => {}
            DotenvOutcome::Unreadable(err) => {
                warn!(target: "transit_migrate", event = "dotenv_unreadable", error = %err)
            }
        }
    }
}

/// Load `.env` from the working directory if present. Variables already set
/// in the process environment win. Runs before logging so `.env` can carry
/// the log filter; call [`DotenvOutcome::log`] once the subscriber exists.
pub fn load_dotenv() -> DotenvOutcome {
    match dotenvy::dotenv() {
        Ok(path) => DotenvOutcome::Loaded(path),
        Err(err) if err.not_found() => DotenvOutcome::NotFound,
        Err(err) => DotenvOutcome::Unreadable(err),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl MigrateConfig {
    /// Resolve against the process environment.
    pub fn from_env(input: ConfigInput) -> AppResult<Self> {
        Self::resolve(input, |key| std::env::var(key).ok())
    }

    /// `--db` beats `TRANSIT_MIGRATE_DB`, which beats `DATABASE_URL`.
    pub fn resolve(input: ConfigInput, env: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let database_url = non_empty(input.db)
            .or_else(|| non_empty(env(ENV_DB)))
            .or_else(|| non_empty(env(ENV_DATABASE_URL)))
            .ok_or_else(|| {
                AppError::new(
                    AppError::DB_NOT_CONFIGURED,
                    "no target database configured",
                )
                .with_context("hint", format!("pass --db or set {ENV_DB}"))
            })?;

        let export_root = input
            .export_root
            .or_else(|| non_empty(env(ENV_EXPORT_ROOT)).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_ROOT));

        let batch_size = input.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(AppError::new(
                AppError::INVALID_CONFIG,
                format!("batch size must be between 1 and {MAX_BATCH_SIZE}"),
            )
            .with_context("batch_size", batch_size.to_string()));
        }

        let tolerance = input.tolerance.unwrap_or(DEFAULT_TOLERANCE);
        if !tolerance.is_finite() || !(0.0..=1.0).contains(&tolerance) {
            return Err(AppError::new(
                AppError::INVALID_CONFIG,
                "tolerance must be a fraction between 0 and 1",
            )
            .with_context("tolerance", tolerance.to_string()));
        }

        Ok(Self {
            database_url,
            export_root,
            batch_size,
            tolerance,
        })
    }
}

/// `<root>/<YYYY-MM-DD>`, where the exporter writes each day's snapshot.
pub fn default_export_dir(root: &Path, today: NaiveDate) -> PathBuf {
    root.join(today.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn flag_beats_environment() {
        let input = ConfigInput {
            db: Some("flag.sqlite3".into()),
            ..ConfigInput::default()
        };
        let config = MigrateConfig::resolve(
            input,
            env(&[(ENV_DB, "env.sqlite3"), (ENV_DATABASE_URL, "url.sqlite3")]),
        )
        .unwrap();
        assert_eq!(config.database_url, "flag.sqlite3");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.export_root, PathBuf::from(DEFAULT_EXPORT_ROOT));
    }

    #[test]
    fn database_url_is_last_fallback() {
        let config = MigrateConfig::resolve(
            ConfigInput::default(),
            env(&[(ENV_DB, "  "), (ENV_DATABASE_URL, "sqlite://target.db")]),
        )
        .unwrap();
        assert_eq!(config.database_url, "sqlite://target.db");
    }

    #[test]
    fn missing_database_is_not_configured() {
        let err = MigrateConfig::resolve(ConfigInput::default(), env(&[])).unwrap_err();
        assert_eq!(err.code(), AppError::DB_NOT_CONFIGURED);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let base = ConfigInput {
            db: Some("x.sqlite3".into()),
            ..ConfigInput::default()
        };
        let zero = ConfigInput {
            batch_size: Some(0),
            ..base.clone()
        };
        assert_eq!(
            MigrateConfig::resolve(zero, env(&[])).unwrap_err().code(),
            AppError::INVALID_CONFIG
        );
        let loose = ConfigInput {
            tolerance: Some(1.5),
            ..base
        };
        assert_eq!(
            MigrateConfig::resolve(loose, env(&[])).unwrap_err().code(),
            AppError::INVALID_CONFIG
        );
    }

    #[test]
    fn export_dir_is_dated() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            default_export_dir(Path::new("exports"), day),
            PathBuf::from("exports/2024-03-09")
        );
    }
}
