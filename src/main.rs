use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::SqlitePool;

use transit_migrate::config::{default_export_dir, load_dotenv, ConfigInput, MigrateConfig};
use transit_migrate::db::open_target_pool;
use transit_migrate::error::{EXIT_FATAL, EXIT_OK, EXIT_PARTIAL_FAILURE};
use transit_migrate::fk_report::InvalidFkReporter;
use transit_migrate::import::{
    render_summary_table, render_validation_table, run_migration, validate_export,
    write_run_report, ImportContext, RunOptions,
};
use transit_migrate::rollback::{render_plan, render_report, rollback};
use transit_migrate::{
    logging, schema, AppError, AppResult, EntityType, MappingStore, SqliteTargetStore,
    TargetStore,
};

#[derive(Debug, Parser)]
#[command(
    name = "transit-migrate",
    about = "Migrate the legacy bus-station export into the relational schema",
    version
)]
struct Cli {
    /// Target database URL or SQLite file path.
    #[arg(long, global = true)]
    db: Option<String>,
    /// Records per grouped insert for batched entities.
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    /// Accepted relative difference between source and target counts.
    #[arg(long, global = true)]
    tolerance: Option<f64>,
    /// Directory holding one dated export directory per day.
    #[arg(long, global = true)]
    export_root: Option<PathBuf>,
    /// Also write JSON logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import every entity from an export directory.
    Run {
        export_dir: PathBuf,
        /// Import only this entity (table name).
        #[arg(long)]
        only: Option<EntityType>,
        /// Disable grouped inserts and import every entity record by record.
        #[arg(long)]
        per_record: bool,
    },
    /// Compare source, target and mapping counts per entity.
    Validate {
        /// Defaults to today's directory under the export root.
        export_dir: Option<PathBuf>,
        /// Emit the rows as JSON instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Delete all imported rows and id mappings.
    Rollback {
        /// Actually delete; without it only the plan is printed.
        #[arg(long)]
        confirm: bool,
    },
    /// Create the reference schema in a new SQLite file (development only).
    BootstrapSchema,
}

impl Cli {
    fn config_input(&self) -> ConfigInput {
        ConfigInput {
            db: self.db.clone(),
            export_root: self.export_root.clone(),
            batch_size: self.batch_size,
            tolerance: self.tolerance,
        }
    }
}

#[tokio::main]
async fn main() {
    let dotenv = load_dotenv();
    let cli = Cli::parse();

    let guard = match logging::init(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(EXIT_FATAL);
        }
    };
    dotenv.log();

    let code = match handle_cli(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(target: "transit_migrate", event = "fatal", code = %err.code(), error = %err);
            eprintln!("Error: {err}");
            err.exit_code()
        }
    };

    drop(guard);
    process::exit(code);
}

async fn handle_cli(cli: Cli) -> AppResult<i32> {
    let input = cli.config_input();
    match cli.command {
        Command::Run {
            export_dir,
            only,
            per_record,
        } => {
            let config = MigrateConfig::from_env(input)?;
            let options = RunOptions {
                only,
                force_per_record: per_record,
            };
            handle_run(&config, export_dir, options).await
        }
        Command::Validate { export_dir, json } => {
            let config = MigrateConfig::from_env(input)?;
            let export_dir = export_dir.unwrap_or_else(|| {
                default_export_dir(&config.export_root, chrono::Local::now().date_naive())
            });
            handle_validate(&config, export_dir, json).await
        }
        Command::Rollback { confirm } => {
            if !confirm {
                print!("{}", render_plan());
                return Ok(EXIT_OK);
            }
            let config = MigrateConfig::from_env(input)?;
            handle_rollback(&config).await
        }
        Command::BootstrapSchema => {
            let config = MigrateConfig::from_env(input)?;
            let pool = open_target_pool(&config.database_url, true)
                .await
                .map_err(|err| open_error(&config, err))?;
            let applied = schema::bootstrap_schema(&pool).await?;
            println!("Applied {applied} schema file(s)");
            pool.close().await;
            Ok(EXIT_OK)
        }
    }
}

fn open_error(config: &MigrateConfig, err: anyhow::Error) -> AppError {
    AppError::new(AppError::DB_NOT_CONFIGURED, "cannot open target database")
        .with_context("url", config.database_url.clone())
        .with_cause(err)
}

async fn open_ready_store(config: &MigrateConfig) -> AppResult<SqlitePool> {
    let pool = open_target_pool(&config.database_url, false)
        .await
        .map_err(|err| open_error(config, err))?;
    SqliteTargetStore::new(pool.clone())
        .ensure_ready()
        .await
        .map_err(|err| {
            AppError::new(AppError::DB_NOT_INITIALIZED, err.to_string())
                .with_context("url", config.database_url.clone())
        })?;
    Ok(pool)
}

fn require_export_dir(export_dir: &std::path::Path) -> AppResult<()> {
    if export_dir.is_dir() {
        Ok(())
    } else {
        Err(
            AppError::new(AppError::INVALID_CONFIG, "export directory not found")
                .with_context("path", export_dir.display().to_string()),
        )
    }
}

async fn handle_run(
    config: &MigrateConfig,
    export_dir: PathBuf,
    options: RunOptions,
) -> AppResult<i32> {
    require_export_dir(&export_dir)?;
    let pool = open_ready_store(config).await?;
    let store = SqliteTargetStore::new(pool.clone());
    let mappings = MappingStore::new(pool.clone());
    let reporter = InvalidFkReporter::new(&export_dir);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(
                    target: "transit_migrate",
                    event = "interrupt_received",
                    msg = "finishing the current entity before stopping"
                );
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let ctx = ImportContext {
        store: &store,
        mappings: &mappings,
        reporter: &reporter,
        export_dir: &export_dir,
        batch_size: config.batch_size,
    };
    let summary = run_migration(&ctx, &options, &cancel).await?;

    print!("{}", render_summary_table(&summary));
    match write_run_report(&export_dir, &summary) {
        Ok(path) => println!("Run report: {}", path.display()),
        Err(err) => tracing::warn!(
            target: "transit_migrate",
            event = "run_report_failed",
            error = %format!("{err:#}")
        ),
    }
    if reporter.recorded_count() > 0 {
        println!("Invalid foreign keys: {}", reporter.path().display());
    }

    pool.close().await;
    Ok(summary.exit_code())
}

async fn handle_validate(config: &MigrateConfig, export_dir: PathBuf, json: bool) -> AppResult<i32> {
    require_export_dir(&export_dir)?;
    let pool = open_ready_store(config).await?;
    let store = SqliteTargetStore::new(pool.clone());
    let mappings = MappingStore::new(pool.clone());

    let report = validate_export(&export_dir, &store, &mappings, config.tolerance)
        .await
        .map_err(|err| AppError::new(AppError::UNKNOWN_CODE, err.to_string()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation of {}", export_dir.display());
        print!("{}", render_validation_table(&report));
    }

    pool.close().await;
    Ok(if report.has_failures() {
        EXIT_PARTIAL_FAILURE
    } else {
        EXIT_OK
    })
}

async fn handle_rollback(config: &MigrateConfig) -> AppResult<i32> {
    let pool = open_ready_store(config).await?;
    let store = SqliteTargetStore::new(pool.clone());

    let report = rollback(&store)
        .await
        .map_err(|err| AppError::new(AppError::UNKNOWN_CODE, err.to_string()))?;
    print!("{}", render_report(&report));

    pool.close().await;
    Ok(EXIT_OK)
}
