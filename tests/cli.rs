use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::{tempdir, TempDir};

fn cli(workdir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_transit-migrate"));
    cmd.current_dir(workdir)
        .env_remove("TRANSIT_MIGRATE_DB")
        .env_remove("DATABASE_URL")
        .env_remove("TRANSIT_MIGRATE_EXPORT_ROOT")
        .env("TRANSIT_MIGRATE_LOG", "transit_migrate=warn");
    cmd
}

fn write(dir: &Path, file: &str, value: Value) {
    fs::write(dir.join(file), serde_json::to_vec(&value).unwrap()).unwrap();
}

/// Bootstrapped database plus a small export with one dangling reference.
fn fixture() -> (TempDir, String, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let db = dir.path().join("target.sqlite3").display().to_string();
    cli(dir.path())
        .args(["--db", &db, "bootstrap-schema"])
        .assert()
        .success();

    let export = dir.path().join("exports").join("2024-03-01");
    fs::create_dir_all(&export).unwrap();
    write(&export, "operators.json", json!([{"id": "op-1", "code": "PT", "name": "Phuong Trang"}]));
    write(
        &export,
        "vehicles.json",
        json!([
            {"id": "v-1", "plateNumber": "51B-12345", "operatorId": "op-1"},
            {"id": "v-2", "plateNumber": "51B-99999", "operatorId": "op-404"}
        ]),
    );
    write(
        &export,
        "datasheet_vehicles.json",
        json!([{"id": "sheet-1", "plate_number": "51b-123.45"}]),
    );
    (dir, db, export)
}

#[test]
fn run_imports_and_reports() {
    let (dir, db, export) = fixture();
    let export_arg = export.display().to_string();

    let output = cli(dir.path())
        .args(["--db", &db, "run", &export_arg])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Migration summary"));
    assert!(stdout.contains("Total imported   : 3"));

    let report: Vec<Value> =
        serde_json::from_str(&fs::read_to_string(export.join("invalid-fk-report.json")).unwrap())
            .unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0]["recordId"], "v-2");
    assert_eq!(report[0]["targetCollection"], "operators");

    let run_reports = fs::read_dir(&export)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("migration-report-"))
        .count();
    assert_eq!(run_reports, 1);
}

#[tokio::test]
async fn rerun_is_idempotent_and_validate_passes() {
    let (dir, db, export) = fixture();
    let export_arg = export.display().to_string();

    for _ in 0..2 {
        cli(dir.path())
            .args(["--db", &db, "run", &export_arg])
            .assert()
            .code(0);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{db}"))
        .await
        .unwrap();
    let vehicles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vehicles")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vehicles, 2);
    let mapped: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM id_mappings WHERE entity_type = 'vehicles'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(mapped, 3);
    pool.close().await;

    let output = cli(dir.path())
        .args(["--db", &db, "validate", &export_arg, "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = report["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 10);
    let vehicles = rows.iter().find(|row| row["table"] == "vehicles").unwrap();
    assert_eq!(vehicles["sourceCount"], 3);
    assert_eq!(vehicles["targetCount"], 2);
    // 3 source records collapse into 2 plates: a 33% gap is a warning, not a failure.
    assert_eq!(vehicles["status"], "WARN");
}

#[test]
fn validate_fails_when_target_is_empty() {
    let (dir, db, export) = fixture();
    cli(dir.path())
        .args(["--db", &db, "validate", &export.display().to_string()])
        .assert()
        .code(1);
}

#[test]
fn validate_defaults_to_dated_directory_under_export_root() {
    let (dir, db, _export) = fixture();
    // Today's directory does not exist under the export root.
    cli(dir.path())
        .args(["--db", &db, "--export-root", "exports", "validate"])
        .assert()
        .code(2);
}

#[test]
fn rollback_requires_confirmation() {
    let (dir, db, export) = fixture();
    let export_arg = export.display().to_string();
    cli(dir.path())
        .args(["--db", &db, "run", &export_arg])
        .assert()
        .code(0);

    let output = cli(dir.path())
        .args(["--db", &db, "rollback"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("invoices"));
    assert!(stdout.contains("--confirm"));

    // Nothing was deleted, so validation still finds the rows.
    cli(dir.path())
        .args(["--db", &db, "validate", &export_arg])
        .assert()
        .code(0);

    let output = cli(dir.path())
        .args(["--db", &db, "rollback", "--confirm"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Total rows deleted: 7"));
    assert!(export.join("operators.json").exists());
}

#[test]
fn missing_database_configuration_is_fatal() {
    let dir = tempdir().unwrap();
    let export = dir.path().join("export");
    fs::create_dir_all(&export).unwrap();
    cli(dir.path())
        .args(["run", &export.display().to_string()])
        .assert()
        .code(2);
}

#[test]
fn uninitialized_database_is_fatal() {
    let dir = tempdir().unwrap();
    let export = dir.path().join("export");
    fs::create_dir_all(&export).unwrap();
    let db = dir.path().join("absent.sqlite3");
    cli(dir.path())
        .args(["--db", &db.display().to_string(), "run", &export.display().to_string()])
        .assert()
        .code(2);
    assert!(!db.exists());
}

#[test]
fn unknown_only_filter_is_rejected() {
    let (dir, db, export) = fixture();
    cli(dir.path())
        .args([
            "--db",
            &db,
            "run",
            &export.display().to_string(),
            "--only",
            "passengers",
        ])
        .assert()
        .failure();
}

#[test]
fn dotenv_supplies_database_and_log_filter() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("from-dotenv.sqlite3");
    fs::write(
        dir.path().join(".env"),
        format!(
            "TRANSIT_MIGRATE_DB={}\nTRANSIT_MIGRATE_LOG=transit_migrate=debug\n",
            db.display()
        ),
    )
    .unwrap();

    let output = cli(dir.path())
        .env_remove("TRANSIT_MIGRATE_LOG")
        .arg("bootstrap-schema")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(db.exists());
    assert!(String::from_utf8_lossy(&output.stderr).contains("dotenv_loaded"));
}
