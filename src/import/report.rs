use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::orchestrator::RunSummary;
use super::validator::{ValidationReport, ValidationStatus};
use crate::fk_report::REPORT_FILE_NAME;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReportFile<'a> {
    generated_at: String,
    export_dir: String,
    invalid_fk_report: String,
    summary: &'a RunSummary,
}

/// Write the run summary next to the export as
/// `migration-report-<timestamp>.json`.
pub fn write_run_report(export_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    fs::create_dir_all(export_dir)
        .with_context(|| format!("create report directory {}", export_dir.display()))?;

    let timestamp = Utc::now().format("migration-report-%Y%m%d-%H%M%S.json");
    let path = export_dir.join(timestamp.to_string());
    let payload = RunReportFile {
        generated_at: Utc::now().to_rfc3339(),
        export_dir: export_dir.display().to_string(),
        invalid_fk_report: export_dir.join(REPORT_FILE_NAME).display().to_string(),
        summary,
    };
    let json = serde_json::to_string_pretty(&payload).context("serialize run report")?;
    fs::write(&path, json).with_context(|| format!("write run report {}", path.display()))?;
    Ok(path)
}

pub fn render_summary_table(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Migration summary");
    let _ = writeln!(
        out,
        "{:<18} {:>5} {:>9} {:>8} {:>10} {:>7} {:>8}  Result",
        "Table", "Level", "Imported", "Skipped", "Duplicates", "Failed", "Bad FKs"
    );
    for result in &summary.results {
        let outcome = match (&result.error, result.success) {
            (_, true) => "ok".to_string(),
            (Some(error), false) => format!("error: {}", error.replace('\n', " ")),
            (None, false) => "error".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<18} {:>5} {:>9} {:>8} {:>10} {:>7} {:>8}  {}",
            result.table.table(),
            result.level,
            result.imported,
            result.skipped,
            result.duplicates,
            result.failed,
            result.invalid_foreign_keys,
            outcome
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Total imported   : {}", summary.total_imported);
    let _ = writeln!(out, "Total skipped    : {}", summary.total_skipped);
    let _ = writeln!(out, "Failed entities  : {}", summary.failed_entities);
    let _ = writeln!(out, "Invalid FKs      : {}", summary.invalid_foreign_keys);
    if summary.interrupted {
        let _ = writeln!(out, "Run interrupted before all entities were imported");
    }
    out
}

pub fn render_validation_table(report: &ValidationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<18} {:>8} {:>8} {:>8}  Status",
        "Table", "Source", "Target", "Mapped"
    );
    for row in &report.rows {
        let source = row
            .source_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            out,
            "{:<18} {:>8} {:>8} {:>8}  {}",
            row.table.table(),
            source,
            row.target_count,
            row.mapping_count,
            row.status.as_str()
        );
    }
    let _ = writeln!(
        out,
        "\nPASS: {}  WARN: {}  FAIL: {}",
        report.count(ValidationStatus::Pass),
        report.count(ValidationStatus::Warn),
        report.count(ValidationStatus::Fail)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityType, ImportStrategy};
    use crate::import::orchestrator::EntityImportResult;
    use crate::import::validator::ValidationRow;
    use tempfile::TempDir;

    fn summary() -> RunSummary {
        RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results: vec![EntityImportResult {
                table: EntityType::Vehicles,
                level: 2,
                strategy: ImportStrategy::Batched,
                imported: 99,
                skipped: 1,
                duplicates: 0,
                failed: 1,
                invalid_foreign_keys: 3,
                truncated_fields: 0,
                success: true,
                error: None,
                duration_ms: 12,
            }],
            total_imported: 99,
            total_skipped: 1,
            failed_entities: 0,
            invalid_foreign_keys: 3,
            interrupted: false,
        }
    }

    #[test]
    fn run_report_is_timestamped_json() {
        let dir = TempDir::new().unwrap();
        let path = write_run_report(dir.path(), &summary()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("migration-report-"));

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["totalImported"], 99);
        assert_eq!(value["summary"]["results"][0]["table"], "vehicles");
        assert_eq!(value["summary"]["results"][0]["invalidForeignKeys"], 3);
    }

    #[test]
    fn summary_table_lists_each_entity() {
        let table = render_summary_table(&summary());
        assert!(table.contains("vehicles"));
        assert!(table.contains("Total imported   : 99"));
        assert!(!table.contains("interrupted"));
    }

    #[test]
    fn unreadable_source_renders_as_na() {
        let report = ValidationReport {
            rows: vec![ValidationRow {
                table: EntityType::Routes,
                source_count: None,
                target_count: 4,
                mapping_count: 4,
                status: ValidationStatus::Warn,
            }],
        };
        let table = render_validation_table(&report);
        assert!(table.contains("N/A"));
        assert!(table.contains("WARN: 1"));
    }
}
