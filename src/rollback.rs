//! Clears imported data from the target so a migration can be re-run from
//! scratch. Export directories are never touched.

use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::entity::{EntityType, MAPPING_TABLE};
use crate::import::rollback_order;
use crate::store::{StoreError, TargetStore};

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("clearing target tables failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearedTable {
    pub table: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub cleared: Vec<ClearedTable>,
}

impl RollbackReport {
    pub fn total_rows(&self) -> u64 {
        self.cleared.iter().map(|table| table.rows).sum()
    }
}

/// Tables in the order they are cleared, mapping table last.
pub fn rollback_plan() -> Vec<&'static str> {
    rollback_order()
        .into_iter()
        .map(|entity| entity.table())
        .chain(std::iter::once(MAPPING_TABLE))
        .collect()
}

pub fn render_plan() -> String {
    let mut out = String::from("Rollback would clear, in order:\n");
    for (index, table) in rollback_plan().iter().enumerate() {
        let _ = writeln!(out, "  {:>2}. {}", index + 1, table);
    }
    out.push_str("\nRe-run with --confirm to delete.\n");
    out
}

/// Delete every imported row, children first, then the mappings. Either
/// everything is deleted or nothing is.
pub async fn rollback(store: &dyn TargetStore) -> Result<RollbackReport, RollbackError> {
    let order: Vec<EntityType> = rollback_order();
    let mut report = RollbackReport::default();

    for (table, rows) in store.clear_tables(&order).await? {
        info!(target: "transit_migrate", event = "rollback_table_cleared", table, rows);
        report.cleared.push(ClearedTable {
            table: table.to_string(),
            rows,
        });
    }
    Ok(report)
}

pub fn render_report(report: &RollbackReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<18} {:>8}", "Table", "Deleted");
    for table in &report.cleared {
        let _ = writeln!(out, "{:<18} {:>8}", table.table, table.rows);
    }
    let _ = writeln!(out, "\nTotal rows deleted: {}", report.total_rows());
    out
}
