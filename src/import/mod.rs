mod batch;
pub mod execute;
pub mod orchestrator;
pub mod report;
pub mod rows;
pub mod source;
pub mod table_order;
pub mod validator;

pub use execute::{import_entity, ImportContext, ImportError, ImportOutcome, DEFAULT_BATCH_SIZE};
pub use orchestrator::{run_migration, EntityImportResult, RunOptions, RunSummary};
pub use report::{render_summary_table, render_validation_table, write_run_report};
pub use source::{count_source, load_source, SourceError, SourceSet};
pub use table_order::{import_levels, level_of, rollback_order};
pub use validator::{
    classify, validate_export, ValidationError, ValidationReport, ValidationRow, ValidationStatus,
    DEFAULT_TOLERANCE,
};
