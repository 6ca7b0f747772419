//! Migration of the legacy bus-station JSON export into the relational
//! operations schema.
//!
//! Entities are imported level by level so every foreign key can be
//! resolved through the persistent id mapping written by earlier levels.

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod fk_report;
pub mod import;
pub mod logging;
pub mod mapping;
pub mod normalize;
pub mod progress;
pub mod rollback;
pub mod schema;
pub mod store;

pub use entity::{EntityType, ImportStrategy};
pub use error::{AppError, AppResult};
pub use mapping::{MappingError, MappingRecord, MappingStore};
pub use store::{Record, SqliteTargetStore, StoreError, TargetStore};
