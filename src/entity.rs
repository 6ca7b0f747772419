use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Table holding the legacy id to target id translation.
pub const MAPPING_TABLE: &str = "id_mappings";

/// Every target entity the migration knows about.
///
/// The enum doubles as the allow-list for identifiers that end up inside raw
/// SQL: table names are only ever produced by [`EntityType::table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Operators,
    VehicleTypes,
    Shifts,
    Users,
    Routes,
    Vehicles,
    Drivers,
    VehicleBadges,
    DispatchRecords,
    Invoices,
}

/// How an entity's records are written to the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// One lookup and one insert per record.
    PerRecord,
    /// Preloaded lookups and grouped inserts with per-record fallback.
    Batched,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown entity or table name: {0:?}")]
pub struct UnknownEntity(pub String);

impl EntityType {
    /// All entities in import order (parents before children).
    pub const ALL: [EntityType; 10] = [
        EntityType::Operators,
        EntityType::VehicleTypes,
        EntityType::Shifts,
        EntityType::Users,
        EntityType::Routes,
        EntityType::Vehicles,
        EntityType::Drivers,
        EntityType::VehicleBadges,
        EntityType::DispatchRecords,
        EntityType::Invoices,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Operators => "operators",
            EntityType::VehicleTypes => "vehicle_types",
            EntityType::Shifts => "shifts",
            EntityType::Users => "users",
            EntityType::Routes => "routes",
            EntityType::Vehicles => "vehicles",
            EntityType::Drivers => "drivers",
            EntityType::VehicleBadges => "vehicle_badges",
            EntityType::DispatchRecords => "dispatch_records",
            EntityType::Invoices => "invoices",
        }
    }

    /// Value stored in `id_mappings.entity_type`.
    pub fn as_str(&self) -> &'static str {
        self.table()
    }

    /// Export files for this entity, application table first, then the
    /// bulk datasheet table where one exists.
    pub fn source_files(&self) -> &'static [&'static str] {
        match self {
            EntityType::Operators => &["operators.json", "datasheet_operators.json"],
            EntityType::VehicleTypes => &["vehicle_types.json"],
            EntityType::Shifts => &["shifts.json"],
            EntityType::Users => &["users.json"],
            EntityType::Routes => &["routes.json"],
            EntityType::Vehicles => &["vehicles.json", "datasheet_vehicles.json"],
            EntityType::Drivers => &["drivers.json", "datasheet_drivers.json"],
            EntityType::VehicleBadges => &["vehicle_badges.json", "datasheet_vehicle_badges.json"],
            EntityType::DispatchRecords => &["dispatch_records.json"],
            EntityType::Invoices => &["invoices.json"],
        }
    }

    /// Column carrying the human-meaningful unique key, if the entity has one.
    pub fn natural_key_column(&self) -> Option<&'static str> {
        match self {
            EntityType::Operators => Some("code"),
            EntityType::VehicleTypes => Some("name"),
            EntityType::Shifts => Some("name"),
            EntityType::Users => Some("username"),
            EntityType::Routes => Some("route_code"),
            EntityType::Vehicles => Some("plate_number"),
            EntityType::Drivers => Some("license_number"),
            EntityType::VehicleBadges => Some("badge_number"),
            EntityType::DispatchRecords => None,
            EntityType::Invoices => Some("invoice_number"),
        }
    }

    pub fn strategy(&self) -> ImportStrategy {
        match self {
            EntityType::Vehicles | EntityType::VehicleBadges => ImportStrategy::Batched,
            _ => ImportStrategy::PerRecord,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityType {
    type Err = UnknownEntity;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let cleaned = name.trim().to_ascii_lowercase().replace('-', "_");
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.table() == cleaned)
            .ok_or_else(|| UnknownEntity(name.to_string()))
    }
}
