//! Legacy records and their target-shaped import units.
//!
//! Legacy exports are loosely typed: the same field may appear in snake_case
//! or camelCase, nested (`operator.id`), as a number or a string. Every
//! field lookup therefore goes through an alias list.

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::EntityType;
use crate::normalize::{
    canonical_status, clean_phone, coerce_bool, coerce_f64, coerce_i64, coerce_string,
    format_date, format_datetime, normalize_code, normalize_plate, parse_date, parse_datetime,
    truncate_chars,
};
use crate::store::Record;

const MAX_CODE: usize = 50;
const MAX_NAME: usize = 255;
const MAX_PHONE: usize = 20;
const MAX_ADDRESS: usize = 500;
const MAX_NOTE: usize = 1000;

const LEGACY_ID_KEYS: &[&str] = &["id", "_id", "doc_id", "_doc_id"];

#[derive(Debug, Clone)]
pub struct RawRecord {
    fields: Map<String, Value>,
    origin: &'static str,
}

impl RawRecord {
    pub fn new(fields: Map<String, Value>, origin: &'static str) -> Self {
        Self { fields, origin }
    }

    /// File the record was read from.
    pub fn origin(&self) -> &'static str {
        self.origin
    }

    /// Non-null value at `path`, where dots step into nested objects.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        (!current.is_null()).then_some(current)
    }

    /// First alias with a usable value.
    pub fn first(&self, aliases: &[&str]) -> Option<&Value> {
        aliases
            .iter()
            .filter_map(|alias| self.get(alias))
            .find(|value| coerce_string(value).is_some() || value.is_object())
    }

    pub fn legacy_id(&self) -> Option<String> {
        LEGACY_ID_KEYS
            .iter()
            .filter_map(|key| self.get(key))
            .find_map(|value| match value {
                Value::String(_) | Value::Number(_) => coerce_string(value),
                _ => None,
            })
    }
}

/// Reference from one target column to a row of another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub column: &'static str,
    pub target: EntityType,
    pub legacy_value: String,
}

#[derive(Debug, Clone)]
pub struct ImportUnit {
    pub entity: EntityType,
    pub legacy_id: String,
    pub natural_key: Option<String>,
    pub fields: Record,
    /// References to resolve; their columns hold `null` until resolved.
    pub foreign_keys: Vec<ForeignKeyRef>,
    /// References that had no mapping, reported once the row is stored.
    pub unresolved: Vec<ForeignKeyRef>,
    /// Text fields cut to their column maximum.
    pub truncated: u32,
}

impl ImportUnit {
    /// Fill a foreign key column. `None` leaves it null and remembers the
    /// reference as unresolved.
    pub fn set_foreign_key(&mut self, fk: &ForeignKeyRef, target_id: Option<Uuid>) {
        let value = match target_id {
            Some(id) => Value::String(id.to_string()),
            None => {
                self.unresolved.push(fk.clone());
                Value::Null
            }
        };
        self.fields.insert(fk.column.to_string(), value);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("record has no legacy id")]
    MissingLegacyId,
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
}

struct UnitBuilder<'a> {
    raw: &'a RawRecord,
    fields: Record,
    foreign_keys: Vec<ForeignKeyRef>,
    truncated: u32,
}

impl<'a> UnitBuilder<'a> {
    fn new(raw: &'a RawRecord, legacy_id: &str) -> Self {
        let mut fields = Record::new();
        fields.insert("legacy_id".into(), Value::String(legacy_id.to_string()));
        let created_at = raw
            .first(&["created_at", "createdAt", "created"])
            .and_then(parse_datetime)
            .unwrap_or_else(Utc::now);
        fields.insert(
            "created_at".into(),
            Value::String(format_datetime(&created_at)),
        );
        Self {
            raw,
            fields,
            foreign_keys: Vec::new(),
            truncated: 0,
        }
    }

    fn put(&mut self, column: &'static str, value: Option<Value>) {
        self.fields
            .insert(column.to_string(), value.unwrap_or(Value::Null));
    }

    fn put_text(&mut self, column: &'static str, value: Option<String>, max: usize) -> Option<String> {
        let value = value.map(|mut text| {
            if truncate_chars(&mut text, max) {
                self.truncated += 1;
            }
            text
        });
        self.put(column, value.clone().map(Value::String));
        value
    }

    fn raw_text(&self, aliases: &[&str]) -> Option<String> {
        self.raw.first(aliases).and_then(coerce_string)
    }

    fn text(&mut self, column: &'static str, aliases: &[&str], max: usize) -> Option<String> {
        let value = self.raw_text(aliases);
        self.put_text(column, value, max)
    }

    fn phone(&mut self, column: &'static str, aliases: &[&str]) {
        let value = self.raw.first(aliases).and_then(clean_phone);
        self.put_text(column, value, MAX_PHONE);
    }

    fn flag(&mut self, column: &'static str, aliases: &[&str], default: bool) {
        let value = coerce_bool(self.raw.first(aliases), default);
        self.put(column, Some(Value::Bool(value)));
    }

    fn date(&mut self, column: &'static str, aliases: &[&str]) {
        let value = self
            .raw
            .first(aliases)
            .and_then(parse_date)
            .map(|date| Value::String(format_date(&date)));
        self.put(column, value);
    }

    fn datetime(&mut self, column: &'static str, aliases: &[&str]) {
        let value = self
            .raw
            .first(aliases)
            .and_then(parse_datetime)
            .map(|dt| Value::String(format_datetime(&dt)));
        self.put(column, value);
    }

    fn int(&mut self, column: &'static str, aliases: &[&str]) -> Option<i64> {
        let value = self.raw.first(aliases).and_then(coerce_i64);
        self.put(column, value.map(Value::from));
        value
    }

    fn real(&mut self, column: &'static str, aliases: &[&str]) {
        let value = self.raw.first(aliases).and_then(coerce_f64);
        self.put(column, value.map(Value::from));
    }

    fn status(&mut self, column: &'static str, aliases: &[&str], default: &str) {
        let value = self
            .raw_text(aliases)
            .map(|raw| canonical_status(&raw))
            .filter(|status| !status.is_empty())
            .unwrap_or_else(|| default.to_string());
        self.put_text(column, Some(value), MAX_CODE);
    }

    /// Record a reference to `target`. Nested objects are read through their
    /// `id` field.
    fn foreign_key(&mut self, column: &'static str, aliases: &[&str], target: EntityType) {
        let legacy_value = self.raw.first(aliases).and_then(|value| match value {
            Value::Object(map) => map.get("id").and_then(coerce_string),
            other => coerce_string(other),
        });
        self.put(column, None);
        if let Some(legacy_value) = legacy_value {
            self.foreign_keys.push(ForeignKeyRef {
                column,
                target,
                legacy_value,
            });
        }
    }

    fn finish(self, entity: EntityType, legacy_id: String, natural_key: Option<String>) -> ImportUnit {
        ImportUnit {
            entity,
            legacy_id,
            natural_key,
            fields: self.fields,
            foreign_keys: self.foreign_keys,
            unresolved: Vec::new(),
            truncated: self.truncated,
        }
    }
}

/// Build the target-shaped unit for one legacy record.
pub fn transform(entity: EntityType, raw: &RawRecord) -> Result<ImportUnit, TransformError> {
    let legacy_id = raw.legacy_id().ok_or(TransformError::MissingLegacyId)?;
    let mut b = UnitBuilder::new(raw, &legacy_id);

    let natural_key = match entity {
        EntityType::Operators => {
            let code = b
                .raw_text(&["code", "operator_code", "operatorCode"])
                .map(|code| normalize_code(&code))
                .unwrap_or_else(|| normalize_code(&legacy_id));
            let code = b.put_text("code", Some(code), MAX_CODE);
            let name = b
                .raw_text(&["name", "operator_name", "operatorName", "full_name", "fullName"])
                .or_else(|| code.clone());
            b.put_text("name", name, MAX_NAME);
            b.phone("phone", &["phone", "phone_number", "phoneNumber", "hotline"]);
            b.text("email", &["email"], MAX_NAME);
            b.text("address", &["address"], MAX_ADDRESS);
            b.text("tax_code", &["tax_code", "taxCode"], MAX_CODE);
            b.flag("is_active", &["is_active", "isActive", "active"], true);
            code
        }
        EntityType::VehicleTypes => {
            let name = b.text("name", &["name", "type_name", "typeName"], MAX_NAME);
            b.int("seat_count", &["seat_count", "seatCount", "seats"]);
            b.text("description", &["description", "note"], MAX_NOTE);
            Some(name.ok_or(TransformError::MissingField("name"))?)
        }
        EntityType::Shifts => {
            let name = b.text("name", &["name", "shift_name", "shiftName"], MAX_NAME);
            b.text("start_time", &["start_time", "startTime"], MAX_CODE);
            b.text("end_time", &["end_time", "endTime"], MAX_CODE);
            b.flag("is_active", &["is_active", "isActive", "active"], true);
            Some(name.ok_or(TransformError::MissingField("name"))?)
        }
        EntityType::Users => {
            let username = b
                .raw_text(&["username", "userName", "login"])
                .map(|name| name.to_lowercase());
            let username = b.put_text("username", username, MAX_NAME);
            b.text(
                "full_name",
                &["full_name", "fullName", "display_name", "displayName", "name"],
                MAX_NAME,
            );
            b.phone("phone", &["phone", "phone_number", "phoneNumber"]);
            b.text("email", &["email"], MAX_NAME);
            let role = b
                .raw_text(&["role", "user_role", "userRole"])
                .map(|role| role.to_lowercase())
                .unwrap_or_else(|| "staff".to_string());
            b.put_text("role", Some(role), MAX_CODE);
            b.flag("is_active", &["is_active", "isActive", "active"], true);
            Some(username.ok_or(TransformError::MissingField("username"))?)
        }
        EntityType::Routes => {
            let code = b
                .raw_text(&["route_code", "routeCode", "code"])
                .map(|code| normalize_code(&code))
                .unwrap_or_else(|| normalize_code(&legacy_id));
            let code = b.put_text("route_code", Some(code), MAX_CODE);
            b.text("name", &["name", "route_name", "routeName"], MAX_NAME);
            b.text("origin", &["origin", "departure", "from"], MAX_NAME);
            b.text("destination", &["destination", "arrival", "to"], MAX_NAME);
            b.real("distance_km", &["distance_km", "distanceKm", "distance"]);
            b.flag("is_active", &["is_active", "isActive", "active"], true);
            code
        }
        EntityType::Vehicles => {
            let plate = b
                .raw_text(&[
                    "plate_number",
                    "plateNumber",
                    "plate",
                    "license_plate",
                    "licensePlate",
                ])
                .map(|plate| normalize_plate(&plate))
                .filter(|plate| !plate.is_empty());
            let plate = b.put_text("plate_number", plate, MAX_CODE);
            b.foreign_key(
                "operator_id",
                &["operator_id", "operatorId", "operator.id", "operator"],
                EntityType::Operators,
            );
            b.foreign_key(
                "vehicle_type_id",
                &["vehicle_type_id", "vehicleTypeId", "vehicle_type.id", "vehicleType.id"],
                EntityType::VehicleTypes,
            );
            b.int("seat_count", &["seat_count", "seatCount", "seats"]);
            b.int("bed_count", &["bed_count", "bedCount", "beds"]);
            b.int("manufacture_year", &["manufacture_year", "manufactureYear", "year"]);
            b.date("registration_expiry", &["registration_expiry", "registrationExpiry"]);
            b.date("insurance_expiry", &["insurance_expiry", "insuranceExpiry"]);
            b.date("inspection_expiry", &["inspection_expiry", "inspectionExpiry"]);
            b.flag("is_active", &["is_active", "isActive", "active"], true);
            b.text("notes", &["notes", "note"], MAX_NOTE);
            Some(plate.ok_or(TransformError::MissingField("plate_number"))?)
        }
        EntityType::Drivers => {
            let license = b
                .raw_text(&["license_number", "licenseNumber", "license_no", "licenseNo"])
                .map(|license| normalize_code(&license));
            let license = b.put_text("license_number", license, MAX_CODE);
            let name = b.text("full_name", &["full_name", "fullName", "name"], MAX_NAME);
            if name.is_none() {
                return Err(TransformError::MissingField("full_name"));
            }
            b.phone("phone", &["phone", "phone_number", "phoneNumber"]);
            b.foreign_key(
                "operator_id",
                &["operator_id", "operatorId", "operator.id", "operator"],
                EntityType::Operators,
            );
            b.text("license_class", &["license_class", "licenseClass"], MAX_CODE);
            b.date("license_expiry", &["license_expiry", "licenseExpiry"]);
            b.date("date_of_birth", &["date_of_birth", "dateOfBirth", "dob"]);
            b.flag("is_active", &["is_active", "isActive", "active"], true);
            Some(license.ok_or(TransformError::MissingField("license_number"))?)
        }
        EntityType::VehicleBadges => {
            let number = b
                .raw_text(&["badge_number", "badgeNumber", "badge_no", "number"])
                .map(|number| normalize_code(&number));
            let number = b.put_text("badge_number", number, MAX_CODE);
            b.foreign_key(
                "vehicle_id",
                &["vehicle_id", "vehicleId", "vehicle.id"],
                EntityType::Vehicles,
            );
            b.foreign_key("route_id", &["route_id", "routeId", "route.id"], EntityType::Routes);
            b.foreign_key(
                "operator_id",
                &["operator_id", "operatorId", "operator.id"],
                EntityType::Operators,
            );
            b.text("badge_type", &["badge_type", "badgeType", "type"], MAX_CODE);
            b.date("issue_date", &["issue_date", "issueDate", "issued_at"]);
            b.date("expiry_date", &["expiry_date", "expiryDate", "expires_at"]);
            b.status("status", &["status"], "active");
            Some(number.ok_or(TransformError::MissingField("badge_number"))?)
        }
        EntityType::DispatchRecords => {
            b.foreign_key(
                "vehicle_id",
                &["vehicle_id", "vehicleId", "vehicle.id"],
                EntityType::Vehicles,
            );
            b.foreign_key("driver_id", &["driver_id", "driverId", "driver.id"], EntityType::Drivers);
            b.foreign_key("route_id", &["route_id", "routeId", "route.id"], EntityType::Routes);
            b.foreign_key("shift_id", &["shift_id", "shiftId", "shift.id"], EntityType::Shifts);
            b.foreign_key(
                "entry_user_id",
                &["entry_user_id", "entryUserId", "entry_by", "entryBy"],
                EntityType::Users,
            );
            b.text("permit_number", &["permit_number", "permitNumber"], MAX_CODE);
            b.status("status", &["status", "dispatch_status", "dispatchStatus"], "entered");
            b.datetime("entry_time", &["entry_time", "entryTime", "entered_at"]);
            b.datetime("exit_time", &["exit_time", "exitTime", "departed_at"]);
            b.int("passenger_count", &["passenger_count", "passengerCount", "passengers"]);
            b.text("notes", &["notes", "note"], MAX_NOTE);
            None
        }
        EntityType::Invoices => {
            let number = b
                .raw_text(&["invoice_number", "invoiceNumber", "number"])
                .map(|number| normalize_code(&number))
                .unwrap_or_else(|| normalize_code(&legacy_id));
            let number = b.put_text("invoice_number", Some(number), MAX_CODE);
            b.foreign_key(
                "dispatch_record_id",
                &["dispatch_record_id", "dispatchRecordId", "dispatch_id", "dispatchId"],
                EntityType::DispatchRecords,
            );
            b.foreign_key(
                "operator_id",
                &["operator_id", "operatorId", "operator.id"],
                EntityType::Operators,
            );
            let amount = b.raw.first(&["amount", "total", "total_amount", "totalAmount"]);
            let amount = amount.and_then(coerce_i64).unwrap_or(0);
            b.put("amount", Some(Value::from(amount)));
            b.status("status", &["status", "payment_status", "paymentStatus"], "unpaid");
            b.datetime("issued_at", &["issued_at", "issuedAt", "issue_date"]);
            b.datetime("paid_at", &["paid_at", "paidAt"]);
            number
        }
    };

    Ok(b.finish(entity, legacy_id, natural_key))
}
