use crate::domains::export::schema::{lookup, render_value, ColumnDef, Extractor, Record};
use crate::domains::export::types::{EntityType, ExportScope};

use super::{owned_by, EntityProjection};

static CUSTOMER_ADDRESS: [&str; 4] = ["address.line1", "address.line2", "address.city", "address.postcode"];

static CUSTOMER_COLUMNS: [ColumnDef; 9] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::new("name", "Name", Extractor::Custom(full_name)),
    ColumnDef::text("email", "Email"),
    ColumnDef::text("phone", "Phone"),
    ColumnDef::text("company", "Company"),
    ColumnDef::new("address", "Address", Extractor::Joined(&CUSTOMER_ADDRESS)),
    ColumnDef::new("account_manager", "Account Manager", Extractor::Text("account_manager.name")),
    ColumnDef::new("vip", "VIP", Extractor::Flag("vip")),
    ColumnDef::new("created_at", "Created", Extractor::DateTime("created_at")),
];

/// `first_name last_name`, falling back to a single `name` field.
fn full_name(record: &Record) -> String {
    let part = |field: &str| lookup(record, field).map(render_value).unwrap_or_default();
    let joined = [part("first_name"), part("last_name")]
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        part("name")
    } else {
        joined
    }
}

pub struct Customers;

impl EntityProjection for Customers {
    fn entity_type(&self) -> EntityType {
        EntityType::Customer
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &CUSTOMER_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "created_at"
    }

    // A customer's portal login is linked through user_id
    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["user_id"], scope)
    }
}

static STAFF_COLUMNS: [ColumnDef; 8] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::new("name", "Name", Extractor::Custom(full_name)),
    ColumnDef::text("email", "Email"),
    ColumnDef::text("role", "Role"),
    ColumnDef::text("department", "Department"),
    ColumnDef::text("phone", "Phone"),
    ColumnDef::new("active", "Active", Extractor::Flag("active")),
    ColumnDef::new("hired_on", "Hired", Extractor::Date("hired_at")),
];

pub struct StaffMembers;

impl EntityProjection for StaffMembers {
    fn entity_type(&self) -> EntityType {
        EntityType::Staff
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &STAFF_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "hired_at"
    }

    /// Owner-scoped requesters never see the staff directory.
    fn scope_matches(&self, _record: &Record, scope: &ExportScope) -> bool {
        !scope.restrict_to_owner
    }
}

static VEHICLE_COLUMNS: [ColumnDef; 9] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("registration", "Registration"),
    ColumnDef::text("make", "Make"),
    ColumnDef::text("model", "Model"),
    ColumnDef::text("year", "Year"),
    ColumnDef::text("vin", "VIN"),
    ColumnDef::new("owner_name", "Owner", Extractor::Text("customer.name")),
    ColumnDef::new("last_service_on", "Last Service", Extractor::Date("last_service_at")),
    ColumnDef::new("created_at", "Created", Extractor::DateTime("created_at")),
];

pub struct Vehicles;

impl EntityProjection for Vehicles {
    fn entity_type(&self) -> EntityType {
        EntityType::Vehicle
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &VEHICLE_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "created_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id"], scope)
    }
}

static PROPERTY_ADDRESS: [&str; 3] = ["address.line1", "address.city", "address.postcode"];

static PROPERTY_COLUMNS: [ColumnDef; 8] = [
    ColumnDef::text("id", "ID"),
    ColumnDef::text("name", "Name"),
    ColumnDef::new("address", "Address", Extractor::Joined(&PROPERTY_ADDRESS)),
    ColumnDef::new("property_type", "Type", Extractor::Text("type")),
    ColumnDef::text("units", "Units"),
    ColumnDef::new("manager_name", "Manager", Extractor::Text("manager.name")),
    ColumnDef::new("monthly_fee", "Monthly Fee", Extractor::Money("monthly_fee")),
    ColumnDef::new("created_at", "Created", Extractor::DateTime("created_at")),
];

pub struct Properties;

impl EntityProjection for Properties {
    fn entity_type(&self) -> EntityType {
        EntityType::Property
    }

    fn columns(&self) -> &'static [ColumnDef] {
        &PROPERTY_COLUMNS
    }

    fn timestamp_field(&self) -> &'static str {
        "created_at"
    }

    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool {
        owned_by(record, &["customer_id"], scope)
    }
}
