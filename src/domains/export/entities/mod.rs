//! Per-entity projections: which columns exist, how a record becomes a row,
//! and which records a scoped requester may see.

mod billing;
mod directory;
mod operations;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domains::export::schema::{lookup, parse_instant, ColumnDef, ExportRow, Record};
use crate::domains::export::types::{EntityType, ExportScope};
use crate::errors::{ExportError, ExportResult};

pub use billing::{Invoices, Payments};
pub use directory::{Customers, Properties, StaffMembers, Vehicles};
pub use operations::{Emergencies, Inquiries, Messages, ServiceRequests};

/// Capability set every exportable entity registers.
pub trait EntityProjection: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Canonical column schema, in default order.
    fn columns(&self) -> &'static [ColumnDef];

    /// Field holding the entity's canonical timestamp (date range filtering).
    fn timestamp_field(&self) -> &'static str;

    /// Row-level visibility, applied before projection.
    fn scope_matches(&self, record: &Record, scope: &ExportScope) -> bool;

    fn column(&self, key: &str) -> Option<&'static ColumnDef> {
        self.columns().iter().find(|c| c.key == key)
    }

    fn default_columns(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.key.to_string()).collect()
    }

    fn project_row(&self, record: &Record, columns: &[&'static ColumnDef]) -> ExportRow {
        let mut row = ExportRow::with_capacity(columns.len());
        for column in columns {
            row.push(column.key, column.render(record));
        }
        row
    }

    fn record_timestamp(&self, record: &Record) -> Option<DateTime<Utc>> {
        lookup(record, self.timestamp_field())
            .and_then(|v| v.as_str())
            .and_then(parse_instant)
    }
}

static REGISTRY: Lazy<HashMap<EntityType, Arc<dyn EntityProjection>>> = Lazy::new(|| {
    let projections: Vec<Arc<dyn EntityProjection>> = vec![
        Arc::new(ServiceRequests),
        Arc::new(Invoices),
        Arc::new(Customers),
        Arc::new(Vehicles),
        Arc::new(Properties),
        Arc::new(Inquiries),
        Arc::new(Emergencies),
        Arc::new(Payments),
        Arc::new(StaffMembers),
        Arc::new(Messages),
    ];
    projections
        .into_iter()
        .map(|p| (p.entity_type(), p))
        .collect()
});

/// Look up the projection registered for `entity_type`.
pub fn projection(entity_type: EntityType) -> ExportResult<Arc<dyn EntityProjection>> {
    REGISTRY
        .get(&entity_type)
        .cloned()
        .ok_or_else(|| ExportError::UnsupportedEntityType(entity_type.as_str().to_string()))
}

/// Map requested keys onto schema columns. Callers validate first; unknown keys are skipped.
pub fn resolve_columns(projection: &dyn EntityProjection, keys: &[String]) -> Vec<&'static ColumnDef> {
    keys.iter().filter_map(|k| projection.column(k)).collect()
}

/// True when the scope is unrestricted or any of `fields` names the owner.
pub(crate) fn owned_by(record: &Record, fields: &[&str], scope: &ExportScope) -> bool {
    if !scope.restrict_to_owner {
        return true;
    }
    fields.iter().any(|field| {
        lookup(record, field)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map_or(false, |id| id == scope.owner_id)
    })
}
