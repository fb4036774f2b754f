use serde::{Deserialize, Serialize};

// --- User Role Definition ---

/// Portal roles as seen by the export pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Staff,
    Customer,
}

// --- Permission Enum Definition ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Export records the user is allowed to see
    ExportRecords,
    /// Export every record in the tenant, not only owned ones
    ExportTenantRecords,
    /// Save column preferences
    ManageColumnPreferences,
    /// Read export activity analytics
    ViewExportAnalytics,
    /// Inspect jobs requested by other users
    ViewAllExportJobs,
    /// Load operational records into the export store
    IngestRecords,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Staff => "staff",
            UserRole::Customer => "customer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserRole::Admin),
            "staff" => Some(UserRole::Staff),
            "customer" => Some(UserRole::Customer),
            _ => None,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        match self {
            UserRole::Admin => true,
            UserRole::Staff => !matches!(permission, Permission::ViewAllExportJobs),
            UserRole::Customer => matches!(
                permission,
                Permission::ExportRecords | Permission::ManageColumnPreferences
            ),
        }
    }
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ExportRecords => "export_records",
            Permission::ExportTenantRecords => "export_tenant_records",
            Permission::ManageColumnPreferences => "manage_column_preferences",
            Permission::ViewExportAnalytics => "view_export_analytics",
            Permission::ViewAllExportJobs => "view_all_export_jobs",
            Permission::IngestRecords => "ingest_records",
        }
    }
}
