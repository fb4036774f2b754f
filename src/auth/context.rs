use uuid::Uuid;
use crate::types::{UserRole, Permission};
use crate::errors::ExportError;
use crate::domains::export::types::ExportScope;

/// Represents the authentication context for the current operation
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: Uuid,

    /// The tenant (business account) the user acts within
    pub tenant_id: Uuid,

    /// The role of the authenticated user
    pub role: UserRole,
}

impl AuthContext {
    /// Create a new authentication context
    pub fn new(user_id: Uuid, tenant_id: Uuid, role: UserRole) -> Self {
        Self {
            user_id,
            tenant_id,
            role,
        }
    }

    /// Check if user has a specific permission
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    /// Authorize a specific permission, returning an error if not allowed
    pub fn authorize(&self, permission: Permission) -> Result<(), ExportError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ExportError::PermissionDenied(format!(
                "User does not have permission: {}",
                permission.as_str()
            )))
        }
    }

    /// For operations restricted to the user's own records
    pub fn authorize_self_or(&self, resource_owner_id: &Uuid, permission: Permission) -> Result<(), ExportError> {
        if &self.user_id == resource_owner_id || self.has_permission(permission) {
            Ok(())
        } else {
            Err(ExportError::PermissionDenied(
                "You do not have permission to access this resource".to_string(),
            ))
        }
    }

    /// Row-level scope applied to every export this user runs.
    pub fn export_scope(&self) -> ExportScope {
        ExportScope {
            tenant_id: self.tenant_id,
            owner_id: self.user_id,
            restrict_to_owner: !self.has_permission(Permission::ExportTenantRecords),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_scope_is_restricted_to_owner() {
        let ctx = AuthContext::new(Uuid::new_v4(), Uuid::new_v4(), UserRole::Customer);
        let scope = ctx.export_scope();
        assert!(scope.restrict_to_owner);
        assert_eq!(scope.owner_id, ctx.user_id);
        assert_eq!(scope.tenant_id, ctx.tenant_id);

        let staff = AuthContext::new(Uuid::new_v4(), ctx.tenant_id, UserRole::Staff);
        assert!(!staff.export_scope().restrict_to_owner);
    }

    #[test]
    fn self_or_permission_allows_owner() {
        let ctx = AuthContext::new(Uuid::new_v4(), Uuid::new_v4(), UserRole::Customer);
        assert!(ctx.authorize_self_or(&ctx.user_id, Permission::ViewAllExportJobs).is_ok());
        assert!(matches!(
            ctx.authorize_self_or(&Uuid::new_v4(), Permission::ViewAllExportJobs),
            Err(ExportError::PermissionDenied(_))
        ));
    }
}
