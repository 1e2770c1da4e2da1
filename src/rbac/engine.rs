use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use super::permission::{self, InvalidPermission, SUPER_ADMIN, WILDCARD};
use crate::models::{InternalRole, Membership, NewAuditEntry, NewInternalRole};
use crate::store::{RoleChange, Store, StoreError};

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("cannot delete system role")]
    SystemRole,
    #[error("role not found")]
    RoleNotFound,
    #[error("role name must not be empty")]
    EmptyRoleName,
    #[error(transparent)]
    InvalidPermission(#[from] InvalidPermission),
    #[error("only super admins can {0}")]
    NotSuperAdmin(&'static str),
    #[error("cannot {0} the initial super admin")]
    InitialSuperAdmin(&'static str),
    #[error("user not found")]
    UserNotFound,
    #[error("tenant not found")]
    TenantNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RbacResult<T> = Result<T, RbacError>;

/// Answers permission questions over direct grants, external guild roles,
/// and tenant-local roles.
pub struct RbacEngine {
    store: Arc<dyn Store>,
    super_admin_external_id: Option<String>,
}

impl RbacEngine {
    pub fn new(store: Arc<dyn Store>, super_admin_external_id: Option<String>) -> Self {
        Self {
            store,
            super_admin_external_id,
        }
    }

    pub async fn is_super_admin(&self, user_id: Uuid) -> RbacResult<bool> {
        if let Some(user) = self.store.get_user(user_id).await? {
            if self.is_initial_super_admin(&user.external_user_id) {
                return Ok(true);
            }
        }
        Ok(self.store.has_super_admin_membership(user_id).await?)
    }

    pub async fn has_permission(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        permission: &str,
    ) -> RbacResult<bool> {
        if self.is_super_admin(user_id).await? {
            return Ok(true);
        }

        let Some(membership) = self.store.get_membership(user_id, tenant_id).await? else {
            return Ok(false);
        };

        if permission::grants(&membership.permissions, permission) {
            return Ok(true);
        }

        Ok(self
            .role_permissions(&membership)
            .await?
            .iter()
            .any(|grants| permission::grants(grants, permission)))
    }

    pub async fn has_any_permission(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        permissions: &[&str],
    ) -> RbacResult<bool> {
        for permission in permissions {
            if self.has_permission(user_id, tenant_id, permission).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Effective permission set, sorted. Super admins get `["*"]`.
    pub async fn get_user_permissions(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> RbacResult<Vec<String>> {
        if self.is_super_admin(user_id).await? {
            return Ok(vec![WILDCARD.to_string()]);
        }

        let Some(membership) = self.store.get_membership(user_id, tenant_id).await? else {
            return Ok(Vec::new());
        };

        let mut effective: BTreeSet<String> = membership.permissions.iter().cloned().collect();
        for grants in self.role_permissions(&membership).await? {
            effective.extend(grants);
        }
        Ok(effective.into_iter().collect())
    }

    pub async fn list_roles(&self, tenant_id: Uuid) -> RbacResult<Vec<InternalRole>> {
        Ok(self.store.list_internal_roles(tenant_id).await?)
    }

    pub async fn get_role(&self, role_id: Uuid) -> RbacResult<InternalRole> {
        self.store
            .get_internal_role(role_id)
            .await?
            .ok_or(RbacError::RoleNotFound)
    }

    pub async fn create_role(
        &self,
        tenant_id: Uuid,
        name: &str,
        permissions: &[String],
        is_system: bool,
    ) -> RbacResult<InternalRole> {
        let name = validate_role_name(name)?;
        let permissions = permission::normalize(permissions)?;
        let role = self
            .store
            .create_internal_role(NewInternalRole {
                id: Uuid::new_v4(),
                tenant_id,
                name,
                permissions,
                is_system,
            })
            .await?;
        tracing::info!(role_id = %role.id, tenant_id = %tenant_id, "created role");
        Ok(role)
    }

    pub async fn update_role(
        &self,
        role_id: Uuid,
        name: &str,
        permissions: &[String],
    ) -> RbacResult<InternalRole> {
        let name = validate_role_name(name)?;
        let permissions = permission::normalize(permissions)?;
        match self
            .store
            .update_internal_role(role_id, &name, &permissions)
            .await
        {
            Ok(role) => Ok(role),
            Err(StoreError::NotFound(_)) => Err(RbacError::RoleNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_role(&self, role_id: Uuid) -> RbacResult<()> {
        let role = self.get_role(role_id).await?;
        if role.is_system {
            return Err(RbacError::SystemRole);
        }
        match self.store.delete_internal_role(role_id).await {
            Ok(()) => {
                tracing::info!(role_id = %role_id, tenant_id = %role.tenant_id, "deleted role");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(RbacError::RoleNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn assign_role(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role_name: &str,
    ) -> RbacResult<Membership> {
        let role_name = validate_role_name(role_name)?;
        self.ensure_user_exists(user_id).await?;
        self.ensure_tenant_exists(tenant_id).await?;
        self.store
            .change_membership_role(user_id, tenant_id, &role_name, RoleChange::Add, None)
            .await?
            .ok_or_else(|| RbacError::Store(StoreError::NotFound("membership".into())))
    }

    /// Removing a role the user does not hold, or from a user with no
    /// membership, succeeds without changes.
    pub async fn remove_role(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role_name: &str,
    ) -> RbacResult<Option<Membership>> {
        Ok(self
            .store
            .change_membership_role(user_id, tenant_id, role_name, RoleChange::Remove, None)
            .await?)
    }

    pub async fn assign_super_admin(
        &self,
        actor_id: Uuid,
        target_user_id: Uuid,
        tenant_id: Uuid,
    ) -> RbacResult<Membership> {
        if !self.is_super_admin(actor_id).await? {
            return Err(RbacError::NotSuperAdmin("assign super admin role"));
        }
        self.guard_initial_super_admin(target_user_id, "assign super admin role to")
            .await?;
        self.ensure_tenant_exists(tenant_id).await?;

        let audit = super_admin_audit(actor_id, target_user_id, tenant_id, RoleChange::Add);
        let membership = self
            .store
            .change_membership_role(
                target_user_id,
                tenant_id,
                SUPER_ADMIN,
                RoleChange::Add,
                Some(audit),
            )
            .await?
            .ok_or_else(|| RbacError::Store(StoreError::NotFound("membership".into())))?;
        tracing::info!(
            actor_id = %actor_id,
            target_user_id = %target_user_id,
            tenant_id = %tenant_id,
            "super admin role assigned"
        );
        Ok(membership)
    }

    pub async fn remove_super_admin(
        &self,
        actor_id: Uuid,
        target_user_id: Uuid,
        tenant_id: Uuid,
    ) -> RbacResult<Option<Membership>> {
        if !self.is_super_admin(actor_id).await? {
            return Err(RbacError::NotSuperAdmin("remove super admin role"));
        }
        self.guard_initial_super_admin(target_user_id, "remove super admin role from")
            .await?;

        let audit = super_admin_audit(actor_id, target_user_id, tenant_id, RoleChange::Remove);
        let membership = self
            .store
            .change_membership_role(
                target_user_id,
                tenant_id,
                SUPER_ADMIN,
                RoleChange::Remove,
                Some(audit),
            )
            .await?;
        tracing::info!(
            actor_id = %actor_id,
            target_user_id = %target_user_id,
            tenant_id = %tenant_id,
            "super admin role removed"
        );
        Ok(membership)
    }

    fn is_initial_super_admin(&self, external_user_id: &str) -> bool {
        self.super_admin_external_id
            .as_deref()
            .is_some_and(|configured| configured.eq_ignore_ascii_case(external_user_id))
    }

    /// Memberships may only reference rows that exist.
    async fn ensure_user_exists(&self, user_id: Uuid) -> RbacResult<()> {
        match self.store.get_user(user_id).await? {
            Some(_) => Ok(()),
            None => Err(RbacError::UserNotFound),
        }
    }

    async fn ensure_tenant_exists(&self, tenant_id: Uuid) -> RbacResult<()> {
        match self.store.get_tenant(tenant_id).await? {
            Some(_) => Ok(()),
            None => Err(RbacError::TenantNotFound),
        }
    }

    async fn guard_initial_super_admin(
        &self,
        target_user_id: Uuid,
        operation: &'static str,
    ) -> RbacResult<()> {
        let target = self
            .store
            .get_user(target_user_id)
            .await?
            .ok_or(RbacError::UserNotFound)?;
        if self.is_initial_super_admin(&target.external_user_id) {
            return Err(RbacError::InitialSuperAdmin(operation));
        }
        Ok(())
    }

    /// Permission sets of every guild role and tenant role named in the
    /// membership.
    async fn role_permissions(&self, membership: &Membership) -> RbacResult<Vec<Vec<String>>> {
        if membership.roles.is_empty() {
            return Ok(Vec::new());
        }

        let external = self
            .store
            .tenant_roles_by_external_ids(membership.tenant_id, &membership.roles)
            .await?;
        let internal = self
            .store
            .internal_roles_by_names(membership.tenant_id, &membership.roles)
            .await?;

        Ok(external
            .into_iter()
            .map(|role| role.permissions)
            .chain(internal.into_iter().map(|role| role.permissions))
            .collect())
    }
}

fn validate_role_name(name: &str) -> RbacResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RbacError::EmptyRoleName);
    }
    Ok(trimmed.to_string())
}

fn super_admin_audit(
    actor_id: Uuid,
    target_user_id: Uuid,
    tenant_id: Uuid,
    change: RoleChange,
) -> NewAuditEntry {
    let (action, reason, old_value, new_value) = match change {
        RoleChange::Add => (
            "assign",
            "Super admin role assigned",
            None,
            Some(json!({ "role": SUPER_ADMIN })),
        ),
        RoleChange::Remove => (
            "remove",
            "Super admin role removed",
            Some(json!({ "role": SUPER_ADMIN })),
            None,
        ),
    };
    NewAuditEntry {
        id: Uuid::new_v4(),
        user_id: target_user_id,
        tenant_id: Some(tenant_id),
        action: action.to_string(),
        resource_type: "system_role".to_string(),
        resource_id: SUPER_ADMIN.to_string(),
        old_value,
        new_value,
        reason: reason.to_string(),
        performed_by: actor_id,
    }
}
