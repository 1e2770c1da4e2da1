use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AuditEntry, Controller, InternalRole, Membership, NewAuditEntry, NewController,
    NewInternalRole, NewMembership, NewTenant, NewTenantRole, NewUser, Tenant, TenantRole, User,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Add,
    Remove,
}

/// Result of a conditional update: the row as it stands afterwards, and
/// whether the mutation was written.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
    pub value: T,
    pub applied: bool,
}

/// Runs against the locked row; returning `false` leaves the row untouched.
pub type ControllerMutation = Box<dyn FnOnce(&mut Controller) -> bool + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_user(&self, user: NewUser) -> StoreResult<User>;
    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    async fn create_tenant(&self, tenant: NewTenant) -> StoreResult<Tenant>;
    async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>>;

    /// Inserts the membership or replaces its role and permission sets.
    async fn upsert_membership(&self, membership: NewMembership) -> StoreResult<Membership>;
    async fn get_membership(&self, user_id: Uuid, tenant_id: Uuid)
        -> StoreResult<Option<Membership>>;
    /// True when any membership of the user carries a super-admin grant.
    async fn has_super_admin_membership(&self, user_id: Uuid) -> StoreResult<bool>;
    /// Adds or removes one role name in a single transaction together with
    /// the optional audit entry. Adding creates the membership when absent;
    /// removing from an absent membership returns `None`.
    async fn change_membership_role(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role: &str,
        change: RoleChange,
        audit: Option<NewAuditEntry>,
    ) -> StoreResult<Option<Membership>>;

    async fn upsert_tenant_role(&self, role: NewTenantRole) -> StoreResult<TenantRole>;
    async fn tenant_roles_by_external_ids(
        &self,
        tenant_id: Uuid,
        external_role_ids: &[String],
    ) -> StoreResult<Vec<TenantRole>>;

    async fn create_internal_role(&self, role: NewInternalRole) -> StoreResult<InternalRole>;
    async fn get_internal_role(&self, role_id: Uuid) -> StoreResult<Option<InternalRole>>;
    async fn list_internal_roles(&self, tenant_id: Uuid) -> StoreResult<Vec<InternalRole>>;
    async fn internal_roles_by_names(
        &self,
        tenant_id: Uuid,
        names: &[String],
    ) -> StoreResult<Vec<InternalRole>>;
    async fn update_internal_role(
        &self,
        role_id: Uuid,
        name: &str,
        permissions: &[String],
    ) -> StoreResult<InternalRole>;
    async fn delete_internal_role(&self, role_id: Uuid) -> StoreResult<()>;

    async fn audit_entries_for_user(&self, user_id: Uuid) -> StoreResult<Vec<AuditEntry>>;

    async fn insert_controller(&self, controller: NewController) -> StoreResult<Controller>;
    async fn get_controller(&self, controller_id: Uuid) -> StoreResult<Option<Controller>>;
    async fn find_controller_by_cluster(&self, cluster_id: &str)
        -> StoreResult<Option<Controller>>;
    async fn list_controllers(&self) -> StoreResult<Vec<Controller>>;
    /// Applies `mutation` to the row while holding its lock.
    async fn update_controller(
        &self,
        controller_id: Uuid,
        mutation: ControllerMutation,
    ) -> StoreResult<Option<Mutation<Controller>>>;
    /// Moves running controllers whose last heartbeat precedes `stale_before`
    /// to `inactive`.
    async fn mark_controllers_inactive(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
    async fn delete_controllers_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

pub(crate) const SUPER_ADMIN_GRANTS: [&str; 2] = ["*", "superadmin"];

pub(crate) fn apply_role_change(roles: &mut Vec<String>, role: &str, change: RoleChange) -> bool {
    match change {
        RoleChange::Add => {
            if roles.iter().any(|existing| existing == role) {
                false
            } else {
                roles.push(role.to_string());
                true
            }
        }
        RoleChange::Remove => {
            let before = roles.len();
            roles.retain(|existing| existing != role);
            roles.len() != before
        }
    }
}
