//! In-memory store backed by `HashMap`s behind one `tokio::sync::RwLock`.
//!
//! Every mutation takes the write lock for its whole duration, which gives
//! the same all-or-nothing behaviour the Postgres backend gets from
//! transactions. State is lost on restart; this backend serves tests and
//! local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    apply_role_change, ControllerMutation, Mutation, RoleChange, Store, StoreError, StoreResult,
    SUPER_ADMIN_GRANTS,
};
use crate::models::{
    AuditEntry, Controller, ControllerStatus, InternalRole, Membership, NewAuditEntry,
    NewController, NewInternalRole, NewMembership, NewTenant, NewTenantRole, NewUser, Tenant,
    TenantRole, User,
};

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    tenants: HashMap<Uuid, Tenant>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    tenant_roles: HashMap<Uuid, TenantRole>,
    internal_roles: HashMap<Uuid, InternalRole>,
    controllers: HashMap<Uuid, Controller>,
    audit: Vec<AuditEntry>,
}

impl State {
    /// Mirrors the foreign keys on `memberships`.
    fn check_membership_refs(&self, user_id: Uuid, tenant_id: Uuid) -> StoreResult<()> {
        if self.users.contains_key(&user_id) && self.tenants.contains_key(&tenant_id) {
            Ok(())
        } else {
            Err(StoreError::NotFound("Referenced record".into()))
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    fail_audit_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent audit write fail, for exercising rollback.
    pub fn set_fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    fn write_audit(&self, state: &mut State, entry: NewAuditEntry) -> StoreResult<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unexpected(anyhow!("audit log unavailable")));
        }
        state.audit.push(AuditEntry {
            id: entry.id,
            user_id: entry.user_id,
            tenant_id: entry.tenant_id,
            action: entry.action,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            old_value: entry.old_value,
            new_value: entry.new_value,
            reason: entry.reason,
            performed_by: entry.performed_by,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_user(&self, user: NewUser) -> StoreResult<User> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        if let Some(existing) = state
            .users
            .values_mut()
            .find(|existing| existing.external_user_id == user.external_user_id)
        {
            existing.display_name = user.display_name;
            if user.avatar.is_some() {
                existing.avatar = user.avatar;
            }
            if user.email.is_some() {
                existing.email = user.email;
            }
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let created = User {
            id: Uuid::new_v4(),
            external_user_id: user.external_user_id,
            display_name: user.display_name,
            avatar: user.avatar,
            email: user.email,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn create_tenant(&self, tenant: NewTenant) -> StoreResult<Tenant> {
        let mut state = self.state.write().await;
        if state
            .tenants
            .values()
            .any(|existing| existing.external_guild_id == tenant.external_guild_id)
        {
            return Err(StoreError::Conflict(format!(
                "tenant for guild {} already exists",
                tenant.external_guild_id
            )));
        }
        let now = Utc::now();
        let created = Tenant {
            id: tenant.id,
            external_guild_id: tenant.external_guild_id,
            name: tenant.name,
            icon: tenant.icon,
            owner_user_id: tenant.owner_user_id,
            config: tenant.config,
            created_at: now,
            updated_at: now,
        };
        state.tenants.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.state.read().await.tenants.get(&tenant_id).cloned())
    }

    async fn upsert_membership(&self, membership: NewMembership) -> StoreResult<Membership> {
        let mut state = self.state.write().await;
        state.check_membership_refs(membership.user_id, membership.tenant_id)?;
        let now = Utc::now();
        let key = (membership.user_id, membership.tenant_id);
        let entry = state.memberships.entry(key).or_insert_with(|| Membership {
            id: membership.id,
            user_id: membership.user_id,
            tenant_id: membership.tenant_id,
            roles: Vec::new(),
            permissions: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        entry.roles = membership.roles;
        entry.permissions = membership.permissions;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn get_membership(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        Ok(self
            .state
            .read()
            .await
            .memberships
            .get(&(user_id, tenant_id))
            .cloned())
    }

    async fn has_super_admin_membership(&self, user_id: Uuid) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .values()
            .filter(|membership| membership.user_id == user_id)
            .any(|membership| {
                membership
                    .permissions
                    .iter()
                    .any(|grant| SUPER_ADMIN_GRANTS.contains(&grant.as_str()))
                    || membership.roles.iter().any(|role| role == "superadmin")
            }))
    }

    async fn change_membership_role(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role: &str,
        change: RoleChange,
        audit: Option<NewAuditEntry>,
    ) -> StoreResult<Option<Membership>> {
        let mut state = self.state.write().await;
        let key = (user_id, tenant_id);
        let now = Utc::now();

        let mut updated = match (state.memberships.get(&key).cloned(), change) {
            (Some(existing), _) => Some(existing),
            (None, RoleChange::Add) => {
                state.check_membership_refs(user_id, tenant_id)?;
                Some(Membership {
                    id: Uuid::new_v4(),
                    user_id,
                    tenant_id,
                    roles: Vec::new(),
                    permissions: Vec::new(),
                    created_at: now,
                    updated_at: now,
                })
            }
            (None, RoleChange::Remove) => None,
        };

        if let Some(membership) = updated.as_mut() {
            if apply_role_change(&mut membership.roles, role, change) {
                membership.updated_at = now;
            }
        }

        // Audit first so a failed write leaves the membership untouched.
        if let Some(entry) = audit {
            self.write_audit(&mut state, entry)?;
        }
        if let Some(membership) = updated.as_ref() {
            state.memberships.insert(key, membership.clone());
        }
        Ok(updated)
    }

    async fn upsert_tenant_role(&self, role: NewTenantRole) -> StoreResult<TenantRole> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let existing_id = state
            .tenant_roles
            .values()
            .find(|existing| {
                existing.tenant_id == role.tenant_id
                    && existing.external_role_id == role.external_role_id
            })
            .map(|existing| (existing.id, existing.created_at));
        let (id, created_at) = existing_id.unwrap_or((role.id, now));
        let stored = TenantRole {
            id,
            tenant_id: role.tenant_id,
            external_role_id: role.external_role_id,
            name: role.name,
            color: role.color,
            position: role.position,
            permissions: role.permissions,
            mentionable: role.mentionable,
            hoisted: role.hoisted,
            created_at,
            updated_at: now,
        };
        state.tenant_roles.insert(id, stored.clone());
        Ok(stored)
    }

    async fn tenant_roles_by_external_ids(
        &self,
        tenant_id: Uuid,
        external_role_ids: &[String],
    ) -> StoreResult<Vec<TenantRole>> {
        let state = self.state.read().await;
        Ok(state
            .tenant_roles
            .values()
            .filter(|role| role.tenant_id == tenant_id)
            .filter(|role| external_role_ids.contains(&role.external_role_id))
            .cloned()
            .collect())
    }

    async fn create_internal_role(&self, role: NewInternalRole) -> StoreResult<InternalRole> {
        let mut state = self.state.write().await;
        if state
            .internal_roles
            .values()
            .any(|existing| existing.tenant_id == role.tenant_id && existing.name == role.name)
        {
            return Err(StoreError::Conflict(format!(
                "role {} already exists",
                role.name
            )));
        }
        let now = Utc::now();
        let created = InternalRole {
            id: role.id,
            tenant_id: role.tenant_id,
            name: role.name,
            permissions: role.permissions,
            is_system: role.is_system,
            created_at: now,
            updated_at: now,
        };
        state.internal_roles.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_internal_role(&self, role_id: Uuid) -> StoreResult<Option<InternalRole>> {
        Ok(self.state.read().await.internal_roles.get(&role_id).cloned())
    }

    async fn list_internal_roles(&self, tenant_id: Uuid) -> StoreResult<Vec<InternalRole>> {
        let state = self.state.read().await;
        let mut roles: Vec<InternalRole> = state
            .internal_roles
            .values()
            .filter(|role| role.tenant_id == tenant_id)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn internal_roles_by_names(
        &self,
        tenant_id: Uuid,
        names: &[String],
    ) -> StoreResult<Vec<InternalRole>> {
        let state = self.state.read().await;
        Ok(state
            .internal_roles
            .values()
            .filter(|role| role.tenant_id == tenant_id && names.contains(&role.name))
            .cloned()
            .collect())
    }

    async fn update_internal_role(
        &self,
        role_id: Uuid,
        name: &str,
        permissions: &[String],
    ) -> StoreResult<InternalRole> {
        let mut state = self.state.write().await;
        let tenant_id = state
            .internal_roles
            .get(&role_id)
            .map(|role| role.tenant_id)
            .ok_or_else(|| StoreError::NotFound("role".into()))?;
        if state.internal_roles.values().any(|other| {
            other.id != role_id && other.tenant_id == tenant_id && other.name == name
        }) {
            return Err(StoreError::Conflict(format!("role {name} already exists")));
        }
        let role = state
            .internal_roles
            .get_mut(&role_id)
            .ok_or_else(|| StoreError::NotFound("role".into()))?;
        role.name = name.to_string();
        role.permissions = permissions.to_vec();
        role.updated_at = Utc::now();
        Ok(role.clone())
    }

    async fn delete_internal_role(&self, role_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .internal_roles
            .remove(&role_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound("role".into()))
    }

    async fn audit_entries_for_user(&self, user_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_controller(&self, controller: NewController) -> StoreResult<Controller> {
        let mut state = self.state.write().await;
        if state
            .controllers
            .values()
            .any(|existing| existing.cluster_id == controller.cluster_id)
        {
            return Err(StoreError::Conflict(format!(
                "controller for cluster {} already exists",
                controller.cluster_id
            )));
        }
        let now = Utc::now();
        let created = Controller {
            id: controller.id,
            cluster_id: controller.cluster_id,
            cluster_name: controller.cluster_name,
            version: controller.version,
            last_heartbeat: controller.last_heartbeat,
            status: controller.status,
            handshake_token: controller.handshake_token,
            approved_at: None,
            approved_by: None,
            created_at: now,
            updated_at: now,
        };
        state.controllers.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_controller(&self, controller_id: Uuid) -> StoreResult<Option<Controller>> {
        Ok(self.state.read().await.controllers.get(&controller_id).cloned())
    }

    async fn find_controller_by_cluster(
        &self,
        cluster_id: &str,
    ) -> StoreResult<Option<Controller>> {
        let state = self.state.read().await;
        Ok(state
            .controllers
            .values()
            .find(|controller| controller.cluster_id == cluster_id)
            .cloned())
    }

    async fn list_controllers(&self) -> StoreResult<Vec<Controller>> {
        let state = self.state.read().await;
        let mut controllers: Vec<Controller> = state.controllers.values().cloned().collect();
        controllers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(controllers)
    }

    async fn update_controller(
        &self,
        controller_id: Uuid,
        mutation: ControllerMutation,
    ) -> StoreResult<Option<Mutation<Controller>>> {
        let mut state = self.state.write().await;
        let Some(stored) = state.controllers.get_mut(&controller_id) else {
            return Ok(None);
        };
        let mut candidate = stored.clone();
        let applied = mutation(&mut candidate);
        if applied {
            *stored = candidate;
        }
        Ok(Some(Mutation {
            value: stored.clone(),
            applied,
        }))
    }

    async fn mark_controllers_inactive(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for controller in state.controllers.values_mut() {
            if controller.status.is_reportable() && controller.last_heartbeat <= stale_before {
                controller.status = ControllerStatus::Inactive;
                controller.updated_at = now;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn delete_controllers_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let before = state.controllers.len();
        state
            .controllers
            .retain(|_, controller| controller.last_heartbeat >= cutoff);
        Ok((before - state.controllers.len()) as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
