use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::exists;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::upsert::excluded;
use uuid::Uuid;

use super::{
    apply_role_change, ControllerMutation, Mutation, RoleChange, Store, StoreError, StoreResult,
    SUPER_ADMIN_GRANTS,
};
use crate::db::PgPool;
use crate::models::{
    AuditEntry, Controller, ControllerChangeset, ControllerStatus, InternalRole, Membership,
    NewAuditEntry, NewController, NewInternalRole, NewMembership, NewTenant, NewTenantRole,
    NewUser, Tenant, TenantRole, User,
};
use crate::schema::{
    audit_entries, controllers, internal_roles, memberships, tenant_roles, tenants, users,
};

impl From<DieselError> for StoreError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                StoreError::NotFound("Referenced record".into())
            }
            DieselError::NotFound => StoreError::NotFound("row".into()),
            other => StoreError::Unexpected(other.into()),
        }
    }
}

/// Diesel-backed store. Blocking queries run on the blocking thread pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| StoreError::Unexpected(anyhow!("database pool error: {err}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Unexpected(anyhow!("database task panicked: {err}")))?
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_user(&self, user: NewUser) -> StoreResult<User> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            Ok(diesel::insert_into(users::table)
                .values(&user)
                .on_conflict(users::external_user_id)
                .do_update()
                .set((&user, users::updated_at.eq(now)))
                .returning(User::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        self.with_conn(move |conn| {
            Ok(users::table
                .find(user_id)
                .select(User::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn create_tenant(&self, tenant: NewTenant) -> StoreResult<Tenant> {
        self.with_conn(move |conn| {
            Ok(diesel::insert_into(tenants::table)
                .values(&tenant)
                .returning(Tenant::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        self.with_conn(move |conn| {
            Ok(tenants::table
                .find(tenant_id)
                .select(Tenant::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn upsert_membership(&self, membership: NewMembership) -> StoreResult<Membership> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            Ok(diesel::insert_into(memberships::table)
                .values(&membership)
                .on_conflict((memberships::user_id, memberships::tenant_id))
                .do_update()
                .set((
                    memberships::roles.eq(excluded(memberships::roles)),
                    memberships::permissions.eq(excluded(memberships::permissions)),
                    memberships::updated_at.eq(now),
                ))
                .returning(Membership::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn get_membership(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        self.with_conn(move |conn| {
            Ok(memberships::table
                .filter(memberships::user_id.eq(user_id))
                .filter(memberships::tenant_id.eq(tenant_id))
                .select(Membership::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn has_super_admin_membership(&self, user_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let grants: Vec<String> = SUPER_ADMIN_GRANTS.iter().map(|g| g.to_string()).collect();
            let query = memberships::table
                .filter(memberships::user_id.eq(user_id))
                .filter(
                    memberships::permissions
                        .overlaps_with(grants)
                        .or(memberships::roles.contains(vec!["superadmin".to_string()])),
                );
            Ok(diesel::select(exists(query)).get_result::<bool>(conn)?)
        })
        .await
    }

    async fn change_membership_role(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role: &str,
        change: RoleChange,
        audit: Option<NewAuditEntry>,
    ) -> StoreResult<Option<Membership>> {
        let role = role.to_string();
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                if change == RoleChange::Add {
                    diesel::insert_into(memberships::table)
                        .values(&NewMembership {
                            id: Uuid::new_v4(),
                            user_id,
                            tenant_id,
                            roles: Vec::new(),
                            permissions: Vec::new(),
                        })
                        .on_conflict((memberships::user_id, memberships::tenant_id))
                        .do_nothing()
                        .execute(conn)?;
                }

                let existing = memberships::table
                    .filter(memberships::user_id.eq(user_id))
                    .filter(memberships::tenant_id.eq(tenant_id))
                    .for_update()
                    .select(Membership::as_select())
                    .first(conn)
                    .optional()?;

                let result = match existing {
                    Some(mut membership) => {
                        if apply_role_change(&mut membership.roles, &role, change) {
                            membership = diesel::update(memberships::table.find(membership.id))
                                .set((
                                    memberships::roles.eq(membership.roles.clone()),
                                    memberships::updated_at.eq(Utc::now()),
                                ))
                                .returning(Membership::as_returning())
                                .get_result(conn)?;
                        }
                        Some(membership)
                    }
                    None => None,
                };

                if let Some(entry) = audit {
                    diesel::insert_into(audit_entries::table)
                        .values(&entry)
                        .execute(conn)?;
                }

                Ok(result)
            })
        })
        .await
    }

    async fn upsert_tenant_role(&self, role: NewTenantRole) -> StoreResult<TenantRole> {
        self.with_conn(move |conn| {
            Ok(diesel::insert_into(tenant_roles::table)
                .values(&role)
                .on_conflict((tenant_roles::tenant_id, tenant_roles::external_role_id))
                .do_update()
                .set((
                    tenant_roles::name.eq(excluded(tenant_roles::name)),
                    tenant_roles::color.eq(excluded(tenant_roles::color)),
                    tenant_roles::position.eq(excluded(tenant_roles::position)),
                    tenant_roles::permissions.eq(excluded(tenant_roles::permissions)),
                    tenant_roles::mentionable.eq(excluded(tenant_roles::mentionable)),
                    tenant_roles::hoisted.eq(excluded(tenant_roles::hoisted)),
                    tenant_roles::updated_at.eq(Utc::now()),
                ))
                .returning(TenantRole::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn tenant_roles_by_external_ids(
        &self,
        tenant_id: Uuid,
        external_role_ids: &[String],
    ) -> StoreResult<Vec<TenantRole>> {
        let ids = external_role_ids.to_vec();
        self.with_conn(move |conn| {
            Ok(tenant_roles::table
                .filter(tenant_roles::tenant_id.eq(tenant_id))
                .filter(tenant_roles::external_role_id.eq_any(ids))
                .select(TenantRole::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn create_internal_role(&self, role: NewInternalRole) -> StoreResult<InternalRole> {
        self.with_conn(move |conn| {
            Ok(diesel::insert_into(internal_roles::table)
                .values(&role)
                .returning(InternalRole::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn get_internal_role(&self, role_id: Uuid) -> StoreResult<Option<InternalRole>> {
        self.with_conn(move |conn| {
            Ok(internal_roles::table
                .find(role_id)
                .select(InternalRole::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn list_internal_roles(&self, tenant_id: Uuid) -> StoreResult<Vec<InternalRole>> {
        self.with_conn(move |conn| {
            Ok(internal_roles::table
                .filter(internal_roles::tenant_id.eq(tenant_id))
                .order(internal_roles::name.asc())
                .select(InternalRole::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn internal_roles_by_names(
        &self,
        tenant_id: Uuid,
        names: &[String],
    ) -> StoreResult<Vec<InternalRole>> {
        let names = names.to_vec();
        self.with_conn(move |conn| {
            Ok(internal_roles::table
                .filter(internal_roles::tenant_id.eq(tenant_id))
                .filter(internal_roles::name.eq_any(names))
                .select(InternalRole::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn update_internal_role(
        &self,
        role_id: Uuid,
        name: &str,
        permissions: &[String],
    ) -> StoreResult<InternalRole> {
        let name = name.to_string();
        let permissions = permissions.to_vec();
        self.with_conn(move |conn| {
            diesel::update(internal_roles::table.find(role_id))
                .set((
                    internal_roles::name.eq(name),
                    internal_roles::permissions.eq(permissions),
                    internal_roles::updated_at.eq(Utc::now()),
                ))
                .returning(InternalRole::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("role".into()))
        })
        .await
    }

    async fn delete_internal_role(&self, role_id: Uuid) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let deleted = diesel::delete(internal_roles::table.find(role_id)).execute(conn)?;
            if deleted == 0 {
                return Err(StoreError::NotFound("role".into()));
            }
            Ok(())
        })
        .await
    }

    async fn audit_entries_for_user(&self, user_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        self.with_conn(move |conn| {
            Ok(audit_entries::table
                .filter(audit_entries::user_id.eq(user_id))
                .order(audit_entries::created_at.asc())
                .select(AuditEntry::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn insert_controller(&self, controller: NewController) -> StoreResult<Controller> {
        self.with_conn(move |conn| {
            Ok(diesel::insert_into(controllers::table)
                .values(&controller)
                .returning(Controller::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn get_controller(&self, controller_id: Uuid) -> StoreResult<Option<Controller>> {
        self.with_conn(move |conn| {
            Ok(controllers::table
                .find(controller_id)
                .select(Controller::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn find_controller_by_cluster(
        &self,
        cluster_id: &str,
    ) -> StoreResult<Option<Controller>> {
        let cluster_id = cluster_id.to_string();
        self.with_conn(move |conn| {
            Ok(controllers::table
                .filter(controllers::cluster_id.eq(cluster_id))
                .select(Controller::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn list_controllers(&self) -> StoreResult<Vec<Controller>> {
        self.with_conn(move |conn| {
            Ok(controllers::table
                .order(controllers::created_at.asc())
                .select(Controller::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn update_controller(
        &self,
        controller_id: Uuid,
        mutation: ControllerMutation,
    ) -> StoreResult<Option<Mutation<Controller>>> {
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let Some(current) = controllers::table
                    .find(controller_id)
                    .for_update()
                    .select(Controller::as_select())
                    .first(conn)
                    .optional()?
                else {
                    return Ok(None);
                };

                let mut candidate = current.clone();
                if !mutation(&mut candidate) {
                    return Ok(Some(Mutation {
                        value: current,
                        applied: false,
                    }));
                }

                let updated = diesel::update(controllers::table.find(controller_id))
                    .set(ControllerChangeset::from(&candidate))
                    .returning(Controller::as_returning())
                    .get_result(conn)?;
                Ok(Some(Mutation {
                    value: updated,
                    applied: true,
                }))
            })
        })
        .await
    }

    async fn mark_controllers_inactive(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let running = vec![
                ControllerStatus::Active,
                ControllerStatus::Degraded,
                ControllerStatus::Error,
            ];
            let marked = diesel::update(
                controllers::table
                    .filter(controllers::status.eq_any(running))
                    .filter(controllers::last_heartbeat.le(stale_before)),
            )
            .set((
                controllers::status.eq(ControllerStatus::Inactive),
                controllers::updated_at.eq(now),
            ))
            .execute(conn)?;
            Ok(marked as u64)
        })
        .await
    }

    async fn delete_controllers_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let deleted =
                diesel::delete(controllers::table.filter(controllers::last_heartbeat.lt(cutoff)))
                    .execute(conn)?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
