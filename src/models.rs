use std::fmt;
use std::io::Write;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::{Pg, PgValue},
    prelude::*,
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Text,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub external_user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Profile fields written on every successful login.
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub external_user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub external_guild_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub owner_user_id: Uuid,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = tenants)]
pub struct NewTenant {
    pub id: Uuid,
    pub external_guild_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub owner_user_id: Uuid,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = memberships)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = memberships)]
pub struct NewMembership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

/// Role mirrored from the guild's external role list.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = tenant_roles)]
pub struct TenantRole {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_role_id: String,
    pub name: String,
    pub color: i32,
    pub position: i32,
    pub permissions: Vec<String>,
    pub mentionable: bool,
    pub hoisted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = tenant_roles)]
pub struct NewTenantRole {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_role_id: String,
    pub name: String,
    pub color: i32,
    pub position: i32,
    pub permissions: Vec<String>,
    pub mentionable: bool,
    pub hoisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = internal_roles)]
pub struct InternalRole {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub permissions: Vec<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = internal_roles)]
pub struct NewInternalRole {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub permissions: Vec<String>,
    pub is_system: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    PendingApproval,
    Active,
    Inactive,
    Error,
    Degraded,
    Rejected,
}

impl ControllerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ControllerStatus::PendingApproval => "pending_approval",
            ControllerStatus::Active => "active",
            ControllerStatus::Inactive => "inactive",
            ControllerStatus::Error => "error",
            ControllerStatus::Degraded => "degraded",
            ControllerStatus::Rejected => "rejected",
        }
    }

    /// Statuses a controller may report about itself in a heartbeat.
    pub const fn is_reportable(self) -> bool {
        matches!(
            self,
            ControllerStatus::Active | ControllerStatus::Degraded | ControllerStatus::Error
        )
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown controller status `{0}`")]
pub struct UnknownControllerStatus(pub String);

impl FromStr for ControllerStatus {
    type Err = UnknownControllerStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending_approval" => Ok(ControllerStatus::PendingApproval),
            "active" => Ok(ControllerStatus::Active),
            "inactive" => Ok(ControllerStatus::Inactive),
            "error" => Ok(ControllerStatus::Error),
            "degraded" => Ok(ControllerStatus::Degraded),
            "rejected" => Ok(ControllerStatus::Rejected),
            other => Err(UnknownControllerStatus(other.to_string())),
        }
    }
}

impl ToSql<Text, Pg> for ControllerStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for ControllerStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = controllers)]
pub struct Controller {
    pub id: Uuid,
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ControllerStatus,
    #[serde(skip)]
    pub handshake_token: String,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = controllers)]
pub struct NewController {
    pub id: Uuid,
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ControllerStatus,
    pub handshake_token: String,
}

/// Mutable controller columns written back after an in-transaction update.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = controllers, treat_none_as_null = true)]
pub struct ControllerChangeset<'a> {
    pub cluster_name: &'a str,
    pub version: &'a str,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ControllerStatus,
    pub handshake_token: &'a str,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl<'a> From<&'a Controller> for ControllerChangeset<'a> {
    fn from(value: &'a Controller) -> Self {
        Self {
            cluster_name: &value.cluster_name,
            version: &value.version,
            last_heartbeat: value.last_heartbeat,
            status: value.status,
            handshake_token: &value.handshake_token,
            approved_at: value.approved_at,
            approved_by: value.approved_by,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = audit_entries)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: String,
    pub performed_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = audit_entries)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: String,
    pub performed_by: Uuid,
}

#[cfg(test)]
mod tests {
    use super::ControllerStatus;

    #[test]
    fn controller_status_wire_names_round_trip() {
        for status in [
            ControllerStatus::PendingApproval,
            ControllerStatus::Active,
            ControllerStatus::Inactive,
            ControllerStatus::Error,
            ControllerStatus::Degraded,
            ControllerStatus::Rejected,
        ] {
            let encoded = serde_json::to_value(status).unwrap();
            assert_eq!(encoded, serde_json::json!(status.as_str()));
            assert_eq!(status.as_str().parse::<ControllerStatus>().unwrap(), status);
        }
        assert!("online".parse::<ControllerStatus>().is_err());
    }

    #[test]
    fn only_running_states_are_reportable() {
        assert!(ControllerStatus::Active.is_reportable());
        assert!(ControllerStatus::Degraded.is_reportable());
        assert!(ControllerStatus::Error.is_reportable());
        assert!(!ControllerStatus::PendingApproval.is_reportable());
        assert!(!ControllerStatus::Inactive.is_reportable());
        assert!(!ControllerStatus::Rejected.is_reportable());
    }
}
