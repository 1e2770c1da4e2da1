//! Permission strings.
//!
//! A permission is `resource:action` in lowercase, or one of the two
//! reserved sentinels. `*` may stand in for either half.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WILDCARD: &str = "*";
pub const SUPER_ADMIN: &str = "superadmin";

pub const SERVER_CREATE: &str = "server:create";
pub const SERVER_READ: &str = "server:read";
pub const SERVER_WRITE: &str = "server:write";
pub const SERVER_DELETE: &str = "server:delete";
pub const SERVER_START: &str = "server:start";
pub const SERVER_STOP: &str = "server:stop";
pub const SERVER_RESTART: &str = "server:restart";
pub const CONSOLE_READ: &str = "console:read";
pub const CONSOLE_WRITE: &str = "console:write";
pub const FILE_READ: &str = "file:read";
pub const FILE_WRITE: &str = "file:write";
pub const BACKUP_CREATE: &str = "backup:create";
pub const BACKUP_RESTORE: &str = "backup:restore";
pub const LOG_READ: &str = "log:read";
pub const TEMPLATE_READ: &str = "template:read";
pub const TEMPLATE_WRITE: &str = "template:write";
pub const USER_READ: &str = "user:read";
pub const USER_WRITE: &str = "user:write";
pub const ROLE_READ: &str = "role:read";
pub const ROLE_WRITE: &str = "role:write";
pub const ROLE_DELETE: &str = "role:delete";

/// Permission every member needs to see a tenant at all.
pub const TENANT_ACCESS: &str = "read";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid permission `{0}`: expected lowercase resource:action")]
pub struct InvalidPermission(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    Wildcard,
    SuperAdmin,
    TenantAccess,
    Scoped { resource: String, action: String },
}

impl Permission {
    pub fn parse(raw: &str) -> Result<Self, InvalidPermission> {
        match raw {
            WILDCARD => return Ok(Permission::Wildcard),
            SUPER_ADMIN => return Ok(Permission::SuperAdmin),
            TENANT_ACCESS => return Ok(Permission::TenantAccess),
            _ => {}
        }

        let (resource, action) = raw
            .split_once(':')
            .ok_or_else(|| InvalidPermission(raw.to_string()))?;
        if !is_segment(resource) || !is_segment(action) {
            return Err(InvalidPermission(raw.to_string()));
        }
        Ok(Permission::Scoped {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }

    fn resource(&self) -> &str {
        match self {
            Permission::Wildcard => WILDCARD,
            Permission::SuperAdmin => SUPER_ADMIN,
            Permission::TenantAccess => TENANT_ACCESS,
            Permission::Scoped { resource, .. } => resource,
        }
    }

    fn action(&self) -> &str {
        match self {
            Permission::Wildcard => WILDCARD,
            Permission::SuperAdmin | Permission::TenantAccess => "",
            Permission::Scoped { action, .. } => action,
        }
    }

    /// Equality, or a wildcard resource on either side, or the same
    /// resource with a wildcard action on either side.
    pub fn matches(&self, other: &Permission) -> bool {
        if self == other {
            return true;
        }
        if matches!(self, Permission::TenantAccess) || matches!(other, Permission::TenantAccess) {
            return matches!(self, Permission::Wildcard) || matches!(other, Permission::Wildcard);
        }
        let (left, right) = (self.resource(), other.resource());
        if left == WILDCARD || right == WILDCARD {
            return true;
        }
        left == right && (self.action() == WILDCARD || other.action() == WILDCARD)
    }
}

fn is_segment(segment: &str) -> bool {
    segment == WILDCARD
        || (!segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'))
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Wildcard => f.write_str(WILDCARD),
            Permission::SuperAdmin => f.write_str(SUPER_ADMIN),
            Permission::TenantAccess => f.write_str(TENANT_ACCESS),
            Permission::Scoped { resource, action } => write!(f, "{resource}:{action}"),
        }
    }
}

impl FromStr for Permission {
    type Err = InvalidPermission;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Permission::parse(value)
    }
}

impl TryFrom<String> for Permission {
    type Error = InvalidPermission;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Permission::parse(&value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.to_string()
    }
}

/// Exact-or-wildcard grant check over a stored permission set.
pub fn grants(held: &[String], permission: &str) -> bool {
    held.iter()
        .any(|grant| grant == permission || grant == WILDCARD)
}

/// Validates and normalises a list of permission strings, dropping duplicates.
/// Besides `resource:action` this accepts the `*` and `superadmin` sentinels
/// and the bare tenant access grant, so tenant roles can hand out access.
pub fn normalize(raw: &[String]) -> Result<Vec<String>, InvalidPermission> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for value in raw {
        let parsed = Permission::parse(value.trim())?.to_string();
        if !out.contains(&parsed) {
            out.push(parsed);
        }
    }
    Ok(out)
}
