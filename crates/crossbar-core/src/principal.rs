use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::ChannelIdentity;

/// Permission string granting every capability.
pub const GRANT_ALL: &str = "*";

/// Authenticated actor bound to a session.
///
/// Principals are small values copied into sessions rather than shared —
/// the session store is the single source of truth, and nothing holds a
/// live reference back to an authenticator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub identity: ChannelIdentity,
    pub tenant_id: String,
    #[serde(default)]
    pub roles: HashSet<String>,
    #[serde(default)]
    pub permissions: HashSet<String>,
    pub authenticated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Principal {
    /// Base principal for a platform identity: the `user` role and the
    /// conversational permissions every chat actor gets.
    pub fn new(identity: ChannelIdentity, tenant_id: impl Into<String>) -> Self {
        Self {
            identity,
            tenant_id: tenant_id.into(),
            roles: HashSet::from(["user".to_string()]),
            permissions: HashSet::from(["chat.send".to_string(), "chat.read".to_string()]),
            authenticated_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// `"*"` in the permission set grants everything.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(GRANT_ALL) || self.permissions.contains(permission)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether the authentication is still current.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}
