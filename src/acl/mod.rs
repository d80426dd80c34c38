//! ACL (Access Control List) Module
//!
//! Topic-based authorization with support for:
//! - MQTT wildcards (# and +)
//! - Variable substitution (%c = client_id, %u = username)
//! - Role-based permissions, with a default rule set for users without one

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::{Access, AccessRequest, AuthError, AuthService, Authority};
use crate::config::{AclConfig, AclPermissions};
use crate::topic::topic_matches_filter;

#[cfg(test)]
mod tests;

/// Authorizer backed by the `[acl]` section
pub struct AclAuthorizer {
    enabled: bool,
    roles: HashMap<String, AclPermissions>,
    /// Username -> role name
    user_roles: HashMap<String, String>,
    default: AclPermissions,
}

impl AclAuthorizer {
    pub fn new(config: &AclConfig, user_roles: HashMap<String, String>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclPermissions {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            user_roles,
            default: config.default.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn expand(pattern: &str, client_id: &str, username: Option<&str>) -> String {
        pattern
            .replace("%c", client_id)
            .replace("%u", username.unwrap_or(""))
    }

    /// Whether every topic `filter` can match is also matched by `pattern`
    fn pattern_covers_filter(pattern: &str, filter: &str) -> bool {
        let mut pattern_levels = pattern.split('/');
        let mut filter_levels = filter.split('/');

        loop {
            match (pattern_levels.next(), filter_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(f)) if f != "#" => {}
                (Some(p), Some(f)) if p == f && p != "+" => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    fn check(
        patterns: &[String],
        topic: &str,
        access: Access,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        patterns.iter().any(|pattern| {
            let pattern = Self::expand(pattern, client_id, username);
            match access {
                Access::Subscribe => Self::pattern_covers_filter(&pattern, topic),
                _ => topic_matches_filter(topic, &pattern),
            }
        })
    }

    fn patterns(perms: &AclPermissions, access: Access) -> &[String] {
        match access {
            Access::Subscribe => &perms.subscribe,
            _ => &perms.publish,
        }
    }

    fn permissions_for(&self, username: Option<&str>) -> Option<&AclPermissions> {
        let role = self.user_roles.get(username?)?;
        self.roles.get(role)
    }

    /// Role rules first, then the default rules; deny when nothing matches
    pub fn decide(&self, request: &AccessRequest<'_>) -> Authority {
        if !self.enabled || request.access == Access::Connect {
            return Authority::Allow;
        }

        let allowed = self
            .permissions_for(request.username)
            .into_iter()
            .chain(std::iter::once(&self.default))
            .any(|perms| {
                Self::check(
                    Self::patterns(perms, request.access),
                    request.topic,
                    request.access,
                    request.client_id,
                    request.username,
                )
            });

        if allowed {
            Authority::Allow
        } else {
            debug!(
                "ACL denied {} on '{}' for client {}",
                request.access.as_str(),
                request.topic,
                request.client_id
            );
            Authority::Deny
        }
    }
}

#[async_trait]
impl AuthService for AclAuthorizer {
    async fn authenticate(&self, _: Option<&str>, _: Option<&[u8]>) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize(&self, request: &AccessRequest<'_>) -> Result<Authority, AuthError> {
        Ok(self.decide(request))
    }
}
