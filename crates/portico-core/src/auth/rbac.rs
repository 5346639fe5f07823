//! Role-based access control over matched routes.
//!
//! Permissions are `action:resource` strings where either side may be `*`.
//! Roles bundle permissions, users map to roles, and route patterns declare
//! which permissions they require. The engine compiles its route patterns
//! with the same matcher the path router uses, so glob semantics agree.
//!
//! When several route patterns match a path, only the single most specific
//! one binds (fewest wildcards, then longest pattern); a specific pattern
//! fully overrides a general one rather than stacking requirements on top
//! of it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    errors::GatewayError,
    router::{compile_matcher, PatternError},
    types::Principal,
};

/// RBAC configuration failures, reported at config load time.
#[derive(Error, Debug)]
pub enum RbacError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// A role name is referenced but never defined under `roles`.
    #[error("unknown role {role:?} referenced by {referenced_by}")]
    UnknownRole { role: String, referenced_by: String },
}

/// Raw RBAC configuration as it appears in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RbacSettings {
    /// Role name -> permission names.
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
    /// User id -> role names.
    #[serde(default)]
    pub user_roles: HashMap<String, Vec<String>>,
    /// Role granted to any authenticated user with no explicit mapping.
    #[serde(default)]
    pub default_role: Option<String>,
    /// Route pattern -> required permissions.
    #[serde(default)]
    pub route_permissions: HashMap<String, Vec<String>>,
    /// `true`: any listed permission suffices. `false`: all are required.
    #[serde(default = "default_allow_any")]
    pub allow_any_permission: bool,
}

fn default_allow_any() -> bool {
    true
}

impl RbacSettings {
    /// Checks referential integrity: `default_role` and every role named in
    /// `user_roles` must be defined under `roles`.
    ///
    /// # Errors
    ///
    /// [`RbacError::UnknownRole`] naming the dangling reference.
    pub fn validate(&self) -> Result<(), RbacError> {
        if let Some(default) = &self.default_role {
            if !self.roles.contains_key(default) {
                return Err(RbacError::UnknownRole {
                    role: default.clone(),
                    referenced_by: "default_role".to_string(),
                });
            }
        }
        for (user, roles) in &self.user_roles {
            for role in roles {
                if !self.roles.contains_key(role) {
                    return Err(RbacError::UnknownRole {
                        role: role.clone(),
                        referenced_by: format!("user_roles entry for {user:?}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Checks whether `held` satisfies `required`, honouring `*` wildcards on
/// either side of the colon in the held permission.
fn permission_matches(held: &str, required: &str) -> bool {
    let Some((held_action, held_resource)) = held.split_once(':') else {
        return held == required;
    };
    let Some((req_action, req_resource)) = required.split_once(':') else {
        return false;
    };
    (held_action == "*" || held_action == req_action) &&
        (held_resource == "*" || held_resource == req_resource)
}

struct RouteRule {
    pattern: String,
    matcher: Box<dyn Fn(&str) -> bool + Send + Sync>,
    required: Vec<String>,
}

/// Compiled RBAC engine.
pub struct RbacEngine {
    roles: HashMap<String, Vec<String>>,
    user_roles: HashMap<String, Vec<String>>,
    default_role: Option<String>,
    routes: Vec<RouteRule>,
    allow_any_permission: bool,
}

impl RbacEngine {
    /// Compiles the settings, validating role references and route patterns
    /// eagerly.
    ///
    /// Routes are ordered by specificity (fewest `*` characters, then
    /// longest pattern, then lexically for determinism) so authorization
    /// checks only the first, most specific match.
    ///
    /// # Errors
    ///
    /// [`RbacError`] for a dangling role reference or an uncompilable route
    /// pattern.
    pub fn new(settings: &RbacSettings) -> Result<Self, RbacError> {
        settings.validate()?;

        let mut patterns: Vec<&str> =
            settings.route_permissions.keys().map(String::as_str).collect();
        patterns.sort_by_key(|pattern| {
            let wildcards = pattern.chars().filter(|c| *c == '*').count();
            (wildcards, std::cmp::Reverse(pattern.len()), *pattern)
        });

        let mut routes = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let matcher = compile_matcher(pattern)?;
            routes.push(RouteRule {
                pattern: pattern.to_string(),
                matcher: Box::new(matcher),
                required: settings.route_permissions[pattern].clone(),
            });
        }

        Ok(Self {
            roles: settings.roles.clone(),
            user_roles: settings.user_roles.clone(),
            default_role: settings.default_role.clone(),
            routes,
            allow_any_permission: settings.allow_any_permission,
        })
    }

    /// Roles effective for a principal: token roles, configured user roles,
    /// and the default role, deduplicated.
    fn effective_roles(&self, principal: &Principal) -> Vec<String> {
        let mut roles = principal.roles.clone();
        if let Some(mapped) = self.user_roles.get(&principal.id) {
            roles.extend(mapped.iter().cloned());
        }
        if roles.is_empty() {
            if let Some(default) = &self.default_role {
                roles.push(default.clone());
            }
        }
        roles.sort();
        roles.dedup();
        roles
    }

    fn permissions_for(&self, roles: &[String]) -> Vec<String> {
        let mut permissions = Vec::new();
        for role in roles {
            if let Some(granted) = self.roles.get(role) {
                permissions.extend(granted.iter().cloned());
            }
        }
        permissions
    }

    /// Authorizes `principal` against the most specific rule matching `path`.
    ///
    /// A path with no matching rule is unrestricted. When several rules
    /// match, only the first (most specific) one binds; its permission list
    /// is evaluated in any-of or all-of mode.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Forbidden`] when a required permission is missing.
    pub fn authorize(&self, principal: &Principal, path: &str) -> Result<(), GatewayError> {
        let Some(rule) = self.routes.iter().find(|rule| (rule.matcher)(path)) else {
            return Ok(());
        };
        if rule.required.is_empty() {
            return Ok(());
        }

        let roles = self.effective_roles(principal);
        let held = self.permissions_for(&roles);
        let satisfied =
            |required: &String| held.iter().any(|held| permission_matches(held, required));
        let passes = if self.allow_any_permission {
            rule.required.iter().any(satisfied)
        } else {
            rule.required.iter().all(satisfied)
        };

        if !passes {
            tracing::debug!(
                principal = %principal.id,
                pattern = %rule.pattern,
                "rbac denied request"
            );
            return Err(GatewayError::Forbidden(format!(
                "user {:?} lacks permission for this route",
                principal.id
            )));
        }
        Ok(())
    }
}
