//! Caller identity and permission scopes

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wildcard scope granting every permission
pub const WILDCARD_SCOPE: &str = "*";

/// Permission required by a gateway operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Receive events from a stream
    Read,
    /// Start a stream, publish into it, close it
    Write,
    /// View gateway statistics
    Admin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub user_id: String,
    pub scopes: BTreeSet<String>,
    pub is_anonymous: bool,
}

impl AuthResult {
    /// Authenticated caller with the given scopes
    pub fn user(user_id: impl Into<String>, scopes: impl IntoIterator<Item = String>) -> Self {
        Self {
            user_id: user_id.into(),
            scopes: scopes.into_iter().collect(),
            is_anonymous: false,
        }
    }

    /// Anonymous caller with the given scopes
    pub fn anonymous(scopes: impl IntoIterator<Item = String>) -> Self {
        Self {
            user_id: "anonymous".to_string(),
            scopes: scopes.into_iter().collect(),
            is_anonymous: true,
        }
    }

    /// Check whether the scope is granted, directly or via `*`
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(WILDCARD_SCOPE) || self.scopes.contains(scope.as_str())
    }
}
