//! Caller identity and per-resource console authorization.

use console_relay_core::ResourceRef;
use serde::Deserialize;
use sha2::{Digest, Sha256};

const WILDCARD: &str = "*";

/// Authenticated caller of the session endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
}

/// Decides whether a user may open a console on one exact resource.
///
/// Called before any remote call is made, so implementations must not block.
pub trait Authorizer: Send + Sync {
    fn is_permitted(&self, user: &User, resource: &ResourceRef) -> bool;
}

/// Console grant; every field other than `connection` defaults to `*`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub connection: String,
    #[serde(default = "wildcard")]
    pub node: String,
    #[serde(default = "wildcard")]
    pub resource_type: String,
    #[serde(default = "wildcard")]
    pub resource_id: String,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

impl Grant {
    pub fn covers(&self, resource: &ResourceRef) -> bool {
        let resource_id = resource.resource_id.map(|id| id.to_string());
        matches_field(&self.connection, Some(&resource.connection_id))
            && matches_field(&self.node, Some(&resource.node))
            && matches_field(&self.resource_type, Some(resource.resource_type.as_str()))
            && matches_field(&self.resource_id, resource_id.as_deref())
    }
}

fn matches_field(pattern: &str, value: Option<&str>) -> bool {
    match value {
        _ if pattern == WILDCARD => true,
        Some(value) => pattern == value,
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct PolicyUser {
    pub name: String,
    pub token_sha256: String,
    pub grants: Vec<Grant>,
}

/// Static access policy loaded from the inventory.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    users: Vec<PolicyUser>,
}

impl AccessPolicy {
    pub fn new(users: Vec<PolicyUser>) -> Self {
        Self { users }
    }

    /// Maps a bearer token to its user by SHA-256 digest.
    pub fn authenticate(&self, token: &str) -> Option<User> {
        if token.is_empty() {
            return None;
        }
        let digest = token_digest(token);
        self.users
            .iter()
            .find(|user| user.token_sha256 == digest)
            .map(|user| User {
                name: user.name.clone(),
            })
    }
}

impl Authorizer for AccessPolicy {
    fn is_permitted(&self, user: &User, resource: &ResourceRef) -> bool {
        self.users
            .iter()
            .filter(|candidate| candidate.name == user.name)
            .flat_map(|candidate| candidate.grants.iter())
            .any(|grant| grant.covers(resource))
    }
}

pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
