//! Cluster connections, users, and grants known to the broker.
//!
//! The inventory is a TOML file read through the `config` crate, with
//! `CONSOLE_RELAY_INVENTORY__*` environment variables layered on top.

use std::{collections::HashMap, fmt, path::Path, sync::Arc};

use console_relay_core::TlsMode;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    access::{AccessPolicy, Grant, PolicyUser},
    credentials::{SealedCredentialStore, SealingKey},
};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory: {0}")]
    Load(#[from] config::ConfigError),
    #[error("connection {id}: invalid base url {url}")]
    InvalidBaseUrl { id: String, url: String },
    #[error("duplicate connection id {0}")]
    DuplicateConnection(String),
    #[error("user {0}: token_sha256 must be 64 hex characters")]
    InvalidTokenDigest(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub tls: TlsMode,
    pub token_id: String,
    pub sealed_secret: String,
    /// Extra management addresses tried when the base url stops answering.
    #[serde(default)]
    pub seed_addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub token_sha256: String,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let inventory: Inventory = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("CONSOLE_RELAY_INVENTORY").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(inventory.normalize())
    }

    pub fn from_toml(raw: &str) -> Result<Self, InventoryError> {
        let inventory: Inventory = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(inventory.normalize())
    }

    fn normalize(mut self) -> Self {
        for connection in &mut self.connections {
            connection.id = connection.id.trim().to_string();
            connection.base_url = connection.base_url.trim().to_string();
            connection.seed_addresses = connection
                .seed_addresses
                .drain(..)
                .filter_map(|addr| {
                    let trimmed = addr.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                })
                .collect();
        }
        for user in &mut self.users {
            user.token_sha256 = user.token_sha256.trim().to_ascii_lowercase();
        }
        self
    }

    pub fn connections(&self) -> Result<Connections, InventoryError> {
        let mut targets = HashMap::with_capacity(self.connections.len());
        for connection in &self.connections {
            let target = ConnectionTarget::from_config(connection)?;
            if targets.insert(target.id.clone(), Arc::new(target)).is_some() {
                return Err(InventoryError::DuplicateConnection(connection.id.clone()));
            }
        }
        Ok(Connections { targets })
    }

    pub fn credential_store(&self, key: SealingKey) -> SealedCredentialStore {
        let mut store = SealedCredentialStore::new(key);
        for connection in &self.connections {
            store.insert(
                connection.id.clone(),
                connection.token_id.clone(),
                connection.sealed_secret.clone(),
            );
        }
        store
    }

    pub fn access_policy(&self) -> Result<AccessPolicy, InventoryError> {
        let mut users = Vec::with_capacity(self.users.len());
        for user in &self.users {
            let digest = &user.token_sha256;
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(InventoryError::InvalidTokenDigest(user.name.clone()));
            }
            users.push(PolicyUser {
                name: user.name.clone(),
                token_sha256: digest.clone(),
                grants: user.grants.clone(),
            });
        }
        Ok(AccessPolicy::new(users))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn websocket(self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

/// One management address of a cluster: scheme, host, API port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let url = Url::parse(&normalize_base_url(raw)).ok()?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return None,
        };
        let host = url.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
        let port = url.port_or_known_default()?;
        Some(Self { scheme, host, port })
    }

    /// Same scheme and port on another cluster member.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            scheme: self.scheme,
            host: host.into(),
            port: self.port,
        }
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// REST root, e.g. `https://10.0.0.5:8006/api2/json`.
    pub fn api_base(&self) -> String {
        format!("{}://{}/api2/json", self.scheme.as_str(), self.authority())
    }

    pub fn websocket_base(&self) -> String {
        format!("{}://{}/api2/json", self.scheme.websocket(), self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Everything needed to reach one cluster, minus the secret itself.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub id: String,
    pub primary: Endpoint,
    pub tls: TlsMode,
    pub seed_hosts: Vec<String>,
}

impl ConnectionTarget {
    fn from_config(config: &ConnectionConfig) -> Result<Self, InventoryError> {
        let primary =
            Endpoint::parse(&config.base_url).ok_or_else(|| InventoryError::InvalidBaseUrl {
                id: config.id.clone(),
                url: config.base_url.clone(),
            })?;
        Ok(Self {
            id: config.id.clone(),
            primary,
            tls: config.tls,
            seed_hosts: config.seed_addresses.clone(),
        })
    }
}

/// Read-only directory of configured connections.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    targets: HashMap<String, Arc<ConnectionTarget>>,
}

impl Connections {
    pub fn get(&self, id: &str) -> Option<Arc<ConnectionTarget>> {
        self.targets.get(id).cloned()
    }

    pub fn insert(&mut self, target: ConnectionTarget) {
        self.targets.insert(target.id.clone(), Arc::new(target));
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
