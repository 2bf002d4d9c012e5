use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of managed object a console can be opened into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Qemu,
    Lxc,
    Node,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Qemu => "qemu",
            ResourceKind::Lxc => "lxc",
            ResourceKind::Node => "node",
        }
    }

    /// Console flavour used when the caller does not ask for one.
    pub fn default_console(self) -> ConsoleKind {
        match self {
            ResourceKind::Qemu => ConsoleKind::Graphical,
            ResourceKind::Lxc | ResourceKind::Node => ConsoleKind::Terminal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource type {0:?}")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "qemu" => Ok(ResourceKind::Qemu),
            "lxc" => Ok(ResourceKind::Lxc),
            "node" => Ok(ResourceKind::Node),
            other => Err(UnknownResourceKind(other.to_string())),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    Graphical,
    Terminal,
}

impl ConsoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleKind::Graphical => "graphical",
            ConsoleKind::Terminal => "terminal",
        }
    }
}

/// Fully qualified reference to a console target on one cluster connection.
///
/// Node shells carry no `resource_id`; guests always do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub connection_id: String,
    pub node: String,
    pub resource_type: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<u32>,
}

impl ResourceRef {
    pub fn guest(
        connection_id: impl Into<String>,
        node: impl Into<String>,
        resource_type: ResourceKind,
        resource_id: u32,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            node: node.into(),
            resource_type,
            resource_id: Some(resource_id),
        }
    }

    pub fn node_shell(connection_id: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            node: node.into(),
            resource_type: ResourceKind::Node,
            resource_id: None,
        }
    }

    /// Path segment below `/nodes/` addressing this resource on the cluster
    /// manager, e.g. `pve1/qemu/101` or `pve1`.
    pub fn cluster_path(&self) -> String {
        match (self.resource_type, self.resource_id) {
            (ResourceKind::Node, _) | (_, None) => self.node.clone(),
            (kind, Some(id)) => format!("{}/{}/{}", self.node, kind, id),
        }
    }

    pub fn title(&self) -> String {
        match self.resource_id {
            Some(id) => format!("{} {} on {}", self.resource_type, id, self.node),
            None => format!("shell on {}", self.node),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.cluster_path())
    }
}
