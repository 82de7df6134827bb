//! Container driver interface
//!
//! The driver abstracts lifecycle and file operations on a single container:
//! - Creating and deleting containers
//! - Listing containers by label
//! - Address lookup, file I/O and process signalling
//!
//! Calls are made one at a time; implementations need no ordering guarantees
//! beyond "a call has completed when it returns".

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::labels::{NodeRole, ROLE_LABEL};

/// Errors returned by container drivers
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to create container {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("failed to delete container {name}: {reason}")]
    Delete { name: String, reason: String },

    #[error("failed to list containers: {0}")]
    List(String),

    #[error("failed to get IP for container {name}: {reason}")]
    Inspect { name: String, reason: String },

    #[error("failed to write {path} in container {name}: {reason}")]
    WriteFile {
        name: String,
        path: String,
        reason: String,
    },

    #[error("failed to read {path} in container {name}: {reason}")]
    ReadFile {
        name: String,
        path: String,
        reason: String,
    },

    #[error("failed to send {signal} to container {name}: {reason}")]
    Signal {
        name: String,
        signal: String,
        reason: String,
    },

    #[error("container {0} not found")]
    NotFound(String),
}

/// Handle to a live container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Container name
    pub name: String,

    /// Image the container was started from
    pub image: String,

    /// Labels attached at creation time
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Machine {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container_image(&self) -> &str {
        &self.image
    }

    /// Role parsed from the role label, if any
    pub fn role(&self) -> Option<NodeRole> {
        self.labels
            .get(ROLE_LABEL)
            .and_then(|v| NodeRole::from_label_value(v))
    }

    pub fn is_control_plane(&self) -> bool {
        self.role() == Some(NodeRole::ControlPlane)
    }
}

/// Host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Port published from the container to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to bind
    pub listen_address: String,
    /// Host port; 0 lets the runtime pick a free one
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMachine {
    pub name: String,
    pub image: String,
    pub role: NodeRole,
    /// Kubernetes version the node runs, if it is a node
    pub version: Option<String>,
    /// Labels besides the role label, which drivers add themselves
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub port_mappings: Vec<PortMapping>,
}

impl CreateMachine {
    pub fn new(name: impl Into<String>, image: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            role,
            version: None,
            labels: BTreeMap::new(),
            mounts: Vec::new(),
            port_mappings: Vec::new(),
        }
    }

    /// All labels the created container carries, role label included
    pub fn effective_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(ROLE_LABEL.to_string(), self.role.label_value().to_string());
        labels
    }
}

/// Container driver interface
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create and start a container.
    async fn create(&self, request: &CreateMachine) -> Result<Machine, DriverError>;

    /// Remove a container and its anonymous volumes.
    async fn delete(&self, machine: &Machine) -> Result<(), DriverError>;

    /// List containers (running or not) matching every label in `filter`.
    async fn list(&self, filter: &super::LabelFilter) -> Result<Vec<Machine>, DriverError>;

    /// Return the (IPv4, IPv6) addresses of a container. Either may be empty.
    async fn ip(&self, machine: &Machine) -> Result<(String, String), DriverError>;

    /// Write a file inside the container.
    async fn write_file(
        &self,
        machine: &Machine,
        path: &str,
        contents: &[u8],
    ) -> Result<(), DriverError>;

    /// Read a file from inside the container.
    async fn read_file(&self, machine: &Machine, path: &str) -> Result<Vec<u8>, DriverError>;

    /// Send a signal (e.g. "SIGHUP") to the container's main process.
    async fn kill(&self, machine: &Machine, signal: &str) -> Result<(), DriverError>;
}
