pub mod spec;

pub use spec::{
    ClusterNetwork, ClusterSpec, IpFamily, LoadBalancerSpec, MachinePoolSpec, MachineTemplate,
    SpecError,
};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::NodePoolMachineStatus;
use crate::runtime::image::parse_version;

/// Errors for manifest and state handling
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Manifest parse error: {0}")]
    ParseError(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// Desired state for one cluster as written by the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub cluster: ClusterSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_pool: Option<MachinePoolSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerSpec>,
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Parse a YAML manifest.
pub fn parse_manifest(content: &str) -> Result<Manifest, ConfigError> {
    let manifest: Manifest =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Reject manifests that can never reconcile.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ConfigError> {
    if manifest.cluster.name.is_empty() {
        return Err(ConfigError::Invalid("cluster name is empty".to_string()));
    }
    manifest
        .cluster
        .ip_family()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    if let Some(pool) = &manifest.machine_pool {
        if pool.name.is_empty() {
            return Err(ConfigError::Invalid("machine pool name is empty".to_string()));
        }
        parse_version(&pool.version).map_err(|e| {
            ConfigError::Invalid(format!(
                "machine pool {} has invalid version {:?}: {}",
                pool.name, pool.version, e
            ))
        })?;
    }
    Ok(())
}

/// Parse a persisted status list.
pub fn parse_statuses(content: &str) -> Result<Vec<NodePoolMachineStatus>, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content).map_err(|e| ConfigError::StateError(e.to_string()))
}

/// Serialize a status list for persistence.
pub fn serialize_statuses(statuses: &[NodePoolMachineStatus]) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(statuses).map_err(|e| ConfigError::StateError(e.to_string()))
}

/// Default state file location: ~/.capd/<cluster>-<pool>.json
pub fn default_state_path(cluster: &str, pool: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".capd")
        .join(format!("{}-{}.json", cluster, pool))
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a manifest file from disk.
pub fn load_manifest(path: &Path) -> Result<Manifest, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_manifest(&content)
}

/// Load persisted statuses; a missing file means no carried-over state.
pub fn load_statuses(path: &Path) -> Result<Vec<NodePoolMachineStatus>, ConfigError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    parse_statuses(&content)
}

/// Persist statuses, creating the parent directory if needed.
pub fn save_statuses(path: &Path, statuses: &[NodePoolMachineStatus]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_statuses(statuses)?)?;
    Ok(())
}
