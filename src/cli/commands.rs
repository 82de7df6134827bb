//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cluster::{
    Convergence, LoadBalancer, LoadBalancerError, NodePool, NodePoolError, NodePoolMachine,
};
use crate::config::{
    default_state_path, load_statuses, save_statuses, ConfigError, MachinePoolSpec, Manifest,
};
use crate::runtime::{ContainerDriver, ImageResolver};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node pool error: {0}")]
    NodePool(#[from] NodePoolError),

    #[error("Load balancer error: {0}")]
    LoadBalancer(#[from] LoadBalancerError),

    #[error("Manifest has no {0} section")]
    MissingSection(&'static str),

    #[error("Invalid weight {0:?}: expected NODE=WEIGHT")]
    InvalidWeight(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// One machine row for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub name: String,
    pub image: Option<String>,
    pub prioritize_delete: bool,
}

impl From<&NodePoolMachine> for MachineInfo {
    fn from(entry: &NodePoolMachine) -> Self {
        Self {
            name: entry.name().to_string(),
            image: entry.machine().map(|m| m.container_image().to_string()),
            prioritize_delete: entry.prioritize_delete(),
        }
    }
}

/// State of a node pool after a command
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub cluster: String,
    pub pool: String,
    pub machines: Vec<MachineInfo>,
    pub convergence: Convergence,
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Parse `NODE=WEIGHT` overrides
pub fn parse_weights(values: &[String]) -> CommandResult<HashMap<String, u32>> {
    values
        .iter()
        .map(|value| {
            let (node, weight) = value
                .split_once('=')
                .ok_or_else(|| CommandError::InvalidWeight(value.clone()))?;
            let weight = weight
                .trim()
                .parse::<u32>()
                .map_err(|_| CommandError::InvalidWeight(value.clone()))?;
            if node.trim().is_empty() {
                return Err(CommandError::InvalidWeight(value.clone()));
            }
            Ok((node.trim().to_string(), weight))
        })
        .collect()
}

/// The manifest's machine pool section
pub fn machine_pool(manifest: &Manifest) -> CommandResult<&MachinePoolSpec> {
    manifest
        .machine_pool
        .as_ref()
        .ok_or(CommandError::MissingSection("machinePool"))
}

/// Status file for a pool: explicit path or the default location
pub fn resolve_state_path(explicit: Option<&Path>, manifest: &Manifest) -> CommandResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let pool = machine_pool(manifest)?;
    Ok(default_state_path(&manifest.cluster.name, &pool.name))
}

fn report(np: &NodePool) -> CommandResult<PoolReport> {
    Ok(PoolReport {
        cluster: np.cluster_name().to_string(),
        pool: np.name().to_string(),
        machines: np.machines().iter().map(MachineInfo::from).collect(),
        convergence: np.convergence()?,
    })
}

// ============================================================================
// Pool commands
// ============================================================================

async fn open_pool(
    driver: Arc<dyn ContainerDriver>,
    resolver: Arc<dyn ImageResolver>,
    manifest: &Manifest,
    state: &Path,
) -> CommandResult<NodePool> {
    let pool = machine_pool(manifest)?.clone();
    let statuses = load_statuses(state)?;
    Ok(NodePool::new(driver, resolver, manifest.cluster.clone(), pool, statuses).await?)
}

/// Run one reconcile pass and persist the resulting statuses
pub async fn pool_reconcile(
    driver: Arc<dyn ContainerDriver>,
    resolver: Arc<dyn ImageResolver>,
    manifest: &Manifest,
    state: &Path,
) -> CommandResult<PoolReport> {
    let mut np = open_pool(driver, resolver, manifest, state).await?;
    let result = np.reconcile_machines().await;

    // Persist even after a failed pass so deletion priorities survive
    save_statuses(state, &np.current_statuses())?;
    result?;

    info!("Reconciled node pool {}", np.name());
    report(&np)
}

/// Delete every machine of the pool and clear its statuses
pub async fn pool_delete(
    driver: Arc<dyn ContainerDriver>,
    resolver: Arc<dyn ImageResolver>,
    manifest: &Manifest,
    state: &Path,
) -> CommandResult<()> {
    let mut np = open_pool(driver, resolver, manifest, state).await?;
    let result = np.delete().await;
    save_statuses(state, &np.current_statuses())?;
    result?;
    info!("Deleted node pool {}", np.name());
    Ok(())
}

/// Describe the pool without changing anything
pub async fn pool_status(
    driver: Arc<dyn ContainerDriver>,
    resolver: Arc<dyn ImageResolver>,
    manifest: &Manifest,
    state: &Path,
) -> CommandResult<PoolReport> {
    let np = open_pool(driver, resolver, manifest, state).await?;
    report(&np)
}

// ============================================================================
// Load balancer commands
// ============================================================================

async fn open_load_balancer(
    driver: Arc<dyn ContainerDriver>,
    manifest: &Manifest,
) -> CommandResult<LoadBalancer> {
    let spec = manifest.load_balancer.clone().unwrap_or_default();
    Ok(LoadBalancer::from_spec(driver, &manifest.cluster, &spec).await?)
}

/// Create the load balancer container; returns its name
pub async fn lb_create(
    driver: Arc<dyn ContainerDriver>,
    manifest: &Manifest,
) -> CommandResult<String> {
    let mut lb = open_load_balancer(driver, manifest).await?;
    lb.create().await?;
    Ok(lb.container_name())
}

/// Rewrite the load balancer configuration and reload it
pub async fn lb_update(
    driver: Arc<dyn ContainerDriver>,
    manifest: &Manifest,
    weights: &HashMap<String, u32>,
) -> CommandResult<()> {
    let lb = open_load_balancer(driver, manifest).await?;
    let template = manifest
        .load_balancer
        .as_ref()
        .and_then(|spec| spec.config_template.as_deref());
    lb.update_configuration(weights, template).await?;
    Ok(())
}

/// Address of the load balancer
pub async fn lb_ip(driver: Arc<dyn ContainerDriver>, manifest: &Manifest) -> CommandResult<String> {
    let lb = open_load_balancer(driver, manifest).await?;
    Ok(lb.ip().await?)
}

/// Delete the load balancer container
pub async fn lb_delete(driver: Arc<dyn ContainerDriver>, manifest: &Manifest) -> CommandResult<()> {
    let mut lb = open_load_balancer(driver, manifest).await?;
    lb.delete().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_manifest;
    use crate::runtime::{KindImageResolver, MemoryDriver};

    const MANIFEST: &str = r#"
cluster:
  name: demo
machinePool:
  name: pool-a
  replicas: 2
  version: v1.29.2
"#;

    #[test]
    fn test_parse_weights() {
        let weights = parse_weights(&["a=50".to_string(), " b = 7".to_string()]).unwrap();
        assert_eq!(weights["a"], 50);
        assert_eq!(weights["b"], 7);

        for bad in ["a", "=5", "a=-1", "a=x"] {
            assert!(matches!(
                parse_weights(&[bad.to_string()]),
                Err(CommandError::InvalidWeight(_))
            ));
        }
    }

    #[test]
    fn test_resolve_state_path() {
        let manifest = parse_manifest(MANIFEST).unwrap();
        let explicit = resolve_state_path(Some(Path::new("/tmp/s.json")), &manifest).unwrap();
        assert_eq!(explicit, PathBuf::from("/tmp/s.json"));

        let default = resolve_state_path(None, &manifest).unwrap();
        assert!(default.ends_with(".capd/demo-pool-a.json"));
    }

    #[test]
    fn test_missing_pool_section() {
        let manifest = parse_manifest("cluster:\n  name: demo\n").unwrap();
        assert!(matches!(
            resolve_state_path(None, &manifest),
            Err(CommandError::MissingSection("machinePool"))
        ));
    }

    #[tokio::test]
    async fn test_pool_reconcile_persists_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let manifest = parse_manifest(MANIFEST).unwrap();
        let driver = Arc::new(MemoryDriver::new());

        let report = pool_reconcile(driver.clone(), Arc::new(KindImageResolver), &manifest, &state)
            .await
            .unwrap();

        assert_eq!(report.machines.len(), 2);
        assert!(report.convergence.is_converged());
        assert_eq!(load_statuses(&state).unwrap().len(), 2);

        pool_delete(driver.clone(), Arc::new(KindImageResolver), &manifest, &state)
            .await
            .unwrap();
        assert!(driver.names().is_empty());
        assert!(load_statuses(&state).unwrap().is_empty());
    }
}
