//! Node pool reconciler
//!
//! A node pool is the set of worker containers backing one machine pool.
//! Reconciling a pool:
//! - deletes machines beyond the desired replica count or running an
//!   outdated image, in deletion-priority order
//! - creates new machines until enough match the desired image
//!
//! Upgrades only ever go through delete-then-recreate. Nothing is mutated in
//! place, and one pass may leave work for the next.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ClusterSpec, MachinePoolSpec};
use crate::runtime::driver::{ContainerDriver, CreateMachine, DriverError, Machine};
use crate::runtime::image::{parse_version, ImageResolver};
use crate::runtime::labels::{LabelFilter, NodeRole, FAILURE_DOMAIN_LABEL, MACHINE_POOL_LABEL};

/// Prefix of generated machine names
pub const MACHINE_NAME_PREFIX: &str = "worker-";

/// Length of the random suffix of generated machine names
pub const MACHINE_NAME_SUFFIX_LEN: usize = 6;

const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Errors that can occur while reconciling a node pool
#[derive(Error, Debug)]
pub enum NodePoolError {
    #[error("machine pool {pool} has invalid version {version:?}: {reason}")]
    InvalidVersion {
        pool: String,
        version: String,
        reason: String,
    },

    #[error("failed to refresh the node pool: {0}")]
    Refresh(#[source] DriverError),

    #[error("failed to delete machine {name}: {source}")]
    DeleteMachine { name: String, source: DriverError },

    #[error("failed to create machine {name}: {source}")]
    CreateMachine { name: String, source: DriverError },
}

/// Caller-persisted record about one machine of the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolMachineStatus {
    pub name: String,

    /// Delete this machine before any other
    #[serde(default)]
    pub prioritize_delete: bool,
}

impl NodePoolMachineStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prioritize_delete: false,
        }
    }

    /// Mark for deletion ahead of other machines
    pub fn prioritized(mut self) -> Self {
        self.prioritize_delete = true;
        self
    }
}

/// One registry entry: a live machine, a carried-over status, or both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePoolMachine {
    Live(Machine),
    StatusOnly(NodePoolMachineStatus),
    Tracked {
        machine: Machine,
        status: NodePoolMachineStatus,
    },
}

impl NodePoolMachine {
    pub fn name(&self) -> &str {
        match self {
            NodePoolMachine::Live(machine) => machine.name(),
            NodePoolMachine::StatusOnly(status) => &status.name,
            NodePoolMachine::Tracked { machine, .. } => machine.name(),
        }
    }

    pub fn prioritize_delete(&self) -> bool {
        match self {
            NodePoolMachine::Live(_) => false,
            NodePoolMachine::StatusOnly(status) | NodePoolMachine::Tracked { status, .. } => {
                status.prioritize_delete
            }
        }
    }

    /// The live container, if there is one
    pub fn machine(&self) -> Option<&Machine> {
        match self {
            NodePoolMachine::Live(machine) | NodePoolMachine::Tracked { machine, .. } => {
                Some(machine)
            }
            NodePoolMachine::StatusOnly(_) => None,
        }
    }

    /// The status record, synthesized for a machine that has none yet
    pub fn status(&self) -> NodePoolMachineStatus {
        match self {
            NodePoolMachine::Live(machine) => NodePoolMachineStatus::new(machine.name()),
            NodePoolMachine::StatusOnly(status) | NodePoolMachine::Tracked { status, .. } => {
                status.clone()
            }
        }
    }
}

/// How far the pool is from its desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Convergence {
    pub desired: usize,
    /// Live machines running the desired image
    pub matching: usize,
    /// Live machines running any other image
    pub outdated: usize,
}

impl Convergence {
    /// Creates plus deletes still needed to converge
    pub fn remaining(&self) -> usize {
        self.outdated + self.matching.abs_diff(self.desired)
    }

    pub fn is_converged(&self) -> bool {
        self.remaining() == 0
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Sort into deletion order: prioritized first, then by name.
pub fn sort_machines(machines: &mut [NodePoolMachine]) {
    machines.sort_by(|a, b| {
        b.prioritize_delete()
            .cmp(&a.prioritize_delete())
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Rebuild the registry from a fresh listing.
///
/// Control-plane containers are never adopted. Live machines keep the status
/// they had, or get a fresh one. Statuses with no live machine are kept.
pub fn merge_machines(
    previous: &[NodePoolMachine],
    listed: Vec<Machine>,
) -> Vec<NodePoolMachine> {
    let mut statuses: HashMap<String, NodePoolMachineStatus> = previous
        .iter()
        .map(|entry| (entry.name().to_string(), entry.status()))
        .collect();

    let mut merged: Vec<NodePoolMachine> = Vec::with_capacity(listed.len());
    for machine in listed {
        if machine.is_control_plane() {
            debug!("Ignoring control plane machine {}", machine.name());
            continue;
        }
        let status = statuses
            .remove(machine.name())
            .unwrap_or_else(|| NodePoolMachineStatus::new(machine.name()));
        merged.push(NodePoolMachine::Tracked { machine, status });
    }

    // Keep the previous order for leftovers so the result is deterministic
    for entry in previous {
        if let Some(status) = statuses.remove(entry.name()) {
            merged.push(NodePoolMachine::StatusOnly(status));
        }
    }

    sort_machines(&mut merged);
    merged
}

/// Live machines to delete, in deletion order
///
/// Outdated machines always go. Of the matching ones, the last `desired` in
/// deletion order stay, so any excess comes off the front of the order.
///
/// The walk runs back to front. A forward walk keeping the first `desired`
/// matching machines would spare prioritized machines and delete unmarked
/// ones: with `b*, d*, a, c, e` and three desired, `b` and `d` must go.
pub fn plan_deletions(
    machines: &[NodePoolMachine],
    desired: usize,
    expected_image: &str,
) -> Vec<Machine> {
    let live: Vec<&Machine> = machines.iter().filter_map(NodePoolMachine::machine).collect();

    let mut kept = 0;
    let mut doomed = vec![false; live.len()];
    for (i, machine) in live.iter().enumerate().rev() {
        if kept >= desired || machine.container_image() != expected_image {
            doomed[i] = true;
        } else {
            kept += 1;
        }
    }

    live.into_iter()
        .zip(doomed)
        .filter(|(_, doomed)| *doomed)
        .map(|(machine, _)| machine.clone())
        .collect()
}

/// Generate a machine name like `worker-k3x9qa`
pub fn generate_machine_name<R: Rng>(rng: &mut R) -> String {
    let suffix: String = (0..MACHINE_NAME_SUFFIX_LEN)
        .map(|_| NAME_CHARSET[rng.gen_range(0..NAME_CHARSET.len())] as char)
        .collect();
    format!("{}{}", MACHINE_NAME_PREFIX, suffix)
}

/// Pick one failure domain uniformly at random
pub fn pick_failure_domain<'a, R: Rng>(
    rng: &mut R,
    domains: &'a [String],
) -> Option<&'a str> {
    if domains.is_empty() {
        return None;
    }
    Some(domains[rng.gen_range(0..domains.len())].as_str())
}

// ============================================================================
// SBIO: I/O - reconciliation against the container driver
// ============================================================================

/// The worker containers of one machine pool
pub struct NodePool {
    driver: Arc<dyn ContainerDriver>,
    resolver: Arc<dyn ImageResolver>,
    cluster: ClusterSpec,
    pool: MachinePoolSpec,
    label_filter: LabelFilter,
    machines: Vec<NodePoolMachine>,
    rng: StdRng,
}

impl NodePool {
    /// Seed the registry from carried-over statuses, then discover live
    /// machines.
    pub async fn new(
        driver: Arc<dyn ContainerDriver>,
        resolver: Arc<dyn ImageResolver>,
        cluster: ClusterSpec,
        pool: MachinePoolSpec,
        statuses: Vec<NodePoolMachineStatus>,
    ) -> Result<Self, NodePoolError> {
        let label_filter =
            LabelFilter::for_cluster(&cluster.name).with(MACHINE_POOL_LABEL, pool.name.as_str());
        debug!(
            "Creating node pool {} with {} carried-over statuses",
            pool.name,
            statuses.len()
        );

        let mut np = Self {
            driver,
            resolver,
            cluster,
            pool,
            label_filter,
            machines: statuses.into_iter().map(NodePoolMachine::StatusOnly).collect(),
            rng: StdRng::from_entropy(),
        };
        sort_machines(&mut np.machines);
        np.refresh().await?;
        Ok(np)
    }

    /// Replace the random source used for names and failure domains
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn name(&self) -> &str {
        &self.pool.name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster.name
    }

    pub fn label_filter(&self) -> &LabelFilter {
        &self.label_filter
    }

    /// Registry entries in deletion order
    pub fn machines(&self) -> &[NodePoolMachine] {
        &self.machines
    }

    /// Statuses to persist for the next pass, in deletion order
    pub fn current_statuses(&self) -> Vec<NodePoolMachineStatus> {
        self.machines.iter().map(NodePoolMachine::status).collect()
    }

    /// Image every machine of the pool should run
    pub fn expected_image(&self) -> Result<String, NodePoolError> {
        let version =
            parse_version(&self.pool.version).map_err(|e| NodePoolError::InvalidVersion {
                pool: self.pool.name.clone(),
                version: self.pool.version.clone(),
                reason: e.to_string(),
            })?;
        Ok(self
            .resolver
            .resolve(&version, self.pool.template.custom_image.as_deref()))
    }

    /// Live machines running the expected image
    fn matching_count(&self, expected_image: &str) -> usize {
        self.machines
            .iter()
            .filter_map(NodePoolMachine::machine)
            .filter(|m| m.container_image() == expected_image)
            .count()
    }

    /// Current distance from the desired state
    pub fn convergence(&self) -> Result<Convergence, NodePoolError> {
        let expected_image = self.expected_image()?;
        let live = self.machines.iter().filter_map(NodePoolMachine::machine).count();
        let matching = self.matching_count(&expected_image);
        Ok(Convergence {
            desired: self.pool.replicas as usize,
            matching,
            outdated: live - matching,
        })
    }

    /// Re-list live machines and rebuild the registry
    pub async fn refresh(&mut self) -> Result<(), NodePoolError> {
        let listed = self
            .driver
            .list(&self.label_filter)
            .await
            .map_err(NodePoolError::Refresh)?;
        debug!("Node pool {} listed {} machines", self.pool.name, listed.len());
        self.machines = merge_machines(&self.machines, listed);
        Ok(())
    }

    /// One convergence step: delete excess and outdated machines, then
    /// create missing ones.
    pub async fn reconcile_machines(&mut self) -> Result<(), NodePoolError> {
        let desired = self.pool.replicas as usize;
        let expected_image = self.expected_image()?;

        let doomed = plan_deletions(&self.machines, desired, &expected_image);
        for machine in &doomed {
            info!(
                "Deleting machine {} from node pool {} (image {})",
                machine.name(),
                self.pool.name,
                machine.container_image()
            );
            self.driver
                .delete(machine)
                .await
                .map_err(|source| NodePoolError::DeleteMachine {
                    name: machine.name().to_string(),
                    source,
                })?;
            // The status goes with the machine
            self.machines.retain(|entry| entry.name() != machine.name());
        }
        if !doomed.is_empty() {
            self.refresh().await?;
        }

        let matching = self.matching_count(&expected_image);
        debug!(
            "Node pool {} has {} of {} matching machines",
            self.pool.name, matching, desired
        );
        let missing = desired.saturating_sub(matching);
        for _ in 0..missing {
            self.add_machine(&expected_image).await?;
        }
        if missing > 0 {
            self.refresh().await?;
        }

        Ok(())
    }

    /// Draw names until one is not in the registry.
    ///
    /// Only the registry is checked. A container outside the pool that already
    /// holds the name makes the create fail instead.
    fn unique_machine_name(&mut self) -> String {
        loop {
            let name = generate_machine_name(&mut self.rng);
            if !self.machines.iter().any(|entry| entry.name() == name) {
                return name;
            }
        }
    }

    async fn add_machine(&mut self, image: &str) -> Result<(), NodePoolError> {
        let name = self.unique_machine_name();

        let mut request = CreateMachine::new(&name, image, NodeRole::Worker);
        request.version = Some(self.pool.version.clone());
        request.labels = self.label_filter.to_labels();
        request.mounts = self.pool.template.extra_mounts.clone();
        // Placement hint only, nothing schedules on it
        if let Some(domain) = pick_failure_domain(&mut self.rng, &self.pool.failure_domains) {
            request
                .labels
                .insert(FAILURE_DOMAIN_LABEL.to_string(), domain.to_string());
        }

        info!("Creating machine {} in node pool {}", name, self.pool.name);
        let machine = self
            .driver
            .create(&request)
            .await
            .map_err(|source| NodePoolError::CreateMachine {
                name: name.clone(),
                source,
            })?;
        self.machines.push(NodePoolMachine::Live(machine));
        sort_machines(&mut self.machines);
        Ok(())
    }

    /// Delete every live machine of the pool.
    ///
    /// Stops at the first failure. Machines deleted before it stay deleted.
    pub async fn delete(&mut self) -> Result<(), NodePoolError> {
        let live: Vec<Machine> = self
            .machines
            .iter()
            .filter_map(NodePoolMachine::machine)
            .cloned()
            .collect();
        for machine in &live {
            info!(
                "Deleting machine {} from node pool {}",
                machine.name(),
                self.pool.name
            );
            self.driver
                .delete(machine)
                .await
                .map_err(|source| NodePoolError::DeleteMachine {
                    name: machine.name().to_string(),
                    source,
                })?;
            self.machines.retain(|entry| entry.name() != machine.name());
        }
        self.machines.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::labels::{CLUSTER_LABEL, ROLE_LABEL};
    use crate::runtime::{KindImageResolver, MemoryDriver};

    const IMAGE: &str = "kindest/node:v1.29.2";

    fn status(name: &str, prioritize: bool) -> NodePoolMachineStatus {
        NodePoolMachineStatus {
            name: name.to_string(),
            prioritize_delete: prioritize,
        }
    }

    fn live(name: &str, image: &str) -> Machine {
        Machine::new(name, image)
    }

    fn names(machines: &[NodePoolMachine]) -> Vec<&str> {
        machines.iter().map(NodePoolMachine::name).collect()
    }

    #[test]
    fn test_sort_priority_then_name() {
        let mut machines = vec![
            NodePoolMachine::StatusOnly(status("a", false)),
            NodePoolMachine::StatusOnly(status("b", true)),
            NodePoolMachine::StatusOnly(status("c", false)),
            NodePoolMachine::StatusOnly(status("d", true)),
        ];
        sort_machines(&mut machines);
        assert_eq!(names(&machines), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_merge_carries_status_and_skips_control_plane() {
        let previous = vec![
            NodePoolMachine::StatusOnly(status("worker-b", true)),
            NodePoolMachine::StatusOnly(status("worker-gone", false)),
        ];
        let mut control_plane = live("cp", IMAGE);
        control_plane
            .labels
            .insert(ROLE_LABEL.to_string(), "control-plane".to_string());

        let merged = merge_machines(
            &previous,
            vec![live("worker-a", IMAGE), live("worker-b", IMAGE), control_plane],
        );

        assert_eq!(names(&merged), vec!["worker-b", "worker-a", "worker-gone"]);
        assert!(merged[0].prioritize_delete());
        assert!(merged[0].machine().is_some());
        assert_eq!(merged[1].status(), status("worker-a", false));
        assert!(merged[2].machine().is_none());
    }

    #[test]
    fn test_plan_deletions_excess_and_outdated() {
        let machines = vec![
            NodePoolMachine::Live(live("a", IMAGE)),
            NodePoolMachine::Live(live("b", "kindest/node:v1.28.0")),
            NodePoolMachine::StatusOnly(status("c", false)),
            NodePoolMachine::Live(live("d", IMAGE)),
            NodePoolMachine::Live(live("e", IMAGE)),
        ];
        let doomed: Vec<String> = plan_deletions(&machines, 2, IMAGE)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(doomed, vec!["a", "b"]);
    }

    #[test]
    fn test_plan_deletions_takes_prioritized_first() {
        let mut machines: Vec<NodePoolMachine> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|name| NodePoolMachine::Tracked {
                machine: live(name, IMAGE),
                status: status(name, *name == "b" || *name == "d"),
            })
            .collect();
        sort_machines(&mut machines);

        let doomed: Vec<String> = plan_deletions(&machines, 3, IMAGE)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(doomed, vec!["b", "d"]);
    }

    #[test]
    fn test_plan_deletions_zero_desired() {
        let machines = vec![
            NodePoolMachine::Live(live("a", IMAGE)),
            NodePoolMachine::Live(live("b", IMAGE)),
        ];
        assert_eq!(plan_deletions(&machines, 0, IMAGE).len(), 2);
    }

    #[test]
    fn test_generated_names() {
        let mut rng = StdRng::seed_from_u64(7);
        let name = generate_machine_name(&mut rng);
        assert!(name.starts_with(MACHINE_NAME_PREFIX));
        let suffix = &name[MACHINE_NAME_PREFIX.len()..];
        assert_eq!(suffix.len(), MACHINE_NAME_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let mut again = StdRng::seed_from_u64(7);
        assert_eq!(generate_machine_name(&mut again), name);
    }

    #[test]
    fn test_pick_failure_domain() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pick_failure_domain(&mut rng, &[]), None);

        let domains = vec!["fd-1".to_string(), "fd-2".to_string()];
        for _ in 0..20 {
            let picked = pick_failure_domain(&mut rng, &domains).unwrap();
            assert!(domains.iter().any(|d| d == picked));
        }
    }

    #[test]
    fn test_convergence_remaining() {
        let c = Convergence {
            desired: 3,
            matching: 1,
            outdated: 2,
        };
        assert_eq!(c.remaining(), 4);
        assert!(!c.is_converged());

        let done = Convergence {
            desired: 2,
            matching: 2,
            outdated: 0,
        };
        assert!(done.is_converged());
    }

    #[tokio::test]
    async fn test_new_machines_carry_pool_labels() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = MachinePoolSpec::new("pool-a", 1, "v1.29.2").with_failure_domains(&["fd-1"]);
        let mut np = NodePool::new(
            driver.clone(),
            Arc::new(KindImageResolver),
            ClusterSpec::new("demo"),
            pool,
            Vec::new(),
        )
        .await
        .unwrap()
        .with_rng(StdRng::seed_from_u64(42));

        np.reconcile_machines().await.unwrap();

        let name = driver.names().pop().unwrap();
        let machine = driver.get(&name).unwrap();
        assert_eq!(machine.image, IMAGE);
        assert_eq!(machine.labels[CLUSTER_LABEL], "demo");
        assert_eq!(machine.labels[MACHINE_POOL_LABEL], "pool-a");
        assert_eq!(machine.labels[FAILURE_DOMAIN_LABEL], "fd-1");
        assert_eq!(machine.role(), Some(NodeRole::Worker));
    }

    #[tokio::test]
    async fn test_invalid_version_is_an_error() {
        let driver = Arc::new(MemoryDriver::new());
        let mut np = NodePool::new(
            driver.clone(),
            Arc::new(KindImageResolver),
            ClusterSpec::new("demo"),
            MachinePoolSpec::new("pool-a", 2, "not-a-version"),
            Vec::new(),
        )
        .await
        .unwrap();

        let err = np.reconcile_machines().await.unwrap_err();
        assert!(matches!(err, NodePoolError::InvalidVersion { .. }));
        assert_eq!(driver.create_count(), 0);
    }
}
