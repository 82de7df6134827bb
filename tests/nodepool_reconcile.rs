//! Integration tests for node pool reconciliation
//!
//! Pools run against the in-memory driver with a seeded random source, so
//! generated names are reproducible but never asserted literally.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use capd::cluster::{NodePool, NodePoolError, NodePoolMachineStatus};
use capd::config::{ClusterSpec, MachinePoolSpec};
use capd::runtime::labels::{CLUSTER_LABEL, MACHINE_POOL_LABEL, ROLE_LABEL};
use capd::runtime::{KindImageResolver, Machine, MemoryDriver, NodeRole};

const CLUSTER: &str = "demo";
const POOL: &str = "pool-a";
const V1_29: &str = "kindest/node:v1.29.2";

fn pool_labels(role: NodeRole) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), CLUSTER.to_string()),
        (MACHINE_POOL_LABEL.to_string(), POOL.to_string()),
        (ROLE_LABEL.to_string(), role.label_value().to_string()),
    ])
}

/// Put an already-running worker of the pool into the driver
fn seed_worker(driver: &MemoryDriver, name: &str, image: &str) {
    driver.insert(Machine::new(name, image).with_labels(pool_labels(NodeRole::Worker)));
}

async fn open_pool(
    driver: &Arc<MemoryDriver>,
    replicas: u32,
    version: &str,
    statuses: Vec<NodePoolMachineStatus>,
) -> NodePool {
    NodePool::new(
        driver.clone(),
        Arc::new(KindImageResolver),
        ClusterSpec::new(CLUSTER),
        MachinePoolSpec::new(POOL, replicas, version),
        statuses,
    )
    .await
    .unwrap()
    .with_rng(StdRng::seed_from_u64(1234))
}

fn names(np: &NodePool) -> Vec<String> {
    np.machines().iter().map(|m| m.name().to_string()).collect()
}

#[tokio::test]
async fn test_empty_pool_grows_to_desired() {
    let driver = Arc::new(MemoryDriver::new());
    let mut np = open_pool(&driver, 3, "v1.29.2", Vec::new()).await;

    np.reconcile_machines().await.unwrap();

    assert_eq!(driver.create_count(), 3);
    assert_eq!(driver.delete_count(), 0);
    assert_eq!(np.machines().len(), 3);
    let convergence = np.convergence().unwrap();
    assert_eq!(convergence.matching, 3);
    assert!(convergence.is_converged());

    for name in driver.names() {
        assert!(name.starts_with("worker-"));
        assert_eq!(driver.get(&name).unwrap().image, V1_29);
    }
}

#[tokio::test]
async fn test_statuses_order_after_refresh() {
    let driver = Arc::new(MemoryDriver::new());
    for name in ["a", "b", "c", "d"] {
        seed_worker(&driver, name, V1_29);
    }
    let statuses = vec![
        NodePoolMachineStatus::new("a"),
        NodePoolMachineStatus::new("b").prioritized(),
        NodePoolMachineStatus::new("c"),
        NodePoolMachineStatus::new("d").prioritized(),
    ];

    let np = open_pool(&driver, 4, "v1.29.2", statuses).await;

    assert_eq!(names(&np), vec!["b", "d", "a", "c"]);
    let persisted: Vec<String> = np.current_statuses().into_iter().map(|s| s.name).collect();
    assert_eq!(persisted, vec!["b", "d", "a", "c"]);
}

#[tokio::test]
async fn test_status_only_entries_survive_refresh() {
    let driver = Arc::new(MemoryDriver::new());
    seed_worker(&driver, "a", V1_29);
    let statuses = vec![
        NodePoolMachineStatus::new("a"),
        NodePoolMachineStatus::new("z").prioritized(),
    ];

    let np = open_pool(&driver, 1, "v1.29.2", statuses).await;

    assert_eq!(names(&np), vec!["z", "a"]);
    assert!(np.machines()[0].machine().is_none());
    assert!(np.machines()[1].machine().is_some());
}

#[tokio::test]
async fn test_shrink_deletes_prioritized_first() {
    let driver = Arc::new(MemoryDriver::new());
    for name in ["a", "b", "c", "d", "e"] {
        seed_worker(&driver, name, V1_29);
    }
    let statuses = vec![
        NodePoolMachineStatus::new("b").prioritized(),
        NodePoolMachineStatus::new("d").prioritized(),
    ];
    let mut np = open_pool(&driver, 3, "v1.29.2", statuses).await;

    np.reconcile_machines().await.unwrap();

    assert_eq!(driver.delete_count(), 2);
    assert_eq!(driver.create_count(), 0);
    assert_eq!(driver.names(), vec!["a", "c", "e"]);
    assert_eq!(names(&np), vec!["a", "c", "e"]);
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let driver = Arc::new(MemoryDriver::new());
    seed_worker(&driver, "a", V1_29);
    let mut np = open_pool(&driver, 2, "v1.29.2", Vec::new()).await;

    np.reconcile_machines().await.unwrap();
    let creates = driver.create_count();
    let deletes = driver.delete_count();

    np.reconcile_machines().await.unwrap();

    assert_eq!(driver.create_count(), creates);
    assert_eq!(driver.delete_count(), deletes);
    assert_eq!(np.machines().len(), 2);
}

#[tokio::test]
async fn test_version_bump_recreates_machines() {
    let driver = Arc::new(MemoryDriver::new());
    seed_worker(&driver, "old-a", "kindest/node:v1.28.0");
    seed_worker(&driver, "old-b", "kindest/node:v1.28.0");
    let mut np = open_pool(&driver, 2, "v1.29.2", Vec::new()).await;

    np.reconcile_machines().await.unwrap();

    assert_eq!(driver.delete_count(), 2);
    assert_eq!(driver.create_count(), 2);
    let remaining = driver.names();
    assert!(!remaining.iter().any(|n| n.starts_with("old-")));
    for name in &remaining {
        assert_eq!(driver.get(name).unwrap().image, V1_29);
    }
    assert!(np.convergence().unwrap().is_converged());
}

#[tokio::test]
async fn test_control_plane_machines_are_never_adopted() {
    let driver = Arc::new(MemoryDriver::new());
    driver.insert(Machine::new("cp", V1_29).with_labels(pool_labels(NodeRole::ControlPlane)));
    let mut np = open_pool(&driver, 0, "v1.29.2", Vec::new()).await;

    assert!(np.machines().is_empty());
    np.reconcile_machines().await.unwrap();

    assert_eq!(driver.names(), vec!["cp"]);
    assert_eq!(driver.delete_count(), 0);
}

#[tokio::test]
async fn test_custom_image_is_matched() {
    let driver = Arc::new(MemoryDriver::new());
    seed_worker(&driver, "a", "registry.local/node:dev");
    let mut np = NodePool::new(
        driver.clone(),
        Arc::new(KindImageResolver),
        ClusterSpec::new(CLUSTER),
        MachinePoolSpec::new(POOL, 1, "v1.29.2").with_custom_image("registry.local/node:dev"),
        Vec::new(),
    )
    .await
    .unwrap();

    np.reconcile_machines().await.unwrap();

    assert_eq!(driver.create_count(), 0);
    assert_eq!(driver.delete_count(), 0);
}

#[tokio::test]
async fn test_delete_failure_aborts_reconcile() {
    let driver = Arc::new(MemoryDriver::new());
    for name in ["a", "b", "c"] {
        seed_worker(&driver, name, "kindest/node:v1.28.0");
    }
    driver.fail_delete_of("b");
    let mut np = open_pool(&driver, 3, "v1.29.2", Vec::new()).await;

    let err = np.reconcile_machines().await.unwrap_err();

    match &err {
        NodePoolError::DeleteMachine { name, .. } => assert_eq!(name, "b"),
        other => panic!("unexpected error {}", other),
    }
    assert!(err.to_string().contains("failed to delete machine b"));
    // "a" went before the failure, "c" was never touched, nothing was created
    assert_eq!(driver.names(), vec!["b", "c"]);
    assert_eq!(driver.create_count(), 0);
}

#[tokio::test]
async fn test_create_failure_is_surfaced() {
    let driver = Arc::new(MemoryDriver::new());
    driver.fail_creates(true);
    let mut np = open_pool(&driver, 2, "v1.29.2", Vec::new()).await;

    let err = np.reconcile_machines().await.unwrap_err();
    assert!(matches!(err, NodePoolError::CreateMachine { .. }));
    assert!(driver.names().is_empty());
}

#[tokio::test]
async fn test_partial_create_failure_keeps_registry_sorted() {
    let driver = Arc::new(MemoryDriver::new());
    seed_worker(&driver, "zz", V1_29);
    driver.fail_creates_after(1);
    let mut np = open_pool(&driver, 3, "v1.29.2", Vec::new()).await;

    let err = np.reconcile_machines().await.unwrap_err();
    assert!(matches!(err, NodePoolError::CreateMachine { .. }));

    let order = names(&np);
    assert_eq!(order.len(), 2);
    assert!(order[0].starts_with("worker-"));
    assert_eq!(order[1], "zz");
    let persisted: Vec<String> = np.current_statuses().into_iter().map(|s| s.name).collect();
    assert_eq!(persisted, order);
}

#[tokio::test]
async fn test_pool_delete_removes_everything() {
    let driver = Arc::new(MemoryDriver::new());
    for name in ["a", "b"] {
        seed_worker(&driver, name, V1_29);
    }
    let mut np = open_pool(&driver, 2, "v1.29.2", Vec::new()).await;

    np.delete().await.unwrap();

    assert!(driver.names().is_empty());
    assert!(np.current_statuses().is_empty());
}

#[tokio::test]
async fn test_pool_delete_stops_at_first_failure() {
    let driver = Arc::new(MemoryDriver::new());
    for name in ["a", "b", "c"] {
        seed_worker(&driver, name, V1_29);
    }
    driver.fail_delete_of("b");
    let mut np = open_pool(&driver, 3, "v1.29.2", Vec::new()).await;

    assert!(np.delete().await.is_err());
    assert_eq!(driver.names(), vec!["b", "c"]);
}
