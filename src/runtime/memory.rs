//! In-memory container driver
//!
//! Keeps containers in a map instead of talking to a container runtime.
//! Failures can be injected per operation to exercise partial-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::driver::{ContainerDriver, CreateMachine, DriverError, Machine};
use super::labels::LabelFilter;

#[derive(Debug, Clone)]
struct MemoryContainer {
    machine: Machine,
    ipv4: String,
    ipv6: String,
    files: HashMap<String, Vec<u8>>,
    signals: Vec<String>,
}

/// Container driver backed by process memory
#[derive(Debug, Default)]
pub struct MemoryDriver {
    containers: DashMap<String, MemoryContainer>,
    next_address: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    fail_creates: AtomicBool,
    limit_creates: AtomicBool,
    create_limit: AtomicUsize,
    corrupt_reads: AtomicBool,
    fail_deletes: DashSet<String>,
    fail_ips: DashSet<String>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_addresses(&self) -> (String, String) {
        let n = self.next_address.fetch_add(1, Ordering::SeqCst) + 2;
        (
            format!("172.18.{}.{}", n / 256, n % 256),
            format!("fc00:f853:ccd:e793::{:x}", n),
        )
    }

    /// Add an already-running container, bypassing the create counter
    pub fn insert(&self, machine: Machine) {
        let (ipv4, ipv6) = self.allocate_addresses();
        self.containers.insert(
            machine.name.clone(),
            MemoryContainer {
                machine,
                ipv4,
                ipv6,
                files: HashMap::new(),
                signals: Vec::new(),
            },
        );
    }

    /// Override the addresses reported for a container
    pub fn set_addresses(&self, name: &str, ipv4: &str, ipv6: &str) {
        if let Some(mut container) = self.containers.get_mut(name) {
            container.ipv4 = ipv4.to_string();
            container.ipv6 = ipv6.to_string();
        }
    }

    /// Make every subsequent create fail
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Let `n` more creates succeed, then fail the rest
    pub fn fail_creates_after(&self, n: usize) {
        self.create_limit
            .store(self.creates.load(Ordering::SeqCst) + n, Ordering::SeqCst);
        self.limit_creates.store(true, Ordering::SeqCst);
    }

    /// Make deleting the named container fail
    pub fn fail_delete_of(&self, name: &str) {
        self.fail_deletes.insert(name.to_string());
    }

    /// Make address lookup of the named container fail
    pub fn fail_ip_of(&self, name: &str) {
        self.fail_ips.insert(name.to_string());
    }

    /// Return content different from what was written on every read
    pub fn corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Names of all containers, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Machine> {
        self.containers.get(name).map(|c| c.machine.clone())
    }

    pub fn file(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        self.containers
            .get(name)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub fn signals(&self, name: &str) -> Vec<String> {
        self.containers
            .get(name)
            .map(|c| c.signals.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerDriver for MemoryDriver {
    async fn create(&self, request: &CreateMachine) -> Result<Machine, DriverError> {
        let over_limit = self.limit_creates.load(Ordering::SeqCst)
            && self.creates.load(Ordering::SeqCst) >= self.create_limit.load(Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) || over_limit {
            return Err(DriverError::Create {
                name: request.name.clone(),
                reason: "memory driver configured to fail".to_string(),
            });
        }
        if self.containers.contains_key(&request.name) {
            return Err(DriverError::Create {
                name: request.name.clone(),
                reason: "name already in use".to_string(),
            });
        }

        let machine = Machine::new(&request.name, &request.image)
            .with_labels(request.effective_labels());
        debug!("[MEMORY] Creating container {}", machine.name);
        self.insert(machine.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(machine)
    }

    async fn delete(&self, machine: &Machine) -> Result<(), DriverError> {
        if self.fail_deletes.contains(&machine.name) {
            return Err(DriverError::Delete {
                name: machine.name.clone(),
                reason: "memory driver configured to fail".to_string(),
            });
        }
        debug!("[MEMORY] Deleting container {}", machine.name);
        if self.containers.remove(&machine.name).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list(&self, filter: &LabelFilter) -> Result<Vec<Machine>, DriverError> {
        Ok(self
            .containers
            .iter()
            .filter(|c| filter.matches(&c.machine.labels))
            .map(|c| c.machine.clone())
            .collect())
    }

    async fn ip(&self, machine: &Machine) -> Result<(String, String), DriverError> {
        if self.fail_ips.contains(&machine.name) {
            return Err(DriverError::Inspect {
                name: machine.name.clone(),
                reason: "memory driver configured to fail".to_string(),
            });
        }
        self.containers
            .get(&machine.name)
            .map(|c| (c.ipv4.clone(), c.ipv6.clone()))
            .ok_or_else(|| DriverError::NotFound(machine.name.clone()))
    }

    async fn write_file(
        &self,
        machine: &Machine,
        path: &str,
        contents: &[u8],
    ) -> Result<(), DriverError> {
        let mut container = self
            .containers
            .get_mut(&machine.name)
            .ok_or_else(|| DriverError::NotFound(machine.name.clone()))?;
        container.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, machine: &Machine, path: &str) -> Result<Vec<u8>, DriverError> {
        let container = self
            .containers
            .get(&machine.name)
            .ok_or_else(|| DriverError::NotFound(machine.name.clone()))?;
        let mut contents = container
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| DriverError::ReadFile {
                name: machine.name.clone(),
                path: path.to_string(),
                reason: "no such file".to_string(),
            })?;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            // Simulates a write that has not landed yet
            contents.truncate(contents.len() / 2);
        }
        Ok(contents)
    }

    async fn kill(&self, machine: &Machine, signal: &str) -> Result<(), DriverError> {
        let mut container = self
            .containers
            .get_mut(&machine.name)
            .ok_or_else(|| DriverError::NotFound(machine.name.clone()))?;
        container.signals.push(signal.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::labels::{NodeRole, CLUSTER_LABEL};

    fn request(name: &str) -> CreateMachine {
        let mut req = CreateMachine::new(name, "kindest/node:v1.29.2", NodeRole::Worker);
        req.labels
            .insert(CLUSTER_LABEL.to_string(), "demo".to_string());
        req
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let driver = MemoryDriver::new();
        driver.create(&request("worker-a")).await.unwrap();
        driver.create(&request("worker-b")).await.unwrap();

        let listed = driver
            .list(&LabelFilter::for_role("demo", NodeRole::Worker))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(driver.create_count(), 2);

        let other = driver.list(&LabelFilter::for_cluster("other")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let driver = MemoryDriver::new();
        driver.create(&request("worker-a")).await.unwrap();
        assert!(driver.create(&request("worker-a")).await.is_err());
    }

    #[tokio::test]
    async fn test_creates_fail_after_limit() {
        let driver = MemoryDriver::new();
        driver.create(&request("worker-a")).await.unwrap();
        driver.fail_creates_after(1);

        driver.create(&request("worker-b")).await.unwrap();
        assert!(driver.create(&request("worker-c")).await.is_err());
        assert_eq!(driver.create_count(), 2);
    }

    #[tokio::test]
    async fn test_file_roundtrip_and_corruption() {
        let driver = MemoryDriver::new();
        let machine = driver.create(&request("lb")).await.unwrap();

        driver.write_file(&machine, "/etc/cfg", b"hello world").await.unwrap();
        assert_eq!(
            driver.read_file(&machine, "/etc/cfg").await.unwrap(),
            b"hello world".to_vec()
        );

        driver.corrupt_reads(true);
        assert_ne!(
            driver.read_file(&machine, "/etc/cfg").await.unwrap(),
            b"hello world".to_vec()
        );
    }

    #[tokio::test]
    async fn test_injected_delete_failure() {
        let driver = MemoryDriver::new();
        let machine = driver.create(&request("worker-a")).await.unwrap();
        driver.fail_delete_of("worker-a");

        assert!(driver.delete(&machine).await.is_err());
        assert_eq!(driver.names(), vec!["worker-a".to_string()]);
    }

    #[tokio::test]
    async fn test_addresses_are_unique() {
        let driver = MemoryDriver::new();
        let a = driver.create(&request("a")).await.unwrap();
        let b = driver.create(&request("b")).await.unwrap();

        let (a4, a6) = driver.ip(&a).await.unwrap();
        let (b4, b6) = driver.ip(&b).await.unwrap();
        assert_ne!(a4, b4);
        assert_ne!(a6, b6);
    }
}
