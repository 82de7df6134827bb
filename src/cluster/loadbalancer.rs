//! Load balancer controller
//!
//! Each cluster gets one haproxy container in front of its control-plane
//! nodes. Configuration updates are written into the container, read back
//! and compared, and only then applied with SIGHUP.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::haproxy::{self, BackendServer, ConfigData, TemplateError, CONFIG_PATH, DEFAULT_TEMPLATE};
use crate::config::{ClusterSpec, IpFamily, LoadBalancerSpec, SpecError};
use crate::runtime::driver::{ContainerDriver, CreateMachine, DriverError, Machine, PortMapping};
use crate::runtime::image::load_balancer_image;
use crate::runtime::labels::{LabelFilter, NodeRole, CLUSTER_LABEL};

/// Port the Kubernetes API server listens on in every node
pub const API_SERVER_PORT: u16 = 6443;

/// Weight of a backend server absent an override
pub const DEFAULT_WEIGHT: u32 = 100;

/// Signal that makes haproxy reload its configuration
pub const RELOAD_SIGNAL: &str = "SIGHUP";

/// Errors from load balancer operations
#[derive(Error, Debug)]
pub enum LoadBalancerError {
    #[error("create load balancer: cluster name is empty")]
    EmptyClusterName,

    #[error("create load balancer: {0}")]
    IpFamily(#[from] SpecError),

    #[error("create load balancer: invalid frontend port {0:?}")]
    InvalidPort(String),

    #[error("found {count} load balancer containers for cluster {cluster}, expected at most one")]
    Ambiguous { cluster: String, count: usize },

    #[error("unable to configure load balancer: load balancer container does not exist")]
    NotConfigurable,

    #[error("load balancer container for cluster {0} does not exist")]
    NoContainer(String),

    #[error("load balancer IP cannot be empty: container {0} does not have an associated IP address")]
    EmptyIp(String),

    #[error("read load balancer configuration does not match written file")]
    ConfigMismatch,

    #[error("failed to render load balancer configuration: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse the frontend port; "" and "0" select the API server port.
pub fn parse_frontend_port(port: &str) -> Result<u16, LoadBalancerError> {
    match port.trim() {
        "" | "0" => Ok(API_SERVER_PORT),
        other => other
            .parse::<u16>()
            .map_err(|_| LoadBalancerError::InvalidPort(port.to_string())),
    }
}

/// Wildcard listen address for the IP family
pub fn listen_address(ip_family: IpFamily) -> &'static str {
    match ip_family {
        IpFamily::IPv6 => "::",
        IpFamily::IPv4 | IpFamily::DualStack => "0.0.0.0",
    }
}

/// Pick the address matching the IP family out of an (IPv4, IPv6) pair
pub fn select_address(ip_family: IpFamily, ipv4: String, ipv6: String) -> String {
    match ip_family {
        IpFamily::IPv6 => ipv6,
        IpFamily::IPv4 | IpFamily::DualStack => ipv4,
    }
}

/// Weight for a node: the caller's override, or the default
pub fn backend_weight(weights: &HashMap<String, u32>, node: &str) -> u32 {
    weights.get(node).copied().unwrap_or(DEFAULT_WEIGHT)
}

// ============================================================================
// SBIO: I/O - load balancer container management
// ============================================================================

/// The load balancer of one cluster
pub struct LoadBalancer {
    driver: Arc<dyn ContainerDriver>,
    name: String,
    image: String,
    container: Option<Machine>,
    ip_family: IpFamily,
    frontend_port: u16,
    backend_port: u16,
}

impl LoadBalancer {
    /// Look up the cluster's load balancer container, if there is one.
    pub async fn new(
        driver: Arc<dyn ContainerDriver>,
        cluster: &ClusterSpec,
        image_repository: Option<&str>,
        image_tag: Option<&str>,
        port: &str,
    ) -> Result<Self, LoadBalancerError> {
        if cluster.name.is_empty() {
            return Err(LoadBalancerError::EmptyClusterName);
        }
        let ip_family = cluster.ip_family()?;
        let frontend_port = parse_frontend_port(port)?;

        // Stopped containers are listed too; they just have no address
        let filter = LabelFilter::for_role(&cluster.name, NodeRole::ExternalLoadBalancer);
        let mut found = driver.list(&filter).await?;
        if found.len() > 1 {
            return Err(LoadBalancerError::Ambiguous {
                cluster: cluster.name.clone(),
                count: found.len(),
            });
        }
        let container = found.pop();
        debug!(
            "Load balancer for cluster {}: {}",
            cluster.name,
            container.as_ref().map(Machine::name).unwrap_or("<none>")
        );

        Ok(Self {
            driver,
            name: cluster.name.clone(),
            image: load_balancer_image(image_repository, image_tag),
            container,
            ip_family,
            frontend_port,
            backend_port: API_SERVER_PORT,
        })
    }

    /// Same as [`LoadBalancer::new`], reading settings from a manifest entry
    pub async fn from_spec(
        driver: Arc<dyn ContainerDriver>,
        cluster: &ClusterSpec,
        spec: &LoadBalancerSpec,
    ) -> Result<Self, LoadBalancerError> {
        Self::new(
            driver,
            cluster,
            spec.image_repository.as_deref(),
            spec.image_tag.as_deref(),
            spec.port.as_deref().unwrap_or(""),
        )
        .await
    }

    /// Name of the load balancer container
    pub fn container_name(&self) -> String {
        format!("{}-lb", self.name)
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container(&self) -> Option<&Machine> {
        self.container.as_ref()
    }

    pub fn ip_family(&self) -> IpFamily {
        self.ip_family
    }

    pub fn frontend_port(&self) -> u16 {
        self.frontend_port
    }

    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }

    /// Create the container unless it already exists.
    pub async fn create(&mut self) -> Result<(), LoadBalancerError> {
        if self.container.is_some() {
            debug!("Load balancer {} already exists", self.container_name());
            return Ok(());
        }

        let mut request = CreateMachine::new(
            self.container_name(),
            &self.image,
            NodeRole::ExternalLoadBalancer,
        );
        request
            .labels
            .insert(CLUSTER_LABEL.to_string(), self.name.clone());
        request.port_mappings.push(PortMapping {
            listen_address: listen_address(self.ip_family).to_string(),
            host_port: 0,
            container_port: self.frontend_port,
        });

        info!(
            "Creating load balancer {} ({}, {})",
            request.name, self.image, self.ip_family
        );
        self.container = Some(self.driver.create(&request).await?);
        Ok(())
    }

    /// Collect the control-plane nodes as backend servers
    async fn backend_servers(
        &self,
        weights: &HashMap<String, u32>,
    ) -> Result<BTreeMap<String, BackendServer>, LoadBalancerError> {
        let filter = LabelFilter::for_role(&self.name, NodeRole::ControlPlane);
        let nodes = self.driver.list(&filter).await?;

        let mut servers = BTreeMap::new();
        for node in nodes {
            let (ipv4, ipv6) = self.driver.ip(&node).await?;
            let address = select_address(self.ip_family, ipv4, ipv6);
            let weight = backend_weight(weights, node.name());
            servers.insert(node.name, BackendServer { address, weight });
        }
        Ok(servers)
    }

    /// Render the configuration for the current control-plane nodes, write
    /// it, verify it, and reload haproxy.
    ///
    /// `config_template` replaces the built-in template when set.
    pub async fn update_configuration(
        &self,
        weights: &HashMap<String, u32>,
        config_template: Option<&str>,
    ) -> Result<(), LoadBalancerError> {
        let container = self
            .container
            .as_ref()
            .ok_or(LoadBalancerError::NotConfigurable)?;

        let data = ConfigData {
            frontend_port: self.frontend_port,
            backend_port: self.backend_port,
            backend_servers: self.backend_servers(weights).await?,
            ipv6: self.ip_family == IpFamily::IPv6,
        };
        let template = config_template
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TEMPLATE);
        let rendered = haproxy::config(&data, template)?;

        info!(
            "Updating load balancer {} configuration with {} backend servers",
            container.name(),
            data.backend_servers.len()
        );
        self.driver
            .write_file(container, CONFIG_PATH, rendered.as_bytes())
            .await?;

        // The write can land after exec returns; never reload a partial file
        let read_back = self.driver.read_file(container, CONFIG_PATH).await?;
        if read_back != rendered.as_bytes() {
            return Err(LoadBalancerError::ConfigMismatch);
        }

        self.driver.kill(container, RELOAD_SIGNAL).await?;
        Ok(())
    }

    /// Address of the load balancer for the cluster's IP family
    pub async fn ip(&self) -> Result<String, LoadBalancerError> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| LoadBalancerError::NoContainer(self.name.clone()))?;
        let (ipv4, ipv6) = self.driver.ip(container).await?;
        let address = select_address(self.ip_family, ipv4, ipv6);
        if address.is_empty() {
            return Err(LoadBalancerError::EmptyIp(self.container_name()));
        }
        Ok(address)
    }

    /// Remove the container if there is one.
    pub async fn delete(&mut self) -> Result<(), LoadBalancerError> {
        if let Some(container) = &self.container {
            info!("Deleting load balancer {}", container.name());
            self.driver.delete(container).await?;
            self.container = None;
        }
        Ok(())
    }
}
