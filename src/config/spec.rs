//! Desired-state snapshots
//!
//! These types describe what the cluster should look like. They are read-only
//! inputs to the node pool and load balancer controllers.

use std::fmt;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::Mount;

/// Errors while deriving settings from a desired-state snapshot
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid CIDR block {0:?}")]
    InvalidCidr(String),

    #[error("too many CIDR blocks: {0:?}")]
    TooManyCidrs(Vec<String>),

    #[error("dual-stack CIDR blocks must contain one IPv4 and one IPv6 block: {0:?}")]
    SameFamilyCidrs(Vec<String>),

    #[error("pods and services IP family mismatch: {pods} vs {services}")]
    FamilyMismatch { pods: IpFamily, services: IpFamily },
}

/// IP family of a cluster network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpFamily {
    IPv4,
    IPv6,
    DualStack,
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::IPv4 => f.write_str("IPv4"),
            IpFamily::IPv6 => f.write_str("IPv6"),
            IpFamily::DualStack => f.write_str("DualStack"),
        }
    }
}

/// Pod and service CIDR blocks of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    #[serde(default)]
    pub pods: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Cluster-level desired state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub network: ClusterNetwork,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: ClusterNetwork::default(),
        }
    }

    pub fn with_pods(mut self, cidrs: &[&str]) -> Self {
        self.network.pods = cidrs.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_services(mut self, cidrs: &[&str]) -> Self {
        self.network.services = cidrs.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Determine the cluster IP family from its CIDR blocks
    ///
    /// No blocks at all means IPv4. When both pods and services are set
    /// their families must agree.
    pub fn ip_family(&self) -> Result<IpFamily, SpecError> {
        let pods = &self.network.pods;
        let services = &self.network.services;
        match (pods.is_empty(), services.is_empty()) {
            (true, true) => Ok(IpFamily::IPv4),
            (false, true) => family_for_cidrs(pods),
            (true, false) => family_for_cidrs(services),
            (false, false) => {
                let pods = family_for_cidrs(pods)?;
                let services = family_for_cidrs(services)?;
                if pods != services {
                    return Err(SpecError::FamilyMismatch { pods, services });
                }
                Ok(pods)
            }
        }
    }
}

fn cidr_family(cidr: &str) -> Result<IpFamily, SpecError> {
    match cidr.parse::<IpNet>() {
        Ok(IpNet::V4(_)) => Ok(IpFamily::IPv4),
        Ok(IpNet::V6(_)) => Ok(IpFamily::IPv6),
        Err(_) => Err(SpecError::InvalidCidr(cidr.to_string())),
    }
}

fn family_for_cidrs(cidrs: &[String]) -> Result<IpFamily, SpecError> {
    match cidrs {
        [single] => cidr_family(single),
        [first, second] => {
            if cidr_family(first)? == cidr_family(second)? {
                Err(SpecError::SameFamilyCidrs(cidrs.to_vec()))
            } else {
                Ok(IpFamily::DualStack)
            }
        }
        _ => Err(SpecError::TooManyCidrs(cidrs.to_vec())),
    }
}

/// Infrastructure template for machines of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// Image overriding the one derived from the version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,
}

/// Machine pool desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolSpec {
    pub name: String,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Kubernetes version, e.g. "v1.29.2"
    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_domains: Vec<String>,

    #[serde(default)]
    pub template: MachineTemplate,
}

fn default_replicas() -> u32 {
    1
}

impl MachinePoolSpec {
    pub fn new(name: impl Into<String>, replicas: u32, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replicas,
            version: version.into(),
            failure_domains: Vec::new(),
            template: MachineTemplate::default(),
        }
    }

    pub fn with_failure_domains(mut self, domains: &[&str]) -> Self {
        self.failure_domains = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_custom_image(mut self, image: impl Into<String>) -> Self {
        self.template.custom_image = Some(image.into());
        self
    }
}

/// Load balancer desired state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Frontend port; "0" or empty selects the API server port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Raw configuration template replacing the built-in one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_template: Option<String>,
}
