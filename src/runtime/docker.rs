//! Docker-backed container driver
//!
//! This module drives containers through the `docker` CLI. Argument building
//! and output parsing are pure functions; `DockerDriver` is the thin I/O
//! layer that executes them.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::driver::{ContainerDriver, CreateMachine, DriverError, Machine, Mount, PortMapping};
use super::labels::{LabelFilter, NodeRole};

/// Default docker network containers are attached to
pub const DEFAULT_NETWORK: &str = "kind";

/// Errors that can occur while running docker commands
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker not available: {0}")]
    NotAvailable(String),

    #[error("docker {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unexpected docker output: {0}")]
    UnexpectedOutput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn format_mount(mount: &Mount) -> String {
    if mount.read_only {
        format!("{}:{}:ro", mount.host_path, mount.container_path)
    } else {
        format!("{}:{}", mount.host_path, mount.container_path)
    }
}

fn format_port_mapping(mapping: &PortMapping) -> String {
    let address = if mapping.listen_address.contains(':') {
        format!("[{}]", mapping.listen_address)
    } else {
        mapping.listen_address.clone()
    };
    let host_port = if mapping.host_port == 0 {
        String::new()
    } else {
        mapping.host_port.to_string()
    };
    format!("{}:{}:{}/TCP", address, host_port, mapping.container_port)
}

/// Generate `docker run` arguments for a machine
///
/// Node roles get the privileged settings a systemd-in-container node needs;
/// the load balancer runs unprivileged.
pub fn generate_run_args(request: &CreateMachine, network: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--tty".to_string(),
    ];

    for (key, value) in request.effective_labels() {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push("--hostname".to_string());
    args.push(request.name.clone());
    args.push("--name".to_string());
    args.push(request.name.clone());
    args.push("--network".to_string());
    args.push(network.to_string());

    if request.role != NodeRole::ExternalLoadBalancer {
        args.extend(
            [
                "--privileged",
                "--security-opt",
                "seccomp=unconfined",
                "--security-opt",
                "apparmor=unconfined",
                "--tmpfs",
                "/tmp",
                "--tmpfs",
                "/run",
                "--volume",
                "/var",
                "--volume",
                "/lib/modules:/lib/modules:ro",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }

    for mount in &request.mounts {
        args.push("--volume".to_string());
        args.push(format_mount(mount));
    }

    for mapping in &request.port_mappings {
        args.push("--publish".to_string());
        args.push(format_port_mapping(mapping));
    }

    args.push(request.image.clone());
    args
}

/// Go template used by `docker ps` so that output can be parsed line by line
pub const PS_FORMAT: &str = "{{.Names}}\t{{.Image}}\t{{.Labels}}";

/// Generate `docker ps` arguments listing all containers matching a filter
pub fn generate_ps_args(filter: &LabelFilter) -> Vec<String> {
    let mut args = vec!["ps".to_string(), "-a".to_string()];
    for (key, value) in filter.iter() {
        args.push("--filter".to_string());
        args.push(format!("label={}={}", key, value));
    }
    args.push("--format".to_string());
    args.push(PS_FORMAT.to_string());
    args
}

/// Parse the comma separated `key=value` label list printed by `docker ps`
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse `docker ps` output produced with [`PS_FORMAT`]
pub fn parse_ps_output(output: &str) -> Result<Vec<Machine>, DockerError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.splitn(3, '\t');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(image), labels) => Ok(Machine::new(name.trim(), image.trim())
                    .with_labels(parse_labels(labels.unwrap_or("")))),
                _ => Err(DockerError::UnexpectedOutput(line.to_string())),
            }
        })
        .collect()
}

/// Go template printing "<ipv4>,<ipv6>" for each attached network
pub const INSPECT_IP_FORMAT: &str =
    "{{range .NetworkSettings.Networks}}{{.IPAddress}},{{.GlobalIPv6Address}}{{end}}";

/// Generate `docker inspect` arguments for address lookup
pub fn generate_inspect_ip_args(container_name: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "-f".to_string(),
        INSPECT_IP_FORMAT.to_string(),
        container_name.to_string(),
    ]
}

/// Parse the output of [`generate_inspect_ip_args`] into (ipv4, ipv6)
///
/// A stopped container has no networks and yields two empty strings.
pub fn parse_inspect_ip_output(output: &str) -> Result<(String, String), DockerError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok((String::new(), String::new()));
    }
    let parts: Vec<&str> = trimmed.split(',').collect();
    match parts.as_slice() {
        [ipv4, ipv6] => Ok((ipv4.trim().to_string(), ipv6.trim().to_string())),
        _ => Err(DockerError::UnexpectedOutput(format!(
            "expected exactly one network, got {:?}",
            trimmed
        ))),
    }
}

/// Generate docker rm arguments
pub fn generate_rm_args(container_name: &str) -> Vec<String> {
    vec![
        "rm".to_string(),
        "-f".to_string(),
        "-v".to_string(),
        container_name.to_string(),
    ]
}

/// Generate arguments that copy stdin to `path` inside the container
pub fn generate_write_file_args(container_name: &str, path: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        "-i".to_string(),
        container_name.to_string(),
        "cp".to_string(),
        "/dev/stdin".to_string(),
        path.to_string(),
    ]
}

/// Generate arguments that print `path` inside the container
pub fn generate_read_file_args(container_name: &str, path: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        container_name.to_string(),
        "cat".to_string(),
        path.to_string(),
    ]
}

/// Generate docker kill arguments
pub fn generate_kill_args(container_name: &str, signal: &str) -> Vec<String> {
    vec![
        "kill".to_string(),
        "--signal".to_string(),
        signal.to_string(),
        container_name.to_string(),
    ]
}

// ============================================================================
// SBIO: I/O - DockerDriver
// ============================================================================

/// Container driver shelling out to the docker CLI
#[derive(Debug, Clone)]
pub struct DockerDriver {
    binary: String,
    network: String,
}

impl DockerDriver {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            network: DEFAULT_NETWORK.to_string(),
        }
    }

    /// Use a different docker network
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Use a different CLI binary (e.g. "podman")
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>, DockerError> {
        debug!("{} {:?}", self.binary, args);

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DockerError::NotAvailable(format!("{}: {}", self.binary, e)))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes).await?;
                // Close stdin so the command sees EOF
                drop(pipe);
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(DockerError::CommandFailed {
                command: args.first().cloned().unwrap_or_default(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, request: &CreateMachine) -> Result<Machine, DriverError> {
        info!("Creating container {} from {}", request.name, request.image);
        let args = generate_run_args(request, &self.network);
        self.run(&args, None)
            .await
            .map_err(|e| DriverError::Create {
                name: request.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Machine::new(&request.name, &request.image).with_labels(request.effective_labels()))
    }

    async fn delete(&self, machine: &Machine) -> Result<(), DriverError> {
        info!("Deleting container {}", machine.name);
        self.run(&generate_rm_args(&machine.name), None)
            .await
            .map_err(|e| DriverError::Delete {
                name: machine.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn list(&self, filter: &LabelFilter) -> Result<Vec<Machine>, DriverError> {
        let stdout = self
            .run(&generate_ps_args(filter), None)
            .await
            .map_err(|e| DriverError::List(e.to_string()))?;
        parse_ps_output(&String::from_utf8_lossy(&stdout))
            .map_err(|e| DriverError::List(e.to_string()))
    }

    async fn ip(&self, machine: &Machine) -> Result<(String, String), DriverError> {
        let inspect_err = |e: DockerError| DriverError::Inspect {
            name: machine.name.clone(),
            reason: e.to_string(),
        };
        let stdout = self
            .run(&generate_inspect_ip_args(&machine.name), None)
            .await
            .map_err(inspect_err)?;
        parse_inspect_ip_output(&String::from_utf8_lossy(&stdout)).map_err(inspect_err)
    }

    async fn write_file(
        &self,
        machine: &Machine,
        path: &str,
        contents: &[u8],
    ) -> Result<(), DriverError> {
        self.run(&generate_write_file_args(&machine.name, path), Some(contents))
            .await
            .map_err(|e| DriverError::WriteFile {
                name: machine.name.clone(),
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_file(&self, machine: &Machine, path: &str) -> Result<Vec<u8>, DriverError> {
        self.run(&generate_read_file_args(&machine.name, path), None)
            .await
            .map_err(|e| DriverError::ReadFile {
                name: machine.name.clone(),
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn kill(&self, machine: &Machine, signal: &str) -> Result<(), DriverError> {
        self.run(&generate_kill_args(&machine.name, signal), None)
            .await
            .map_err(|e| DriverError::Signal {
                name: machine.name.clone(),
                signal: signal.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
