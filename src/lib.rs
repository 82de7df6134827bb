//! capd: container-backed node pools and their control-plane load balancer
//!
//! - [`cluster`]: node pool reconciler and load balancer controller
//! - [`runtime`]: container driver seam (docker CLI and in-memory)
//! - [`config`]: manifests, desired-state types, persisted statuses
//! - [`cli`]: command-line surface

pub mod cli;
pub mod cluster;
pub mod config;
pub mod runtime;
