//! CLI module for capd
//!
//! Subcommands:
//! - `capd pool reconcile|delete|status` - converge or tear down a node pool
//! - `capd lb create|update|ip|delete` - manage the cluster load balancer

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::runtime::docker::DEFAULT_NETWORK;

#[derive(Parser, Debug)]
#[command(name = "capd")]
#[command(about = "Reconcile container-backed node pools and their control-plane load balancer")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Container network machines are attached to
    #[arg(long, global = true, env = "CAPD_NETWORK", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Docker CLI binary
    #[arg(long, global = true, env = "CAPD_DOCKER", default_value = "docker")]
    pub docker: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the node pool described by a manifest
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Manage the load balancer of a cluster
    Lb {
        #[command(subcommand)]
        action: LbAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum PoolAction {
    /// Run one reconcile pass and persist machine statuses
    Reconcile(PoolArgs),

    /// Delete every machine of the pool
    Delete(PoolArgs),

    /// Show machines and convergence without changing anything
    Status(PoolArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Path to the manifest (YAML)
    #[arg(short = 'f', long = "file")]
    pub manifest: PathBuf,

    /// Machine status file (default: ~/.capd/<cluster>-<pool>.json)
    #[arg(long)]
    pub state: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum LbAction {
    /// Create the load balancer container if it does not exist
    Create(LbArgs),

    /// Regenerate the configuration from the control-plane nodes and reload
    Update(LbUpdateArgs),

    /// Print the load balancer address
    Ip(LbArgs),

    /// Delete the load balancer container
    Delete(LbArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LbArgs {
    /// Path to the manifest (YAML)
    #[arg(short = 'f', long = "file")]
    pub manifest: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct LbUpdateArgs {
    #[command(flatten)]
    pub target: LbArgs,

    /// Backend weight override, e.g. demo-control-plane-x1=50
    #[arg(long = "weight", value_name = "NODE=WEIGHT")]
    pub weights: Vec<String>,
}
