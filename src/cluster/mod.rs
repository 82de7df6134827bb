//! # Cluster infrastructure controllers
//!
//! Two controllers drive containers toward a declared cluster shape:
//!
//! - **NodePool**: keeps the worker containers of a machine pool at the
//!   desired count and image, deleting in priority order and replacing
//!   outdated machines by recreation
//! - **LoadBalancer**: one haproxy container per cluster fronting the
//!   control-plane nodes; configuration is written, verified, then reloaded
//!
//! Both are driven by an outer loop that calls them once per pass. Neither
//! retries internally or locks; one instance serves one cluster at a time.
//!
//! ```text
//!            ┌──────────────────────────┐
//!            │  reconcile loop / CLI    │
//!            └────────────┬─────────────┘
//!                 ┌───────┴────────┐
//!                 ▼                ▼
//!          ┌────────────┐   ┌──────────────┐
//!          │  NodePool  │   │ LoadBalancer │
//!          └─────┬──────┘   └──────┬───────┘
//!                └────────┬────────┘
//!                         ▼
//!               ┌──────────────────┐
//!               │ ContainerDriver  │
//!               └──────────────────┘
//! ```

pub mod haproxy;
pub mod loadbalancer;
pub mod nodepool;

pub use haproxy::{BackendServer, ConfigData, TemplateError};
pub use loadbalancer::{LoadBalancer, LoadBalancerError};
pub use nodepool::{
    Convergence, NodePool, NodePoolError, NodePoolMachine, NodePoolMachineStatus,
};
