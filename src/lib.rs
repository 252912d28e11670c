//! # blocklease
//!
//! Block volumes for containers across a fleet of hosts, with at most one
//! host holding a given volume at any time:
//! - Lease-based use locks over a linearizable store (etcd)
//! - Ceph RBD images driven through the `rbd` tool
//! - A stateless control plane, a node agent per host, and a reconciler
//!
//! ## Architecture
//!
//! ```text
//!  container runtime
//!        │ VolumeDriver.*
//! ┌──────▼───────┐   HTTP    ┌────────────────┐
//! │  Node agent  ├──────────►│ Control plane  │
//! │ (every host) │           │  (stateless)   │
//! └──────┬───────┘           └───┬────────┬───┘
//!        │ rbd map/mount         │ leases │ rbd create/rm
//!        ▼                       ▼        ▼
//!   local devices            ┌──────┐  ┌──────┐
//!                            │ etcd │  │ Ceph │
//!   Reconciler ─────────────►└──────┘  └──────┘
//! ```
//!
//! ## Usage
//!
//! ### Register a tenant
//! ```bash
//! blocklease tenant upload tenant1 --file tenant1.json
//! ```
//!
//! ### Start the control plane
//! ```bash
//! blocklease-master --bind 0.0.0.0:8080 --etcd http://127.0.0.1:2379
//! ```
//!
//! ### Start an agent on each host
//! ```bash
//! blocklease-agent --master http://master:8080
//! ```
//!
//! ### Start the reconciler
//! ```bash
//! blocklease-supervisor --interval 60
//! ```

#![allow(clippy::result_large_err)]

pub mod agent;
pub mod common;
pub mod coordinator;
pub mod ops;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use agent::{Agent, NodeAgent};
pub use common::{Config, Error, Result};
pub use coordinator::Master;
pub use ops::Reconciler;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
