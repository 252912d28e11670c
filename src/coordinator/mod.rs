//! Control plane
//!
//! The control plane is responsible for:
//! - Tenant and volume records
//! - Use locks (at most one holder per volume)
//! - Driving create and remove through the storage backend
//!
//! It holds no mutable state of its own; mutual exclusion lives entirely in
//! the shared store.

pub mod http;
pub mod lock;
pub mod metadata;
pub mod server;

pub use lock::{LeasePrecondition, UseConfig, UseLocker, UseReason};
pub use metadata::{MetadataStore, RequestCreate, TenantConfig, VolumeConfig, VolumeOptions};
pub use server::Master;
