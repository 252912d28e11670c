//! Operational background tasks: reconciliation and scheduled snapshots.

pub mod reconcile;
pub mod snapshot;

pub use reconcile::{ReconcileReport, Reconciler};
pub use snapshot::{run_schedule, SnapshotReport};
