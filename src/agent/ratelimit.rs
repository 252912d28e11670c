//! Block I/O throttling for mounted devices
//!
//! The agent only depends on the [`RateLimiter`] contract: given a device's
//! major/minor pair and the volume's limits, apply them. The shipped
//! implementation writes cgroup-v1 blkio throttle files.

use crate::common::Result;
use crate::coordinator::metadata::RateLimitOptions;
use crate::storage::MountRecord;
use std::path::PathBuf;
use tracing::debug;

pub trait RateLimiter: Send + Sync {
    fn apply(&self, record: &MountRecord, limits: &RateLimitOptions) -> Result<()>;
}

/// Writes `<major>:<minor> <value>` into `blkio.throttle.*_device` under `root`.
#[derive(Debug, Clone)]
pub struct CgroupBlkioLimiter {
    root: PathBuf,
}

impl CgroupBlkioLimiter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RateLimiter for CgroupBlkioLimiter {
    fn apply(&self, record: &MountRecord, limits: &RateLimitOptions) -> Result<()> {
        let settings = [
            ("blkio.throttle.read_bps_device", limits.read_bps),
            ("blkio.throttle.write_bps_device", limits.write_bps),
            ("blkio.throttle.read_iops_device", limits.read_iops),
            ("blkio.throttle.write_iops_device", limits.write_iops),
        ];

        for (file, value) in settings {
            let Some(value) = value.filter(|v| *v > 0) else {
                continue;
            };
            let line = format!("{}:{} {}\n", record.dev_major, record.dev_minor, value);
            std::fs::write(self.root.join(file), line.as_bytes())?;
            debug!(device = %record.device.display(), file, value, "Applied throttle");
        }
        Ok(())
    }
}

/// Leaves devices unthrottled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

impl RateLimiter for NoopLimiter {
    fn apply(&self, _record: &MountRecord, _limits: &RateLimitOptions) -> Result<()> {
        Ok(())
    }
}
