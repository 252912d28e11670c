//! Host mount table access.

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use procfs::process::Process;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;

/// The OS operations the driver needs around mounting. Abstracted so tests
/// can run the full lifecycle without privileges.
pub trait MountTable: Send + Sync {
    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> io::Result<()>;

    /// Detach lazily: new accesses fail, open handles keep working.
    fn unmount_lazy(&self, target: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Major and minor number of a device node.
    fn device_numbers(&self, device: &Path) -> io::Result<(u64, u64)>;

    fn is_mounted(&self, target: &Path) -> io::Result<bool>;
}

pub(crate) fn is_errno(err: &io::Error, errno: Errno) -> bool {
    err.raw_os_error() == Some(errno as i32)
}

/// mount(2) and friends. Requires CAP_SYS_ADMIN.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

impl MountTable for SystemMounts {
    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> io::Result<()> {
        mount(
            Some(device),
            target,
            Some(fs_type),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(io::Error::from)
    }

    fn unmount_lazy(&self, target: &Path) -> io::Result<()> {
        umount2(target, MntFlags::MNT_DETACH).map_err(io::Error::from)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn device_numbers(&self, device: &Path) -> io::Result<(u64, u64)> {
        let rdev = std::fs::metadata(device)?.rdev();
        Ok((
            nix::sys::stat::major(rdev) as u64,
            nix::sys::stat::minor(rdev) as u64,
        ))
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        let mountinfo = Process::myself()
            .and_then(|p| p.mountinfo())
            .map_err(io::Error::other)?;
        Ok(mountinfo.into_iter().any(|m| m.mount_point == target))
    }
}
