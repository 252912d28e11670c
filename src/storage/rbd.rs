//! Ceph RBD backend driven through the `rbd` and `ceph` command-line tools.

use super::mount::{is_errno, MountTable};
use super::parse::{parse_names, parse_showmapped, parse_snapshot_list, MappedDevice};
use super::{mount_path, CreateOutcome, FsOptions, MountRecord, VolumeBackend, VolumeSpec};
use crate::common::{template_fs_cmd, Error, Executor, Invocation, Result, StorageConfig};
use async_trait::async_trait;
use nix::errno::Errno;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Snapshot names may not contain spaces; they become `-`.
fn snapshot_name(name: &str) -> String {
    name.replace(' ', "-")
}

pub struct RbdDriver {
    config: StorageConfig,
    host: String,
    exec: Arc<dyn Executor>,
    mounts: Arc<dyn MountTable>,
}

impl RbdDriver {
    pub fn new(
        config: StorageConfig,
        host: impl Into<String>,
        exec: Arc<dyn Executor>,
        mounts: Arc<dyn MountTable>,
    ) -> Self {
        Self {
            config,
            host: host.into(),
            exec,
            mounts,
        }
    }

    fn rbd(&self) -> Invocation {
        Invocation::new(&self.config.rbd_binary)
    }

    async fn run(&self, invocation: Invocation) -> Result<String> {
        let out = self
            .exec
            .run_checked(&invocation, self.config.command_timeout())
            .await?;
        Ok(out.stdout)
    }

    pub async fn pool_exists(&self, pool: &str) -> Result<bool> {
        let out = self
            .run(Invocation::new(&self.config.ceph_binary).args(["osd", "pool", "ls"]))
            .await?;
        Ok(parse_names(&out).iter().any(|p| p == pool))
    }

    async fn showmapped(&self) -> Result<Vec<MappedDevice>> {
        let out = self.run(self.rbd().arg("showmapped")).await?;
        Ok(parse_showmapped(&out, &self.config.device_prefix))
    }

    async fn mapped_device(&self, vol: &VolumeSpec) -> Result<Option<PathBuf>> {
        Ok(self
            .showmapped()
            .await?
            .into_iter()
            .find(|m| m.pool == vol.pool && m.image == vol.name)
            .map(|m| PathBuf::from(m.device)))
    }

    /// Map the image, returning the existing device if it is already mapped.
    async fn map_image(&self, vol: &VolumeSpec) -> Result<PathBuf> {
        if let Some(device) = self.mapped_device(vol).await? {
            debug!(volume = %vol, device = %device.display(), "Image already mapped");
            return Ok(device);
        }

        let out = self
            .run(self.rbd().args(["map", &vol.name, "--pool", &vol.pool]))
            .await?;
        let device = out.trim();
        if device.is_empty() {
            // Some rbd versions map silently; look the device up instead.
            return self.mapped_device(vol).await?.ok_or_else(|| {
                Error::Internal(format!("rbd map reported no device for {}", vol))
            });
        }

        debug!(volume = %vol, device, "Mapped image");
        Ok(PathBuf::from(device))
    }

    /// Unmap the image. Not being mapped counts as success.
    async fn unmap_image(&self, vol: &VolumeSpec) -> Result<()> {
        let Some(device) = self.mapped_device(vol).await? else {
            debug!(volume = %vol, "Image not mapped");
            return Ok(());
        };

        self.run(self.rbd().arg("unmap").arg(device.to_string_lossy()))
            .await?;
        debug!(volume = %vol, device = %device.display(), "Unmapped image");
        Ok(())
    }

    async fn mkfs(&self, fs: &FsOptions, device: &Path, timeout: Duration) -> Result<()> {
        let script = template_fs_cmd(&fs.create_command, &device.to_string_lossy());
        info!(command = %script, "Initialising filesystem");
        self.exec
            .run_checked(&Invocation::shell(script), timeout)
            .await?;
        Ok(())
    }

    fn device_numbers(&self, device: &Path) -> Result<(u64, u64)> {
        self.mounts
            .device_numbers(device)
            .map_err(|source| Error::DeviceStat {
                device: device.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl VolumeBackend for RbdDriver {
    fn name(&self) -> &'static str {
        "ceph"
    }

    fn mount_path(&self, pool: &str, name: &str) -> PathBuf {
        mount_path(&self.config.mount_base, pool, name)
    }

    async fn exists(&self, vol: &VolumeSpec) -> Result<bool> {
        let out = self.run(self.rbd().args(["ls", &vol.pool])).await?;
        Ok(parse_names(&out).iter().any(|n| n == &vol.name))
    }

    async fn create(
        &self,
        vol: &VolumeSpec,
        fs: &FsOptions,
        timeout: Duration,
    ) -> Result<CreateOutcome> {
        if !self.pool_exists(&vol.pool).await? {
            return Err(Error::PoolNotFound(vol.pool.clone()));
        }

        if self.exists(vol).await? {
            info!(volume = %vol, "Image already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }

        self.run(self.rbd().args([
            "create",
            &vol.name,
            "--size",
            &vol.size_mb.to_string(),
            "--pool",
            &vol.pool,
        ]))
        .await?;
        info!(volume = %vol, "Created image");

        let device = self.map_image(vol).await?;
        let formatted = self.mkfs(fs, &device, timeout).await;
        let unmapped = self.unmap_image(vol).await;

        formatted?;
        unmapped?;
        Ok(CreateOutcome::Created)
    }

    async fn mount(&self, vol: &VolumeSpec, fs_type: &str) -> Result<MountRecord> {
        let path = self.mount_path(&vol.pool, &vol.name);
        let device = self.map_image(vol).await?;

        self.mounts.create_dir_all(&path).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("error creating {} directory: {}", path.display(), e),
            ))
        })?;

        // Major/minor are what the cgroup throttles key on.
        let (dev_major, dev_minor) = self.device_numbers(&device)?;

        match self.mounts.mount(&device, &path, fs_type) {
            Ok(()) => info!(volume = %vol, path = %path.display(), "Mounted"),
            Err(e) if is_errno(&e, Errno::EBUSY) => {
                debug!(volume = %vol, path = %path.display(), "Already mounted")
            }
            Err(e) => {
                return Err(Error::Io(io::Error::new(
                    e.kind(),
                    format!("failed to mount {}: {}", device.display(), e),
                )))
            }
        }

        Ok(MountRecord {
            pool: vol.pool.clone(),
            volume: vol.name.clone(),
            device,
            path,
            host: self.host.clone(),
            dev_major,
            dev_minor,
        })
    }

    async fn unmount(&self, vol: &VolumeSpec) -> Result<()> {
        let path = self.mount_path(&vol.pool, &vol.name);

        match self.mounts.unmount_lazy(&path) {
            Ok(()) => info!(volume = %vol, path = %path.display(), "Unmounted"),
            Err(e) if is_errno(&e, Errno::ENOENT) || is_errno(&e, Errno::EINVAL) => {
                debug!(volume = %vol, path = %path.display(), "Not mounted")
            }
            Err(e) => {
                return Err(Error::Io(io::Error::new(
                    e.kind(),
                    format!("failed to unmount {}: {}", path.display(), e),
                )))
            }
        }

        match self.mounts.remove_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if is_errno(&e, Errno::EBUSY) => {
                // Another consumer still holds the mount point; leave the device mapped.
                warn!(volume = %vol, path = %path.display(), "Mount directory busy");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Io(io::Error::new(
                    e.kind(),
                    format!("error removing {} directory: {}", path.display(), e),
                )))
            }
        }

        self.unmap_image(vol).await
    }

    async fn remove(&self, vol: &VolumeSpec) -> Result<()> {
        self.run(self.rbd().args(["snap", "purge", &vol.name, "--pool", &vol.pool]))
            .await?;
        self.run(self.rbd().args(["rm", &vol.name, "--pool", &vol.pool]))
            .await?;
        info!(volume = %vol, "Removed image");
        Ok(())
    }

    async fn create_snapshot(&self, vol: &VolumeSpec, snapshot: &str) -> Result<()> {
        let snapshot = snapshot_name(snapshot);
        if self.list_snapshots(vol).await?.contains(&snapshot) {
            return Err(Error::SnapshotExists {
                volume: vol.to_string(),
                snapshot,
            });
        }

        self.run(self.rbd().args([
            "snap",
            "create",
            &vol.name,
            "--snap",
            &snapshot,
            "--pool",
            &vol.pool,
        ]))
        .await?;
        info!(volume = %vol, snapshot, "Created snapshot");
        Ok(())
    }

    async fn remove_snapshot(&self, vol: &VolumeSpec, snapshot: &str) -> Result<()> {
        let snapshot = snapshot_name(snapshot);
        if !self.list_snapshots(vol).await?.contains(&snapshot) {
            return Err(Error::SnapshotNotFound {
                volume: vol.to_string(),
                snapshot,
            });
        }

        self.run(self.rbd().args([
            "snap",
            "rm",
            &vol.name,
            "--snap",
            &snapshot,
            "--pool",
            &vol.pool,
        ]))
        .await?;
        info!(volume = %vol, snapshot, "Removed snapshot");
        Ok(())
    }

    async fn list_snapshots(&self, vol: &VolumeSpec) -> Result<Vec<String>> {
        let out = self
            .run(self.rbd().args(["snap", "ls", &vol.name, "--pool", &vol.pool]))
            .await?;
        Ok(parse_snapshot_list(&out))
    }

    async fn mounted(&self) -> Result<Vec<MountRecord>> {
        let mut records = Vec::new();
        for mapped in self.showmapped().await? {
            let device = PathBuf::from(&mapped.device);
            let (dev_major, dev_minor) = match self.device_numbers(&device) {
                Ok(numbers) => numbers,
                Err(e) => {
                    warn!(device = %device.display(), "Skipping mapped device: {}", e);
                    continue;
                }
            };
            records.push(MountRecord {
                path: self.mount_path(&mapped.pool, &mapped.image),
                pool: mapped.pool,
                volume: mapped.image,
                device,
                host: self.host.clone(),
                dev_major,
                dev_minor,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Output;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCeph {
        images: Mutex<BTreeSet<String>>,
        mapped: Mutex<Option<String>>,
        snapshots: Mutex<Vec<String>>,
        fail_mkfs: bool,
        log: Mutex<Vec<String>>,
    }

    impl FakeCeph {
        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn respond(&self, inv: &Invocation) -> Output {
            let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();
            let ok = |stdout: String| Output {
                code: Some(0),
                stdout,
                stderr: String::new(),
            };
            match (inv.program.as_str(), args.as_slice()) {
                ("ceph", ["osd", "pool", "ls"]) => ok("rbd\n".into()),
                ("rbd", ["ls", _]) => {
                    let images = self.images.lock().unwrap();
                    ok(images.iter().map(|i| format!("{}\n", i)).collect())
                }
                ("rbd", ["create", name, ..]) => {
                    self.images.lock().unwrap().insert(name.to_string());
                    ok(String::new())
                }
                ("rbd", ["showmapped"]) => {
                    let mut out = String::from("id pool image snap device\n");
                    if let Some(image) = self.mapped.lock().unwrap().as_ref() {
                        out.push_str(&format!("0 rbd {} - /dev/rbd0\n", image));
                    }
                    ok(out)
                }
                ("rbd", ["map", name, ..]) => {
                    *self.mapped.lock().unwrap() = Some(name.to_string());
                    ok("/dev/rbd0\n".into())
                }
                ("rbd", ["unmap", _]) => {
                    *self.mapped.lock().unwrap() = None;
                    ok(String::new())
                }
                ("rbd", ["snap", "ls", ..]) => {
                    let mut out = String::from("SNAPID NAME SIZE\n");
                    for (i, s) in self.snapshots.lock().unwrap().iter().enumerate() {
                        out.push_str(&format!("     {} {} 10240 kB\n", i + 1, s));
                    }
                    ok(out)
                }
                ("rbd", ["snap", "create", _, "--snap", snap, ..]) => {
                    self.snapshots.lock().unwrap().push(snap.to_string());
                    ok(String::new())
                }
                ("rbd", ["snap", "rm", _, "--snap", snap, ..]) => {
                    self.snapshots.lock().unwrap().retain(|s| s != snap);
                    ok(String::new())
                }
                ("/bin/sh", ["-c", _]) if self.fail_mkfs => Output {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "mkfs failed".into(),
                },
                _ => ok(String::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for FakeCeph {
        async fn run(&self, inv: &Invocation, _timeout: Duration) -> Result<Output> {
            self.log.lock().unwrap().push(inv.to_string());
            Ok(self.respond(inv))
        }
    }

    #[derive(Default)]
    struct FakeMounts {
        busy_dir: bool,
    }

    impl MountTable for FakeMounts {
        fn mount(&self, _device: &Path, _target: &Path, _fs_type: &str) -> io::Result<()> {
            Ok(())
        }

        fn unmount_lazy(&self, _target: &Path) -> io::Result<()> {
            Err(io::Error::from(Errno::EINVAL))
        }

        fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        fn remove_dir(&self, _path: &Path) -> io::Result<()> {
            if self.busy_dir {
                Err(io::Error::from(Errno::EBUSY))
            } else {
                Ok(())
            }
        }

        fn device_numbers(&self, _device: &Path) -> io::Result<(u64, u64)> {
            Ok((252, 0))
        }

        fn is_mounted(&self, _target: &Path) -> io::Result<bool> {
            Ok(false)
        }
    }

    fn driver(ceph: Arc<FakeCeph>, mounts: FakeMounts) -> RbdDriver {
        RbdDriver::new(StorageConfig::default(), "host1", ceph, Arc::new(mounts))
    }

    fn ext4() -> FsOptions {
        FsOptions {
            fs_type: "ext4".into(),
            create_command: "mkfs.ext4 -m0 %".into(),
        }
    }

    #[tokio::test]
    async fn test_create_maps_formats_and_unmaps() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        let outcome = rbd.create(&vol, &ext4(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);

        let commands = ceph.commands();
        assert!(commands.contains(&"rbd create tenant1.pithos --size 10 --pool rbd".to_string()));
        assert!(commands.contains(&"/bin/sh -c mkfs.ext4 -m0 /dev/rbd0".to_string()));
        assert_eq!(commands.last().unwrap(), "rbd unmap /dev/rbd0");
        assert!(ceph.mapped.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_missing_pool() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("nopool", "tenant1.pithos", 10);

        let err = rbd
            .create(&vol, &ext4(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolNotFound(p) if p == "nopool"));
        assert!(!ceph.commands().iter().any(|c| c.starts_with("rbd create")));
    }

    #[tokio::test]
    async fn test_create_existing_skips_mkfs() {
        let ceph = Arc::new(FakeCeph::default());
        ceph.images.lock().unwrap().insert("tenant1.pithos".into());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        let outcome = rbd.create(&vol, &ext4(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert!(!ceph.commands().iter().any(|c| c.starts_with("/bin/sh")));
    }

    #[tokio::test]
    async fn test_failed_mkfs_still_unmaps() {
        let ceph = Arc::new(FakeCeph {
            fail_mkfs: true,
            ..Default::default()
        });
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        let err = rbd
            .create(&vol, &ext4(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Subprocess { .. }));
        assert!(ceph.mapped.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mount_reports_device_numbers() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        let record = rbd.mount(&vol, "ext4").await.unwrap();
        assert_eq!(record.device, PathBuf::from("/dev/rbd0"));
        assert_eq!(record.path, PathBuf::from("/mnt/ceph/rbd/tenant1.pithos"));
        assert_eq!((record.dev_major, record.dev_minor), (252, 0));

        // Second mount reuses the existing mapping.
        rbd.mount(&vol, "ext4").await.unwrap();
        let maps = ceph
            .commands()
            .iter()
            .filter(|c| c.starts_with("rbd map"))
            .count();
        assert_eq!(maps, 1);
    }

    #[tokio::test]
    async fn test_unmount_is_idempotent() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        rbd.mount(&vol, "ext4").await.unwrap();
        rbd.unmount(&vol).await.unwrap();
        rbd.unmount(&vol).await.unwrap();
        assert!(ceph.mapped.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unmount_busy_dir_keeps_mapping() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts { busy_dir: true });
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        rbd.mount(&vol, "ext4").await.unwrap();
        rbd.unmount(&vol).await.unwrap();
        assert_eq!(
            ceph.mapped.lock().unwrap().as_deref(),
            Some("tenant1.pithos")
        );
    }

    #[tokio::test]
    async fn test_snapshot_rules() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        rbd.create_snapshot(&vol, "nightly backup").await.unwrap();
        assert_eq!(rbd.list_snapshots(&vol).await.unwrap(), vec!["nightly-backup"]);

        let err = rbd.create_snapshot(&vol, "nightly backup").await.unwrap_err();
        assert!(matches!(err, Error::SnapshotExists { .. }));

        let err = rbd.remove_snapshot(&vol, "missing").await.unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));

        // Removal accepts the same spelling creation did.
        rbd.remove_snapshot(&vol, "nightly backup").await.unwrap();
        assert!(rbd.list_snapshots(&vol).await.unwrap().is_empty());
        assert!(ceph
            .commands()
            .contains(&"rbd snap rm tenant1.pithos --snap nightly-backup --pool rbd".to_string()));
    }

    #[tokio::test]
    async fn test_remove_purges_first() {
        let ceph = Arc::new(FakeCeph::default());
        let rbd = driver(ceph.clone(), FakeMounts::default());
        let vol = VolumeSpec::new("rbd", "tenant1.pithos", 10);

        rbd.remove(&vol).await.unwrap();
        assert_eq!(
            ceph.commands(),
            vec![
                "rbd snap purge tenant1.pithos --pool rbd",
                "rbd rm tenant1.pithos --pool rbd"
            ]
        );
    }

    #[tokio::test]
    async fn test_mounted_lists_mappings() {
        let ceph = Arc::new(FakeCeph::default());
        *ceph.mapped.lock().unwrap() = Some("tenant1.pithos".into());
        let rbd = driver(ceph, FakeMounts::default());

        let records = rbd.mounted().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].volume, "tenant1.pithos");
        assert_eq!(records[0].host, "host1");
    }
}
