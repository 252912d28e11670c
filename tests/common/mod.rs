//! Shared fixtures: an in-process stand-in for the `rbd`/`ceph` tools and a
//! mount table that keeps file contents per device across mounts.

#![allow(dead_code)]

use async_trait::async_trait;
use blocklease::common::{Config, Executor, Invocation, Output, StoreBackend};
use blocklease::coordinator::http::{create_router, MasterState};
use blocklease::coordinator::{MetadataStore, TenantConfig, UseLocker};
use blocklease::storage::{MountTable, RbdDriver};
use blocklease::store::{Keys, KvStore, MemoryStore};
use nix::errno::Errno;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct CephState {
    pools: HashSet<String>,
    /// (pool, image) → snapshots in creation order
    images: BTreeMap<(String, String), Vec<String>>,
    /// device id → (pool, image)
    mapped: BTreeMap<u32, (String, String)>,
}

/// Answers `rbd` and `ceph` invocations from in-memory state.
#[derive(Default)]
pub struct FakeCeph {
    state: Mutex<CephState>,
    log: Mutex<Vec<String>>,
}

fn ok(stdout: impl Into<String>) -> Output {
    Output {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(code: i32, stderr: &str) -> Output {
    Output {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Value following `--flag`.
fn flag<'a>(args: &[&'a str], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == name)
        .and_then(|i| args.get(i + 1).copied())
}

impl FakeCeph {
    pub fn with_pool(pool: &str) -> Arc<Self> {
        let ceph = Self::default();
        ceph.state.lock().unwrap().pools.insert(pool.to_string());
        Arc::new(ceph)
    }

    pub fn add_image(&self, pool: &str, image: &str) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert((pool.to_string(), image.to_string()), Vec::new());
    }

    pub fn has_image(&self, pool: &str, image: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .images
            .contains_key(&(pool.to_string(), image.to_string()))
    }

    /// Map an image behind the driver's back, as a crashed agent would leave it.
    pub fn map(&self, pool: &str, image: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        let id = (0..).find(|i| !state.mapped.contains_key(i)).unwrap_or(0);
        state
            .mapped
            .insert(id, (pool.to_string(), image.to_string()));
        id
    }

    pub fn mapped_images(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .mapped
            .values()
            .map(|(_, image)| image.clone())
            .collect()
    }

    pub fn snapshots(&self, pool: &str, image: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(&(pool.to_string(), image.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn handle(&self, inv: &Invocation) -> Output {
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();
        let mut state = self.state.lock().unwrap();

        match (inv.program.as_str(), args.as_slice()) {
            ("ceph", ["osd", "pool", "ls"]) => {
                let mut pools: Vec<&String> = state.pools.iter().collect();
                pools.sort();
                ok(pools.iter().map(|p| format!("{}\n", p)).collect::<String>())
            }
            ("rbd", ["ls", pool]) => ok(state
                .images
                .keys()
                .filter(|(p, _)| p.as_str() == *pool)
                .map(|(_, i)| format!("{}\n", i))
                .collect::<String>()),
            ("rbd", ["create", name, rest @ ..]) => {
                let pool = flag(rest, "--pool").unwrap_or("rbd").to_string();
                if !state.pools.contains(&pool) {
                    return fail(2, "rbd: error opening pool");
                }
                let key = (pool, name.to_string());
                if state.images.contains_key(&key) {
                    return fail(17, "rbd: create error: (17) File exists");
                }
                state.images.insert(key, Vec::new());
                ok("")
            }
            ("rbd", ["showmapped"]) => {
                let mut out = String::from("id pool image snap device\n");
                for (id, (pool, image)) in &state.mapped {
                    out.push_str(&format!("{} {} {} - /dev/rbd{}\n", id, pool, image, id));
                }
                ok(out)
            }
            ("rbd", ["map", name, rest @ ..]) => {
                let pool = flag(rest, "--pool").unwrap_or("rbd").to_string();
                let key = (pool, name.to_string());
                if !state.images.contains_key(&key) {
                    return fail(2, "rbd: error opening image");
                }
                let id = (0..).find(|i| !state.mapped.contains_key(i)).unwrap_or(0);
                state.mapped.insert(id, key);
                ok(format!("/dev/rbd{}\n", id))
            }
            ("rbd", ["unmap", device]) => {
                let id = device.trim_start_matches("/dev/rbd").parse::<u32>();
                match id.ok().and_then(|id| state.mapped.remove(&id)) {
                    Some(_) => ok(""),
                    None => fail(22, "rbd: unmap failed: (22) Invalid argument"),
                }
            }
            ("rbd", ["rm", name, rest @ ..]) => {
                let key = (flag(rest, "--pool").unwrap_or("rbd").to_string(), name.to_string());
                if state.mapped.values().any(|m| *m == key) {
                    return fail(16, "rbd: error: image still has watchers");
                }
                match state.images.remove(&key) {
                    Some(_) => ok(""),
                    None => fail(2, "rbd: delete error: (2) No such file or directory"),
                }
            }
            ("rbd", ["snap", action, name, rest @ ..]) => {
                let key = (flag(rest, "--pool").unwrap_or("rbd").to_string(), name.to_string());
                let snap = flag(rest, "--snap").map(str::to_string);
                let Some(snaps) = state.images.get_mut(&key) else {
                    return fail(2, "rbd: error opening image");
                };
                match (*action, snap) {
                    ("ls", _) => {
                        let mut out = String::from("SNAPID NAME        SIZE TIMESTAMP\n");
                        for (i, s) in snaps.iter().enumerate() {
                            out.push_str(&format!(
                                "    {:>2} {} 10240 kB Tue Jan 12 10:01:02 2016\n",
                                i + 1,
                                s
                            ));
                        }
                        ok(out)
                    }
                    ("purge", _) => {
                        snaps.clear();
                        ok("")
                    }
                    ("create", Some(s)) => {
                        if snaps.contains(&s) {
                            return fail(17, "rbd: failed to create snapshot: (17) File exists");
                        }
                        snaps.push(s);
                        ok("")
                    }
                    ("rm", Some(s)) => match snaps.iter().position(|x| *x == s) {
                        Some(i) => {
                            snaps.remove(i);
                            ok("")
                        }
                        None => fail(2, "rbd: failed to remove snapshot"),
                    },
                    _ => fail(1, "rbd: unknown snap command"),
                }
            }
            ("/bin/sh", ["-c", _script]) => ok(""),
            _ => fail(1, "unknown command"),
        }
    }
}

#[async_trait]
impl Executor for FakeCeph {
    async fn run(&self, inv: &Invocation, _timeout: Duration) -> blocklease::Result<Output> {
        self.log.lock().unwrap().push(inv.to_string());
        Ok(self.handle(inv))
    }
}

/// Mounting moves a device's files into the target directory; unmounting
/// moves them back. Data therefore survives unmount/mount cycles the way it
/// would on a real block device.
pub struct FakeMounts {
    devices: PathBuf,
    mounted: Mutex<HashMap<PathBuf, PathBuf>>,
}

fn errno(errno: Errno) -> io::Error {
    io::Error::from(errno)
}

fn move_files(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        std::fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

impl FakeMounts {
    pub fn new(scratch: &Path) -> Arc<Self> {
        Arc::new(Self {
            devices: scratch.join("devices"),
            mounted: Mutex::new(HashMap::new()),
        })
    }

    fn device_dir(&self, device: &Path) -> PathBuf {
        let name = device.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        self.devices.join(name)
    }

    pub fn mount_count(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }
}

impl MountTable for FakeMounts {
    fn mount(&self, device: &Path, target: &Path, _fs_type: &str) -> io::Result<()> {
        let mut mounted = self.mounted.lock().unwrap();
        if mounted.contains_key(target) {
            return Err(errno(Errno::EBUSY));
        }
        let store = self.device_dir(device);
        std::fs::create_dir_all(&store)?;
        move_files(&store, target)?;
        mounted.insert(target.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn unmount_lazy(&self, target: &Path) -> io::Result<()> {
        let mut mounted = self.mounted.lock().unwrap();
        let Some(device) = mounted.remove(target) else {
            return Err(errno(Errno::EINVAL));
        };
        move_files(target, &self.device_dir(&device))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn device_numbers(&self, device: &Path) -> io::Result<(u64, u64)> {
        let name = device.to_string_lossy();
        let minor = name
            .trim_start_matches("/dev/rbd")
            .parse::<u64>()
            .map_err(|_| errno(Errno::ENOENT))?;
        Ok((252, minor * 16))
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        Ok(self.mounted.lock().unwrap().contains_key(target))
    }
}

/// A control plane wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub ceph: Arc<FakeCeph>,
    pub mounts: Arc<FakeMounts>,
    pub state: MasterState,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config.storage.mount_base = dir.path().join("mnt");
        config.master.mount_ttl_secs = 30;
        let config = Arc::new(config);

        let store = Arc::new(MemoryStore::new());
        let kv: Arc<dyn KvStore> = store.clone();
        let keys = Keys::new(&config.store.prefix);
        let ceph = FakeCeph::with_pool("rbd");
        let mounts = FakeMounts::new(dir.path());

        let state = MasterState {
            config: config.clone(),
            metadata: MetadataStore::new(kv.clone(), keys.clone()),
            locks: UseLocker::new(kv, keys),
            backend: Arc::new(RbdDriver::new(
                config.storage.clone(),
                "master",
                ceph.clone(),
                mounts.clone(),
            )),
            hostname: "master".into(),
        };
        state
            .metadata
            .publish_tenant("tenant1", &TenantConfig::default())
            .await
            .unwrap();

        Self {
            dir,
            config,
            store,
            ceph,
            mounts,
            state,
        }
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    /// Driver for a given host sharing this harness's fakes.
    pub fn driver(&self, host: &str) -> Arc<RbdDriver> {
        Arc::new(RbdDriver::new(
            self.config.storage.clone(),
            host,
            self.ceph.clone(),
            self.mounts.clone(),
        ))
    }

    /// Serve the control plane on an ephemeral port; returns its base URL.
    pub async fn spawn(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }
}
