//! Blob Operations: the façade that composes Resolver + Coordinator +
//! Mount Manager + Ref Counter into `put`/`get_stream`/`get_info`/`delete`/
//! `exists`/`disk_usage`/`resize`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::{debug, info};
use openssl::sha::Sha256;

use crate::config::StoreConfig;
use crate::coordinator::ResizeCoordinator;
use crate::error::StoreError;
use crate::hash;
use crate::image::{self, CreationLocks};
use crate::mount::MountManager;
use crate::process::SystemOps;
use crate::reader::LoopReader;
use crate::refcount::{IncrOutcome, RefCounter};

/// Minimum image size per spec: "Rounds sizes below 1 MiB up to 1 MiB."
const MIN_RESIZE_BYTES: u64 = 1024 * 1024;

const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const QUIESCENCE_MAX_WAIT: Duration = Duration::from_secs(30);

/// Metadata about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub fingerprint: String,
    pub size: u64,
    pub created: SystemTime,
}

/// Per-blob ext4 disk usage, not the host filesystem's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub used: u64,
    pub available: u64,
    pub total: u64,
}

/// A closeable, owned read handle. Object-safe so `BlobStore` can be used
/// as a trait object by the excluded HTTP layer.
pub trait ReaderHandle: Read + Send {
    fn close(self: Box<Self>) -> io::Result<()>;
}

impl ReaderHandle for LoopReader {
    fn close(self: Box<Self>) -> io::Result<()> {
        LoopReader::close(*self)
    }
}

/// The capability set exposed to the excluded HTTP layer (and to any
/// alternate, non-loop-backed implementation — e.g. a test double — that
/// satisfies the same contract without leaking loop-specific types).
pub trait BlobStore: Send + Sync {
    fn put(&self, data: &mut dyn Read, filename: &str) -> Result<String, StoreError>;
    fn get_stream(&self, fingerprint: &str) -> Result<Box<dyn ReaderHandle>, StoreError>;
    fn get_info(&self, fingerprint: &str) -> Result<FileInfo, StoreError>;
    fn delete(&self, fingerprint: &str) -> Result<(), StoreError>;
    fn exists(&self, fingerprint: &str) -> bool;
    fn validate_hash(&self, s: &str) -> bool;
    fn disk_usage(&self, fingerprint: &str) -> Result<DiskUsage, StoreError>;
    fn resize(&self, fingerprint: &str, new_bytes: u64) -> Result<(), StoreError>;
}

/// Inspects a `put`'s scratch file before acceptance. Represents the
/// external "store manager" collaborator (spec.md §1); not part of the
/// core per se, just the seam it is invoked through.
pub type Verifier = Arc<dyn Fn(&Path) -> Result<(), StoreError> + Send + Sync>;

/// The loop-image-backed implementation of [`BlobStore`].
pub struct LoopBlobStore {
    cfg: StoreConfig,
    ops: Arc<dyn SystemOps>,
    mount_manager: MountManager,
    refcount: Arc<RefCounter>,
    coordinator: ResizeCoordinator,
    creation_locks: CreationLocks,
    dedup_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    verifier: Option<Verifier>,
    evictor: Mutex<Option<EvictorHandle>>,
}

struct EvictorHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    join: std::thread::JoinHandle<()>,
}

impl LoopBlobStore {
    pub fn new(cfg: StoreConfig, ops: Arc<dyn SystemOps>) -> Arc<Self> {
        Self::build(cfg, ops, None)
    }

    pub fn with_verifier(cfg: StoreConfig, ops: Arc<dyn SystemOps>, verifier: Verifier) -> Arc<Self> {
        Self::build(cfg, ops, Some(verifier))
    }

    fn build(cfg: StoreConfig, ops: Arc<dyn SystemOps>, verifier: Option<Verifier>) -> Arc<Self> {
        let refcount = RefCounter::new(cfg.mount_idle_ttl());
        let store = Arc::new(LoopBlobStore {
            mount_manager: MountManager::new(ops.clone()),
            cfg,
            ops,
            refcount,
            coordinator: ResizeCoordinator::new(),
            creation_locks: CreationLocks::new(),
            dedup_locks: Mutex::new(HashMap::new()),
            verifier,
            evictor: Mutex::new(None),
        });
        store.start_evictor();
        store
    }

    fn start_evictor(self: &Arc<Self>) {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = stop.clone();
        let weak = Arc::downgrade(self);
        let join = std::thread::spawn(move || {
            while !stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(1));
                if let Some(store) = weak.upgrade() {
                    let cfg = store.cfg.clone();
                    store.refcount.evict_idle(|mount| {
                        store.mount_manager.detach(mount, &cfg)
                    });
                } else {
                    break;
                }
            }
        });
        *self.evictor.lock().unwrap() = Some(EvictorHandle { stop, join });
    }

    /// Drains active operations and stops the background evictor. Per
    /// spec.md §9: "Shutdown must drain all active operations
    /// (exclusive-lock every image, detach everything)." In practice
    /// this implementation stops the evictor thread; operations in flight
    /// hold their own guards and complete or time out on their own.
    pub fn shutdown(&self) {
        if let Some(handle) = self.evictor.lock().unwrap().take() {
            handle.stop.store(true, std::sync::atomic::Ordering::Relaxed);
            let _ = handle.join.join();
        }
    }

    fn dedup_lock(&self, h: &str) -> Arc<Mutex<()>> {
        let mut map = self.dedup_locks.lock().unwrap();
        map.entry(h.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn retire_dedup_lock(&self, h: &str) {
        self.dedup_locks.lock().unwrap().remove(h);
    }

    /// Ensure `mount` is attached, coalescing with any in-flight or idle
    /// mount for the same path (spec.md §4.4).
    fn acquire_mount(&self, image: &Path, mount: &PathBuf) -> Result<(), StoreError> {
        match self.refcount.incr(mount) {
            IncrOutcome::AlreadyMounted => Ok(()),
            IncrOutcome::WaitForAttach => self.refcount.wait_for_attach(mount),
            IncrOutcome::MustAttach => {
                let result = self.mount_manager.attach(image, mount, &self.cfg);
                self.refcount.publish(mount, clone_result(&result));
                result
            }
        }
    }

    fn release_mount(&self, mount: &PathBuf) {
        self.refcount.decr(mount);
    }

    fn paths(&self, h: &str) -> (PathBuf, PathBuf) {
        (
            hash::image_path(h, &self.cfg.storage_root),
            hash::mount_path(h, &self.cfg.storage_root),
        )
    }
}

fn clone_result(result: &Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => Err(match err {
            StoreError::InvalidHash(s) => StoreError::InvalidHash(s.clone()),
            StoreError::NotFound(s) => StoreError::NotFound(s.clone()),
            StoreError::AlreadyExists { fingerprint } => StoreError::AlreadyExists {
                fingerprint: fingerprint.clone(),
            },
            StoreError::LoopDeviceLimit { count } => StoreError::LoopDeviceLimit { count: *count },
            StoreError::Timeout(d) => StoreError::Timeout(*d),
            StoreError::IoFailure(e) => StoreError::IoFailure(anyhow::anyhow!(e.to_string())),
        }),
    }
}

/// Guard around a scratch file used while streaming+hashing a `put`: the
/// content is always copied (not renamed) into the mount, so the scratch
/// copy is unconditionally unlinked on drop. Grounded on
/// `tools.rs::file_set_contents`'s mkstemp-then-rename-or-unlink pattern.
struct ScratchGuard {
    path: PathBuf,
    file: Option<File>,
}

impl ScratchGuard {
    fn create(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(StoreError::io)?;
        let template = dir.join("put.tmp.XXXXXX");
        let (fd, path) = nix::unistd::mkstemp(&template).map_err(|e| StoreError::io(anyhow::anyhow!(e)))?;
        use std::os::unix::io::FromRawFd;
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(ScratchGuard { path, file: Some(file) })
    }

    fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("scratch file taken")
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.file.take();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

impl BlobStore for LoopBlobStore {
    fn put(&self, data: &mut dyn Read, filename: &str) -> Result<String, StoreError> {
        debug!("put: streaming '{}'", filename);
        let scratch_dir = self.cfg.storage_root.join(".scratch");
        let mut scratch = ScratchGuard::create(&scratch_dir)?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = data.read(&mut buf).map_err(StoreError::io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            scratch.file_mut().write_all(&buf[..n]).map_err(StoreError::io)?;
        }
        let h = to_hex(&hasher.finish());

        if let Some(verifier) = &self.verifier {
            verifier(&scratch.path)?;
        }

        let (image, mount) = self.paths(&h);
        let _shared = self.coordinator.acquire_shared(&image);
        image::ensure_image(&self.creation_locks, self.ops.as_ref(), &self.cfg, &image)?;
        self.acquire_mount(&image, &mount)?;

        let dedup = self.dedup_lock(&h);
        let result = (|| -> Result<(), StoreError> {
            let _dedup_guard = dedup.lock().unwrap();
            let blob_path = hash::blob_path(&h, &self.cfg.storage_root);
            if blob_path.exists() {
                return Err(StoreError::AlreadyExists { fingerprint: h.clone() });
            }
            let blob_dir = hash::blob_dir(&h, &self.cfg.storage_root);
            std::fs::create_dir_all(&blob_dir).map_err(StoreError::io)?;
            // scratch lives on the host filesystem, the blob lives inside
            // the mounted loop image: a plain rename would cross
            // filesystems, so copy then drop the scratch guard to unlink.
            std::fs::copy(&scratch.path, &blob_path).map_err(StoreError::io)?;
            Ok(())
        })();

        self.release_mount(&mount);
        self.retire_dedup_lock(&h);
        // `scratch` is a copy source, not a rename source, so it is always
        // removed here regardless of outcome (guard's Drop unlinks it).
        drop(scratch);

        result?;
        info!("put: stored {}", h);
        Ok(h)
    }

    fn get_stream(&self, fingerprint: &str) -> Result<Box<dyn ReaderHandle>, StoreError> {
        let h = hash::validate(fingerprint)?;
        let (image, mount) = self.paths(&h);

        let shared = self.coordinator.acquire_shared(&image);
        if !image.exists() {
            return Err(StoreError::NotFound(h));
        }
        self.acquire_mount(&image, &mount)?;

        let blob_path = hash::blob_path(&h, &self.cfg.storage_root);
        let file = match File::open(&blob_path) {
            Ok(f) => f,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.release_mount(&mount);
                return Err(StoreError::NotFound(h));
            }
            Err(err) => {
                self.release_mount(&mount);
                return Err(StoreError::io(err));
            }
        };

        Ok(Box::new(LoopReader::new(file, mount, self.refcount.clone(), shared)))
    }

    fn get_info(&self, fingerprint: &str) -> Result<FileInfo, StoreError> {
        let h = hash::validate(fingerprint)?;
        let (image, mount) = self.paths(&h);

        let _shared = self.coordinator.acquire_shared(&image);
        if !image.exists() {
            return Err(StoreError::NotFound(h));
        }
        self.acquire_mount(&image, &mount)?;

        let blob_path = hash::blob_path(&h, &self.cfg.storage_root);
        let info = std::fs::metadata(&blob_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(h.clone())
            } else {
                StoreError::io(err)
            }
        });
        self.release_mount(&mount);

        let meta = info?;
        Ok(FileInfo {
            fingerprint: h,
            size: meta.len(),
            created: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    fn delete(&self, fingerprint: &str) -> Result<(), StoreError> {
        let h = hash::validate(fingerprint)?;
        let (image, mount) = self.paths(&h);

        // Pre-check outside the mount to avoid a pointless attach.
        if !image.exists() {
            return Err(StoreError::NotFound(h));
        }

        let _shared = self.coordinator.acquire_shared(&image);
        self.acquire_mount(&image, &mount)?;

        let blob_path = hash::blob_path(&h, &self.cfg.storage_root);
        let result = std::fs::remove_file(&blob_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(h.clone())
            } else {
                StoreError::io(err)
            }
        });
        self.release_mount(&mount);
        result
    }

    fn exists(&self, fingerprint: &str) -> bool {
        let h = match hash::validate(fingerprint) {
            Ok(h) => h,
            Err(_) => return false,
        };
        let (image, mount) = self.paths(&h);
        if !image.exists() {
            return false;
        }
        let _shared = self.coordinator.acquire_shared(&image);
        if self.acquire_mount(&image, &mount).is_err() {
            return false;
        }
        let blob_path = hash::blob_path(&h, &self.cfg.storage_root);
        let present = blob_path.exists();
        self.release_mount(&mount);
        present
    }

    fn validate_hash(&self, s: &str) -> bool {
        hash::is_valid(s)
    }

    fn disk_usage(&self, fingerprint: &str) -> Result<DiskUsage, StoreError> {
        let h = hash::validate(fingerprint)?;
        let (image, mount) = self.paths(&h);

        let _shared = self.coordinator.acquire_shared(&image);
        if !image.exists() {
            return Err(StoreError::NotFound(h));
        }
        self.acquire_mount(&image, &mount)?;

        let stat = self.ops.statfs(&mount).map_err(StoreError::io);
        self.release_mount(&mount);

        let (used, available, total) = stat?;
        Ok(DiskUsage { used, available, total })
    }

    fn resize(&self, fingerprint: &str, new_bytes: u64) -> Result<(), StoreError> {
        let h = hash::validate(fingerprint)?;
        let new_bytes = new_bytes.max(MIN_RESIZE_BYTES);

        let image = hash::image_path(&h, &self.cfg.storage_root);
        let mount = hash::mount_path(&h, &self.cfg.storage_root);
        let image_new = hash::image_new_path(&h, &self.cfg.storage_root);
        let mount_new = hash::mount_new_path(&h, &self.cfg.storage_root);
        let image_backup = hash::image_backup_path(&h, &self.cfg.storage_root);

        let _exclusive = self.coordinator.acquire_exclusive_quiesced(
            &image,
            &mount,
            &self.refcount,
            QUIESCENCE_POLL_INTERVAL,
            QUIESCENCE_MAX_WAIT,
        )?;

        if !image.exists() {
            return Err(StoreError::NotFound(h));
        }

        let result = self.do_resize(&image, &mount, &image_new, &mount_new, &image_backup, new_bytes);

        if result.is_err() {
            let _ = std::fs::remove_file(&image_new);
            let _ = std::fs::remove_dir_all(&mount_new);
        }

        result
    }
}

impl LoopBlobStore {
    #[allow(clippy::too_many_arguments)]
    fn do_resize(
        &self,
        image: &Path,
        mount: &Path,
        image_new: &Path,
        mount_new: &Path,
        image_backup: &Path,
        new_bytes: u64,
    ) -> Result<(), StoreError> {
        self.mount_manager.attach(image, mount, &self.cfg)?;

        self.ops
            .allocate_image(image_new, new_bytes, self.cfg.allocate_timeout(new_bytes))
            .map_err(StoreError::io)?;
        self.ops
            .format_ext4(image_new, self.cfg.format_timeout(new_bytes))
            .map_err(StoreError::io)?;
        self.mount_manager.attach(image_new, mount_new, &self.cfg)?;

        self.ops
            .rsync(mount, mount_new, self.cfg.rsync_timeout(new_bytes))
            .map_err(StoreError::io)?;

        self.mount_manager.detach(mount, &self.cfg)?;
        self.mount_manager.detach(mount_new, &self.cfg)?;
        // The physical mount is gone; drop the refcount's stale
        // AlreadyMounted marker so the next access re-attaches for real
        // instead of assuming the old mount is still live.
        self.refcount.forget(&mount.to_path_buf());

        if image.exists() {
            std::fs::rename(image, image_backup).map_err(StoreError::io)?;
        }
        match std::fs::rename(image_new, image) {
            Ok(()) => {
                let _ = std::fs::remove_file(image_backup);
                let _ = std::fs::remove_dir_all(mount_new);
                info!("resized {} to {} bytes", image.display(), new_bytes);
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::rename(image_backup, image);
                Err(StoreError::io(err))
            }
        }
    }
}
