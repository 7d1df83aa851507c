//! Image Provisioner: creates the fixed-size ext4-formatted image file on
//! first access to a fingerprint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::process::SystemOps;

/// Per-image creation mutex table, keyed by image path. Serializes
/// "does-this-image-exist, else create-it" so two racing `put`s never
/// format the same file twice.
#[derive(Default)]
pub struct CreationLocks {
    locks: Mutex<HashMap<std::path::PathBuf, Arc<Mutex<()>>>>,
}

impl CreationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap();
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn retire(&self, path: &Path) {
        self.locks.lock().unwrap().remove(path);
    }
}

/// Create `image_path` (a fixed-size ext4 image) if it does not already
/// exist.
pub fn ensure_image(
    creation_locks: &CreationLocks,
    ops: &dyn SystemOps,
    cfg: &StoreConfig,
    image_path: &Path,
) -> Result<(), StoreError> {
    let lock = creation_locks.lock_for(image_path);
    let _guard = lock.lock().unwrap();

    if image_path.exists() {
        creation_locks.retire(image_path);
        return Ok(());
    }

    if let Some(parent) = image_path.parent() {
        std::fs::create_dir_all(parent).map_err(StoreError::io)?;
    }

    let size_bytes = cfg.image_size_bytes();

    let result = (|| {
        ops.allocate_image(image_path, size_bytes, cfg.allocate_timeout(size_bytes))?;
        ops.format_ext4(image_path, cfg.format_timeout(size_bytes))?;
        Ok::<(), anyhow::Error>(())
    })();

    match result {
        Ok(()) => {
            info!("provisioned image {}", image_path.display());
            creation_locks.retire(image_path);
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_file(image_path);
            creation_locks.retire(image_path);
            Err(StoreError::io(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeSystemOps;

    #[test]
    fn creates_image_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path());
        let ops = FakeSystemOps::new();
        let locks = CreationLocks::new();
        let image_path = dir.path().join("ab/cd/loop.img");

        ensure_image(&locks, &ops, &cfg, &image_path).unwrap();
        assert!(image_path.exists());

        // second call is a cheap no-op (file already exists)
        ensure_image(&locks, &ops, &cfg, &image_path).unwrap();
        assert!(locks.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn removes_partial_file_on_failure() {
        struct FailingFormat;
        impl SystemOps for FailingFormat {
            fn allocate_image(
                &self,
                path: &Path,
                size_bytes: u64,
                _timeout: std::time::Duration,
            ) -> Result<(), anyhow::Error> {
                std::fs::write(path, vec![0u8; size_bytes as usize])?;
                Ok(())
            }
            fn format_ext4(&self, _path: &Path, _timeout: std::time::Duration) -> Result<(), anyhow::Error> {
                anyhow::bail!("mkfs failed")
            }
            fn is_mounted(&self, _mp: &Path, _t: std::time::Duration) -> Result<bool, anyhow::Error> {
                Ok(false)
            }
            fn mount_loop(&self, _i: &Path, _mp: &Path, _t: std::time::Duration) -> Result<(), anyhow::Error> {
                Ok(())
            }
            fn unmount(&self, _mp: &Path, _t: std::time::Duration) -> Result<(), anyhow::Error> {
                Ok(())
            }
            fn loop_device_count(&self, _t: std::time::Duration) -> Result<u32, anyhow::Error> {
                Ok(0)
            }
            fn rsync(&self, _s: &Path, _d: &Path, _t: std::time::Duration) -> Result<(), anyhow::Error> {
                Ok(())
            }
            fn statfs(&self, _mp: &Path) -> Result<(u64, u64, u64), anyhow::Error> {
                Ok((0, 0, 0))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path());
        let locks = CreationLocks::new();
        let image_path = dir.path().join("ab/cd/loop.img");

        let err = ensure_image(&locks, &FailingFormat, &cfg, &image_path).unwrap_err();
        assert!(matches!(err, StoreError::IoFailure(_)));
        assert!(!image_path.exists());
    }
}
