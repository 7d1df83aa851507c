//! Mount Manager: wraps the kernel loop-mount/unmount primitives behind a
//! single process-wide serialization mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::process::SystemOps;

/// Loop devices are a 16-bit kernel resource; the spec's stated ceiling.
pub const LOOP_DEVICE_LIMIT: u32 = 65535;

/// Serializes the kernel loop-mount/unmount syscalls across the process.
pub struct MountManager {
    serializer: Mutex<()>,
    ops: Arc<dyn SystemOps>,
}

impl MountManager {
    pub fn new(ops: Arc<dyn SystemOps>) -> Self {
        MountManager {
            serializer: Mutex::new(()),
            ops,
        }
    }

    /// Attach `image` at `mount_point`, idempotent if already mounted.
    pub fn attach(
        &self,
        image: &Path,
        mount_point: &Path,
        cfg: &StoreConfig,
    ) -> Result<(), StoreError> {
        let _guard = self.serializer.lock().unwrap();

        let count = self
            .ops
            .loop_device_count(cfg.base_cmd_timeout())
            .map_err(StoreError::io)?;
        if count >= LOOP_DEVICE_LIMIT {
            return Err(StoreError::LoopDeviceLimit { count });
        }

        std::fs::create_dir_all(mount_point).map_err(StoreError::io)?;

        if self
            .ops
            .is_mounted(mount_point, cfg.base_cmd_timeout())
            .map_err(StoreError::io)?
        {
            return Ok(());
        }

        self.ops
            .mount_loop(image, mount_point, cfg.base_cmd_timeout())
            .map_err(StoreError::io)?;
        info!("attached {} at {}", image.display(), mount_point.display());
        Ok(())
    }

    /// Detach `mount_point`, idempotent if not currently mounted.
    pub fn detach(&self, mount_point: &Path, cfg: &StoreConfig) -> Result<(), StoreError> {
        let _guard = self.serializer.lock().unwrap();

        if !self
            .ops
            .is_mounted(mount_point, cfg.base_cmd_timeout())
            .map_err(StoreError::io)?
        {
            return Ok(());
        }

        self.ops
            .unmount(mount_point, cfg.base_cmd_timeout())
            .map_err(StoreError::io)?;
        info!("detached {}", mount_point.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeSystemOps;

    fn cfg() -> StoreConfig {
        StoreConfig::new("/tmp/loopstore-test-root")
    }

    #[test]
    fn attach_then_detach_is_idempotent() {
        let ops: Arc<dyn SystemOps> = Arc::new(FakeSystemOps::new());
        let mgr = MountManager::new(ops.clone());
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("loop.img");
        let mount_point = dir.path().join("loopmount");
        std::fs::write(&image, b"fake image").unwrap();

        mgr.attach(&image, &mount_point, &cfg()).unwrap();
        // second attach is a no-op success
        mgr.attach(&image, &mount_point, &cfg()).unwrap();

        mgr.detach(&mount_point, &cfg()).unwrap();
        // second detach is a no-op success
        mgr.detach(&mount_point, &cfg()).unwrap();
    }

    #[test]
    fn attach_fails_at_loop_device_limit() {
        let fake = Arc::new(FakeSystemOps::new());
        fake.set_loop_device_count(LOOP_DEVICE_LIMIT);
        let ops: Arc<dyn SystemOps> = fake;
        let mgr = MountManager::new(ops);
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("loop.img");
        let mount_point = dir.path().join("loopmount");
        std::fs::write(&image, b"fake image").unwrap();

        let err = mgr.attach(&image, &mount_point, &cfg()).unwrap_err();
        assert!(matches!(err, StoreError::LoopDeviceLimit { .. }));
    }
}
