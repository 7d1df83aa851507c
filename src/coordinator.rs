//! Resize / Reader Coordinator: per-image readers-writer lock plus the
//! quiescence wait that gates `resize`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::error::StoreError;
use crate::refcount::RefCounter;

/// Table of per-image readers-writer locks, keyed by image path. Lifecycle
/// mirrors [`crate::image::CreationLocks`]: created lazily, retained for
/// the life of the store (removal would race a waiting acquirer, so unlike
/// the creation lock this table is not retired eagerly).
#[derive(Default)]
pub struct ResizeCoordinator {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

/// Owning guard for the shared (reader) side; every blob operation holds
/// one of these for the duration of its image access. Using parking_lot's
/// `read_arc` avoids tying the guard's lifetime to a borrow of the lookup
/// table, which would otherwise have to be held for as long as the guard.
pub type SharedGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Owning guard for the exclusive (resize) side.
pub type ExclusiveGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

impl ResizeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, image_path: &Path) -> Arc<RwLock<()>> {
        let mut map = self.locks.lock().unwrap();
        map.entry(image_path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire the shared side for `image_path`. Blocks while a resize is
    /// pending or in progress (spec.md §3, invariant 3).
    pub fn acquire_shared(&self, image_path: &Path) -> SharedGuard {
        let lock = self.lock_for(image_path);
        RwLock::read_arc(&lock)
    }

    /// Acquire the exclusive side for `image_path`, then poll the ref
    /// counter until `mount` is fully quiesced (count reaches zero).
    /// Bounded busy-wait with a short sleep, per spec.md §4.5.
    pub fn acquire_exclusive_quiesced(
        &self,
        image_path: &Path,
        mount: &PathBuf,
        refcount: &RefCounter,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<ExclusiveGuard, StoreError> {
        let lock = self.lock_for(image_path);
        let guard = RwLock::write_arc(&lock);

        let start = Instant::now();
        while refcount.count(mount) != 0 {
            if start.elapsed() >= max_wait {
                return Err(StoreError::Timeout(max_wait));
            }
            std::thread::sleep(poll_interval);
        }

        Ok(guard)
    }
}
