//! Reference Counter & Idle Evictor: the per-mount-point state machine of
//! spec.md §4.4/§4.7.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::StoreError;

#[derive(Clone)]
enum AttachResult {
    Success,
    Failed(Arc<StoreError>),
}

struct MountEntry {
    count: u64,
    idle_deadline: Option<Instant>,
    result: Option<AttachResult>,
}

impl MountEntry {
    fn attaching() -> Self {
        MountEntry {
            count: 1,
            idle_deadline: None,
            result: None,
        }
    }
}

/// What the caller of [`RefCounter::incr`] must do.
pub enum IncrOutcome {
    /// First holder: caller must perform the physical attach and then call
    /// [`RefCounter::publish`].
    MustAttach,
    /// An attach is already in flight; caller must block on the condvar
    /// until it completes.
    WaitForAttach,
    /// Already mounted (fresh or coalesced from the idle window); no
    /// physical attach needed.
    AlreadyMounted,
}

/// Tracks live holders of every mount point and evicts idle ones after the
/// configured TTL.
pub struct RefCounter {
    entries: Mutex<HashMap<PathBuf, MountEntry>>,
    cond: Condvar,
    idle_ttl: Duration,
}

impl RefCounter {
    pub fn new(idle_ttl: Duration) -> Arc<Self> {
        Arc::new(RefCounter {
            entries: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            idle_ttl,
        })
    }

    /// `incr(m)`: see the MountEntry state machine in spec.md §4.7.
    pub fn incr(&self, mount: &PathBuf) -> IncrOutcome {
        let mut map = self.entries.lock().unwrap();
        match map.get_mut(mount) {
            None => {
                map.insert(mount.clone(), MountEntry::attaching());
                IncrOutcome::MustAttach
            }
            Some(entry) => {
                entry.count += 1;
                entry.idle_deadline = None;
                match &entry.result {
                    Some(AttachResult::Success) => IncrOutcome::AlreadyMounted,
                    Some(AttachResult::Failed(_)) => {
                        // Previous attacher failed and the entry should have
                        // been removed already; treat as a fresh attempt.
                        entry.result = None;
                        IncrOutcome::MustAttach
                    }
                    None => IncrOutcome::WaitForAttach,
                }
            }
        }
    }

    /// Block until the in-flight attach for `mount` publishes a result.
    /// Only valid to call after `incr` returned `WaitForAttach`.
    pub fn wait_for_attach(&self, mount: &PathBuf) -> Result<(), StoreError> {
        let mut map = self.entries.lock().unwrap();
        loop {
            match map.get(mount).and_then(|e| e.result.clone()) {
                Some(AttachResult::Success) => return Ok(()),
                Some(AttachResult::Failed(err)) => {
                    // Propagate the failure and drop our own hold; the
                    // first attacher is responsible for removing the entry.
                    self.decr_locked(&mut map, mount);
                    return Err(clone_store_error(&err));
                }
                None => {
                    map = self.cond.wait(map).unwrap();
                }
            }
        }
    }

    /// The first attacher posts the outcome of its physical attach.
    pub fn publish(&self, mount: &PathBuf, result: Result<(), StoreError>) {
        let mut map = self.entries.lock().unwrap();
        match result {
            Ok(()) => {
                if let Some(entry) = map.get_mut(mount) {
                    entry.result = Some(AttachResult::Success);
                }
            }
            Err(err) => {
                let shared = Arc::new(err);
                if let Some(entry) = map.get_mut(mount) {
                    entry.result = Some(AttachResult::Failed(shared.clone()));
                }
                // The attacher's own hold counts as a reference too; drop it
                // so waiters observing the failure see a consistent count,
                // then remove the entry once it reaches zero.
                self.decr_locked(&mut map, mount);
            }
        }
        self.cond.notify_all();
    }

    /// `decr(m)`: release one reference, arming the idle deadline at zero.
    pub fn decr(&self, mount: &PathBuf) {
        let mut map = self.entries.lock().unwrap();
        self.decr_locked(&mut map, mount);
    }

    fn decr_locked(&self, map: &mut HashMap<PathBuf, MountEntry>, mount: &PathBuf) {
        if let Some(entry) = map.get_mut(mount) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                match &entry.result {
                    Some(AttachResult::Failed(_)) | None => {
                        // Never successfully mounted: nothing to keep warm.
                        map.remove(mount);
                    }
                    Some(AttachResult::Success) => {
                        entry.idle_deadline = Some(Instant::now() + self.idle_ttl);
                        debug!("mount {:?} idle, evicting after {:?}", mount, self.idle_ttl);
                    }
                }
            }
        }
    }

    /// Current reference count for `mount`, or 0 if untracked.
    pub fn count(&self, mount: &PathBuf) -> u64 {
        self.entries
            .lock()
            .unwrap()
            .get(mount)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Drop all bookkeeping for `mount`, forcing the next `incr` to treat it
    /// as a cold attach. Only safe to call once `count(mount)` is zero and
    /// the physical mount has actually been torn down out-of-band, as
    /// `resize` does while holding the exclusive coordinator lock: without
    /// this, a stale `AlreadyMounted` entry would make a later `incr` skip
    /// the real re-attach onto the swapped-in image.
    pub fn forget(&self, mount: &PathBuf) {
        self.entries.lock().unwrap().remove(mount);
    }

    /// One eviction pass: detach every mount whose count is zero and whose
    /// idle deadline has elapsed, via `detach`. Intended to be driven by a
    /// background ticker thread (spec.md §9's accepted alternative to
    /// piggy-backing on `decr`).
    pub fn evict_idle<F: Fn(&PathBuf) -> Result<(), StoreError>>(&self, detach: F) {
        let now = Instant::now();
        let due: Vec<PathBuf> = {
            let map = self.entries.lock().unwrap();
            map.iter()
                .filter(|(_, e)| e.count == 0 && e.idle_deadline.map(|d| now >= d).unwrap_or(false))
                .map(|(m, _)| m.clone())
                .collect()
        };
        for mount in due {
            // Re-check under the lock immediately before detaching so a
            // reader that arrived between the scan and now is honored.
            let still_due = {
                let map = self.entries.lock().unwrap();
                map.get(&mount)
                    .map(|e| e.count == 0 && e.idle_deadline.map(|d| now >= d).unwrap_or(false))
                    .unwrap_or(false)
            };
            if !still_due {
                continue;
            }
            match detach(&mount) {
                Ok(()) => {
                    let mut map = self.entries.lock().unwrap();
                    if let Some(e) = map.get(&mount) {
                        if e.count == 0 {
                            map.remove(&mount);
                            info!("evicted idle mount {:?}", mount);
                        }
                    }
                }
                Err(err) => {
                    log::warn!("failed to evict idle mount {:?}: {}", mount, err);
                }
            }
        }
    }
}

fn clone_store_error(err: &StoreError) -> StoreError {
    match err {
        StoreError::InvalidHash(s) => StoreError::InvalidHash(s.clone()),
        StoreError::NotFound(s) => StoreError::NotFound(s.clone()),
        StoreError::AlreadyExists { fingerprint } => StoreError::AlreadyExists {
            fingerprint: fingerprint.clone(),
        },
        StoreError::LoopDeviceLimit { count } => StoreError::LoopDeviceLimit { count: *count },
        StoreError::Timeout(d) => StoreError::Timeout(*d),
        StoreError::IoFailure(e) => StoreError::IoFailure(anyhow::anyhow!(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_incr_requires_attach() {
        let rc = RefCounter::new(Duration::from_millis(50));
        let mount = PathBuf::from("/tmp/x/loopmount");
        match rc.incr(&mount) {
            IncrOutcome::MustAttach => {}
            _ => panic!("expected MustAttach"),
        }
        assert_eq!(rc.count(&mount), 1);
    }

    #[test]
    fn second_incr_after_publish_bumps_count() {
        let rc = RefCounter::new(Duration::from_millis(50));
        let mount = PathBuf::from("/tmp/x/loopmount");
        let _ = rc.incr(&mount);
        rc.publish(&mount, Ok(()));
        match rc.incr(&mount) {
            IncrOutcome::AlreadyMounted => {}
            _ => panic!("expected AlreadyMounted"),
        }
        assert_eq!(rc.count(&mount), 2);
    }

    #[test]
    fn decr_to_zero_arms_idle_deadline_without_removing() {
        let rc = RefCounter::new(Duration::from_millis(50));
        let mount = PathBuf::from("/tmp/x/loopmount");
        let _ = rc.incr(&mount);
        rc.publish(&mount, Ok(()));
        rc.decr(&mount);
        assert_eq!(rc.count(&mount), 0);
        // coalescing: incr during idle window skips physical attach
        match rc.incr(&mount) {
            IncrOutcome::AlreadyMounted => {}
            _ => panic!("expected AlreadyMounted during idle window"),
        }
    }

    #[test]
    fn evict_idle_runs_detach_after_ttl_elapses() {
        let rc = RefCounter::new(Duration::from_millis(10));
        let mount = PathBuf::from("/tmp/x/loopmount");
        let _ = rc.incr(&mount);
        rc.publish(&mount, Ok(()));
        rc.decr(&mount);
        std::thread::sleep(Duration::from_millis(30));
        let detached = std::sync::atomic::AtomicBool::new(false);
        rc.evict_idle(|_| {
            detached.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        assert!(detached.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(rc.count(&mount), 0);
    }

    #[test]
    fn failed_attach_propagates_to_waiter() {
        let rc = RefCounter::new(Duration::from_millis(50));
        let mount = PathBuf::from("/tmp/x/loopmount");
        let _ = rc.incr(&mount); // first attacher
        let waiter_rc = rc.clone();
        let waiter_mount = mount.clone();
        match waiter_rc.incr(&waiter_mount) {
            IncrOutcome::WaitForAttach => {}
            _ => panic!("expected WaitForAttach"),
        }
        let handle = std::thread::spawn(move || waiter_rc.wait_for_attach(&waiter_mount));
        rc.publish(&mount, Err(StoreError::IoFailure(anyhow::anyhow!("boom"))));
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }
}
