//! Streaming Reader: a read-closeable handle over an open file inside a
//! mounted image, tying the mount's lifetime to the handle's lifetime.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;

use crate::coordinator::SharedGuard;
use crate::refcount::RefCounter;

/// A lazy, finite, non-restartable byte sequence backed by a file inside a
/// mounted loop image. Restart requires a new `get_stream` call.
pub struct LoopReader {
    file: Option<File>,
    mount: PathBuf,
    refcount: Arc<RefCounter>,
    // Held for the reader's entire lifetime; releasing it is what allows a
    // pending resize to proceed.
    shared_guard: Option<SharedGuard>,
    closed: bool,
}

impl LoopReader {
    pub(crate) fn new(file: File, mount: PathBuf, refcount: Arc<RefCounter>, shared_guard: SharedGuard) -> Self {
        LoopReader {
            file: Some(file),
            mount,
            refcount,
            shared_guard: Some(shared_guard),
            closed: false,
        }
    }

    /// Release the descriptor, the mount reference, and the shared lock,
    /// in that order, so the mount is never detached while the descriptor
    /// is live. Idempotent.
    pub fn close(mut self) -> io::Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let close_result = self.file.take().map(drop);
        self.refcount.decr(&self.mount);
        self.shared_guard.take();
        let _ = close_result;
        Ok(())
    }
}

impl Read for LoopReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for LoopReader {
    fn drop(&mut self) {
        if !self.closed {
            warn!("LoopReader for {:?} dropped without explicit close", self.mount);
            let _ = self.close_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ResizeCoordinator;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn close_releases_refcount_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("blob");
        std::fs::write(&file_path, b"hello world").unwrap();

        let refcount = RefCounter::new(Duration::from_millis(50));
        let mount = dir.path().join("loopmount");
        let _ = refcount.incr(&mount);
        refcount.publish(&mount, Ok(()));

        let coord = ResizeCoordinator::new();
        let image = dir.path().join("loop.img");
        let guard = coord.acquire_shared(&image);

        let file = File::open(&file_path).unwrap();
        let mut reader = LoopReader::new(file, mount.clone(), refcount.clone(), guard);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");

        reader.close().unwrap();
        assert_eq!(refcount.count(&mount), 0);
    }

    #[test]
    fn drop_without_close_still_releases() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("blob");
        let mut f = File::create(&file_path).unwrap();
        f.write_all(b"x").unwrap();

        let refcount = RefCounter::new(Duration::from_millis(50));
        let mount = dir.path().join("loopmount");
        let _ = refcount.incr(&mount);
        refcount.publish(&mount, Ok(()));

        let coord = ResizeCoordinator::new();
        let image = dir.path().join("loop.img");
        let guard = coord.acquire_shared(&image);

        let file = File::open(&file_path).unwrap();
        {
            let _reader = LoopReader::new(file, mount.clone(), refcount.clone(), guard);
        }
        assert_eq!(refcount.count(&mount), 0);
    }
}
