//! External process execution behind the `SystemOps` seam.
//!
//! Every external binary the engine needs (zero-fill allocator, ext4
//! formatter, mount/unmount, mountpoint probe, loop-device lister, rsync)
//! is reached through this trait instead of calling `std::process::Command`
//! directly from the component modules, mirroring how `tools/disks.rs`
//! routes every external tool invocation through one `run_command` helper.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Error};
use log::{debug, warn};

/// Capabilities the loop-image engine needs from the host.
pub trait SystemOps: Send + Sync {
    /// Allocate a zero-filled regular file of `size_bytes` at `path`.
    fn allocate_image(&self, path: &Path, size_bytes: u64, timeout: Duration) -> Result<(), Error>;

    /// Format `path` (a regular file) with ext4.
    fn format_ext4(&self, path: &Path, timeout: Duration) -> Result<(), Error>;

    /// `true` if `mount_point` is currently a live mount.
    fn is_mounted(&self, mount_point: &Path, timeout: Duration) -> Result<bool, Error>;

    /// Attach `image` as a loop device and mount it ext4 at `mount_point`.
    fn mount_loop(&self, image: &Path, mount_point: &Path, timeout: Duration) -> Result<(), Error>;

    /// Unmount (and detach the loop device behind) `mount_point`.
    fn unmount(&self, mount_point: &Path, timeout: Duration) -> Result<(), Error>;

    /// Number of currently attached loop devices host-wide.
    fn loop_device_count(&self, timeout: Duration) -> Result<u32, Error>;

    /// Copy the tree rooted at `src` into `dst`, overwriting.
    fn rsync(&self, src: &Path, dst: &Path, timeout: Duration) -> Result<(), Error>;

    /// Filesystem-stat `mount_point`, returning (used, available, total) bytes.
    fn statfs(&self, mount_point: &Path) -> Result<(u64, u64, u64), Error>;
}

/// Run `cmd` with a deadline, killing it if it overruns. Grounded on
/// `tools/disks.rs`'s pattern of shelling out to `lsblk`/`sgdisk`/`mkfs`
/// through a single timeout-bounded helper.
pub fn run_command(mut cmd: Command, timeout: Duration) -> Result<std::process::Output, Error> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let program = format!("{:?}", cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    // std::process has no native wait-with-timeout; poll try_wait against
    // the caller's deadline and kill on overrun.
    let start = std::time::Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            bail!("command '{}' exceeded timeout of {:?}", program, timeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let output = child
        .wait_with_output()
        .with_context(|| format!("collecting output of '{}'", program))?;

    if !output.status.success() {
        bail!(
            "command '{}' failed: {}\nstdout: {}\nstderr: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }

    Ok(output)
}

/// Real `SystemOps` backed by the host's `dd`, `mkfs.ext4`, `mount`,
/// `umount`, `mountpoint`, `losetup`, and `rsync` binaries.
pub struct HostSystemOps;

impl SystemOps for HostSystemOps {
    fn allocate_image(&self, path: &Path, size_bytes: u64, timeout: Duration) -> Result<(), Error> {
        let mut cmd = Command::new("dd");
        cmd.arg("if=/dev/zero")
            .arg(format!("of={}", path.display()))
            .arg("bs=1M")
            .arg(format!("count={}", (size_bytes + (1 << 20) - 1) >> 20))
            .arg("conv=sparse");
        run_command(cmd, timeout)?;
        Ok(())
    }

    fn format_ext4(&self, path: &Path, timeout: Duration) -> Result<(), Error> {
        let mut cmd = Command::new("mkfs.ext4");
        cmd.arg("-F").arg(path);
        run_command(cmd, timeout)?;
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path, timeout: Duration) -> Result<bool, Error> {
        let mut cmd = Command::new("mountpoint");
        cmd.arg("-q")
            .arg(mount_point)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // mountpoint exits 0 if mounted, non-zero otherwise; that's not a
        // "failure" in our sense, so interpret exit status directly rather
        // than bailing through run_command.
        let status = spawn_with_timeout(cmd, timeout)?;
        Ok(status.success())
    }

    fn mount_loop(&self, image: &Path, mount_point: &Path, timeout: Duration) -> Result<(), Error> {
        std::fs::create_dir_all(mount_point)
            .with_context(|| format!("creating mount point {}", mount_point.display()))?;
        let mut cmd = Command::new("mount");
        cmd.arg("-o")
            .arg("loop")
            .arg("-t")
            .arg("ext4")
            .arg(image)
            .arg(mount_point);
        run_command(cmd, timeout)?;
        debug!("mounted {} at {}", image.display(), mount_point.display());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path, timeout: Duration) -> Result<(), Error> {
        let mut cmd = Command::new("umount");
        cmd.arg(mount_point);
        run_command(cmd, timeout)?;
        debug!("unmounted {}", mount_point.display());
        Ok(())
    }

    fn loop_device_count(&self, timeout: Duration) -> Result<u32, Error> {
        let mut cmd = Command::new("losetup");
        cmd.arg("-a");
        let output = run_command(cmd, timeout)?;
        let count = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();
        Ok(count as u32)
    }

    fn rsync(&self, src: &Path, dst: &Path, timeout: Duration) -> Result<(), Error> {
        std::fs::create_dir_all(dst)?;
        let mut cmd = Command::new("rsync");
        cmd.arg("-a")
            .arg(format!("{}/", src.display()))
            .arg(format!("{}/", dst.display()));
        run_command(cmd, timeout)?;
        Ok(())
    }

    fn statfs(&self, mount_point: &Path) -> Result<(u64, u64, u64), Error> {
        use nix::sys::statvfs::statvfs;
        let stat = statvfs(mount_point).with_context(|| {
            format!("statvfs failed for {}", mount_point.display())
        })?;
        // Defensive per spec: "handles a negative block-size value
        // defensively (treat as zero)."
        let block_size = i64::try_from(stat.fragment_size()).unwrap_or(0).max(0) as u64;
        let blocks = stat.blocks();
        let bfree = stat.blocks_free();
        let bavail = stat.blocks_available();
        let total = blocks * block_size;
        let available = bavail * block_size;
        let used = total.saturating_sub(bfree * block_size);
        Ok((used, available, total))
    }
}

fn spawn_with_timeout(mut cmd: Command, timeout: Duration) -> Result<std::process::ExitStatus, Error> {
    let mut child = cmd.spawn()?;
    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            warn!("command timed out after {:?}", timeout);
            bail!("command exceeded timeout of {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// In-memory double used by the test suite: no kernel loop/mount support
/// required. "mounting" an image just means operations against
/// `mount_point` are redirected to a plain directory tree that this double
/// creates on first mount and removes on unmount.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSystemOps {
        mounted: Mutex<HashMap<std::path::PathBuf, ()>>,
        pub attach_count: std::sync::atomic::AtomicU64,
        pub loop_devices: std::sync::atomic::AtomicU32,
    }

    impl FakeSystemOps {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_loop_device_count(&self, n: u32) {
            self.loop_devices.store(n, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl SystemOps for FakeSystemOps {
        fn allocate_image(&self, path: &Path, size_bytes: u64, _timeout: Duration) -> Result<(), Error> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path)?;
            file.set_len(size_bytes)?;
            Ok(())
        }

        fn format_ext4(&self, path: &Path, _timeout: Duration) -> Result<(), Error> {
            if !path.exists() {
                bail!("image {} does not exist", path.display());
            }
            Ok(())
        }

        fn is_mounted(&self, mount_point: &Path, _timeout: Duration) -> Result<bool, Error> {
            Ok(self.mounted.lock().unwrap().contains_key(mount_point))
        }

        fn mount_loop(&self, _image: &Path, mount_point: &Path, _timeout: Duration) -> Result<(), Error> {
            std::fs::create_dir_all(mount_point)?;
            self.mounted
                .lock()
                .unwrap()
                .insert(mount_point.to_path_buf(), ());
            self.attach_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn unmount(&self, mount_point: &Path, _timeout: Duration) -> Result<(), Error> {
            self.mounted.lock().unwrap().remove(mount_point);
            Ok(())
        }

        fn loop_device_count(&self, _timeout: Duration) -> Result<u32, Error> {
            Ok(self.loop_devices.load(std::sync::atomic::Ordering::SeqCst))
        }

        fn rsync(&self, src: &Path, dst: &Path, _timeout: Duration) -> Result<(), Error> {
            copy_dir_recursive(src, dst)
        }

        fn statfs(&self, mount_point: &Path) -> Result<(u64, u64, u64), Error> {
            let total = 64u64 * 1024 * 1024;
            let used = dir_size(mount_point).unwrap_or(0);
            let available = total.saturating_sub(used);
            Ok((used, available, total))
        }
    }

    fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(dst)?;
        if !src.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let ty = entry.file_type()?;
            let target = dst.join(entry.file_name());
            if ty.is_dir() {
                copy_dir_recursive(&entry.path(), &target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    fn dir_size(path: &Path) -> Result<u64, Error> {
        if !path.exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let ty = entry.file_type()?;
            if ty.is_dir() {
                total += dir_size(&entry.path())?;
            } else {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}
