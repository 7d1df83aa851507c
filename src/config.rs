//! Store configuration, per the "Configuration (enumerated)" list.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_image_size_mb() -> u64 {
    1024
}

fn default_base_cmd_timeout() -> u64 {
    10
}

fn default_allocate_timeout_per_gb() -> u64 {
    5
}

fn default_format_timeout_per_gb() -> u64 {
    20
}

fn default_rsync_timeout_per_gb() -> u64 {
    60
}

fn default_min_long_timeout() -> u64 {
    30
}

fn default_max_long_timeout() -> u64 {
    3600
}

fn default_mount_idle_ttl() -> u64 {
    300
}

/// Configuration for a [`crate::store::LoopBlobStore`].
///
/// All timeout fields are seconds; deserializable straight from a TOML
/// file, matching the shape of the teacher's `config/datastore.rs` settings
/// without depending on its private section-config parser.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub storage_root: PathBuf,

    #[serde(default = "default_image_size_mb")]
    pub image_size_mb: u64,

    #[serde(default = "default_base_cmd_timeout")]
    pub base_cmd_timeout: u64,

    #[serde(default = "default_allocate_timeout_per_gb")]
    pub allocate_timeout_per_gb: u64,

    #[serde(default = "default_format_timeout_per_gb")]
    pub format_timeout_per_gb: u64,

    #[serde(default = "default_rsync_timeout_per_gb")]
    pub rsync_timeout_per_gb: u64,

    #[serde(default = "default_min_long_timeout")]
    pub min_long_timeout: u64,

    #[serde(default = "default_max_long_timeout")]
    pub max_long_timeout: u64,

    #[serde(default = "default_mount_idle_ttl")]
    pub mount_idle_ttl: u64,
}

impl StoreConfig {
    pub fn new<P: Into<PathBuf>>(storage_root: P) -> Self {
        StoreConfig {
            storage_root: storage_root.into(),
            image_size_mb: default_image_size_mb(),
            base_cmd_timeout: default_base_cmd_timeout(),
            allocate_timeout_per_gb: default_allocate_timeout_per_gb(),
            format_timeout_per_gb: default_format_timeout_per_gb(),
            rsync_timeout_per_gb: default_rsync_timeout_per_gb(),
            min_long_timeout: default_min_long_timeout(),
            max_long_timeout: default_max_long_timeout(),
            mount_idle_ttl: default_mount_idle_ttl(),
        }
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: StoreConfig = toml::from_str(raw)?;
        Ok(cfg)
    }

    pub fn base_cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.base_cmd_timeout)
    }

    pub fn mount_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.mount_idle_ttl)
    }

    /// Clamp a per-gigabyte budget to `[min_long_timeout, max_long_timeout]`
    /// scaled by `size_bytes`, per spec: "clamped to a min/max window so
    /// tiny images still have a reasonable floor and huge images cannot
    /// wedge forever."
    pub fn scaled_timeout(&self, size_bytes: u64, per_gb: u64) -> Duration {
        let gib = size_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let secs = (gib * per_gb as f64).ceil() as u64;
        let clamped = secs.clamp(self.min_long_timeout, self.max_long_timeout);
        Duration::from_secs(clamped)
    }

    pub fn allocate_timeout(&self, size_bytes: u64) -> Duration {
        self.scaled_timeout(size_bytes, self.allocate_timeout_per_gb)
    }

    pub fn format_timeout(&self, size_bytes: u64) -> Duration {
        self.scaled_timeout(size_bytes, self.format_timeout_per_gb)
    }

    pub fn rsync_timeout(&self, size_bytes: u64) -> Duration {
        self.scaled_timeout(size_bytes, self.rsync_timeout_per_gb)
    }

    pub fn image_size_bytes(&self) -> u64 {
        self.image_size_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = StoreConfig::new("/srv/loopstore");
        assert_eq!(cfg.mount_idle_ttl, 300);
        assert_eq!(cfg.image_size_mb, 1024);
    }

    #[test]
    fn scaled_timeout_clamps_both_ends() {
        let cfg = StoreConfig::new("/srv/loopstore");
        // tiny image: floor at min_long_timeout
        assert_eq!(
            cfg.scaled_timeout(1024, cfg.format_timeout_per_gb),
            Duration::from_secs(cfg.min_long_timeout)
        );
        // huge image: ceiling at max_long_timeout
        let huge = 10_000u64 * 1024 * 1024 * 1024;
        assert_eq!(
            cfg.scaled_timeout(huge, cfg.format_timeout_per_gb),
            Duration::from_secs(cfg.max_long_timeout)
        );
    }

    #[test]
    fn parses_toml() {
        let raw = r#"
            storage_root = "/srv/loopstore"
            image_size_mb = 64
        "#;
        let cfg = StoreConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.image_size_mb, 64);
        assert_eq!(cfg.mount_idle_ttl, 300);
    }
}
