//! Hash & Path Resolver: pure, I/O-free mapping from a fingerprint to the
//! paths that hold it.

use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Number of hex characters in a fingerprint (SHA-256, 32 bytes).
pub const HASH_LEN: usize = 64;

/// Validate and lowercase a fingerprint.
///
/// Per spec: "callers may submit uppercase and the system lowercases on
/// entry. Invariant: every fingerprint in any internal table is already
/// lowercased and validated."
pub fn validate(h: &str) -> Result<String, StoreError> {
    if h.len() != HASH_LEN {
        return Err(StoreError::InvalidHash(h.to_string()));
    }
    if !h.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidHash(h.to_string()));
    }
    Ok(h.to_ascii_lowercase())
}

/// `true` iff `s` would be accepted by [`validate`].
pub fn is_valid(s: &str) -> bool {
    s.len() == HASH_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn shard(h: &str, root: &Path) -> PathBuf {
    root.join(&h[0..2]).join(&h[2..4])
}

/// `<root>/<h[0:2]>/<h[2:4]>/loop.img`
pub fn image_path(h: &str, root: &Path) -> PathBuf {
    shard(h, root).join("loop.img")
}

/// `<root>/<h[0:2]>/<h[2:4]>/loop.img.new`, transient during resize.
pub fn image_new_path(h: &str, root: &Path) -> PathBuf {
    shard(h, root).join("loop.img.new")
}

/// `<root>/<h[0:2]>/<h[2:4]>/loop.img.backup`, transient during resize swap.
pub fn image_backup_path(h: &str, root: &Path) -> PathBuf {
    shard(h, root).join("loop.img.backup")
}

/// `<root>/<h[0:2]>/<h[2:4]>/loopmount`
pub fn mount_path(h: &str, root: &Path) -> PathBuf {
    shard(h, root).join("loopmount")
}

/// `<root>/<h[0:2]>/<h[2:4]>/loopmount.new`, transient mount dir during resize.
pub fn mount_new_path(h: &str, root: &Path) -> PathBuf {
    shard(h, root).join("loopmount.new")
}

/// `<mount>/<h[4:6]>/<h[6:8]>`
pub fn blob_dir(h: &str, root: &Path) -> PathBuf {
    mount_path(h, root).join(&h[4..6]).join(&h[6..8])
}

/// `<mount>/<h[4:6]>/<h[6:8]>/<h[8:]>`
pub fn blob_path(h: &str, root: &Path) -> PathBuf {
    blob_dir(h, root).join(&h[8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const H: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn validate_accepts_lowercase_hex() {
        assert_eq!(validate(H).unwrap(), H);
    }

    #[test]
    fn validate_lowercases_uppercase_input() {
        let upper = H.to_ascii_uppercase();
        assert_eq!(validate(&upper).unwrap(), H);
    }

    #[test]
    fn validate_rejects_wrong_length() {
        assert!(validate(&H[..63]).is_err());
        assert!(validate(&(H.to_string() + "a")).is_err());
    }

    #[test]
    fn validate_rejects_non_hex() {
        assert!(validate("not-hex!!").is_err());
        let mut bad = H.to_string();
        bad.replace_range(0..1, "g");
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn paths_are_pure_functions_of_hash_and_root() {
        let root = Path::new("/srv/loopstore");
        let img = image_path(H, root);
        let mnt = mount_path(H, root);
        let blob = blob_path(H, root);

        assert_eq!(img, mount_path(H, root).parent().unwrap().join("loop.img"));
        assert!(mnt.ends_with("loopmount"));
        assert!(blob.starts_with(&mnt));
        // deterministic: calling again yields identical paths
        assert_eq!(img, image_path(H, root));
        assert_eq!(blob, blob_path(H, root));
    }
}
