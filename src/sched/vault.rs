//! Sharded vault paths. Payload files live under
//! `<vault>/<hh>/<hh>/<hh>/<storage_key>.<ext>` where the three `hh`
//! components are the first bytes of SHA-256 over the storage key's
//! canonical (lowercase hyphenated) string form.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::sched::types::MediaExt;

fn shard_prefix(storage_key: &Uuid) -> [String; 3] {
    let canonical = storage_key.as_hyphenated().to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    [
        format!("{:02x}", digest[0]),
        format!("{:02x}", digest[1]),
        format!("{:02x}", digest[2]),
    ]
}

pub fn vault_path(vault_dir: &Path, storage_key: &Uuid, ext: MediaExt) -> PathBuf {
    let [a, b, c] = shard_prefix(storage_key);
    vault_dir
        .join(a)
        .join(b)
        .join(c)
        .join(format!("{}.{}", storage_key.as_hyphenated(), ext.as_str()))
}

/// The four candidate payload paths for a key, one per supported
/// extension. Cleanup probes all of them because the extension is only
/// known while the artwork URL is at hand.
pub fn candidate_paths(vault_dir: &Path, storage_key: &Uuid) -> [PathBuf; 4] {
    MediaExt::ALL.map(|ext| vault_path(vault_dir, storage_key, ext))
}

pub fn find_existing(vault_dir: &Path, storage_key: &Uuid) -> Option<PathBuf> {
    candidate_paths(vault_dir, storage_key).into_iter().find(|p| p.exists())
}

/// Unlink whichever candidate exists. Returns the removed path.
pub fn remove_payload(vault_dir: &Path, storage_key: &Uuid) -> Option<PathBuf> {
    for p in candidate_paths(vault_dir, storage_key) {
        if p.exists() {
            match fs::remove_file(&p) {
                Ok(()) => {
                    debug!("removed vault payload {}", p.display());
                    return Some(p);
                }
                Err(e) => {
                    tracing::warn!("failed to remove {}: {e}", p.display());
                    return None;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[test]
    fn shard_components_are_sha256_prefix() {
        let k = key("2c6b1a0e-8f1d-4c3a-9b5e-000000000001");
        let digest = Sha256::digest(k.as_hyphenated().to_string().as_bytes());
        let p = vault_path(Path::new("/vault"), &k, MediaExt::Jpg);
        let s = p.to_string_lossy().replace('\\', "/");
        assert!(s.starts_with(&format!(
            "/vault/{:02x}/{:02x}/{:02x}/",
            digest[0], digest[1], digest[2]
        )));
        assert!(s.ends_with("2c6b1a0e-8f1d-4c3a-9b5e-000000000001.jpg"));
    }

    #[test]
    fn probe_and_remove_cover_all_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let k = Uuid::new_v4();
        assert!(find_existing(tmp.path(), &k).is_none());

        let target = vault_path(tmp.path(), &k, MediaExt::Webp);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"payload").unwrap();

        assert_eq!(find_existing(tmp.path(), &k).unwrap(), target);
        assert_eq!(remove_payload(tmp.path(), &k).unwrap(), target);
        assert!(!target.exists());
        assert!(remove_payload(tmp.path(), &k).is_none());
    }
}
