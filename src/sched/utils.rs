// src/sched/utils.rs
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Write `bytes` to `final_path` via `<final>.tmp` + fsync + rename.
/// On any failure the tmp file is removed and the prior file is left in
/// place.
pub(crate) fn write_atomic(final_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(final_path);
    let result = (|| {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, final_path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub(crate) fn tmp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    final_path.with_file_name(name)
}

static URL_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/([^/?#]+)\.([A-Za-z0-9]+)(?:[?#].*)?$").unwrap());

/// Extract `(stem, extension)` from a URL's path component. None when
/// the URL has no path or no extension.
pub(crate) fn url_filename(url: &str) -> Option<(String, String)> {
    let caps = URL_FILENAME.captures(url)?;
    let stem = caps.get(1)?.as_str().to_string();
    let ext = caps.get(2)?.as_str().to_ascii_lowercase();
    if stem.is_empty() {
        return None;
    }
    Some((stem, ext))
}

/// Probe `dir/stem.ext`, `dir/stem_1.ext`, ... and return the first
/// free path. Gives up after 9999 collisions.
pub(crate) fn unique_dest(dir: &Path, stem: &str, ext: &str) -> Option<PathBuf> {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return Some(first);
    }
    for n in 1..=9999u32 {
        let candidate = dir.join(format!("{stem}_{n}.{ext}"));
        if !candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_and_cleans_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("x.bin");
        write_atomic(&dest, b"one").unwrap();
        write_atomic(&dest, b"two").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"two");
        assert!(!tmp_path(&dest).exists());
    }

    #[test]
    fn url_filename_extraction() {
        assert_eq!(
            url_filename("https://x/y/art.gif"),
            Some(("art".into(), "gif".into()))
        );
        assert_eq!(
            url_filename("https://x/y/Art.WEBP?v=2"),
            Some(("Art".into(), "webp".into()))
        );
        assert_eq!(url_filename("https://x/"), None);
        assert_eq!(url_filename("https://x/noext"), None);
    }

    #[test]
    fn unique_dest_probes_suffixes() {
        let tmp = tempfile::tempdir().unwrap();
        let first = unique_dest(tmp.path(), "art", "gif").unwrap();
        assert_eq!(first, tmp.path().join("art.gif"));
        fs::write(&first, b"x").unwrap();
        let second = unique_dest(tmp.path(), "art", "gif").unwrap();
        assert_eq!(second, tmp.path().join("art_1.gif"));
        fs::write(&second, b"x").unwrap();
        assert_eq!(
            unique_dest(tmp.path(), "art", "gif").unwrap(),
            tmp.path().join("art_2.gif")
        );
    }
}
