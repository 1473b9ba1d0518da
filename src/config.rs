use serde::Deserialize;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::sched::PickMode;

const CONFIG_FILENAME: &str = "config.json";

static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Where the scheduler keeps and finds things on the storage medium,
/// plus the two play-order settings the device remembers. This is the
/// settings surface the rest of the firmware reads.
#[derive(Clone, Debug)]
pub struct Paths {
    pub channels_dir: PathBuf,
    pub vault_dir: PathBuf,
    pub animations_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub global_seed: u64,
    pub play_order: PickMode,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    channels_dir: Option<String>,
    vault_dir: Option<String>,
    animations_dir: Option<String>,
    downloads_dir: Option<String>,
    global_seed: Option<u64>,
    play_order: Option<String>,
}

pub fn base_dir() -> &'static Path {
    BASE_DIR.get_or_init(determine_base_dir).as_path()
}

fn determine_base_dir() -> PathBuf {
    if let Ok(override_dir) = env::var("FRAMELOOP_BASE_DIR") {
        let path = PathBuf::from(override_dir);
        if path.is_absolute() {
            return path;
        }
        if let Ok(cwd) = env::current_dir() {
            return cwd.join(path);
        }
    }

    if let Ok(exe_path) = env::current_exe() {
        if let Some(parent) = exe_path.parent() {
            return parent.to_path_buf();
        }
    }

    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_relative_path<P: AsRef<Path>>(input: P) -> PathBuf {
    let p = input.as_ref();
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir().join(p)
    }
}

fn read_config_source() -> Option<(PathBuf, String)> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Ok(custom) = env::var("FRAMELOOP_CONFIG") {
        candidates.push(resolve_relative_path(custom));
    }

    candidates.push(base_dir().join(CONFIG_FILENAME));

    if let Ok(cwd) = env::current_dir() {
        let candidate = cwd.join(CONFIG_FILENAME);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }

    for path in candidates {
        match fs::read_to_string(&path) {
            Ok(raw) => return Some((path, raw)),
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    continue;
                }
                warn!("Failed to read {}: {err}", path.display());
            }
        }
    }

    None
}

/// Load the path/settings configuration, falling back to defaults next
/// to the base dir when `config.json` is absent or unreadable.
pub fn load_paths() -> Paths {
    let raw = if let Some((path, text)) = read_config_source() {
        match serde_json::from_str::<RawConfig>(&text) {
            Ok(parsed) => {
                info!("Loaded config from {}", path.display());
                parsed
            }
            Err(err) => {
                warn!("Failed to parse {} ({err}). Using defaults.", path.display());
                RawConfig::default()
            }
        }
    } else {
        info!(
            "No {CONFIG_FILENAME} found near {} (or via FRAMELOOP_CONFIG); using defaults.",
            base_dir().display()
        );
        RawConfig::default()
    };

    let paths = apply(raw, base_dir());
    ensure_dirs(&paths);
    paths
}

fn apply(raw: RawConfig, base: &Path) -> Paths {
    let dir = |custom: Option<String>, default: &str| -> PathBuf {
        match custom.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => {
                let p = PathBuf::from(s);
                if p.is_absolute() {
                    p
                } else {
                    base.join(p)
                }
            }
            _ => base.join(default),
        }
    };
    Paths {
        channels_dir: dir(raw.channels_dir, "channels"),
        vault_dir: dir(raw.vault_dir, "vault"),
        animations_dir: dir(raw.animations_dir, "animations"),
        downloads_dir: dir(raw.downloads_dir, "downloads"),
        global_seed: raw.global_seed.unwrap_or(0),
        play_order: raw
            .play_order
            .as_deref()
            .and_then(PickMode::from_str)
            .unwrap_or(PickMode::Recency),
    }
}

fn ensure_dirs(paths: &Paths) {
    for dir in [&paths.channels_dir, &paths.vault_dir, &paths.animations_dir, &paths.downloads_dir]
    {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("failed to create {}: {e}", dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hang_off_the_base_dir() {
        let paths = apply(RawConfig::default(), Path::new("/frame"));
        assert_eq!(paths.channels_dir, Path::new("/frame/channels"));
        assert_eq!(paths.vault_dir, Path::new("/frame/vault"));
        assert_eq!(paths.global_seed, 0);
        assert_eq!(paths.play_order, PickMode::Recency);
    }

    #[test]
    fn config_overrides_and_relative_resolution() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "channels_dir": "/mnt/card/channels",
                "vault_dir": "store/vault",
                "global_seed": 1234,
                "play_order": "random"
            }"#,
        )
        .unwrap();
        let paths = apply(raw, Path::new("/frame"));
        assert_eq!(paths.channels_dir, Path::new("/mnt/card/channels"));
        assert_eq!(paths.vault_dir, Path::new("/frame/store/vault"));
        assert_eq!(paths.global_seed, 1234);
        assert_eq!(paths.play_order, PickMode::Random);
    }

    #[test]
    fn unknown_play_order_falls_back() {
        let raw: RawConfig =
            serde_json::from_str(r#"{ "play_order": "shuffle?" }"#).unwrap();
        let paths = apply(raw, Path::new("/frame"));
        assert_eq!(paths.play_order, PickMode::Recency);
    }
}
