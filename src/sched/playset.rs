//! Named playset definitions persisted as checksummed binary blobs
//! under `<channels_dir>/<name>.playset`.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::sched::types::{
    ChannelKind, ChannelSpec, ExposureMode, PickMode, PlaysetCmd, SchedError, SchedResult,
    MAX_CHANNELS, PLAYSET_ENTRY_LEN, PLAYSET_HEADER_LEN, PLAYSET_MAGIC, PLAYSET_MAX_NAME_LEN,
    PLAYSET_VERSION,
};
use crate::sched::utils::write_atomic;

// Header field offsets (32 bytes total, little-endian).
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_EXPOSURE: usize = 8;
const OFF_PICK: usize = 9;
const OFF_CHANNEL_COUNT: usize = 10;
const OFF_CHECKSUM: usize = 12;

// Entry field offsets (128 bytes each).
const ENT_KIND: usize = 0;
const ENT_WEIGHT: usize = 2;
const ENT_NAME: usize = 4;
const ENT_NAME_LEN: usize = 28;
const ENT_IDENT: usize = 32;
const ENT_IDENT_LEN: usize = 32;
const ENT_DISPLAY: usize = 64;
const ENT_DISPLAY_LEN: usize = 64;

/// Names the control surface may not delete or overwrite.
static PROTECTED_NAMES: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["followed_artists"]);

pub fn is_protected_name(name: &str) -> bool {
    PROTECTED_NAMES.iter().any(|p| *p == name)
}

/// ASCII, non-empty, bounded, filesystem-safe.
pub fn validate_name(name: &str) -> SchedResult<()> {
    if name.is_empty() || name.len() > PLAYSET_MAX_NAME_LEN {
        return Err(SchedError::InvalidArg);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(SchedError::InvalidArg);
    }
    Ok(())
}

pub struct PlaysetStore {
    dir: PathBuf,
}

impl PlaysetStore {
    pub fn new(channels_dir: &Path) -> Self {
        Self { dir: channels_dir.to_path_buf() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.playset"))
    }

    /// Persist a playset. Protected names are refused; internal callers
    /// that own those names go through `save_unchecked`.
    pub fn save(&self, name: &str, cmd: &PlaysetCmd) -> SchedResult<()> {
        validate_name(name)?;
        if is_protected_name(name) {
            return Err(SchedError::InvalidArg);
        }
        self.save_unchecked(name, cmd)
    }

    pub(crate) fn save_unchecked(&self, name: &str, cmd: &PlaysetCmd) -> SchedResult<()> {
        validate_name(name)?;
        if cmd.channels.is_empty() || cmd.channels.len() > MAX_CHANNELS {
            return Err(SchedError::InvalidArg);
        }
        let bytes = serialize(cmd)?;
        write_atomic(&self.path_for(name), &bytes)?;
        Ok(())
    }

    /// Load a named playset. A corrupt or version-mismatched file is
    /// unlinked so the bad blob cannot keep failing forever.
    pub fn load(&self, name: &str) -> SchedResult<PlaysetCmd> {
        validate_name(name)?;
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SchedError::NotFound)
            }
            Err(e) => return Err(SchedError::IoFail(e)),
        };
        match deserialize(&bytes) {
            Ok(cmd) => Ok(cmd),
            Err(e @ (SchedError::InvalidCrc | SchedError::InvalidVersion)) => {
                warn!("playset {} corrupt ({e}); unlinking", path.display());
                let _ = fs::remove_file(&path);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.path_for(name).exists()
    }

    pub fn delete(&self, name: &str) -> SchedResult<()> {
        validate_name(name)?;
        if is_protected_name(name) {
            return Err(SchedError::InvalidArg);
        }
        let path = self.path_for(name);
        if !path.exists() {
            return Err(SchedError::NotFound);
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Directory scan for `*.playset`, bounded by `max`.
    pub fn list(&self, max: usize) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(read) = fs::read_dir(&self.dir) else {
            return names;
        };
        for entry in read.filter_map(Result::ok) {
            if names.len() >= max {
                break;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("playset") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names
    }
}

fn put_str(buf: &mut [u8], s: &str) -> SchedResult<()> {
    let raw = s.as_bytes();
    // Reserve one byte for the NUL terminator.
    if raw.len() >= buf.len() {
        return Err(SchedError::InvalidArg);
    }
    buf[..raw.len()].copy_from_slice(raw);
    Ok(())
}

fn get_str(buf: &[u8]) -> SchedResult<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(std::str::from_utf8(&buf[..end])
        .map_err(|_| SchedError::InvalidArg)?
        .to_string())
}

fn serialize(cmd: &PlaysetCmd) -> SchedResult<Vec<u8>> {
    let total = PLAYSET_HEADER_LEN + cmd.channels.len() * PLAYSET_ENTRY_LEN;
    let mut out = vec![0u8; total];
    out[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&PLAYSET_MAGIC.to_le_bytes());
    out[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&PLAYSET_VERSION.to_le_bytes());
    out[OFF_EXPOSURE] = cmd.exposure.as_u8();
    out[OFF_PICK] = cmd.pick.as_u8();
    out[OFF_CHANNEL_COUNT] = cmd.channels.len() as u8;

    for (i, spec) in cmd.channels.iter().enumerate() {
        let off = PLAYSET_HEADER_LEN + i * PLAYSET_ENTRY_LEN;
        let ent = &mut out[off..off + PLAYSET_ENTRY_LEN];
        ent[ENT_KIND] = spec.kind.as_u8();
        ent[ENT_WEIGHT..ENT_WEIGHT + 2].copy_from_slice(&spec.weight.to_le_bytes());
        put_str(&mut ent[ENT_NAME..ENT_NAME + ENT_NAME_LEN], &spec.name)?;
        put_str(&mut ent[ENT_IDENT..ENT_IDENT + ENT_IDENT_LEN], &spec.identifier)?;
        put_str(&mut ent[ENT_DISPLAY..ENT_DISPLAY + ENT_DISPLAY_LEN], &spec.display_name)?;
    }

    let crc = crc32fast::hash(&out);
    out[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

fn deserialize(bytes: &[u8]) -> SchedResult<PlaysetCmd> {
    if bytes.len() < PLAYSET_HEADER_LEN {
        return Err(SchedError::InvalidSize);
    }
    if u32::from_le_bytes(bytes[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap_or_default())
        != PLAYSET_MAGIC
    {
        return Err(SchedError::InvalidSize);
    }
    let version =
        u16::from_le_bytes([bytes[OFF_VERSION], bytes[OFF_VERSION + 1]]);
    if version != PLAYSET_VERSION {
        return Err(SchedError::InvalidVersion);
    }
    let count = bytes[OFF_CHANNEL_COUNT] as usize;
    if count == 0 || count > MAX_CHANNELS
        || bytes.len() != PLAYSET_HEADER_LEN + count * PLAYSET_ENTRY_LEN
    {
        return Err(SchedError::InvalidSize);
    }

    let stored =
        u32::from_le_bytes(bytes[OFF_CHECKSUM..OFF_CHECKSUM + 4].try_into().unwrap_or_default());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..OFF_CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&bytes[OFF_CHECKSUM + 4..]);
    if hasher.finalize() != stored {
        return Err(SchedError::InvalidCrc);
    }

    let exposure = ExposureMode::from_u8(bytes[OFF_EXPOSURE]).ok_or(SchedError::InvalidArg)?;
    let pick = PickMode::from_u8(bytes[OFF_PICK]).ok_or(SchedError::InvalidArg)?;

    let mut channels = Vec::with_capacity(count);
    for i in 0..count {
        let off = PLAYSET_HEADER_LEN + i * PLAYSET_ENTRY_LEN;
        let ent = &bytes[off..off + PLAYSET_ENTRY_LEN];
        let kind = ChannelKind::from_u8(ent[ENT_KIND]).ok_or(SchedError::InvalidArg)?;
        channels.push(ChannelSpec {
            kind,
            weight: u16::from_le_bytes([ent[ENT_WEIGHT], ent[ENT_WEIGHT + 1]]),
            name: get_str(&ent[ENT_NAME..ENT_NAME + ENT_NAME_LEN])?,
            identifier: get_str(&ent[ENT_IDENT..ENT_IDENT + ENT_IDENT_LEN])?,
            display_name: get_str(&ent[ENT_DISPLAY..ENT_DISPLAY + ENT_DISPLAY_LEN])?,
        });
    }
    Ok(PlaysetCmd { channels, exposure, pick })
}
