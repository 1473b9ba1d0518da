// src/sched/types.rs
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

// ---- Tunables ----
pub const MAX_CHANNELS: usize = 16;
pub const CI_MAX_ENTRIES: usize = 1024;
pub const PICK_HISTORY_LEN: usize = 16; // global back-history ring
pub const RECENCY_WINDOW: usize = 8; // per-channel no-repeat window
pub const PLAYSET_MAX_NAME_LEN: usize = 32;
pub const DEFAULT_DWELL_MS: u32 = 15_000;

// ---- On-disk layout constants ----
pub const CACHE_MAGIC: u32 = 0x5033_4143; // "P3AC"
pub const CACHE_VERSION: u16 = 20;
pub const CACHE_HEADER_LEN: usize = 44;
pub const CACHE_FLAG_SDCARD: u16 = 0x0001;
pub const CATALOG_ENTRY_LEN: usize = 64;
pub const SD_ENTRY_LEN: usize = 160;
pub const SD_NAME_MAX: usize = 151; // bytes, excluding the NUL terminator

pub const PLAYSET_MAGIC: u32 = 0x5033_5053; // "P3PS"
pub const PLAYSET_VERSION: u16 = 1;
pub const PLAYSET_HEADER_LEN: usize = 32;
pub const PLAYSET_ENTRY_LEN: usize = 128;

pub type SchedResult<T> = Result<T, SchedError>;

/// Error kinds surfaced by the scheduler. Corrupt persistent state is
/// normally recovered silently (empty cache + log line); these are for
/// the cases callers must distinguish.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid state")]
    InvalidState,
    #[error("not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("out of memory")]
    NoMem,
    #[error("invalid size")]
    InvalidSize,
    #[error("checksum mismatch")]
    InvalidCrc,
    #[error("unsupported version")]
    InvalidVersion,
    #[error("io failure: {0}")]
    IoFail(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("still pending")]
    NotFinished,
}

// ---- channel identity ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Sdcard,
    Named,
    User,
    Hashtag,
    Artwork,
}

impl ChannelKind {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Sdcard => 0,
            Self::Named => 1,
            Self::User => 2,
            Self::Hashtag => 3,
            Self::Artwork => 4,
        }
    }
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Sdcard),
            1 => Some(Self::Named),
            2 => Some(Self::User),
            3 => Some(Self::Hashtag),
            4 => Some(Self::Artwork),
            _ => None,
        }
    }
}

/// Keep only `[A-Za-z0-9_]`; everything else becomes `_`.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// A channel's short ASCII identity, e.g. `sdcard`, `all`,
/// `by_user_k3xq`, `hashtag_pixelart`, `artwork`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelId {
    kind: ChannelKind,
    id: String,
}

impl ChannelId {
    pub fn sdcard() -> Self {
        Self { kind: ChannelKind::Sdcard, id: "sdcard".into() }
    }

    pub fn named(name: &str) -> Self {
        Self { kind: ChannelKind::Named, id: sanitize_identifier(name) }
    }

    pub fn user(sqid: &str) -> Self {
        Self { kind: ChannelKind::User, id: format!("by_user_{}", sanitize_identifier(sqid)) }
    }

    pub fn hashtag(tag: &str) -> Self {
        Self { kind: ChannelKind::Hashtag, id: format!("hashtag_{}", sanitize_identifier(tag)) }
    }

    pub fn artwork() -> Self {
        Self { kind: ChannelKind::Artwork, id: "artwork".into() }
    }

    pub fn from_spec(spec: &ChannelSpec) -> Self {
        match spec.kind {
            ChannelKind::Sdcard => Self::sdcard(),
            ChannelKind::Named => Self::named(&spec.name),
            ChannelKind::User => Self::user(&spec.identifier),
            ChannelKind::Hashtag => Self::hashtag(&spec.identifier),
            ChannelKind::Artwork => Self::artwork(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Cache file stem: the id with `:` mapped to `_` so it is always a
    /// plain filename on FAT.
    pub fn file_stem(&self) -> String {
        self.id.replace(':', "_")
    }

    /// True for every catalog-backed kind; only storage-card channels
    /// play without the remote service.
    pub fn is_makapix(&self) -> bool {
        self.kind != ChannelKind::Sdcard
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// ---- artwork payload types ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtworkKind {
    Still,
    Animation,
    Other,
}

impl ArtworkKind {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Still => 0,
            Self::Animation => 1,
            Self::Other => 2,
        }
    }
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Still,
            1 => Self::Animation,
            _ => Self::Other,
        }
    }
}

/// Payload file extension. The vault stores exactly these four; unknown
/// URL suffixes fall back to webp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaExt {
    Gif,
    Png,
    Jpg,
    Webp,
}

impl MediaExt {
    pub const ALL: [Self; 4] = [Self::Gif, Self::Png, Self::Jpg, Self::Webp];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gif => "gif",
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Gif => 0,
            Self::Png => 1,
            Self::Jpg => 2,
            Self::Webp => 3,
        }
    }

    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Gif,
            1 => Self::Png,
            2 => Self::Jpg,
            _ => Self::Webp,
        }
    }

    /// Suffix scan of an artwork URL; `.jpeg` collapses to jpg.
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or("");
        if path.ends_with(".gif") {
            Self::Gif
        } else if path.ends_with(".png") {
            Self::Png
        } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
            Self::Jpg
        } else {
            Self::Webp
        }
    }
}

// ---- Ci entries ----

/// One catalog entry of a remote channel. 64 bytes packed LE on disk:
/// post_id @0, storage_key @4, kind @20, flags @21, dwell_ms @22,
/// created_at @32, reserved to 64.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub post_id: i32,
    pub storage_key: Uuid,
    pub kind: ArtworkKind,
    pub flags: u8,
    pub dwell_ms: u32,
    pub created_at: i64,
}

impl CatalogEntry {
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= CATALOG_ENTRY_LEN);
        buf[..CATALOG_ENTRY_LEN].fill(0);
        buf[0..4].copy_from_slice(&self.post_id.to_le_bytes());
        buf[4..20].copy_from_slice(self.storage_key.as_bytes());
        buf[20] = self.kind.as_u8();
        buf[21] = self.flags;
        buf[22..26].copy_from_slice(&self.dwell_ms.to_le_bytes());
        buf[32..40].copy_from_slice(&self.created_at.to_le_bytes());
    }

    pub fn decode_from(buf: &[u8]) -> SchedResult<Self> {
        if buf.len() < CATALOG_ENTRY_LEN {
            return Err(SchedError::InvalidSize);
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&buf[4..20]);
        Ok(Self {
            post_id: i32::from_le_bytes(buf[0..4].try_into().map_err(|_| SchedError::InvalidSize)?),
            storage_key: Uuid::from_bytes(key),
            kind: ArtworkKind::from_u8(buf[20]),
            flags: buf[21],
            dwell_ms: u32::from_le_bytes(buf[22..26].try_into().map_err(|_| SchedError::InvalidSize)?),
            created_at: i64::from_le_bytes(buf[32..40].try_into().map_err(|_| SchedError::InvalidSize)?),
        })
    }
}

/// One storage-card entry. 160 bytes packed LE on disk: post_id @0,
/// extension @4, pad to 8, NUL-terminated UTF-8 filename @8. The
/// filename is the play identity; post_id is only an ordering hint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdEntry {
    pub post_id: i32,
    pub extension: MediaExt,
    pub name: String,
}

impl SdEntry {
    pub fn encode_into(&self, buf: &mut [u8]) -> SchedResult<()> {
        if buf.len() < SD_ENTRY_LEN {
            return Err(SchedError::InvalidSize);
        }
        let name = self.name.as_bytes();
        if name.len() > SD_NAME_MAX {
            return Err(SchedError::InvalidArg);
        }
        buf[..SD_ENTRY_LEN].fill(0);
        buf[0..4].copy_from_slice(&self.post_id.to_le_bytes());
        buf[4] = self.extension.as_u8();
        buf[8..8 + name.len()].copy_from_slice(name);
        Ok(())
    }

    pub fn decode_from(buf: &[u8]) -> SchedResult<Self> {
        if buf.len() < SD_ENTRY_LEN {
            return Err(SchedError::InvalidSize);
        }
        let raw = &buf[8..SD_ENTRY_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = std::str::from_utf8(&raw[..end])
            .map_err(|_| SchedError::InvalidArg)?
            .to_string();
        Ok(Self {
            post_id: i32::from_le_bytes(buf[0..4].try_into().map_err(|_| SchedError::InvalidSize)?),
            extension: MediaExt::from_u8(buf[4]),
            name,
        })
    }
}

// ---- playsets ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureMode {
    Equal,
    Manual,
    Proportional,
}

impl ExposureMode {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Equal => 0,
            Self::Manual => 1,
            Self::Proportional => 2,
        }
    }
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Equal),
            1 => Some(Self::Manual),
            2 => Some(Self::Proportional),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickMode {
    Recency,
    Random,
}

impl PickMode {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Recency => 0,
            Self::Random => 1,
        }
    }
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Recency),
            1 => Some(Self::Random),
            _ => None,
        }
    }
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recency => "recency",
            Self::Random => "random",
        }
    }
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "recency" => Some(Self::Recency),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// One channel slot of a playset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub kind: ChannelKind,
    pub name: String,
    pub identifier: String,
    pub display_name: String,
    pub weight: u16,
}

impl ChannelSpec {
    pub fn sdcard() -> Self {
        Self {
            kind: ChannelKind::Sdcard,
            name: "sdcard".into(),
            identifier: String::new(),
            display_name: "Storage card".into(),
            weight: 1,
        }
    }

    pub fn named(name: &str) -> Self {
        Self {
            kind: ChannelKind::Named,
            name: name.into(),
            identifier: String::new(),
            display_name: name.into(),
            weight: 1,
        }
    }
}

/// A full playset: what `execute_playset` consumes and the playset
/// store persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaysetCmd {
    pub channels: Vec<ChannelSpec>,
    pub exposure: ExposureMode,
    pub pick: PickMode,
}

// ---- scheduler outputs ----

/// What the renderer is handed for one pick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtworkRef {
    pub channel_id: String,
    pub post_id: i32,
    pub path: PathBuf,
    pub kind: ArtworkKind,
    pub dwell_ms: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ChannelStats {
    pub id: String,
    pub display_name: String,
    pub total: usize,
    pub cached: usize,
    pub weight: u32,
}

#[derive(Clone, Debug, Default)]
pub struct PlaysetStats {
    pub channels: Vec<ChannelStats>,
    pub total_known: usize,
    pub total_available: usize,
    pub epoch_id: u64,
}

// ---- collaborator-facing message kinds ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    None,
    Loading,
    Downloading,
    Error,
}

/// Opaque events published on the external bus. Consumers re-enter the
/// scheduler through their own paths (e.g. the renderer calls `next` on
/// `PlayNext`), never from inside our locks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedEvent {
    PlayNext,
    ChannelChanged(String),
    PlayFile(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_embedded_identifiers() {
        assert_eq!(ChannelId::user("k3-xq!").as_str(), "by_user_k3_xq_");
        assert_eq!(ChannelId::hashtag("pixel art").as_str(), "hashtag_pixel_art");
        assert_eq!(ChannelId::named("all").as_str(), "all");
        assert!(ChannelId::named("all").is_makapix());
        assert!(!ChannelId::sdcard().is_makapix());
    }

    #[test]
    fn catalog_entry_roundtrip() {
        let e = CatalogEntry {
            post_id: 4711,
            storage_key: Uuid::new_v4(),
            kind: ArtworkKind::Animation,
            flags: 0x03,
            dwell_ms: 12_000,
            created_at: 1_700_000_123,
        };
        let mut buf = [0u8; CATALOG_ENTRY_LEN];
        e.encode_into(&mut buf);
        assert_eq!(CatalogEntry::decode_from(&buf).unwrap(), e);
        // LE spot checks against the fixed offsets
        assert_eq!(&buf[0..4], &4711i32.to_le_bytes());
        assert_eq!(buf[20], 1);
    }

    #[test]
    fn sd_entry_roundtrip_and_name_cap() {
        let e = SdEntry { post_id: 7, extension: MediaExt::Gif, name: "spiral.gif".into() };
        let mut buf = [0u8; SD_ENTRY_LEN];
        e.encode_into(&mut buf).unwrap();
        assert_eq!(SdEntry::decode_from(&buf).unwrap(), e);

        let long = SdEntry { post_id: 1, extension: MediaExt::Png, name: "x".repeat(SD_NAME_MAX + 1) };
        assert!(matches!(long.encode_into(&mut buf), Err(SchedError::InvalidArg)));
    }

    #[test]
    fn extension_from_url_suffix() {
        assert_eq!(MediaExt::from_url("https://x/y/a.gif"), MediaExt::Gif);
        assert_eq!(MediaExt::from_url("https://x/y/a.JPEG?w=1"), MediaExt::Jpg);
        assert_eq!(MediaExt::from_url("https://x/y/a.png#f"), MediaExt::Png);
        assert_eq!(MediaExt::from_url("https://x/y/a.bin"), MediaExt::Webp);
    }
}
