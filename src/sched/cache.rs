//! Per-channel metadata cache: the channel index (all artworks known
//! for the channel) plus the locally-available index (the subset whose
//! payload is present in the vault), persisted together in one
//! checksummed binary file per channel.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::sched::types::{
    CatalogEntry, ChannelId, ChannelKind, MediaExt, SchedError, SchedResult, SdEntry,
    CACHE_FLAG_SDCARD, CACHE_HEADER_LEN, CACHE_MAGIC, CACHE_VERSION, CATALOG_ENTRY_LEN,
    CI_MAX_ENTRIES, SD_ENTRY_LEN, SD_NAME_MAX,
};
use crate::sched::utils::write_atomic;
use crate::sched::vault;

// Header field offsets (44 bytes total, little-endian).
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_CI_COUNT: usize = 8;
const OFF_LAI_COUNT: usize = 12;
const OFF_CI_OFFSET: usize = 16;
const OFF_LAI_OFFSET: usize = 20;
const OFF_CHECKSUM: usize = 24;
const OFF_CHANNEL_ID: usize = 28;

#[derive(Clone, Debug)]
pub enum CacheEntries {
    Remote(Vec<CatalogEntry>),
    Sdcard(Vec<SdEntry>),
}

impl CacheEntries {
    fn len(&self) -> usize {
        match self {
            Self::Remote(v) => v.len(),
            Self::Sdcard(v) => v.len(),
        }
    }
}

struct CacheState {
    entries: CacheEntries,
    lai: Vec<i32>,
    lai_set: HashSet<i32>,
    by_post: HashMap<i32, usize>,
    by_key: HashMap<Uuid, usize>,
    dirty: bool,
    // Bumped on every mutation; `save` clears `dirty` only when nothing
    // changed while the file write was in flight.
    mutations: u64,
}

impl CacheState {
    fn empty(kind: ChannelKind) -> Self {
        let entries = match kind {
            ChannelKind::Sdcard => CacheEntries::Sdcard(Vec::new()),
            _ => CacheEntries::Remote(Vec::new()),
        };
        Self {
            entries,
            lai: Vec::new(),
            lai_set: HashSet::new(),
            by_post: HashMap::new(),
            by_key: HashMap::new(),
            dirty: false,
            mutations: 0,
        }
    }

    /// Scratch lookup tables are derived state: thrown away and rebuilt
    /// after every load and every merge, never persisted.
    fn rebuild_indices(&mut self) {
        self.by_post.clear();
        self.by_key.clear();
        match &self.entries {
            CacheEntries::Remote(v) => {
                for (i, e) in v.iter().enumerate() {
                    self.by_post.insert(e.post_id, i);
                    self.by_key.insert(e.storage_key, i);
                }
            }
            CacheEntries::Sdcard(v) => {
                for (i, e) in v.iter().enumerate() {
                    self.by_post.insert(e.post_id, i);
                }
            }
        }
        self.lai_set = self.lai.iter().copied().collect();
    }
}

/// One channel's Ci + LAi with O(1) in-memory indices. Thread-safe;
/// lock order is always scheduler mutex first, cache mutex second.
pub struct ChannelCache {
    id: ChannelId,
    state: Mutex<CacheState>,
    // Serializes concurrent savers so two flushes never race on the
    // same tmp file.
    save_lock: Mutex<()>,
}

impl ChannelCache {
    pub fn new_empty(id: ChannelId) -> Arc<Self> {
        let kind = id.kind();
        Arc::new(Self {
            id,
            state: Mutex::new(CacheState::empty(kind)),
            save_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.id.kind()
    }

    pub fn file_path(channels_dir: &Path, id: &ChannelId) -> PathBuf {
        channels_dir.join(format!("{}.bin", id.file_stem()))
    }

    /// Load a channel's cache from disk. Absent, truncated, corrupt or
    /// version-mismatched files all yield an empty cache; a log line is
    /// the only signal. A legacy raw-Ci file (positive multiple of 64
    /// bytes, no v20 header) is migrated: its LAi is rebuilt from the
    /// vault and the cache comes back dirty so the next save rewrites
    /// it in the current format. This is the only LAi rebuild site.
    pub fn load(id: ChannelId, channels_dir: &Path, vault_dir: &Path) -> Arc<Self> {
        let cache = Self::new_empty(id);
        cache.load_into(channels_dir, vault_dir);
        cache
    }

    /// Re-read this cache's file, replacing the in-memory state.
    pub fn reload(&self, channels_dir: &Path, vault_dir: &Path) {
        self.load_into(channels_dir, vault_dir);
    }

    fn load_into(&self, channels_dir: &Path, vault_dir: &Path) {
        let path = Self::file_path(channels_dir, &self.id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.state.lock().unwrap() = CacheState::empty(self.kind());
                return;
            }
            Err(e) => {
                warn!("read {} failed: {e}", path.display());
                *self.state.lock().unwrap() = CacheState::empty(self.kind());
                return;
            }
        };

        let fresh = match self.parse_file(&bytes, vault_dir) {
            Ok(st) => st,
            Err(e) => {
                // File left in place for post-mortem.
                warn!("cache {} unusable ({e}); starting empty", path.display());
                CacheState::empty(self.kind())
            }
        };
        *self.state.lock().unwrap() = fresh;
    }

    fn parse_file(&self, bytes: &[u8], vault_dir: &Path) -> SchedResult<CacheState> {
        if bytes.len() >= CACHE_HEADER_LEN
            && read_u32(bytes, OFF_MAGIC) == CACHE_MAGIC
        {
            return self.parse_v20(bytes);
        }
        // Legacy format: a bare array of 64-byte catalog entries.
        if self.kind() != ChannelKind::Sdcard
            && !bytes.is_empty()
            && bytes.len() % CATALOG_ENTRY_LEN == 0
        {
            return self.parse_legacy(bytes, vault_dir);
        }
        Err(SchedError::InvalidSize)
    }

    fn parse_v20(&self, bytes: &[u8]) -> SchedResult<CacheState> {
        let version = read_u16(bytes, OFF_VERSION);
        if version != CACHE_VERSION {
            return Err(SchedError::InvalidVersion);
        }
        let flags = read_u16(bytes, OFF_FLAGS);
        let sdcard = flags & CACHE_FLAG_SDCARD != 0;
        if sdcard != (self.kind() == ChannelKind::Sdcard) {
            return Err(SchedError::InvalidArg);
        }
        let entry_len = if sdcard { SD_ENTRY_LEN } else { CATALOG_ENTRY_LEN };

        let ci_count = read_u32(bytes, OFF_CI_COUNT) as usize;
        let lai_count = read_u32(bytes, OFF_LAI_COUNT) as usize;
        let ci_offset = read_u32(bytes, OFF_CI_OFFSET) as usize;
        let lai_offset = read_u32(bytes, OFF_LAI_OFFSET) as usize;
        if ci_count > CI_MAX_ENTRIES
            || ci_offset != CACHE_HEADER_LEN
            || lai_offset != ci_offset + ci_count * entry_len
            || bytes.len() != lai_offset + lai_count * 4
        {
            return Err(SchedError::InvalidSize);
        }

        let stored = read_u32(bytes, OFF_CHECKSUM);
        if checksum_with_field_zeroed(bytes) != stored {
            return Err(SchedError::InvalidCrc);
        }

        let mut state = CacheState::empty(self.kind());
        match &mut state.entries {
            CacheEntries::Sdcard(v) => {
                for i in 0..ci_count {
                    let off = ci_offset + i * entry_len;
                    v.push(SdEntry::decode_from(&bytes[off..off + entry_len])?);
                }
            }
            CacheEntries::Remote(v) => {
                for i in 0..ci_count {
                    let off = ci_offset + i * entry_len;
                    let e = CatalogEntry::decode_from(&bytes[off..off + entry_len])?;
                    if v.iter().any(|x| x.post_id == e.post_id || x.storage_key == e.storage_key) {
                        warn!("{}: duplicate entry post_id={} skipped", self.id, e.post_id);
                        continue;
                    }
                    v.push(e);
                }
            }
        }
        state.rebuild_indices();

        for i in 0..lai_count {
            let off = lai_offset + i * 4;
            let pid = i32::from_le_bytes(
                bytes[off..off + 4].try_into().map_err(|_| SchedError::InvalidSize)?,
            );
            if !state.by_post.contains_key(&pid) {
                warn!("{}: LAi post_id={pid} has no Ci entry; dropped", self.id);
                continue;
            }
            if state.lai_set.insert(pid) {
                state.lai.push(pid);
            }
        }
        Ok(state)
    }

    fn parse_legacy(&self, bytes: &[u8], vault_dir: &Path) -> SchedResult<CacheState> {
        let count = bytes.len() / CATALOG_ENTRY_LEN;
        if count > CI_MAX_ENTRIES {
            return Err(SchedError::InvalidSize);
        }
        let mut state = CacheState::empty(self.kind());
        if let CacheEntries::Remote(v) = &mut state.entries {
            for i in 0..count {
                let off = i * CATALOG_ENTRY_LEN;
                let e = CatalogEntry::decode_from(&bytes[off..off + CATALOG_ENTRY_LEN])?;
                if v.iter().any(|x| x.post_id == e.post_id || x.storage_key == e.storage_key) {
                    continue;
                }
                v.push(e);
            }
        }
        state.rebuild_indices();
        rebuild_lai_locked(&mut state, vault_dir);
        state.dirty = true;
        state.mutations += 1;
        info!(
            "{}: migrated legacy cache ({} entries, {} locally available)",
            self.id,
            state.entries.len(),
            state.lai.len()
        );
        Ok(state)
    }

    /// Persist atomically: assemble the full file, patch in the CRC,
    /// write `<id>.bin.tmp`, fsync, rename. The dirty flag clears only
    /// if no mutation landed while the write was in flight, so entries
    /// added during a save are never lost.
    pub fn save(&self, channels_dir: &Path) -> SchedResult<()> {
        let _writer = self.save_lock.lock().unwrap();
        let (bytes, generation) = {
            let st = self.state.lock().unwrap();
            (self.serialize(&st)?, st.mutations)
        };
        let path = Self::file_path(channels_dir, &self.id);
        write_atomic(&path, &bytes)?;
        let mut st = self.state.lock().unwrap();
        if st.mutations == generation {
            st.dirty = false;
        }
        debug!("saved {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    fn serialize(&self, st: &CacheState) -> SchedResult<Vec<u8>> {
        let (entry_len, sdcard) = match &st.entries {
            CacheEntries::Remote(_) => (CATALOG_ENTRY_LEN, false),
            CacheEntries::Sdcard(_) => (SD_ENTRY_LEN, true),
        };
        let ci_count = st.entries.len();
        let ci_offset = CACHE_HEADER_LEN;
        let lai_offset = ci_offset + ci_count * entry_len;
        let total = lai_offset + st.lai.len() * 4;
        let mut out = vec![0u8; total];

        out[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&CACHE_MAGIC.to_le_bytes());
        out[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&CACHE_VERSION.to_le_bytes());
        let flags: u16 = if sdcard { CACHE_FLAG_SDCARD } else { 0 };
        out[OFF_FLAGS..OFF_FLAGS + 2].copy_from_slice(&flags.to_le_bytes());
        out[OFF_CI_COUNT..OFF_CI_COUNT + 4].copy_from_slice(&(ci_count as u32).to_le_bytes());
        out[OFF_LAI_COUNT..OFF_LAI_COUNT + 4]
            .copy_from_slice(&(st.lai.len() as u32).to_le_bytes());
        out[OFF_CI_OFFSET..OFF_CI_OFFSET + 4].copy_from_slice(&(ci_offset as u32).to_le_bytes());
        out[OFF_LAI_OFFSET..OFF_LAI_OFFSET + 4]
            .copy_from_slice(&(lai_offset as u32).to_le_bytes());
        let id_bytes = self.id.as_str().as_bytes();
        let n = id_bytes.len().min(16);
        out[OFF_CHANNEL_ID..OFF_CHANNEL_ID + n].copy_from_slice(&id_bytes[..n]);

        match &st.entries {
            CacheEntries::Remote(v) => {
                for (i, e) in v.iter().enumerate() {
                    let off = ci_offset + i * entry_len;
                    e.encode_into(&mut out[off..off + entry_len]);
                }
            }
            CacheEntries::Sdcard(v) => {
                for (i, e) in v.iter().enumerate() {
                    let off = ci_offset + i * entry_len;
                    e.encode_into(&mut out[off..off + entry_len])?;
                }
            }
        }
        for (i, pid) in st.lai.iter().enumerate() {
            let off = lai_offset + i * 4;
            out[off..off + 4].copy_from_slice(&pid.to_le_bytes());
        }

        let crc = crc32fast::hash(&out);
        out[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    // ---- LAi mutation ----

    /// Mark `post_id` locally available. `InvalidArg` when no Ci entry
    /// carries that id; `Ok(false)` when it is already present.
    pub fn lai_add(&self, post_id: i32) -> SchedResult<bool> {
        let mut st = self.state.lock().unwrap();
        if matches!(st.entries, CacheEntries::Sdcard(_)) {
            return Err(SchedError::NotSupported);
        }
        if !st.by_post.contains_key(&post_id) {
            return Err(SchedError::InvalidArg);
        }
        if !st.lai_set.insert(post_id) {
            return Ok(false);
        }
        st.lai.push(post_id);
        st.dirty = true;
        st.mutations += 1;
        Ok(true)
    }

    /// O(1) removal: swap-and-pop on the array plus set erase.
    /// `Ok(false)` when the id was not present.
    pub fn lai_remove(&self, post_id: i32) -> SchedResult<bool> {
        let mut st = self.state.lock().unwrap();
        if matches!(st.entries, CacheEntries::Sdcard(_)) {
            return Err(SchedError::NotSupported);
        }
        if !st.lai_set.remove(&post_id) {
            return Ok(false);
        }
        if let Some(pos) = st.lai.iter().position(|&p| p == post_id) {
            st.lai.swap_remove(pos);
        }
        st.dirty = true;
        st.mutations += 1;
        Ok(true)
    }

    pub fn lai_contains(&self, post_id: i32) -> bool {
        self.state.lock().unwrap().lai_set.contains(&post_id)
    }

    pub fn lai_len(&self) -> usize {
        self.state.lock().unwrap().lai.len()
    }

    pub fn lai_at(&self, index: usize) -> Option<i32> {
        self.state.lock().unwrap().lai.get(index).copied()
    }

    // ---- Ci access ----

    pub fn ci_len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn ci_find_by_post_id(&self, post_id: i32) -> Option<usize> {
        self.state.lock().unwrap().by_post.get(&post_id).copied()
    }

    pub fn ci_find_by_storage_key(&self, key: &Uuid) -> Option<usize> {
        self.state.lock().unwrap().by_key.get(key).copied()
    }

    pub fn entry_at(&self, index: usize) -> Option<CatalogEntry> {
        let st = self.state.lock().unwrap();
        match &st.entries {
            CacheEntries::Remote(v) => v.get(index).copied(),
            CacheEntries::Sdcard(_) => None,
        }
    }

    pub fn sd_entry_at(&self, index: usize) -> Option<SdEntry> {
        let st = self.state.lock().unwrap();
        match &st.entries {
            CacheEntries::Sdcard(v) => v.get(index).cloned(),
            CacheEntries::Remote(_) => None,
        }
    }

    /// Advance `cursor` to the next Ci entry whose payload is not yet
    /// local. The downloader walks its needs-download list with this.
    pub fn next_missing(&self, cursor: &mut usize) -> Option<CatalogEntry> {
        let st = self.state.lock().unwrap();
        if let CacheEntries::Remote(v) = &st.entries {
            while *cursor < v.len() {
                let e = v[*cursor];
                *cursor += 1;
                if !st.lai_set.contains(&e.post_id) {
                    return Some(e);
                }
            }
        }
        None
    }

    /// Append a refresh batch. Ci is append-only within a cache
    /// generation: existing entries never move, duplicates are skipped,
    /// and entries beyond the cap are rejected with a warning so LAi
    /// references stay valid. Returns the number appended.
    pub fn merge_entries(&self, batch: &[CatalogEntry]) -> usize {
        let mut st = self.state.lock().unwrap();
        let CacheEntries::Remote(v) = &mut st.entries else {
            return 0;
        };
        let mut appended = 0usize;
        let mut rejected = 0usize;
        for e in batch {
            if v.iter().any(|x| x.post_id == e.post_id || x.storage_key == e.storage_key) {
                continue;
            }
            if v.len() >= CI_MAX_ENTRIES {
                rejected += 1;
                continue;
            }
            v.push(*e);
            appended += 1;
        }
        if rejected > 0 {
            warn!("{}: channel index full, {rejected} entries rejected", self.id);
        }
        if appended > 0 {
            st.dirty = true;
            st.mutations += 1;
        }
        st.rebuild_indices();
        appended
    }

    /// Replace the storage-card entry list after an index rebuild.
    /// Entries whose name cannot fit the on-disk field are dropped so
    /// the cache never holds something it cannot persist.
    pub fn set_sd_entries(&self, entries: Vec<SdEntry>) {
        let mut st = self.state.lock().unwrap();
        if matches!(st.entries, CacheEntries::Sdcard(_)) {
            let mut kept = Vec::with_capacity(entries.len());
            for e in entries {
                if e.name.len() > SD_NAME_MAX {
                    warn!("{}: animation name too long, dropped: {}", self.id, e.name);
                    continue;
                }
                kept.push(e);
            }
            st.entries = CacheEntries::Sdcard(kept);
            st.lai.clear();
            st.mutations += 1;
            st.rebuild_indices();
        }
    }

    /// O(n) vault scan rebuilding LAi from what is actually on disk.
    /// Only the legacy-migration path calls this.
    pub fn rebuild_lai(&self, vault_dir: &Path) -> usize {
        let mut st = self.state.lock().unwrap();
        rebuild_lai_locked(&mut st, vault_dir);
        st.mutations += 1;
        st.lai.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    pub fn mark_dirty(&self) {
        let mut st = self.state.lock().unwrap();
        st.dirty = true;
        st.mutations += 1;
    }
}

fn rebuild_lai_locked(st: &mut CacheState, vault_dir: &Path) {
    st.lai.clear();
    st.lai_set.clear();
    if let CacheEntries::Remote(v) = &st.entries {
        for e in v {
            if vault::find_existing(vault_dir, &e.storage_key).is_some() {
                st.lai.push(e.post_id);
                st.lai_set.insert(e.post_id);
            }
        }
    }
}

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn checksum_with_field_zeroed(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..OFF_CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&bytes[OFF_CHECKSUM + 4..]);
    hasher.finalize()
}

/// Scan the animations directory and write a fresh storage-card index
/// to `<channels_dir>/sdcard.bin`. Names are sorted so post ids are
/// stable across rebuilds. Returns the entry count.
pub fn build_sdcard_index(animations_dir: &Path, channels_dir: &Path) -> SchedResult<usize> {
    let mut names: Vec<(String, MediaExt)> = Vec::new();
    for entry in WalkDir::new(animations_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(ext) = name.rsplit('.').next().map(str::to_ascii_lowercase) else {
            continue;
        };
        let ext = match ext.as_str() {
            "gif" => MediaExt::Gif,
            "png" => MediaExt::Png,
            "jpg" | "jpeg" => MediaExt::Jpg,
            "webp" => MediaExt::Webp,
            _ => continue,
        };
        if name.len() > SD_NAME_MAX {
            warn!("animation name too long, skipped: {name}");
            continue;
        }
        names.push((name.to_string(), ext));
    }
    names.sort_by(|a, b| a.0.cmp(&b.0));
    if names.len() > CI_MAX_ENTRIES {
        warn!("animations dir holds {} files; indexing the first {CI_MAX_ENTRIES}", names.len());
        names.truncate(CI_MAX_ENTRIES);
    }

    let entries: Vec<SdEntry> = names
        .into_iter()
        .enumerate()
        .map(|(i, (name, extension))| SdEntry { post_id: i as i32 + 1, extension, name })
        .collect();

    let cache = ChannelCache::new_empty(ChannelId::sdcard());
    cache.set_sd_entries(entries);
    let count = cache.ci_len();
    cache.save(channels_dir)?;
    Ok(count)
}
