// src/sched/mod.rs — playset execution, weighted pick, cache lifecycle

// ---- Standard lib imports ----
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ---- Crates ----
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---- Local modules ----
pub mod cache;
pub mod collab;
pub mod picker;
pub mod playset;
pub mod refresh;
pub mod saver;
pub mod show_url;
pub mod types;
pub(crate) mod utils;
pub mod vault;

use crate::config::Paths;
pub use crate::sched::cache::ChannelCache;
use crate::sched::collab::Collaborators;
use crate::sched::picker::Xorshift64;
use crate::sched::playset::PlaysetStore;
use crate::sched::saver::SaveScheduler;
pub use crate::sched::types::{
    ArtworkKind, ArtworkRef, ChannelId, ChannelKind, ChannelSpec, ChannelStats, ExposureMode,
    MediaExt, MessageKind, PickMode, PlaysetCmd, PlaysetStats, SchedError, SchedEvent,
    SchedResult,
};
use crate::sched::types::{DEFAULT_DWELL_MS, MAX_CHANNELS, PICK_HISTORY_LEN, RECENCY_WINDOW};

pub const REFRESH_PERIOD: Duration = Duration::from_secs(3600);

/// Everything the scheduler needs to know about its host environment.
#[derive(Clone)]
pub struct SchedConfig {
    pub paths: Paths,
    pub save_debounce: Duration,
    pub refresh_period: Duration,
}

impl SchedConfig {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            save_debounce: saver::DEFAULT_DEBOUNCE,
            refresh_period: REFRESH_PERIOD,
        }
    }
}

/// One-shot artwork request riding on a transient `artwork` channel.
#[derive(Clone, Debug)]
pub(crate) struct ArtworkRequest {
    pub post_id: i32,
    pub storage_key: Uuid,
    pub url: String,
}

/// Live state of one channel in the active playset. The cache is the
/// sole owner of entry data; everything here is derived or pick state.
pub(crate) struct ChannelState {
    pub spec: ChannelSpec,
    pub id: ChannelId,
    pub cache: Arc<ChannelCache>,
    pub cache_loaded: bool,
    pub weight: u32,
    pub credit: i64,
    pub cursor: usize,
    pub rng: Xorshift64,
    pub recent: VecDeque<usize>,
    pub refresh_pending: bool,
    pub refresh_in_progress: bool,
    pub refresh_async_pending: bool,
    pub art: Option<ArtworkRequest>,
}

impl ChannelState {
    /// How many artworks this channel can play right now.
    pub fn available(&self) -> usize {
        if !self.cache_loaded {
            return 0;
        }
        match self.id.kind() {
            ChannelKind::Sdcard => self.cache.ci_len(),
            _ => self.cache.lai_len(),
        }
    }
}

pub(crate) struct SchedState {
    pub channels: Vec<ChannelState>,
    pub exposure: ExposureMode,
    pub pick: PickMode,
    pub epoch_id: u64,
    pub history: VecDeque<ArtworkRef>,
    pub current_channel: Option<usize>,
    pub cycle_done_at: Option<Instant>,
}

/// The play scheduler. One instance per device; tests build as many as
/// they like. All playset mutations serialize on the internal mutex,
/// which is never held across blocking I/O or collaborator callbacks.
pub struct PlayScheduler {
    cfg: SchedConfig,
    collab: Collaborators,
    state: Mutex<SchedState>,
    saver: SaveScheduler,
    playsets: PlaysetStore,
    refresh: Mutex<Option<refresh::RefreshHandle>>,
    pub(crate) show_slot: Mutex<Option<show_url::ShowUrlJob>>,
    storage_locked: AtomicBool,
    shutting_down: AtomicBool,
}

impl PlayScheduler {
    pub fn new(cfg: SchedConfig, collab: Collaborators) -> Arc<Self> {
        let saver = SaveScheduler::new(cfg.paths.channels_dir.clone(), cfg.save_debounce);
        let playsets = PlaysetStore::new(&cfg.paths.channels_dir);
        Arc::new(Self {
            cfg,
            collab,
            state: Mutex::new(SchedState {
                channels: Vec::new(),
                exposure: ExposureMode::Equal,
                pick: PickMode::Recency,
                epoch_id: 0,
                history: VecDeque::new(),
                current_channel: None,
                cycle_done_at: None,
            }),
            saver,
            playsets,
            refresh: Mutex::new(None),
            show_slot: Mutex::new(None),
            storage_locked: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Spawn the background refresh worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.refresh.lock().unwrap();
        if slot.is_none() {
            *slot = Some(refresh::spawn(Arc::downgrade(self), self.cfg.refresh_period));
        }
    }

    /// Stop background work and flush every dirty cache. The instance
    /// is unusable afterwards.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.collab.catalog.cancel_all_refreshes();
        if let Some(handle) = self.refresh.lock().unwrap().take() {
            handle.stop();
        }
        if let Some(job) = self.show_slot.lock().unwrap().take() {
            job.cancel_and_join(Duration::from_secs(5));
        }
        self.saver.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ---- accessors used across the impl files ----

    pub(crate) fn channels_dir(&self) -> &Path {
        &self.cfg.paths.channels_dir
    }
    pub(crate) fn vault_dir(&self) -> &Path {
        &self.cfg.paths.vault_dir
    }
    pub(crate) fn animations_dir(&self) -> &Path {
        &self.cfg.paths.animations_dir
    }
    pub(crate) fn downloads_dir(&self) -> &Path {
        &self.cfg.paths.downloads_dir
    }
    pub(crate) fn collab(&self) -> &Collaborators {
        &self.collab
    }
    pub(crate) fn saver(&self) -> &SaveScheduler {
        &self.saver
    }
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap()
    }

    pub fn playsets(&self) -> &PlaysetStore {
        &self.playsets
    }

    pub fn set_storage_locked(&self, locked: bool) {
        self.storage_locked.store(locked, Ordering::SeqCst);
    }

    pub fn is_storage_locked(&self) -> bool {
        self.storage_locked.load(Ordering::SeqCst)
    }

    // ---- playset execution ----

    pub fn execute_playset(&self, cmd: &PlaysetCmd) -> SchedResult<()> {
        self.execute_with_art(cmd, None)
    }

    pub fn execute_named_playset(&self, name: &str) -> SchedResult<()> {
        let cmd = self.playsets.load(name)?;
        self.execute_playset(&cmd)
    }

    pub fn play_named_channel(&self, name: &str) -> SchedResult<()> {
        self.execute_playset(&self.single_channel_cmd(ChannelSpec::named(name)))
    }

    pub fn play_user_channel(&self, sqid: &str) -> SchedResult<()> {
        let spec = ChannelSpec {
            kind: ChannelKind::User,
            name: String::new(),
            identifier: sqid.into(),
            display_name: format!("by @{sqid}"),
            weight: 1,
        };
        self.execute_playset(&self.single_channel_cmd(spec))
    }

    pub fn play_hashtag_channel(&self, tag: &str) -> SchedResult<()> {
        let spec = ChannelSpec {
            kind: ChannelKind::Hashtag,
            name: String::new(),
            identifier: tag.into(),
            display_name: format!("#{tag}"),
            weight: 1,
        };
        self.execute_playset(&self.single_channel_cmd(spec))
    }

    /// One-shot "show this artwork": a transient single-entry channel
    /// that bypasses the picker. The refresh task downloads the payload
    /// if it is not already in the vault.
    pub fn play_artwork(&self, post_id: i32, storage_key: Uuid, art_url: &str) -> SchedResult<()> {
        let spec = ChannelSpec {
            kind: ChannelKind::Artwork,
            name: "artwork".into(),
            identifier: String::new(),
            display_name: "Artwork".into(),
            weight: 1,
        };
        let cmd = PlaysetCmd {
            channels: vec![spec],
            exposure: ExposureMode::Equal,
            pick: PickMode::Recency,
        };
        self.execute_with_art(
            &cmd,
            Some(ArtworkRequest { post_id, storage_key, url: art_url.to_string() }),
        )
    }

    /// Immediate playback of a file already on the storage card,
    /// outside any channel. Used by the show-url pipeline.
    pub fn play_local_file(&self, path: &Path) -> SchedResult<()> {
        if !path.exists() {
            return Err(SchedError::NotFound);
        }
        let kind = match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "gif" || ext == "webp" => ArtworkKind::Animation,
            _ => ArtworkKind::Still,
        };
        let art = ArtworkRef {
            channel_id: ChannelId::sdcard().to_string(),
            post_id: 0,
            path: path.to_path_buf(),
            kind,
            dwell_ms: DEFAULT_DWELL_MS,
        };
        {
            let mut st = self.lock_state();
            push_history(&mut st.history, art.clone());
        }
        self.collab.tracker.signal_swap(0, path);
        self.collab.bus.publish(SchedEvent::PlayFile(path.to_path_buf()));
        Ok(())
    }

    fn single_channel_cmd(&self, spec: ChannelSpec) -> PlaysetCmd {
        PlaysetCmd {
            channels: vec![spec],
            exposure: ExposureMode::Equal,
            pick: self.cfg.paths.play_order,
        }
    }

    pub(crate) fn execute_with_art(
        &self,
        cmd: &PlaysetCmd,
        art: Option<ArtworkRequest>,
    ) -> SchedResult<()> {
        if self.is_shutting_down() {
            return Err(SchedError::InvalidState);
        }
        if cmd.channels.is_empty() || cmd.channels.len() > MAX_CHANNELS {
            return Err(SchedError::InvalidArg);
        }

        // Cancel in-flight remote refreshes before touching our state so
        // a completion callback cannot race us for the mutex.
        self.collab.catalog.cancel_all_refreshes();
        self.collab.tracker.stop();

        // Cache loads are file I/O; do them before taking the mutex.
        let mut fresh: Vec<ChannelState> = Vec::with_capacity(cmd.channels.len());
        for spec in &cmd.channels {
            let id = ChannelId::from_spec(spec);
            let cache = match id.kind() {
                ChannelKind::Artwork => {
                    let request = art.clone().ok_or(SchedError::InvalidArg)?;
                    build_artwork_cache(&id, &request, self.vault_dir())
                }
                _ => ChannelCache::load(id.clone(), self.channels_dir(), self.vault_dir()),
            };
            fresh.push(ChannelState {
                spec: spec.clone(),
                id,
                cache,
                cache_loaded: true,
                weight: 0,
                credit: 0,
                cursor: 0,
                rng: Xorshift64::new(0),
                recent: VecDeque::new(),
                refresh_pending: true,
                refresh_in_progress: false,
                refresh_async_pending: false,
                art: if spec.kind == ChannelKind::Artwork { art.clone() } else { None },
            });
        }

        let new_caches: Vec<Arc<ChannelCache>> =
            fresh.iter().map(|c| Arc::clone(&c.cache)).collect();
        let persistent: Vec<bool> =
            fresh.iter().map(|c| c.id.kind() != ChannelKind::Artwork).collect();
        let ids: Vec<String> = fresh.iter().map(|c| c.id.to_string()).collect();
        let first_display = cmd.channels[0].display_name.clone();

        let (old_caches, total) = {
            let mut st = self.lock_state();
            let old: Vec<Arc<ChannelCache>> =
                st.channels.iter().map(|c| Arc::clone(&c.cache)).collect();
            st.channels = fresh;
            st.exposure = cmd.exposure;
            st.pick = cmd.pick;
            st.epoch_id += 1;
            let epoch = st.epoch_id;
            let seed = self.cfg.paths.global_seed;
            for (i, ch) in st.channels.iter_mut().enumerate() {
                ch.rng = Xorshift64::new(seed ^ i as u64 ^ epoch);
            }
            recompute_weights(&mut st);
            st.history.clear();
            st.current_channel = None;
            st.cycle_done_at = None;
            (old, total_available_locked(&st))
        };

        // Swap the save registry to the new generation; the old caches
        // must be unregistered before their channel states are dropped.
        for c in &old_caches {
            self.saver.unregister(c);
        }
        for (cache, keep) in new_caches.iter().zip(&persistent) {
            if *keep {
                self.saver.register(Arc::clone(cache));
            }
        }

        self.collab.downloader.set_channels(&ids);
        self.collab.downloader.reset_cursors();
        self.kick_refresh();
        self.collab.bus.publish(SchedEvent::ChannelChanged(ids[0].clone()));

        if total > 0 {
            self.collab.bus.publish(SchedEvent::PlayNext);
        } else if self.collab.catalog.is_ready() {
            self.collab.renderer.set_channel_message(&first_display, MessageKind::Loading, 0, "");
        }
        info!("playset executed: {} channel(s), {total} available", ids.len());
        Ok(())
    }

    // ---- pick ----

    /// Pick the next artwork: weighted round-robin over channels, then
    /// the channel's pick mode. Never blocks on I/O.
    pub fn next(&self) -> SchedResult<ArtworkRef> {
        let picked = {
            let mut st = self.lock_state();
            let attempts = 2 * st.channels.len();
            let mut picked = None;
            for _ in 0..attempts.max(1) {
                let weights: Vec<u32> = st.channels.iter().map(|c| c.weight).collect();
                let mut credits: Vec<i64> = st.channels.iter().map(|c| c.credit).collect();
                let Some(winner) = picker::swrr_pick(&mut credits, &weights) else {
                    break;
                };
                for (ch, credit) in st.channels.iter_mut().zip(&credits) {
                    ch.credit = *credit;
                }
                if let Some(art) = select_entry(&mut st, winner, self.vault_dir(), self.animations_dir()) {
                    st.current_channel = Some(winner);
                    push_history(&mut st.history, art.clone());
                    picked = Some(art);
                    break;
                }
                // The winner had nothing to play (race with a removal):
                // drop it to the back of the queue and retry.
                let mut credits: Vec<i64> = st.channels.iter().map(|c| c.credit).collect();
                picker::swrr_penalize(&mut credits, &weights, winner);
                for (ch, credit) in st.channels.iter_mut().zip(&credits) {
                    ch.credit = *credit;
                }
                recompute_weights(&mut st);
            }
            picked
        };

        match picked {
            Some(art) => {
                self.collab.tracker.signal_swap(art.post_id, &art.path);
                Ok(art)
            }
            None => {
                let name = self.current_channel_name().unwrap_or_default();
                if self.collab.catalog.is_ready() {
                    self.collab.renderer.set_channel_message(
                        &name,
                        MessageKind::Downloading,
                        0,
                        "waiting for artwork",
                    );
                } else {
                    self.collab.renderer.set_channel_message(&name, MessageKind::None, 0, "");
                }
                Err(SchedError::NotFound)
            }
        }
    }

    /// Step back through the global pick history. The tail is what is
    /// on screen now; `back` discards it and replays the one before.
    pub fn back(&self) -> SchedResult<ArtworkRef> {
        let prior = {
            let mut st = self.lock_state();
            if st.history.len() < 2 {
                return Err(SchedError::NotFound);
            }
            st.history.pop_back();
            st.history.back().cloned().ok_or(SchedError::NotFound)?
        };
        self.collab.tracker.signal_swap(prior.post_id, &prior.path);
        Ok(prior)
    }

    // ---- downloader / renderer callbacks ----

    /// A payload for `storage_key` just landed in the vault. If the
    /// entry is unknown the cache may have been rewritten by a parallel
    /// refresh, so reload once and retry before giving up.
    pub fn on_download_complete(&self, channel_id: &str, storage_key: &Uuid) {
        let mut st = self.lock_state();
        let Some(pos) = st.channels.iter().position(|c| c.id.as_str() == channel_id) else {
            debug!("download complete for inactive channel {channel_id}");
            return;
        };
        let cache = Arc::clone(&st.channels[pos].cache);
        let before = total_available_locked(&st);

        let mut index = cache.ci_find_by_storage_key(storage_key);
        if index.is_none() {
            drop(st);
            cache.reload(self.channels_dir(), self.vault_dir());
            st = self.lock_state();
            if !st.channels.iter().any(|c| Arc::ptr_eq(&c.cache, &cache)) {
                return; // playset changed under us
            }
            index = cache.ci_find_by_storage_key(storage_key);
        }
        let Some(index) = index else {
            warn!("{channel_id}: downloaded {storage_key} not in channel index");
            return;
        };
        let Some(entry) = cache.entry_at(index) else {
            return;
        };
        match cache.lai_add(entry.post_id) {
            Ok(true) => {
                self.saver.schedule_save();
                recompute_weights(&mut st);
                let after = total_available_locked(&st);
                drop(st);
                // Never call `next` from here: the consumer re-enters
                // through the event bus on its own stack.
                if before == 0 && after > 0 {
                    self.collab.bus.publish(SchedEvent::PlayNext);
                }
            }
            Ok(false) => {} // already available; duplicate signal
            Err(e) => warn!("{channel_id}: lai_add({}) failed: {e}", entry.post_id),
        }
    }

    /// The renderer could not decode an artwork: evict it everywhere
    /// (vault file, LAi) and move on.
    pub fn on_load_failed(&self, storage_key: &Uuid, channel_id: &str, reason: &str) {
        warn!("{channel_id}: load failed for {storage_key}: {reason}");
        vault::remove_payload(self.vault_dir(), storage_key);

        let (remaining, name) = {
            let mut st = self.lock_state();
            if let Some(pos) = st.channels.iter().position(|c| c.id.as_str() == channel_id) {
                let cache = Arc::clone(&st.channels[pos].cache);
                if let Some(index) = cache.ci_find_by_storage_key(storage_key) {
                    if let Some(entry) = cache.entry_at(index) {
                        match cache.lai_remove(entry.post_id) {
                            Ok(true) => self.saver.schedule_save(),
                            Ok(false) => {}
                            Err(e) => {
                                warn!("{channel_id}: lai_remove({}) failed: {e}", entry.post_id)
                            }
                        }
                    }
                }
                recompute_weights(&mut st);
            }
            let name = st
                .current_channel
                .and_then(|i| st.channels.get(i))
                .map(|c| c.spec.display_name.clone())
                .unwrap_or_default();
            (total_available_locked(&st), name)
        };

        if remaining > 0 {
            self.collab.bus.publish(SchedEvent::PlayNext);
        } else if self.collab.catalog.is_ready() {
            self.collab.renderer.set_channel_message(&name, MessageKind::Downloading, 0, "");
        } else {
            self.collab.renderer.set_channel_message(&name, MessageKind::None, 0, "");
        }
    }

    // ---- stats ----

    pub fn total_available(&self) -> usize {
        total_available_locked(&self.lock_state())
    }

    /// `(total known, locally available)` for one active channel.
    pub fn channel_stats(&self, channel_id: &str) -> Option<(usize, usize)> {
        let st = self.lock_state();
        st.channels
            .iter()
            .find(|c| c.id.as_str() == channel_id)
            .map(|c| (c.cache.ci_len(), c.available()))
    }

    pub fn get_stats(&self) -> PlaysetStats {
        let st = self.lock_state();
        let channels: Vec<ChannelStats> = st
            .channels
            .iter()
            .map(|c| ChannelStats {
                id: c.id.to_string(),
                display_name: c.spec.display_name.clone(),
                total: c.cache.ci_len(),
                cached: c.available(),
                weight: c.weight,
            })
            .collect();
        PlaysetStats {
            total_known: channels.iter().map(|c| c.total).sum(),
            total_available: channels.iter().map(|c| c.cached).sum(),
            epoch_id: st.epoch_id,
            channels,
        }
    }

    pub fn current_channel_id(&self) -> Option<String> {
        let st = self.lock_state();
        st.current_channel.and_then(|i| st.channels.get(i)).map(|c| c.id.to_string())
    }

    fn current_channel_name(&self) -> Option<String> {
        let st = self.lock_state();
        st.current_channel
            .and_then(|i| st.channels.get(i))
            .map(|c| c.spec.display_name.clone())
    }

    pub(crate) fn kick_refresh(&self) {
        if let Some(handle) = self.refresh.lock().unwrap().as_ref() {
            handle.kick();
        }
    }
}

pub fn is_makapix_channel(channel_id: &str) -> bool {
    channel_id != "sdcard"
}

// ---- free helpers shared with the sibling impl files ----

fn push_history(history: &mut VecDeque<ArtworkRef>, art: ArtworkRef) {
    while history.len() >= PICK_HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(art);
}

/// Weight every channel per the playset's exposure mode; inactive
/// channels always weigh zero so they are never picked.
pub(crate) fn recompute_weights(st: &mut SchedState) {
    let exposure = st.exposure;
    for ch in &mut st.channels {
        let available = ch.available();
        ch.weight = if available == 0 {
            0
        } else {
            match exposure {
                ExposureMode::Equal => 1,
                ExposureMode::Manual => u32::from(ch.spec.weight),
                ExposureMode::Proportional => available.max(1) as u32,
            }
        };
    }
}

pub(crate) fn total_available_locked(st: &SchedState) -> usize {
    st.channels.iter().map(ChannelState::available).sum()
}

/// Build the transient in-memory cache for a one-shot artwork channel.
/// Never registered with the saver, never persisted.
fn build_artwork_cache(
    id: &ChannelId,
    request: &ArtworkRequest,
    vault_dir: &Path,
) -> Arc<ChannelCache> {
    let kind = match MediaExt::from_url(&request.url) {
        MediaExt::Gif | MediaExt::Webp => ArtworkKind::Animation,
        _ => ArtworkKind::Still,
    };
    let cache = ChannelCache::new_empty(id.clone());
    cache.merge_entries(&[types::CatalogEntry {
        post_id: request.post_id,
        storage_key: request.storage_key,
        kind,
        flags: 0,
        dwell_ms: 0,
        created_at: 0,
    }]);
    if vault::find_existing(vault_dir, &request.storage_key).is_some() {
        let _ = cache.lai_add(request.post_id);
    }
    cache
}

/// Choose an entry inside the winning channel. Returns None when the
/// channel has nothing playable, which sends the picker back for
/// another round.
fn select_entry(
    st: &mut SchedState,
    winner: usize,
    vault_dir: &Path,
    animations_dir: &Path,
) -> Option<ArtworkRef> {
    let mode = st.pick;
    let ch = st.channels.get_mut(winner)?;
    match ch.id.kind() {
        ChannelKind::Sdcard => {
            let len = ch.cache.ci_len();
            let index = match mode {
                PickMode::Recency => picker::pick_recency(&mut ch.cursor, len)?,
                PickMode::Random => picker::pick_random(&mut ch.rng, len, &ch.recent)?,
            };
            let entry = ch.cache.sd_entry_at(index)?;
            picker::remember(&mut ch.recent, index, RECENCY_WINDOW);
            let kind = match entry.extension {
                MediaExt::Gif | MediaExt::Webp => ArtworkKind::Animation,
                _ => ArtworkKind::Still,
            };
            Some(ArtworkRef {
                channel_id: ch.id.to_string(),
                post_id: entry.post_id,
                path: animations_dir.join(&entry.name),
                kind,
                dwell_ms: DEFAULT_DWELL_MS,
            })
        }
        _ => {
            let len = ch.cache.lai_len();
            let index = match mode {
                PickMode::Recency => picker::pick_recency(&mut ch.cursor, len)?,
                PickMode::Random => picker::pick_random(&mut ch.rng, len, &ch.recent)?,
            };
            let post_id = ch.cache.lai_at(index)?;
            let ci_index = ch.cache.ci_find_by_post_id(post_id)?;
            let entry = ch.cache.entry_at(ci_index)?;
            let Some(path) = vault::find_existing(vault_dir, &entry.storage_key) else {
                // The payload vanished under us; evict and let the
                // picker try elsewhere.
                warn!("{}: payload missing for post {post_id}; evicting", ch.id);
                if let Err(e) = ch.cache.lai_remove(post_id) {
                    warn!("{}: evicting post {post_id} failed: {e}", ch.id);
                }
                return None;
            };
            picker::remember(&mut ch.recent, index, RECENCY_WINDOW);
            Some(ArtworkRef {
                channel_id: ch.id.to_string(),
                post_id,
                path,
                kind: entry.kind,
                dwell_ms: if entry.dwell_ms == 0 { DEFAULT_DWELL_MS } else { entry.dwell_ms },
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::fs;

    fn two_channel_cmd() -> PlaysetCmd {
        PlaysetCmd {
            channels: vec![ChannelSpec::named("all"), ChannelSpec::named("promoted")],
            exposure: ExposureMode::Equal,
            pick: PickMode::Recency,
        }
    }

    #[test]
    fn empty_playset_rejected_and_empty_channels_yield_nothing() {
        let env = env();
        let bad = PlaysetCmd {
            channels: vec![],
            exposure: ExposureMode::Equal,
            pick: PickMode::Recency,
        };
        assert!(matches!(env.sched.execute_playset(&bad), Err(SchedError::InvalidArg)));

        env.sched.execute_playset(&two_channel_cmd()).unwrap();
        assert!(matches!(env.sched.next(), Err(SchedError::NotFound)));
        assert_eq!(env.sched.total_available(), 0);
    }

    #[test]
    fn picks_come_from_loaded_caches() {
        let env = env();
        seed_remote_channel(&env, "all", 3, &[1, 2]);
        env.sched.play_named_channel("all").unwrap();

        assert_eq!(env.sched.total_available(), 2);
        let first = env.sched.next().unwrap();
        let second = env.sched.next().unwrap();
        assert_ne!(first.post_id, second.post_id);
        assert!(first.path.exists());
        assert_eq!(env.sched.current_channel_id().as_deref(), Some("all"));
        // PlayNext was announced because entries were present at exec.
        assert!(env.bus.take().contains(&SchedEvent::PlayNext));
    }

    #[test]
    fn weighted_round_robin_interleaves_channels() {
        let env = env();
        seed_remote_channel(&env, "all", 2, &[1, 2]);
        seed_remote_channel(&env, "promoted", 1, &[1]);
        env.sched.execute_playset(&two_channel_cmd()).unwrap();

        let mut counts = std::collections::HashMap::new();
        for _ in 0..6 {
            let art = env.sched.next().unwrap();
            *counts.entry(art.channel_id.clone()).or_insert(0usize) += 1;
        }
        assert_eq!(counts["all"], 3);
        assert_eq!(counts["promoted"], 3);
    }

    #[test]
    fn one_empty_channel_never_picked() {
        let env = env();
        seed_remote_channel(&env, "all", 2, &[1, 2]);
        seed_remote_channel(&env, "promoted", 2, &[]);
        env.sched.execute_playset(&two_channel_cmd()).unwrap();

        for _ in 0..8 {
            assert_eq!(env.sched.next().unwrap().channel_id, "all");
        }
    }

    #[test]
    fn recency_mode_visits_every_entry_before_repeat() {
        let env = env();
        seed_remote_channel(&env, "all", 4, &[1, 2, 3, 4]);
        env.sched.play_named_channel("all").unwrap();

        let first_round: Vec<i32> = (0..4).map(|_| env.sched.next().unwrap().post_id).collect();
        let mut sorted = first_round.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4]);
        let second_round: Vec<i32> = (0..4).map(|_| env.sched.next().unwrap().post_id).collect();
        assert_eq!(first_round, second_round);
    }

    #[test]
    fn back_replays_the_previous_pick() {
        let env = env();
        seed_remote_channel(&env, "all", 3, &[1, 2, 3]);
        env.sched.play_named_channel("all").unwrap();

        let a = env.sched.next().unwrap();
        let _b = env.sched.next().unwrap();
        let prior = env.sched.back().unwrap();
        assert_eq!(prior.post_id, a.post_id);
        // Only one artwork was ever shown: nothing further back.
        assert!(matches!(env.sched.back(), Err(SchedError::NotFound)));
    }

    #[test]
    fn download_complete_updates_lai_and_wakes_renderer() {
        let env = env();
        let keys = seed_remote_channel(&env, "all", 3, &[]);
        env.sched.play_named_channel("all").unwrap();
        assert_eq!(env.sched.total_available(), 0);
        env.bus.take();

        // Unknown key: one reload from disk, then logged and ignored.
        env.sched.on_download_complete("all", &Uuid::new_v4());
        assert_eq!(env.sched.total_available(), 0);

        // Payload arrives.
        let p = vault::vault_path(env.sched.vault_dir(), &keys[0], MediaExt::Webp);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, b"payload").unwrap();
        env.sched.on_download_complete("all", &keys[0]);

        assert_eq!(env.sched.total_available(), 1);
        assert_eq!(env.bus.take(), vec![SchedEvent::PlayNext]);

        // Duplicate completion is a no-op.
        env.sched.on_download_complete("all", &keys[0]);
        assert_eq!(env.sched.total_available(), 1);
        assert!(env.bus.take().is_empty());
    }

    #[test]
    fn load_failure_evicts_entry_and_file() {
        let env = env();
        let keys = seed_remote_channel(&env, "all", 2, &[1, 2]);
        env.sched.play_named_channel("all").unwrap();

        let doomed = vault::find_existing(env.sched.vault_dir(), &keys[0]).unwrap();
        env.sched.on_load_failed(&keys[0], "all", "decode_error");

        assert!(!doomed.exists());
        assert_eq!(env.sched.total_available(), 1);
        let art = env.sched.next().unwrap();
        assert_eq!(art.post_id, 2);
        assert!(env.bus.take().contains(&SchedEvent::PlayNext));
        // The eviction is persisted on the next debounce flush.
        assert_eq!(env.sched.channel_stats("all"), Some((2, 1)));
    }

    #[test]
    fn stats_sum_matches_total_available() {
        let env = env();
        seed_remote_channel(&env, "all", 3, &[1, 3]);
        seed_remote_channel(&env, "promoted", 2, &[1]);
        env.sched.execute_playset(&two_channel_cmd()).unwrap();

        let stats = env.sched.get_stats();
        let sum: usize = stats.channels.iter().map(|c| c.cached).sum();
        assert_eq!(sum, stats.total_available);
        assert_eq!(stats.total_available, env.sched.total_available());
        assert_eq!(env.sched.channel_stats("all"), Some((3, 2)));
        assert_eq!(env.sched.channel_stats("promoted"), Some((2, 1)));
    }

    #[test]
    fn repeat_execute_is_idempotent_modulo_epoch() {
        let env = env();
        seed_remote_channel(&env, "all", 2, &[1, 2]);
        let cmd = PlaysetCmd {
            channels: vec![ChannelSpec::named("all")],
            exposure: ExposureMode::Proportional,
            pick: PickMode::Recency,
        };
        env.sched.execute_playset(&cmd).unwrap();
        let first = env.sched.get_stats();
        env.sched.execute_playset(&cmd).unwrap();
        let second = env.sched.get_stats();

        assert_eq!(second.epoch_id, first.epoch_id + 1);
        assert_eq!(first.total_available, second.total_available);
        let w1: Vec<u32> = first.channels.iter().map(|c| c.weight).collect();
        let w2: Vec<u32> = second.channels.iter().map(|c| c.weight).collect();
        assert_eq!(w1, w2);
    }

    #[test]
    fn proportional_weights_track_availability() {
        let env = env();
        seed_remote_channel(&env, "all", 4, &[1, 2, 3]);
        seed_remote_channel(&env, "promoted", 2, &[1]);
        let cmd = PlaysetCmd {
            channels: vec![ChannelSpec::named("all"), ChannelSpec::named("promoted")],
            exposure: ExposureMode::Proportional,
            pick: PickMode::Recency,
        };
        env.sched.execute_playset(&cmd).unwrap();
        let stats = env.sched.get_stats();
        assert_eq!(stats.channels[0].weight, 3);
        assert_eq!(stats.channels[1].weight, 1);
    }

    #[test]
    fn manual_weight_zero_channel_is_never_picked() {
        let env = env();
        seed_remote_channel(&env, "all", 2, &[1, 2]);
        seed_remote_channel(&env, "promoted", 1, &[1]);
        let mut cmd = two_channel_cmd();
        cmd.exposure = ExposureMode::Manual;
        cmd.channels[0].weight = 0;
        cmd.channels[1].weight = 1;
        env.sched.execute_playset(&cmd).unwrap();

        for _ in 0..5 {
            assert_eq!(env.sched.next().unwrap().channel_id, "promoted");
        }
    }

    #[test]
    fn play_local_file_publishes_and_records_history() {
        let env = env();
        let path = env.sched.animations_dir().join("clip.gif");
        fs::write(&path, b"x").unwrap();
        env.sched.play_local_file(&path).unwrap();

        let events = env.bus.take();
        assert!(events.iter().any(|e| matches!(e, SchedEvent::PlayFile(p) if p == &path)));
        assert!(matches!(
            env.sched.play_local_file(Path::new("/definitely/not/here.gif")),
            Err(SchedError::NotFound)
        ));
    }

    #[test]
    fn makapix_detection() {
        assert!(is_makapix_channel("all"));
        assert!(is_makapix_channel("by_user_abc"));
        assert!(is_makapix_channel("artwork"));
        assert!(!is_makapix_channel("sdcard"));
    }
}
