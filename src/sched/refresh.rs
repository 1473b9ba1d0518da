//! Background refresh: one worker services `refresh_pending` channels
//! serially. Storage-card channels rebuild synchronously, artwork
//! channels download their single payload, catalog channels hand off to
//! the broker and complete asynchronously. A one-hour cycle rearms
//! everything once the playset has gone fully idle.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::sched::cache::{self, ChannelCache};
use crate::sched::collab::RefreshAccept;
use crate::sched::types::{
    ChannelId, ChannelKind, ChannelSpec, MediaExt, MessageKind, SchedEvent,
};
use crate::sched::{recompute_weights, total_available_locked, ArtworkRequest, PlayScheduler};
use crate::sched::vault;

const POLL_TICK: Duration = Duration::from_secs(1);

pub(crate) enum RefreshSignal {
    Kick,
    Shutdown,
}

pub(crate) struct RefreshHandle {
    tx: Sender<RefreshSignal>,
    join: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    pub fn kick(&self) {
        let _ = self.tx.send(RefreshSignal::Kick);
    }

    pub fn stop(mut self) {
        let _ = self.tx.send(RefreshSignal::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub(crate) fn spawn(sched: Weak<PlayScheduler>, period: Duration) -> RefreshHandle {
    let (tx, rx) = mpsc::channel();
    let join = std::thread::Builder::new()
        .name("channel-refresh".into())
        .spawn(move || worker(sched, rx, period))
        .expect("spawn channel-refresh thread");
    RefreshHandle { tx, join: Some(join) }
}

fn worker(sched: Weak<PlayScheduler>, rx: Receiver<RefreshSignal>, period: Duration) {
    loop {
        match rx.recv_timeout(POLL_TICK) {
            Ok(RefreshSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(RefreshSignal::Kick) | Err(RecvTimeoutError::Timeout) => {}
        }
        let Some(sched) = sched.upgrade() else { break };
        if sched.is_shutting_down() {
            break;
        }
        sched.refresh_tick(period);
    }
    debug!("channel-refresh worker exiting");
}

/// What one dispatch works on, snapshotted under the mutex so the
/// blocking part runs without it.
pub(crate) struct RefreshWork {
    index: usize,
    id: ChannelId,
    spec: ChannelSpec,
    cache: Arc<ChannelCache>,
    art: Option<ArtworkRequest>,
}

enum RefreshOutcome {
    Done,
    AsyncPending,
    Requeue,
}

impl PlayScheduler {
    /// One full pass of the refresh loop. Also the synchronous entry
    /// point the tests drive directly.
    pub(crate) fn refresh_tick(&self, period: Duration) {
        self.refresh_periodic_rearm(period);
        self.refresh_consume_completions();
        while let Some(work) = self.refresh_take_next() {
            let index = work.index;
            let cache = Arc::clone(&work.cache);
            let outcome = self.refresh_dispatch(work);
            self.refresh_finish(index, &cache, outcome);
            self.refresh_consume_completions();
        }
    }

    /// Step 1: fold in finished asynchronous catalog queries. The batch
    /// merge already landed in the in-memory cache, so the cache is
    /// NOT reloaded from disk (that could clash with an in-flight
    /// save); it is only marked for persistence.
    fn refresh_consume_completions(&self) {
        let mut woke_any = false;
        let mut has_entries = false;
        {
            let mut st = self.lock_state();
            for i in 0..st.channels.len() {
                if !st.channels[i].refresh_async_pending {
                    continue;
                }
                if !self.collab().catalog.take_completion(st.channels[i].id.as_str()) {
                    continue;
                }
                st.channels[i].refresh_async_pending = false;
                st.channels[i].cache.mark_dirty();
                recompute_weights(&mut st);
                woke_any = true;
                has_entries |= st.channels[i].available() > 0
                    || st.channels[i].cache.ci_len() > 0;
                info!(
                    "{}: catalog refresh complete ({} known, {} local)",
                    st.channels[i].id,
                    st.channels[i].cache.ci_len(),
                    st.channels[i].available()
                );
            }
        }
        if woke_any {
            self.saver().schedule_save();
            self.collab().downloader.reset_cursors();
            self.collab().downloader.rescan();
            if has_entries && !self.collab().renderer.is_animation_ready() {
                self.collab().bus.publish(SchedEvent::PlayNext);
            }
        }
    }

    /// Step 2+3: claim the next pending channel. Catalog channels wait
    /// until the broker is ready; they stay pending and are retried on
    /// the next tick.
    fn refresh_take_next(&self) -> Option<RefreshWork> {
        let catalog_ready = self.collab().catalog.is_ready();
        let mut st = self.lock_state();
        let busy = st.channels.iter().any(|c| c.refresh_in_progress);
        if busy {
            return None; // one in-flight refresh at a time
        }
        for i in 0..st.channels.len() {
            let ch = &st.channels[i];
            if !ch.refresh_pending || ch.refresh_in_progress {
                continue;
            }
            let needs_broker = matches!(
                ch.id.kind(),
                ChannelKind::Named | ChannelKind::User | ChannelKind::Hashtag
            );
            if needs_broker && !catalog_ready {
                continue;
            }
            let ch = &mut st.channels[i];
            ch.refresh_in_progress = true;
            ch.refresh_pending = false;
            return Some(RefreshWork {
                index: i,
                id: ch.id.clone(),
                spec: ch.spec.clone(),
                cache: Arc::clone(&ch.cache),
                art: ch.art.clone(),
            });
        }
        None
    }

    /// Step 4: the blocking part, mutex released.
    fn refresh_dispatch(&self, work: RefreshWork) -> RefreshOutcome {
        match work.id.kind() {
            ChannelKind::Sdcard => {
                match cache::build_sdcard_index(self.animations_dir(), self.channels_dir()) {
                    Ok(count) => {
                        work.cache.reload(self.channels_dir(), self.vault_dir());
                        debug!("storage-card index rebuilt: {count} entries");
                    }
                    Err(e) => warn!("storage-card index rebuild failed: {e}"),
                }
                RefreshOutcome::Done
            }
            ChannelKind::Artwork => {
                self.refresh_artwork(&work);
                RefreshOutcome::Done
            }
            ChannelKind::Named | ChannelKind::User | ChannelKind::Hashtag => {
                match self.collab().catalog.refresh_channel_index(&work.spec, &work.cache) {
                    Ok(RefreshAccept::Accepted) => RefreshOutcome::AsyncPending,
                    Ok(RefreshAccept::NotConnected) => RefreshOutcome::Requeue,
                    Err(e) => {
                        warn!("{}: catalog refresh failed: {e}", work.id);
                        RefreshOutcome::Done
                    }
                }
            }
        }
    }

    fn refresh_artwork(&self, work: &RefreshWork) {
        let Some(request) = &work.art else {
            return;
        };
        if vault::find_existing(self.vault_dir(), &request.storage_key).is_none() {
            let ext = MediaExt::from_url(&request.url);
            let dest = vault::vault_path(self.vault_dir(), &request.storage_key, ext);
            let display = work.spec.display_name.clone();
            let renderer = Arc::clone(&self.collab().renderer);
            let progress = move |pct: u8| {
                renderer.set_channel_message(&display, MessageKind::Downloading, pct, "");
            };
            if let Err(e) =
                self.collab().downloader.fetch_artwork(&request.url, &dest, &progress)
            {
                warn!("artwork download failed: {e}");
                self.collab().renderer.set_channel_message(
                    &work.spec.display_name,
                    MessageKind::Error,
                    0,
                    "download failed",
                );
                return;
            }
            self.collab().renderer.set_channel_message(
                &work.spec.display_name,
                MessageKind::None,
                0,
                "",
            );
        }
        if vault::find_existing(self.vault_dir(), &request.storage_key).is_some() {
            if let Err(e) = work.cache.lai_add(request.post_id) {
                warn!("artwork channel activation failed: {e}");
            }
        }
    }

    /// Step 5: reacquire the mutex, clear the in-progress bit, settle
    /// flags and weights. A playset swap while we were off-lock makes
    /// the work stale; it is dropped on the floor.
    fn refresh_finish(&self, index: usize, cache: &Arc<ChannelCache>, outcome: RefreshOutcome) {
        let woke = {
            let mut st = self.lock_state();
            let before = total_available_locked(&st);
            let Some(ch) = st.channels.get_mut(index) else {
                return;
            };
            if !Arc::ptr_eq(&ch.cache, cache) {
                return; // playset swapped while we were off-lock
            }
            ch.refresh_in_progress = false;
            match outcome {
                RefreshOutcome::Done => {}
                RefreshOutcome::AsyncPending => ch.refresh_async_pending = true,
                RefreshOutcome::Requeue => ch.refresh_pending = true,
            }
            recompute_weights(&mut st);
            let after = total_available_locked(&st);
            before == 0 && after > 0
        };
        self.collab().downloader.reset_cursors();
        if woke {
            self.collab().bus.publish(SchedEvent::PlayNext);
        }
    }

    /// Step 6: when every channel is settled, stamp the cycle end and
    /// rearm the whole playset after the periodic interval.
    fn refresh_periodic_rearm(&self, period: Duration) {
        let mut st = self.lock_state();
        if st.channels.is_empty() {
            return;
        }
        let idle = st
            .channels
            .iter()
            .all(|c| !c.refresh_pending && !c.refresh_in_progress && !c.refresh_async_pending);
        if !idle {
            st.cycle_done_at = None;
            return;
        }
        match st.cycle_done_at {
            None => st.cycle_done_at = Some(Instant::now()),
            Some(done_at) if done_at.elapsed() >= period => {
                info!("periodic refresh: rearming {} channel(s)", st.channels.len());
                for ch in &mut st.channels {
                    ch.refresh_pending = true;
                }
                st.cycle_done_at = None;
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::{env_with, seed_remote_channel, RecordingBus, TestEnv};
    use crate::sched::types::{
        ArtworkKind, CatalogEntry, ChannelSpec, ExposureMode, PickMode, PlaysetCmd, SchedResult,
    };
    use crate::sched::collab::{
        CatalogClient, Collaborators, ContentDownloader, NullRenderer, NullTracker,
    };
    use crate::sched::ChannelCache;
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// A broker stub: merges prepared batches synchronously and raises
    /// the completion flag the scheduler polls.
    struct StubCatalog {
        ready: AtomicBool,
        batches: Mutex<HashMap<String, Vec<CatalogEntry>>>,
        completed: Mutex<HashSet<String>>,
    }

    impl StubCatalog {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicBool::new(ready),
                batches: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashSet::new()),
            })
        }
        fn stage(&self, channel_id: &str, batch: Vec<CatalogEntry>) {
            self.batches.lock().unwrap().insert(channel_id.into(), batch);
        }
    }

    impl CatalogClient for StubCatalog {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
        fn refresh_channel_index(
            &self,
            spec: &ChannelSpec,
            cache: &Arc<ChannelCache>,
        ) -> SchedResult<RefreshAccept> {
            if !self.is_ready() {
                return Ok(RefreshAccept::NotConnected);
            }
            let id = crate::sched::ChannelId::from_spec(spec);
            if let Some(batch) = self.batches.lock().unwrap().get(id.as_str()) {
                cache.merge_entries(batch);
            }
            self.completed.lock().unwrap().insert(id.to_string());
            Ok(RefreshAccept::Accepted)
        }
        fn take_completion(&self, channel_id: &str) -> bool {
            self.completed.lock().unwrap().remove(channel_id)
        }
        fn cancel_all_refreshes(&self) {}
        fn cancel_current_load(&self) {}
    }

    /// Writes the payload file and reports full progress.
    struct StubDownloader;

    impl ContentDownloader for StubDownloader {
        fn set_channels(&self, _ids: &[String]) {}
        fn reset_cursors(&self) {}
        fn rescan(&self) {}
        fn cancel_all(&self) {}
        fn fetch_artwork(
            &self,
            _url: &str,
            dest: &Path,
            progress: &dyn Fn(u8),
        ) -> SchedResult<()> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dest, b"artwork-bytes")?;
            progress(100);
            Ok(())
        }
    }

    fn catalog_entries(n: i32) -> Vec<CatalogEntry> {
        (1..=n)
            .map(|i| CatalogEntry {
                post_id: i,
                storage_key: Uuid::new_v4(),
                kind: ArtworkKind::Still,
                flags: 0,
                dwell_ms: 10_000,
                created_at: i as i64,
            })
            .collect()
    }

    fn env_with_catalog(catalog: Arc<StubCatalog>) -> TestEnv {
        env_with(
            move || Collaborators {
                catalog: catalog.clone(),
                downloader: Arc::new(StubDownloader),
                renderer: Arc::new(NullRenderer),
                bus: RecordingBus::new(),
                tracker: Arc::new(NullTracker),
            },
            PickMode::Recency,
        )
    }

    #[test]
    fn cold_start_remote_channel_end_to_end() {
        let catalog = StubCatalog::new(true);
        let entries = catalog_entries(3);
        catalog.stage("all", entries.clone());
        let env = env_with_catalog(catalog);

        env.sched.play_named_channel("all").unwrap();
        env.sched.refresh_tick(Duration::from_secs(3600));

        // Catalog answered: index populated, nothing local yet.
        assert_eq!(env.sched.channel_stats("all"), Some((3, 0)));
        assert_eq!(env.sched.total_available(), 0);

        // Downloader lands the first payload.
        let key = entries[0].storage_key;
        let p = vault::vault_path(env.sched.vault_dir(), &key, MediaExt::Webp);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, b"payload").unwrap();
        env.sched.on_download_complete("all", &key);

        assert_eq!(env.sched.total_available(), 1);
        let art = env.sched.next().unwrap();
        assert_eq!(art.post_id, entries[0].post_id);
        assert_eq!(art.path, p);

        // Flushed state on disk is a valid v20 file holding the one
        // locally-available post id.
        env.sched.saver().flush_all();
        let loaded = ChannelCache::load(
            crate::sched::ChannelId::named("all"),
            env.sched.channels_dir(),
            env.sched.vault_dir(),
        );
        assert_eq!(loaded.ci_len(), 3);
        assert_eq!(loaded.lai_len(), 1);
        assert!(loaded.lai_contains(entries[0].post_id));
    }

    #[test]
    fn not_connected_requeues_until_broker_ready() {
        let catalog = StubCatalog::new(false);
        catalog.stage("all", catalog_entries(2));
        let env = env_with_catalog(catalog.clone());

        env.sched.play_named_channel("all").unwrap();
        env.sched.refresh_tick(Duration::from_secs(3600));
        // Broker down: nothing happened, refresh still owed.
        assert_eq!(env.sched.channel_stats("all"), Some((0, 0)));

        catalog.ready.store(true, Ordering::SeqCst);
        env.sched.refresh_tick(Duration::from_secs(3600));
        assert_eq!(env.sched.channel_stats("all"), Some((2, 0)));
    }

    #[test]
    fn sdcard_refresh_builds_and_loads_index() {
        let env = env_with(Collaborators::default, PickMode::Recency);
        fs::write(env.sched.animations_dir().join("a.gif"), b"x").unwrap();
        fs::write(env.sched.animations_dir().join("b.webp"), b"x").unwrap();

        let cmd = PlaysetCmd {
            channels: vec![ChannelSpec::sdcard()],
            exposure: ExposureMode::Equal,
            pick: PickMode::Recency,
        };
        env.sched.execute_playset(&cmd).unwrap();
        env.bus.take();
        env.sched.refresh_tick(Duration::from_secs(3600));

        assert_eq!(env.sched.channel_stats("sdcard"), Some((2, 2)));
        // The playset was empty before the rebuild; the renderer gets
        // woken through the bus.
        assert!(env.bus.take().contains(&SchedEvent::PlayNext));

        let art = env.sched.next().unwrap();
        assert_eq!(art.path, env.sched.animations_dir().join("a.gif"));
        assert_eq!(art.kind, ArtworkKind::Animation);
    }

    #[test]
    fn artwork_channel_downloads_and_plays() {
        let env = env_with(
            || Collaborators {
                downloader: Arc::new(StubDownloader),
                ..Collaborators::default()
            },
            PickMode::Recency,
        );
        let key = Uuid::new_v4();
        env.sched.play_artwork(991, key, "https://makapix.example/p/spiral.gif").unwrap();
        assert_eq!(env.sched.total_available(), 0);

        env.sched.refresh_tick(Duration::from_secs(3600));
        assert_eq!(env.sched.total_available(), 1);

        let art = env.sched.next().unwrap();
        assert_eq!(art.post_id, 991);
        assert_eq!(art.kind, ArtworkKind::Animation);
        assert!(art.path.ends_with(format!("{}.gif", key.as_hyphenated())));
        assert!(art.path.exists());
    }

    #[test]
    fn periodic_rearm_after_idle_interval() {
        let catalog = StubCatalog::new(true);
        catalog.stage("all", catalog_entries(1));
        let env = env_with_catalog(catalog.clone());
        env.sched.play_named_channel("all").unwrap();

        env.sched.refresh_tick(Duration::from_millis(30));
        assert_eq!(env.sched.channel_stats("all"), Some((1, 0)));

        // First idle tick stamps the cycle end; once the period lapses
        // the channel is owed a refresh again.
        env.sched.refresh_tick(Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(50));
        catalog.stage("all", catalog_entries(2));
        env.sched.refresh_tick(Duration::from_millis(30));
        assert_eq!(env.sched.channel_stats("all"), Some((2, 0)));
    }

    #[test]
    fn background_worker_services_kicks() {
        let catalog = StubCatalog::new(true);
        catalog.stage("all", catalog_entries(2));
        let env = env_with_catalog(catalog);

        env.sched.start();
        env.sched.play_named_channel("all").unwrap();
        // execute_playset kicks the worker; give it a moment.
        for _ in 0..50 {
            if env.sched.channel_stats("all") == Some((2, 0)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(env.sched.channel_stats("all"), Some((2, 0)));
        env.sched.shutdown();
    }
}
