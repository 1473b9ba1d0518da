//! Debounced batch persistence. One timer, one registry of loaded
//! caches: every mutation rearms the timer, and when it fires every
//! dirty cache is flushed in one pass so a burst of LAi updates costs
//! one file write per channel instead of one per update.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::sched::cache::ChannelCache;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(15);

enum SaverMsg {
    Rearm,
    Flush(Sender<()>),
    Shutdown,
}

struct Registry {
    caches: Vec<Arc<ChannelCache>>,
}

impl Registry {
    /// Snapshot the dirty caches so the file writes happen outside the
    /// registry lock.
    fn dirty_snapshot(&self) -> Vec<Arc<ChannelCache>> {
        self.caches.iter().filter(|c| c.is_dirty()).cloned().collect()
    }
}

pub struct SaveScheduler {
    channels_dir: PathBuf,
    registry: Arc<Mutex<Registry>>,
    tx: Sender<SaverMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SaveScheduler {
    pub fn new(channels_dir: PathBuf, debounce: Duration) -> Self {
        let registry = Arc::new(Mutex::new(Registry { caches: Vec::new() }));
        let (tx, rx) = mpsc::channel();
        let worker = spawn_worker(channels_dir.clone(), Arc::clone(&registry), rx, debounce);
        Self { channels_dir, registry, tx, worker: Mutex::new(Some(worker)) }
    }

    /// Caches must be registered for the lifetime they can be flushed;
    /// unregister before freeing so a concurrent flush never observes a
    /// dropped channel.
    pub fn register(&self, cache: Arc<ChannelCache>) {
        let mut reg = self.registry.lock().unwrap();
        if !reg.caches.iter().any(|c| Arc::ptr_eq(c, &cache)) {
            reg.caches.push(cache);
        }
    }

    pub fn unregister(&self, cache: &Arc<ChannelCache>) {
        let mut reg = self.registry.lock().unwrap();
        reg.caches.retain(|c| !Arc::ptr_eq(c, cache));
    }

    /// Restart the debounce window. The caller has already marked the
    /// cache dirty; the timer fire will pick it up.
    pub fn schedule_save(&self) {
        let _ = self.tx.send(SaverMsg::Rearm);
    }

    /// Flush every dirty cache now, bypassing the debounce. Returns
    /// once the worker has finished the pass. Called on shutdown and
    /// before the storage medium is unmounted.
    pub fn flush_all(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(SaverMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(30));
        }
    }

    pub fn shutdown(&self) {
        self.flush_all();
        let _ = self.tx.send(SaverMsg::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.registry.lock().unwrap().caches.len()
    }

    pub fn channels_dir(&self) -> &PathBuf {
        &self.channels_dir
    }
}

impl Drop for SaveScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(SaverMsg::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn spawn_worker(
    channels_dir: PathBuf,
    registry: Arc<Mutex<Registry>>,
    rx: Receiver<SaverMsg>,
    debounce: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("cache-saver".into())
        .spawn(move || {
            let mut deadline: Option<Instant> = None;
            loop {
                let msg = match deadline {
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    Some(at) => {
                        let now = Instant::now();
                        if at <= now {
                            deadline = None;
                            save_pass(&channels_dir, &registry);
                            continue;
                        }
                        rx.recv_timeout(at - now)
                    }
                };
                match msg {
                    Ok(SaverMsg::Rearm) => {
                        deadline = Some(Instant::now() + debounce);
                    }
                    Ok(SaverMsg::Flush(ack)) => {
                        deadline = None;
                        save_pass(&channels_dir, &registry);
                        let _ = ack.send(());
                    }
                    Ok(SaverMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        deadline = None;
                        save_pass(&channels_dir, &registry);
                    }
                }
            }
        })
        .expect("spawn cache-saver thread")
}

fn save_pass(channels_dir: &std::path::Path, registry: &Arc<Mutex<Registry>>) {
    let dirty = registry.lock().unwrap().dirty_snapshot();
    if dirty.is_empty() {
        return;
    }
    debug!("saving {} dirty channel cache(s)", dirty.len());
    for cache in dirty {
        if let Err(e) = cache.save(channels_dir) {
            // Left dirty; the next debounce rearm retries.
            warn!("save of {} failed: {e}", cache.id());
        }
    }
}
