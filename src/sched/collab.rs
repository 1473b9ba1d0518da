//! Seams to the subsystems the scheduler talks to but does not own:
//! the catalog client, the content downloader, the renderer, the event
//! bus, and the view tracker. The scheduler is constructed over trait
//! objects so hosts wire the real collaborators and tests wire stubs.

use std::path::Path;
use std::sync::Arc;

use crate::sched::cache::ChannelCache;
use crate::sched::types::{ChannelSpec, MessageKind, SchedEvent, SchedResult};

/// Outcome of asking the catalog to refresh one channel's index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshAccept {
    /// Query dispatched; completion arrives asynchronously.
    Accepted,
    /// Broker unavailable; caller requeues and retries later.
    NotConnected,
}

/// The remote artwork catalog, reached over the message broker.
/// `refresh_channel_index` merges the query result into `cache` (via
/// `merge_entries`) and raises the per-channel completion flag that
/// `take_completion` consumes.
pub trait CatalogClient: Send + Sync {
    fn is_ready(&self) -> bool;
    fn refresh_channel_index(
        &self,
        spec: &ChannelSpec,
        cache: &Arc<ChannelCache>,
    ) -> SchedResult<RefreshAccept>;
    /// True exactly once per completed refresh of `channel_id`.
    fn take_completion(&self, channel_id: &str) -> bool;
    fn cancel_all_refreshes(&self);
    fn cancel_current_load(&self);
}

/// The background payload fetcher that fills the vault.
pub trait ContentDownloader: Send + Sync {
    fn set_channels(&self, ids: &[String]);
    fn reset_cursors(&self);
    fn rescan(&self);
    fn cancel_all(&self);
    /// Blocking single-artwork fetch used for one-shot artwork
    /// channels; `progress` receives a 0..=100 percentage.
    fn fetch_artwork(&self, url: &str, dest: &Path, progress: &dyn Fn(u8)) -> SchedResult<()>;
}

pub trait Renderer: Send + Sync {
    fn set_channel_message(&self, channel_name: &str, kind: MessageKind, percent: u8, detail: &str);
    /// True while an animation is up on the panel.
    fn is_animation_ready(&self) -> bool;
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: SchedEvent);
}

pub trait ViewTracker: Send + Sync {
    fn signal_swap(&self, post_id: i32, path: &Path);
    fn stop(&self);
    fn pause(&self);
    fn resume(&self);
}

/// The full set of seams handed to `PlayScheduler::new`.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogClient>,
    pub downloader: Arc<dyn ContentDownloader>,
    pub renderer: Arc<dyn Renderer>,
    pub bus: Arc<dyn EventBus>,
    pub tracker: Arc<dyn ViewTracker>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            catalog: Arc::new(OfflineCatalog),
            downloader: Arc::new(NullDownloader),
            renderer: Arc::new(NullRenderer),
            bus: Arc::new(NullBus),
            tracker: Arc::new(NullTracker),
        }
    }
}

/// A catalog that is never connected; refreshes requeue forever.
pub struct OfflineCatalog;

impl CatalogClient for OfflineCatalog {
    fn is_ready(&self) -> bool {
        false
    }
    fn refresh_channel_index(
        &self,
        _spec: &ChannelSpec,
        _cache: &Arc<ChannelCache>,
    ) -> SchedResult<RefreshAccept> {
        Ok(RefreshAccept::NotConnected)
    }
    fn take_completion(&self, _channel_id: &str) -> bool {
        false
    }
    fn cancel_all_refreshes(&self) {}
    fn cancel_current_load(&self) {}
}

pub struct NullDownloader;

impl ContentDownloader for NullDownloader {
    fn set_channels(&self, _ids: &[String]) {}
    fn reset_cursors(&self) {}
    fn rescan(&self) {}
    fn cancel_all(&self) {}
    fn fetch_artwork(&self, _url: &str, _dest: &Path, _progress: &dyn Fn(u8)) -> SchedResult<()> {
        Err(crate::sched::types::SchedError::InvalidState)
    }
}

pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn set_channel_message(
        &self,
        _channel_name: &str,
        _kind: MessageKind,
        _percent: u8,
        _detail: &str,
    ) {
    }
    fn is_animation_ready(&self) -> bool {
        false
    }
}

pub struct NullBus;

impl EventBus for NullBus {
    fn publish(&self, _event: SchedEvent) {}
}

pub struct NullTracker;

impl ViewTracker for NullTracker {
    fn signal_swap(&self, _post_id: i32, _path: &Path) {}
    fn stop(&self) {}
    fn pause(&self) {}
    fn resume(&self) {}
}
