//! "Play this URL now": a single-slot download that preempts all other
//! network and storage traffic, pulls one artwork into the animations
//! directory in small serialized chunks, and hands it straight to the
//! renderer.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::sched::types::{ChannelKind, MessageKind, SchedError, SchedResult};
use crate::sched::utils::{unique_dest, url_filename};
use crate::sched::PlayScheduler;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_WAIT: Duration = Duration::from_secs(5);
const MAX_DOWNLOAD_BYTES: u64 = 16 * 1024 * 1024;
const CHUNK_BYTES: usize = 128 * 1024;
const CHUNK_YIELD: Duration = Duration::from_millis(10);
const ERROR_DISPLAY: Duration = Duration::from_secs(3);

pub(crate) struct ShowUrlJob {
    cancel: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ShowUrlJob {
    /// Raise the cancel flag and wait (bounded) for the worker to
    /// notice it at a chunk boundary. Threads are never force-killed.
    pub fn cancel_and_join(self, wait: Duration) -> bool {
        self.cancel.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + wait;
        while !self.join.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let _ = self.join.join();
        true
    }
}

impl PlayScheduler {
    /// Start a show-url download. Only one runs at a time: a new
    /// request cancels the current one and waits briefly for it to
    /// wind down before taking the slot.
    pub fn show_url(self: &Arc<Self>, url: &str, blocking: bool) -> SchedResult<()> {
        let (stem, ext) = url_filename(url).ok_or(SchedError::InvalidArg)?;
        if !matches!(ext.as_str(), "gif" | "webp" | "jpg" | "jpeg" | "png") {
            return Err(SchedError::InvalidArg);
        }
        if self.is_storage_locked() {
            // USB export owns the medium right now.
            return Err(SchedError::InvalidState);
        }

        let mut slot = self.show_slot.lock().unwrap();
        if let Some(job) = slot.take() {
            if !job.cancel_and_join(CANCEL_WAIT) {
                return Err(SchedError::Timeout);
            }
        }

        // Everything else touching the network or the storage bus gets
        // out of the way.
        self.collab().catalog.cancel_current_load();
        self.collab().catalog.cancel_all_refreshes();
        self.collab().downloader.cancel_all();

        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);
        let sched = Arc::clone(self);
        let url = url.to_string();
        let join = std::thread::Builder::new()
            .name("show-url".into())
            .spawn(move || run_download(sched, url, stem, ext, blocking, worker_cancel))
            .map_err(SchedError::IoFail)?;
        *slot = Some(ShowUrlJob { cancel, join });
        Ok(())
    }

    /// The storage card changed under the active playset; owe its
    /// channels a refresh.
    pub(crate) fn refresh_sdcard_soon(&self) {
        {
            let mut st = self.lock_state();
            for ch in &mut st.channels {
                if ch.id.kind() == ChannelKind::Sdcard {
                    ch.refresh_pending = true;
                }
            }
        }
        self.kick_refresh();
    }
}

fn run_download(
    sched: Arc<PlayScheduler>,
    url: String,
    stem: String,
    ext: String,
    blocking: bool,
    cancel: Arc<AtomicBool>,
) {
    match download_one(&sched, &url, &stem, &ext, &cancel) {
        Ok(Some(final_path)) => {
            info!("show-url stored {}", final_path.display());
            sched.collab().renderer.set_channel_message(&stem, MessageKind::None, 0, "");
            sched.refresh_sdcard_soon();
            if let Err(e) = sched.play_local_file(&final_path) {
                warn!("show-url playback request failed: {e}");
            }
        }
        Ok(None) => {
            debug!("show-url cancelled");
        }
        Err(e) => {
            warn!("show-url failed for {url}: {e}");
            if blocking {
                sched.collab().renderer.set_channel_message(
                    &stem,
                    MessageKind::Error,
                    0,
                    "download failed",
                );
                std::thread::sleep(ERROR_DISPLAY);
                sched.collab().renderer.set_channel_message(&stem, MessageKind::None, 0, "");
            }
        }
    }
}

/// Ok(None) means cancelled: the temp file is gone and nothing is said
/// to the user.
fn download_one(
    sched: &Arc<PlayScheduler>,
    url: &str,
    stem: &str,
    ext: &str,
    cancel: &AtomicBool,
) -> SchedResult<Option<PathBuf>> {
    let final_path =
        unique_dest(sched.animations_dir(), stem, ext).ok_or(SchedError::InvalidState)?;
    fs::create_dir_all(sched.animations_dir())?;
    fs::create_dir_all(sched.downloads_dir())?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
    let tmp_path = sched.downloads_dir().join(format!("showurl_{stamp}.part"));

    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| SchedError::IoFail(std::io::Error::other(e)))?;
    let mut resp = client
        .get(url)
        .send()
        .map_err(|e| SchedError::IoFail(std::io::Error::other(e)))?;
    if resp.status() != reqwest::StatusCode::OK {
        return Err(SchedError::IoFail(std::io::Error::other(format!(
            "HTTP {} for {url}",
            resp.status()
        ))));
    }
    let total = resp.content_length();
    if let Some(t) = total {
        if t > MAX_DOWNLOAD_BYTES {
            return Err(SchedError::InvalidSize);
        }
    }

    let result = copy_chunks(sched, &mut resp, &tmp_path, stem, total, cancel);
    match &result {
        Ok(true) => {}
        // Cancelled or failed: drop the partial download.
        _ => {
            let _ = fs::remove_file(&tmp_path);
        }
    }
    match result? {
        false => Ok(None),
        true => {
            fs::rename(&tmp_path, &final_path)?;
            Ok(Some(final_path))
        }
    }
}

/// Ok(true) = complete, Ok(false) = cancelled.
fn copy_chunks(
    sched: &Arc<PlayScheduler>,
    resp: &mut reqwest::blocking::Response,
    tmp_path: &std::path::Path,
    stem: &str,
    total: Option<u64>,
    cancel: &AtomicBool,
) -> SchedResult<bool> {
    let mut file = fs::File::create(tmp_path)?;
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut received: u64 = 0;
    let mut last_pct: i32 = -1;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let n = resp
            .read(&mut buf)
            .map_err(SchedError::IoFail)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        received += n as u64;
        if received > MAX_DOWNLOAD_BYTES {
            // Chunked body with no declared length ran past the cap.
            return Err(SchedError::InvalidSize);
        }
        if let Some(t) = total {
            let pct = ((received * 100) / t.max(1)).min(100) as i32;
            if pct != last_pct {
                last_pct = pct;
                sched.collab().renderer.set_channel_message(
                    stem,
                    MessageKind::Downloading,
                    pct as u8,
                    "",
                );
            }
        }
        std::thread::sleep(CHUNK_YIELD);
    }
    file.flush()?;
    file.sync_all()?;
    Ok(true)
}
