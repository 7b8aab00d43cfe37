//! Public download session.
//!
//! [`Downloader`] carries the configuration and lifecycle of one download:
//! `start` probes the resource, plans or reconciles slices, runs the
//! transfer through the scheduler, verifies the finished file and atomically
//! renames it into place. `pause`/`resume`/`stop` drive the
//! Stopped/Downloading/Paused state machine; the terminal result is
//! delivered through a shared one-shot future and an optional callback.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::per_slice_quota;
use crate::config::{DownloadOptions, HashVerifyPolicy};
use crate::digest::{digest_file, digests_match, HashType};
use crate::error::{DownloadCode, DownloadError, Result};
use crate::future::{result_channel, SharedResult};
use crate::index::{IndexStore, INDEX_VERSION};
use crate::scheduler::{IndexMeta, PauseGate, Scheduler, TelemetrySinks, TransferShared};
use crate::slice::{self, Slice};
use crate::target::TargetFile;
use crate::transport::{
    file::FileTransport, http::HttpTransport, RangedTransport, ResourceInfo, TransferControls,
};

/// Suffix appended to the target path for the temporary data file.
pub const TMP_FILE_SUFFIX: &str = ".downpour.tmp";

/// Suffix appended to the target path for the sidecar index file.
pub const INDEX_FILE_SUFFIX: &str = ".downpour.idx";

/// Invoked once with the terminal result code.
pub type ResultCallback = Box<dyn Fn(DownloadCode) + Send + Sync>;

/// Invoked with `(total, downloaded)` byte counts; total is -1 while
/// unknown.
pub type ProgressCallback = Box<dyn Fn(i64, i64) + Send + Sync>;

/// Invoked with the realtime speed in bytes per second.
pub type SpeedCallback = Box<dyn Fn(i64) + Send + Sync>;

/// Temporary data file path for a target path.
pub fn tmp_file_path(target: &Path) -> PathBuf {
    append_suffix(target, TMP_FILE_SUFFIX)
}

/// Sidecar index file path for a target path.
pub fn index_file_path(target: &Path) -> PathBuf {
    append_suffix(target, INDEX_FILE_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Stopped,
    Downloading,
    Paused,
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: DownloadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> DownloadState {
        match self.0.load(Ordering::Acquire) {
            1 => DownloadState::Downloading,
            2 => DownloadState::Paused,
            _ => DownloadState::Stopped,
        }
    }

    fn set(&self, state: DownloadState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: DownloadState, to: DownloadState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A resumable multi-slice download session.
pub struct Downloader {
    options: DownloadOptions,
    transport_override: Option<Arc<dyn RangedTransport>>,
    state: Arc<StateCell>,
    controls: TransferControls,
    pause_gate: Arc<PauseGate>,
    origin_size: Arc<AtomicI64>,
    url: String,
    target_path: PathBuf,
    result: Option<SharedResult>,
    coordinator: Option<JoinHandle<()>>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    /// Create a session with default options.
    pub fn new() -> Self {
        Self::with_options(DownloadOptions::default())
    }

    /// Create a session with the given options.
    pub fn with_options(options: DownloadOptions) -> Self {
        Self {
            options,
            transport_override: None,
            state: Arc::new(StateCell::new(DownloadState::Stopped)),
            controls: TransferControls::new(),
            pause_gate: Arc::new(PauseGate::default()),
            origin_size: Arc::new(AtomicI64::new(-1)),
            url: String::new(),
            target_path: PathBuf::new(),
            result: None,
            coordinator: None,
        }
    }

    /// Current options.
    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Replace the options. Takes effect on the next `start`.
    pub fn set_options(&mut self, options: DownloadOptions) {
        self.options = options;
    }

    /// Use a custom transport instead of scheme-based selection.
    ///
    /// The test suite uses this seam for scripted transports; callers can
    /// use it for additional URL schemes.
    pub fn set_transport(&mut self, transport: Arc<dyn RangedTransport>) {
        self.transport_override = Some(transport);
    }

    /// Begin downloading `url` to `target_file_path`.
    ///
    /// Fails fast with a specific invalid-* error on bad configuration, and
    /// with `ALREADY_DOWNLOADING` if the session is not stopped. On success
    /// the transfer proceeds on background threads; the returned future
    /// resolves exactly once with the terminal code.
    pub fn start<P: AsRef<Path>>(
        &mut self,
        url: &str,
        target_file_path: P,
        on_result: Option<ResultCallback>,
        on_progress: Option<ProgressCallback>,
        on_speed: Option<SpeedCallback>,
    ) -> Result<SharedResult> {
        self.options.validate()?;

        let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;
        let scheme = parsed.scheme().to_string();
        if !matches!(scheme.as_str(), "http" | "https" | "file") {
            return Err(DownloadError::InvalidUrl(format!(
                "{url}: unsupported scheme {scheme}"
            )));
        }

        let target_path = target_file_path.as_ref().to_path_buf();
        if target_path.file_name().is_none() {
            return Err(DownloadError::InvalidTargetPath(target_path));
        }
        if let Some(parent) = target_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|_| DownloadError::InvalidTargetPath(target_path.clone()))?;
        }

        let transport: Arc<dyn RangedTransport> = match &self.transport_override {
            Some(transport) => Arc::clone(transport),
            None if scheme == "file" => Arc::new(FileTransport::new()),
            None => Arc::new(HttpTransport::from_options(&self.options)?),
        };

        if !self.state.transition(DownloadState::Stopped, DownloadState::Downloading) {
            return Err(DownloadError::AlreadyDownloading);
        }
        // The previous coordinator (if any) has already published its
        // result; reap the thread.
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }

        self.url = url.to_string();
        self.target_path = target_path.clone();
        self.controls = TransferControls::new();
        self.pause_gate = Arc::new(PauseGate::default());
        self.origin_size.store(-1, Ordering::Relaxed);

        let (producer, shared_result) = result_channel();
        let ctx = SessionContext {
            options: self.options.clone(),
            transport,
            url: url.to_string(),
            target_path,
            controls: self.controls.clone(),
            pause_gate: Arc::clone(&self.pause_gate),
            origin_size: Arc::clone(&self.origin_size),
            speed_cap_applies: scheme != "file",
            sinks: TelemetrySinks {
                on_progress,
                on_speed,
            },
        };
        let state = Arc::clone(&self.state);

        let handle = std::thread::spawn(move || {
            let code = match run_session(ctx) {
                Ok(()) => DownloadCode::Success,
                Err(e) => {
                    if e.code() != DownloadCode::Canceled {
                        warn!(error = %e, "download failed");
                    }
                    e.code()
                }
            };
            state.set(DownloadState::Stopped);
            producer.fulfill(code);
            if let Some(on_result) = on_result {
                on_result(code);
            }
        });

        self.coordinator = Some(handle);
        self.result = Some(shared_result.clone());
        Ok(shared_result)
    }

    /// Suspend all workers. No-op unless currently downloading.
    pub fn pause(&self) {
        if self.state.transition(DownloadState::Downloading, DownloadState::Paused) {
            self.controls.request_suspend();
            debug!("download paused");
        }
    }

    /// Re-arm suspended workers from their persisted offsets.
    pub fn resume(&self) {
        if self.state.transition(DownloadState::Paused, DownloadState::Downloading) {
            self.controls.clear_suspend();
            self.pause_gate.notify();
            debug!("download resumed");
        }
    }

    /// Cancel the download; the result future resolves to `CANCELED` once
    /// all workers quiesce.
    pub fn stop(&self) {
        if self.state.get() != DownloadState::Stopped {
            self.controls.request_stop();
            self.pause_gate.notify();
            debug!("download stop requested");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DownloadState {
        self.state.get()
    }

    /// URL of the current (or last) download.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Target path of the current (or last) download.
    pub fn target_file_path(&self) -> &Path {
        &self.target_path
    }

    /// Resource size reported by the server, or -1 while unknown.
    pub fn origin_file_size(&self) -> i64 {
        self.origin_size.load(Ordering::Relaxed)
    }

    /// The result future of the current (or last) download.
    pub fn future_result(&self) -> Option<SharedResult> {
        self.result.clone()
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.controls.request_stop();
        self.pause_gate.notify();
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
    }
}

struct SessionContext {
    options: DownloadOptions,
    transport: Arc<dyn RangedTransport>,
    url: String,
    target_path: PathBuf,
    controls: TransferControls,
    pause_gate: Arc<PauseGate>,
    origin_size: Arc<AtomicI64>,
    speed_cap_applies: bool,
    sinks: TelemetrySinks,
}

/// Full session body, run on the coordinator thread.
fn run_session(ctx: SessionContext) -> Result<()> {
    let info = probe_with_retries(
        ctx.transport.as_ref(),
        &ctx.url,
        ctx.options.fetch_file_info_retry_times,
    )?;
    let probe_total = info.total_size.unwrap_or(-1);
    ctx.origin_size.store(probe_total, Ordering::Relaxed);
    info!(
        url = %ctx.url,
        effective = %info.effective_url,
        total = probe_total,
        ranges = info.accepts_ranges,
        "starting download"
    );

    let tmp_path = tmp_file_path(&ctx.target_path);
    let index_path = index_file_path(&ctx.target_path);
    let store = IndexStore::new(index_path.clone());

    let (slices, target, created_at) = prepare_resumption(&ctx, &info, &tmp_path, &store)?;

    let slice_count = slices.len();
    let shared = Arc::new(TransferShared {
        transport: Arc::clone(&ctx.transport),
        effective_url: info.effective_url.clone(),
        slices: Mutex::new(slices),
        total_size: AtomicI64::new(probe_total),
        target,
        controls: ctx.controls.clone(),
        pause_gate: Arc::clone(&ctx.pause_gate),
        failure: Mutex::new(None),
        received: Arc::new(AtomicU64::new(0)),
        cache_quota: per_slice_quota(
            ctx.options.disk_cache_size,
            (ctx.options.thread_num as usize).min(slice_count.max(1)),
        ),
        speed_cap_applies: ctx.speed_cap_applies,
        options: ctx.options.clone(),
    });

    let meta = IndexMeta {
        origin_url: ctx.url.clone(),
        created_at,
    };
    Scheduler::new(Arc::clone(&shared), store, meta, ctx.sinks).run()?;

    // All slices completed; total is resolved even for open-ended runs.
    let total = shared.total_size.load(Ordering::Relaxed);
    ctx.origin_size.store(total, Ordering::Relaxed);

    let flush_err = |e| DownloadError::FlushTmpFile {
        path: tmp_path.clone(),
        source: e,
    };
    shared.target.sync_all().map_err(flush_err)?;
    if total >= 0 {
        let len = shared.target.len().map_err(flush_err)? as i64;
        if len != total {
            return Err(DownloadError::TmpFileSize {
                expected: total,
                actual: len,
            });
        }
    }

    verify(&ctx.options, &info, probe_total, &tmp_path)?;

    IndexStore::new(index_path).remove()?;
    fs::rename(&tmp_path, &ctx.target_path).map_err(|e| DownloadError::RenameTmpFile {
        to: ctx.target_path.clone(),
        source: e,
    })?;
    info!(target = %ctx.target_path.display(), bytes = total, "download complete");
    Ok(())
}

/// Probe the resource, retrying transient failures up to `retry_times`.
/// A permanent cause (4xx, missing file, bad URL) surfaces immediately.
fn probe_with_retries(
    transport: &dyn RangedTransport,
    url: &str,
    retry_times: u32,
) -> Result<ResourceInfo> {
    let mut last_error = None;
    for attempt in 0..=retry_times {
        match transport.probe(url) {
            Ok(info) => return Ok(info),
            Err(e) => {
                let transient = matches!(
                    e,
                    DownloadError::FetchFileInfo {
                        transient: true,
                        ..
                    }
                );
                warn!(url, attempt, transient, error = %e, "probe failed");
                last_error = Some(e);
                if !transient {
                    break;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| DownloadError::FetchFileInfo {
        url: url.to_string(),
        reason: "probe failed".to_string(),
        transient: false,
    }))
}

/// Decide between resuming from an existing index and starting fresh.
///
/// Returns the slice layout, the opened data file and the creation
/// timestamp to carry forward into index writes.
fn prepare_resumption(
    ctx: &SessionContext,
    info: &ResourceInfo,
    tmp_path: &Path,
    store: &IndexStore,
) -> Result<(Vec<Slice>, TargetFile, i64)> {
    let probe_total = info.total_size.unwrap_or(-1);
    let now_ms = chrono::Utc::now().timestamp_millis();

    match store.load() {
        Ok(Some(record)) => {
            let expired = ctx
                .options
                .tmp_file_expiration
                .map(|expiry| record.is_expired(expiry, now_ms))
                .unwrap_or(false);

            if expired {
                warn!(
                    code = DownloadCode::TmpFileExpired.as_str(),
                    "temp artifacts expired, starting fresh"
                );
                store.remove()?;
            } else if !record.matches_url(&ctx.url) && !record.matches_url(&info.effective_url) {
                return Err(DownloadError::UrlDifferent {
                    index_url: record.origin_url,
                    request_url: ctx.url.clone(),
                });
            } else if record.total_size != probe_total {
                return Err(DownloadError::TmpFileSize {
                    expected: record.total_size,
                    actual: probe_total,
                });
            } else if !tmp_path.exists() {
                debug!("index without data file, starting fresh");
                store.remove()?;
            } else if !info.accepts_ranges
                && !record.slices.iter().all(|s| s.end >= 0 && s.downloaded == s.end - s.begin)
            {
                // Without range support there is no way to refill the gaps.
                debug!("server refuses ranges, discarding partial progress");
                store.remove()?;
            } else {
                let target = TargetFile::open(tmp_path).map_err(|e| DownloadError::OpenTmpFile {
                    path: tmp_path.to_path_buf(),
                    source: e,
                })?;
                if probe_total >= 0 {
                    let len = target.len().map_err(|e| DownloadError::OpenTmpFile {
                        path: tmp_path.to_path_buf(),
                        source: e,
                    })? as i64;
                    if len != probe_total {
                        return Err(DownloadError::TmpFileSize {
                            expected: probe_total,
                            actual: len,
                        });
                    }
                }
                let slices = slice::reconcile(
                    &record,
                    ctx.options.slice_policy,
                    ctx.options.uncompleted_slice_save_policy,
                    ctx.options.thread_num,
                );
                info!(
                    slices = slices.len(),
                    resumed_bytes = slice::total_downloaded(&slices),
                    "resuming from index"
                );
                return Ok((slices, target, record.created_at));
            }
        }
        Ok(None) => {}
        Err(e @ DownloadError::InvalidIndexFormat(_)) => {
            warn!(error = %e, "discarding unreadable index");
            store.remove()?;
        }
        Err(e) => return Err(e),
    }

    // Fresh start.
    let _ = fs::remove_file(tmp_path);
    let slices = if info.accepts_ranges && probe_total >= 0 {
        slice::plan_slices(probe_total, ctx.options.slice_policy, ctx.options.thread_num)
    } else {
        slice::single_slice((probe_total >= 0).then_some(probe_total))
    };
    let target = TargetFile::create(tmp_path, (probe_total >= 0).then_some(probe_total as u64))
        .map_err(|e| DownloadError::CreateTmpFile {
            path: tmp_path.to_path_buf(),
            source: e,
        })?;

    // Persist the initial layout so a crash at any point can resume.
    store.write(&crate::index::IndexRecord {
        version: INDEX_VERSION,
        origin_url: ctx.url.clone(),
        effective_url: info.effective_url.clone(),
        total_size: probe_total,
        created_at: now_ms,
        updated_at: now_ms,
        slice_policy: ctx.options.slice_policy.kind(),
        policy_value: ctx.options.slice_policy.value(),
        slices: slices.iter().map(|s| s.to_record()).collect(),
    })?;

    Ok((slices, target, now_ms))
}

/// Post-transfer verification: Content-MD5 when enabled, then the
/// configured hash policy.
fn verify(
    options: &DownloadOptions,
    info: &ResourceInfo,
    probe_total: i64,
    tmp_path: &Path,
) -> Result<()> {
    if options.content_md5 {
        if let Some(expected) = &info.content_md5 {
            let actual = digest_file(tmp_path, HashType::Md5)?;
            if !digests_match(&actual, expected) {
                return Err(DownloadError::HashMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("content-md5 verified");
        }
    }

    if let Some(hash_verify) = &options.hash_verify {
        let applies = match hash_verify.policy {
            HashVerifyPolicy::AlwaysVerify => true,
            HashVerifyPolicy::OnlyNoFileSize => probe_total < 0,
        };
        if applies {
            let expected = hash_verify.expected.trim();
            let actual = digest_file(tmp_path, hash_verify.hash_type)?;
            if !digests_match(&actual, expected) {
                return Err(DownloadError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!("content hash verified");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_paths() {
        let target = Path::new("/tmp/dir/archive.zip");
        assert_eq!(
            tmp_file_path(target),
            PathBuf::from("/tmp/dir/archive.zip.downpour.tmp")
        );
        assert_eq!(
            index_file_path(target),
            PathBuf::from("/tmp/dir/archive.zip.downpour.idx")
        );
    }

    #[test]
    fn test_initial_state() {
        let downloader = Downloader::new();
        assert_eq!(downloader.state(), DownloadState::Stopped);
        assert_eq!(downloader.origin_file_size(), -1);
        assert!(downloader.future_result().is_none());
    }

    #[test]
    fn test_start_rejects_bad_scheme() {
        let mut downloader = Downloader::new();
        let err = downloader
            .start("ftp://example.com/f", "/tmp/f", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadCode::InvalidUrl);
        assert_eq!(downloader.state(), DownloadState::Stopped);
    }

    #[test]
    fn test_start_rejects_unparseable_url() {
        let mut downloader = Downloader::new();
        let err = downloader
            .start("not a url", "/tmp/f", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadCode::InvalidUrl);
    }

    #[test]
    fn test_start_rejects_invalid_options() {
        let mut downloader =
            Downloader::with_options(DownloadOptions::default().with_thread_num(0));
        let err = downloader
            .start("http://example.com/f", "/tmp/f", None, None, None)
            .unwrap_err();
        assert_eq!(err.code(), DownloadCode::InvalidThreadNum);
    }

    #[test]
    fn test_pause_resume_noop_when_stopped() {
        let downloader = Downloader::new();
        downloader.pause();
        assert_eq!(downloader.state(), DownloadState::Stopped);
        downloader.resume();
        assert_eq!(downloader.state(), DownloadState::Stopped);
        downloader.stop();
        assert_eq!(downloader.state(), DownloadState::Stopped);
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new(DownloadState::Stopped);
        assert!(cell.transition(DownloadState::Stopped, DownloadState::Downloading));
        assert!(!cell.transition(DownloadState::Stopped, DownloadState::Downloading));
        assert!(cell.transition(DownloadState::Downloading, DownloadState::Paused));
        assert_eq!(cell.get(), DownloadState::Paused);
    }
}
