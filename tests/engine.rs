//! End-to-end engine tests.
//!
//! Real downloads run over `file://` URLs; failure injection, cancellation
//! latency and speed governance use scripted in-memory transports plugged
//! in through the public transport seam.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use downpour::index::{IndexRecord, IndexStore, SliceRecord, INDEX_VERSION};
use downpour::speed::SpeedLimiter;
use downpour::{
    index_file_path, tmp_file_path, ByteSink, DownloadCode, DownloadError, DownloadEvent,
    DownloadOptions, DownloadState, Downloader, FetchOutcome, FetchRange, HashType,
    HashVerifyPolicy, RangedTransport, ResourceInfo, SlicePolicy, TerminalCause,
    TransferControls, UncompletedSliceSavePolicy,
};

/// Deterministic pseudo-random content.
fn make_content(len: usize) -> Vec<u8> {
    let mut state = 0x2545F491u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

fn write_source(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn sha256_hex(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(content))
}

/// Scripted in-memory transport for failure injection and pacing.
struct MemTransport {
    content: Vec<u8>,
    report_size: bool,
    accepts_ranges: bool,
    /// Total bytes served across all fetches.
    served: AtomicU64,
    /// Stop serving (with the given cause kind) once this many bytes went
    /// out.
    fail_after: Option<u64>,
    fail_permanently: bool,
    /// Report redirect drift for any fetch that does not start at zero.
    drift_on_resume: bool,
    /// Bytes per sink delivery.
    chunk: usize,
    /// Sleep between deliveries.
    delay: Duration,
    /// Honor the per-connection speed cap.
    throttled: bool,
}

impl MemTransport {
    fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            report_size: true,
            accepts_ranges: true,
            served: AtomicU64::new(0),
            fail_after: None,
            fail_permanently: false,
            drift_on_resume: false,
            chunk: 16 * 1024,
            delay: Duration::ZERO,
            throttled: false,
        }
    }

    fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl RangedTransport for MemTransport {
    fn probe(&self, url: &str) -> downpour::Result<ResourceInfo> {
        Ok(ResourceInfo {
            effective_url: url.to_string(),
            total_size: self.report_size.then_some(self.content.len() as i64),
            accepts_ranges: self.accepts_ranges,
            content_md5: None,
        })
    }

    fn fetch(
        &self,
        _url: &str,
        range: FetchRange,
        sink: &mut dyn ByteSink,
        controls: &TransferControls,
    ) -> FetchOutcome {
        if self.drift_on_resume && range.begin > 0 {
            return FetchOutcome::new(
                0,
                TerminalCause::RedirectDrift {
                    expected: "http://origin/resource".to_string(),
                    actual: "http://elsewhere/resource".to_string(),
                },
            );
        }

        let begin = range.begin.max(0) as usize;
        let end = range
            .end
            .map(|e| e as usize)
            .unwrap_or(self.content.len())
            .min(self.content.len());
        let mut limiter = self
            .throttled
            .then(|| SpeedLimiter::new(controls.speed_cap_handle()));

        let mut written = 0u64;
        let mut cursor = begin;
        while cursor < end {
            if controls.should_stop() {
                return FetchOutcome::new(written, TerminalCause::Canceled);
            }
            if controls.should_suspend() {
                return FetchOutcome::new(written, TerminalCause::Suspended);
            }
            if let Some(budget) = self.fail_after {
                if self.served.load(Ordering::Relaxed) >= budget {
                    let cause = if self.fail_permanently {
                        TerminalCause::Permanent("scripted failure".to_string())
                    } else {
                        TerminalCause::Transient("scripted failure".to_string())
                    };
                    return FetchOutcome::new(written, cause);
                }
            }

            let take = self.chunk.min(end - cursor);
            if let Err(e) = sink.accept(&self.content[cursor..cursor + take]) {
                return FetchOutcome::new(written, TerminalCause::SinkError(e.to_string()));
            }
            cursor += take;
            written += take as u64;
            self.served.fetch_add(take as u64, Ordering::Relaxed);
            if let Some(limiter) = limiter.as_mut() {
                limiter.throttle(take as u64);
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }

        match range.end {
            Some(_) => FetchOutcome::new(written, TerminalCause::RangeComplete),
            None => FetchOutcome::new(written, TerminalCause::Eof),
        }
    }
}

/// Transport whose probe always fails, counting the attempts.
struct FailingProbeTransport {
    attempts: AtomicU64,
    transient: bool,
}

impl RangedTransport for FailingProbeTransport {
    fn probe(&self, url: &str) -> downpour::Result<ResourceInfo> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(DownloadError::FetchFileInfo {
            url: url.to_string(),
            reason: "scripted probe failure".to_string(),
            transient: self.transient,
        })
    }

    fn fetch(
        &self,
        _url: &str,
        _range: FetchRange,
        _sink: &mut dyn ByteSink,
        _controls: &TransferControls,
    ) -> FetchOutcome {
        unreachable!("probe never succeeds")
    }
}

#[test]
fn test_file_scheme_multi_slice_download() {
    let dir = TempDir::new().unwrap();
    let content = make_content(1_000_000);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("out/target.bin");

    let options = DownloadOptions::default()
        .with_thread_num(4)
        .with_slice_policy(SlicePolicy::FixedNum(4));
    let mut downloader = Downloader::with_options(options);

    let result = downloader
        .start(&file_url(&source), &target, None, None, None)
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(downloader.state(), DownloadState::Stopped);
    assert_eq!(downloader.origin_file_size(), 1_000_000);

    assert_eq!(fs::read(&target).unwrap(), content);
    assert!(!tmp_file_path(&target).exists(), "temp file must be renamed");
    assert!(!index_file_path(&target).exists(), "index must be deleted");
}

#[test]
fn test_zero_byte_download() {
    let dir = TempDir::new().unwrap();
    let source = write_source(&dir, "empty.bin", b"");
    let target = dir.path().join("empty.out");

    let mut downloader = Downloader::new();
    let result = downloader
        .start(&file_url(&source), &target, None, None, None)
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(fs::read(&target).unwrap(), b"");
}

#[test]
fn test_progress_reaches_total() {
    let dir = TempDir::new().unwrap();
    let content = make_content(300_000);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("target.bin");

    let seen = Arc::new(AtomicU64::new(0));
    let seen_cb = Arc::clone(&seen);

    let mut downloader = Downloader::with_options(
        DownloadOptions::default()
            .with_thread_num(2)
            .with_slice_policy(SlicePolicy::FixedSize(100_000)),
    );
    let result = downloader
        .start(
            &file_url(&source),
            &target,
            None,
            Some(Box::new(move |_total, downloaded| {
                seen_cb.store(downloaded as u64, Ordering::Relaxed);
            })),
            None,
        )
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(seen.load(Ordering::Relaxed), 300_000);
}

#[test]
fn test_unknown_size_single_slice() {
    let dir = TempDir::new().unwrap();
    let content = make_content(123_456);
    let target = dir.path().join("unknown.bin");

    let mut transport = MemTransport::new(content.clone());
    transport.report_size = false;
    transport.accepts_ranges = false;

    let mut downloader = Downloader::with_options(
        DownloadOptions::default()
            .with_thread_num(4)
            .with_slice_policy(SlicePolicy::FixedNum(4)),
    );
    downloader.set_transport(Arc::new(transport));

    let result = downloader
        .start("http://mock/unknown.bin", &target, None, None, None)
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(fs::read(&target).unwrap(), content);
    assert_eq!(downloader.origin_file_size(), 123_456);
}

#[test]
fn test_hash_mismatch_keeps_artifacts() {
    let dir = TempDir::new().unwrap();
    let content = make_content(1_048_576);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("target.bin");

    // SHA-256 of the empty string never matches real content.
    let mut downloader = Downloader::with_options(DownloadOptions::default().with_hash_verify(
        HashVerifyPolicy::AlwaysVerify,
        HashType::Sha256,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
    ));

    let result = downloader
        .start(&file_url(&source), &target, None, None, None)
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::HashVerifyNotPass);
    assert!(!target.exists(), "mismatched file must not be renamed");
    assert!(
        tmp_file_path(&target).exists(),
        "artifacts stay for inspection"
    );
}

#[test]
fn test_hash_verify_passes() {
    let dir = TempDir::new().unwrap();
    let content = make_content(200_000);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("target.bin");

    // Uppercase digest: comparison is case-insensitive.
    let expected = sha256_hex(&content).to_uppercase();
    let mut downloader = Downloader::with_options(DownloadOptions::default().with_hash_verify(
        HashVerifyPolicy::AlwaysVerify,
        HashType::Sha256,
        expected,
    ));

    let result = downloader
        .start(&file_url(&source), &target, None, None, None)
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(fs::read(&target).unwrap(), content);
}

#[test]
fn test_resume_after_slice_failure() {
    let dir = TempDir::new().unwrap();
    let content = make_content(1_000_000);
    let target = dir.path().join("resumable.bin");

    let options = DownloadOptions::default()
        .with_slice_policy(SlicePolicy::FixedNum(4))
        .with_uncompleted_slice_save_policy(UncompletedSliceSavePolicy::SaveExceptFailed);

    // First run dies permanently after ~300 KB.
    let mut failing = MemTransport::new(content.clone());
    failing.fail_after = Some(300_000);
    failing.fail_permanently = true;

    let mut downloader = Downloader::with_options(options.clone());
    downloader.set_transport(Arc::new(failing));
    let result = downloader
        .start("http://mock/resumable.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::SliceDownloadFailed);
    assert!(index_file_path(&target).exists(), "progress persists");

    // Second run with a healthy transport resumes instead of refetching.
    let healthy = Arc::new(MemTransport::new(content.clone()));
    let mut downloader = Downloader::with_options(options);
    downloader.set_transport(Arc::clone(&healthy) as Arc<dyn RangedTransport>);
    let result = downloader
        .start("http://mock/resumable.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::Success);

    assert_eq!(fs::read(&target).unwrap(), content);
    assert!(
        healthy.served() < 1_000_000,
        "resumed run refetched the whole file ({} bytes)",
        healthy.served()
    );
}

#[test]
fn test_redirect_drift_fails_download() {
    let dir = TempDir::new().unwrap();
    let content = make_content(400_000);
    let target = dir.path().join("drift.bin");

    let mut transport = MemTransport::new(content);
    transport.drift_on_resume = true;

    let mut downloader = Downloader::with_options(
        DownloadOptions::default()
            .with_thread_num(2)
            .with_slice_policy(SlicePolicy::FixedNum(4)),
    );
    downloader.set_transport(Arc::new(transport));

    let result = downloader
        .start("http://mock/drift.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::RedirectUrlDifferent);
}

#[test]
fn test_stop_resolves_canceled_quickly() {
    let dir = TempDir::new().unwrap();
    let content = make_content(10_000_000);
    let target = dir.path().join("canceled.bin");

    let mut transport = MemTransport::new(content);
    transport.chunk = 8 * 1024;
    transport.delay = Duration::from_millis(20);

    let mut downloader = Downloader::new();
    downloader.set_transport(Arc::new(transport));
    let result = downloader
        .start("http://mock/canceled.bin", &target, None, None, None)
        .unwrap();

    std::thread::sleep(Duration::from_millis(150));
    let stop_at = Instant::now();
    downloader.stop();

    assert_eq!(result.wait(), DownloadCode::Canceled);
    assert!(
        stop_at.elapsed() < Duration::from_secs(2),
        "cancellation latency {:?}",
        stop_at.elapsed()
    );
    assert_eq!(downloader.state(), DownloadState::Stopped);
}

#[test]
fn test_external_stop_event() {
    let dir = TempDir::new().unwrap();
    let content = make_content(10_000_000);
    let target = dir.path().join("event.bin");

    let event = DownloadEvent::new();
    let mut transport = MemTransport::new(content);
    transport.chunk = 8 * 1024;
    transport.delay = Duration::from_millis(10);

    let mut downloader =
        Downloader::with_options(DownloadOptions::default().with_stop_event(event.clone()));
    downloader.set_transport(Arc::new(transport));
    let result = downloader
        .start("http://mock/event.bin", &target, None, None, None)
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    event.set();

    assert_eq!(result.wait(), DownloadCode::Canceled);
}

#[test]
fn test_pause_then_resume_completes() {
    let dir = TempDir::new().unwrap();
    let content = make_content(4_000_000);
    let target = dir.path().join("paused.bin");

    let mut transport = MemTransport::new(content.clone());
    transport.chunk = 16 * 1024;
    transport.delay = Duration::from_millis(10);

    let mut downloader = Downloader::with_options(
        DownloadOptions::default()
            .with_thread_num(2)
            .with_slice_policy(SlicePolicy::FixedNum(2)),
    );
    downloader.set_transport(Arc::new(transport));
    let result = downloader
        .start("http://mock/paused.bin", &target, None, None, None)
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    downloader.pause();
    assert_eq!(downloader.state(), DownloadState::Paused);
    assert!(result.peek().is_none(), "pause must not resolve the future");

    std::thread::sleep(Duration::from_millis(200));
    downloader.resume();
    assert_eq!(downloader.state(), DownloadState::Downloading);

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(fs::read(&target).unwrap(), content);
}

#[test]
fn test_start_while_downloading_is_rejected() {
    let dir = TempDir::new().unwrap();
    let content = make_content(5_000_000);
    let target = dir.path().join("busy.bin");

    let mut transport = MemTransport::new(content);
    transport.chunk = 8 * 1024;
    transport.delay = Duration::from_millis(10);

    let mut downloader = Downloader::new();
    downloader.set_transport(Arc::new(transport));
    let result = downloader
        .start("http://mock/busy.bin", &target, None, None, None)
        .unwrap();

    let err = downloader
        .start("http://mock/busy.bin", &target, None, None, None)
        .unwrap_err();
    assert_eq!(err.code(), DownloadCode::AlreadyDownloading);

    downloader.stop();
    result.wait();
}

#[test]
fn test_speed_cap_limits_throughput() {
    let dir = TempDir::new().unwrap();
    let content = make_content(120_000);
    let target = dir.path().join("capped.bin");

    let mut transport = MemTransport::new(content.clone());
    transport.throttled = true;
    transport.chunk = 4 * 1024;

    let mut downloader =
        Downloader::with_options(DownloadOptions::default().with_max_download_speed(60_000));
    downloader.set_transport(Arc::new(transport));

    let start = Instant::now();
    let result = downloader
        .start("http://mock/capped.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::Success);

    // 120 KB at 60 KB/s must take at least ~1.5s.
    assert!(
        start.elapsed() >= Duration::from_millis(1500),
        "finished too fast: {:?}",
        start.elapsed()
    );
    assert_eq!(fs::read(&target).unwrap(), content);
}

#[test]
fn test_min_speed_watchdog_fails_session() {
    let dir = TempDir::new().unwrap();
    let content = make_content(50_000_000);
    let target = dir.path().join("slow.bin");

    // ~10 KB/s actual against a 1 MB/s floor held for 2 seconds.
    let mut transport = MemTransport::new(content);
    transport.chunk = 1024;
    transport.delay = Duration::from_millis(100);

    let mut downloader = Downloader::with_options(
        DownloadOptions::default().with_min_download_speed(1_000_000, 2),
    );
    downloader.set_transport(Arc::new(transport));

    let start = Instant::now();
    let result = downloader
        .start("http://mock/slow.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::SliceDownloadFailed);
    assert!(
        start.elapsed() < Duration::from_secs(15),
        "watchdog too slow: {:?}",
        start.elapsed()
    );
}

#[test]
fn test_permanent_probe_failure_fails_fast() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("probe.bin");

    let transport = Arc::new(FailingProbeTransport {
        attempts: AtomicU64::new(0),
        transient: false,
    });
    let mut downloader = Downloader::with_options(
        DownloadOptions::default().with_fetch_file_info_retry_times(3),
    );
    downloader.set_transport(Arc::clone(&transport) as Arc<dyn RangedTransport>);

    let result = downloader
        .start("http://mock/probe.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::FetchFileInfoFailed);
    assert_eq!(
        transport.attempts.load(Ordering::Relaxed),
        1,
        "a permanent probe failure must not be retried"
    );
}

#[test]
fn test_transient_probe_failure_uses_retry_budget() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("probe.bin");

    let transport = Arc::new(FailingProbeTransport {
        attempts: AtomicU64::new(0),
        transient: true,
    });
    let mut downloader = Downloader::with_options(
        DownloadOptions::default().with_fetch_file_info_retry_times(3),
    );
    downloader.set_transport(Arc::clone(&transport) as Arc<dyn RangedTransport>);

    let result = downloader
        .start("http://mock/probe.bin", &target, None, None, None)
        .unwrap();
    assert_eq!(result.wait(), DownloadCode::FetchFileInfoFailed);
    assert_eq!(transport.attempts.load(Ordering::Relaxed), 4);
}

#[test]
fn test_corrupt_index_triggers_fresh_start() {
    let dir = TempDir::new().unwrap();
    let content = make_content(100_000);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("target.bin");

    fs::write(index_file_path(&target), b"not an index file").unwrap();
    fs::write(tmp_file_path(&target), b"stale data").unwrap();

    let mut downloader = Downloader::new();
    let result = downloader
        .start(&file_url(&source), &target, None, None, None)
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    assert_eq!(fs::read(&target).unwrap(), content);
}

#[test]
fn test_foreign_index_url_aborts() {
    let dir = TempDir::new().unwrap();
    let content = make_content(100_000);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("target.bin");
    let url = file_url(&source);

    // An index claiming a different origin, next to a plausible data file.
    fs::write(tmp_file_path(&target), vec![0u8; 100_000]).unwrap();
    IndexStore::new(index_file_path(&target))
        .write(&IndexRecord {
            version: INDEX_VERSION,
            origin_url: "http://someone-else/file.bin".to_string(),
            effective_url: "http://someone-else/file.bin".to_string(),
            total_size: 100_000,
            created_at: 0,
            updated_at: 0,
            slice_policy: 1,
            policy_value: 10 * 1024 * 1024,
            slices: vec![SliceRecord {
                begin: 0,
                end: 100_000,
                downloaded: 50_000,
            }],
        })
        .unwrap();

    let mut downloader = Downloader::new();
    let result = downloader.start(&url, &target, None, None, None).unwrap();
    assert_eq!(result.wait(), DownloadCode::UrlDifferent);
}

#[test]
fn test_result_callback_fires_once() {
    let dir = TempDir::new().unwrap();
    let content = make_content(50_000);
    let source = write_source(&dir, "source.bin", &content);
    let target = dir.path().join("target.bin");

    let calls = Arc::new(AtomicU64::new(0));
    let calls_cb = Arc::clone(&calls);

    let mut downloader = Downloader::new();
    let result = downloader
        .start(
            &file_url(&source),
            &target,
            Some(Box::new(move |code| {
                assert_eq!(code, DownloadCode::Success);
                calls_cb.fetch_add(1, Ordering::Relaxed);
            })),
            None,
            None,
        )
        .unwrap();

    assert_eq!(result.wait(), DownloadCode::Success);
    // The callback runs on the coordinator thread right before it exits;
    // a fresh start() would join it, so a short wait is enough here.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}
