//! Ranged transport abstraction.
//!
//! The engine consumes remote resources through [`RangedTransport`]: a probe
//! for resource metadata plus a ranged fetch that streams bytes into a sink
//! under cooperative controls (stop, suspend, per-connection speed cap).
//! Implementations exist for HTTP(S) ([`HttpTransport`]) and local files
//! ([`FileTransport`]); tests plug in scripted transports through the same
//! trait.
//!
//! [`HttpTransport`]: http::HttpTransport
//! [`FileTransport`]: file::FileTransport

pub mod file;
pub mod http;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Resource metadata obtained by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// URL after following redirects.
    pub effective_url: String,
    /// Total byte length, when the server reports one.
    pub total_size: Option<i64>,
    /// Whether the server honors byte-range requests.
    pub accepts_ranges: bool,
    /// Server-advertised content digest (`Content-MD5`, raw hex), if any.
    pub content_md5: Option<String>,
}

/// Half-open byte range `[begin, end)` to fetch; `end = None` requests the
/// rest of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub begin: i64,
    pub end: Option<i64>,
}

impl FetchRange {
    pub fn new(begin: i64, end: Option<i64>) -> Self {
        Self { begin, end }
    }

    /// Number of bytes requested, when bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| (end - self.begin).max(0) as u64)
    }

    /// Whether the bounded range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// `Range` header value, or `None` when the request covers the whole
    /// resource from the start.
    pub fn header_value(&self) -> Option<String> {
        match (self.begin, self.end) {
            (0, None) => None,
            (begin, None) => Some(format!("bytes={begin}-")),
            (begin, Some(end)) => Some(format!("bytes={}-{}", begin, end - 1)),
        }
    }
}

/// Why a fetch stopped delivering bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCause {
    /// Every requested byte was delivered.
    RangeComplete,
    /// The resource ended (open-ended request only).
    Eof,
    /// The stop signal was observed.
    Canceled,
    /// The suspend signal was observed (pause).
    Suspended,
    /// The sink refused bytes; carries the write error text.
    SinkError(String),
    /// A retryable transport failure (connect/read errors, 5xx, stalls).
    Transient(String),
    /// A non-retryable transport failure (4xx, unusable resource).
    Permanent(String),
    /// The effective URL changed since the probe.
    RedirectDrift { expected: String, actual: String },
}

/// Result of a fetch: bytes delivered to the sink plus the terminal cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub cause: TerminalCause,
}

impl FetchOutcome {
    pub fn new(bytes_written: u64, cause: TerminalCause) -> Self {
        Self {
            bytes_written,
            cause,
        }
    }
}

/// Receives fetched bytes in ascending offset order.
///
/// `accept` may block (cache back-pressure, flush in progress); the
/// transport must honor that blocking rather than buffer ahead.
pub trait ByteSink {
    fn accept(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Cooperative controls observed by a transport between reads.
///
/// All three signals are shared atomics: the session flips stop/suspend,
/// the scheduler rebalances the per-connection speed cap as the worker
/// count changes, and every transport observes them at each read.
#[derive(Debug, Clone, Default)]
pub struct TransferControls {
    stop: Arc<AtomicBool>,
    suspend: Arc<AtomicBool>,
    speed_cap: Arc<AtomicU64>,
}

impl TransferControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next read boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Request suspension; observed at the next read boundary.
    pub fn request_suspend(&self) {
        self.suspend.store(true, Ordering::Relaxed);
    }

    /// Clear a previous suspension request.
    pub fn clear_suspend(&self) {
        self.suspend.store(false, Ordering::Relaxed);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn should_suspend(&self) -> bool {
        self.suspend.load(Ordering::Relaxed)
    }

    /// Set the per-connection speed cap in bytes/sec (0 = unlimited).
    pub fn set_speed_cap(&self, bytes_per_sec: u64) {
        self.speed_cap.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Handle to the cap for a [`SpeedLimiter`](crate::speed::SpeedLimiter).
    pub fn speed_cap_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.speed_cap)
    }

    /// Terminal cause for the currently-raised signal, if any.
    pub(crate) fn interruption(&self) -> Option<TerminalCause> {
        if self.should_stop() {
            Some(TerminalCause::Canceled)
        } else if self.should_suspend() {
            Some(TerminalCause::Suspended)
        } else {
            None
        }
    }
}

/// Abstract ranged-GET capability.
///
/// `probe` resolves resource metadata; `fetch` streams a byte range into
/// `sink` in strictly ascending offset order, honoring `controls` at every
/// read boundary. A fetch never returns more than the requested range.
pub trait RangedTransport: Send + Sync {
    fn probe(&self, url: &str) -> Result<ResourceInfo>;

    fn fetch(
        &self,
        url: &str,
        range: FetchRange,
        sink: &mut dyn ByteSink,
        controls: &TransferControls,
    ) -> FetchOutcome;
}
