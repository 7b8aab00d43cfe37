//! Download session configuration.
//!
//! [`DownloadOptions`] mirrors the full configuration surface of the engine:
//! parallelism, timeouts, retry budgets, slice policy, speed governance,
//! verification policy and transport details. Options are plain data with
//! `with_*` builders; [`DownloadOptions::validate`] is called at `start()`
//! and maps each out-of-range value to its specific invalid-* error.

use std::time::Duration;

use crate::digest::HashType;
use crate::error::{DownloadError, Result};
use crate::event::DownloadEvent;

/// Maximum number of concurrent slice workers.
pub const MAX_THREAD_NUM: u32 = 100;

/// Default disk cache size: 20 MiB, split evenly across active slices.
pub const DEFAULT_DISK_CACHE_SIZE: usize = 20 * 1024 * 1024;

/// Default slice size for the FixedSize policy: 10 MiB.
pub const DEFAULT_SLICE_SIZE: i64 = 10 * 1024 * 1024;

/// How slices are laid out over the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicePolicy {
    /// Heuristic layout based on total size.
    Auto,
    /// Fixed byte length per slice; the last slice is shorter.
    FixedSize(i64),
    /// Fixed number of equal slices; the remainder goes to the last.
    FixedNum(i64),
}

impl SlicePolicy {
    /// Wire encoding used in the index file.
    pub(crate) fn kind(&self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::FixedSize(_) => 1,
            Self::FixedNum(_) => 2,
        }
    }

    /// Policy parameter persisted alongside the kind (0 for Auto).
    pub(crate) fn value(&self) -> i64 {
        match self {
            Self::Auto => 0,
            Self::FixedSize(v) | Self::FixedNum(v) => *v,
        }
    }

    pub(crate) fn from_wire(kind: u8, value: i64) -> Option<Self> {
        match kind {
            0 => Some(Self::Auto),
            1 => Some(Self::FixedSize(value)),
            2 => Some(Self::FixedNum(value)),
            _ => None,
        }
    }
}

/// When the configured hash is checked against the finished file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVerifyPolicy {
    /// Verify after every completed download.
    AlwaysVerify,
    /// Verify only when the server never reported a total size.
    OnlyNoFileSize,
}

/// Expected content digest and when to enforce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashVerify {
    pub policy: HashVerifyPolicy,
    pub hash_type: HashType,
    /// Expected digest, hexadecimal, compared case-insensitively.
    pub expected: String,
}

/// What happens to partially-downloaded slices when progress is persisted
/// with a layout that no longer matches the configured slice policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UncompletedSliceSavePolicy {
    /// Discard partial progress of incomplete slices.
    #[default]
    AlwaysDiscard,
    /// Keep partial progress of every slice that did not fail.
    SaveExceptFailed,
}

/// Minimum-throughput watchdog parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinSpeed {
    /// Threshold in bytes per second.
    pub bytes_per_sec: u64,
    /// Consecutive seconds below the threshold before the session fails.
    pub duration_secs: u64,
}

/// Configuration for a download session.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Number of concurrent slice workers, `1..=100`.
    pub thread_num: u32,
    /// Timeout for connection establishment.
    pub connection_timeout: Duration,
    /// Per-read stall timeout; `None` disables the read watchdog.
    pub read_timeout: Option<Duration>,
    /// Retries for the metadata probe on transient failure.
    pub fetch_file_info_retry_times: u32,
    /// Probe with HEAD when true, with a zero-length ranged GET otherwise.
    pub fetch_file_info_use_head: bool,
    /// Age after which existing temp artifacts are discarded; `None` = never.
    pub tmp_file_expiration: Option<Duration>,
    /// Aggregate download speed cap in bytes/sec; `None` = unlimited.
    /// Ignored for `file://` URLs.
    pub max_download_speed: Option<u64>,
    /// Minimum-throughput watchdog; `None` disables it.
    pub min_download_speed: Option<MinSpeed>,
    /// Write-back cache budget in bytes, split evenly across active slices.
    pub disk_cache_size: usize,
    /// Fail the download if the effective URL drifts between fetches.
    pub redirected_url_check: bool,
    /// Verify the server's `Content-MD5` header (raw hex) when present.
    pub content_md5: bool,
    /// Slice layout policy.
    pub slice_policy: SlicePolicy,
    /// Expected content digest; `None` disables hash verification.
    pub hash_verify: Option<HashVerify>,
    /// Extra request headers, ordered, duplicate keys allowed.
    pub http_headers: Vec<(String, String)>,
    /// Proxy URL, e.g. `http://127.0.0.1:8888`; `None` for direct.
    pub proxy: Option<String>,
    /// Verify the server certificate chain.
    pub verify_ca: bool,
    /// CA bundle path (PEM); used only when `verify_ca` is set.
    pub ca_path: Option<std::path::PathBuf>,
    /// Verify that the certificate matches the host name.
    pub verify_host: bool,
    /// Cookies in Netscape cookie-jar line form.
    pub cookie_list: Option<String>,
    /// Disposition of incomplete slices when persisting progress.
    pub uncompleted_slice_save_policy: UncompletedSliceSavePolicy,
    /// External stop signal; setting it cancels the download.
    pub stop_event: Option<DownloadEvent>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            thread_num: 1,
            connection_timeout: Duration::from_millis(3000),
            read_timeout: None,
            fetch_file_info_retry_times: 1,
            fetch_file_info_use_head: true,
            tmp_file_expiration: None,
            max_download_speed: None,
            min_download_speed: None,
            disk_cache_size: DEFAULT_DISK_CACHE_SIZE,
            redirected_url_check: true,
            content_md5: false,
            slice_policy: SlicePolicy::FixedSize(DEFAULT_SLICE_SIZE),
            hash_verify: None,
            http_headers: Vec::new(),
            proxy: None,
            verify_ca: false,
            ca_path: None,
            verify_host: false,
            cookie_list: None,
            uncompleted_slice_save_policy: UncompletedSliceSavePolicy::default(),
            stop_event: None,
        }
    }
}

impl DownloadOptions {
    /// Create options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of concurrent slice workers.
    pub fn with_thread_num(mut self, thread_num: u32) -> Self {
        self.thread_num = thread_num;
        self
    }

    /// Set the connection-establishment timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the per-read stall timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set probe retry count.
    pub fn with_fetch_file_info_retry_times(mut self, retry_times: u32) -> Self {
        self.fetch_file_info_retry_times = retry_times;
        self
    }

    /// Probe with HEAD (true) or a zero-length ranged GET (false).
    pub fn with_fetch_file_info_use_head(mut self, use_head: bool) -> Self {
        self.fetch_file_info_use_head = use_head;
        self
    }

    /// Discard temp artifacts older than the given age on resumption.
    pub fn with_tmp_file_expiration(mut self, age: Duration) -> Self {
        self.tmp_file_expiration = Some(age);
        self
    }

    /// Cap aggregate download speed in bytes per second.
    pub fn with_max_download_speed(mut self, bytes_per_sec: u64) -> Self {
        self.max_download_speed = Some(bytes_per_sec);
        self
    }

    /// Fail the session when throughput stays below `bytes_per_sec` for
    /// `duration_secs` consecutive seconds. Zero for either value disables
    /// the watchdog.
    pub fn with_min_download_speed(mut self, bytes_per_sec: u64, duration_secs: u64) -> Self {
        self.min_download_speed = (bytes_per_sec > 0 && duration_secs > 0).then_some(MinSpeed {
            bytes_per_sec,
            duration_secs,
        });
        self
    }

    /// Set the write-back cache budget.
    pub fn with_disk_cache_size(mut self, bytes: usize) -> Self {
        self.disk_cache_size = bytes;
        self
    }

    /// Enable or disable redirect drift checking.
    pub fn with_redirected_url_check(mut self, enabled: bool) -> Self {
        self.redirected_url_check = enabled;
        self
    }

    /// Enable or disable `Content-MD5` header verification.
    pub fn with_content_md5(mut self, enabled: bool) -> Self {
        self.content_md5 = enabled;
        self
    }

    /// Set the slice layout policy.
    pub fn with_slice_policy(mut self, policy: SlicePolicy) -> Self {
        self.slice_policy = policy;
        self
    }

    /// Set the expected content digest.
    pub fn with_hash_verify(
        mut self,
        policy: HashVerifyPolicy,
        hash_type: HashType,
        expected: impl Into<String>,
    ) -> Self {
        self.hash_verify = Some(HashVerify {
            policy,
            hash_type,
            expected: expected.into(),
        });
        self
    }

    /// Append a request header; duplicate keys are preserved in order.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.push((key.into(), value.into()));
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Enable certificate chain verification, optionally with a CA bundle.
    pub fn with_verify_ca(mut self, enabled: bool, ca_path: Option<std::path::PathBuf>) -> Self {
        self.verify_ca = enabled;
        self.ca_path = ca_path;
        self
    }

    /// Enable host name verification.
    pub fn with_verify_host(mut self, enabled: bool) -> Self {
        self.verify_host = enabled;
        self
    }

    /// Set cookies in Netscape cookie-jar line form.
    pub fn with_cookie_list(mut self, cookie_list: impl Into<String>) -> Self {
        self.cookie_list = Some(cookie_list.into());
        self
    }

    /// Set the disposition of incomplete slices when persisting progress.
    pub fn with_uncompleted_slice_save_policy(
        mut self,
        policy: UncompletedSliceSavePolicy,
    ) -> Self {
        self.uncompleted_slice_save_policy = policy;
        self
    }

    /// Attach an external stop signal.
    pub fn with_stop_event(mut self, event: DownloadEvent) -> Self {
        self.stop_event = Some(event);
        self
    }

    /// Validate the configuration, mapping each out-of-range value onto its
    /// specific invalid-* error.
    pub fn validate(&self) -> Result<()> {
        if self.thread_num == 0 || self.thread_num > MAX_THREAD_NUM {
            return Err(DownloadError::InvalidThreadNum(self.thread_num));
        }

        if self.connection_timeout.is_zero() {
            return Err(DownloadError::InvalidConnectionTimeout(0));
        }

        if let Some(read_timeout) = self.read_timeout {
            if read_timeout.is_zero() {
                return Err(DownloadError::InvalidReadTimeout(0));
            }
        }

        match self.slice_policy {
            SlicePolicy::Auto => {}
            SlicePolicy::FixedSize(size) if size <= 0 => {
                return Err(DownloadError::InvalidSlicePolicy(format!(
                    "fixed slice size must be positive, got {size}"
                )));
            }
            SlicePolicy::FixedNum(num) if num <= 0 => {
                return Err(DownloadError::InvalidSlicePolicy(format!(
                    "fixed slice count must be positive, got {num}"
                )));
            }
            _ => {}
        }

        if let Some(hash_verify) = &self.hash_verify {
            let expected = hash_verify.expected.trim();
            if expected.len() != hash_verify.hash_type.hex_len()
                || !expected.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(DownloadError::InvalidHashPolicy(format!(
                    "expected a {}-character hex digest, got {:?}",
                    hash_verify.hash_type.hex_len(),
                    hash_verify.expected
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DownloadOptions::default();
        assert_eq!(options.thread_num, 1);
        assert_eq!(options.connection_timeout, Duration::from_millis(3000));
        assert_eq!(options.fetch_file_info_retry_times, 1);
        assert!(options.fetch_file_info_use_head);
        assert!(options.tmp_file_expiration.is_none());
        assert!(options.max_download_speed.is_none());
        assert_eq!(options.disk_cache_size, DEFAULT_DISK_CACHE_SIZE);
        assert!(options.redirected_url_check);
        assert!(!options.content_md5);
        assert_eq!(
            options.slice_policy,
            SlicePolicy::FixedSize(DEFAULT_SLICE_SIZE)
        );
        assert_eq!(
            options.uncompleted_slice_save_policy,
            UncompletedSliceSavePolicy::AlwaysDiscard
        );
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_thread_num_bounds() {
        let options = DownloadOptions::default().with_thread_num(0);
        assert!(matches!(
            options.validate(),
            Err(DownloadError::InvalidThreadNum(0))
        ));

        let options = DownloadOptions::default().with_thread_num(101);
        assert!(options.validate().is_err());

        let options = DownloadOptions::default().with_thread_num(100);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_slice_policy() {
        let options = DownloadOptions::default().with_slice_policy(SlicePolicy::FixedSize(0));
        assert!(matches!(
            options.validate(),
            Err(DownloadError::InvalidSlicePolicy(_))
        ));

        let options = DownloadOptions::default().with_slice_policy(SlicePolicy::FixedNum(-1));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_invalid_hash_policy() {
        let options = DownloadOptions::default().with_hash_verify(
            HashVerifyPolicy::AlwaysVerify,
            HashType::Sha256,
            "not-hex",
        );
        assert!(matches!(
            options.validate(),
            Err(DownloadError::InvalidHashPolicy(_))
        ));

        let options = DownloadOptions::default().with_hash_verify(
            HashVerifyPolicy::AlwaysVerify,
            HashType::Sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_timeouts() {
        let options = DownloadOptions {
            connection_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(DownloadError::InvalidConnectionTimeout(_))
        ));

        let options = DownloadOptions::default().with_read_timeout(Duration::ZERO);
        assert!(matches!(
            options.validate(),
            Err(DownloadError::InvalidReadTimeout(_))
        ));
    }

    #[test]
    fn test_headers_preserve_order_and_duplicates() {
        let options = DownloadOptions::default()
            .with_header("X-Tag", "a")
            .with_header("X-Tag", "b");
        assert_eq!(options.http_headers.len(), 2);
        assert_eq!(options.http_headers[0].1, "a");
        assert_eq!(options.http_headers[1].1, "b");
    }

    #[test]
    fn test_slice_policy_wire_round_trip() {
        for policy in [
            SlicePolicy::Auto,
            SlicePolicy::FixedSize(1024),
            SlicePolicy::FixedNum(4),
        ] {
            let decoded = SlicePolicy::from_wire(policy.kind(), policy.value()).unwrap();
            assert_eq!(decoded, policy);
        }
        assert!(SlicePolicy::from_wire(9, 0).is_none());
    }
}
