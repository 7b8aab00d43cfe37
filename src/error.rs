//! Error types and result codes for download operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Terminal result code of a download session.
///
/// This is a closed enumeration: every way a session can end maps to exactly
/// one code, and every code has a stable string form (see [`as_str`]). The
/// shared result future and the result callback both resolve to a code.
///
/// [`as_str`]: DownloadCode::as_str
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadCode {
    /// The download completed and the target file passed verification.
    Success,
    /// An unexpected internal error occurred.
    UnknownError,
    /// The provided URL is not a valid http, https or file URL.
    InvalidUrl,
    /// The sidecar index file could not be decoded.
    InvalidIndexFormat,
    /// The target file path is invalid.
    InvalidTargetFilePath,
    /// The configured thread count is out of range.
    InvalidThreadNum,
    /// The configured hash verification policy is invalid.
    InvalidHashPolicy,
    /// The configured slice policy is invalid.
    InvalidSlicePolicy,
    /// The configured network connection timeout is invalid.
    InvalidNetworkConnTimeout,
    /// The configured network read timeout is invalid.
    InvalidNetworkReadTimeout,
    /// The configured probe retry count is invalid.
    InvalidFetchFileInfoRetryTimes,
    /// `start()` was called while a download was already in progress.
    AlreadyDownloading,
    /// The download was canceled by `stop()` or the external stop event.
    Canceled,
    /// Renaming the temporary data file to the target path failed.
    RenameTmpFileFailed,
    /// The sidecar index file could not be opened or read.
    OpenIndexFileFailed,
    /// The temporary data file outlived its configured expiry.
    TmpFileExpired,
    /// The temporary data file could not be created.
    CreateTmpFileFailed,
    /// An existing temporary data file could not be opened.
    OpenTmpFileFailed,
    /// The URL in the index file does not match the requested URL.
    UrlDifferent,
    /// The temporary data file size disagrees with the index record.
    TmpFileSizeError,
    /// Flushing buffered bytes to the temporary data file failed.
    FlushTmpFileFailed,
    /// Writing the sidecar index file failed.
    UpdateIndexFileFailed,
    /// A slice exhausted its retry budget or failed permanently.
    SliceDownloadFailed,
    /// The downloaded content does not match the expected digest.
    HashVerifyNotPass,
    /// The target file could not be digested.
    CalculateHashFailed,
    /// Probing the resource metadata failed after all retries.
    FetchFileInfoFailed,
    /// The effective URL drifted between slices with redirect checking on.
    RedirectUrlDifferent,
}

impl DownloadCode {
    /// Stable human-readable string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidIndexFormat => "INVALID_INDEX_FORMAT",
            Self::InvalidTargetFilePath => "INVALID_TARGET_FILE_PATH",
            Self::InvalidThreadNum => "INVALID_THREAD_NUM",
            Self::InvalidHashPolicy => "INVALID_HASH_POLICY",
            Self::InvalidSlicePolicy => "INVALID_SLICE_POLICY",
            Self::InvalidNetworkConnTimeout => "INVALID_NETWORK_CONN_TIMEOUT",
            Self::InvalidNetworkReadTimeout => "INVALID_NETWORK_READ_TIMEOUT",
            Self::InvalidFetchFileInfoRetryTimes => "INVALID_FETCH_FILE_INFO_RETRY_TIMES",
            Self::AlreadyDownloading => "ALREADY_DOWNLOADING",
            Self::Canceled => "CANCELED",
            Self::RenameTmpFileFailed => "RENAME_TMP_FILE_FAILED",
            Self::OpenIndexFileFailed => "OPEN_INDEX_FILE_FAILED",
            Self::TmpFileExpired => "TMP_FILE_EXPIRED",
            Self::CreateTmpFileFailed => "CREATE_TMP_FILE_FAILED",
            Self::OpenTmpFileFailed => "OPEN_TMP_FILE_FAILED",
            Self::UrlDifferent => "URL_DIFFERENT",
            Self::TmpFileSizeError => "TMP_FILE_SIZE_ERROR",
            Self::FlushTmpFileFailed => "FLUSH_TMP_FILE_FAILED",
            Self::UpdateIndexFileFailed => "UPDATE_INDEX_FILE_FAILED",
            Self::SliceDownloadFailed => "SLICE_DOWNLOAD_FAILED",
            Self::HashVerifyNotPass => "HASH_VERIFY_NOT_PASS",
            Self::CalculateHashFailed => "CALCULATE_HASH_FAILED",
            Self::FetchFileInfoFailed => "FETCH_FILE_INFO_FAILED",
            Self::RedirectUrlDifferent => "REDIRECT_URL_DIFFERENT",
        }
    }

    /// Whether this code represents a successful download.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for DownloadCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during a download session.
///
/// Each variant carries enough context for diagnostics and maps onto exactly
/// one [`DownloadCode`] via [`code`](DownloadError::code).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid target file path: {}", .0.display())]
    InvalidTargetPath(PathBuf),

    #[error("invalid thread count {0}, must be within 1..=100")]
    InvalidThreadNum(u32),

    #[error("invalid hash verification policy: {0}")]
    InvalidHashPolicy(String),

    #[error("invalid slice policy: {0}")]
    InvalidSlicePolicy(String),

    #[error("invalid network connection timeout: {0} ms")]
    InvalidConnectionTimeout(u64),

    #[error("invalid network read timeout: {0} ms")]
    InvalidReadTimeout(u64),

    #[error("invalid probe retry count: {0}")]
    InvalidProbeRetryTimes(u32),

    #[error("a download is already in progress")]
    AlreadyDownloading,

    #[error("download canceled")]
    Canceled,

    #[error("failed to fetch file info from {url}: {reason}")]
    FetchFileInfo {
        url: String,
        reason: String,
        /// Whether retrying the probe can help (socket errors, 5xx). A
        /// permanent cause (4xx, missing file) fails fast.
        transient: bool,
    },

    #[error("redirected url changed mid-download: expected {expected}, got {actual}")]
    RedirectDrift { expected: String, actual: String },

    #[error("slice {slice} download failed: {reason}")]
    SliceDownload { slice: usize, reason: String },

    #[error("throughput stayed below {threshold} B/s for {duration_secs} s")]
    SpeedTooLow { threshold: u64, duration_secs: u64 },

    #[error("failed to create temp file {}: {source}", .path.display())]
    CreateTmpFile { path: PathBuf, source: io::Error },

    #[error("failed to open temp file {}: {source}", .path.display())]
    OpenTmpFile { path: PathBuf, source: io::Error },

    #[error("failed to flush temp file {}: {source}", .path.display())]
    FlushTmpFile { path: PathBuf, source: io::Error },

    #[error("failed to rename temp file to {}: {source}", .to.display())]
    RenameTmpFile { to: PathBuf, source: io::Error },

    #[error("failed to open index file {}: {source}", .path.display())]
    OpenIndexFile { path: PathBuf, source: io::Error },

    #[error("failed to update index file {}: {source}", .path.display())]
    UpdateIndexFile { path: PathBuf, source: io::Error },

    #[error("invalid index file format: {0}")]
    InvalidIndexFormat(String),

    #[error("index url mismatch: index has {index_url}, requested {request_url}")]
    UrlDifferent {
        index_url: String,
        request_url: String,
    },

    #[error("temp file size mismatch: expected {expected}, found {actual}")]
    TmpFileSize { expected: i64, actual: i64 },

    #[error("temp file expired")]
    TmpFileExpired,

    #[error("hash verification failed: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("failed to calculate hash of {}: {source}", .path.display())]
    CalculateHash { path: PathBuf, source: io::Error },

    #[error("{0}")]
    Unknown(String),
}

impl DownloadError {
    /// The stable result code this error surfaces as.
    pub fn code(&self) -> DownloadCode {
        match self {
            Self::InvalidUrl(_) => DownloadCode::InvalidUrl,
            Self::InvalidTargetPath(_) => DownloadCode::InvalidTargetFilePath,
            Self::InvalidThreadNum(_) => DownloadCode::InvalidThreadNum,
            Self::InvalidHashPolicy(_) => DownloadCode::InvalidHashPolicy,
            Self::InvalidSlicePolicy(_) => DownloadCode::InvalidSlicePolicy,
            Self::InvalidConnectionTimeout(_) => DownloadCode::InvalidNetworkConnTimeout,
            Self::InvalidReadTimeout(_) => DownloadCode::InvalidNetworkReadTimeout,
            Self::InvalidProbeRetryTimes(_) => DownloadCode::InvalidFetchFileInfoRetryTimes,
            Self::AlreadyDownloading => DownloadCode::AlreadyDownloading,
            Self::Canceled => DownloadCode::Canceled,
            Self::FetchFileInfo { .. } => DownloadCode::FetchFileInfoFailed,
            Self::RedirectDrift { .. } => DownloadCode::RedirectUrlDifferent,
            Self::SliceDownload { .. } => DownloadCode::SliceDownloadFailed,
            Self::SpeedTooLow { .. } => DownloadCode::SliceDownloadFailed,
            Self::CreateTmpFile { .. } => DownloadCode::CreateTmpFileFailed,
            Self::OpenTmpFile { .. } => DownloadCode::OpenTmpFileFailed,
            Self::FlushTmpFile { .. } => DownloadCode::FlushTmpFileFailed,
            Self::RenameTmpFile { .. } => DownloadCode::RenameTmpFileFailed,
            Self::OpenIndexFile { .. } => DownloadCode::OpenIndexFileFailed,
            Self::UpdateIndexFile { .. } => DownloadCode::UpdateIndexFileFailed,
            Self::InvalidIndexFormat(_) => DownloadCode::InvalidIndexFormat,
            Self::UrlDifferent { .. } => DownloadCode::UrlDifferent,
            Self::TmpFileSize { .. } => DownloadCode::TmpFileSizeError,
            Self::TmpFileExpired => DownloadCode::TmpFileExpired,
            Self::HashMismatch { .. } => DownloadCode::HashVerifyNotPass,
            Self::CalculateHash { .. } => DownloadCode::CalculateHashFailed,
            Self::Unknown(_) => DownloadCode::UnknownError,
        }
    }
}
