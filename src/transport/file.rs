//! `file://` implementation of the ranged transport.
//!
//! Local files trivially support byte ranges; speed caps do not apply, so
//! the fetch loop only honors the stop and suspend signals.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use url::Url;

use super::{
    ByteSink, FetchOutcome, FetchRange, RangedTransport, ResourceInfo, TerminalCause,
    TransferControls,
};
use crate::error::{DownloadError, Result};

/// Read buffer size for streaming fetches (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Ranged transport over local files addressed by `file://` URLs.
#[derive(Debug, Default)]
pub struct FileTransport;

impl FileTransport {
    pub fn new() -> Self {
        Self
    }

    fn resolve(url: &str) -> Result<std::path::PathBuf> {
        let parsed =
            Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;
        if parsed.scheme() != "file" {
            return Err(DownloadError::InvalidUrl(format!(
                "{url}: expected file scheme"
            )));
        }
        parsed
            .to_file_path()
            .map_err(|_| DownloadError::InvalidUrl(format!("{url}: not a local path")))
    }
}

impl RangedTransport for FileTransport {
    fn probe(&self, url: &str) -> Result<ResourceInfo> {
        let path = Self::resolve(url)?;
        // A missing or unreadable local file will not fix itself between
        // attempts.
        let metadata = std::fs::metadata(&path).map_err(|e| DownloadError::FetchFileInfo {
            url: url.to_string(),
            reason: e.to_string(),
            transient: false,
        })?;

        Ok(ResourceInfo {
            effective_url: url.to_string(),
            total_size: Some(metadata.len() as i64),
            accepts_ranges: true,
            content_md5: None,
        })
    }

    fn fetch(
        &self,
        url: &str,
        range: FetchRange,
        sink: &mut dyn ByteSink,
        controls: &TransferControls,
    ) -> FetchOutcome {
        let path = match Self::resolve(url) {
            Ok(path) => path,
            Err(e) => return FetchOutcome::new(0, TerminalCause::Permanent(e.to_string())),
        };

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => return FetchOutcome::new(0, TerminalCause::Transient(e.to_string())),
        };
        if range.begin > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(range.begin as u64)) {
                return FetchOutcome::new(0, TerminalCause::Transient(e.to_string()));
            }
        }

        let want = range.len();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut written = 0u64;

        loop {
            if let Some(cause) = controls.interruption() {
                return FetchOutcome::new(written, cause);
            }
            if want == Some(written) {
                return FetchOutcome::new(written, TerminalCause::RangeComplete);
            }

            let limit = match want {
                Some(w) => (BUFFER_SIZE as u64).min(w - written) as usize,
                None => BUFFER_SIZE,
            };
            let n = match file.read(&mut buffer[..limit]) {
                Ok(n) => n,
                Err(e) => {
                    return FetchOutcome::new(written, TerminalCause::Transient(e.to_string()))
                }
            };

            if n == 0 {
                let cause = match want {
                    None => TerminalCause::Eof,
                    Some(w) if written >= w => TerminalCause::RangeComplete,
                    Some(w) => TerminalCause::Transient(format!(
                        "file ended {} bytes short of range",
                        w - written
                    )),
                };
                return FetchOutcome::new(written, cause);
            }

            if let Err(e) = sink.accept(&buffer[..n]) {
                return FetchOutcome::new(written, TerminalCause::SinkError(e.to_string()));
            }
            written += n as u64;
        }
    }
}
