//! HTTP(S) implementation of the ranged transport.
//!
//! Probes with HEAD (or a zero-length ranged GET when HEAD is disabled) and
//! fetches byte ranges with `Range` requests, streaming into the sink with a
//! bounded read buffer. Proxy, TLS policy, cookies, extra headers and
//! timeouts all come from the session options.

use std::fs;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Certificate, Proxy, StatusCode, Url};
use tracing::{debug, warn};

use super::{ByteSink, FetchOutcome, FetchRange, RangedTransport, ResourceInfo, TerminalCause};
use crate::config::DownloadOptions;
use crate::error::{DownloadError, Result};
use crate::speed::SpeedLimiter;
use crate::transport::TransferControls;

/// Read buffer size for streaming fetches (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// HTTP(S) ranged transport backed by a blocking reqwest client.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    use_head: bool,
    redirect_check: bool,
}

impl HttpTransport {
    /// Build a transport from session options.
    pub fn from_options(options: &DownloadOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(options.connection_timeout)
            // No whole-request timeout: slices can legitimately take long.
            .timeout(None::<Duration>)
            .danger_accept_invalid_certs(!options.verify_ca)
            .danger_accept_invalid_hostnames(!options.verify_host);

        if let Some(read_timeout) = options.read_timeout {
            builder = builder.read_timeout(read_timeout);
        }

        if let Some(proxy) = options.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = Proxy::all(proxy)
                .map_err(|e| DownloadError::InvalidUrl(format!("proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        if options.verify_ca {
            if let Some(ca_path) = &options.ca_path {
                let pem = fs::read(ca_path).map_err(|e| {
                    DownloadError::Unknown(format!(
                        "failed to read CA bundle {}: {e}",
                        ca_path.display()
                    ))
                })?;
                for cert in Certificate::from_pem_bundle(&pem).map_err(|e| {
                    DownloadError::Unknown(format!(
                        "failed to parse CA bundle {}: {e}",
                        ca_path.display()
                    ))
                })? {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &options.http_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| DownloadError::Unknown(format!("invalid header {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DownloadError::Unknown(format!("invalid header value: {e}")))?;
            headers.append(name, value);
        }
        if let Some(cookie_list) = options.cookie_list.as_deref() {
            if let Some(cookie_header) = cookie_header_from_netscape(cookie_list) {
                let value = HeaderValue::from_str(&cookie_header)
                    .map_err(|e| DownloadError::Unknown(format!("invalid cookie value: {e}")))?;
                headers.append(reqwest::header::COOKIE, value);
            }
        }
        if !headers.is_empty() {
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|e| DownloadError::Unknown(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            use_head: options.fetch_file_info_use_head,
            redirect_check: options.redirected_url_check,
        })
    }

    fn probe_with_head(&self, url: &str) -> Result<ResourceInfo> {
        // Same classification as the fetch path: socket-level failures and
        // 5xx are worth retrying, anything else is not.
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| DownloadError::FetchFileInfo {
                url: url.to_string(),
                reason: e.to_string(),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::FetchFileInfo {
                url: url.to_string(),
                reason: format!("HEAD request returned {status}"),
                transient: status.is_server_error(),
            });
        }

        Ok(ResourceInfo {
            effective_url: response.url().to_string(),
            total_size: header_i64(&response, CONTENT_LENGTH),
            accepts_ranges: accepts_ranges(&response),
            content_md5: header_string(&response, "content-md5"),
        })
    }

    fn probe_with_ranged_get(&self, url: &str) -> Result<ResourceInfo> {
        let response = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .map_err(|e| DownloadError::FetchFileInfo {
                url: url.to_string(),
                reason: e.to_string(),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::FetchFileInfo {
                url: url.to_string(),
                reason: format!("ranged GET returned {status}"),
                transient: status.is_server_error(),
            });
        }

        let info = if status == StatusCode::PARTIAL_CONTENT {
            ResourceInfo {
                effective_url: response.url().to_string(),
                total_size: content_range_total(&response),
                accepts_ranges: true,
                content_md5: header_string(&response, "content-md5"),
            }
        } else {
            // Plain 200: the server ignored the range request.
            ResourceInfo {
                effective_url: response.url().to_string(),
                total_size: header_i64(&response, CONTENT_LENGTH),
                accepts_ranges: accepts_ranges(&response),
                content_md5: header_string(&response, "content-md5"),
            }
        };

        Ok(info)
    }
}

impl RangedTransport for HttpTransport {
    fn probe(&self, url: &str) -> Result<ResourceInfo> {
        let info = if self.use_head {
            self.probe_with_head(url)?
        } else {
            self.probe_with_ranged_get(url)?
        };
        debug!(
            url,
            effective = %info.effective_url,
            total = info.total_size,
            ranges = info.accepts_ranges,
            "probed resource"
        );
        Ok(info)
    }

    fn fetch(
        &self,
        url: &str,
        range: FetchRange,
        sink: &mut dyn ByteSink,
        controls: &TransferControls,
    ) -> FetchOutcome {
        let mut request = self.client.get(url);
        if let Some(value) = range.header_value() {
            request = request.header(RANGE, value);
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(e) => {
                // Connection, TLS and timeout errors are all worth retrying.
                return FetchOutcome::new(0, TerminalCause::Transient(e.to_string()));
            }
        };

        let status = response.status();
        if status.is_server_error() {
            return FetchOutcome::new(0, TerminalCause::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return FetchOutcome::new(0, TerminalCause::Permanent(format!("status {status}")));
        }

        if self.redirect_check {
            if let Ok(requested) = Url::parse(url) {
                if *response.url() != requested {
                    warn!(requested = url, landed = %response.url(), "redirect drift");
                    return FetchOutcome::new(
                        0,
                        TerminalCause::RedirectDrift {
                            expected: url.to_string(),
                            actual: response.url().to_string(),
                        },
                    );
                }
            }
        }

        if range.begin > 0 && status != StatusCode::PARTIAL_CONTENT {
            // A 200 here would restart the body from offset zero.
            return FetchOutcome::new(
                0,
                TerminalCause::Permanent("server ignored range request".to_string()),
            );
        }

        stream_body(response, range, sink, controls)
    }
}

/// Shared read loop: stream the response body into the sink under controls,
/// clamped to the requested range.
fn stream_body(
    mut response: Response,
    range: FetchRange,
    sink: &mut dyn ByteSink,
    controls: &TransferControls,
) -> FetchOutcome {
    let want = range.len();
    let mut limiter = SpeedLimiter::new(controls.speed_cap_handle());
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        if let Some(cause) = controls.interruption() {
            return FetchOutcome::new(written, cause);
        }
        if want == Some(written) {
            return FetchOutcome::new(written, TerminalCause::RangeComplete);
        }

        let n = match response.read(&mut buffer) {
            Ok(n) => n,
            Err(e) => return FetchOutcome::new(written, TerminalCause::Transient(e.to_string())),
        };

        if n == 0 {
            let cause = match want {
                None => TerminalCause::Eof,
                Some(w) if written >= w => TerminalCause::RangeComplete,
                Some(w) => TerminalCause::Transient(format!(
                    "connection closed {} bytes short of range",
                    w - written
                )),
            };
            return FetchOutcome::new(written, cause);
        }

        // Never hand the sink more than the requested range.
        let take = match want {
            Some(w) => (n as u64).min(w - written) as usize,
            None => n,
        };
        if let Err(e) = sink.accept(&buffer[..take]) {
            return FetchOutcome::new(written, TerminalCause::SinkError(e.to_string()));
        }
        written += take as u64;
        limiter.throttle(take as u64);
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn header_i64(response: &Response, name: reqwest::header::HeaderName) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|len| *len >= 0)
}

fn accepts_ranges(response: &Response) -> bool {
    response
        .headers()
        .get(ACCEPT_RANGES)
        .map(|v| v.to_str().unwrap_or("") == "bytes")
        .unwrap_or(false)
}

/// Total length out of a `Content-Range: bytes 0-0/N` header; `*` means the
/// server does not know.
fn content_range_total(response: &Response) -> Option<i64> {
    response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.rsplit('/').next())
        .and_then(|total| total.trim().parse::<i64>().ok())
        .filter(|total| *total >= 0)
}

/// Collapse Netscape cookie-jar lines into a single `Cookie` header value.
///
/// Each line has seven tab-separated fields; name and value are the last
/// two. Comment lines and the `#HttpOnly_` prefix follow the cookies.txt
/// conventions.
fn cookie_header_from_netscape(cookie_list: &str) -> Option<String> {
    let mut pairs = Vec::new();
    for line in cookie_list.lines() {
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() == 7 {
            pairs.push(format!("{}={}", fields[5], fields[6]));
        }
    }
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}
