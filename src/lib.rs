//! Downpour - resumable multi-slice download engine.
//!
//! Downloads HTTP(S) and local `file://` resources in parallel byte-range
//! slices, persists progress across process restarts through a sidecar
//! index file, verifies content integrity, and exposes live progress and
//! speed telemetry with pause/resume/stop control.
//!
//! # Quick start
//!
//! ```no_run
//! use downpour::{DownloadOptions, Downloader, SlicePolicy};
//!
//! let options = DownloadOptions::default()
//!     .with_thread_num(4)
//!     .with_slice_policy(SlicePolicy::FixedNum(4));
//!
//! let mut downloader = Downloader::with_options(options);
//! let result = downloader
//!     .start(
//!         "https://example.com/archive.zip",
//!         "archive.zip",
//!         None,
//!         Some(Box::new(|total, downloaded| {
//!             println!("{downloaded}/{total}");
//!         })),
//!         None,
//!     )
//!     .expect("start failed");
//!
//! let code = result.wait();
//! println!("finished: {code}");
//! ```
//!
//! # Module organization
//!
//! - [`session`] - the public [`Downloader`] lifecycle and verification
//! - `scheduler` / `worker` - the bounded worker pool and per-slice state
//!   machines (crate-internal)
//! - [`slice`] - slice layout planning and index reconciliation
//! - [`index`] - crash-safe sidecar index persistence
//! - [`cache`] - per-slice write-back buffering
//! - [`transport`] - the ranged-GET abstraction with HTTP(S) and `file://`
//!   implementations
//! - [`digest`] - MD5 / SHA-256 / CRC32 digesters
//! - [`speed`] - realtime speed sampling, pacing and the min-speed watchdog

pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod event;
pub mod future;
pub mod global;
pub mod index;
mod scheduler;
pub mod session;
pub mod slice;
pub mod speed;
pub mod target;
pub mod transport;
mod worker;

pub use config::{
    DownloadOptions, HashVerify, HashVerifyPolicy, MinSpeed, SlicePolicy,
    UncompletedSliceSavePolicy, DEFAULT_DISK_CACHE_SIZE, DEFAULT_SLICE_SIZE, MAX_THREAD_NUM,
};
pub use digest::HashType;
pub use error::{DownloadCode, DownloadError, Result};
pub use event::DownloadEvent;
pub use future::SharedResult;
pub use global::{global_init, global_initialized, global_uninit};
pub use session::{
    index_file_path, tmp_file_path, DownloadState, Downloader, ProgressCallback, ResultCallback,
    SpeedCallback, INDEX_FILE_SUFFIX, TMP_FILE_SUFFIX,
};
pub use transport::{
    ByteSink, FetchOutcome, FetchRange, RangedTransport, ResourceInfo, TerminalCause,
    TransferControls,
};
