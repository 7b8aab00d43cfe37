//! Per-slice transfer state machine.
//!
//! Each worker thread loops claiming pending slices and driving them
//! through `fetch → cache → flush → index update`. Transient failures
//! requeue the slice with an exponential backoff deadline; permanent
//! failures and exhausted budgets mark it failed and bring the session
//! down. Flushes always precede index updates, so the persisted index never
//! describes bytes that are not durable.

use std::io;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::SliceCache;
use crate::error::DownloadError;
use crate::scheduler::{TransferShared, WorkerEvent};
use crate::slice::SliceStatus;
use crate::transport::{ByteSink, FetchRange, TerminalCause};

/// Transient failures tolerated per slice before it is marked failed.
const MAX_SLICE_RETRIES: u32 = 3;

/// Base delay for exponential retry backoff.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Idle sleep while other workers hold the remaining slices.
const CLAIM_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Outcome of one claim attempt.
enum Claim {
    Slice(usize),
    Wait,
    Done,
}

/// Worker thread entry point: claim and run slices until none remain or the
/// session stops.
pub(crate) fn run_worker(shared: &TransferShared, events: &Sender<WorkerEvent>) {
    loop {
        if shared.controls.should_stop() {
            return;
        }
        if shared.controls.should_suspend() {
            shared.pause_gate.wait_while_suspended(&shared.controls);
            continue;
        }

        match claim_slice(shared) {
            Claim::Slice(index) => run_slice(shared, events, index),
            Claim::Wait => std::thread::sleep(CLAIM_IDLE_SLEEP),
            Claim::Done => return,
        }
    }
}

/// Claim the first pending slice whose backoff deadline has passed.
fn claim_slice(shared: &TransferShared) -> Claim {
    let now = Instant::now();
    let mut slices = shared.slices.lock();

    let mut any_open = false;
    for (index, slice) in slices.iter_mut().enumerate() {
        match slice.status {
            SliceStatus::Pending => {
                any_open = true;
                let due = slice.not_before.map(|t| t <= now).unwrap_or(true);
                if due {
                    slice.status = SliceStatus::Active;
                    return Claim::Slice(index);
                }
            }
            SliceStatus::Active => any_open = true,
            SliceStatus::Failed => return Claim::Done,
            SliceStatus::Completed => {}
        }
    }

    if any_open {
        Claim::Wait
    } else {
        Claim::Done
    }
}

/// Drive one slice to a terminal state (or back to pending on retry /
/// cancellation).
fn run_slice(shared: &TransferShared, events: &Sender<WorkerEvent>, index: usize) {
    let mut cache = SliceCache::new(shared.cache_quota);

    loop {
        let range = {
            let slices = shared.slices.lock();
            let slice = &slices[index];
            if slice.is_complete() {
                drop(slices);
                complete_slice(shared, events, index);
                return;
            }
            FetchRange::new(slice.current_offset(), slice.end)
        };

        let mut sink = SliceSink {
            shared,
            events,
            index,
            cache: &mut cache,
        };
        let outcome = shared
            .transport
            .fetch(&shared.effective_url, range, &mut sink, &shared.controls);

        debug!(
            slice = index,
            offset = range.begin,
            bytes = outcome.bytes_written,
            cause = ?outcome.cause,
            "fetch ended"
        );

        match outcome.cause {
            TerminalCause::RangeComplete => {
                if flush_residual(shared, events, index, &mut cache).is_err() {
                    return;
                }
                complete_slice(shared, events, index);
                return;
            }
            TerminalCause::Eof => {
                if flush_residual(shared, events, index, &mut cache).is_err() {
                    return;
                }
                let final_offset = {
                    let mut slices = shared.slices.lock();
                    let slice = &mut slices[index];
                    let end = slice.current_offset();
                    slice.end = Some(end);
                    end
                };
                let _ = events.send(WorkerEvent::TotalResolved(final_offset));
                complete_slice(shared, events, index);
                return;
            }
            TerminalCause::Suspended => {
                // Pause: make received bytes durable, then park until
                // resumed. Reactivation refetches from the flushed offset.
                if flush_residual(shared, events, index, &mut cache).is_err() {
                    return;
                }
                shared.pause_gate.wait_while_suspended(&shared.controls);
                if shared.controls.should_stop() {
                    release_slice(shared, index);
                    return;
                }
            }
            TerminalCause::Canceled => {
                // Stop: in-flight buffered bytes are discarded.
                cache.discard();
                release_slice(shared, index);
                return;
            }
            TerminalCause::SinkError(reason) => {
                cache.discard();
                fail_slice(
                    shared,
                    events,
                    index,
                    DownloadError::FlushTmpFile {
                        path: shared.target.path().to_path_buf(),
                        source: io::Error::new(io::ErrorKind::Other, reason),
                    },
                );
                return;
            }
            TerminalCause::Transient(reason) => {
                if flush_residual(shared, events, index, &mut cache).is_err() {
                    return;
                }
                if !requeue_with_backoff(shared, index, &reason) {
                    fail_slice(
                        shared,
                        events,
                        index,
                        DownloadError::SliceDownload {
                            slice: index,
                            reason: format!("retry budget exhausted: {reason}"),
                        },
                    );
                }
                return;
            }
            TerminalCause::Permanent(reason) => {
                let _ = flush_residual(shared, events, index, &mut cache);
                fail_slice(
                    shared,
                    events,
                    index,
                    DownloadError::SliceDownload {
                        slice: index,
                        reason,
                    },
                );
                return;
            }
            TerminalCause::RedirectDrift { expected, actual } => {
                let _ = flush_residual(shared, events, index, &mut cache);
                fail_slice(
                    shared,
                    events,
                    index,
                    DownloadError::RedirectDrift { expected, actual },
                );
                return;
            }
        }
    }
}

/// Write any buffered residue to the data file and advance the slice's
/// durable count. On failure the slice is marked failed and the buffered
/// bytes after the failure point are dropped.
fn flush_residual(
    shared: &TransferShared,
    events: &Sender<WorkerEvent>,
    index: usize,
    cache: &mut SliceCache,
) -> Result<(), ()> {
    if cache.is_empty() {
        return Ok(());
    }
    let data = cache.take();
    match write_through(shared, events, index, &data) {
        Ok(()) => Ok(()),
        Err(e) => {
            fail_slice(
                shared,
                events,
                index,
                DownloadError::FlushTmpFile {
                    path: shared.target.path().to_path_buf(),
                    source: e,
                },
            );
            Err(())
        }
    }
}

/// Positioned write of a coalesced region at the slice's durable frontier,
/// then the in-memory progress update and an index refresh request.
fn write_through(
    shared: &TransferShared,
    events: &Sender<WorkerEvent>,
    index: usize,
    data: &[u8],
) -> io::Result<()> {
    let offset = {
        let slices = shared.slices.lock();
        slices[index].current_offset()
    };
    shared.target.write_at(offset as u64, data)?;
    {
        let mut slices = shared.slices.lock();
        slices[index].downloaded += data.len() as i64;
    }
    let _ = events.send(WorkerEvent::Progress);
    Ok(())
}

fn complete_slice(shared: &TransferShared, events: &Sender<WorkerEvent>, index: usize) {
    {
        let mut slices = shared.slices.lock();
        slices[index].status = SliceStatus::Completed;
    }
    let _ = events.send(WorkerEvent::SliceCompleted(index));
}

/// Put a transiently-failed slice back in the queue behind an exponential
/// backoff deadline. Returns false once the budget is exhausted.
fn requeue_with_backoff(shared: &TransferShared, index: usize, reason: &str) -> bool {
    let mut slices = shared.slices.lock();
    let slice = &mut slices[index];
    if slice.retries >= MAX_SLICE_RETRIES {
        return false;
    }
    slice.retries += 1;
    let delay = RETRY_BACKOFF_BASE * 2u32.pow(slice.retries - 1);
    slice.not_before = Some(Instant::now() + delay);
    slice.status = SliceStatus::Pending;
    warn!(
        slice = index,
        retry = slice.retries,
        delay_ms = delay.as_millis() as u64,
        reason,
        "transient slice failure, requeued"
    );
    true
}

fn fail_slice(
    shared: &TransferShared,
    events: &Sender<WorkerEvent>,
    index: usize,
    error: DownloadError,
) {
    warn!(slice = index, error = %error, "slice failed");
    {
        let mut slices = shared.slices.lock();
        slices[index].status = SliceStatus::Failed;
    }
    shared.record_failure(error);
    let _ = events.send(WorkerEvent::SliceFailed(index));
}

/// Return a slice interrupted by stop to pending without touching its
/// progress, so a later resumption can pick it up.
fn release_slice(shared: &TransferShared, index: usize) {
    let mut slices = shared.slices.lock();
    if slices[index].status == SliceStatus::Active {
        slices[index].status = SliceStatus::Pending;
    }
}

/// Streams fetched bytes into the slice cache, flushing full buffers to the
/// data file inline. The inline flush is what bounds bytes in flight: the
/// transport blocks until the flush returns.
struct SliceSink<'a> {
    shared: &'a TransferShared,
    events: &'a Sender<WorkerEvent>,
    index: usize,
    cache: &'a mut SliceCache,
}

impl ByteSink for SliceSink<'_> {
    fn accept(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.shared
            .received
            .fetch_add(bytes.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.cache.push(bytes);
        if self.cache.should_flush() {
            let data = self.cache.take();
            write_through(self.shared, self.events, self.index, &data)?;
        }
        Ok(())
    }
}
