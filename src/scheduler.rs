//! Transfer coordination.
//!
//! The scheduler owns the coordinator side of a running transfer: it spawns
//! the bounded worker pool, drains worker events, persists the index on a
//! coalesced cadence (immediately on slice completion or failure), samples
//! throughput for the realtime speed callback and the minimum-speed
//! watchdog, rebalances the per-connection speed cap, and fans out
//! cancellation. User callbacks run on this thread and must not block.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::{DownloadOptions, UncompletedSliceSavePolicy};
use crate::error::{DownloadError, Result};
use crate::index::{IndexRecord, IndexStore, INDEX_VERSION};
use crate::slice::{self, Slice, SliceStatus};
use crate::speed::{MinSpeedWatchdog, SpeedSampler};
use crate::target::TargetFile;
use crate::transport::{RangedTransport, TransferControls};
use crate::worker::run_worker;
use crate::{ProgressCallback, SpeedCallback};

/// Coordinator tick: event drain timeout and telemetry emission floor.
const TICK: Duration = Duration::from_millis(100);

/// Minimum interval between coalesced index writes.
const INDEX_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Events posted by workers to the coordinator queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    /// Durable bytes advanced; the index is stale.
    Progress,
    /// A slice reached Completed.
    SliceCompleted(usize),
    /// A slice reached Failed.
    SliceFailed(usize),
    /// An open-ended transfer observed EOF at this offset.
    TotalResolved(i64),
}

/// Parks suspended workers until resume or stop.
#[derive(Debug, Default)]
pub(crate) struct PauseGate {
    lock: Mutex<()>,
    cond: Condvar,
}

impl PauseGate {
    /// Block while the suspend signal is raised; returns promptly once
    /// resumed or stopped.
    pub(crate) fn wait_while_suspended(&self, controls: &TransferControls) {
        loop {
            if controls.should_stop() || !controls.should_suspend() {
                return;
            }
            let mut guard = self.lock.lock();
            self.cond.wait_for(&mut guard, TICK);
        }
    }

    /// Wake parked workers after a resume or stop.
    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }
}

/// State shared between the coordinator and the worker pool.
pub(crate) struct TransferShared {
    pub(crate) options: DownloadOptions,
    pub(crate) transport: Arc<dyn RangedTransport>,
    pub(crate) effective_url: String,
    pub(crate) slices: Mutex<Vec<Slice>>,
    /// Resolved total size; -1 while unknown.
    pub(crate) total_size: AtomicI64,
    pub(crate) target: TargetFile,
    pub(crate) controls: TransferControls,
    pub(crate) pause_gate: Arc<PauseGate>,
    /// First terminal error; later errors are dropped.
    pub(crate) failure: Mutex<Option<DownloadError>>,
    /// Network bytes received, for the speed sampler.
    pub(crate) received: Arc<AtomicU64>,
    /// Per-slice write-back quota in bytes.
    pub(crate) cache_quota: usize,
    /// Speed caps are skipped for file:// resources.
    pub(crate) speed_cap_applies: bool,
}

impl TransferShared {
    pub(crate) fn record_failure(&self, error: DownloadError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

/// Identity and history carried into every index write.
pub(crate) struct IndexMeta {
    pub(crate) origin_url: String,
    pub(crate) created_at: i64,
}

/// Telemetry callbacks, invoked on the coordinator thread.
pub(crate) struct TelemetrySinks {
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_speed: Option<SpeedCallback>,
}

/// Coordinator for one transfer phase.
pub(crate) struct Scheduler {
    shared: Arc<TransferShared>,
    index_store: IndexStore,
    meta: IndexMeta,
    sinks: TelemetrySinks,
}

impl Scheduler {
    pub(crate) fn new(
        shared: Arc<TransferShared>,
        index_store: IndexStore,
        meta: IndexMeta,
        sinks: TelemetrySinks,
    ) -> Self {
        Self {
            shared,
            index_store,
            meta,
            sinks,
        }
    }

    /// Run the transfer to a terminal state: all slices completed, a
    /// failure recorded, or cancellation observed.
    pub(crate) fn run(mut self) -> Result<()> {
        let (events_tx, events_rx) = channel::<WorkerEvent>();
        let workers = self.spawn_workers(&events_tx);
        drop(events_tx);

        self.coordinate(events_rx);

        for worker in workers {
            let _ = worker.join();
        }

        // Persist the last word on progress before reporting the outcome.
        self.write_index(true);

        let failure = self.shared.failure.lock().take();
        if let Some(error) = failure {
            return Err(error);
        }
        if self.shared.controls.should_stop() {
            return Err(DownloadError::Canceled);
        }
        Ok(())
    }

    fn spawn_workers(&self, events_tx: &Sender<WorkerEvent>) -> Vec<JoinHandle<()>> {
        let open_slices = {
            let slices = self.shared.slices.lock();
            slices
                .iter()
                .filter(|s| s.status != SliceStatus::Completed)
                .count()
        };
        let worker_count = (self.shared.options.thread_num as usize)
            .min(open_slices)
            .max(1);

        self.rebalance_speed_cap(worker_count);
        debug!(worker_count, open_slices, "starting worker pool");

        (0..worker_count)
            .map(|_| {
                let shared = Arc::clone(&self.shared);
                let events = events_tx.clone();
                std::thread::spawn(move || run_worker(&shared, &events))
            })
            .collect()
    }

    /// Event/telemetry loop; exits when every worker has hung up.
    fn coordinate(&mut self, events_rx: Receiver<WorkerEvent>) {
        let mut sampler = SpeedSampler::new(Arc::clone(&self.shared.received));
        let mut watchdog = self
            .shared
            .options
            .min_download_speed
            .map(MinSpeedWatchdog::new);

        let mut index_dirty = false;
        let mut last_index_write = Instant::now();
        let mut last_emit = Instant::now();
        let mut last_sample = Instant::now();

        loop {
            match events_rx.recv_timeout(TICK) {
                Ok(WorkerEvent::Progress) => index_dirty = true,
                Ok(WorkerEvent::SliceCompleted(index)) => {
                    debug!(slice = index, "slice completed");
                    self.write_index(false);
                    index_dirty = false;
                    last_index_write = Instant::now();
                }
                Ok(WorkerEvent::SliceFailed(_)) => {
                    self.write_index(false);
                    index_dirty = false;
                    last_index_write = Instant::now();
                    // One failed slice fails the session; wind down the
                    // rest of the pool.
                    self.shared.controls.request_stop();
                    self.shared.pause_gate.notify();
                }
                Ok(WorkerEvent::TotalResolved(total)) => {
                    self.shared.total_size.store(total, Ordering::Relaxed);
                    index_dirty = true;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if let Some(stop_event) = &self.shared.options.stop_event {
                if stop_event.is_set() && !self.shared.controls.should_stop() {
                    debug!("external stop event observed");
                    self.shared.controls.request_stop();
                    self.shared.pause_gate.notify();
                }
            }

            if last_emit.elapsed() >= TICK {
                self.emit_progress();
                last_emit = Instant::now();
            }

            if last_sample.elapsed() >= Duration::from_secs(1) {
                let rate = sampler.sample();
                last_sample = Instant::now();
                if let Some(on_speed) = &self.sinks.on_speed {
                    on_speed(rate as i64);
                }

                let paused = self.shared.controls.should_suspend();
                if let Some(watchdog) = watchdog.as_mut() {
                    if paused {
                        watchdog.reset();
                    } else if watchdog.observe(rate) {
                        let min = self.shared.options.min_download_speed.unwrap();
                        warn!(
                            rate,
                            threshold = min.bytes_per_sec,
                            "minimum download speed violated"
                        );
                        self.shared.record_failure(DownloadError::SpeedTooLow {
                            threshold: min.bytes_per_sec,
                            duration_secs: min.duration_secs,
                        });
                        self.shared.controls.request_stop();
                        self.shared.pause_gate.notify();
                    }
                }

                let active = {
                    let slices = self.shared.slices.lock();
                    slices
                        .iter()
                        .filter(|s| s.status == SliceStatus::Active)
                        .count()
                };
                self.rebalance_speed_cap(active.max(1));
            }

            if index_dirty && last_index_write.elapsed() >= INDEX_WRITE_INTERVAL {
                self.write_index(false);
                index_dirty = false;
                last_index_write = Instant::now();
            }
        }

        self.emit_progress();
    }

    fn emit_progress(&self) {
        if let Some(on_progress) = &self.sinks.on_progress {
            let total = self.shared.total_size.load(Ordering::Relaxed);
            let downloaded = slice::total_downloaded(&self.shared.slices.lock());
            on_progress(total, downloaded);
        }
    }

    /// Split the aggregate speed cap across active connections.
    fn rebalance_speed_cap(&self, active: usize) {
        if !self.shared.speed_cap_applies {
            return;
        }
        let per_connection = match self.shared.options.max_download_speed {
            Some(cap) => (cap / active.max(1) as u64).max(1),
            None => 0,
        };
        self.shared.controls.set_speed_cap(per_connection);
    }

    /// Flush the data file, then persist a snapshot of slice progress.
    ///
    /// `final_write` applies the uncompleted-slice save policy; periodic
    /// writes keep full fidelity so a hard kill loses nothing.
    fn write_index(&mut self, final_write: bool) {
        if let Err(e) = self.shared.target.flush() {
            self.shared.record_failure(DownloadError::FlushTmpFile {
                path: self.shared.target.path().to_path_buf(),
                source: e,
            });
            self.shared.controls.request_stop();
            return;
        }

        let record = self.snapshot_record(final_write);
        if let Err(e) = self.index_store.write(&record) {
            warn!(error = %e, "index write failed");
            self.shared.record_failure(e);
            self.shared.controls.request_stop();
        }
    }

    fn snapshot_record(&self, final_write: bool) -> IndexRecord {
        let slices = self.shared.slices.lock();
        let save_policy = self.shared.options.uncompleted_slice_save_policy;

        let records = slices
            .iter()
            .map(|slice| {
                let mut record = slice.to_record();
                if final_write {
                    let discard = match save_policy {
                        UncompletedSliceSavePolicy::AlwaysDiscard => {
                            slice.status != SliceStatus::Completed
                        }
                        UncompletedSliceSavePolicy::SaveExceptFailed => {
                            slice.status == SliceStatus::Failed
                        }
                    };
                    if discard {
                        record.downloaded = 0;
                    }
                }
                record
            })
            .collect();

        IndexRecord {
            version: INDEX_VERSION,
            origin_url: self.meta.origin_url.clone(),
            effective_url: self.shared.effective_url.clone(),
            total_size: self.shared.total_size.load(Ordering::Relaxed),
            created_at: self.meta.created_at,
            updated_at: chrono::Utc::now().timestamp_millis(),
            slice_policy: self.shared.options.slice_policy.kind(),
            policy_value: self.shared.options.slice_policy.value(),
            slices: records,
        }
    }
}
