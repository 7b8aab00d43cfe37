//! One-shot shared result future.
//!
//! A session produces exactly one terminal [`DownloadCode`]; any number of
//! observers may hold a [`SharedResult`] clone and wait on it. The producer
//! half is crate-internal and fulfills the slot at most once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::DownloadCode;

#[derive(Debug, Default)]
struct ResultInner {
    slot: Mutex<Option<DownloadCode>>,
    cond: Condvar,
}

/// Cloneable handle to the terminal result of a download session.
#[derive(Debug, Clone)]
pub struct SharedResult {
    inner: Arc<ResultInner>,
}

impl SharedResult {
    /// Block until the session produces its terminal code.
    pub fn wait(&self) -> DownloadCode {
        let mut slot = self.inner.slot.lock();
        while slot.is_none() {
            self.inner.cond.wait(&mut slot);
        }
        slot.unwrap()
    }

    /// Block until the result is available or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DownloadCode> {
        let mut slot = self.inner.slot.lock();
        if slot.is_none() {
            self.inner.cond.wait_for(&mut slot, timeout);
        }
        *slot
    }

    /// The result if already available, without blocking.
    pub fn peek(&self) -> Option<DownloadCode> {
        *self.inner.slot.lock()
    }

    /// Whether the terminal result has been produced.
    pub fn is_ready(&self) -> bool {
        self.peek().is_some()
    }
}

/// Producer half of a shared result. Fulfills the slot at most once;
/// later calls are ignored.
#[derive(Debug)]
pub(crate) struct ResultProducer {
    inner: Arc<ResultInner>,
}

impl ResultProducer {
    /// Publish the terminal code. Returns `false` if already fulfilled.
    pub(crate) fn fulfill(&self, code: DownloadCode) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(code);
        self.inner.cond.notify_all();
        true
    }
}

/// Create a linked producer/observer pair.
pub(crate) fn result_channel() -> (ResultProducer, SharedResult) {
    let inner = Arc::new(ResultInner::default());
    (
        ResultProducer {
            inner: Arc::clone(&inner),
        },
        SharedResult { inner },
    )
}
