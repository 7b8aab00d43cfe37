//! Process-wide transport initialization.
//!
//! Reference-counted and idempotent. The current HTTP transport needs no
//! process-wide setup, so these functions only maintain the count; they are
//! the documented hook for transports that do (the original engine required
//! global libcurl initialization before any session could run).

use parking_lot::Mutex;

static INIT_COUNT: Mutex<usize> = Mutex::new(0);

/// Initialize process-wide transport state.
///
/// May be called multiple times; each call must be balanced by a matching
/// [`global_uninit`].
pub fn global_init() {
    let mut count = INIT_COUNT.lock();
    *count += 1;
    if *count == 1 {
        tracing::debug!("global transport state initialized");
    }
}

/// Tear down process-wide transport state once the last reference is gone.
pub fn global_uninit() {
    let mut count = INIT_COUNT.lock();
    if *count == 0 {
        return;
    }
    *count -= 1;
    if *count == 0 {
        tracing::debug!("global transport state released");
    }
}

/// Whether global initialization is currently active.
pub fn global_initialized() -> bool {
    *INIT_COUNT.lock() > 0
}
