//! Cooperative cancellation.
//!
//! A [`CancelToken`] is shared by everything that belongs to one run. Code
//! observes a pending cancellation only at explicit points: [`CancelToken::checkpoint`]
//! and [`CancelToken::sleep`]. While a [`TeardownMask`] is alive on a thread,
//! delivery on that thread is deferred, so release code always runs to
//! completion; the pending request is observed again at the first checkpoint
//! after the mask is dropped.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::warn;

use crate::error::VmError;

thread_local! {
    static MASK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug)]
struct CancelInner {
    requested: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                requested: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.requested.store(true, Ordering::Release);
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.inner.wake.notify_all();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Fails with [`VmError::Cancelled`] when a request is pending and this
    /// thread is not tearing down.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancel_requested() && !is_masked() {
            return Err(VmError::Cancelled.into());
        }
        Ok(())
    }

    /// Sleeps for `dur`, returning early with [`VmError::Cancelled`] if the
    /// token is cancelled. Under a teardown mask the full duration elapses.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        if is_masked() {
            thread::sleep(dur);
            return Ok(());
        }
        self.checkpoint()?;

        let deadline = Instant::now() + dur;
        let mut guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if self.is_cancel_requested() {
                return Err(VmError::Cancelled.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (g, _) = self
                .inner
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = g;
        }
    }

    /// Defers cancellation delivery on the current thread until the returned
    /// guard is dropped.
    pub fn mask(&self) -> TeardownMask {
        MASK_DEPTH.with(|d| d.set(d.get() + 1));
        TeardownMask { _not_send: std::marker::PhantomData }
    }
}

/// RAII teardown mask; see [`CancelToken::mask`]. Bound to the thread that
/// created it.
#[must_use = "the mask is lifted as soon as the guard is dropped"]
pub struct TeardownMask {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for TeardownMask {
    fn drop(&mut self) {
        MASK_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub fn is_masked() -> bool {
    MASK_DEPTH.with(|d| d.get() > 0)
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static TRAP: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT, SIGTERM and SIGHUP into `cx.cancel()`.
///
/// The handler itself only flips an atomic; a watcher thread performs the
/// actual cancellation. Can be installed once per process.
pub fn install_interrupt_trap(cx: &CancelToken) -> Result<()> {
    if TRAP.set(cx.clone()).is_err() {
        anyhow::bail!("interrupt trap is already installed");
    }

    #[cfg(unix)]
    unsafe {
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
            if libc::signal(sig, handler) == libc::SIG_ERR {
                anyhow::bail!(
                    "install handler for signal {sig}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    thread::Builder::new()
        .name("hcklab-interrupt-watch".to_string())
        .spawn(|| loop {
            if INTERRUPTED.swap(false, Ordering::SeqCst) {
                if let Some(cx) = TRAP.get() {
                    warn!("interrupt received; cancelling run");
                    cx.cancel();
                }
            }
            thread::sleep(Duration::from_millis(50));
        })?;
    Ok(())
}
