//! Background reaping for children we detach from: placeholder processes
//! and namespace daemons. Nobody waits on them directly, so one shared
//! thread does it to keep them from lingering as zombies.

use std::process::Child;
use std::sync::{mpsc, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::debug;

struct Detached {
    what: &'static str,
    child: Child,
}

static QUEUE: OnceLock<mpsc::Sender<Detached>> = OnceLock::new();

const POLL: Duration = Duration::from_millis(100);

/// Hands `child` over for reaping. `what` only labels the log line.
pub fn register(what: &'static str, child: Child) {
    let queue = QUEUE.get_or_init(|| {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("hcklab-reaper-joiner".to_string())
            .spawn(move || reap_until_idle(rx));
        if let Err(err) = spawned {
            debug!(error = %err, "reaper thread unavailable; falling back to per-child waiters");
        }
        tx
    });

    if let Err(mpsc::SendError(entry)) = queue.send(Detached { what, child }) {
        wait_in_background(entry);
    }
}

fn reap_until_idle(rx: mpsc::Receiver<Detached>) {
    let mut pending: Vec<Detached> = Vec::new();
    loop {
        match rx.recv_timeout(POLL) {
            Ok(entry) => pending.push(entry),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) if pending.is_empty() => return,
            Err(mpsc::RecvTimeoutError::Disconnected) => {}
        }

        pending.retain_mut(|d| match d.child.try_wait() {
            Ok(Some(status)) => {
                debug!(what = d.what, pid = d.child.id(), ?status, "reaped detached child");
                false
            }
            Ok(None) => true,
            Err(err) => err.raw_os_error() != Some(libc::ECHILD),
        });
    }
}

fn wait_in_background(mut entry: Detached) {
    let _ = thread::Builder::new()
        .name("hcklab-reaper-wait".to_string())
        .spawn(move || {
            let _ = entry.child.wait();
        });
}
