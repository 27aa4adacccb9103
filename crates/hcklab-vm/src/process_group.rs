use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::reaper_joiner;
use crate::scope::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A process group kept alive by an inert placeholder child.
///
/// The placeholder is `cat` reading from a pipe only we hold: it never does
/// anything, and it exits on its own if this process dies and the pipe
/// closes. VM processes join the group through [`ProcessGroup::attach`], so
/// the whole set can be signalled with one `kill(-pgid)`.
pub struct ProcessGroup {
    pgid: i32,
    placeholder: Mutex<Option<Placeholder>>,
}

struct Placeholder {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ProcessGroup {
    pub fn spawn() -> Result<Self> {
        let mut cmd = Command::new("cat");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().context("spawn process-group placeholder")?;
        let pgid = i32::try_from(child.id()).context("placeholder pid out of range")?;
        let stdin = child.stdin.take();
        debug!(pgid, "process group created");

        Ok(Self {
            pgid,
            placeholder: Mutex::new(Some(Placeholder { child, stdin })),
        })
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Makes a not-yet-spawned command join this group.
    pub fn attach(&self, cmd: &mut Command) {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(self.pgid);
        }
        #[cfg(not(unix))]
        {
            let _ = cmd;
        }
    }

    /// Signals every member. Returns `false` when the group no longer exists.
    pub fn signal(&self, sig: Signal) -> Result<bool> {
        signal_group(self.pgid, sig)
    }

    pub fn is_empty(&self) -> bool {
        !group_exists(self.pgid)
    }

    fn shutdown(&self) -> Result<()> {
        let Some(mut ph) = self
            .placeholder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let res = signal_group(self.pgid, Signal::Kill);
        drop(ph.stdin.take());
        match ph.child.try_wait() {
            Ok(Some(_)) => {}
            _ => reaper_joiner::register("group placeholder", ph.child),
        }
        res.map(|_| ())
            .with_context(|| format!("kill process group {}", self.pgid))
    }
}

impl Resource for ProcessGroup {
    fn describe(&self) -> String {
        format!("process group {}", self.pgid)
    }

    fn release(&self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(pgid = self.pgid, error = %err, "process group cleanup on drop failed");
        }
    }
}

pub fn signal_group(pgid: i32, sig: Signal) -> Result<bool> {
    #[cfg(unix)]
    {
        if pgid <= 1 {
            anyhow::bail!("refusing to signal process group {pgid}");
        }
        let rc = unsafe { libc::kill(-pgid, sig.raw()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        Err(err).with_context(|| format!("kill(-{pgid}, {sig:?})"))
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, sig);
        Ok(false)
    }
}

/// `kill(pid, 0)` check. EPERM still means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        unsafe {
            if libc::kill(pid, 0) == 0 {
                return true;
            }
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn group_exists(pgid: i32) -> bool {
    #[cfg(unix)]
    {
        if pgid <= 1 {
            return false;
        }
        unsafe {
            if libc::kill(-pgid, 0) == 0 {
                return true;
            }
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}

pub fn hard_kill_pid_and_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        if pid <= 1 {
            return;
        }
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
