//! One isolation daemon shared by every launcher on the host.
//!
//! The lock file holds the daemon's pid in ASCII (or nothing). A shared
//! `flock` marks a user; an exclusive one is taken only to start the daemon
//! or to tear it down, and teardown happens only when no other user holds a
//! shared lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::NamespaceConfig;
use crate::process_group::{hard_kill_pid_and_group, pid_alive};
use crate::reaper_joiner;
use crate::scope::Resource;

const STARTUP_GRACE: Duration = Duration::from_millis(50);
const UPGRADE_RETRY: Duration = Duration::from_millis(20);
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NamespaceBroker {
    lock_path: PathBuf,
    daemon_argv: Vec<String>,
    enter_argv: Vec<String>,
}

#[derive(Debug)]
pub struct NamespaceHandle {
    lock_path: PathBuf,
    pid: u32,
    enter_prefix: Vec<String>,
    file: Mutex<Option<File>>,
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    ExclusiveNonBlocking,
    Unlock,
}

impl NamespaceBroker {
    pub fn new(lock_path: &Path, cfg: &NamespaceConfig) -> Self {
        Self {
            lock_path: lock_path.to_path_buf(),
            daemon_argv: cfg.daemon_argv.clone(),
            enter_argv: cfg.enter_argv.clone(),
        }
    }

    /// Returns a handle on the live daemon, starting it if nobody has.
    pub fn acquire(&self) -> Result<NamespaceHandle> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir: {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("open namespace lock: {}", self.lock_path.display()))?;

        let deadline = Instant::now() + UPGRADE_TIMEOUT;
        loop {
            flock(&file, LockMode::Shared)?;
            if let Some(pid) = read_live_pid(&mut file)? {
                debug!(pid, "namespace daemon already running");
                return Ok(self.handle(file, pid));
            }

            // A blocking upgrade would wait on every other shared holder,
            // including one that is itself waiting to upgrade. Whether a
            // failed conversion keeps the shared lock is platform-specific,
            // so it is dropped explicitly before backing off.
            match flock(&file, LockMode::ExclusiveNonBlocking) {
                Ok(()) => break,
                Err(err) if is_would_block(&err) => {
                    flock(&file, LockMode::Unlock)?;
                    if Instant::now() >= deadline {
                        anyhow::bail!(
                            "namespace daemon recorded in {} is gone but the lock is still held by other users",
                            self.lock_path.display()
                        );
                    }
                    std::thread::sleep(UPGRADE_RETRY);
                }
                Err(err) => return Err(err),
            }
        }

        // Converting shared to exclusive is not atomic: another process may
        // have started the daemon in between, hence the second look.
        let pid = match read_live_pid(&mut file)? {
            Some(pid) => pid,
            None => self.spawn_daemon(&mut file)?,
        };
        flock(&file, LockMode::Shared)?;

        Ok(self.handle(file, pid))
    }

    fn spawn_daemon(&self, file: &mut File) -> Result<u32> {
        let Some((program, args)) = self.daemon_argv.split_first() else {
            anyhow::bail!("namespace daemon argv is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn namespace daemon {program:?}"))?;
        let pid = child.id();

        std::thread::sleep(STARTUP_GRACE);
        if let Some(status) = child.try_wait().context("poll namespace daemon")? {
            anyhow::bail!("namespace daemon {program:?} exited during startup: {status}");
        }

        file.set_len(0).context("truncate namespace lock")?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{pid}").context("record namespace daemon pid")?;
        file.sync_data().context("sync namespace lock")?;

        reaper_joiner::register("namespace daemon", child);
        info!(pid, lock = %self.lock_path.display(), "namespace daemon started");
        Ok(pid)
    }

    fn handle(&self, file: File, pid: u32) -> NamespaceHandle {
        let pid_s = pid.to_string();
        let enter_prefix = self
            .enter_argv
            .iter()
            .map(|a| a.replace("{pid}", &pid_s))
            .collect();
        NamespaceHandle {
            lock_path: self.lock_path.clone(),
            pid,
            enter_prefix,
            file: Mutex::new(Some(file)),
        }
    }
}

impl NamespaceHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Argv prefix that runs a command inside the namespace.
    pub fn enter_prefix(&self) -> &[String] {
        &self.enter_prefix
    }

    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        self.enter_prefix.iter().chain(argv).cloned().collect()
    }

    fn shutdown(&self) -> Result<()> {
        let Some(mut file) = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        match flock(&file, LockMode::ExclusiveNonBlocking) {
            Ok(()) => {
                if let Some(pid) = read_pid(&mut file)? {
                    hard_kill_pid_and_group(pid);
                    info!(pid, "namespace daemon stopped; last user gone");
                }
                file.set_len(0).context("truncate namespace lock")?;
            }
            Err(err) if is_would_block(&err) => {
                debug!(pid = self.pid, "namespace still in use elsewhere");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("lock {}", self.lock_path.display()));
            }
        }
        drop(file);
        Ok(())
    }
}

impl Resource for NamespaceHandle {
    fn describe(&self) -> String {
        format!("namespace daemon {}", self.pid)
    }

    fn release(&self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(pid = self.pid, error = format!("{err:#}"), "namespace release on drop failed");
        }
    }
}

fn flock(file: &File, mode: LockMode) -> Result<()> {
    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::ExclusiveNonBlocking => libc::LOCK_EX | libc::LOCK_NB,
        LockMode::Unlock => libc::LOCK_UN,
    };
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err.into());
    }
}

fn is_would_block(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::WouldBlock)
}

fn read_pid(file: &mut File) -> Result<Option<u32>> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .context("read namespace lock")?;
    Ok(raw.trim().parse::<u32>().ok().filter(|&p| p > 1))
}

fn read_live_pid(file: &mut File) -> Result<Option<u32>> {
    Ok(read_pid(file)?.filter(|&pid| pid_alive(pid)))
}
