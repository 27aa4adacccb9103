//! Line-delimited JSON control protocol spoken with a VM process over a
//! private socket pair.
//!
//! The VM end is inherited across `exec` and announced on the command line
//! through `{ctl_fd}`. Once the connection is seen broken every further
//! command becomes a no-op returning `Ok(None)`, so teardown paths can fire
//! commands at a VM that already died without special-casing it.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::VmError;

const MAX_SKIPPED_MESSAGES: usize = 1024;

pub struct ControlChannel {
    vm: String,
    conn: Mutex<Conn>,
    broken: AtomicBool,
    next_id: AtomicU64,
}

struct Conn {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    negotiated: bool,
}

/// The VM's end of the pair. Keep it alive until the process is spawned,
/// then drop it.
pub struct ChildEnd {
    stream: UnixStream,
}

enum Outcome {
    Reply(Option<Value>),
    Broken,
}

impl ControlChannel {
    pub fn pair(vm: &str, timeout: Duration) -> Result<(Self, ChildEnd)> {
        let (ours, theirs) = UnixStream::pair().context("create control socket pair")?;
        ours.set_read_timeout(Some(timeout))
            .context("set control read timeout")?;
        ours.set_write_timeout(Some(timeout))
            .context("set control write timeout")?;
        let writer = ours.try_clone().context("clone control socket")?;

        let chan = Self {
            vm: vm.to_string(),
            conn: Mutex::new(Conn {
                reader: BufReader::new(ours),
                writer,
                negotiated: false,
            }),
            broken: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        };
        Ok((chan, ChildEnd { stream: theirs }))
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Sends one command and waits for its reply.
    ///
    /// `Ok(Some(v))` carries the `return` payload, `Ok(None)` means the
    /// channel is broken, and an `error` reply becomes [`VmError::Protocol`].
    pub fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Option<Value>> {
        if self.is_broken() {
            debug!(vm = %self.vm, command, "control channel broken; command skipped");
            return Ok(None);
        }

        let mut conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !conn.negotiated {
            match self.round_trip(&mut conn, "qmp_capabilities", None)? {
                Outcome::Broken => return Ok(None),
                Outcome::Reply(_) => conn.negotiated = true,
            }
        }

        match self.round_trip(&mut conn, command, arguments)? {
            Outcome::Broken => Ok(None),
            Outcome::Reply(v) => Ok(v),
        }
    }

    pub fn powerdown(&self) -> Result<Option<Value>> {
        self.execute("system_powerdown", None)
    }

    pub fn quit(&self) -> Result<Option<Value>> {
        self.execute("quit", None)
    }

    /// The VM's run state (`"running"`, `"paused"`, ...).
    pub fn query_status(&self) -> Result<Option<String>> {
        let Some(ret) = self.execute("query-status", None)? else {
            return Ok(None);
        };
        Ok(ret.get("status").and_then(Value::as_str).map(str::to_string))
    }

    fn round_trip(&self, conn: &mut Conn, command: &str, arguments: Option<Value>) -> Result<Outcome> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut req = json!({ "execute": command, "id": id });
        if let Some(args) = arguments {
            req["arguments"] = args;
        }
        let mut line = serde_json::to_vec(&req).context("encode control request")?;
        line.push(b'\n');

        if let Err(err) = conn.writer.write_all(&line).and_then(|()| conn.writer.flush()) {
            return self.transport_failure(command, err);
        }

        let mut buf = String::new();
        for _ in 0..MAX_SKIPPED_MESSAGES {
            buf.clear();
            match conn.reader.read_line(&mut buf) {
                Ok(0) => {
                    return self.transport_failure(command, ErrorKind::UnexpectedEof.into())
                }
                Ok(_) => {}
                Err(err) => return self.transport_failure(command, err),
            }

            let msg: Value = match serde_json::from_str(buf.trim()) {
                Ok(v) => v,
                Err(err) => {
                    warn!(vm = %self.vm, command, error = %err, "unparseable control message skipped");
                    continue;
                }
            };
            if msg.get("QMP").is_some() || msg.get("event").is_some() {
                debug!(vm = %self.vm, "control: skipping greeting/event");
                continue;
            }
            if let Some(reply_id) = msg.get("id") {
                if reply_id.as_u64() != Some(id) {
                    debug!(vm = %self.vm, command, ?reply_id, "control: skipping stale reply");
                    continue;
                }
            }

            if let Some(ret) = msg.get("return") {
                return Ok(Outcome::Reply(Some(ret.clone())));
            }
            if let Some(err) = msg.get("error") {
                let message = err
                    .get("desc")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                return Err(VmError::Protocol {
                    command: command.to_string(),
                    message,
                }
                .into());
            }
            debug!(vm = %self.vm, command, "control: skipping unrecognized message");
        }

        Err(VmError::Protocol {
            command: command.to_string(),
            message: format!("no reply within {MAX_SKIPPED_MESSAGES} messages"),
        }
        .into())
    }

    fn transport_failure(&self, command: &str, err: std::io::Error) -> Result<Outcome> {
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => {
                if !self.broken.swap(true, Ordering::SeqCst) {
                    debug!(vm = %self.vm, command, error = %err, "control channel closed by peer");
                }
                Ok(Outcome::Broken)
            }
            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                Err(err).with_context(|| format!("vm {}: control command {command:?} timed out", self.vm))
            }
            _ => Err(err).with_context(|| format!("vm {}: control command {command:?}", self.vm)),
        }
    }
}

impl ChildEnd {
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Lets `cmd`'s child inherit this descriptor under the same number.
    pub fn prepare(&self, cmd: &mut Command) {
        use std::os::unix::process::CommandExt as _;

        let fd = self.fd();
        // SAFETY: only fcntl(2) runs between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}
