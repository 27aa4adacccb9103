use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::process_group::{signal_group, Signal};

const HOOK_OUTPUT_CAP: usize = 64 * 1024;

#[derive(Debug)]
pub struct RunOutput {
    pub exit_status: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunOutput {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.exit_status == 0
    }
}

/// A command run to completion before a VM starts (disk preparation,
/// bridge setup and the like).
#[derive(Debug, Clone, Deserialize)]
pub struct HookSpec {
    pub argv: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        if truncated {
            continue;
        }
        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

/// Waits for `child`, killing its whole process group once `wall` elapses.
fn wait_child_with_wall_timeout(child: &mut Child, wall: Duration) -> Result<(ExitStatus, bool)> {
    let deadline = Instant::now() + wall.max(Duration::from_millis(1));

    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((status, false));
        }
        if Instant::now() >= deadline {
            if let Ok(pgid) = i32::try_from(child.id()) {
                let _ = signal_group(pgid, Signal::Kill);
            }
            let _ = child.kill();
            let status = child.wait().context("wait child after kill")?;
            return Ok((status, true));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn wait_child_output_capped(
    mut child: Child,
    wall: Duration,
    stdout_cap: usize,
    stderr_cap: usize,
) -> Result<RunOutput> {
    let stdout = child.stdout.take().context("take stdout")?;
    let stderr = child.stderr.take().context("take stderr")?;

    let stdout_thread = std::thread::spawn(move || read_to_end_capped(stdout, stdout_cap));
    let stderr_thread = std::thread::spawn(move || read_to_end_capped(stderr, stderr_cap));

    let (status, timed_out) = wait_child_with_wall_timeout(&mut child, wall)?;
    let (stdout, stdout_truncated) = stdout_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;
    let (stderr, stderr_truncated) = stderr_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;

    Ok(RunOutput {
        exit_status: exit_code(status),
        timed_out,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Maps a wait status to a shell-style code (128 + signal when killed).
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    }
}

pub fn run_command_capped(mut cmd: Command, wall: Duration, cap: usize) -> Result<RunOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("spawn command")?;
    wait_child_output_capped(child, wall, cap, cap)
}

/// Runs one pre-start hook; any failure or timeout is an error naming the
/// hook.
pub fn run_hook(vm: &str, hook: &HookSpec, default_timeout: Duration) -> Result<()> {
    let Some((program, args)) = hook.argv.split_first() else {
        anyhow::bail!("vm {vm}: pre-start hook has an empty argv");
    };
    let timeout = hook
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env("LC_ALL", "C");

    info!(vm, hook = %program, timeout_ms = timeout.as_millis() as u64, "running pre-start hook");
    let out = run_command_capped(cmd, timeout, HOOK_OUTPUT_CAP)
        .with_context(|| format!("vm {vm}: pre-start hook {program:?}"))?;
    debug!(vm, hook = %program, exit_status = out.exit_status, "pre-start hook finished");

    if out.timed_out {
        anyhow::bail!(
            "vm {vm}: pre-start hook {program:?} timed out after {}ms",
            timeout.as_millis()
        );
    }
    if out.exit_status != 0 {
        let stderr = String::from_utf8_lossy(&out.stderr);
        anyhow::bail!(
            "vm {vm}: pre-start hook {program:?} exited with {}: {}",
            out.exit_status,
            stderr.trim()
        );
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn hook(script: &str, timeout_ms: Option<u64>) -> HookSpec {
        HookSpec {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            timeout_ms,
        }
    }

    #[test]
    fn capped_reader_truncates() {
        let data = vec![7u8; 100];
        let (buf, truncated) = read_to_end_capped(&data[..], 10).unwrap();
        assert_eq!(buf.len(), 10);
        assert!(truncated);
    }

    #[test]
    fn hook_success_and_failure() {
        run_hook("studio", &hook("exit 0", None), Duration::from_secs(5)).unwrap();

        let err = run_hook("studio", &hook("echo nope >&2; exit 4", None), Duration::from_secs(5))
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("exited with 4"), "{msg}");
        assert!(msg.contains("nope"), "{msg}");
    }

    #[test]
    fn hook_timeout_kills_it() {
        let start = Instant::now();
        let err = run_hook("c1", &hook("sleep 30", Some(100)), Duration::from_secs(5)).unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn empty_hook_is_rejected() {
        let h = HookSpec {
            argv: vec![],
            timeout_ms: None,
        };
        assert!(run_hook("c1", &h, Duration::from_secs(1)).is_err());
    }
}
