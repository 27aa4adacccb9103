//! One VM as a supervised, restartable child process.
//!
//! [`VmProcessSupervisor::start`] acquires everything a VM needs inside a
//! scope transaction and hands the running process to a supervision thread.
//! The thread owns the observed side of the state (pid, exits, restarts);
//! [`VmProcessSupervisor::close`] only flips the desired state and then
//! walks the abort ladder until the thread sees the process gone.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::abort_plan::{enforce_abort_plan, AbortBackend, AbortPlan, AbortResult};
use crate::config::RigConfig;
use crate::control::ControlChannel;
use crate::error::VmError;
use crate::exec::{exit_code, run_hook, HookSpec};
use crate::hostfwd::{ForwardSpec, HostFwdClient, PortForwardLease};
use crate::id_alloc::IdAllocator;
use crate::identity::{Placeholders, RunIdentity};
use crate::namespace::NamespaceBroker;
use crate::process_group::{ProcessGroup, Signal};
use crate::scope::{Resource, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Studio,
    Client,
}

/// One entry of the run manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub role: Role,
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
    #[serde(default)]
    pub pre_start: Vec<HookSpec>,
    /// Ephemeral disk image deleted once the VM is closed.
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPhase {
    Idle,
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

impl VmPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmPhase::Exited | VmPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Desired {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    pub name: String,
    pub phase: VmPhase,
    pub restarts: u32,
    pub last_exit: Option<i32>,
    #[serde(skip)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Restart,
    Fatal,
}

/// Detects a VM that keeps crashing right after it starts.
///
/// The first non-zero exit since the last clean one arms the guard; another
/// non-zero exit within `window` of it is fatal. A failure after the window
/// re-arms the guard at its own time.
#[derive(Debug, Clone)]
pub struct FailureLoopGuard {
    window: Duration,
    first_fail: Option<Instant>,
}

impl FailureLoopGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            first_fail: None,
        }
    }

    pub fn record_exit(&mut self, exit_status: i32, at: Instant) -> GuardVerdict {
        if exit_status == 0 {
            self.first_fail = None;
            return GuardVerdict::Restart;
        }
        match self.first_fail {
            Some(first) if at.saturating_duration_since(first) < self.window => GuardVerdict::Fatal,
            _ => {
                self.first_fail = Some(at);
                GuardVerdict::Restart
            }
        }
    }
}

/// Run-wide collaborators shared by every VM of a run.
pub struct RunEnv {
    pub identity: RunIdentity,
    pub config: RigConfig,
    pub ids: Option<Arc<IdAllocator>>,
    pub namespace: Option<NamespaceBroker>,
    pub hostfwd: Option<HostFwdClient>,
    next_index: AtomicU32,
}

impl RunEnv {
    pub fn new(run_id: u32, config: RigConfig) -> Result<Self> {
        let namespace = Some(NamespaceBroker::new(
            &config.namespace_lock_path()?,
            &config.namespace,
        ));
        let hostfwd = config
            .hostfwd_socket
            .as_deref()
            .map(|sock| HostFwdClient::new(sock, config.control_timeout()));
        Ok(Self {
            identity: RunIdentity::new(run_id),
            config,
            ids: None,
            namespace,
            hostfwd,
            next_index: AtomicU32::new(0),
        })
    }

    pub fn with_allocator(mut self, ids: Arc<IdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn run_id(&self) -> u32 {
        self.identity.run_id()
    }

    fn next_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }
}

/// Everything needed to (re)spawn the VM process.
struct Launch {
    vm: String,
    run_id: u32,
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    placeholders: Placeholders,
    control_timeout: Duration,
    group: Arc<ProcessGroup>,
}

impl Launch {
    fn spawn(&self) -> Result<(Child, Arc<ControlChannel>)> {
        let (chan, end) = ControlChannel::pair(&self.vm, self.control_timeout)
            .with_context(|| format!("vm {}: control channel", self.vm))?;

        let mut ph = self.placeholders.clone();
        ph.set("ctl_fd", end.fd().to_string());
        let argv = ph.expand_argv(&self.argv);
        let Some((program, args)) = argv.split_first() else {
            anyhow::bail!("vm {}: empty argv", self.vm);
        };

        let mut cmd = Command::new(program);
        cmd.args(args).envs(&self.env).stdin(Stdio::null());
        self.group.attach(&mut cmd);
        end.prepare(&mut cmd);

        let child = cmd.spawn().map_err(|err| VmError::SpawnFailed {
            vm: self.vm.clone(),
            cause: format!("{program:?}: {err}"),
        })?;
        drop(end);

        info!(vm = %self.vm, run_id = self.run_id, pid = child.id(), pgid = self.group.pgid(), "vm process started");
        Ok((child, Arc::new(chan)))
    }
}

struct RunState {
    desired: Desired,
    phase: VmPhase,
    pid: Option<u32>,
    restarts: u32,
    last_exit: Option<i32>,
    control: Option<Arc<ControlChannel>>,
    fatal: Option<VmError>,
}

struct Shared {
    vm: String,
    state: Mutex<RunState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_phase(&self, st: &mut RunState, phase: VmPhase) {
        if st.phase != phase {
            debug!(vm = %self.vm, from = ?st.phase, to = ?phase, "phase change");
            st.phase = phase;
        }
        self.changed.notify_all();
    }
}

pub struct VmProcessSupervisor {
    name: String,
    shared: Arc<Shared>,
    group: Option<Arc<ProcessGroup>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: Mutex<bool>,
    plan: AbortPlan,
    snapshot: Option<PathBuf>,
    started: bool,
}

impl VmProcessSupervisor {
    /// Starts `spec` and registers everything it acquired into `scope`.
    ///
    /// On failure nothing stays registered: whatever was acquired before the
    /// failing step has already been released when this returns.
    pub fn start(scope: &mut Scope, spec: &VmSpec, env: &RunEnv) -> Result<Arc<Self>> {
        let vm = spec.name.as_str();
        let run_id = env.run_id();
        info!(vm, run_id, role = ?spec.role, "starting vm");

        scope
            .transaction(|tx| {
                let cx = tx.cancel_token().clone();
                let cfg = &env.config;

                let plan = AbortPlan::from_config(&cfg.abort);
                let mut placeholders = Placeholders::for_vm(env.identity, vm, env.next_index());

                if spec.dry_run || cfg.dry_run {
                    let mut ph = placeholders.clone();
                    ph.set("ctl_fd", "<ctl_fd>");
                    info!(vm, run_id, argv = ?ph.expand_argv(&spec.argv), isolated = spec.isolated, "dry run: not spawning");
                    let sup = Arc::new(Self::idle(vm, plan));
                    return Ok(tx.adopt(sup));
                }

                let ns = if spec.isolated {
                    let broker = env
                        .namespace
                        .as_ref()
                        .context("isolated vm but no namespace broker configured")?;
                    Some(tx.adopt(Arc::new(broker.acquire().context("acquire namespace")?)))
                } else {
                    None
                };

                if !spec.forwards.is_empty() {
                    let client = env
                        .hostfwd
                        .as_ref()
                        .context("port forwards requested but no hostfwd_socket configured")?;
                    let lease = tx.adopt(Arc::new(PortForwardLease::acquire(
                        client,
                        vm,
                        &spec.forwards,
                    )?));
                    placeholders.set_forwards(&lease.host_ports());
                }

                let argv = match &ns {
                    Some(ns) => ns.wrap(&spec.argv),
                    None => spec.argv.clone(),
                };

                let group = tx.adopt(Arc::new(ProcessGroup::spawn()?));
                if let Some(ids) = &env.ids {
                    ids.attach_group(run_id, group.pgid())?;
                }

                for hook in &spec.pre_start {
                    cx.checkpoint()?;
                    run_hook(vm, hook, cfg.hook_timeout())?;
                }
                cx.checkpoint()?;

                let launch = Launch {
                    vm: vm.to_string(),
                    run_id,
                    argv,
                    env: spec.env.clone(),
                    placeholders,
                    control_timeout: cfg.control_timeout(),
                    group: Arc::clone(&group),
                };
                let (child, control) = launch.spawn()?;

                let shared = Arc::new(Shared {
                    vm: vm.to_string(),
                    state: Mutex::new(RunState {
                        desired: Desired::Running,
                        phase: VmPhase::Running,
                        pid: Some(child.id()),
                        restarts: 0,
                        last_exit: None,
                        control: Some(control),
                        fatal: None,
                    }),
                    changed: Condvar::new(),
                });

                let guard = FailureLoopGuard::new(cfg.fail_window());
                let thread_shared = Arc::clone(&shared);
                let keep_alive = spec.keep_alive;
                let handle = std::thread::Builder::new()
                    .name(format!("hcklab-vm-{vm}"))
                    .spawn(move || supervise(thread_shared, launch, child, keep_alive, guard))
                    .context("spawn supervision thread")?;

                let sup = Arc::new(Self {
                    name: vm.to_string(),
                    shared,
                    group: Some(group),
                    thread: Mutex::new(Some(handle)),
                    closed: Mutex::new(false),
                    plan,
                    snapshot: spec.snapshot.clone(),
                    started: true,
                });
                Ok(tx.adopt(sup))
            })
            .with_context(|| format!("start vm {vm} (run {run_id})"))
    }

    fn idle(vm: &str, plan: AbortPlan) -> Self {
        Self {
            name: vm.to_string(),
            shared: Arc::new(Shared {
                vm: vm.to_string(),
                state: Mutex::new(RunState {
                    desired: Desired::Stopped,
                    phase: VmPhase::Exited,
                    pid: None,
                    restarts: 0,
                    last_exit: None,
                    control: None,
                    fatal: None,
                }),
                changed: Condvar::new(),
            }),
            group: None,
            thread: Mutex::new(None),
            closed: Mutex::new(false),
            plan,
            snapshot: None,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    /// Control channel of the current process, if one is running.
    pub fn control(&self) -> Option<Arc<ControlChannel>> {
        self.shared.lock().control.clone()
    }

    pub fn status(&self) -> VmStatus {
        let st = self.shared.lock();
        VmStatus {
            name: self.name.clone(),
            phase: st.phase,
            restarts: st.restarts,
            last_exit: st.last_exit,
            pid: st.pid,
        }
    }

    /// Current phase, or the fatal condition if supervision gave up.
    pub fn check(&self) -> Result<VmPhase> {
        let st = self.shared.lock();
        match &st.fatal {
            Some(fatal) => Err(fatal.clone().into()),
            None => Ok(st.phase),
        }
    }

    /// Blocks until the VM reaches a terminal phase.
    pub fn wait(&self) -> Result<VmStatus> {
        {
            let mut st = self.shared.lock();
            while !st.phase.is_terminal() {
                st = self
                    .shared
                    .changed
                    .wait(st)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            if let Some(fatal) = &st.fatal {
                return Err(fatal.clone().into());
            }
        }
        Ok(self.status())
    }

    /// Stops the VM and cleans up after it. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        {
            let mut closed = self
                .closed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        {
            let mut st = self.shared.lock();
            st.desired = Desired::Stopped;
            if st.phase == VmPhase::Running {
                self.shared.set_phase(&mut st, VmPhase::Stopping);
            }
        }

        if !self.started {
            debug!(vm = %self.name, "close: nothing was started");
            return Ok(());
        }

        let backend = SupervisorBackend { sup: self };
        let result = enforce_abort_plan(&self.plan, &backend, &self.name);
        debug!(vm = %self.name, ?result, "abort ladder finished");

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if result == AbortResult::Survived {
            error!(vm = %self.name, pid = ?self.pid(), "vm process survived SIGKILL; leaving supervision thread detached");
        } else if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(vm = %self.name, "supervision thread panicked");
            }
        }

        if let Some(path) = &self.snapshot {
            match std::fs::remove_file(path) {
                Ok(()) => info!(vm = %self.name, snapshot = %path.display(), "snapshot deleted"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("vm {}: delete snapshot {}", self.name, path.display())
                    })
                }
            }
        }
        Ok(())
    }
}

impl Resource for VmProcessSupervisor {
    fn describe(&self) -> String {
        format!("vm {}", self.name)
    }

    fn release(&self) -> Result<()> {
        self.close()
    }
}

impl Drop for VmProcessSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(vm = %self.name, error = format!("{err:#}"), "vm close on drop failed");
        }
    }
}

struct SupervisorBackend<'a> {
    sup: &'a VmProcessSupervisor,
}

impl SupervisorBackend<'_> {
    fn send(&self, what: &str, f: impl FnOnce(&ControlChannel) -> Result<Option<serde_json::Value>>) -> Result<()> {
        let Some(chan) = self.sup.control() else {
            return Ok(());
        };
        f(&chan).with_context(|| format!("vm {}: {what}", self.sup.name))?;
        Ok(())
    }
}

impl AbortBackend for SupervisorBackend<'_> {
    fn soft_stop(&self) -> Result<()> {
        self.send("system_powerdown", ControlChannel::powerdown)
    }

    fn hard_stop(&self) -> Result<()> {
        self.send("quit", ControlChannel::quit)
    }

    fn force_kill(&self) -> Result<()> {
        let Some(group) = &self.sup.group else {
            return Ok(());
        };
        group.signal(Signal::Kill)?;
        Ok(())
    }

    fn is_dead(&self) -> bool {
        self.sup.pid().is_none()
    }
}

fn supervise(
    shared: Arc<Shared>,
    launch: Launch,
    mut child: Child,
    keep_alive: bool,
    mut guard: FailureLoopGuard,
) {
    let vm = shared.vm.clone();
    loop {
        let pid = child.id();
        let code = match child.wait() {
            Ok(status) => exit_code(status),
            Err(err) => {
                warn!(vm = %vm, pid, error = %err, "wait on vm process failed");
                -1
            }
        };

        let mut st = shared.lock();
        st.pid = None;
        st.control = None;
        st.last_exit = Some(code);
        info!(vm = %vm, run_id = launch.run_id, pid, exit_status = code, "vm process exited");

        if st.desired == Desired::Stopped || !keep_alive {
            shared.set_phase(&mut st, VmPhase::Exited);
            return;
        }

        if guard.record_exit(code, Instant::now()) == GuardVerdict::Fatal {
            error!(vm = %vm, exit_status = code, "vm is crash-looping; giving up");
            st.fatal = Some(VmError::RapidFailure {
                vm: vm.clone(),
                window: guard.window,
                exit_status: code,
            });
            shared.set_phase(&mut st, VmPhase::Failed);
            return;
        }

        // Respawn under the lock so close() either stops us before this or
        // sees the new pid.
        shared.set_phase(&mut st, VmPhase::Starting);
        match launch.spawn() {
            Ok((next, control)) => {
                st.restarts += 1;
                st.pid = Some(next.id());
                st.control = Some(control);
                shared.set_phase(&mut st, VmPhase::Running);
                info!(vm = %vm, restarts = st.restarts, "vm restarted");
                child = next;
            }
            Err(err) => {
                error!(vm = %vm, error = format!("{err:#}"), "vm restart failed");
                st.fatal = Some(match err.downcast::<VmError>() {
                    Ok(e) => e,
                    Err(e) => VmError::SpawnFailed {
                        vm: vm.clone(),
                        cause: format!("{e:#}"),
                    },
                });
                shared.set_phase(&mut st, VmPhase::Failed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::error::{error_kind, VmErrorKind};
    use crate::hostfwd::fake_helper::FakeHelper;
    use crate::scope;

    #[test]
    fn failures_inside_window_are_fatal() {
        let t0 = Instant::now();
        let mut g = FailureLoopGuard::new(Duration::from_secs(10));
        assert_eq!(g.record_exit(1, t0), GuardVerdict::Restart);
        assert_eq!(g.record_exit(1, t0 + Duration::from_secs(5)), GuardVerdict::Fatal);
    }

    #[test]
    fn failures_outside_window_rearm() {
        let t0 = Instant::now();
        let mut g = FailureLoopGuard::new(Duration::from_secs(10));
        assert_eq!(g.record_exit(1, t0), GuardVerdict::Restart);
        assert_eq!(g.record_exit(1, t0 + Duration::from_secs(15)), GuardVerdict::Restart);
        assert_eq!(g.record_exit(1, t0 + Duration::from_secs(30)), GuardVerdict::Restart);
        assert_eq!(g.record_exit(1, t0 + Duration::from_secs(34)), GuardVerdict::Fatal);
    }

    #[test]
    fn clean_exit_clears_guard() {
        let t0 = Instant::now();
        let mut g = FailureLoopGuard::new(Duration::from_secs(10));
        g.record_exit(1, t0);
        assert_eq!(g.record_exit(0, t0 + Duration::from_secs(1)), GuardVerdict::Restart);
        assert_eq!(g.record_exit(1, t0 + Duration::from_secs(2)), GuardVerdict::Restart);
    }

    #[test]
    fn manifest_entry_defaults() {
        let spec: VmSpec = serde_json::from_str(
            r#"{"name": "c1", "role": "client", "argv": ["qemu", "-name", "{vm}"]}"#,
        )
        .unwrap();
        assert_eq!(spec.role, Role::Client);
        assert!(!spec.keep_alive && !spec.isolated && !spec.dry_run);
        assert!(spec.forwards.is_empty() && spec.pre_start.is_empty());
    }

    fn env(dir: &std::path::Path) -> RunEnv {
        let cfg = RigConfig {
            state_dir: Some(dir.to_path_buf()),
            fail_window_secs: 10,
            ..RigConfig::default()
        };
        RunEnv::new(1, cfg).unwrap()
    }

    fn sh_spec(name: &str, script: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            role: Role::Client,
            argv: vec!["sh".into(), "-c".into(), script.into()],
            env: BTreeMap::new(),
            keep_alive: false,
            isolated: false,
            forwards: vec![],
            pre_start: vec![],
            snapshot: None,
            dry_run: false,
        }
    }

    #[test]
    fn dry_run_spawns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path());
        let mut spec = sh_spec("c1", "exit 0");
        spec.dry_run = true;
        let snap = tmp.path().join("c1.qcow2");
        std::fs::write(&snap, b"disk").unwrap();
        spec.snapshot = Some(snap.clone());

        scope::open(&CancelToken::new(), |s| {
            let sup = VmProcessSupervisor::start(s, &spec, &env)?;
            assert_eq!(s.len(), 1);
            assert_eq!(sup.pid(), None);
            assert_eq!(sup.wait()?.phase, VmPhase::Exited);
            Ok(())
        })
        .unwrap();
        assert!(snap.exists(), "dry run must not delete the snapshot");
    }

    #[test]
    fn exited_process_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path());
        let spec = sh_spec("c1", "exit 3");

        let status = scope::open(&CancelToken::new(), |s| {
            let sup = VmProcessSupervisor::start(s, &spec, &env)?;
            sup.wait()
        })
        .unwrap();
        assert_eq!(status.phase, VmPhase::Exited);
        assert_eq!(status.last_exit, Some(3));
        assert_eq!(status.restarts, 0);
    }

    #[test]
    fn crash_loop_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path());
        let mut spec = sh_spec("c1", "exit 7");
        spec.keep_alive = true;

        let err = scope::open(&CancelToken::new(), |s| {
            let sup = VmProcessSupervisor::start(s, &spec, &env)?;
            sup.wait()
        })
        .unwrap_err();
        assert_eq!(error_kind(&err), Some(VmErrorKind::RapidFailure));
    }

    #[test]
    fn failing_hook_unwinds_the_transaction() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path());
        let mut spec = sh_spec("c1", "sleep 30");
        spec.pre_start = vec![HookSpec {
            argv: vec!["sh".into(), "-c".into(), "exit 9".into()],
            timeout_ms: None,
        }];

        scope::open(&CancelToken::new(), |s| {
            let err = VmProcessSupervisor::start(s, &spec, &env).err().unwrap();
            assert!(format!("{err:#}").contains("exited with 9"));
            assert!(s.is_empty());
            Ok(())
        })
        .unwrap();
    }

    /// Config with a `sh` namespace daemon that logs its pid to `ns-daemon`
    /// and an enter prefix that hands that pid to the VM as `NS_PID`.
    fn isolated_env(dir: &std::path::Path, hostfwd_socket: &std::path::Path) -> RunEnv {
        let cfg = RigConfig {
            state_dir: Some(dir.to_path_buf()),
            namespace: crate::config::NamespaceConfig {
                daemon_argv: vec![
                    "sh".into(),
                    "-c".into(),
                    format!("echo $$ >> '{}'; exec sleep 30", dir.join("ns-daemon").display()),
                ],
                enter_argv: vec!["env".into(), "NS_PID={pid}".into()],
            },
            hostfwd_socket: Some(hostfwd_socket.to_path_buf()),
            ..RigConfig::default()
        };
        RunEnv::new(4, cfg).unwrap()
    }

    fn daemon_pids(dir: &std::path::Path) -> Vec<u32> {
        std::fs::read_to_string(dir.join("ns-daemon"))
            .unwrap_or_default()
            .lines()
            .map(|l| l.trim().parse().unwrap())
            .collect()
    }

    fn wait_dead(pid: u32) -> bool {
        let end = Instant::now() + Duration::from_secs(5);
        while Instant::now() < end {
            if !crate::process_group::pid_alive(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn forward(guest_port: u16) -> ForwardSpec {
        ForwardSpec {
            proto: crate::hostfwd::Proto::Tcp,
            guest_port,
            host_port: 0,
        }
    }

    #[test]
    fn isolated_vm_runs_inside_the_namespace_with_forwarded_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = FakeHelper::start(None);
        let env = isolated_env(tmp.path(), helper.socket());
        let out = tmp.path().join("vm.out");
        let mut spec = sh_spec(
            "c1",
            &format!("echo \"$NS_PID {{fwd0}} {{fwd1}}\" > '{}'", out.display()),
        );
        spec.isolated = true;
        spec.forwards = vec![forward(22), forward(3389)];

        let daemon = scope::open(&CancelToken::new(), |s| {
            let sup = VmProcessSupervisor::start(s, &spec, &env)?;
            assert_eq!(sup.wait()?.last_exit, Some(0));
            let pids = daemon_pids(tmp.path());
            assert_eq!(pids.len(), 1);
            assert!(crate::process_group::pid_alive(pids[0]));
            Ok(pids[0])
        })
        .unwrap();

        let seen = std::fs::read_to_string(&out).unwrap();
        assert_eq!(seen.trim(), format!("{daemon} 40001 40002"));
        assert_eq!(helper.log(), ["add 22", "add 3389", "remove 2", "remove 1"]);
        assert!(wait_dead(daemon), "namespace daemon outlived the run");
    }

    #[test]
    fn failed_forward_releases_the_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = FakeHelper::start(Some(3389));
        let env = isolated_env(tmp.path(), helper.socket());
        let mut spec = sh_spec("c1", "sleep 30");
        spec.isolated = true;
        spec.forwards = vec![forward(22), forward(3389)];

        scope::open(&CancelToken::new(), |s| {
            let err = VmProcessSupervisor::start(s, &spec, &env).err().unwrap();
            assert!(format!("{err:#}").contains("address in use"), "{err:#}");
            assert!(s.is_empty());
            Ok(())
        })
        .unwrap();

        assert_eq!(helper.log(), ["add 22", "add-fail 3389", "remove 1"]);
        let pids = daemon_pids(tmp.path());
        assert_eq!(pids.len(), 1);
        assert!(wait_dead(pids[0]), "namespace daemon survived the unwind");
    }

    #[test]
    fn failing_hook_releases_forwards_and_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = FakeHelper::start(None);
        let env = isolated_env(tmp.path(), helper.socket());
        let mut spec = sh_spec("c1", "sleep 30");
        spec.isolated = true;
        spec.forwards = vec![forward(22)];
        spec.pre_start = vec![HookSpec {
            argv: vec!["sh".into(), "-c".into(), "exit 4".into()],
            timeout_ms: None,
        }];

        scope::open(&CancelToken::new(), |s| {
            let err = VmProcessSupervisor::start(s, &spec, &env).err().unwrap();
            assert!(format!("{err:#}").contains("exited with 4"), "{err:#}");
            assert!(s.is_empty());
            Ok(())
        })
        .unwrap();

        assert_eq!(helper.log(), ["add 22", "remove 1"]);
        let pids = daemon_pids(tmp.path());
        assert_eq!(pids.len(), 1);
        assert!(wait_dead(pids[0]), "namespace daemon survived the unwind");
    }

    #[test]
    fn unspawnable_binary_is_a_spawn_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path());
        let mut spec = sh_spec("c1", "");
        spec.argv = vec!["/nonexistent/hcklab-qemu".into()];

        let err = scope::open(&CancelToken::new(), |s| {
            VmProcessSupervisor::start(s, &spec, &env).map(|_| ())
        })
        .unwrap_err();
        assert_eq!(error_kind(&err), Some(VmErrorKind::SpawnFailed));
    }

    #[test]
    fn close_kills_a_process_without_control_support() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = RigConfig {
            state_dir: Some(tmp.path().to_path_buf()),
            ..RigConfig::default()
        };
        cfg.abort.soft_attempts = 1;
        cfg.abort.soft_wait_secs = 0;
        cfg.abort.hard_timeout_secs = 0;
        cfg.abort.force_timeout_secs = 5;
        cfg.control_timeout_ms = 200;
        let env = RunEnv::new(2, cfg).unwrap();
        let snap = tmp.path().join("c1.qcow2");
        std::fs::write(&snap, b"disk").unwrap();
        let mut spec = sh_spec("c1", "exec sleep 30");
        spec.keep_alive = true;
        spec.snapshot = Some(snap.clone());

        let started = Instant::now();
        scope::open(&CancelToken::new(), |s| {
            let sup = VmProcessSupervisor::start(s, &spec, &env)?;
            assert!(sup.pid().is_some());
            sup.close()?;
            assert_eq!(sup.status().phase, VmPhase::Exited);
            assert_eq!(sup.status().restarts, 0);
            sup.close()
        })
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(!snap.exists());
    }
}
