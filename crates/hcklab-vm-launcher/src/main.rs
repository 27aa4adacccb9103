use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hcklab_vm::{
    install_interrupt_trap, is_cancelled, scope, CancelToken, IdAllocator, PollPolicy, RigConfig,
    Role, RunEnv, VmPhase, VmProcessSupervisor, VmSpec, VmStatus, REPORT_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct RunManifest {
    vms: Vec<VmSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl Outcome {
    fn exit_code(self) -> u8 {
        match self {
            Outcome::Completed => 0,
            Outcome::Failed => 1,
            Outcome::Cancelled => 130,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    schema_version: &'static str,
    run_id: Option<u32>,
    vms: Vec<VmStatus>,
    outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct Args {
    manifest: PathBuf,
    config: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    hcklab_vm::logging::init();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln_stderr(format!("{err:#}\n"));
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let args = parse_args(std::env::args().skip(1))?;
    let cfg = RigConfig::load(args.config.as_deref())?;
    let manifest = load_manifest(&args.manifest)?;

    let cx = CancelToken::new();
    install_interrupt_trap(&cx)?;

    let db = cfg.lease_db_path()?;
    let ids = Arc::new(
        IdAllocator::open(&db, cfg.id_range, cfg.lease_stale_after())
            .with_context(|| format!("open lease store: {}", db.display()))?,
    );

    let report = run(&cx, cfg, ids, &manifest);
    let out = serde_json::to_string_pretty(&report).context("encode run report")?;
    println!("{out}");
    Ok(std::process::ExitCode::from(report.outcome.exit_code()))
}

fn run(cx: &CancelToken, cfg: RigConfig, ids: Arc<IdAllocator>, manifest: &RunManifest) -> RunReport {
    let mut run_id = None;
    let mut vms: Vec<Arc<VmProcessSupervisor>> = Vec::new();

    let result = scope::open(cx, |s| {
        let id = ids.allocate_blocking(s.cancel_token(), PollPolicy::from_config(&cfg))?;
        run_id = Some(id);
        let lease_ids = Arc::clone(&ids);
        s.push(format!("run lease {id}"), move || {
            lease_ids.release(id);
            Ok(())
        });
        info!(run_id = id, vms = manifest.vms.len(), "run started");

        let env = RunEnv::new(id, cfg.clone())?.with_allocator(Arc::clone(&ids));
        for role in [Role::Studio, Role::Client] {
            for spec in manifest.vms.iter().filter(|v| v.role == role) {
                vms.push(VmProcessSupervisor::start(s, spec, &env)?);
            }
        }
        supervise(s.cancel_token(), &vms)
    });

    let (outcome, error) = match result {
        Ok(outcome) => (outcome, None),
        Err(err) if is_cancelled(&err) => {
            warn!(run_id, "run cancelled");
            (Outcome::Cancelled, None)
        }
        Err(err) => {
            error!(run_id, error = format!("{err:#}"), "run failed");
            (Outcome::Failed, Some(format!("{err:#}")))
        }
    };

    RunReport {
        schema_version: REPORT_SCHEMA_VERSION,
        run_id,
        vms: vms.iter().map(|vm| vm.status()).collect(),
        outcome,
        error,
    }
}

/// Polls every VM until all of them are done or one hits a fatal condition.
fn supervise(cx: &CancelToken, vms: &[Arc<VmProcessSupervisor>]) -> Result<Outcome> {
    loop {
        let mut done = 0;
        for vm in vms {
            match vm.check() {
                Ok(phase) if phase.is_terminal() => done += 1,
                Ok(_) => {}
                Err(err) => {
                    error!(vm = vm.name(), error = format!("{err:#}"), "vm failed; stopping run");
                    return Err(err.context(format!("vm {}", vm.name())));
                }
            }
        }
        if done == vms.len() {
            let failed = vms.iter().any(|vm| vm.status().phase == VmPhase::Failed);
            return Ok(if failed {
                Outcome::Failed
            } else {
                Outcome::Completed
            });
        }
        cx.sleep(POLL_INTERVAL)?;
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut manifest = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                anyhow::bail!("usage: hcklab-vm-launcher [--config PATH] MANIFEST");
            }
            other if other.starts_with('-') => anyhow::bail!("unknown option {other:?}"),
            other => {
                if manifest.replace(PathBuf::from(other)).is_some() {
                    anyhow::bail!("more than one manifest given");
                }
            }
        }
    }
    Ok(Args {
        manifest: manifest.context("usage: hcklab-vm-launcher [--config PATH] MANIFEST")?,
        config,
    })
}

fn load_manifest(path: &Path) -> Result<RunManifest> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read run manifest: {}", path.display()))?;
    let manifest: RunManifest = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse run manifest: {}", path.display()))?;

    let mut seen = std::collections::BTreeSet::new();
    for vm in &manifest.vms {
        if vm.name.trim().is_empty() {
            anyhow::bail!("run manifest has a vm with an empty name");
        }
        if !seen.insert(vm.name.as_str()) {
            anyhow::bail!("duplicate vm name in run manifest: {:?}", vm.name);
        }
        if vm.argv.is_empty() {
            anyhow::bail!("vm {:?} has an empty argv", vm.name);
        }
    }
    Ok(manifest)
}

fn writeln_stderr(msg: String) -> std::io::Result<()> {
    use std::io::Write;
    let mut stderr = std::io::stderr();
    stderr.write_all(msg.as_bytes())?;
    stderr.flush()
}
