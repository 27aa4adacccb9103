use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hcklab_vm::{hard_kill_pid_and_group, pid_alive, IdAllocator, RigConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "hcklab-vm-reaper")]
#[command(about = "Inspect and clean up run-id leases left by hcklab runs.", long_about = None)]
struct Cli {
    /// JSON config file (defaults to $HCKLAB_CONFIG, then built-in defaults).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print every current lease as JSON.
    List,
    /// Release leases whose owner is gone and that are older than the stale threshold.
    Reclaim,
    /// Kill a lease's owner, if it is still alive, and its VM process groups,
    /// then release the lease.
    Release {
        #[arg(long)]
        id: u32,
    },
}

fn main() -> std::process::ExitCode {
    hcklab_vm::logging::init();
    match try_main() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hcklab-vm-reaper: {err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = RigConfig::load(cli.config.as_deref())?;
    let db = cfg.lease_db_path()?;
    let ids = Arc::new(
        IdAllocator::open(&db, cfg.id_range, cfg.lease_stale_after())
            .with_context(|| format!("open lease store: {}", db.display()))?,
    );

    match cli.cmd {
        Cmd::List => {
            let leases = ids.leases()?;
            let out = serde_json::to_string_pretty(&leases).context("encode leases")?;
            println!("{out}");
        }
        Cmd::Reclaim => {
            let n = ids.reclaim_stale()?;
            info!(reclaimed = n, "reclaim finished");
            println!("{n}");
        }
        Cmd::Release { id } => {
            let Some(lease) = ids.lease(id)? else {
                anyhow::bail!("no lease for run id {id}");
            };
            if lease.owner_pid != std::process::id() && pid_alive(lease.owner_pid) {
                info!(run_id = id, owner_pid = lease.owner_pid, "killing live lease owner");
                hard_kill_pid_and_group(lease.owner_pid);
            }
            let killed = ids.kill_groups(id)?;
            info!(run_id = id, groups = killed, "killed lease process groups");
            ids.release(id);
        }
    }
    Ok(())
}
