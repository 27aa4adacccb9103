use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const ENV_STATE_DIR: &str = "HCKLAB_STATE_DIR";
pub const ENV_ID_RANGE: &str = "HCKLAB_ID_RANGE";
pub const ENV_LEASE_STALE_SECS: &str = "HCKLAB_LEASE_STALE_SECS";
pub const ENV_FAIL_WINDOW_SECS: &str = "HCKLAB_FAIL_WINDOW_SECS";
pub const ENV_DRY_RUN: &str = "HCKLAB_DRY_RUN";
pub const ENV_CONFIG: &str = "HCKLAB_CONFIG";

pub const LEASE_DB_FILE: &str = "run_leases.sqlite";
pub const NAMESPACE_LOCK_FILE: &str = "netns.lock";

/// Runtime tuning. Every field has a default so an empty JSON object (or
/// no file at all) is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub state_dir: Option<PathBuf>,
    pub id_range: IdRange,
    pub lease_stale_after_secs: u64,
    pub alloc_poll_initial_ms: u64,
    pub alloc_poll_max_ms: u64,
    pub fail_window_secs: u64,
    pub hook_timeout_secs: u64,
    pub control_timeout_ms: u64,
    pub abort: AbortConfig,
    pub rpc: RpcConfig,
    pub namespace: NamespaceConfig,
    pub hostfwd_socket: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct IdRange {
    pub lo: u32,
    pub hi: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbortConfig {
    pub soft_attempts: u32,
    pub soft_wait_secs: u64,
    pub hard_timeout_secs: u64,
    pub force_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub attempts: u32,
    pub sleep_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub daemon_argv: Vec<String>,
    pub enter_argv: Vec<String>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            id_range: IdRange { lo: 1, hi: 64 },
            lease_stale_after_secs: 300,
            alloc_poll_initial_ms: 500,
            alloc_poll_max_ms: 30_000,
            fail_window_secs: 10,
            hook_timeout_secs: 120,
            control_timeout_ms: 5_000,
            abort: AbortConfig::default(),
            rpc: RpcConfig::default(),
            namespace: NamespaceConfig::default(),
            hostfwd_socket: None,
            dry_run: false,
        }
    }
}

impl Default for AbortConfig {
    fn default() -> Self {
        Self {
            soft_attempts: 3,
            soft_wait_secs: 20,
            hard_timeout_secs: 10,
            force_timeout_secs: 10,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            sleep_secs: 10,
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            daemon_argv: vec![
                "unshare".into(),
                "--user".into(),
                "--map-root-user".into(),
                "--net".into(),
                "--mount".into(),
                "sleep".into(),
                "infinity".into(),
            ],
            enter_argv: vec![
                "nsenter".into(),
                "--target".into(),
                "{pid}".into(),
                "--net".into(),
                "--user".into(),
                "--mount".into(),
                "--preserve-credentials".into(),
            ],
        }
    }
}

impl RigConfig {
    /// Reads `path` (or `$HCKLAB_CONFIG`) if given, then applies the
    /// `HCKLAB_*` environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(from_env);

        let mut cfg = match path {
            Some(p) => {
                let bytes = std::fs::read(&p)
                    .with_context(|| format!("read config: {}", p.display()))?;
                serde_json::from_slice::<RigConfig>(&bytes)
                    .with_context(|| format!("parse config JSON: {}", p.display()))?
            }
            None => RigConfig::default(),
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = get(ENV_STATE_DIR) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = get(ENV_ID_RANGE) {
            self.id_range = parse_id_range(&raw)
                .with_context(|| format!("invalid {ENV_ID_RANGE}={raw:?} (expected lo-hi)"))?;
        }
        if let Some(raw) = get(ENV_LEASE_STALE_SECS) {
            self.lease_stale_after_secs = parse_u64_env(ENV_LEASE_STALE_SECS, &raw)?;
        }
        if let Some(raw) = get(ENV_FAIL_WINDOW_SECS) {
            self.fail_window_secs = parse_u64_env(ENV_FAIL_WINDOW_SECS, &raw)?;
        }
        if let Some(raw) = get(ENV_DRY_RUN) {
            self.dry_run = parse_bool_env(ENV_DRY_RUN, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id_range.lo > self.id_range.hi {
            anyhow::bail!(
                "id_range is empty: lo={} > hi={}",
                self.id_range.lo,
                self.id_range.hi
            );
        }
        if self.abort.soft_attempts == 0 {
            anyhow::bail!("abort.soft_attempts must be at least 1");
        }
        if self.rpc.attempts == 0 {
            anyhow::bail!("rpc.attempts must be at least 1");
        }
        if self.namespace.daemon_argv.is_empty() {
            anyhow::bail!("namespace.daemon_argv is empty");
        }
        Ok(())
    }

    /// State root, created on first use.
    pub fn state_root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create state dir: {}", dir.display()))?;
            return Ok(dir.clone());
        }
        default_state_root()
    }

    pub fn lease_db_path(&self) -> Result<PathBuf> {
        Ok(self.state_root()?.join(LEASE_DB_FILE))
    }

    pub fn namespace_lock_path(&self) -> Result<PathBuf> {
        Ok(self.state_root()?.join(NAMESPACE_LOCK_FILE))
    }

    pub fn lease_stale_after(&self) -> Duration {
        Duration::from_secs(self.lease_stale_after_secs)
    }

    pub fn fail_window(&self) -> Duration {
        Duration::from_secs(self.fail_window_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms.max(1))
    }
}

pub fn default_state_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create {ENV_STATE_DIR}: {}", dir.display()))?;
        return Ok(dir);
    }

    let dir = match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".hcklab"),
        Err(_) => std::env::temp_dir().join("hcklab"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create state dir: {}", dir.display()))?;
    Ok(dir)
}

fn parse_id_range(raw: &str) -> Result<IdRange> {
    let (lo, hi) = raw
        .trim()
        .split_once('-')
        .context("missing '-' separator")?;
    Ok(IdRange {
        lo: lo.trim().parse().context("parse lo")?,
        hi: hi.trim().parse().context("parse hi")?,
    })
}

fn parse_u64_env(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid environment variable {name}={raw:?} (expected an integer)"))
}

pub fn parse_bool_env(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}
