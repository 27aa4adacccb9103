mod abort_plan;
mod cancel;
mod config;
mod control;
mod error;
mod exec;
mod hostfwd;
mod id_alloc;
mod identity;
mod namespace;
mod process_group;
mod reaper_joiner;
mod rpc;
mod supervisor;

pub mod logging;
pub mod scope;

pub use abort_plan::{
    enforce_abort_plan, AbortBackend, AbortPlan, AbortResult, AbortStep, RetryPolicy,
};
pub use cancel::{install_interrupt_trap, is_masked, CancelToken, TeardownMask};
pub use config::{
    default_state_root, parse_bool_env, AbortConfig, IdRange, NamespaceConfig, RigConfig,
    RpcConfig, ENV_CONFIG, ENV_DRY_RUN, ENV_FAIL_WINDOW_SECS, ENV_ID_RANGE,
    ENV_LEASE_STALE_SECS, ENV_STATE_DIR, LEASE_DB_FILE, NAMESPACE_LOCK_FILE,
};
pub use control::{ChildEnd, ControlChannel};
pub use error::{error_kind, is_cancelled, VmError, VmErrorKind};
pub use exec::{exit_code, run_command_capped, run_hook, HookSpec, RunOutput};
pub use hostfwd::{ForwardSpec, HostFwdClient, PortForward, PortForwardLease, Proto};
pub use id_alloc::{now_unix_ms, IdAllocator, Lease, PollPolicy};
pub use identity::{Placeholders, RunIdentity};
pub use namespace::{NamespaceBroker, NamespaceHandle};
pub use process_group::{hard_kill_pid_and_group, pid_alive, signal_group, ProcessGroup, Signal};
pub use rpc::{
    retry_bounded, Guarded, RetryBudget, RetryOutcome, RetryingRpcClient, Truthy,
};
pub use scope::{Resource, Scope};
pub use supervisor::{
    FailureLoopGuard, GuardVerdict, Role, RunEnv, VmPhase, VmProcessSupervisor, VmSpec, VmStatus,
};

pub const REPORT_SCHEMA_VERSION: &str = "hcklab.run.report@0.1.0";
