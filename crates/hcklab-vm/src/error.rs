use std::time::Duration;

/// Typed conditions callers branch on. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Debug, Clone)]
pub enum VmError {
    Cancelled,
    Protocol {
        command: String,
        message: String,
    },
    ActionFailed {
        action: String,
        attempts: u32,
        cause: String,
    },
    RapidFailure {
        vm: String,
        window: Duration,
        exit_status: i32,
    },
    SpawnFailed {
        vm: String,
        cause: String,
    },
}

impl VmError {
    pub fn kind(&self) -> VmErrorKind {
        match self {
            VmError::Cancelled => VmErrorKind::Cancelled,
            VmError::Protocol { .. } => VmErrorKind::Protocol,
            VmError::ActionFailed { .. } => VmErrorKind::ActionFailed,
            VmError::RapidFailure { .. } => VmErrorKind::RapidFailure,
            VmError::SpawnFailed { .. } => VmErrorKind::SpawnFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    Cancelled,
    Protocol,
    ActionFailed,
    RapidFailure,
    SpawnFailed,
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Cancelled => f.write_str("operation cancelled"),
            VmError::Protocol { command, message } => {
                write!(f, "control command {command:?} failed: {message}")
            }
            VmError::ActionFailed {
                action,
                attempts,
                cause,
            } => write!(f, "action {action:?} failed after {attempts} attempt(s): {cause}"),
            VmError::RapidFailure {
                vm,
                window,
                exit_status,
            } => write!(
                f,
                "vm {vm} failed twice within {}s (last exit status {exit_status}); not restarting",
                window.as_secs_f64()
            ),
            VmError::SpawnFailed { vm, cause } => write!(f, "vm {vm} failed to spawn: {cause}"),
        }
    }
}

impl std::error::Error for VmError {}

/// Returns the typed kind carried anywhere in `err`'s chain.
pub fn error_kind(err: &anyhow::Error) -> Option<VmErrorKind> {
    err.chain()
        .find_map(|e| e.downcast_ref::<VmError>())
        .map(VmError::kind)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    error_kind(err) == Some(VmErrorKind::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn kind_is_found_through_context() {
        let err = Err::<(), _>(VmError::Cancelled)
            .context("waiting for studio")
            .unwrap_err();
        assert!(is_cancelled(&err));

        let plain = anyhow::anyhow!("boom");
        assert_eq!(error_kind(&plain), None);
    }

    #[test]
    fn rapid_failure_message_names_vm() {
        let e = VmError::RapidFailure {
            vm: "client1".into(),
            window: Duration::from_secs(10),
            exit_status: 3,
        };
        let s = e.to_string();
        assert!(s.contains("client1"));
        assert!(s.contains("10s"));
    }
}
