//! Serialized, retried access to the remote tooling session.
//!
//! The session behind [`Guarded`] is not safe for concurrent calls, so each
//! attempt holds its lock for exactly one call. Waits between attempts
//! happen outside the lock and wake on cancellation.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::RpcConfig;
use crate::error::{is_cancelled, VmError};

/// A value with exclusive, closure-scoped access.
pub struct Guarded<S> {
    inner: Mutex<S>,
}

impl<S> Guarded<S> {
    pub fn new(value: S) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn run<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn into_inner(self) -> S {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Whether a read-style result counts as an answer.
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl<T> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.is_some()
    }
}

impl<T> Truthy for Vec<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Number(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub attempts: u32,
    pub sleep: Duration,
}

impl RetryBudget {
    pub fn from_config(cfg: &RpcConfig) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            sleep: Duration::from_secs(cfg.sleep_secs),
        }
    }
}

pub enum RetryOutcome<T> {
    Accepted(T),
    Exhausted {
        attempts: u32,
        last_value: Option<T>,
        last_error: Option<anyhow::Error>,
    },
}

/// Runs `body` up to `budget.attempts` times until it returns a value
/// `accept` likes.
///
/// Errors from `body` count as failed attempts, except cancellation, which
/// ends the loop at once. The only error this returns is cancellation.
pub fn retry_bounded<T>(
    cx: &CancelToken,
    budget: RetryBudget,
    what: &str,
    mut body: impl FnMut(u32) -> Result<T>,
    accept: impl Fn(&T) -> bool,
) -> Result<RetryOutcome<T>> {
    let attempts = budget.attempts.max(1);
    let mut last_value = None;
    let mut last_error = None;

    for attempt in 1..=attempts {
        cx.checkpoint()?;
        match body(attempt) {
            Ok(v) if accept(&v) => {
                if attempt > 1 {
                    info!(what, attempt, "succeeded after retry");
                }
                return Ok(RetryOutcome::Accepted(v));
            }
            Ok(v) => {
                debug!(what, attempt, attempts, "no usable result");
                last_value = Some(v);
            }
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                warn!(what, attempt, attempts, error = format!("{err:#}"), "attempt failed");
                last_error = Some(err);
            }
        }
        if attempt < attempts {
            cx.sleep(budget.sleep)?;
        }
    }

    Ok(RetryOutcome::Exhausted {
        attempts,
        last_value,
        last_error,
    })
}

pub struct RetryingRpcClient<S> {
    session: Guarded<S>,
    cx: CancelToken,
    budget: RetryBudget,
}

impl<S> RetryingRpcClient<S> {
    pub fn new(session: S, cx: CancelToken, budget: RetryBudget) -> Self {
        Self {
            session: Guarded::new(session),
            cx,
            budget,
        }
    }

    pub fn session(&self) -> &Guarded<S> {
        &self.session
    }

    /// One guarded call, no retry.
    pub fn call<T>(&self, body: impl FnOnce(&mut S) -> Result<T>) -> Result<T> {
        self.cx.checkpoint()?;
        self.session.run(body)
    }

    /// Read-style call: retried on errors and on falsy results. When every
    /// attempt misses, returns the last falsy result, or `T::default()` if
    /// there never was one.
    pub fn retry_tools_command<T>(
        &self,
        what: &str,
        mut body: impl FnMut(&mut S) -> Result<T>,
    ) -> Result<T>
    where
        T: Truthy + Default,
    {
        let outcome = retry_bounded(
            &self.cx,
            self.budget,
            what,
            |_| self.session.run(&mut body),
            Truthy::is_truthy,
        )?;
        match outcome {
            RetryOutcome::Accepted(v) => Ok(v),
            RetryOutcome::Exhausted { last_value, .. } => {
                warn!(what, attempts = self.budget.attempts, "tools command gave up");
                Ok(last_value.unwrap_or_default())
            }
        }
    }

    /// State-changing call: retried on error; once the budget is spent the
    /// last failure surfaces as [`VmError::ActionFailed`].
    pub fn retry_action<T>(&self, action: &str, mut body: impl FnMut(&mut S) -> Result<T>) -> Result<T> {
        let outcome = retry_bounded(
            &self.cx,
            self.budget,
            action,
            |attempt| {
                self.session.run(&mut body).map_err(|err| {
                    if is_cancelled(&err) {
                        return err;
                    }
                    anyhow::Error::new(VmError::ActionFailed {
                        action: action.to_string(),
                        attempts: attempt,
                        cause: format!("{err:#}"),
                    })
                })
            },
            |_| true,
        )?;
        match outcome {
            RetryOutcome::Accepted(v) => Ok(v),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
                ..
            } => Err(VmError::ActionFailed {
                action: action.to_string(),
                attempts,
                cause: last_error
                    .and_then(|e| match e.downcast::<VmError>() {
                        Ok(VmError::ActionFailed { cause, .. }) => Some(cause),
                        Ok(other) => Some(other.to_string()),
                        Err(e) => Some(format!("{e:#}")),
                    })
                    .unwrap_or_default(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, VmErrorKind};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Default)]
    struct Session {
        calls: u32,
    }

    fn client(attempts: u32) -> RetryingRpcClient<Session> {
        RetryingRpcClient::new(
            Session::default(),
            CancelToken::new(),
            RetryBudget {
                attempts,
                sleep: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn truthiness() {
        assert!(!false.is_truthy());
        assert!(!None::<u8>.is_truthy());
        assert!(!Vec::<u8>::new().is_truthy());
        assert!(!String::new().is_truthy());
        assert!(!json!(null).is_truthy());
        assert!(!json!({}).is_truthy());
        assert!(json!(0).is_truthy());
        assert!(json!(["x"]).is_truthy());
    }

    #[test]
    fn tools_command_retries_until_truthy() {
        let c = client(5);
        let got = c
            .retry_tools_command("list machines", |s| {
                s.calls += 1;
                if s.calls < 3 {
                    anyhow::bail!("session busy");
                }
                Ok(vec!["studio".to_string()])
            })
            .unwrap();
        assert_eq!(got, ["studio"]);
        assert_eq!(c.session().run(|s| s.calls), 3);
    }

    #[test]
    fn tools_command_returns_last_falsy_after_limit() {
        let c = client(4);
        let got: Option<u32> = c
            .retry_tools_command("find pool", |s| {
                s.calls += 1;
                if s.calls == 4 {
                    anyhow::bail!("late failure");
                }
                Ok(None)
            })
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(c.session().run(|s| s.calls), 4);

        let c = client(2);
        let got: bool = c
            .retry_tools_command("ping", |_| anyhow::bail!("down"))
            .unwrap();
        assert!(!got);
    }

    #[test]
    fn action_failure_carries_attempts_and_cause() {
        let c = client(3);
        let err = c
            .retry_action("queue test", |s| -> Result<()> {
                s.calls += 1;
                anyhow::bail!("rpc timeout #{}", s.calls)
            })
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(VmErrorKind::ActionFailed));
        match err.downcast_ref::<VmError>() {
            Some(VmError::ActionFailed {
                attempts, cause, ..
            }) => {
                assert_eq!(*attempts, 3);
                assert_eq!(cause, "rpc timeout #3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn action_succeeds_on_retry() {
        let c = client(3);
        let v = c
            .retry_action("apply filters", |s| {
                s.calls += 1;
                if s.calls == 1 {
                    anyhow::bail!("transient");
                }
                Ok(s.calls)
            })
            .unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn cancellation_short_circuits_retry() {
        let cx = CancelToken::new();
        let c = Arc::new(RetryingRpcClient::new(
            Session::default(),
            cx.clone(),
            RetryBudget {
                attempts: 100,
                sleep: Duration::from_secs(30),
            },
        ));
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cx.cancel();
        });

        let start = Instant::now();
        let err = c
            .retry_action("run job", |s| -> Result<()> {
                s.calls += 1;
                anyhow::bail!("busy")
            })
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(c.session().run(|s| s.calls), 1);
    }

    #[test]
    fn cancellation_from_body_is_not_retried() {
        let c = client(5);
        let err = c
            .retry_tools_command("ping", |s| -> Result<bool> {
                s.calls += 1;
                Err(VmError::Cancelled.into())
            })
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert_eq!(c.session().run(|s| s.calls), 1);
    }

    #[test]
    fn guarded_serializes_callers() {
        let g = Arc::new(Guarded::new(0u32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = Arc::clone(&g);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        g.run(|n| {
                            let seen = *n;
                            std::thread::yield_now();
                            *n = seen + 1;
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(g.run(|n| *n), 800);
    }
}
