use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::AbortConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortStep {
    Soft,
    Hard,
    Force,
}

impl AbortStep {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortStep::Soft => "soft",
            AbortStep::Hard => "hard",
            AbortStep::Force => "force",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn default_for_abort() -> Self {
        RetryPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbortPlan {
    pub soft_attempts: u32,
    pub soft_wait: Duration,
    pub hard_timeout: Duration,
    pub force_timeout: Duration,
    pub poll: RetryPolicy,
}

impl AbortPlan {
    pub fn from_config(cfg: &AbortConfig) -> Self {
        AbortPlan {
            soft_attempts: cfg.soft_attempts.max(1),
            soft_wait: Duration::from_secs(cfg.soft_wait_secs),
            hard_timeout: Duration::from_secs(cfg.hard_timeout_secs),
            force_timeout: Duration::from_secs(cfg.force_timeout_secs),
            poll: RetryPolicy::default_for_abort(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResult {
    AlreadyDead,
    StoppedBy(AbortStep),
    Survived,
}

/// What the ladder needs from the thing being stopped.
pub trait AbortBackend {
    fn soft_stop(&self) -> Result<()>;

    fn hard_stop(&self) -> Result<()>;

    fn force_kill(&self) -> Result<()>;

    fn is_dead(&self) -> bool;
}

/// Escalates soft → hard → force until `backend` reports the target dead.
///
/// A failed request is logged and its step still waits out the timeout.
pub fn enforce_abort_plan(plan: &AbortPlan, backend: &dyn AbortBackend, what: &str) -> AbortResult {
    if backend.is_dead() {
        return AbortResult::AlreadyDead;
    }

    for attempt in 1..=plan.soft_attempts.max(1) {
        debug!(vm = what, attempt, "abort: soft stop");
        if let Err(err) = backend.soft_stop() {
            warn!(vm = what, step = "soft", attempt, error = format!("{err:#}"), "abort request failed");
        }
        if wait_dead(backend, plan.soft_wait, plan.poll) {
            info!(vm = what, step = "soft", attempt, "stopped");
            return AbortResult::StoppedBy(AbortStep::Soft);
        }
    }

    let steps: [(AbortStep, Duration, fn(&dyn AbortBackend) -> Result<()>); 2] = [
        (AbortStep::Hard, plan.hard_timeout, |b| b.hard_stop()),
        (AbortStep::Force, plan.force_timeout, |b| b.force_kill()),
    ];
    for (step, timeout, request) in steps {
        info!(vm = what, step = step.as_str(), "abort: escalating");
        if let Err(err) = request(backend) {
            warn!(vm = what, step = step.as_str(), error = format!("{err:#}"), "abort request failed");
        }
        if wait_dead(backend, timeout, plan.poll) {
            info!(vm = what, step = step.as_str(), "stopped");
            return AbortResult::StoppedBy(step);
        }
    }

    warn!(vm = what, "survived every abort step");
    AbortResult::Survived
}

fn wait_dead(backend: &dyn AbortBackend, timeout: Duration, poll: RetryPolicy) -> bool {
    let deadline = Instant::now() + timeout;
    let mut backoff = poll.initial;
    loop {
        if backend.is_dead() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(
            backoff
                .min(deadline.saturating_duration_since(now))
                .max(Duration::from_millis(1)),
        );
        backoff = (backoff * 2).min(poll.max);
    }
}
