//! Dynamic-extent ownership of OS resources.
//!
//! Everything registered in a [`Scope`] is released exactly once, in reverse
//! registration order, when the scope ends: on success, on error, on panic
//! and on cancellation. Release runs under a teardown mask; a cancellation
//! that arrived meanwhile is reported after the last release.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// A resource whose lifetime a [`Scope`] can own.
pub trait Resource: Send + Sync {
    fn describe(&self) -> String;

    fn release(&self) -> Result<()>;
}

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct Entry {
    name: String,
    release: ReleaseFn,
}

pub struct Scope {
    cx: CancelToken,
    entries: Vec<Entry>,
}

/// Runs `body` inside a fresh scope.
///
/// If `body` succeeds but the run was cancelled while it ran or while the
/// scope was releasing, the result is replaced by the cancellation error.
pub fn open<T>(cx: &CancelToken, body: impl FnOnce(&mut Scope) -> Result<T>) -> Result<T> {
    cx.checkpoint()?;
    let mut scope = Scope::new(cx.clone());
    let out = body(&mut scope);
    scope.release_all();
    let out = out?;
    cx.checkpoint()?;
    Ok(out)
}

impl Scope {
    fn new(cx: CancelToken) -> Self {
        Self {
            cx,
            entries: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cx
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a release operation for something already acquired.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        release: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> &mut Self {
        let name = name.into();
        debug!(resource = %name, depth = self.entries.len(), "scope: registered");
        self.entries.push(Entry {
            name,
            release: Box::new(release),
        });
        self
    }

    /// Registers a shared resource and hands it back for further use.
    pub fn adopt<R: Resource + 'static>(&mut self, resource: Arc<R>) -> Arc<R> {
        let held = Arc::clone(&resource);
        self.push(resource.describe(), move || held.release());
        resource
    }

    /// Runs a multi-step acquisition that either fully joins this scope or
    /// fully unwinds.
    ///
    /// Registrations made by `body` go to a private list. On success that
    /// list is spliced onto this scope as-is; nothing is re-acquired. On
    /// failure every entry in it is released immediately.
    pub fn transaction<T>(&mut self, body: impl FnOnce(&mut Scope) -> Result<T>) -> Result<T> {
        self.cx.checkpoint()?;
        let mut inner = Scope::new(self.cx.clone());
        match body(&mut inner) {
            Ok(v) => {
                self.entries.append(&mut inner.entries);
                Ok(v)
            }
            Err(err) => {
                debug!(pending = inner.entries.len(), error = %err, "scope: transaction failed; unwinding");
                inner.release_all();
                Err(err)
            }
        }
    }

    fn release_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let _mask = self.cx.mask();
        while let Some(entry) = self.entries.pop() {
            debug!(resource = %entry.name, "scope: releasing");
            if let Err(err) = (entry.release)() {
                warn!(resource = %entry.name, error = format!("{err:#}"), "scope: release failed");
            }
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release_all();
    }
}
