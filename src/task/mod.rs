// src/task/mod.rs

//! The unit of scheduled work.
//!
//! A task has an identity `(kind, dirt, subject)` rendered into an id
//! string, a completion signal closed exactly once, and a dependency list
//! filled in while the task body runs. Dependencies are registered through
//! the scheduler, which de-duplicates by identity and refuses admissions
//! that would close a cycle — the caller reacts to that refusal by asking
//! for the same work at a higher dirt level.
//!
//! - [`limiter`] is the global weighted semaphore for heavy operations.
//! - [`scheduler`] owns the DAG and drives execution.

pub mod limiter;
pub mod scheduler;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::fsutil;
use self::limiter::{LimiterLease, ResourceLimiter};
use self::scheduler::Scheduler;

/// Role of a task; drives progress display and graph export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Root,
    SpecDb,
    Capability,
    Cache,
    Srpm,
    SpecBuild,
    Sources,
}

/// The scheduler de-duplicates tasks by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub id: String,
    pub dirt: u32,
}

/// Whether an admission may create a self-edge.
///
/// A task depending on its own canonical self is normally a cycle like any
/// other; a few call sites tolerate it (a goal re-requested at top level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePolicy {
    Reject,
    AllowSelf,
}

/// A schedulable unit of work.
///
/// Implementations embed a [`TaskCore`] and put their body in `execute`,
/// which runs exactly once. Errors returned from `execute` are fatal to the
/// whole build.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn core(&self) -> &TaskCore;

    async fn execute(self: Arc<Self>) -> Result<()>;

    /// Upcast for downcasting a canonical handle back to its concrete type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.core().id()).finish()
    }
}

/// Shared state and behavior embedded in every task.
pub struct TaskCore {
    kind: TaskKind,
    id: String,
    name: String,
    dirt: u32,
    deps: Mutex<Vec<Arc<dyn Task>>>,
    done: watch::Sender<bool>,
    limiter_lease: Mutex<Option<LimiterLease>>,
    scheduler: OnceLock<Weak<Scheduler>>,
}

impl TaskCore {
    pub fn new(kind: TaskKind, id: impl Into<String>, name: impl Into<String>, dirt: u32) -> Self {
        TaskCore {
            kind,
            id: id.into(),
            name: name.into(),
            dirt,
            deps: Mutex::new(Vec::new()),
            done: watch::channel(false).0,
            limiter_lease: Mutex::new(None),
            scheduler: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dirt(&self) -> u32 {
        self.dirt
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            id: self.id.clone(),
            dirt: self.dirt,
        }
    }

    /// True once the completion signal has been closed.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Block until the task is done.
    pub async fn wait_done(&self) -> Result<()> {
        let mut rx = self.done.subscribe();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| anyhow!("completion signal of task '{}' was dropped", self.id))?;
        Ok(())
    }

    /// Close the completion signal. Must be called exactly once, and never
    /// while a limiter lease is still held.
    pub fn set_done(&self) -> Result<()> {
        if self.holds_limiter() {
            bail!(
                "task '{}' still holds the resource limiter, cannot mark done",
                self.id
            );
        }
        let was_done = self.done.send_replace(true);
        if was_done {
            bail!("task '{}' marked done twice", self.id);
        }
        debug!(task = %self.name, "done");
        Ok(())
    }

    /// Called by the scheduler at admission; binds this task to it.
    pub(crate) fn attach_scheduler(&self, scheduler: Weak<Scheduler>) {
        let _ = self.scheduler.set(scheduler);
    }

    fn scheduler(&self) -> Result<Arc<Scheduler>> {
        self.scheduler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("task '{}' is not bound to a scheduler", self.id))
    }

    /// Register a dependency through the scheduler.
    ///
    /// The returned handle is the canonical task, which may be a
    /// pre-existing one with the same identity. `Ok(None)` means the
    /// admission would close a cycle and the caller must fall back
    /// (typically by requesting the same work at `dirt + 1`).
    pub async fn add_dependency<C: Task>(
        &self,
        child: Arc<C>,
        policy: CyclePolicy,
    ) -> Result<Option<Arc<C>>> {
        if self.holds_limiter() {
            bail!(
                "task '{}' holds the resource limiter, cannot add dependency '{}'",
                self.id,
                child.core().id()
            );
        }

        info!(
            task = %self.name,
            dep = %child.core().id(),
            "adding dependency"
        );

        let scheduler = self.scheduler()?;
        let Some(canonical) = scheduler.add_task(Some(&self.key()), child, policy).await? else {
            info!(task = %self.name, "dependency refused: would close a cycle");
            return Ok(None);
        };

        let typed: Arc<C> = canonical
            .clone()
            .as_any()
            .downcast()
            .map_err(|_| {
                anyhow!(
                    "task id '{}' is already used by a different task type",
                    canonical.core().id()
                )
            })?;

        self.deps
            .lock()
            .expect("task deps lock poisoned")
            .push(canonical);
        Ok(Some(typed))
    }

    /// Block until every registered dependency is done.
    pub async fn wait_for_deps(&self) -> Result<()> {
        let deps: Vec<Arc<dyn Task>> = self
            .deps
            .lock()
            .expect("task deps lock poisoned")
            .clone();
        for dep in deps {
            dep.core().wait_done().await?;
        }
        Ok(())
    }

    /// Ids of the registered dependencies, for logging.
    pub fn dep_ids(&self) -> Vec<String> {
        self.deps
            .lock()
            .expect("task deps lock poisoned")
            .iter()
            .map(|dep| dep.core().id().to_string())
            .collect()
    }

    /// Claim a share of the global resource limiter. A task holds at most
    /// one lease at a time; while held, no dependencies may be added.
    pub async fn claim_limit(&self, limiter: &ResourceLimiter, weight: u32) -> Result<()> {
        if self.holds_limiter() {
            bail!("task '{}' has already claimed the limiter", self.id);
        }
        let lease = limiter.acquire(&self.name, weight).await?;
        *self
            .limiter_lease
            .lock()
            .expect("limiter lease lock poisoned") = Some(lease);
        Ok(())
    }

    /// Return the previously claimed limiter share.
    pub fn release_limit(&self) -> Result<()> {
        let lease = self
            .limiter_lease
            .lock()
            .expect("limiter lease lock poisoned")
            .take();
        if lease.is_none() {
            bail!("task '{}' has not claimed the limiter", self.id);
        }
        Ok(())
    }

    fn holds_limiter(&self) -> bool {
        self.limiter_lease
            .lock()
            .expect("limiter lease lock poisoned")
            .is_some()
    }

    /// Create a scratch directory for this task under `temp_dir`.
    pub fn work_dir(&self, temp_dir: &Path) -> Result<PathBuf> {
        let prefix = format!("task-{}-", fsutil::sanitize_for_path(&self.id));
        fsutil::scratch_dir(temp_dir, &prefix)
            .with_context(|| format!("creating work dir for task '{}'", self.id))
    }
}

/// Result slot of a typed task: written once by the owning task before it
/// signals completion, read by anyone holding the handle afterwards.
pub struct ValueCell<T> {
    slot: OnceLock<T>,
}

impl<T: Clone + Send + Sync> ValueCell<T> {
    pub fn new() -> Self {
        ValueCell {
            slot: OnceLock::new(),
        }
    }

    /// Store the result. Must happen before `set_done`.
    pub fn set(&self, value: T) -> Result<()> {
        self.slot
            .set(value)
            .map_err(|_| anyhow!("task value set twice"))
    }

    /// Wait for the owning task to finish, then return a copy of the result.
    pub async fn get(&self, core: &TaskCore) -> Result<T> {
        debug!(task = %core.name(), "waiting for value");
        core.wait_done().await?;
        self.slot
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("task '{}' finished without setting a value", core.id()))
    }
}

impl<T: Clone + Send + Sync> Default for ValueCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
