// src/buildtasks/capability.rs

//! Capability resolution: map a required capability to the concrete package
//! that provides it.
//!
//! Resolution order:
//! 1. reuse the same capability already resolved at a lower (cleaner) dirt
//!    level, when depending on it does not close a cycle;
//! 2. build the producing SPEC known to the spec database, escalating the
//!    dirt level while admissions keep closing cycles;
//! 3. fall back to the cache lookup one dirt level up — forced once the
//!    maximum dirt level is reached or no producing SPEC is known.
//!
//! The bound package's runtime requirements are then admitted as capability
//! tasks at the same dirt level, so the closure converges.

use std::any::Any;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::artifacts::{RpmFile, SpecFile};
use crate::capability::Capability;
use crate::config::BuildContext;
use crate::rpmcmd;
use crate::task::{CyclePolicy, Task, TaskCore, TaskKind, ValueCell};

use super::cache::CacheTask;
use super::spec_build::SpecBuildTask;

/// The stable result of a capability task: the requirement, the package
/// satisfying it, and the bindings of its direct runtime requirements.
#[derive(Debug, Clone)]
pub struct CapabilityBinding {
    pub capability: Capability,
    pub package: Arc<RpmFile>,
    pub runtime_deps: Vec<CapabilityBinding>,
}

pub struct CapabilityTask {
    core: TaskCore,
    ctx: Arc<BuildContext>,
    capability: Capability,
    value: ValueCell<CapabilityBinding>,
}

impl CapabilityTask {
    pub fn new(ctx: Arc<BuildContext>, capability: Capability, dirt: u32) -> Arc<Self> {
        let id = format!("cap{dirt}_{capability}");
        let name = format!("CAP: {capability}");
        Arc::new(CapabilityTask {
            core: TaskCore::new(TaskKind::Capability, id, name, dirt),
            ctx,
            capability,
            value: ValueCell::new(),
        })
    }

    pub async fn value(&self) -> Result<CapabilityBinding> {
        self.value.get(&self.core).await
    }

    /// Try to reuse this capability resolved at a lower dirt level. The
    /// first admission that does not close a cycle wins.
    async fn reuse_cleaner_tier(&self) -> Result<Option<Arc<RpmFile>>> {
        for lower in 0..self.core.dirt() {
            let existing = self
                .core
                .add_dependency(
                    CapabilityTask::new(self.ctx.clone(), self.capability.clone(), lower),
                    CyclePolicy::Reject,
                )
                .await?;
            if let Some(task) = existing {
                info!(
                    capability = %self.capability,
                    dirt = lower,
                    "reusing the capability from a cleaner tier"
                );
                let binding = task.value().await?;
                return Ok(Some(binding.package));
            }
        }
        Ok(None)
    }

    /// Delegate to the cache lookup at the given allowed dirt level.
    async fn fetch_cached(&self, allowable_dirt: u32) -> Result<Arc<RpmFile>> {
        let cache_task = self
            .core
            .add_dependency(
                CacheTask::new(self.ctx.clone(), self.capability.clone(), allowable_dirt),
                CyclePolicy::Reject,
            )
            .await?
            .ok_or_else(|| anyhow!("cache lookup for '{}' was refused", self.capability))?;

        let entry = cache_task.value().await?;
        let package = RpmFile::from_file(entry.path).await?;
        Ok(Arc::new(package))
    }

    /// Build the producing SPEC, escalating the dirt level while admissions
    /// keep closing cycles. Returns `None` when every buildable level is
    /// exhausted and the cache must take over.
    async fn build_spec(&self, spec_path: &std::path::Path) -> Result<Option<Arc<SpecBuildTask>>> {
        let mut level = self.core.dirt();
        while level < self.ctx.config.max_dirt {
            let admitted = self
                .core
                .add_dependency(
                    SpecBuildTask::new(self.ctx.clone(), spec_path.to_path_buf(), level),
                    CyclePolicy::Reject,
                )
                .await?;
            match admitted {
                Some(task) => return Ok(Some(task)),
                None => {
                    info!(
                        capability = %self.capability,
                        dirt = level + 1,
                        "build would close a cycle, queueing a dirtier copy"
                    );
                    level += 1;
                }
            }
        }
        Ok(None)
    }

    /// Pick from the built packages the one whose matching provide covers
    /// the required version interval.
    fn select_provide(&self, built: &SpecFile) -> Result<Arc<RpmFile>> {
        for rpm in &built.provided_rpms {
            for provide in &rpm.capabilities {
                if provide.satisfies(&self.capability) {
                    return Ok(Arc::new(rpm.clone()));
                }
            }
        }
        Err(anyhow!(
            "no package built from {} provides '{}'",
            built.path.display(),
            self.capability
        ))
    }

    /// Admit the bound package's runtime requirements at this dirt level
    /// and gather their bindings.
    async fn collect_runtime_deps(&self, package: &RpmFile) -> Result<Vec<CapabilityBinding>> {
        let requires = rpmcmd::query_rpm_requires(&package.path)
            .await
            .with_context(|| format!("runtime requires of {}", package.path.display()))?;

        let mut dep_tasks = Vec::new();
        for requirement in requires.into_iter().filter(|r| !r.is_rpmlib()) {
            let mut admitted = None;
            let mut level = self.core.dirt();
            loop {
                let attempt = self
                    .core
                    .add_dependency(
                        CapabilityTask::new(self.ctx.clone(), requirement.clone(), level),
                        CyclePolicy::Reject,
                    )
                    .await?;
                match attempt {
                    Some(task) => {
                        admitted = Some(task);
                        break;
                    }
                    None if level < self.ctx.config.max_dirt => level += 1,
                    None => break,
                }
            }

            match admitted {
                Some(task) => dep_tasks.push(task),
                // Mutual runtime requirements are legal between packages;
                // past the last dirt level the cycle is left to the
                // installer rather than deadlocking the build.
                None => warn!(
                    capability = %self.capability,
                    requirement = %requirement,
                    "runtime requirement cycles at every dirt level, not awaited"
                ),
            }
        }

        let mut bindings = Vec::with_capacity(dep_tasks.len());
        for task in dep_tasks {
            bindings.push(task.value().await?);
        }
        Ok(bindings)
    }
}

#[async_trait]
impl Task for CapabilityTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        let db_task = self
            .core
            .add_dependency(
                super::spec_data::SpecDbTask::new(self.ctx.clone()),
                CyclePolicy::Reject,
            )
            .await?
            .ok_or_else(|| anyhow!("spec database task was refused"))?;
        let spec_db = db_task.value().await?;

        let dirt = self.core.dirt();
        let max_dirt = self.ctx.config.max_dirt;

        let mut package = self.reuse_cleaner_tier().await?;

        if package.is_none() {
            package = Some(match spec_db.lookup(&self.capability) {
                None => {
                    warn!(
                        capability = %self.capability,
                        "no producing spec known, falling back to the cache"
                    );
                    self.fetch_cached(dirt + 1).await?
                }
                Some(_) if dirt >= max_dirt => self.fetch_cached(dirt + 1).await?,
                Some(entry) => {
                    let spec_path = entry.spec_path.clone();
                    match self.build_spec(&spec_path).await? {
                        Some(build_task) => {
                            let built = build_task.value().await?;
                            self.select_provide(&built)?
                        }
                        None => {
                            info!(
                                capability = %self.capability,
                                "every buildable dirt level cycles, using the cache"
                            );
                            self.fetch_cached(dirt + 1).await?
                        }
                    }
                }
            });
        }

        let package = package.ok_or_else(|| {
            anyhow!("capability '{}' could not be resolved", self.capability)
        })?;

        let runtime_deps = self.collect_runtime_deps(&package).await?;

        info!(
            capability = %self.capability,
            package = %package.path.display(),
            "capability bound"
        );
        self.value.set(CapabilityBinding {
            capability: self.capability.clone(),
            package,
            runtime_deps,
        })?;
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
