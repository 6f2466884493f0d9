// src/buildtasks/srpm.rs

//! Source package production.
//!
//! The build-requires of a SPEC cannot be known without expanding its
//! macros, and expanding the macros needs the build-requires installed. The
//! task therefore iterates: generate a dep-less source package, read the
//! requirements it reports, admit the new ones as capability tasks, wait,
//! and repeat until the set stops growing. The requirement space is finite
//! and the set only grows, so the loop terminates. A final full generation
//! embeds the real, verified sources.

use std::any::Any;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::artifacts::{SpecFile, SrpmFile};
use crate::capability::Capability;
use crate::config::BuildContext;
use crate::fetch::CancelFlag;
use crate::fsutil;
use crate::rpmcmd::{self, SrpmMode};
use crate::task::{CyclePolicy, Task, TaskCore, TaskKind, ValueCell};

use super::sources::SourcesTask;

pub struct SrpmTask {
    core: TaskCore,
    ctx: Arc<BuildContext>,
    spec: Arc<SpecFile>,
    value: ValueCell<Arc<SrpmFile>>,
}

impl SrpmTask {
    pub fn new(ctx: Arc<BuildContext>, spec: Arc<SpecFile>, dirt: u32) -> Arc<Self> {
        let id = format!("srpm{dirt}_{}", spec.path.display());
        let name = format!(
            "SRPM: {}",
            spec.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec.path.display().to_string())
        );
        Arc::new(SrpmTask {
            core: TaskCore::new(TaskKind::Srpm, id, name, dirt),
            ctx,
            spec,
            value: ValueCell::new(),
        })
    }

    pub async fn value(&self) -> Result<Arc<SrpmFile>> {
        self.value.get(&self.core).await
    }

    /// One generator run: set up a scratch top dir, generate, read the
    /// reported build-requires (`rpmlib` entries dropped), move the result
    /// to this tier's SRPM directory.
    async fn generate(
        &self,
        mode: SrpmMode,
        installed_deps: &[Capability],
    ) -> Result<(std::path::PathBuf, Vec<Capability>)> {
        let config = &self.ctx.config;
        let work_dir = self.core.work_dir(&config.temp_dir)?;
        let top_dir = work_dir.join("topdir");
        let sources_dir = top_dir.join("SOURCES");
        fsutil::ensure_dir(&sources_dir)?;

        let spec_name = self
            .spec
            .path
            .file_name()
            .ok_or_else(|| anyhow!("spec path {} has no file name", self.spec.path.display()))?;
        let spec_copy = sources_dir.join(spec_name);
        fsutil::copy_file(&self.spec.path, &spec_copy)?;

        match mode {
            SrpmMode::DepLess { .. } => {
                // Placeholder sources are enough to expand the requirement
                // macros.
                for source in &self.spec.sources {
                    std::fs::File::create(sources_dir.join(&source.name)).with_context(|| {
                        format!("creating placeholder source '{}'", source.name)
                    })?;
                }
            }
            SrpmMode::Full => {
                let sources_task = self
                    .core
                    .add_dependency(
                        SourcesTask::new(
                            self.ctx.clone(),
                            self.spec.clone(),
                            sources_dir.clone(),
                            CancelFlag::new(),
                        ),
                        CyclePolicy::Reject,
                    )
                    .await?
                    .ok_or_else(|| anyhow!("source hydration task was refused"))?;
                sources_task.value().await?;
            }
        }

        let mut defines = rpmcmd::default_distro_defines(config.do_check, &config.dist_tag);
        rpmcmd::apply_dirty_dist(&mut defines, self.core.dirt());

        self.core.claim_limit(&self.ctx.limiter, 1).await?;
        let generated = rpmcmd::generate_srpm(
            &self.ctx,
            &spec_copy,
            &top_dir,
            installed_deps,
            &defines,
            self.core.dirt(),
            mode,
        )
        .await;
        self.core.release_limit()?;
        let generated = generated?;

        let build_requires: Vec<Capability> = rpmcmd::query_rpm_requires(&generated)
            .await
            .with_context(|| format!("build requires of {}", generated.display()))?
            .into_iter()
            .filter(|capability| !capability.is_rpmlib())
            .collect();

        let file_name = generated
            .file_name()
            .ok_or_else(|| anyhow!("generator returned a bare path"))?;
        let dest = config.srpms_dir(self.core.dirt()).join(file_name);
        fsutil::move_file(&generated, &dest)?;
        std::fs::remove_dir_all(&work_dir).ok();

        Ok((dest, build_requires))
    }
}

#[async_trait]
impl Task for SrpmTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        let mut dep_list: Vec<Capability> = Vec::new();

        if self.ctx.config.add_toolchain_packages {
            let seed = Capability::unversioned(&self.ctx.config.toolchain_package);
            super::admit_build_dependency(&self.core, &self.ctx, &seed).await?;
            dep_list.push(seed);
        }

        // Iterate until the requirement set converges.
        let mut build_requires = Vec::new();
        let mut iteration = 0;
        let mut changed = true;
        while changed {
            iteration += 1;
            info!(
                task = %self.core.name(),
                iteration,
                "generating a dep-less source package to discover requirements"
            );
            let (_, reported) = self
                .generate(
                    SrpmMode::DepLess {
                        dynamic: iteration > 1,
                    },
                    &dep_list,
                )
                .await?;

            changed = false;
            for requirement in &reported {
                if !dep_list.contains(requirement) {
                    changed = true;
                    dep_list.push(requirement.clone());
                    super::admit_build_dependency(&self.core, &self.ctx, requirement).await?;
                }
            }
            build_requires = reported;

            self.core.wait_for_deps().await?;
        }

        debug!(task = %self.core.name(), deps = ?self.core.dep_ids(), "requirements converged");

        // All requirements are available; embed the real sources.
        let (path, _) = self.generate(SrpmMode::Full, &dep_list).await?;
        info!(task = %self.core.name(), srpm = %path.display(), "source package ready");

        self.value.set(Arc::new(SrpmFile {
            source_spec: self.spec.clone(),
            path,
            build_requires,
        }))?;
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
