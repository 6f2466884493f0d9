// src/buildtasks/spec_build.rs

//! Binary package production for one SPEC at one dirt level.
//!
//! Depends on the SPEC's source package and on a capability task per
//! reported build-require, then rebuilds inside the sandbox against the
//! overlay repositories for this dirt level. Artifacts land in the tier's
//! RPMs directory with their architecture subpath preserved; dirty tiers
//! are visible in the file names through the dist-tag suffix.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::artifacts::{RpmFile, SpecFile};
use crate::config::BuildContext;
use crate::fsutil;
use crate::rpmcmd;
use crate::task::{CyclePolicy, Task, TaskCore, TaskKind, ValueCell};

use super::srpm::SrpmTask;

pub struct SpecBuildTask {
    core: TaskCore,
    ctx: Arc<BuildContext>,
    spec_path: PathBuf,
    value: ValueCell<Arc<SpecFile>>,
}

impl SpecBuildTask {
    pub fn new(ctx: Arc<BuildContext>, spec_path: PathBuf, dirt: u32) -> Arc<Self> {
        let id = format!("build{dirt}_{}", spec_path.display());
        let name = format!(
            "BUILD: {}",
            spec_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec_path.display().to_string())
        );
        Arc::new(SpecBuildTask {
            core: TaskCore::new(TaskKind::SpecBuild, id, name, dirt),
            ctx,
            spec_path,
            value: ValueCell::new(),
        })
    }

    pub async fn value(&self) -> Result<Arc<SpecFile>> {
        self.value.get(&self.core).await
    }

    /// Rebuild the SRPM in the sandbox and move the artifacts into this
    /// tier's RPMs directory, keeping the builder's arch subpaths.
    async fn build_packages(
        &self,
        srpm: &crate::artifacts::SrpmFile,
    ) -> Result<Vec<PathBuf>> {
        let config = &self.ctx.config;
        let work_dir = self.core.work_dir(&config.temp_dir)?;
        let top_dir = work_dir.join("topdir");
        let srpms_dir = top_dir.join("SRPMS");
        fsutil::ensure_dir(&srpms_dir)?;

        let srpm_name = srpm
            .path
            .file_name()
            .ok_or_else(|| anyhow!("srpm path {} has no file name", srpm.path.display()))?;
        let srpm_copy = srpms_dir.join(srpm_name);
        fsutil::copy_file(&srpm.path, &srpm_copy)?;

        let mut defines = rpmcmd::default_distro_defines(config.do_check, &config.dist_tag);
        rpmcmd::apply_dirty_dist(&mut defines, self.core.dirt());

        self.core.claim_limit(&self.ctx.limiter, 1).await?;
        let built = rpmcmd::build_rpm_from_srpm(
            &self.ctx,
            &srpm_copy,
            &config.arch,
            &top_dir,
            &srpm.build_requires,
            &defines,
            self.core.dirt(),
        )
        .await;
        self.core.release_limit()?;
        built?;

        let moved = rpmcmd::collect_built_rpms(&top_dir, config.rpms_dir(self.core.dirt()))
            .with_context(|| format!("collecting packages built from {}", srpm.path.display()))?;
        std::fs::remove_dir_all(&work_dir).ok();

        if moved.is_empty() {
            return Err(anyhow!(
                "build of {} produced no packages",
                srpm.path.display()
            ));
        }
        Ok(moved)
    }
}

#[async_trait]
impl Task for SpecBuildTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        let spec = Arc::new(
            SpecFile::query(&self.spec_path, self.core.dirt(), &self.ctx.config).await?,
        );

        let srpm_task = self
            .core
            .add_dependency(
                SrpmTask::new(self.ctx.clone(), spec.clone(), self.core.dirt()),
                CyclePolicy::Reject,
            )
            .await?
            .ok_or_else(|| {
                anyhow!("source package task for {} was refused", spec.path.display())
            })?;
        let srpm = srpm_task.value().await?;

        for requirement in &srpm.build_requires {
            if !requirement.is_rpmlib() {
                super::admit_build_dependency(&self.core, &self.ctx, requirement).await?;
            }
        }
        debug!(task = %self.core.name(), deps = ?self.core.dep_ids(), "waiting on dependencies");
        self.core.wait_for_deps().await?;

        let built_paths = self.build_packages(&srpm).await?;

        let mut provided_rpms = Vec::with_capacity(built_paths.len());
        for path in built_paths {
            provided_rpms.push(RpmFile::from_file(path).await?);
        }
        provided_rpms.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            task = %self.core.name(),
            packages = provided_rpms.len(),
            "spec built"
        );
        self.value.set(Arc::new(SpecFile {
            path: spec.path.clone(),
            provided_rpms,
            predicted_provides: spec.predicted_provides.clone(),
            sources: spec.sources.clone(),
        }))?;
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
