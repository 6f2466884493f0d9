// src/buildtasks/mod.rs

//! The build-task family.
//!
//! - [`spec_data`] loads the spec database once, as a degenerate task.
//! - [`capability`] maps a capability to the concrete package providing it.
//! - [`cache`] resolves a capability against the repository tiers and the
//!   upstream cache.
//! - [`srpm`] converges on a SPEC's build-requires and produces its source
//!   package.
//! - [`spec_build`] turns a source package into binary packages.
//! - [`sources`] gathers and verifies a SPEC's source inputs.

pub mod cache;
pub mod capability;
pub mod sources;
pub mod spec_build;
pub mod spec_data;
pub mod srpm;

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use crate::capability::Capability;
use crate::config::BuildContext;
use crate::task::{CyclePolicy, TaskCore};

use self::capability::CapabilityTask;

/// Admit a capability as a build dependency at the caller's dirt level,
/// raising the level once if the admission would close a cycle. Failing at
/// both levels is fatal: the dependency cannot be scheduled at all.
pub(crate) async fn admit_build_dependency(
    core: &TaskCore,
    ctx: &Arc<BuildContext>,
    capability: &Capability,
) -> Result<()> {
    let dirt = core.dirt();
    let admitted = core
        .add_dependency(
            CapabilityTask::new(ctx.clone(), capability.clone(), dirt),
            CyclePolicy::Reject,
        )
        .await?;
    if admitted.is_some() {
        return Ok(());
    }

    info!(
        task = %core.name(),
        dependency = %capability,
        "build dependency would close a cycle, raising dirt level"
    );

    let raised = dirt + 1;
    if raised <= ctx.config.max_dirt {
        let admitted = core
            .add_dependency(
                CapabilityTask::new(ctx.clone(), capability.clone(), raised),
                CyclePolicy::Reject,
            )
            .await?;
        if admitted.is_some() {
            return Ok(());
        }
    }

    bail!(
        "cannot schedule build dependency '{capability}' at dirt {dirt} or {raised}"
    )
}
