// src/lib.rs

pub mod artifacts;
pub mod buildtasks;
pub mod capability;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod fsutil;
pub mod logging;
pub mod repo;
pub mod rpmcmd;
pub mod sandbox;
pub mod specdb;
pub mod task;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::buildtasks::capability::CapabilityTask;
use crate::buildtasks::spec_build::SpecBuildTask;
use crate::capability::Capability;
use crate::cli::CliArgs;
use crate::config::{BuildConfig, BuildContext};
use crate::task::scheduler::{ExecMode, Scheduler};
use crate::task::{CyclePolicy, Task};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config validation and the on-disk layout
/// - the scheduler, resource limiter and sandbox
/// - the root goals (spec builds and/or capability resolutions)
/// - periodic progress and graph reporting
pub async fn run(args: CliArgs) -> Result<()> {
    if args.specs.is_empty() && args.capabilities.is_empty() {
        bail!("nothing to build: pass --specs and/or --capabilities");
    }

    let config = BuildConfig::from_args(&args)?;
    config.ensure_layout()?;
    let ctx = Arc::new(BuildContext::new(config, args.limiter_capacity));

    let mode = if args.sequential {
        ExecMode::Sequential
    } else {
        ExecMode::Concurrent
    };
    let scheduler = Scheduler::new(
        ctx.config.max_dirt,
        mode,
        ctx.config.toolchain_package.clone(),
    );

    let progress = scheduler.spawn_progress_reporter();
    let graph_writer = spawn_graph_writer(scheduler.clone(), ctx.clone());

    // Root goals. Spec builds and capability resolutions anchor at the
    // synthetic root; everything else is admitted on demand.
    let mut spec_goals = Vec::new();
    for spec_path in &args.specs {
        let goal = admit_goal(
            &scheduler,
            SpecBuildTask::new(ctx.clone(), spec_path.clone(), 0),
        )
        .await?;
        spec_goals.push(goal);
    }

    let mut capability_goals = Vec::new();
    for raw in &args.capabilities {
        let capability = Capability::from_str(raw)
            .map_err(|err| anyhow!("invalid --capabilities entry '{raw}': {err}"))?;
        let goal = admit_goal(&scheduler, CapabilityTask::new(ctx.clone(), capability, 0)).await?;
        capability_goals.push(goal);
    }

    for goal in spec_goals {
        let built = goal.value().await?;
        info!(spec = %built.path.display(), "goal spec built");
        for rpm in &built.provided_rpms {
            info!(rpm = %rpm.path.display(), "  produced");
        }
    }
    for goal in capability_goals {
        let binding = goal.value().await?;
        info!(
            capability = %binding.capability,
            package = %binding.package.path.display(),
            "goal capability bound"
        );
    }

    progress.abort();
    graph_writer.abort();

    let (done, total) = scheduler.counts();
    info!(done, total, "all goals complete");
    scheduler
        .write_dot_files(&ctx.config.build_dir)
        .context("writing final dependency graphs")?;
    Ok(())
}

/// Admit a root goal and hand back its concrete-typed canonical handle.
async fn admit_goal<T: Task>(scheduler: &Arc<Scheduler>, task: Arc<T>) -> Result<Arc<T>> {
    let canonical = scheduler
        .add_task(None, task, CyclePolicy::Reject)
        .await?
        .ok_or_else(|| anyhow!("root goal was refused by the scheduler"))?;
    canonical
        .clone()
        .as_any()
        .downcast()
        .map_err(|_| anyhow!("goal id '{}' used by a different task type", canonical.core().id()))
}

/// Periodically refresh `graph.dot` / `graph_full.dot` under the build dir.
fn spawn_graph_writer(
    scheduler: Arc<Scheduler>,
    ctx: Arc<BuildContext>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = scheduler.write_dot_files(&ctx.config.build_dir) {
                debug!(error = %format!("{err:#}"), "graph refresh failed");
            }
        }
    })
}
