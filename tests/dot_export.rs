use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use pkgforge::task::scheduler::{ExecMode, Scheduler};
use pkgforge::task::{CyclePolicy, Task, TaskCore, TaskKind};

struct StubTask {
    core: TaskCore,
}

impl StubTask {
    fn new(kind: TaskKind, id: &str, dirt: u32) -> Arc<Self> {
        Arc::new(StubTask {
            core: TaskCore::new(kind, id, id, dirt),
        })
    }
}

#[async_trait]
impl Task for StubTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

async fn sample_scheduler() -> Result<Arc<Scheduler>> {
    let scheduler = Scheduler::new(2, ExecMode::Sequential, "core-toolchain");

    let build = scheduler
        .add_task(
            None,
            StubTask::new(TaskKind::SpecBuild, "build0_foo.spec", 0),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");
    let srpm = scheduler
        .add_task(
            Some(&build.core().key()),
            StubTask::new(TaskKind::Srpm, "srpm0_foo.spec", 0),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");
    scheduler
        .add_task(
            Some(&srpm.core().key()),
            StubTask::new(TaskKind::SpecDb, "spec-db", 0),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");
    scheduler
        .add_task(
            Some(&srpm.core().key()),
            StubTask::new(TaskKind::Capability, "cap2_core-toolchain", 2),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");
    scheduler
        .add_task(
            Some(&srpm.core().key()),
            StubTask::new(TaskKind::Capability, "cap0_zlib", 0),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");

    Ok(scheduler)
}

fn render(scheduler: &Scheduler) -> Result<(String, String)> {
    let mut full = Vec::new();
    let mut clean = Vec::new();
    scheduler.write_dot(&mut full, &mut clean)?;
    Ok((String::from_utf8(full)?, String::from_utf8(clean)?))
}

#[tokio::test]
async fn the_full_view_preserves_every_node_and_edge() -> Result<()> {
    let scheduler = sample_scheduler().await?;
    let (full, _) = render(&scheduler)?;

    for id in [
        "graph-root",
        "build0_foo.spec",
        "srpm0_foo.spec",
        "spec-db",
        "cap2_core-toolchain",
        "cap0_zlib",
    ] {
        assert!(full.contains(&format!("\"{id}\" [")), "missing node {id}");
    }

    assert!(full.contains("\"build0_foo.spec\" -> \"srpm0_foo.spec\";"));
    assert!(full.contains("\"srpm0_foo.spec\" -> \"cap0_zlib\";"));
    assert!(full.contains("\"graph-root\" -> \"build0_foo.spec\";"));
    Ok(())
}

#[tokio::test]
async fn the_clean_view_prunes_the_documented_noise() -> Result<()> {
    let scheduler = sample_scheduler().await?;
    let (_, clean) = render(&scheduler)?;

    // The spec-DB loader, the max-dirt toolchain capability and the
    // synthetic root are gone.
    assert!(!clean.contains("\"spec-db\""));
    assert!(!clean.contains("\"cap2_core-toolchain\""));
    assert!(!clean.contains("\"graph-root\""));

    // The real build chain survives.
    assert!(clean.contains("\"build0_foo.spec\" ["));
    assert!(clean.contains("\"srpm0_foo.spec\" ["));
    assert!(clean.contains("\"cap0_zlib\" ["));
    assert!(clean.contains("\"build0_foo.spec\" -> \"srpm0_foo.spec\";"));
    Ok(())
}

#[tokio::test]
async fn a_toolchain_capability_below_max_dirt_survives_pruning() -> Result<()> {
    let scheduler = Scheduler::new(2, ExecMode::Sequential, "core-toolchain");
    let goal = scheduler
        .add_task(
            None,
            StubTask::new(TaskKind::SpecBuild, "build0_bar.spec", 0),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");
    scheduler
        .add_task(
            Some(&goal.core().key()),
            StubTask::new(TaskKind::Capability, "cap1_core-toolchain", 1),
            CyclePolicy::Reject,
        )
        .await?
        .expect("admission refused");

    let (_, clean) = render(&scheduler)?;
    assert!(clean.contains("\"cap1_core-toolchain\" ["));
    Ok(())
}

#[tokio::test]
async fn done_tasks_are_highlighted() -> Result<()> {
    let scheduler = sample_scheduler().await?;
    let (full, _) = render(&scheduler)?;

    // Sequential mode ran everything to completion already.
    assert!(full.contains("color=\"green\""));
    Ok(())
}
