use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pkgforge::task::limiter::ResourceLimiter;
use pkgforge::task::scheduler::{ExecMode, Scheduler};
use pkgforge::task::{CyclePolicy, Task, TaskCore, TaskKind};

#[tokio::test]
async fn oversized_weight_is_clamped_to_capacity() -> Result<()> {
    let limiter = ResourceLimiter::new(2);

    // Far larger than the capacity; must still be acquirable alone.
    let lease = limiter.acquire("heavy", 100).await?;
    assert_eq!(lease.weight(), 2);
    assert_eq!(limiter.available(), 0);

    drop(lease);
    assert_eq!(limiter.available(), 2);
    Ok(())
}

#[tokio::test]
async fn capacity_one_serializes_heavy_sections() -> Result<()> {
    struct HeavyTask {
        core: TaskCore,
        limiter: Arc<ResourceLimiter>,
        active: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for HeavyTask {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        async fn execute(self: Arc<Self>) -> Result<()> {
            self.core.claim_limit(&self.limiter, 1).await?;

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.core.release_limit()?;
            self.core.set_done()
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    let limiter = Arc::new(ResourceLimiter::new(1));
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let scheduler = Scheduler::new(2, ExecMode::Concurrent, "core-toolchain");
    let mut goals = Vec::new();
    for i in 0..2 {
        let task = Arc::new(HeavyTask {
            core: TaskCore::new(TaskKind::Cache, format!("heavy_{i}"), "heavy", 0),
            limiter: limiter.clone(),
            active: active.clone(),
            max_seen: max_seen.clone(),
        });
        goals.push(
            scheduler
                .add_task(None, task, CyclePolicy::Reject)
                .await?
                .expect("admission refused"),
        );
    }

    for goal in &goals {
        goal.core().wait_done().await?;
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(active.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn adding_dependencies_while_holding_the_limiter_fails_fast() -> Result<()> {
    struct InertTask {
        core: TaskCore,
    }

    impl std::fmt::Debug for InertTask {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InertTask").field("id", &self.core.id()).finish()
        }
    }

    #[async_trait]
    impl Task for InertTask {
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

    let limiter = ResourceLimiter::new(4);
    let holder = InertTask {
        core: TaskCore::new(TaskKind::Srpm, "holder", "holder", 0),
    };
    holder.core.claim_limit(&limiter, 1).await?;

    let child = Arc::new(InertTask {
        core: TaskCore::new(TaskKind::Capability, "child", "child", 0),
    });
    let err = holder
        .core
        .add_dependency(child, CyclePolicy::Reject)
        .await
        .expect_err("dependency admission while holding the limiter must fail");
    assert!(err.to_string().contains("limiter"));

    // Completing while still holding the lease is equally wrong.
    let err = holder.core.set_done().expect_err("done while holding must fail");
    assert!(err.to_string().contains("limiter"));

    holder.core.release_limit()?;
    holder.core.set_done()?;

    // A second claim after release is fine; a double release is not.
    let err = holder.core.release_limit().expect_err("double release");
    assert!(err.to_string().contains("not claimed"));
    Ok(())
}
