// src/buildtasks/spec_data.rs

//! One-shot loader task for the spec database.
//!
//! Every task that needs the database depends on this one, so the load
//! happens exactly once and the handle has a normal task lifecycle.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::config::BuildContext;
use crate::specdb::SpecDb;
use crate::task::{Task, TaskCore, TaskKind, ValueCell};

pub struct SpecDbTask {
    core: TaskCore,
    ctx: Arc<BuildContext>,
    value: ValueCell<Arc<SpecDb>>,
}

impl SpecDbTask {
    pub fn new(ctx: Arc<BuildContext>) -> Arc<Self> {
        Arc::new(SpecDbTask {
            core: TaskCore::new(TaskKind::SpecDb, "spec-db", "SPEC-DB", 0),
            ctx,
            value: ValueCell::new(),
        })
    }

    pub async fn value(&self) -> Result<Arc<SpecDb>> {
        self.value.get(&self.core).await
    }
}

#[async_trait]
impl Task for SpecDbTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        let db = SpecDb::load(&self.ctx.config.spec_data)?;
        info!(entries = db.len(), "spec database ready");
        self.value.set(Arc::new(db))?;
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
