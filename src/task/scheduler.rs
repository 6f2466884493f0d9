// src/task/scheduler.rs

//! The scheduler: owner of the dependency DAG and the task index.
//!
//! Admission is centralized here. Every task is keyed by `(id, dirt)`; a
//! second admission of the same key returns the existing canonical handle.
//! A new edge is first added tentatively, checked for directed cycles and
//! withdrawn if it would close one — the caller sees `None` and reacts,
//! typically by requesting the same work one dirt level higher.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use tracing::{error, info, warn};

use super::{CyclePolicy, Task, TaskCore, TaskKey, TaskKind};

/// How admitted tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Execute inline, in admission order. Deterministic; used by tests and
    /// `--sequential` debugging.
    Sequential,
    /// Spawn one concurrent task per admission.
    Concurrent,
}

struct SchedState {
    graph: StableDiGraph<Arc<dyn Task>, ()>,
    index: HashMap<TaskKey, NodeIndex>,
    root: NodeIndex,
}

/// The scheduler. Lives behind an `Arc` for the whole process; tasks hold a
/// weak backref for dependency admission.
pub struct Scheduler {
    max_dirt: u32,
    mode: ExecMode,
    /// Capability tasks for this package at max dirt are pruned from the
    /// clean graph view; they fan in from nearly everywhere.
    toolchain_package: String,
    state: RwLock<SchedState>,
    dot_file_lock: Mutex<()>,
}

/// Anchor for tasks admitted without a parent.
struct RootTask {
    core: TaskCore,
}

#[async_trait]
impl Task for RootTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl Scheduler {
    pub fn new(max_dirt: u32, mode: ExecMode, toolchain_package: impl Into<String>) -> Arc<Self> {
        let mut graph: StableDiGraph<Arc<dyn Task>, ()> = StableDiGraph::new();
        let root_task = Arc::new(RootTask {
            core: TaskCore::new(TaskKind::Root, "graph-root", "graph-root", 0),
        });
        let root = graph.add_node(root_task);

        Arc::new(Scheduler {
            max_dirt,
            mode,
            toolchain_package: toolchain_package.into(),
            state: RwLock::new(SchedState {
                graph,
                index: HashMap::new(),
                root,
            }),
            dot_file_lock: Mutex::new(()),
        })
    }

    pub fn max_dirt(&self) -> u32 {
        self.max_dirt
    }

    /// Admit a task under `parent` (the synthetic root when `None`).
    ///
    /// Returns the canonical handle for the task's identity, or `Ok(None)`
    /// when the admission would close a cycle (including a self-edge under
    /// [`CyclePolicy::Reject`]). New tasks are dispatched before returning.
    pub async fn add_task(
        self: &Arc<Self>,
        parent: Option<&TaskKey>,
        child: Arc<dyn Task>,
        policy: CyclePolicy,
    ) -> Result<Option<Arc<dyn Task>>> {
        let child_core = child.core();
        if child_core.dirt() > self.max_dirt {
            bail!(
                "task '{}' exceeds the maximum dirt level {}",
                child_core.id(),
                self.max_dirt
            );
        }
        let key = child_core.key();

        let admitted = {
            let mut state = self.state.write().expect("scheduler state lock poisoned");

            let parent_node = match parent {
                None => state.root,
                Some(parent_key) => *state.index.get(parent_key).ok_or_else(|| {
                    anyhow!("parent task '{}' is not in the scheduler", parent_key.id)
                })?,
            };

            if let Some(&existing_node) = state.index.get(&key) {
                let existing = state.graph[existing_node].clone();
                info!(task = %key.id, "task already in the scheduler");

                if existing_node == parent_node {
                    // Self-dependency on the canonical task.
                    return Ok(match policy {
                        CyclePolicy::AllowSelf => Some(existing),
                        CyclePolicy::Reject => None,
                    });
                }

                if state.graph.find_edge(parent_node, existing_node).is_some() {
                    return Ok(Some(existing));
                }

                let edge = state.graph.add_edge(parent_node, existing_node, ());
                if is_cyclic_directed(&state.graph) {
                    state.graph.remove_edge(edge);
                    warn!(
                        parent = %state.graph[parent_node].core().id(),
                        child = %key.id,
                        "admission refused: edge would close a cycle"
                    );
                    return Ok(None);
                }
                return Ok(Some(existing));
            }

            info!(task = %key.id, "admitting new task");
            let node = state.graph.add_node(child.clone());
            state.index.insert(key, node);
            state.graph.add_edge(parent_node, node, ());
            child.core().attach_scheduler(Arc::downgrade(self));
            child
        };

        self.dispatch(admitted.clone()).await?;
        Ok(Some(admitted))
    }

    async fn dispatch(self: &Arc<Self>, task: Arc<dyn Task>) -> Result<()> {
        match self.mode {
            ExecMode::Sequential => {
                let id = task.core().id().to_string();
                task.execute()
                    .await
                    .with_context(|| format!("task '{id}' failed"))
            }
            ExecMode::Concurrent => {
                let name = task.core().name().to_string();
                tokio::spawn(async move {
                    if let Err(err) = task.execute().await {
                        // No recovery path exists for a partial build; stop
                        // the whole process with context.
                        error!(task = %name, error = %format!("{err:#}"), "task failed, aborting");
                        std::process::exit(1);
                    }
                });
                Ok(())
            }
        }
    }

    /// `(done, total)` over the admitted tasks (the synthetic root does not
    /// count).
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.read().expect("scheduler state lock poisoned");
        let mut done = 0;
        let mut total = 0;
        for node in state.graph.node_indices() {
            if node == state.root {
                continue;
            }
            total += 1;
            if state.graph[node].core().is_done() {
                done += 1;
            }
        }
        (done, total)
    }

    /// True when every admitted task has completed.
    pub fn is_done(&self) -> bool {
        let (done, total) = self.counts();
        done == total
    }

    /// Log `(done / total)` every few seconds until aborted.
    pub fn spawn_progress_reporter(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (done, total) = scheduler.counts();
                let percent = if total > 0 {
                    done as f64 / total as f64 * 100.0
                } else {
                    100.0
                };
                info!("progress: {done}/{total} tasks done ({percent:.2}%)");
            }
        })
    }

    /// Serialize the graph as DOT into `full` (everything) and `clean`
    /// (pruned for readability).
    pub fn write_dot(&self, full: &mut dyn std::io::Write, clean: &mut dyn std::io::Write) -> Result<()> {
        let state = self.state.read().expect("scheduler state lock poisoned");

        full.write_all(dot_string(&state.graph).as_bytes())
            .context("writing full graph")?;

        let pruned = self.pruned_view(&state);
        clean
            .write_all(dot_string(&pruned).as_bytes())
            .context("writing clean graph")?;
        Ok(())
    }

    /// Write `graph_full.dot` and `graph.dot` under `dir`.
    pub fn write_dot_files(&self, dir: &Path) -> Result<()> {
        let _file_guard = self.dot_file_lock.lock().expect("dot file lock poisoned");
        let mut full = std::fs::File::create(dir.join("graph_full.dot"))
            .context("creating graph_full.dot")?;
        let mut clean =
            std::fs::File::create(dir.join("graph.dot")).context("creating graph.dot")?;
        self.write_dot(&mut full, &mut clean)
    }

    /// Copy of the graph with the noise removed: the spec-DB loader, the
    /// toolchain capability tasks at max dirt, then (iteratively) everything
    /// left without an incoming edge, and finally the synthetic root itself.
    fn pruned_view(&self, state: &SchedState) -> StableDiGraph<Arc<dyn Task>, ()> {
        let mut copy: StableDiGraph<Arc<dyn Task>, ()> = StableDiGraph::new();
        let mut node_map = HashMap::new();
        for node in state.graph.node_indices() {
            node_map.insert(node, copy.add_node(state.graph[node].clone()));
        }
        for edge in state.graph.edge_indices() {
            if let Some((a, b)) = state.graph.edge_endpoints(edge) {
                copy.add_edge(node_map[&a], node_map[&b], ());
            }
        }
        let root = node_map[&state.root];

        let noise: Vec<NodeIndex> = copy
            .node_indices()
            .filter(|&node| {
                let core = copy[node].core();
                core.kind() == TaskKind::SpecDb
                    || (core.kind() == TaskKind::Capability
                        && core.dirt() == self.max_dirt
                        && core.id().contains(&self.toolchain_package))
            })
            .collect();
        for node in noise {
            copy.remove_node(node);
        }

        loop {
            let orphans: Vec<NodeIndex> = copy
                .node_indices()
                .filter(|&node| {
                    node != root
                        && copy
                            .neighbors_directed(node, Direction::Incoming)
                            .next()
                            .is_none()
                })
                .collect();
            if orphans.is_empty() {
                break;
            }
            for node in orphans {
                copy.remove_node(node);
            }
        }

        copy.remove_node(root);
        copy
    }
}

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Fill color per task role, shaded by dirt level.
fn node_color(task: &dyn Task) -> Option<&'static str> {
    let shade = (task.core().dirt() % 3) as usize;
    let palette: [&'static str; 3] = match task.core().kind() {
        TaskKind::SpecBuild => ["slateblue", "skyblue", "slategray1"],
        TaskKind::Srpm => ["darkseagreen3", "darkolivegreen1", "darkseagreen1"],
        TaskKind::Cache => ["darkred", "firebrick3", "firebrick1"],
        TaskKind::Capability => ["darkgoldenrod3", "darkgoldenrod2", "darkgoldenrod1"],
        _ => return None,
    };
    Some(palette[shade])
}

fn dot_string(graph: &StableDiGraph<Arc<dyn Task>, ()>) -> String {
    let mut out = String::from("strict digraph scheduler {\n");

    for node in graph.node_indices() {
        let task = &graph[node];
        let core = task.core();
        let mut attrs = format!("label=\"{}\"", dot_escape(core.name()));
        if let Some(color) = node_color(task.as_ref()) {
            attrs.push_str(&format!(", fillcolor=\"{color}\", style=\"filled\""));
        }
        if core.is_done() {
            attrs.push_str(", color=\"green\", penwidth=\"8\"");
        } else {
            attrs.push_str(", color=\"black\", penwidth=\"1\"");
        }
        out.push_str(&format!("    \"{}\" [{attrs}];\n", dot_escape(core.id())));
    }

    for edge in graph.edge_indices() {
        if let Some((a, b)) = graph.edge_endpoints(edge) {
            out.push_str(&format!(
                "    \"{}\" -> \"{}\";\n",
                dot_escape(graph[a].core().id()),
                dot_escape(graph[b].core().id()),
            ));
        }
    }

    out.push_str("}\n");
    out
}
