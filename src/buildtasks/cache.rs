// src/buildtasks/cache.rs

//! Cache lookup: resolve a capability to a concrete package file.
//!
//! The search walks three overlay sets in order: the local tiers visible at
//! the allowed dirt level, the input repository alone, and finally every
//! repository including upstream. Among local matches the lowest dirt tier
//! wins; among upstream matches the first is taken and downloaded into the
//! cache directory, which is the authoritative location afterwards.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::artifacts::CachedRpm;
use crate::capability::Capability;
use crate::config::BuildContext;
use crate::fetch::{self, CancelFlag};
use crate::repo;
use crate::sandbox::{OverlayMount, PrepScript, SandboxImage, SandboxRequest};
use crate::task::{Task, TaskCore, TaskKind, ValueCell};

const LOOKUP_TAG: &str = "PROVIDES_LOOKUP:";
const QUERY_ATTEMPTS: u32 = 3;
const QUERY_BACKOFF: Duration = Duration::from_secs(10);

/// Which repositories a query may answer from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepoScope {
    /// Only the mounted `local-*` tiers.
    Local,
    /// Anything, including the container's upstream repositories.
    Any,
}

pub struct CacheTask {
    core: TaskCore,
    ctx: Arc<BuildContext>,
    capability: Capability,
    /// The dirt level this lookup is allowed to satisfy. May exceed the
    /// task's own dirt by one: the tier past the maximum is the upstream
    /// cache, which is not a scheduled task.
    allowable_dirt: u32,
    value: ValueCell<CachedRpm>,
}

impl CacheTask {
    pub fn new(ctx: Arc<BuildContext>, capability: Capability, allowable_dirt: u32) -> Arc<Self> {
        let id = format!("cache{allowable_dirt}_{capability}");
        let name = format!("CACHE: {capability}");
        let dirt = allowable_dirt.min(ctx.config.max_dirt);
        Arc::new(CacheTask {
            core: TaskCore::new(TaskKind::Cache, id, name, dirt),
            ctx,
            capability,
            allowable_dirt,
            value: ValueCell::new(),
        })
    }

    pub async fn value(&self) -> Result<CachedRpm> {
        self.value.get(&self.core).await
    }

    async fn resolve(&self) -> Result<CachedRpm> {
        let config = &self.ctx.config;

        // Local tiers first.
        let overlays = repo::overlays_for_dirt(config, self.allowable_dirt, true)?;
        if let Some(found) = self.query_repos(&overlays, RepoScope::Local).await? {
            return Ok(found);
        }

        // Then the input repository alone.
        warn!(
            capability = %self.capability,
            "not in the local tiers, trying the input repository"
        );
        let overlays = vec![repo::input_overlay(config)];
        if let Some(found) = self.query_repos(&overlays, RepoScope::Local).await? {
            return Ok(found);
        }

        // Finally everything, upstream included.
        warn!(
            capability = %self.capability,
            "not in the input repository, trying all repositories"
        );
        let overlays = repo::all_overlays(config)?;
        if let Some(found) = self.query_repos(&overlays, RepoScope::Any).await? {
            return Ok(found);
        }

        bail!(
            "no package provides '{}' at dirt level {}",
            self.capability,
            self.allowable_dirt
        )
    }

    /// One fallback stage: find the best provider in the given overlays,
    /// then resolve its concrete location.
    async fn query_repos(
        &self,
        overlays: &[OverlayMount],
        scope: RepoScope,
    ) -> Result<Option<CachedRpm>> {
        let repo_paths: HashMap<u32, PathBuf> = overlays
            .iter()
            .map(|overlay| (overlay.priority, overlay.source.clone()))
            .collect();

        let enable_arg = match scope {
            RepoScope::Local => "--enablerepo=local-*",
            RepoScope::Any => "--enablerepo=*",
        };

        let stdout = self
            .repoquery(
                overlays,
                vec![
                    "--disablerepo=*".to_string(),
                    enable_arg.to_string(),
                    "--whatprovides".to_string(),
                    self.capability.to_string(),
                    "--qf".to_string(),
                    format!("{LOOKUP_TAG}\t%{{name}}\t%{{version}}-%{{release}}\t%{{repoid}}"),
                ],
            )
            .await?;

        let Some(best) = self.pick_match(&stdout, scope) else {
            warn!(
                capability = %self.capability,
                ?scope,
                "no provider found in this repository set"
            );
            return Ok(None);
        };

        if best.dirt > self.allowable_dirt {
            warn!(
                capability = %self.capability,
                found_dirt = best.dirt,
                allowed = self.allowable_dirt,
                "provider exists only at a dirtier tier than allowed"
            );
            return Ok(None);
        }

        // Second invocation: where does that package live?
        let stdout = self
            .repoquery(
                overlays,
                vec![
                    "--disablerepo=*".to_string(),
                    enable_arg.to_string(),
                    "--location".to_string(),
                    format!("{} = {}", best.name, best.version),
                ],
            )
            .await?;

        self.resolve_location(&stdout, &repo_paths).await.map(Some)
    }

    async fn repoquery(&self, overlays: &[OverlayMount], args: Vec<String>) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..QUERY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(QUERY_BACKOFF * attempt).await;
            }

            let mut request = SandboxRequest::new("repoquery", SandboxImage::Cache);
            request.args = args.clone();
            request.overlays = overlays.to_vec();
            request.prep = PrepScript::CreateReposAndRun;
            request.verbose = true;

            match self.ctx.sandbox.run(request).await {
                Ok(output) => return Ok(output.stdout),
                Err(err) => {
                    warn!(
                        capability = %self.capability,
                        attempt,
                        error = %format!("{err:#}"),
                        "repository query failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("no query attempts made"))
            .context("querying repositories"))
    }

    /// Parse `PROVIDES_LOOKUP:` lines. Local scope: entries from `local-<n>`
    /// repositories only, lowest tier wins. Any scope: first entry wins and
    /// is attributed to the allowed dirt level.
    fn pick_match(&self, stdout: &str, scope: RepoScope) -> Option<RepoMatch> {
        let mut best: Option<RepoMatch> = None;

        for line in stdout.lines() {
            let mut fields = line.trim().split('\t');
            if fields.next() != Some(LOOKUP_TAG) {
                continue;
            }
            let (Some(name), Some(version), Some(repo_id)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!(line, "malformed lookup line");
                continue;
            };

            match scope {
                RepoScope::Local => {
                    let Some(tier) = repo_id
                        .strip_prefix("local-")
                        .and_then(|t| t.parse::<u32>().ok())
                    else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |b| tier < b.dirt) {
                        best = Some(RepoMatch {
                            name: name.to_string(),
                            version: version.to_string(),
                            dirt: tier,
                        });
                    }
                }
                RepoScope::Any => {
                    return Some(RepoMatch {
                        name: name.to_string(),
                        version: version.to_string(),
                        dirt: self.allowable_dirt,
                    });
                }
            }
        }

        best
    }

    /// Turn a `--location` answer into a host path: `file:///repos/<n>/...`
    /// maps into the mounted tier, an upstream URL is downloaded into the
    /// cache directory (skipping files already present).
    async fn resolve_location(
        &self,
        stdout: &str,
        repo_paths: &HashMap<u32, PathBuf>,
    ) -> Result<CachedRpm> {
        for line in stdout.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("file:///repos/") {
                let Some((tier, rel_path)) = rest.split_once('/') else {
                    continue;
                };
                // The upstream cache tier is not numbered; it is the cache
                // directory itself.
                if tier == "upstream" {
                    return Ok(CachedRpm {
                        path: self.ctx.config.rpms_cache_dir.join(rel_path),
                        already_local: true,
                    });
                }
                let tier: u32 = tier
                    .parse()
                    .with_context(|| format!("repository tier in location '{line}'"))?;
                let repo_dir = repo_paths.get(&tier).ok_or_else(|| {
                    anyhow!("location '{line}' names an unmounted repository tier")
                })?;
                return Ok(CachedRpm {
                    path: repo_dir.join(rel_path),
                    already_local: true,
                });
            }

            if line.starts_with("http://") || line.starts_with("https://") {
                if line.ends_with(".src.rpm") {
                    continue;
                }
                let file_name = line
                    .rsplit('/')
                    .next()
                    .ok_or_else(|| anyhow!("cannot extract a file name from '{line}'"))?;
                let dst = self.ctx.config.rpms_cache_dir.join(file_name);

                let _cache_guard = self.ctx.cache_lock.lock().await;
                if dst.exists() {
                    info!(file = %dst.display(), "already in the cache");
                } else {
                    fetch::download_with_retry(
                        line,
                        &dst,
                        fetch::DEFAULT_TIMEOUT,
                        &CancelFlag::new(),
                    )
                    .await?;
                    info!(file = %dst.display(), "downloaded into the cache");
                }
                return Ok(CachedRpm {
                    path: dst,
                    already_local: false,
                });
            }
        }

        bail!(
            "no usable location for '{}' in query output:\n{stdout}",
            self.capability
        )
    }
}

struct RepoMatch {
    name: String,
    version: String,
    dirt: u32,
}

#[async_trait]
impl Task for CacheTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        // Heavy sandbox work ahead; no dependencies are added past this
        // point, so the lease cannot deadlock against admissions.
        self.core.claim_limit(&self.ctx.limiter, 1).await?;
        let resolved = self.resolve().await;
        self.core.release_limit()?;

        let entry = resolved
            .with_context(|| format!("resolving '{}' from the cache", self.capability))?;
        info!(
            capability = %self.capability,
            package = %entry.path.display(),
            local = entry.already_local,
            "capability resolved from the repositories"
        );

        self.value.set(entry)?;
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
