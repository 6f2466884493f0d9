// src/config.rs

//! Build configuration and shared runtime context.
//!
//! `BuildConfig` is the validated, immutable description of one build run:
//! the tiered directory layout under `--build-dir`, the dist tag, the dirt
//! policy. `BuildContext` bundles it with the process-wide services every
//! task needs (resource limiter, sandbox, cache lock).

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;

use crate::cli::CliArgs;
use crate::fsutil;
use crate::sandbox::Sandbox;
use crate::task::limiter::ResourceLimiter;

/// Validated configuration for a single build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// RPM architecture of the build machine (e.g. "x86_64").
    pub arch: String,
    /// Distribution tag embedded in built artifacts, e.g. ".fc40".
    pub dist_tag: String,
    /// Root of all working directories.
    pub build_dir: PathBuf,
    /// Binary package output directories, indexed by dirt level.
    rpms_dirs: Vec<PathBuf>,
    /// Source package output directories, indexed by dirt level.
    srpms_dirs: Vec<PathBuf>,
    /// Download destination for upstream packages.
    pub rpms_cache_dir: PathBuf,
    /// The external/upstream repository, exposed at the highest dirt tier.
    pub input_repo_dir: PathBuf,
    /// Path to the spec database file.
    pub spec_data: PathBuf,
    /// Worker chroot tarball consumed by the sandbox images.
    pub worker_tar: PathBuf,
    /// Base URL for source downloads.
    pub source_url: String,
    /// Scratch space for work dirs, overlay upper/work dirs and logs.
    pub temp_dir: PathBuf,
    /// Whether to run `%check` sections.
    pub do_check: bool,
    /// Maximum dirt level. The repository at this tier is the input repo.
    pub max_dirt: u32,
    /// Consult the upstream cache at every dirt level.
    pub allow_cache_any_level: bool,
    /// Seed SRPM builds with the toolchain capability.
    pub add_toolchain_packages: bool,
    /// Name of the toolchain capability.
    pub toolchain_package: String,
}

impl BuildConfig {
    /// Derive the configuration (including the tiered directory layout) from
    /// the parsed CLI arguments.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        if args.max_dirt == 0 {
            return Err(anyhow!("--max-dirt must be >= 1"));
        }
        if args.dist_tag.trim().is_empty() {
            return Err(anyhow!("--dist-tag must not be empty"));
        }

        let build_dir = args.build_dir.clone();
        let mut rpms_dirs = vec![build_dir.join("RPMS")];
        let mut srpms_dirs = vec![build_dir.join("SRPMS")];
        for dirt in 1..=args.max_dirt {
            rpms_dirs.push(build_dir.join("RPMS-dirty").join(dirt.to_string()));
            srpms_dirs.push(build_dir.join("SRPMS-dirty").join(dirt.to_string()));
        }

        Ok(BuildConfig {
            arch: host_rpm_arch()?,
            dist_tag: args.dist_tag.clone(),
            rpms_cache_dir: build_dir.join("RPMS-cache"),
            build_dir,
            rpms_dirs,
            srpms_dirs,
            input_repo_dir: args.input_repo_dir.clone(),
            spec_data: args.spec_data.clone(),
            worker_tar: args.worker_tar.clone(),
            source_url: args.source_url.clone(),
            temp_dir: std::env::temp_dir().join("pkgforge"),
            do_check: false,
            max_dirt: args.max_dirt,
            allow_cache_any_level: args.allow_cache_any_level,
            add_toolchain_packages: args.add_toolchain_packages,
            toolchain_package: args.toolchain_package.clone(),
        })
    }

    /// Binary package output directory for a dirt level.
    pub fn rpms_dir(&self, dirt: u32) -> &Path {
        &self.rpms_dirs[dirt as usize]
    }

    /// Source package output directory for a dirt level.
    pub fn srpms_dir(&self, dirt: u32) -> &Path {
        &self.srpms_dirs[dirt as usize]
    }

    /// Create the on-disk layout (all tiers, the cache and the temp dir).
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in self
            .rpms_dirs
            .iter()
            .chain(self.srpms_dirs.iter())
            .chain([&self.rpms_cache_dir, &self.temp_dir])
        {
            fsutil::ensure_dir(dir)
                .with_context(|| format!("creating build directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Map the compile-time architecture to its RPM spelling.
fn host_rpm_arch() -> Result<String> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x86_64".to_string()),
        "aarch64" => Ok("aarch64".to_string()),
        other => Err(anyhow!("unsupported build architecture '{other}'")),
    }
}

/// Process-wide services shared by every task.
pub struct BuildContext {
    pub config: BuildConfig,
    /// Global weighted semaphore bounding concurrent heavy operations.
    pub limiter: ResourceLimiter,
    /// Container runner with its ensure-built-once image state.
    pub sandbox: Sandbox,
    /// Serializes the final copy step into the RPMs cache directory.
    pub cache_lock: Mutex<()>,
}

impl BuildContext {
    pub fn new(config: BuildConfig, limiter_capacity: u32) -> Self {
        let sandbox = Sandbox::new(config.temp_dir.clone(), config.worker_tar.clone());
        BuildContext {
            config,
            limiter: ResourceLimiter::new(limiter_capacity),
            sandbox,
            cache_lock: Mutex::new(()),
        }
    }
}
