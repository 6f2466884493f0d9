// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! NOTE: this expects `clap` to be built with the `derive` feature, e.g.:
//! `clap = { version = "4.5", features = ["derive"] }` in `Cargo.toml`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `pkgforge`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pkgforge",
    version,
    about = "Build RPM packages from SPEC files, resolving dependencies on demand.",
    long_about = None
)]
pub struct CliArgs {
    /// SPEC files to build as root goals.
    #[arg(long = "specs", value_name = "PATH", num_args = 0..)]
    pub specs: Vec<PathBuf>,

    /// Capabilities to resolve as root goals (e.g. "bash" or "openssl >= 3.0").
    #[arg(long = "capabilities", value_name = "CAP", num_args = 0..)]
    pub capabilities: Vec<String>,

    /// Path to the spec database (JSON) mapping provided capabilities to specs.
    #[arg(long = "spec-data", value_name = "PATH")]
    pub spec_data: PathBuf,

    /// Directory treated as the external/upstream package repository.
    #[arg(long = "input-repo-dir", value_name = "DIR")]
    pub input_repo_dir: PathBuf,

    /// Root of the working directories (RPMS, SRPMS, dirty tiers, cache).
    #[arg(long = "build-dir", value_name = "DIR")]
    pub build_dir: PathBuf,

    /// Worker chroot tarball consumed by the sandbox images.
    #[arg(long = "worker-tar", value_name = "PATH")]
    pub worker_tar: PathBuf,

    /// Base URL for source file downloads.
    #[arg(long = "source-url", value_name = "URL")]
    pub source_url: String,

    /// Distribution tag embedded in built artifacts (e.g. ".fc40").
    #[arg(long = "dist-tag", value_name = "TAG")]
    pub dist_tag: String,

    /// Maximum dirt level; beyond this only the upstream cache is consulted.
    #[arg(long = "max-dirt", value_name = "N", default_value_t = 2)]
    pub max_dirt: u32,

    /// Consult the upstream cache at every dirt level, not just the last.
    #[arg(long = "allow-cache-any-level")]
    pub allow_cache_any_level: bool,

    /// Seed every SRPM build with the fixed toolchain capability.
    #[arg(long = "add-toolchain-packages")]
    pub add_toolchain_packages: bool,

    /// Name of the toolchain capability used when seeding SRPM builds.
    #[arg(
        long = "toolchain-package",
        value_name = "NAME",
        default_value = "core-toolchain"
    )]
    pub toolchain_package: String,

    /// Capacity of the global resource limiter (concurrent heavy operations).
    #[arg(long = "limiter-capacity", value_name = "N", default_value_t = 50)]
    pub limiter_capacity: u32,

    /// Execute tasks one at a time in admission order (deterministic, for
    /// debugging). The default is one concurrent task per admission.
    #[arg(long)]
    pub sequential: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PKGFORGE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
