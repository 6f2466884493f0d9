// src/rpmcmd.rs

//! Subprocess interface to the RPM toolchain.
//!
//! SPEC and package queries run `rpmspec`/`rpm` on the host; SRPM generation
//! and binary builds run `rpmbuild` inside the sandbox against the overlay
//! repositories. Output is treated as whitespace-trimmed lines with known
//! shapes; nothing here interprets package semantics beyond that.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::capability::Capability;
use crate::config::BuildContext;
use crate::fsutil;
use crate::repo;
use crate::sandbox::{BindMount, PrepScript, SandboxFailure, SandboxImage, SandboxRequest};

const RPM_PROGRAM: &str = "rpm";
const RPM_SPEC_PROGRAM: &str = "rpmspec";
const RPM_BUILD_PROGRAM: &str = "rpmbuild";

/// Exit code `rpmbuild` uses for unsatisfied build requirements; expected
/// and tolerated during dep-less source package generation.
const NODEPS_EXIT_CODE: i32 = 11;

const TARGET_VENDOR: &str = "generic";

/// Macro definitions passed as `-D key value` pairs. Ordered so generated
/// command lines are stable.
pub type Defines = BTreeMap<String, String>;

/// The standard define set for all queries and builds: the dist tag and
/// whether `%check` sections run.
pub fn default_distro_defines(run_check: bool, dist_tag: &str) -> Defines {
    let mut defines = Defines::new();
    defines.insert("dist".to_string(), dist_tag.to_string());
    defines.insert(
        "with_check".to_string(),
        if run_check { "1" } else { "0" }.to_string(),
    );
    defines
}

/// Suffix the dist tag with the dirt level, so dirty artifacts are visibly
/// dirty in their file names and can never shadow clean ones.
pub fn apply_dirty_dist(defines: &mut Defines, dirt: u32) {
    if dirt > 0 {
        if let Some(dist) = defines.get_mut("dist") {
            *dist = format!("{dist}.dirty_{dirt}");
        }
    }
}

/// Split subprocess output into trimmed, non-empty lines.
fn sanitize_output(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Assemble `extra_args... [--qf fmt] [-D "k v"]... file`.
fn format_command_args(
    extra_args: &[&str],
    file: &Path,
    query_format: &str,
    defines: &Defines,
) -> Vec<String> {
    let mut args: Vec<String> = extra_args.iter().map(|s| s.to_string()).collect();
    if !query_format.is_empty() {
        args.push("--qf".to_string());
        args.push(query_format.to_string());
    }
    for (key, value) in defines {
        args.push("-D".to_string());
        args.push(format!("{key} {value}"));
    }
    args.push(file.display().to_string());
    args
}

async fn execute_rpm_command(program: &str, args: &[String]) -> Result<Vec<String>> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }

    Ok(sanitize_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Query a SPEC file with a query format. Returns trimmed output lines.
pub async fn query_spec(
    spec_file: &Path,
    source_dir: &Path,
    query_format: &str,
    arch: &str,
    defines: &Defines,
    extra_args: &[&str],
) -> Result<Vec<String>> {
    let mut all_args: Vec<&str> = extra_args.to_vec();
    all_args.extend(["-q", "--target", arch]);

    let mut all_defines = defines.clone();
    all_defines.insert(
        "_sourcedir".to_string(),
        source_dir.display().to_string(),
    );

    let args = format_command_args(&all_args, spec_file, query_format, &all_defines);
    execute_rpm_command(RPM_SPEC_PROGRAM, &args)
        .await
        .with_context(|| format!("querying spec {}", spec_file.display()))
}

/// The RPMs a SPEC would build, as `<arch>/<nevra>` relative paths.
pub async fn query_spec_built_rpms(
    spec_file: &Path,
    source_dir: &Path,
    arch: &str,
    defines: &Defines,
) -> Result<Vec<String>> {
    query_spec(
        spec_file,
        source_dir,
        "%{ARCH}/%{nevra}\n",
        arch,
        defines,
        &["--builtrpms", "--srpm"],
    )
    .await
}

/// The capabilities a SPEC predicts it will provide.
pub async fn query_spec_provides(
    spec_file: &Path,
    source_dir: &Path,
    arch: &str,
    defines: &Defines,
) -> Result<Vec<Capability>> {
    let lines = query_spec(spec_file, source_dir, "", arch, defines, &["--provides"]).await?;
    parse_capability_lines(&lines)
}

/// Source and patch file names declared by a SPEC.
pub async fn query_spec_sources(
    spec_file: &Path,
    source_dir: &Path,
    arch: &str,
    defines: &Defines,
) -> Result<(Vec<String>, Vec<String>)> {
    let sources = query_spec(
        spec_file,
        source_dir,
        "[%{SOURCE}\n]",
        arch,
        defines,
        &["--srpm"],
    )
    .await
    .context("querying spec for source files")?;

    let patches = query_spec(
        spec_file,
        source_dir,
        "[%{PATCH}\n]",
        arch,
        defines,
        &["--srpm"],
    )
    .await
    .context("querying spec for patch files")?;

    Ok((sources, patches))
}

/// Capabilities required by an RPM or SRPM file at run/build time.
pub async fn query_rpm_requires(rpm_file: &Path) -> Result<Vec<Capability>> {
    debug!(rpm = %rpm_file.display(), "querying requires");
    let args = vec!["-qpR".to_string(), rpm_file.display().to_string()];
    let lines = execute_rpm_command(RPM_PROGRAM, &args)
        .await
        .with_context(|| format!("querying requires of {}", rpm_file.display()))?;
    parse_capability_lines(&lines)
}

/// Capabilities provided by an RPM file, including generated provides.
pub async fn query_rpm_provides(rpm_file: &Path) -> Result<Vec<Capability>> {
    const NO_FILES: &str = "(contains no files)";

    debug!(rpm = %rpm_file.display(), "querying provides");
    let args = vec!["-qlPp".to_string(), rpm_file.display().to_string()];
    let lines = execute_rpm_command(RPM_PROGRAM, &args)
        .await
        .with_context(|| format!("querying provides of {}", rpm_file.display()))?;
    let lines: Vec<String> = lines.into_iter().filter(|l| l != NO_FILES).collect();
    parse_capability_lines(&lines)
}

fn parse_capability_lines(lines: &[String]) -> Result<Vec<Capability>> {
    let mut caps = Vec::with_capacity(lines.len());
    for line in lines {
        let cap = Capability::from_str(line)
            .with_context(|| format!("parsing capability '{line}'"))?;
        caps.push(cap);
    }
    Ok(caps)
}

/// How a source package is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrpmMode {
    /// Placeholder sources, build-requires checks bypassed. Used only to
    /// discover the build-requires list. The `dynamic` flavour re-runs the
    /// generator once some requirements are installed, so dynamically
    /// generated requirements appear too.
    DepLess { dynamic: bool },
    /// Real sources embedded, dependencies installed.
    Full,
}

/// Generate a source package from a SPEC inside the sandbox.
///
/// `top_dir` is bind-mounted so the produced file lands on the host; the
/// returned path is the `Wrote:` line of the generator. Dep-less dynamic
/// generation tolerates the generator's nodeps exit code.
pub async fn generate_srpm(
    ctx: &BuildContext,
    spec_file: &Path,
    top_dir: &Path,
    install_deps: &[Capability],
    defines: &Defines,
    dirt: u32,
    mode: SrpmMode,
) -> Result<PathBuf> {
    let extra_args: Vec<&str> = match mode {
        SrpmMode::DepLess { dynamic: false } => vec!["--nodeps", "-vv", "-bs"],
        SrpmMode::DepLess { dynamic: true } => vec!["--nodeps", "-vv", "-br"],
        SrpmMode::Full => vec!["-vv", "-br"],
    };
    let tolerate_nodeps = matches!(mode, SrpmMode::DepLess { dynamic: true });

    let mut all_defines = defines.clone();
    all_defines.insert("_topdir".to_string(), top_dir.display().to_string());

    let args = format_command_args(&extra_args, spec_file, "", &all_defines);

    let mut request = SandboxRequest::new(RPM_BUILD_PROGRAM, SandboxImage::Srpm);
    request.args = args;
    request.bind = Some(BindMount {
        source: top_dir.to_path_buf(),
        dest: top_dir.to_path_buf(),
    });
    request.overlays = repo::overlays_for_dirt(&ctx.config, dirt, ctx.config.allow_cache_any_level)?;
    request.install_deps = install_deps.iter().map(|c| c.name.clone()).collect();
    request.prep = PrepScript::CreateReposAndRun;
    request.log_file = Some(build_log_path(ctx, "build-srpm-from-spec", spec_file)?);
    request.verbose = true;

    let stdout = match ctx.sandbox.run(request).await {
        Ok(output) => output.stdout,
        Err(err) => match err.downcast_ref::<SandboxFailure>() {
            Some(failure) if tolerate_nodeps && failure.code == NODEPS_EXIT_CODE => {
                warn!("ignoring nodeps exit code from source package generation");
                failure.stdout.clone()
            }
            _ => return Err(err.context("generating source package")),
        },
    };

    parse_wrote_line(&stdout)
        .ok_or_else(|| anyhow!("no source package path in generator output:\n{stdout}"))
}

/// Extract the artifact path from an `rpmbuild` "Wrote:" line.
fn parse_wrote_line(stdout: &str) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let path = line.trim().strip_prefix("Wrote: ")?.trim();
        if path.ends_with(".src.rpm") || path.ends_with(".nosrc.rpm") {
            Some(PathBuf::from(path))
        } else {
            None
        }
    })
}

/// Rebuild binary packages from an SRPM inside the sandbox. Built RPMs land
/// under `<top_dir>/RPMS` on the host.
pub async fn build_rpm_from_srpm(
    ctx: &BuildContext,
    srpm_file: &Path,
    out_arch: &str,
    top_dir: &Path,
    install_deps: &[Capability],
    defines: &Defines,
    dirt: u32,
) -> Result<()> {
    let target_tuple = format!("{out_arch}-{TARGET_VENDOR}-linux");
    let mut extra_args: Vec<&str> = vec!["--nocheck", "--rebuild"];
    if out_arch != ctx.config.arch && out_arch != "noarch" {
        extra_args.push("--target");
        extra_args.push(&target_tuple);
    }

    let mut all_defines = defines.clone();
    all_defines.insert("_topdir".to_string(), top_dir.display().to_string());
    all_defines.insert(
        "_unpackaged_files_terminate_build".to_string(),
        "0".to_string(),
    );

    let args = format_command_args(&extra_args, srpm_file, "", &all_defines);

    let mut request = SandboxRequest::new(RPM_BUILD_PROGRAM, SandboxImage::Rpm);
    request.args = args;
    request.bind = Some(BindMount {
        source: top_dir.to_path_buf(),
        dest: top_dir.to_path_buf(),
    });
    request.overlays = repo::overlays_for_dirt(&ctx.config, dirt, ctx.config.allow_cache_any_level)?;
    request.install_deps = install_deps.iter().map(|c| c.name.clone()).collect();
    request.prep = PrepScript::CreateReposAndRun;
    request.log_file = Some(build_log_path(ctx, "build-rpm-from-srpm", srpm_file)?);
    request.verbose = true;

    ctx.sandbox
        .run(request)
        .await
        .with_context(|| format!("building {}", srpm_file.display()))?;
    Ok(())
}

/// Move every built RPM out of `<top_dir>/RPMS` into `dst_dir`, preserving
/// the architecture subdirectory each file was built into.
pub fn collect_built_rpms(top_dir: &Path, dst_dir: &Path) -> Result<Vec<PathBuf>> {
    let rpm_out_dir = top_dir.join("RPMS");
    let mut moved = Vec::new();

    for entry in WalkDir::new(&rpm_out_dir) {
        let entry = entry.with_context(|| format!("walking {}", rpm_out_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("rpm") {
            continue;
        }

        let rel = path
            .strip_prefix(&rpm_out_dir)
            .context("built RPM outside the output tree")?;
        let dst = dst_dir.join(rel);
        fsutil::move_file(path, &dst)?;
        moved.push(dst);
    }

    moved.sort();
    Ok(moved)
}

fn build_log_path(ctx: &BuildContext, kind: &str, input: &Path) -> Result<PathBuf> {
    let base = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown");
    let logs_dir = ctx.config.temp_dir.join("build-logs");
    fsutil::ensure_dir(&logs_dir)?;
    let (_, path) = tempfile::Builder::new()
        .prefix(&format!("{kind}-{base}-"))
        .suffix(".log")
        .tempfile_in(&logs_dir)
        .context("creating build log file")?
        .keep()
        .context("keeping build log file")?;
    Ok(path)
}
