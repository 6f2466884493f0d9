// src/sandbox.rs

//! Containerized command execution.
//!
//! Build and query steps run inside container images derived from a common
//! base. Repositories are exposed to the container as overlay mounts: the
//! host directory is the read-only lower layer and every invocation gets
//! fresh upper/work directories, so nothing the sandbox writes ever reaches
//! the host repositories.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::fsutil;
use crate::repo::UPSTREAM_CACHE_DEST;

/// An overlay-mounted repository tier. Lower priorities are searched first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMount {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub priority: u32,
}

/// A plain read-write bind mount.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// The container images the builder derives from its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxImage {
    Base,
    Srpm,
    Rpm,
    Cache,
}

impl SandboxImage {
    pub fn tag(self) -> &'static str {
        match self {
            SandboxImage::Base => "pkgforge/builder/base",
            SandboxImage::Srpm => "pkgforge/builder/srpm",
            SandboxImage::Rpm => "pkgforge/builder/rpm",
            SandboxImage::Cache => "pkgforge/builder/cache",
        }
    }

    fn dockerfile(self) -> &'static str {
        match self {
            SandboxImage::Base => include_str!("../assets/Dockerfile.base"),
            SandboxImage::Srpm => include_str!("../assets/Dockerfile.srpm"),
            SandboxImage::Rpm => include_str!("../assets/Dockerfile.rpm"),
            SandboxImage::Cache => include_str!("../assets/Dockerfile.cache"),
        }
    }
}

const PREP_SCRIPT_NAME: &str = "create_repos_and_run.sh";
const PREP_SCRIPT: &str = include_str!("../assets/create_repos_and_run.sh");

/// Preparation run inside the container before the actual command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepScript {
    /// Run the command directly.
    None,
    /// Index the mounted repositories, install requested dependencies, then
    /// run the command.
    CreateReposAndRun,
}

/// One sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub command: String,
    pub args: Vec<String>,
    pub bind: Option<BindMount>,
    pub overlays: Vec<OverlayMount>,
    /// Capability names pre-installed in the sandbox by the prep script.
    pub install_deps: Vec<String>,
    pub image: SandboxImage,
    pub prep: PrepScript,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

impl SandboxRequest {
    pub fn new(command: impl Into<String>, image: SandboxImage) -> Self {
        SandboxRequest {
            command: command.into(),
            args: Vec::new(),
            bind: None,
            overlays: Vec::new(),
            install_deps: Vec::new(),
            image,
            prep: PrepScript::None,
            log_file: None,
            verbose: false,
        }
    }
}

/// Captured output of a successful sandboxed command.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The container runner. Tracks which images have been built so each is
/// built at most once per process.
pub struct Sandbox {
    temp_dir: PathBuf,
    worker_tar: PathBuf,
    built_images: Mutex<HashSet<SandboxImage>>,
}

impl Sandbox {
    pub fn new(temp_dir: PathBuf, worker_tar: PathBuf) -> Self {
        Sandbox {
            temp_dir,
            worker_tar,
            built_images: Mutex::new(HashSet::new()),
        }
    }

    /// Build the image for `tag` (and the base image first) if this process
    /// has not built it yet.
    async fn ensure_image(&self, image: SandboxImage) -> Result<()> {
        if image != SandboxImage::Base {
            self.build_image(SandboxImage::Base).await?;
        }
        self.build_image(image).await
    }

    async fn build_image(&self, image: SandboxImage) -> Result<()> {
        let mut built = self.built_images.lock().await;
        if built.contains(&image) {
            return Ok(());
        }

        let context_dir = fsutil::scratch_dir(&self.temp_dir, "image-build-")?;
        std::fs::write(context_dir.join("Dockerfile"), image.dockerfile())
            .context("writing Dockerfile")?;
        std::fs::write(context_dir.join(PREP_SCRIPT_NAME), PREP_SCRIPT)
            .context("writing prep script")?;
        if image == SandboxImage::Base {
            fsutil::copy_file(&self.worker_tar, context_dir.join("worker.tar.gz"))?;
        }

        info!(image = image.tag(), "building sandbox image");
        let status = Command::new("docker")
            .arg("build")
            .args(["--network", "host"])
            .args(["-t", image.tag()])
            .arg(&context_dir)
            .status()
            .await
            .context("spawning docker build")?;
        if !status.success() {
            return Err(anyhow!("docker build of {} failed: {status}", image.tag()));
        }

        std::fs::remove_dir_all(&context_dir).ok();
        built.insert(image);
        Ok(())
    }

    /// Run a command in the sandbox and capture its output.
    ///
    /// Overlay upper/work directories are created fresh for this invocation
    /// and removed on success; on failure they are kept for inspection and
    /// the error names the log file.
    pub async fn run(&self, request: SandboxRequest) -> Result<SandboxOutput> {
        self.ensure_image(request.image).await?;

        let overlay_base = fsutil::scratch_dir(&self.temp_dir, "overlay-")?;
        let mut docker_args: Vec<String> =
            vec!["run".into(), "--rm".into(), "--network".into(), "host".into()];

        if let Some(bind) = &request.bind {
            docker_args.push("-v".into());
            docker_args.push(format!("{}:{}", bind.source.display(), bind.dest.display()));
        }

        for overlay in &request.overlays {
            fsutil::ensure_dir(&overlay.source)?;
            let layer_dir = fsutil::scratch_dir(&overlay_base, "layer-")?;
            let upper = layer_dir.join("upper");
            let work = layer_dir.join("work");
            fsutil::ensure_dir(&upper)?;
            fsutil::ensure_dir(&work)?;

            docker_args.push("--mount".into());
            docker_args.push(format!(
                concat!(
                    "type=volume,dst={dst},volume-driver=local,",
                    "volume-opt=type=overlay,volume-opt=device=overlay,",
                    "\"volume-opt=o=lowerdir={lower},upperdir={upper},workdir={work}\""
                ),
                dst = overlay.dest.display(),
                lower = overlay.source.display(),
                upper = upper.display(),
                work = work.display(),
            ));
        }

        let mut prep_args: Vec<String> = Vec::new();
        if request.prep == PrepScript::CreateReposAndRun {
            prep_args.push(PREP_SCRIPT_NAME.into());
            if request.verbose {
                prep_args.push("--print-to-stderr".into());
            }
            if let Some(bind) = &request.bind {
                prep_args.push(format!("--user={}:{}", process_uid(), process_gid()));
                prep_args.push(format!("--path={}", bind.dest.display()));
            }
            for ro in ["/etc/passwd", "/etc/group"] {
                docker_args.push("-v".into());
                docker_args.push(format!("{ro}:{ro}:ro"));
            }
            for overlay in &request.overlays {
                if overlay.dest == Path::new(UPSTREAM_CACHE_DEST) {
                    prep_args.push(format!("--upstream-repo-priority={}", overlay.priority));
                } else {
                    prep_args.push(format!(
                        "--repodir={}:{}",
                        overlay.dest.display(),
                        overlay.priority
                    ));
                }
            }
            for dep in &request.install_deps {
                prep_args.push(format!("--install-dep={dep}"));
            }
        }

        docker_args.push(request.image.tag().into());
        docker_args.extend(prep_args);
        docker_args.push(request.command.clone());
        docker_args.extend(request.args.iter().cloned());

        let log_file = match &request.log_file {
            Some(path) => path.clone(),
            None => {
                let logs_dir = self.temp_dir.join("sandbox-logs");
                fsutil::ensure_dir(&logs_dir)?;
                let (_, path) = tempfile::Builder::new()
                    .prefix("run-")
                    .suffix(".log")
                    .tempfile_in(&logs_dir)
                    .context("creating sandbox log file")?
                    .keep()
                    .context("keeping sandbox log file")?;
                path
            }
        };

        debug!(command = %request.command, log = %log_file.display(), "sandbox run");

        let mut child = Command::new("docker")
            .args(&docker_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning docker for '{}'", request.command))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (stdout, stderr) = tokio::join!(collect_lines(stdout_pipe), collect_lines(stderr_pipe));

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for sandboxed '{}'", request.command))?;

        write_log(&log_file, &docker_args, &stdout, &stderr)?;

        if status.success() {
            std::fs::remove_dir_all(&overlay_base).ok();
            Ok(SandboxOutput { stdout, stderr })
        } else {
            error!(
                command = %request.command,
                code = status.code().unwrap_or(-1),
                log = %log_file.display(),
                "sandboxed command failed"
            );
            Err(SandboxFailure {
                command: request.command,
                code: status.code().unwrap_or(-1),
                log_file,
                stdout,
                stderr,
            }
            .into())
        }
    }
}

/// Failure of a sandboxed command, carrying the exit code and log path.
#[derive(Debug, thiserror::Error)]
#[error("sandboxed '{command}' exited with code {code}, log: {log_file}", log_file = .log_file.display())]
pub struct SandboxFailure {
    pub command: String,
    pub code: i32,
    pub log_file: PathBuf,
    pub stdout: String,
    pub stderr: String,
}

async fn collect_lines(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut out = String::new();
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn write_log(log_file: &Path, args: &[String], stdout: &str, stderr: &str) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        fsutil::ensure_dir(parent)?;
    }
    let contents = format!(
        "Running command: docker '{}'\n--- stdout ---\n{stdout}--- stderr ---\n{stderr}",
        args.join("' '")
    );
    std::fs::write(log_file, contents)
        .with_context(|| format!("writing sandbox log {}", log_file.display()))
}

// There is no portable std API for the current uid/gid; on Linux the
// ownership of /proc/self is the process's effective ids.
fn process_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
}

fn process_gid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.gid()).unwrap_or(0)
}
