// src/buildtasks/sources.rs

//! Source hydration: gather and verify the source inputs of a SPEC.
//!
//! Expected files come from the SPEC's source list. Each is first looked
//! for next to the SPEC, then downloaded from the configured source URL.
//! `Source` entries must match the SHA-256 recorded in the SPEC's signature
//! file; `Patch` entries carry no signature. A downloaded file with a wrong
//! signature is deleted and the remaining sources are still tried; any file
//! left unhydrated fails the task.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::artifacts::{SourceFile, SourceKind, SpecFile};
use crate::config::BuildContext;
use crate::fetch::{self, CancelFlag, DownloadOutcome};
use crate::fsutil;
use crate::task::{Task, TaskCore, TaskKind, ValueCell};

/// Hydrates the sources of one SPEC into one destination directory.
pub struct SourcesTask {
    core: TaskCore,
    ctx: Arc<BuildContext>,
    spec: Arc<SpecFile>,
    dest: PathBuf,
    cancel: CancelFlag,
    value: ValueCell<Vec<SourceFile>>,
}

impl SourcesTask {
    pub fn new(
        ctx: Arc<BuildContext>,
        spec: Arc<SpecFile>,
        dest: PathBuf,
        cancel: CancelFlag,
    ) -> Arc<Self> {
        let id = format!("sources_{}_{}", spec.path.display(), dest.display());
        let name = format!(
            "SOURCES: {}",
            spec.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec.path.display().to_string())
        );
        Arc::new(SourcesTask {
            core: TaskCore::new(TaskKind::Sources, id, name, 0),
            ctx,
            spec,
            dest,
            cancel,
            value: ValueCell::new(),
        })
    }

    pub async fn value(&self) -> Result<Vec<SourceFile>> {
        self.value.get(&self.core).await
    }
}

#[async_trait]
impl Task for SourcesTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    async fn execute(self: Arc<Self>) -> Result<()> {
        hydrate_sources(
            &self.spec,
            &self.dest,
            &self.ctx.config.source_url,
            &self.cancel,
        )
        .await
        .with_context(|| format!("hydrating sources of {}", self.spec.path.display()))?;

        self.value.set(self.spec.sources.clone())?;
        self.core.set_done()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct FileState {
    kind: SourceKind,
    hydrated: bool,
}

/// Hydrate every source of `spec` into `dest`. Fails if any expected file
/// is missing at the end.
pub async fn hydrate_sources(
    spec: &SpecFile,
    dest: &Path,
    source_url: &str,
    cancel: &CancelFlag,
) -> Result<()> {
    let signatures = load_signatures(&spec.path)?;
    fsutil::ensure_dir(dest)?;

    let mut state: BTreeMap<String, FileState> = spec
        .sources
        .iter()
        .map(|source| {
            (
                source.name.clone(),
                FileState {
                    kind: source.kind,
                    hydrated: false,
                },
            )
        })
        .collect();

    hydrate_from_local(&spec.source_dir(), dest, &mut state, &signatures)?;
    hydrate_from_remote(source_url, dest, &mut state, &signatures, cancel).await?;

    let missing: Vec<&str> = state
        .iter()
        .filter(|(_, file)| !file.hydrated)
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing.is_empty() {
        bail!("source files could not be hydrated: {}", missing.join(", "));
    }
    Ok(())
}

/// Copy expected files found under the SPEC's directory, verifying `Source`
/// entries against the signature table. A local signature mismatch is fatal.
pub fn hydrate_from_local(
    local_dir: &Path,
    dest: &Path,
    state: &mut BTreeMap<String, FileState>,
    signatures: &BTreeMap<String, String>,
) -> Result<()> {
    for entry in WalkDir::new(local_dir) {
        let entry = entry.with_context(|| format!("walking {}", local_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let Some(file) = state.get_mut(file_name) else {
            continue;
        };
        if file.hydrated {
            warn!(path = %path.display(), "duplicate matching file, skipping");
            continue;
        }

        if file.kind == SourceKind::Source {
            verify_signature(path, signatures)?;
        }
        fsutil::copy_file(path, dest.join(file_name))?;
        file.hydrated = true;
        debug!(file = file_name, from = %path.display(), "hydrated locally");
    }
    Ok(())
}

/// Download the remaining files. A failed download or signature mismatch is
/// logged and skipped (the file stays unhydrated); a raised cancellation
/// flag aborts the loop.
pub async fn hydrate_from_remote(
    source_url: &str,
    dest: &Path,
    state: &mut BTreeMap<String, FileState>,
    signatures: &BTreeMap<String, String>,
    cancel: &CancelFlag,
) -> Result<()> {
    for (file_name, file) in state.iter_mut() {
        if file.hydrated {
            continue;
        }

        let url = fetch::join_url(source_url, file_name);
        let destination = dest.join(file_name);

        let outcome =
            fetch::download_with_retry(&url, &destination, fetch::DEFAULT_TIMEOUT, cancel).await;
        match outcome {
            Ok(DownloadOutcome::Cancelled) => bail!("source hydration cancelled"),
            Ok(DownloadOutcome::Downloaded) => {}
            Err(err) => {
                error!(url = %url, error = %format!("{err:#}"), "download failed");
                continue;
            }
        }

        if file.kind == SourceKind::Source {
            if let Err(err) = verify_signature(&destination, signatures) {
                error!(
                    file = %file_name,
                    error = %format!("{err:#}"),
                    "signature validation failed, discarding download"
                );
                if let Err(remove_err) = std::fs::remove_file(&destination) {
                    warn!(
                        file = %destination.display(),
                        error = %remove_err,
                        "could not delete rejected download"
                    );
                }
                continue;
            }
        }

        file.hydrated = true;
        debug!(file = %file_name, from = %url, "hydrated remotely");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SignatureFile {
    #[serde(rename = "Signatures", default)]
    signatures: BTreeMap<String, String>,
}

/// Load `<spec-base>.signatures.json` from next to the SPEC.
///
/// An absent file is tolerated (some SPECs have no sources); a malformed
/// one is not.
pub fn load_signatures(spec_path: &Path) -> Result<BTreeMap<String, String>> {
    let base = spec_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("spec path {} has no file name", spec_path.display()))?;
    let dir = spec_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let path = dir.join(format!("{base}.signatures.json"));

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no signature file");
            return Ok(BTreeMap::new());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading signatures {}", path.display()))
        }
    };

    let parsed: SignatureFile = serde_json::from_str(&contents)
        .with_context(|| format!("parsing signatures {}", path.display()))?;
    Ok(parsed.signatures)
}

/// SHA-256 of a file as lowercase hex.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a file against the signature table. Missing entry and hash
/// mismatch are both errors.
pub fn verify_signature(path: &Path, signatures: &BTreeMap<String, String>) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("path {} has no file name", path.display()))?;

    let expected = signatures
        .get(file_name)
        .ok_or_else(|| anyhow!("no signature recorded for '{file_name}'"))?;

    let actual = sha256_hex(path)?;
    if !expected.eq_ignore_ascii_case(&actual) {
        bail!("'{file_name}' has a mismatching signature: expected {expected}, got {actual}");
    }
    Ok(())
}
