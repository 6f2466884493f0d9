// src/artifacts.rs

//! The build artifacts the tasks exchange: SPEC files, source packages,
//! binary packages and cached upstream packages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::capability::Capability;
use crate::config::BuildConfig;
use crate::rpmcmd;

/// How a source input is verified: patches carry no signature, sources must
/// match the signature file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Patch,
    Source,
}

/// One source input declared by a SPEC, identified by its base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub kind: SourceKind,
}

/// A binary package: a path plus the capabilities it provides.
#[derive(Debug, Clone)]
pub struct RpmFile {
    pub path: PathBuf,
    pub capabilities: Vec<Capability>,
}

impl RpmFile {
    /// A predicted package; capabilities are unknown until the file exists.
    pub fn predicted(path: PathBuf) -> Self {
        RpmFile {
            path,
            capabilities: Vec::new(),
        }
    }

    /// Wrap a real file, populating capabilities from the file itself.
    pub async fn from_file(path: PathBuf) -> Result<Self> {
        let capabilities = rpmcmd::query_rpm_provides(&path)
            .await
            .with_context(|| format!("reading provides of {}", path.display()))?;
        Ok(RpmFile { path, capabilities })
    }
}

/// A package found through the cache lookup: where it is and whether it was
/// already local or had to be fetched from upstream.
#[derive(Debug, Clone)]
pub struct CachedRpm {
    pub path: PathBuf,
    pub already_local: bool,
}

/// An input SPEC file and what it predicts it will produce.
#[derive(Debug, Clone)]
pub struct SpecFile {
    pub path: PathBuf,
    /// Built packages. Predicted paths until a build replaces them with the
    /// real artifacts (capabilities populated).
    pub provided_rpms: Vec<RpmFile>,
    /// Capabilities the SPEC predicts it will provide.
    pub predicted_provides: Vec<Capability>,
    /// Declared source inputs.
    pub sources: Vec<SourceFile>,
}

impl SpecFile {
    /// Query the SPEC for its predicted packages, provides and sources.
    ///
    /// `dirt` selects the output tier the predicted package paths point at.
    pub async fn query(path: &Path, dirt: u32, config: &BuildConfig) -> Result<Self> {
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let defines = rpmcmd::default_distro_defines(config.do_check, &config.dist_tag);

        let mut built_rpms =
            rpmcmd::query_spec_built_rpms(path, &source_dir, &config.arch, &defines)
                .await
                .with_context(|| format!("querying built RPMs of {}", path.display()))?;
        built_rpms.sort();

        let mut predicted_provides =
            rpmcmd::query_spec_provides(path, &source_dir, &config.arch, &defines)
                .await
                .with_context(|| format!("querying provides of {}", path.display()))?;
        predicted_provides.sort_by(|a, b| a.name.cmp(&b.name));

        let (mut source_names, mut patch_names) =
            rpmcmd::query_spec_sources(path, &source_dir, &config.arch, &defines)
                .await
                .with_context(|| format!("querying sources of {}", path.display()))?;
        source_names.sort();
        patch_names.sort();

        let rpms_dir = config.rpms_dir(dirt);
        let provided_rpms = built_rpms
            .into_iter()
            .map(|rel| RpmFile::predicted(rpms_dir.join(format!("{rel}.rpm"))))
            .collect();

        let sources = source_names
            .into_iter()
            .map(|name| SourceFile {
                name,
                kind: SourceKind::Source,
            })
            .chain(patch_names.into_iter().map(|name| SourceFile {
                name,
                kind: SourceKind::Patch,
            }))
            .collect();

        Ok(SpecFile {
            path: path.to_path_buf(),
            provided_rpms,
            predicted_provides,
            sources,
        })
    }

    /// Directory containing the SPEC and (conventionally) its local sources.
    pub fn source_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// A source package produced from a SPEC, with its converged build-requires.
#[derive(Debug, Clone)]
pub struct SrpmFile {
    pub source_spec: Arc<SpecFile>,
    pub path: PathBuf,
    pub build_requires: Vec<Capability>,
}
