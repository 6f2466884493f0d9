// src/specdb.rs

//! The spec database: a JSON file mapping provided capabilities to the SPEC
//! files that produce them.
//!
//! The file format is treated as an opaque input; only the fields the
//! scheduler needs are deserialized.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::capability::{Capability, CompareOp, Version};

#[derive(Debug, Deserialize)]
struct RawDb {
    #[serde(rename = "Repo", default)]
    repo: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "Provides")]
    provides: RawProvides,
    #[serde(rename = "SpecPath")]
    spec_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawProvides {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version", default)]
    version: Option<String>,
    #[serde(rename = "Condition", default)]
    condition: Option<String>,
}

/// One known spec, keyed by a capability it provides.
#[derive(Debug, Clone)]
pub struct SpecDbEntry {
    pub provides: Capability,
    pub spec_path: PathBuf,
}

/// In-memory database of known specs.
#[derive(Debug, Default)]
pub struct SpecDb {
    entries: Vec<SpecDbEntry>,
}

impl SpecDb {
    /// Load the database from its JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading spec database {}", path.display()))?;
        let raw: RawDb = serde_json::from_str(&contents)
            .with_context(|| format!("parsing spec database {}", path.display()))?;

        let mut entries = Vec::with_capacity(raw.repo.len());
        for entry in raw.repo {
            let provides = match entry.provides.version.as_deref() {
                None | Some("") => Capability::unversioned(entry.provides.name),
                Some(version) => {
                    let op = match entry.provides.condition.as_deref() {
                        None | Some("") => CompareOp::Equal,
                        Some(other) => CompareOp::parse(other).with_context(|| {
                            format!("spec database condition '{other}' is not valid")
                        })?,
                    };
                    Capability::versioned(entry.provides.name, op, Version::parse(version))
                }
            };
            entries.push(SpecDbEntry {
                provides,
                spec_path: entry.spec_path,
            });
        }

        debug!(entries = entries.len(), db = %path.display(), "loaded spec database");
        Ok(SpecDb { entries })
    }

    /// Find the first spec whose provide satisfies the requested capability.
    pub fn lookup(&self, capability: &Capability) -> Option<&SpecDbEntry> {
        self.entries
            .iter()
            .find(|entry| entry.provides.satisfies(capability))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
