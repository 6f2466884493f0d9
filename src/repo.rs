// src/repo.rs

//! Repository overlay composition.
//!
//! A sandboxed tool searches packages through a stack of repositories
//! exposed as overlay mounts. Priority 0 is the clean local tier; each dirty
//! tier follows at its own dirt level; the input (upstream) repository sits
//! at `max_dirt` and the download cache at `max_dirt + 1`. Lower priority
//! numbers are searched first.

use std::path::PathBuf;

use anyhow::Result;

use crate::config::BuildConfig;
use crate::fsutil;
use crate::sandbox::OverlayMount;

/// Mount destination inside the sandbox for a numbered repository tier.
fn tier_dest(priority: u32) -> PathBuf {
    PathBuf::from("/repos").join(priority.to_string())
}

/// Mount destination of the upstream download cache.
pub const UPSTREAM_CACHE_DEST: &str = "/repos/upstream";

/// Overlay entries for the local tiers visible at `dirt`, plus the input
/// repository once `dirt` reaches the maximum, plus the upstream cache when
/// requested (or forced by reaching the maximum).
pub fn overlays_for_dirt(
    config: &BuildConfig,
    dirt: u32,
    always_cache: bool,
) -> Result<Vec<OverlayMount>> {
    let mut overlays = Vec::new();

    for tier in 0..=dirt.min(config.max_dirt.saturating_sub(1)) {
        let source = config.rpms_dir(tier).to_path_buf();
        fsutil::ensure_dir(&source)?;
        overlays.push(OverlayMount {
            source,
            dest: tier_dest(tier),
            priority: tier,
        });
    }

    if dirt >= config.max_dirt {
        overlays.push(input_overlay(config));
    }

    if always_cache || dirt >= config.max_dirt {
        overlays.push(upstream_overlay(config));
    }

    Ok(overlays)
}

/// The external/upstream repository, exposed at the highest dirt tier.
pub fn input_overlay(config: &BuildConfig) -> OverlayMount {
    OverlayMount {
        source: config.input_repo_dir.clone(),
        dest: tier_dest(config.max_dirt),
        priority: config.max_dirt,
    }
}

/// The upstream download cache, one past the highest tier.
pub fn upstream_overlay(config: &BuildConfig) -> OverlayMount {
    OverlayMount {
        source: config.rpms_cache_dir.clone(),
        dest: PathBuf::from(UPSTREAM_CACHE_DEST),
        priority: config.max_dirt + 1,
    }
}

/// Every repository: all local tiers, the input repository and the cache.
pub fn all_overlays(config: &BuildConfig) -> Result<Vec<OverlayMount>> {
    overlays_for_dirt(config, config.max_dirt, true)
}
