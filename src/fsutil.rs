// src/fsutil.rs

//! Small filesystem helpers shared by the build tasks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Create a directory and all of its parents if missing.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .with_context(|| format!("creating directory {}", path.display()))
}

/// Copy a file, creating the destination's parent directory if needed.
pub fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Move a file, falling back to copy + remove when rename crosses a
/// filesystem boundary.
pub fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            std::fs::remove_file(src)
                .with_context(|| format!("removing {}", src.display()))?;
            Ok(())
        }
    }
}

/// Replace every character outside `[A-Za-z0-9]` with an underscore, so a
/// task id can be used as a directory name component.
pub fn sanitize_for_path(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Create a unique scratch directory under `base` with the given prefix.
pub fn scratch_dir(base: &Path, prefix: &str) -> Result<PathBuf> {
    ensure_dir(base)?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(base)
        .with_context(|| format!("creating scratch directory under {}", base.display()))?;
    // The caller owns cleanup; persist the path past the TempDir guard.
    Ok(dir.keep())
}
