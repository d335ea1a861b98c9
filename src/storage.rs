//! Frame directory maintenance.

use anyhow::{Context, Result};
use std::path::Path;

/// Extensions treated as captured frames (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Remove frames from `dir`. With `all_files` every regular file goes,
/// otherwise only image files. Subdirectories are never touched.
///
/// Returns the number of files removed. A missing directory counts as empty.
pub fn clear_frames(dir: &Path, all_files: bool) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("read frame directory {}", dir.display()))
        }
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if !all_files && !is_image_file(&path) {
            continue;
        }
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        removed += 1;
    }
    log::info!(
        "storage: removed {} file(s) from {} (all_files={})",
        removed,
        dir.display(),
        all_files
    );
    Ok(removed)
}

/// Count image files currently in `dir`.
pub fn count_frames(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut count = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() && is_image_file(&entry.path()) {
            count += 1;
        }
    }
    Ok(count)
}
