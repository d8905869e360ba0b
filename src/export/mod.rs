//! Copy source images out of the library into plain folders.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::faces::FaceMatch;

/// First free `dir/file_name`, inserting `_1`, `_2`, ... before the extension.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = as_path.extension().map(|e| e.to_string_lossy().into_owned());

    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Copy each source into `target_dir` without overwriting anything.
///
/// Duplicate sources are copied once and missing ones are skipped. Errors on
/// single files are logged and do not stop the batch. Returns how many files
/// were copied.
pub fn copy_collision_safe<P: AsRef<Path>>(sources: &[P], target_dir: &Path) -> usize {
    let mut seen = HashSet::new();
    let mut copied = 0;

    for source in sources {
        let source = source.as_ref();
        if !seen.insert(source.to_path_buf()) {
            continue;
        }
        if !source.is_file() {
            tracing::debug!(path = ?source, "Export source missing, skipped");
            continue;
        }
        let Some(file_name) = source.file_name() else {
            continue;
        };

        let destination = unique_destination(target_dir, &file_name.to_string_lossy());
        match std::fs::copy(source, &destination) {
            Ok(_) => {
                copied += 1;
                preserve_times(source, &destination);
                tracing::debug!(from = ?source, to = ?destination, "Exported");
            }
            Err(e) => {
                tracing::debug!(path = ?source, error = %e, "Export failed");
            }
        }
    }

    copied
}

fn preserve_times(source: &Path, destination: &Path) {
    let Ok(meta) = std::fs::metadata(source) else {
        return;
    };
    let atime = filetime::FileTime::from_last_access_time(&meta);
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    if let Err(e) = filetime::set_file_times(destination, atime, mtime) {
        tracing::debug!(path = ?destination, error = %e, "Could not preserve timestamps");
    }
}

/// Make a cluster label safe to use as a directory name.
pub fn sanitize_dir_name(label: &str, fallback: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());

    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Copy the images behind search matches into `out_root/FindPerson_<timestamp>`.
pub fn export_matches(matches: &[FaceMatch], out_root: &Path) -> Result<(PathBuf, usize)> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let dir = out_root.join(format!("FindPerson_{}", stamp));
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create export directory {:?}", dir))?;

    let sources: Vec<&Path> = matches.iter().map(|m| m.path.as_path()).collect();
    let copied = copy_collision_safe(&sources, &dir);
    tracing::info!(dir = ?dir, copied, "Exported search matches");

    Ok((dir, copied))
}
