use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];

/// Recursively list image files under `root`, sorted by path.
///
/// Extensions match case-insensitively and may be given with or without the
/// leading dot.
pub fn find_images(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        anyhow::bail!("Not a directory: {:?}", root);
    }

    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();

    let mut images = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if wanted.iter().any(|e| *e == ext_lower) {
                images.push(path.to_path_buf());
            }
        }
    }

    // Sort by path for consistent ordering
    images.sort();

    tracing::debug!(root = ?root, count = images.len(), "Discovered images");

    Ok(images)
}

/// Path of `path` relative to `root` with `/` separators, or the full path
/// when it lies outside `root`.
pub fn relative_path(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn defaults() -> Vec<String> {
        DEFAULT_IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_find_images() {
        let dir = tempdir().unwrap();

        // Create some test files
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        // Create subdirectory with more images
        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let images = find_images(dir.path(), &defaults()).unwrap();

        assert_eq!(images.len(), 3);
        assert_eq!(images[0], dir.path().join("photo1.jpg"));
        assert_eq!(images[1], dir.path().join("photo2.PNG"));
        assert_eq!(images[2], dir.path().join("subdir/photo3.jpeg"));
    }

    #[test]
    fn test_dotted_extensions() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("a.webp")).unwrap();
        File::create(dir.path().join("b.jpg")).unwrap();

        let images = find_images(dir.path(), &[".WEBP".to_string()]).unwrap();
        assert_eq!(images, vec![dir.path().join("a.webp")]);
    }

    #[test]
    fn test_missing_root() {
        assert!(find_images(Path::new("/nonexistent/photos"), &defaults()).is_err());
    }

    #[test]
    fn test_relative_path() {
        let root = Path::new("/photos");
        assert_eq!(relative_path(Path::new("/photos/2020/beach.jpg"), root), "2020/beach.jpg");
        assert_eq!(relative_path(Path::new("/other/x.jpg"), root), "/other/x.jpg");
    }
}
