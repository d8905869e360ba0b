use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};

use super::IdentityStore;
use crate::error::Result;

/// An image the indexer has seen at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub modified_at: Option<String>,
}

impl IdentityStore {
    /// Return the id for `relative_path`, inserting the image on first sight.
    ///
    /// The unique constraint on `relative_path` makes this safe to call from
    /// several threads for the same path: only one row is ever created.
    pub fn ensure_image(&self, relative_path: &str, absolute_path: &Path) -> Result<i64> {
        let modified_at = file_modified_at(absolute_path);
        let abs = absolute_path.to_string_lossy();

        let inner = self.lock();
        inner.conn.execute(
            r#"
            INSERT INTO images (relative_path, absolute_path, modified_at) VALUES (?, ?, ?)
            ON CONFLICT(relative_path) DO UPDATE SET
                absolute_path = excluded.absolute_path,
                modified_at = excluded.modified_at
            "#,
            params![relative_path, abs, modified_at],
        )?;
        let id = inner.conn.query_row(
            "SELECT id FROM images WHERE relative_path = ?",
            [relative_path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Whether detection already produced at least one face for this image.
    pub fn has_faces(&self, image_id: i64) -> Result<bool> {
        let inner = self.lock();
        let found = inner.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM faces WHERE image_id = ?)",
            [image_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    pub fn get_image(&self, image_id: i64) -> Result<Option<Image>> {
        let inner = self.lock();
        let image = inner
            .conn
            .query_row(
                "SELECT id, relative_path, absolute_path, modified_at FROM images WHERE id = ?",
                [image_id],
                |row| {
                    Ok(Image {
                        id: row.get(0)?,
                        relative_path: row.get(1)?,
                        absolute_path: PathBuf::from(row.get::<_, String>(2)?),
                        modified_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(image)
    }

    pub fn count_images(&self) -> Result<i64> {
        let inner = self.lock();
        let count = inner
            .conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn file_modified_at(path: &Path) -> Option<String> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified).to_rfc3339())
}
