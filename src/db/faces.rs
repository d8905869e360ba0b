//! Face rows: bounding boxes, embeddings and cluster membership.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::IdentityStore;
use crate::error::{Error, Result};
use crate::faces::Detection;

/// Bounding box of a detected face, in pixel corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Area in pixels; zero for degenerate boxes.
    pub fn area(&self) -> i64 {
        i64::from(self.width().max(0)) * i64::from(self.height().max(0))
    }
}

/// Face with the path of the image it was found in, for previews.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceWithImage {
    pub face_id: i64,
    pub bbox: BoundingBox,
    pub absolute_path: PathBuf,
}

impl IdentityStore {
    /// Append a face to an existing image.
    ///
    /// Fails without writing if the image is unknown or the embedding length
    /// differs from the faces already stored.
    pub fn add_face(&self, image_id: i64, bbox: &BoundingBox, embedding: &[f32]) -> Result<i64> {
        let inner = self.lock();
        check_new_faces(&inner.conn, image_id, [embedding.len()])?;
        insert_face(&inner.conn, image_id, bbox, embedding)
    }

    /// Store every detection of one image, or none of them.
    ///
    /// All embeddings are checked against the stored dimension (and against
    /// each other) before anything is written. Returns the new face ids.
    pub fn add_faces(&self, image_id: i64, detections: &[Detection]) -> Result<Vec<i64>> {
        let mut guard = self.lock();
        let tx = guard.conn.transaction()?;
        check_new_faces(&tx, image_id, detections.iter().map(|d| d.embedding.len()))?;

        let ids = detections
            .iter()
            .map(|d| insert_face(&tx, image_id, &d.bbox, &d.embedding))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }

    /// All face embeddings ordered by face id.
    ///
    /// The order is remembered so a later `apply_cluster_labels` can be
    /// matched back to face ids by position.
    pub fn get_all_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut inner = self.lock();

        let rows = {
            let mut stmt = inner
                .conn
                .prepare("SELECT id, embedding FROM faces ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    let bytes: Vec<u8> = row.get(1)?;
                    Ok((row.get::<_, i64>(0)?, bytes_to_embedding(&bytes)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        inner.snapshot = rows.iter().map(|(id, _)| *id).collect();
        Ok(rows)
    }

    pub fn get_faces_by_cluster(&self, cluster_id: i64) -> Result<Vec<FaceWithImage>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            r#"
            SELECT f.id, f.bbox_x1, f.bbox_y1, f.bbox_x2, f.bbox_y2, i.absolute_path
            FROM faces f
            JOIN images i ON i.id = f.image_id
            WHERE f.cluster_id = ?
            ORDER BY f.id
            "#,
        )?;
        let faces = stmt
            .query_map([cluster_id], row_to_face_with_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Most recently added faces first.
    pub fn get_recent_faces(&self, limit: usize) -> Result<Vec<FaceWithImage>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            r#"
            SELECT f.id, f.bbox_x1, f.bbox_y1, f.bbox_x2, f.bbox_y2, i.absolute_path
            FROM faces f
            JOIN images i ON i.id = f.image_id
            ORDER BY f.id DESC
            LIMIT ?
            "#,
        )?;
        let faces = stmt
            .query_map([limit as i64], row_to_face_with_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Cluster a face currently belongs to, `None` for noise or unknown faces.
    pub fn face_cluster(&self, face_id: i64) -> Result<Option<i64>> {
        let inner = self.lock();
        let cluster = inner
            .conn
            .query_row("SELECT cluster_id FROM faces WHERE id = ?", [face_id], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?;
        Ok(cluster.flatten())
    }

    pub fn count_faces(&self) -> Result<i64> {
        let inner = self.lock();
        let count = inner
            .conn
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn check_new_faces(conn: &Connection, image_id: i64, dims: impl IntoIterator<Item = usize>) -> Result<()> {
    let image_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM images WHERE id = ?)",
        [image_id],
        |row| row.get(0),
    )?;
    if !image_exists {
        return Err(Error::UnknownImage(image_id));
    }

    let mut expected: Option<usize> = conn
        .query_row("SELECT embedding_dim FROM faces LIMIT 1", [], |row| row.get::<_, i64>(0))
        .optional()?
        .map(|dim| dim as usize);
    for found in dims {
        match expected {
            Some(dim) if dim != found => return Err(Error::DimensionMismatch { expected: dim, found }),
            Some(_) => {}
            None => expected = Some(found),
        }
    }
    Ok(())
}

fn insert_face(conn: &Connection, image_id: i64, bbox: &BoundingBox, embedding: &[f32]) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO faces (image_id, bbox_x1, bbox_y1, bbox_x2, bbox_y2, embedding, embedding_dim)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            image_id,
            bbox.x1,
            bbox.y1,
            bbox.x2,
            bbox.y2,
            embedding_to_bytes(embedding),
            embedding.len() as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_face_with_image(row: &rusqlite::Row) -> rusqlite::Result<FaceWithImage> {
    Ok(FaceWithImage {
        face_id: row.get(0)?,
        bbox: BoundingBox::new(row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
        absolute_path: PathBuf::from(row.get::<_, String>(5)?),
    })
}

/// Convert f32 slice to little-endian bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert stored bytes back to an f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store_with_image() -> (IdentityStore, i64) {
        let store = IdentityStore::open_in_memory().unwrap();
        let image_id = store
            .ensure_image("family/beach.jpg", Path::new("/photos/family/beach.jpg"))
            .unwrap();
        (store, image_id)
    }

    #[test]
    fn test_add_face_requires_image() {
        let store = IdentityStore::open_in_memory().unwrap();
        let err = store
            .add_face(42, &BoundingBox::new(0, 0, 10, 10), &[1.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownImage(42)));
        assert_eq!(store.count_faces().unwrap(), 0);
    }

    #[test]
    fn test_add_face_rejects_dimension_change() {
        let (store, image_id) = store_with_image();
        store
            .add_face(image_id, &BoundingBox::new(0, 0, 10, 10), &[1.0, 0.0, 0.0])
            .unwrap();

        let err = store
            .add_face(image_id, &BoundingBox::new(5, 5, 20, 20), &[1.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, found: 2 }));
        assert_eq!(store.count_faces().unwrap(), 1);
    }

    #[test]
    fn test_add_faces_is_all_or_nothing() {
        let (store, image_id) = store_with_image();
        let detections = vec![
            Detection {
                bbox: BoundingBox::new(0, 0, 10, 10),
                embedding: vec![1.0, 0.0],
            },
            Detection {
                bbox: BoundingBox::new(20, 0, 30, 10),
                embedding: vec![1.0, 0.0, 0.0],
            },
        ];

        let err = store.add_faces(image_id, &detections).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, found: 3 }));
        assert_eq!(store.count_faces().unwrap(), 0);
        assert!(!store.has_faces(image_id).unwrap());

        let ids = store.add_faces(image_id, &detections[..1]).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(matches!(
            store.add_faces(image_id, &detections[1..]),
            Err(Error::DimensionMismatch { expected: 2, found: 3 })
        ));
        assert!(matches!(store.add_faces(99, &detections[..1]), Err(Error::UnknownImage(99))));
        assert_eq!(store.count_faces().unwrap(), 1);
    }

    #[test]
    fn test_embeddings_come_back_in_insert_order() {
        let (store, image_id) = store_with_image();
        assert!(!store.has_faces(image_id).unwrap());

        let first = store
            .add_face(image_id, &BoundingBox::new(1, 2, 3, 4), &[0.6, 0.8])
            .unwrap();
        let second = store
            .add_face(image_id, &BoundingBox::new(5, 6, 7, 8), &[1.0, 0.0])
            .unwrap();

        assert!(store.has_faces(image_id).unwrap());
        let all = store.get_all_embeddings().unwrap();
        assert_eq!(all, vec![(first, vec![0.6, 0.8]), (second, vec![1.0, 0.0])]);
    }

    #[test]
    fn test_recent_faces_newest_first() {
        let (store, image_id) = store_with_image();
        for i in 0..5 {
            store
                .add_face(image_id, &BoundingBox::new(i, i, i + 10, i + 10), &[1.0])
                .unwrap();
        }

        let recent = store.get_recent_faces(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].bbox, BoundingBox::new(4, 4, 14, 14));
        assert_eq!(recent[1].bbox, BoundingBox::new(3, 3, 13, 13));
        assert_eq!(recent[0].absolute_path, Path::new("/photos/family/beach.jpg"));
    }

    #[test]
    fn test_bbox_area() {
        assert_eq!(BoundingBox::new(10, 10, 30, 20).area(), 200);
        assert_eq!(BoundingBox::new(30, 10, 10, 20).area(), 0);
    }
}
