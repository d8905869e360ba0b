//! Cluster partition management: relabelling, rename, merge, centroids and export.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::faces::bytes_to_embedding;
use super::IdentityStore;
use crate::error::{Error, Result};
use crate::export;
use crate::faces::advisor::{self, MergeSuggestion};
use crate::faces::embedding;

/// A cluster with the number of faces assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub id: i64,
    pub label: String,
    /// Member faces; each is one appearance of the person in a photo.
    pub photo_count: i64,
}

/// Name given to freshly created clusters.
pub fn default_label(cluster_id: i64) -> String {
    format!("Person #{}", cluster_id)
}

impl IdentityStore {
    /// Replace the whole cluster partition with `labels`.
    ///
    /// `labels[i]` belongs to the i-th face of the last `get_all_embeddings`
    /// call; `-1` leaves the face unclustered. Clusters are numbered from 1 in
    /// the order their label first appears. Runs in one transaction, so
    /// readers see either the old partition or the new one. Returns the number
    /// of clusters created.
    pub fn apply_cluster_labels(&self, labels: &[i32]) -> Result<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if labels.len() != inner.snapshot.len() {
            return Err(Error::LabelCountMismatch {
                expected: inner.snapshot.len(),
                found: labels.len(),
            });
        }

        let tx = inner.conn.transaction()?;
        tx.execute("UPDATE faces SET cluster_id = NULL", [])?;
        tx.execute("DELETE FROM clusters", [])?;

        let mut assigned: HashMap<i32, i64> = HashMap::new();
        {
            let mut insert_cluster = tx.prepare("INSERT INTO clusters (id, label) VALUES (?, ?)")?;
            let mut assign_face = tx.prepare("UPDATE faces SET cluster_id = ? WHERE id = ?")?;

            for (&face_id, &label) in inner.snapshot.iter().zip(labels) {
                if label < 0 {
                    continue;
                }
                let next_id = assigned.len() as i64 + 1;
                let cluster_id = match assigned.entry(label) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => {
                        insert_cluster.execute(params![next_id, default_label(next_id)])?;
                        *entry.insert(next_id)
                    }
                };
                assign_face.execute(params![cluster_id, face_id])?;
            }
        }
        tx.commit()?;

        Ok(assigned.len())
    }

    /// Clusters ordered by descending face count.
    pub fn list_clusters(&self) -> Result<Vec<ClusterSummary>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            r#"
            SELECT c.id, c.label, COUNT(f.id) AS face_count
            FROM clusters c
            LEFT JOIN faces f ON f.cluster_id = c.id
            GROUP BY c.id, c.label
            ORDER BY face_count DESC, c.id ASC
            "#,
        )?;
        let clusters = stmt
            .query_map([], |row| {
                Ok(ClusterSummary {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    photo_count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clusters)
    }

    pub fn rename_cluster(&self, cluster_id: i64, new_label: &str) -> Result<()> {
        let inner = self.lock();
        let updated = inner.conn.execute(
            "UPDATE clusters SET label = ? WHERE id = ?",
            params![new_label, cluster_id],
        )?;
        if updated == 0 {
            return Err(Error::UnknownCluster(cluster_id));
        }
        Ok(())
    }

    /// Fold `merged_ids` into `keep_id`. Returns the number of faces moved.
    pub fn merge_clusters(&self, keep_id: i64, merged_ids: &[i64]) -> Result<usize> {
        if merged_ids.is_empty() {
            return Ok(0);
        }
        if merged_ids.contains(&keep_id) {
            return Err(Error::InvalidMerge(keep_id));
        }

        let mut guard = self.lock();
        let tx = guard.conn.transaction()?;

        if !cluster_exists(&tx, keep_id)? {
            return Err(Error::UnknownCluster(keep_id));
        }

        let mut moved = 0;
        for &merged_id in merged_ids {
            moved += tx.execute(
                "UPDATE faces SET cluster_id = ? WHERE cluster_id = ?",
                params![keep_id, merged_id],
            )?;
            tx.execute("DELETE FROM clusters WHERE id = ?", [merged_id])?;
        }
        tx.commit()?;

        Ok(moved)
    }

    /// Normalized mean of the cluster's embeddings, `None` when it has no faces.
    pub fn cluster_centroid(&self, cluster_id: i64) -> Result<Option<Vec<f32>>> {
        let members = {
            let inner = self.lock();
            member_embeddings(&inner.conn, cluster_id)?
        };
        Ok(embedding::centroid(&members))
    }

    /// Pairs of clusters whose centroids lie within `threshold` cosine distance.
    pub fn suggest_merges(&self, threshold: f32, top_k: usize) -> Result<Vec<MergeSuggestion>> {
        let members = {
            let inner = self.lock();
            let ids = {
                let mut stmt = inner.conn.prepare("SELECT id FROM clusters ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            ids.into_iter()
                .map(|id| Ok((id, member_embeddings(&inner.conn, id)?)))
                .collect::<Result<Vec<_>>>()?
        };

        let centroids: Vec<(i64, Vec<f32>)> = members
            .into_iter()
            .filter_map(|(id, embeddings)| embedding::centroid(&embeddings).map(|c| (id, c)))
            .collect();

        Ok(advisor::suggest_merges(&centroids, threshold, top_k))
    }

    /// Copy every distinct source image of a cluster into `out_root/<label>`.
    ///
    /// Returns the number of files copied. Missing or unreadable sources are
    /// skipped.
    pub fn export_cluster(&self, cluster_id: i64, out_root: &Path) -> Result<usize> {
        let (label, sources) = {
            let inner = self.lock();
            let label: Option<String> = inner
                .conn
                .query_row("SELECT label FROM clusters WHERE id = ?", [cluster_id], |row| row.get(0))
                .optional()?;

            let mut stmt = inner.conn.prepare(
                r#"
                SELECT DISTINCT i.id, i.absolute_path
                FROM faces f
                JOIN images i ON i.id = f.image_id
                WHERE f.cluster_id = ?
                ORDER BY i.id
                "#,
            )?;
            let sources = stmt
                .query_map([cluster_id], |row| row.get::<_, String>(1).map(PathBuf::from))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (label, sources)
        };

        let fallback = format!("Person_{}", cluster_id);
        let dir_name = export::sanitize_dir_name(label.as_deref().unwrap_or(&fallback), &fallback);
        let person_dir = out_root.join(dir_name);
        std::fs::create_dir_all(&person_dir)?;

        Ok(export::copy_collision_safe(&sources, &person_dir))
    }
}

fn cluster_exists(conn: &Connection, cluster_id: i64) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM clusters WHERE id = ?)",
        [cluster_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn member_embeddings(conn: &Connection, cluster_id: i64) -> Result<Vec<Vec<f32>>> {
    let mut stmt = conn.prepare("SELECT embedding FROM faces WHERE cluster_id = ? ORDER BY id")?;
    let embeddings = stmt
        .query_map([cluster_id], |row| {
            let bytes: Vec<u8> = row.get(0)?;
            Ok(bytes_to_embedding(&bytes))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BoundingBox;
    use std::fs;
    use tempfile::tempdir;

    /// Store with one image per embedding, every face added in order.
    fn store_with_faces(embeddings: &[Vec<f32>]) -> (IdentityStore, Vec<i64>) {
        let store = IdentityStore::open_in_memory().unwrap();
        let mut face_ids = Vec::new();
        for (i, emb) in embeddings.iter().enumerate() {
            let rel = format!("img{}.jpg", i);
            let image_id = store
                .ensure_image(&rel, Path::new(&format!("/library/{}", rel)))
                .unwrap();
            let face_id = store
                .add_face(image_id, &BoundingBox::new(0, 0, 10, 10), emb)
                .unwrap();
            face_ids.push(face_id);
        }
        (store, face_ids)
    }

    fn unit(x: f32, y: f32, z: f32) -> Vec<f32> {
        let n = (x * x + y * y + z * z).sqrt();
        vec![x / n, y / n, z / n]
    }

    #[test]
    fn test_apply_labels_numbers_clusters_by_first_appearance() {
        let (store, faces) = store_with_faces(&vec![vec![1.0, 0.0, 0.0]; 5]);
        store.get_all_embeddings().unwrap();

        let created = store.apply_cluster_labels(&[7, -1, 2, 7, 2]).unwrap();
        assert_eq!(created, 2);

        assert_eq!(store.face_cluster(faces[0]).unwrap(), Some(1));
        assert_eq!(store.face_cluster(faces[1]).unwrap(), None);
        assert_eq!(store.face_cluster(faces[2]).unwrap(), Some(2));
        assert_eq!(store.face_cluster(faces[3]).unwrap(), Some(1));
        assert_eq!(store.face_cluster(faces[4]).unwrap(), Some(2));

        let clusters = store.list_clusters().unwrap();
        assert_eq!(
            clusters,
            vec![
                ClusterSummary { id: 1, label: "Person #1".to_string(), photo_count: 2 },
                ClusterSummary { id: 2, label: "Person #2".to_string(), photo_count: 2 },
            ]
        );
    }

    #[test]
    fn test_apply_labels_replaces_previous_partition() {
        let (store, faces) = store_with_faces(&vec![vec![1.0, 0.0, 0.0]; 3]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 1, 2]).unwrap();
        store.rename_cluster(3, "Grandma").unwrap();

        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[5, 5, -1]).unwrap();

        let clusters = store.list_clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].label, "Person #1");
        assert_eq!(clusters[0].photo_count, 2);
        assert_eq!(store.face_cluster(faces[2]).unwrap(), None);
    }

    #[test]
    fn test_apply_labels_length_mismatch_changes_nothing() {
        let (store, faces) = store_with_faces(&vec![vec![1.0, 0.0, 0.0]; 3]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 0, 0]).unwrap();

        let err = store.apply_cluster_labels(&[0, 1]).unwrap_err();
        assert!(matches!(err, Error::LabelCountMismatch { expected: 3, found: 2 }));
        assert_eq!(store.face_cluster(faces[0]).unwrap(), Some(1));
        assert_eq!(store.list_clusters().unwrap().len(), 1);
    }

    #[test]
    fn test_merge_clusters_moves_all_faces() {
        let (store, faces) = store_with_faces(&vec![vec![1.0, 0.0, 0.0]; 6]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 0, 0, 1, 1, 2]).unwrap();

        let moved = store.merge_clusters(1, &[2, 3]).unwrap();
        assert_eq!(moved, 3);

        let clusters = store.list_clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, 1);
        assert_eq!(clusters[0].photo_count, 6);
        for face in faces {
            assert_eq!(store.face_cluster(face).unwrap(), Some(1));
        }
    }

    #[test]
    fn test_merge_clusters_validation() {
        let (store, _) = store_with_faces(&vec![vec![1.0, 0.0, 0.0]; 2]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 1]).unwrap();

        assert_eq!(store.merge_clusters(1, &[]).unwrap(), 0);
        assert!(matches!(store.merge_clusters(1, &[1, 2]), Err(Error::InvalidMerge(1))));
        assert!(matches!(store.merge_clusters(9, &[2]), Err(Error::UnknownCluster(9))));
        assert_eq!(store.list_clusters().unwrap().len(), 2);
    }

    #[test]
    fn test_rename_cluster() {
        let (store, _) = store_with_faces(&[vec![1.0, 0.0, 0.0]]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0]).unwrap();

        store.rename_cluster(1, "Aunt May").unwrap();
        assert_eq!(store.list_clusters().unwrap()[0].label, "Aunt May");
        assert!(matches!(store.rename_cluster(2, "Nobody"), Err(Error::UnknownCluster(2))));
    }

    #[test]
    fn test_cluster_centroid() {
        let (store, _) = store_with_faces(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0]]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 0, -1]).unwrap();

        let centroid = store.cluster_centroid(1).unwrap().unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((centroid[0] - expected).abs() < 1e-4);
        assert!((centroid[1] - expected).abs() < 1e-4);
        assert_eq!(store.cluster_centroid(2).unwrap(), None);
    }

    #[test]
    fn test_suggest_merges_uses_centroid_distance() {
        // cos(A,B) = 0.8, cos(A,C) = 0.5, cos(B,C) = 0.4
        let a = unit(1.0, 0.0, 0.0);
        let b = unit(0.8, 0.6, 0.0);
        let c = unit(0.5, 0.0, 0.866_025_4);
        let (store, _) = store_with_faces(&[a, b, c]);
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 1, 2]).unwrap();

        for top_k in [1, 5, 50] {
            let suggestions = store.suggest_merges(0.35, top_k).unwrap();
            assert_eq!(suggestions.len(), 1);
            assert_eq!((suggestions[0].first, suggestions[0].second), (1, 2));
            assert!((suggestions[0].similarity - 0.8).abs() < 1e-3);
        }
    }

    #[test]
    fn test_export_cluster_keeps_same_named_files_apart() {
        let library = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::create_dir_all(library.path().join("2023")).unwrap();
        fs::create_dir_all(library.path().join("2024")).unwrap();
        let first = library.path().join("2023/name.jpg");
        let second = library.path().join("2024/name.jpg");
        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();

        let store = IdentityStore::open_in_memory().unwrap();
        for (rel, path) in [("2023/name.jpg", &first), ("2024/name.jpg", &second)] {
            let image_id = store.ensure_image(rel, path).unwrap();
            store
                .add_face(image_id, &BoundingBox::new(0, 0, 10, 10), &[1.0, 0.0])
                .unwrap();
            // A second face in the same photo must not duplicate the export.
            store
                .add_face(image_id, &BoundingBox::new(20, 20, 30, 30), &[1.0, 0.0])
                .unwrap();
        }
        store.get_all_embeddings().unwrap();
        store.apply_cluster_labels(&[0, 0, 0, 0]).unwrap();
        store.rename_cluster(1, "Mum/Dad").unwrap();

        let copied = store.export_cluster(1, out.path()).unwrap();
        assert_eq!(copied, 2);

        let person_dir = out.path().join("Mum_Dad");
        assert_eq!(fs::read(person_dir.join("name.jpg")).unwrap(), b"first");
        assert_eq!(fs::read(person_dir.join("name_1.jpg")).unwrap(), b"second");
    }

    #[test]
    fn test_export_unknown_cluster_uses_fallback_dir() {
        let out = tempdir().unwrap();
        let store = IdentityStore::open_in_memory().unwrap();

        assert_eq!(store.export_cluster(4, out.path()).unwrap(), 0);
        assert!(out.path().join("Person_4").is_dir());
    }
}
