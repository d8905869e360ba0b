//! Walk a photo folder, record every face found, then regroup all faces.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;

use crate::config::Config;
use crate::db::IdentityStore;
use crate::faces::{Clusterer, FaceDetector};
use crate::scanner::{find_images, relative_path};
use crate::tasks::{CancelToken, TaskProgress};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexerOptions {
    pub clusterer: Clusterer,
    pub extensions: Vec<String>,
    /// Report progress every this many images (and always on the last one).
    pub progress_stride: usize,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl IndexerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            clusterer: Clusterer::new(config.clustering.eps, config.clustering.min_samples),
            extensions: config.scanner.image_extensions.clone(),
            progress_stride: config.indexer.progress_stride.max(1),
        }
    }
}

/// Aggregate counts for one indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub images_total: usize,
    pub images_processed: usize,
    /// Images that already had faces recorded.
    pub images_skipped: usize,
    pub images_failed: usize,
    pub faces_added: usize,
    /// Clusters after the run; `None` when clustering did not run.
    pub clusters: Option<usize>,
    pub cancelled: bool,
}

impl fmt::Display for IndexSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} images: {} processed, {} skipped, {} failed, {} faces added",
            self.images_total, self.images_processed, self.images_skipped, self.images_failed, self.faces_added
        )?;
        match self.clusters {
            Some(n) => write!(f, ", {} people", n)?,
            None if self.cancelled => write!(f, " (cancelled, clusters unchanged)")?,
            None => {}
        }
        Ok(())
    }
}

pub struct Indexer<'a> {
    store: &'a IdentityStore,
    detector: &'a dyn FaceDetector,
    options: IndexerOptions,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a IdentityStore, detector: &'a dyn FaceDetector, options: IndexerOptions) -> Self {
        Self {
            store,
            detector,
            options,
        }
    }

    /// Index every image under `root`, then recluster all stored faces.
    ///
    /// The first progress report has `current == 0` and carries the total.
    /// A cancelled run stops between images and leaves the existing
    /// clusters as they were.
    pub fn run<F>(&self, root: &Path, cancel: &CancelToken, mut on_progress: F) -> Result<IndexSummary>
    where
        F: FnMut(TaskProgress),
    {
        let images = find_images(root, &self.options.extensions)?;
        let total = images.len();
        let mut summary = IndexSummary {
            images_total: total,
            ..Default::default()
        };

        tracing::info!(root = ?root, total, "Indexing started");
        on_progress(TaskProgress::new(0, total).with_message(format!("Found {} images", total)));

        for (i, path) in images.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let rel = relative_path(path, root);
            match self.ingest(&rel, path) {
                Ok(Some(faces)) => {
                    summary.images_processed += 1;
                    summary.faces_added += faces;
                }
                Ok(None) => summary.images_skipped += 1,
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "Failed to index image");
                    summary.images_failed += 1;
                }
            }

            let done = i + 1;
            if done % self.options.progress_stride == 0 || done == total {
                on_progress(
                    TaskProgress::new(done, total)
                        .with_item(rel)
                        .with_message(format!("{} faces found", summary.faces_added)),
                );
            }
        }

        if summary.cancelled {
            tracing::info!(%summary, "Indexing cancelled");
            return Ok(summary);
        }

        summary.clusters = Some(self.recluster().context("Clustering failed")?);
        tracing::info!(%summary, "Indexing finished");
        Ok(summary)
    }

    /// `Ok(None)` when the image was indexed by an earlier run.
    fn ingest(&self, relative_path: &str, path: &Path) -> Result<Option<usize>> {
        let image_id = self.store.ensure_image(relative_path, path)?;
        if self.store.has_faces(image_id)? {
            return Ok(None);
        }

        let detections = self.detector.extract_faces(path)?;
        let added = self.store.add_faces(image_id, &detections)?;
        Ok(Some(added.len()))
    }

    /// Cluster the full embedding set and replace the stored partition.
    /// Returns the number of clusters.
    pub fn recluster(&self) -> crate::Result<usize> {
        let snapshot = self.store.get_all_embeddings()?;
        let embeddings: Vec<Vec<f32>> = snapshot.into_iter().map(|(_, e)| e).collect();
        let labels = self.options.clusterer.cluster(&embeddings)?;
        self.store.apply_cluster_labels(&labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BoundingBox;
    use crate::faces::Detection;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Returns canned detections by file name and counts every call.
    struct FakeDetector {
        by_name: HashMap<String, Vec<Detection>>,
        calls: AtomicUsize,
    }

    impl FaceDetector for FakeDetector {
        fn extract_faces(&self, image_path: &Path) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.by_name.get(&name) {
                Some(d) => Ok(d.clone()),
                None => anyhow::bail!("undecodable image {}", name),
            }
        }
    }

    fn face(embedding: [f32; 2]) -> Detection {
        Detection {
            bbox: BoundingBox::new(0, 0, 10, 10),
            embedding: embedding.to_vec(),
        }
    }

    /// Three photos of one person, three of another, one stranger and one
    /// file the detector cannot read.
    fn library() -> (TempDir, FakeDetector) {
        let dir = tempdir().unwrap();
        let mut by_name = HashMap::new();
        for (name, emb) in [
            ("a1.jpg", [1.0, 0.0]),
            ("a2.jpg", [0.99, 0.141]),
            ("a3.jpg", [0.98, -0.199]),
            ("b1.jpg", [0.0, 1.0]),
            ("b2.jpg", [-0.141, 0.99]),
            ("b3.jpg", [0.199, 0.98]),
        ] {
            by_name.insert(name.to_string(), vec![face(emb)]);
        }
        by_name.insert("stranger.png".to_string(), vec![face([-0.7071, -0.7071])]);
        by_name.insert("empty.jpg".to_string(), vec![]);

        for name in by_name.keys() {
            std::fs::write(dir.path().join(name), b"not really an image").unwrap();
        }
        std::fs::write(dir.path().join("broken.jpg"), b"truncated").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let detector = FakeDetector {
            by_name,
            calls: AtomicUsize::new(0),
        };
        (dir, detector)
    }

    fn options() -> IndexerOptions {
        IndexerOptions {
            clusterer: Clusterer::default(),
            extensions: vec!["jpg".to_string(), "png".to_string()],
            progress_stride: 4,
        }
    }

    #[test]
    fn test_index_then_cluster() {
        let (dir, detector) = library();
        let store = IdentityStore::open_in_memory().unwrap();
        let indexer = Indexer::new(&store, &detector, options());

        let summary = indexer.run(dir.path(), &CancelToken::new(), |_| {}).unwrap();
        assert_eq!(summary.images_total, 9);
        assert_eq!(summary.images_processed, 8);
        assert_eq!(summary.images_failed, 1);
        assert_eq!(summary.faces_added, 7);
        assert_eq!(summary.clusters, Some(2));
        assert!(!summary.cancelled);

        let clusters = store.list_clusters().unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.photo_count == 3));

        let stranger = store
            .get_recent_faces(10)
            .unwrap()
            .into_iter()
            .find(|f| f.absolute_path.ends_with("stranger.png"))
            .unwrap();
        assert_eq!(store.face_cluster(stranger.face_id).unwrap(), None);
    }

    #[test]
    fn test_second_pass_adds_nothing() {
        let (dir, detector) = library();
        let store = IdentityStore::open_in_memory().unwrap();
        let indexer = Indexer::new(&store, &detector, options());

        indexer.run(dir.path(), &CancelToken::new(), |_| {}).unwrap();
        let faces_before = store.count_faces().unwrap();
        let calls_before = detector.calls.load(Ordering::SeqCst);

        let summary = indexer.run(dir.path(), &CancelToken::new(), |_| {}).unwrap();
        assert_eq!(summary.faces_added, 0);
        assert_eq!(summary.images_skipped, 7);
        assert_eq!(store.count_faces().unwrap(), faces_before);
        assert_eq!(store.count_images().unwrap(), 9);
        // Images without faces and the broken one are retried.
        assert_eq!(detector.calls.load(Ordering::SeqCst), calls_before + 2);
    }

    #[test]
    fn test_cancelled_run_keeps_previous_clusters() {
        let (dir, detector) = library();
        let store = IdentityStore::open_in_memory().unwrap();
        let indexer = Indexer::new(&store, &detector, options());
        indexer.run(dir.path(), &CancelToken::new(), |_| {}).unwrap();
        store.rename_cluster(1, "Alice").unwrap();

        std::fs::write(dir.path().join("zz_new.jpg"), b"new").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let summary = indexer.run(dir.path(), &cancel, |_| {}).unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.clusters, None);
        assert_eq!(summary.images_processed + summary.images_skipped, 0);
        let labels: Vec<String> = store.list_clusters().unwrap().into_iter().map(|c| c.label).collect();
        assert!(labels.contains(&"Alice".to_string()));
    }

    #[test]
    fn test_progress_reports() {
        let (dir, detector) = library();
        let store = IdentityStore::open_in_memory().unwrap();
        let indexer = Indexer::new(&store, &detector, options());

        let mut reports: Vec<(usize, usize)> = Vec::new();
        indexer
            .run(dir.path(), &CancelToken::new(), |p| reports.push((p.current, p.total)))
            .unwrap();
        assert_eq!(reports, vec![(0, 9), (4, 9), (8, 9), (9, 9)]);
    }

    #[test]
    fn test_rejected_image_is_not_half_stored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        let mut by_name = HashMap::new();
        by_name.insert(
            "a.jpg".to_string(),
            vec![
                face([1.0, 0.0]),
                Detection {
                    bbox: BoundingBox::new(20, 0, 30, 10),
                    embedding: vec![1.0, 0.0, 0.0],
                },
            ],
        );
        let detector = FakeDetector {
            by_name,
            calls: AtomicUsize::new(0),
        };
        let store = IdentityStore::open_in_memory().unwrap();
        let indexer = Indexer::new(&store, &detector, options());

        let first = indexer.run(dir.path(), &CancelToken::new(), |_| {}).unwrap();
        assert_eq!(first.images_failed, 1);
        assert_eq!(first.faces_added, 0);
        assert_eq!(store.count_faces().unwrap(), 0);

        // Nothing was stored, so the next run tries the image again.
        let second = indexer.run(dir.path(), &CancelToken::new(), |_| {}).unwrap();
        assert_eq!(second.images_skipped, 0);
        assert_eq!(second.images_failed, 1);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let (_dir, detector) = library();
        let store = IdentityStore::open_in_memory().unwrap();
        let indexer = Indexer::new(&store, &detector, options());
        let missing = PathBuf::from("/nonexistent/library");
        assert!(indexer.run(&missing, &CancelToken::new(), |_| {}).is_err());
    }
}
