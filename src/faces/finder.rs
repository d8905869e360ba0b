//! Search a folder for one person without touching the identity store.

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::detector::FaceDetector;
use super::embedding::{cosine_similarity, l2_normalize};
use crate::db::BoundingBox;
use crate::tasks::{CancelToken, TaskProgress};

/// Cosine distance thresholds tried from tightest to loosest.
pub const DEFAULT_THRESHOLDS: [f32; 3] = [0.35, 0.45, 0.55];

/// Best-matching face in one candidate image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    pub path: PathBuf,
    pub bbox: BoundingBox,
    pub similarity: f32,
    pub distance: f32,
    /// Index of the tightest threshold satisfied; 0 is the most confident.
    pub tier: usize,
}

pub struct QuickFinder<'a> {
    detector: &'a dyn FaceDetector,
    thresholds: Vec<f32>,
    progress_stride: usize,
}

impl<'a> QuickFinder<'a> {
    pub fn new(detector: &'a dyn FaceDetector, thresholds: &[f32]) -> Result<Self> {
        if thresholds.is_empty() {
            bail!("At least one search threshold is required");
        }
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_by(f32::total_cmp);

        Ok(Self {
            detector,
            thresholds,
            progress_stride: 10,
        })
    }

    pub fn with_progress_stride(mut self, stride: usize) -> Self {
        self.progress_stride = stride.max(1);
        self
    }

    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    pub fn tier_for(&self, distance: f32) -> Option<usize> {
        self.thresholds.iter().position(|&t| distance <= t)
    }

    /// Compare every candidate image against `reference`.
    ///
    /// Images the detector fails on count as having no faces. A cancelled
    /// scan returns whatever matched before the token was tripped.
    pub fn scan<F>(
        &self,
        reference: &[f32],
        candidates: &[PathBuf],
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Vec<FaceMatch>
    where
        F: FnMut(TaskProgress),
    {
        let reference = l2_normalize(reference);
        let total = candidates.len();
        let mut matches = Vec::new();

        for (i, path) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(scanned = i, total, "Search cancelled");
                break;
            }

            if let Some(found) = self.best_match(&reference, path) {
                matches.push(found);
            }

            let done = i + 1;
            if done % self.progress_stride == 0 || done == total {
                on_progress(
                    TaskProgress::new(done, total)
                        .with_message(format!("Scanned {}/{} ({} matches)", done, total, matches.len())),
                );
            }
        }

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches
    }

    fn best_match(&self, reference: &[f32], path: &Path) -> Option<FaceMatch> {
        let detections = match self.detector.extract_faces(path) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(path = ?path, error = %e, "Skipping unreadable candidate");
                return None;
            }
        };

        let mut best: Option<(BoundingBox, f32)> = None;
        for detection in detections {
            if detection.embedding.len() != reference.len() {
                continue;
            }
            let similarity = cosine_similarity(reference, &detection.embedding);
            // Strictly greater, so the first detection wins ties.
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((detection.bbox, similarity));
            }
        }

        let (bbox, similarity) = best?;
        let distance = 1.0 - similarity;
        let tier = self.tier_for(distance)?;

        Some(FaceMatch {
            path: path.to_path_buf(),
            bbox,
            similarity,
            distance,
            tier,
        })
    }
}

/// Embedding of the largest face in a reference photo.
pub fn reference_embedding(detector: &dyn FaceDetector, path: &Path) -> Result<Vec<f32>> {
    let detections = detector.extract_faces(path)?;
    let largest = detections
        .into_iter()
        .reduce(|best, d| if d.bbox.area() > best.bbox.area() { d } else { best });

    match largest {
        Some(d) => Ok(l2_normalize(&d.embedding)),
        None => bail!("No face found in reference image {:?}", path),
    }
}
