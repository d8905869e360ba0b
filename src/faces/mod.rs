pub mod advisor;
pub mod clustering;
pub mod detector;
pub mod embedding;
pub mod finder;

pub use advisor::MergeSuggestion;
pub use clustering::Clusterer;
pub use detector::{Detection, FaceDetector, OnnxFaceDetector};
pub use finder::{reference_embedding, FaceMatch, QuickFinder};
