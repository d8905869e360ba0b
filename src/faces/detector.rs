use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::DetectorConfig;
use crate::db::BoundingBox;

/// A face found in an image: where it is and who it looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// Anything that can turn an image file into face detections.
///
/// Callers treat an error as "no faces" for that image and move on.
pub trait FaceDetector: Send + Sync {
    fn extract_faces(&self, image_path: &Path) -> Result<Vec<Detection>>;
}

/// UltraFace model (320x240 version - fast)
const DETECTION_MODEL_FILE: &str = "ultraface-320.onnx";
const DETECTION_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

/// ArcFace model, 512-dim embeddings
const EMBEDDING_MODEL_FILE: &str = "arcface-resnet100.onnx";
const EMBEDDING_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

/// Face detector backed by ONNX Runtime: UltraFace for boxes, ArcFace for
/// L2-normalized embeddings.
pub struct OnnxFaceDetector {
    detection: Mutex<Session>,
    embedding: Mutex<Session>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl OnnxFaceDetector {
    /// Load both models, downloading them into `models_dir` on first use.
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", config.models_dir))?;

        let detection_path = ensure_model(&config.models_dir, DETECTION_MODEL_FILE, DETECTION_MODEL_URL)?;
        let embedding_path = ensure_model(&config.models_dir, EMBEDDING_MODEL_FILE, EMBEDDING_MODEL_URL)?;

        Ok(Self {
            detection: Mutex::new(load_session(&detection_path, config.intra_threads)?),
            embedding: Mutex::new(load_session(&embedding_path, config.intra_threads)?),
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn extract_faces(&self, image_path: &Path) -> Result<Vec<Detection>> {
        let img = image::open(image_path)
            .map_err(|e| anyhow!("Failed to load image {:?}: {}", image_path, e))?;

        let boxes = {
            let mut session = self
                .detection
                .lock()
                .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
            run_ultraface(&mut session, &img, self.confidence_threshold, self.nms_threshold)?
        };

        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self
            .embedding
            .lock()
            .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;

        let mut detections = Vec::with_capacity(boxes.len());
        for (bbox, _confidence) in boxes {
            if bbox.width() <= 0 || bbox.height() <= 0 {
                continue;
            }
            let crop = crop_face(&img, &bbox);
            let embedding = run_arcface(&mut session, &crop)?;
            detections.push(Detection { bbox, embedding });
        }

        Ok(detections)
    }
}

fn load_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Download a model file if it doesn't exist
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        // Write to a temporary name first so an interrupted download is retried.
        let partial_path = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial_path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial_path, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

/// Run UltraFace and return corner boxes in original image pixels.
fn run_ultraface(
    session: &mut Session,
    img: &DynamicImage,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: usize = 320;
    const INPUT_HEIGHT: usize = 240;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // NCHW, normalized to roughly [-1, 1]
    let plane = INPUT_HEIGHT * INPUT_WIDTH;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH + x as usize;
        for channel in 0..3 {
            input_data[channel * plane + idx] = (pixel[channel] as f32 - 127.0) / 128.0;
        }
    }

    let input_tensor = Tensor::from_array(([1usize, 3, INPUT_HEIGHT, INPUT_WIDTH], input_data.into_boxed_slice()))?;
    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape[1] as usize;
    let mut candidates = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= confidence_threshold {
            continue;
        }

        let x1 = ((boxes_data[i * 4] * orig_width as f32) as i32).max(0);
        let y1 = ((boxes_data[i * 4 + 1] * orig_height as f32) as i32).max(0);
        let x2 = ((boxes_data[i * 4 + 2] * orig_width as f32) as i32).min(orig_width as i32);
        let y2 = ((boxes_data[i * 4 + 3] * orig_height as f32) as i32).min(orig_height as i32);

        candidates.push((BoundingBox::new(x1, y1, x2.max(x1 + 1), y2.max(y1 + 1)), confidence));
    }

    Ok(nms(candidates, nms_threshold))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| compute_iou(&kept.0, &candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap = BoundingBox::new(a.x1.max(b.x1), a.y1.max(b.y1), a.x2.min(b.x2), a.y2.min(b.y2));

    let intersection = overlap.area() as f32;
    let union = (a.area() + b.area()) as f32 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region from image with 20% padding, clamped to the image.
fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();
    let padding_x = (bbox.width() as f32 * 0.2) as i32;
    let padding_y = (bbox.height() as f32 * 0.2) as i32;

    let x = (bbox.x1 - padding_x).max(0) as u32;
    let y = (bbox.y1 - padding_y).max(0) as u32;
    let x_end = ((bbox.x2 + padding_x).max(0) as u32).min(img_width);
    let y_end = ((bbox.y2 + padding_y).max(0) as u32).min(img_height);

    img.crop_imm(x, y, x_end.saturating_sub(x).max(1), y_end.saturating_sub(y).max(1))
}

/// Run ArcFace and return an L2-normalized embedding
fn run_arcface(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: usize = 112;

    let resized = face_img.resize_exact(
        INPUT_SIZE as u32,
        INPUT_SIZE as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // ArcFace normalization: (pixel - 127.5) / 127.5
    let plane = INPUT_SIZE * INPUT_SIZE;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE + x as usize;
        for channel in 0..3 {
            input_data[channel * plane + idx] = (pixel[channel] as f32 - 127.5) / 127.5;
        }
    }

    let input_tensor = Tensor::from_array(([1usize, 3, INPUT_SIZE, INPUT_SIZE], input_data.into_boxed_slice()))?;
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_embedding_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    Ok(super::embedding::l2_normalize(embedding_data))
}
