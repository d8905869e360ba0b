use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::faces::clustering::{DEFAULT_EPS, DEFAULT_MIN_SAMPLES};
use crate::faces::finder::DEFAULT_THRESHOLDS;
use crate::scanner::DEFAULT_IMAGE_EXTENSIONS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub suggestions: SuggestionConfig,

    #[serde(default)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    DEFAULT_IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Cosine distance radius of a neighborhood.
    #[serde(default = "default_eps")]
    pub eps: f32,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_eps() -> f32 {
    DEFAULT_EPS
}

fn default_min_samples() -> usize {
    DEFAULT_MIN_SAMPLES
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            min_samples: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Report progress every this many images.
    #[serde(default = "default_progress_stride")]
    pub progress_stride: usize,
}

fn default_progress_stride() -> usize {
    10
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            progress_stride: default_progress_stride(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Cascading cosine distance thresholds for "find this person".
    #[serde(default = "default_search_thresholds")]
    pub thresholds: Vec<f32>,
}

fn default_search_thresholds() -> Vec<f32> {
    DEFAULT_THRESHOLDS.to_vec()
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            thresholds: default_search_thresholds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionConfig {
    #[serde(default = "default_suggestion_threshold")]
    pub threshold: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_suggestion_threshold() -> f32 {
    0.35
}

fn default_top_k() -> usize {
    50
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            threshold: default_suggestion_threshold(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Where the ONNX models are downloaded to.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facedex/models")
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_nms_threshold() -> f32 {
    0.3
}

fn default_intra_threads() -> usize {
    4
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facedex")
        .join("faces.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scanner: ScannerConfig::default(),
            clustering: ClusteringConfig::default(),
            indexer: IndexerConfig::default(),
            search: SearchConfig::default(),
            suggestions: SuggestionConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEDEX_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing out defaults if the file does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("Invalid config {:?}", path))?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("FACEDEX_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facedex")
    }
}
