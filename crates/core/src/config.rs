use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::annotation::{OutlineBlend, OUTLINE_COLOR, OUTLINE_WIDTH};
use crate::backend::InferenceBackend;
use crate::heatmap::{DEFAULT_JPEG_QUALITY, HEATMAP_WEIGHT, SOURCE_WEIGHT};
use crate::preprocess::{DEFAULT_INPUT_SIZE, IMAGENET_MEAN, IMAGENET_STD};
use crate::saliency::NORMALIZE_EPSILON;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "OCTLENS_DATA_DIR";

/// First class name that appears more than once. Probabilities are keyed by
/// name, so a repeated name would hide one of the scores.
pub fn duplicate_class_name(names: &[String]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(names.len());
    names
        .iter()
        .find(|name| !seen.insert(name.as_str()))
        .map(String::as_str)
}

/// Retinal OCT classes in the order of the classifier's output logits.
pub const DEFAULT_CLASS_NAMES: [&str; 8] =
    ["AMD", "CNV", "CSR", "DME", "DR", "DRUSEN", "MH", "NORMAL"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub saliency: SaliencyConfig,
    pub annotation: AnnotationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// ONNX graph ending at (or exposing) the designated layer.
    pub backbone: PathBuf,
    /// JSON weights of the pooled classification head.
    pub head: PathBuf,
    /// Output name of the designated layer. Empty selects the first output.
    pub target_layer: String,
    pub class_names: Vec<String>,
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub backend: InferenceBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SaliencyConfig {
    pub heatmap_weight: f32,
    pub source_weight: f32,
    pub epsilon: f32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnnotationConfig {
    pub outline_width: u32,
    pub outline_color: [u8; 3],
    pub outline_blend: OutlineBlend,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: PathBuf::from("convnext_base_features.onnx"),
            head: PathBuf::from("convnext_base_head.json"),
            target_layer: String::new(),
            class_names: DEFAULT_CLASS_NAMES.iter().map(ToString::to_string).collect(),
            input_size: DEFAULT_INPUT_SIZE,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            backend: InferenceBackend::default(),
        }
    }
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            heatmap_weight: HEATMAP_WEIGHT,
            source_weight: SOURCE_WEIGHT,
            epsilon: NORMALIZE_EPSILON,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            outline_width: OUTLINE_WIDTH,
            outline_color: OUTLINE_COLOR,
            outline_blend: OutlineBlend::default(),
        }
    }
}

impl ModelConfig {
    pub fn target_layer(&self) -> Option<&str> {
        let name = self.target_layer.trim();
        (!name.is_empty()).then_some(name)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.class_names.is_empty() {
            bail!("model.class_names must not be empty");
        }
        if let Some(name) = duplicate_class_name(&model.class_names) {
            bail!("model.class_names must be unique, {name:?} is listed more than once");
        }
        if model.input_size == 0 {
            bail!("model.input_size must be positive");
        }
        if model.std.iter().any(|s| !(*s > 0.0)) {
            bail!("model.std entries must be positive, got {:?}", model.std);
        }

        let saliency = &self.saliency;
        for (name, weight) in [
            ("heatmap_weight", saliency.heatmap_weight),
            ("source_weight", saliency.source_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                bail!("saliency.{name} must be finite and non-negative, got {weight}");
            }
        }
        if !(saliency.epsilon > 0.0) {
            bail!("saliency.epsilon must be positive, got {}", saliency.epsilon);
        }
        if !(1..=100).contains(&saliency.jpeg_quality) {
            bail!(
                "saliency.jpeg_quality must be within 1..=100, got {}",
                saliency.jpeg_quality
            );
        }
        Ok(())
    }

    /// Absolute location of the backbone model, resolved against `data_dir`.
    pub fn backbone_path(&self, data_dir: &Path) -> PathBuf {
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        resolve_relative_to(&models_dir, &self.model.backbone)
    }

    pub fn head_path(&self, data_dir: &Path) -> PathBuf {
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        resolve_relative_to(&models_dir, &self.model.head)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. OCTLENS_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
