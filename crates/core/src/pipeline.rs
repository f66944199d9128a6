//! Single-image prediction with a Grad-CAM overlay for the predicted class.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::anyhow;
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::heatmap::HeatmapCompositor;
use crate::image_io::read_rgb;
use crate::model::{Classifier, ModelHandle};
use crate::preprocess::Preprocessor;
use crate::saliency::SaliencyMapBuilder;

/// Message reported when the input image path does not exist.
pub const IMAGE_NOT_FOUND: &str = "Image not found";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_class: String,
    pub probabilities: BTreeMap<String, f32>,
    /// Base64 JPEG of the saliency overlay at the working resolution.
    pub overlay: String,
}

/// What the prediction entry point reports: a result or a structured error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictOutcome {
    Prediction(Prediction),
    Error { error: String },
}

impl PredictOutcome {
    pub fn from_result(result: PipelineResult<Prediction>) -> Self {
        match result {
            Ok(prediction) => Self::Prediction(prediction),
            Err(err) if err.is_not_found() => Self::Error {
                error: IMAGE_NOT_FOUND.to_string(),
            },
            Err(err) => Self::Error {
                error: err.to_string(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

pub struct SaliencyPipeline<C> {
    model: ModelHandle<C>,
    preprocessor: Preprocessor,
    builder: SaliencyMapBuilder,
    compositor: HeatmapCompositor,
}

impl<C: Classifier> SaliencyPipeline<C> {
    pub fn new(model: ModelHandle<C>, config: &AppConfig) -> Self {
        let preprocessor = Preprocessor::from_config(&config.model);
        let size = preprocessor.size() as usize;
        Self {
            model,
            preprocessor,
            builder: SaliencyMapBuilder::new(size, size).with_epsilon(config.saliency.epsilon),
            compositor: HeatmapCompositor::from_config(&config.saliency),
        }
    }

    pub fn model(&self) -> &ModelHandle<C> {
        &self.model
    }

    pub fn predict(&self, image_path: &Path) -> PipelineResult<Prediction> {
        let image = read_rgb(image_path, "image")?;
        info!(path = %image_path.display(), "Running prediction");
        self.predict_image(&image)
    }

    pub fn predict_image(&self, image: &RgbImage) -> PipelineResult<Prediction> {
        let started = Instant::now();
        let prepared = self.preprocessor.prepare(image);

        let (class_names, probabilities, predicted, cam) = self.model.with(|model| {
            let capture = model.forward(&prepared.tensor)?;
            let probabilities = capture.probabilities();
            let predicted = capture
                .predicted_class()
                .ok_or_else(|| PipelineError::Model(anyhow!("classifier produced no scores")))?;
            let cam = self
                .builder
                .generate_from_capture(model, capture, predicted)?;
            Ok((model.class_names().to_vec(), probabilities, predicted, cam))
        })?;

        if probabilities.len() != class_names.len() {
            return Err(PipelineError::shape_mismatch(
                "class scores vs class names",
                &[class_names.len()],
                &[probabilities.len()],
            ));
        }

        let overlay = self.compositor.composite_base64(&cam, &prepared.resized)?;
        let predicted_class = class_names[predicted].clone();
        let probabilities = class_names
            .into_iter()
            .zip(probabilities.iter().copied())
            .collect();

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Prediction finished");
        info!(%predicted_class, "Prediction complete");
        Ok(Prediction {
            predicted_class,
            probabilities,
            overlay,
        })
    }

    /// [`predict`](Self::predict) with failures folded into the outcome.
    pub fn predict_outcome(&self, image_path: &Path) -> PredictOutcome {
        PredictOutcome::from_result(self.predict(image_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_image_is_reported_with_fixed_message() {
        let outcome = PredictOutcome::from_result(Err(PipelineError::InputNotFound {
            role: "image",
            path: PathBuf::from("/nope.png"),
        }));
        assert!(outcome.is_error());
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"error": "Image not found"})
        );
    }

    #[test]
    fn other_failures_keep_their_message() {
        let outcome = PredictOutcome::from_result(Err(PipelineError::ClassOutOfRange {
            index: 9,
            num_classes: 8,
        }));
        let value = serde_json::to_value(&outcome).unwrap();
        assert!(value["error"].as_str().unwrap().contains("out of range"));
    }

    #[test]
    fn prediction_serializes_flat_fields() {
        let outcome = PredictOutcome::Prediction(Prediction {
            predicted_class: "DME".into(),
            probabilities: BTreeMap::from([("DME".to_string(), 0.75), ("NORMAL".to_string(), 0.25)]),
            overlay: "AAAA".into(),
        });
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["predicted_class"], "DME");
        assert_eq!(value["probabilities"]["NORMAL"], 0.25);
        assert_eq!(value["overlay"], "AAAA");
        assert!(value.get("error").is_none());
    }
}
