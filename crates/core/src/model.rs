//! Classifier abstraction and the ONNX-backed implementation.
//!
//! A classifier is split at the designated layer: a [`FeatureExtractor`]
//! produces that layer's activation, and a [`ClassifierHead`] maps it to class
//! scores. Every forward pass returns its own [`LayerCapture`]; the backward
//! pass consumes it.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array3, Array4, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::capture::{ActivationRecorder, GradCamInputs, LayerCapture};
use crate::config::{duplicate_class_name, AppConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::head::ClassifierHead;

/// Produces the activation of the designated layer for a batch of one.
pub trait FeatureExtractor {
    /// Name of the layer whose output [`extract`](Self::extract) returns.
    fn layer_name(&self) -> &str;

    /// `input` is NCHW with N = 1; returns (channels, height, width).
    fn extract(&mut self, input: &Array4<f32>) -> Result<Array3<f32>>;
}

pub trait Classifier {
    fn class_names(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }

    /// Layer observed by the forward/backward captures.
    fn target_layer(&self) -> &str;

    fn forward(&mut self, input: &Array4<f32>) -> PipelineResult<LayerCapture>;

    /// Gradient of `target_class`'s score with respect to the captured activation.
    fn backward(
        &mut self,
        capture: LayerCapture,
        target_class: usize,
    ) -> PipelineResult<GradCamInputs>;
}

/// Backbone up to the designated layer followed by an in-process head.
pub struct HeadedClassifier<F> {
    backbone: F,
    head: ClassifierHead,
    recorder: ActivationRecorder,
    class_names: Vec<String>,
}

impl<F: FeatureExtractor> HeadedClassifier<F> {
    pub fn new(backbone: F, head: ClassifierHead, class_names: Vec<String>) -> Result<Self> {
        if head.num_classes() != class_names.len() {
            bail!(
                "head produces {} scores but {} class names are configured",
                head.num_classes(),
                class_names.len()
            );
        }
        if let Some(name) = duplicate_class_name(&class_names) {
            bail!("class name {name:?} is listed more than once");
        }
        let recorder = ActivationRecorder::attach(backbone.layer_name());
        Ok(Self {
            backbone,
            head,
            recorder,
            class_names,
        })
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }
}

impl<F: FeatureExtractor> Classifier for HeadedClassifier<F> {
    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn target_layer(&self) -> &str {
        self.recorder.layer()
    }

    fn forward(&mut self, input: &Array4<f32>) -> PipelineResult<LayerCapture> {
        let activation = self.backbone.extract(input)?;
        let logits = self.head.forward(activation.view())?;
        Ok(self.recorder.record_forward(activation.view(), logits.view()))
    }

    fn backward(
        &mut self,
        capture: LayerCapture,
        target_class: usize,
    ) -> PipelineResult<GradCamInputs> {
        let num_classes = self.num_classes();
        if target_class >= num_classes {
            return Err(PipelineError::ClassOutOfRange {
                index: target_class,
                num_classes,
            });
        }
        let gradient = self
            .head
            .score_gradient(capture.activation().view(), target_class)?;
        self.recorder
            .record_backward(capture, gradient, target_class)
    }
}

/// ONNX graph whose selected output is the designated layer.
pub struct OnnxBackbone {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxBackbone {
    pub fn load(
        model_path: &Path,
        backend: InferenceBackend,
        target_layer: Option<&str>,
    ) -> Result<Self> {
        let session = build_session(&SessionConfig {
            model_path,
            backend,
        })?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("ONNX backbone declares no inputs")?;
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();

        let output_name = match target_layer {
            Some(layer) => output_names
                .iter()
                .find(|name| name.as_str() == layer)
                .cloned()
                .with_context(|| {
                    format!("target layer '{layer}' is not an output of the backbone; available: {output_names:?}")
                })?,
            None => output_names
                .first()
                .cloned()
                .context("ONNX backbone declares no outputs")?,
        };

        debug!(%input_name, %output_name, "Detected backbone IO");

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn layer_name(&self) -> &str {
        &self.output_name
    }

    fn extract(&mut self, input: &Array4<f32>) -> Result<Array3<f32>> {
        let input_tensor = Tensor::from_array(input.clone())?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;

        let batch = output_view
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| anyhow!("designated layer output must be NCHW: {e}"))?;
        if batch.shape()[0] != 1 {
            bail!(
                "expected a batch of one from the backbone, got {}",
                batch.shape()[0]
            );
        }
        Ok(batch.index_axis_move(Axis(0), 0))
    }
}

/// Shared, single-writer handle to a loaded classifier.
///
/// Forward and backward passes on one instance are serialized by the lock;
/// independent replicas can run in parallel.
pub struct ModelHandle<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for ModelHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Classifier> ModelHandle<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(classifier)),
        }
    }

    /// Run `f` with exclusive access to the classifier.
    pub fn with<R>(&self, f: impl FnOnce(&mut C) -> PipelineResult<R>) -> PipelineResult<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| PipelineError::Model(anyhow!("model handle poisoned by a panic")))?;
        f(&mut guard)
    }
}

pub type OnnxClassifier = HeadedClassifier<OnnxBackbone>;

/// Load the configured backbone and head from `data_dir`.
pub fn load_classifier(config: &AppConfig, data_dir: &Path) -> Result<OnnxClassifier> {
    let backbone_path = config.backbone_path(data_dir);
    let head_path = config.head_path(data_dir);

    let backbone = OnnxBackbone::load(
        &backbone_path,
        config.model.backend,
        config.model.target_layer(),
    )?;
    let head = ClassifierHead::load_from_path(&head_path)?;
    HeadedClassifier::new(backbone, head, config.model.class_names.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array1};

    struct PooledInput {
        grid: usize,
    }

    impl FeatureExtractor for PooledInput {
        fn layer_name(&self) -> &str {
            "pooled"
        }

        fn extract(&mut self, input: &Array4<f32>) -> Result<Array3<f32>> {
            let (_, channels, height, width) = input.dim();
            let cell_h = height / self.grid;
            let cell_w = width / self.grid;
            Ok(Array3::from_shape_fn((channels, self.grid, self.grid), |(c, gy, gx)| {
                let mut sum = 0.0;
                for y in gy * cell_h..(gy + 1) * cell_h {
                    for x in gx * cell_w..(gx + 1) * cell_w {
                        sum += input[[0, c, y, x]];
                    }
                }
                sum / (cell_h * cell_w) as f32
            }))
        }
    }

    fn classifier() -> HeadedClassifier<PooledInput> {
        let head = ClassifierHead::new(
            array![[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]],
            Array1::zeros(2),
            None,
        )
        .unwrap();
        HeadedClassifier::new(
            PooledInput { grid: 2 },
            head,
            vec!["red".to_string(), "green".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn repeated_class_names_are_rejected() {
        let head = ClassifierHead::new(
            array![[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]],
            Array1::zeros(2),
            None,
        )
        .unwrap();
        let result = HeadedClassifier::new(
            PooledInput { grid: 2 },
            head,
            vec!["AMD".to_string(), "AMD".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn forward_scores_follow_channel_means() {
        let mut model = classifier();
        let mut input = Array4::<f32>::zeros((1, 3, 4, 4));
        input.index_axis_mut(Axis(1), 1).fill(2.0);

        let capture = model.forward(&input).unwrap();
        assert_eq!(capture.layer(), "pooled");
        assert_eq!(capture.activation().dim(), (3, 2, 2));
        assert_eq!(capture.predicted_class(), Some(1));
    }

    #[test]
    fn backward_yields_gradient_for_the_captured_activation() {
        let mut model = classifier();
        let input = Array4::<f32>::ones((1, 3, 4, 4));
        let capture = model.forward(&input).unwrap();
        let inputs = model.backward(capture, 0).unwrap();

        assert_eq!(inputs.gradient.dim(), (3, 2, 2));
        assert!(inputs.gradient.index_axis(Axis(0), 0).iter().all(|&g| g == 0.25));
        assert!(inputs.gradient.index_axis(Axis(0), 1).iter().all(|&g| g == 0.0));
    }

    #[test]
    fn backward_rejects_out_of_range_class() {
        let mut model = classifier();
        let capture = model.forward(&Array4::zeros((1, 3, 4, 4))).unwrap();
        let err = model.backward(capture, 2).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ClassOutOfRange {
                index: 2,
                num_classes: 2
            }
        ));
    }

    #[test]
    fn class_count_must_match_head() {
        let head = ClassifierHead::new(Array2::ones((3, 3)), Array1::zeros(3), None).unwrap();
        let result = HeadedClassifier::new(PooledInput { grid: 1 }, head, vec!["a".into()]);
        assert!(result.is_err());
    }

    #[test]
    fn model_handle_serializes_access() {
        let handle = ModelHandle::new(classifier());
        let other = handle.clone();
        let names = other
            .with(|model| Ok(model.class_names().to_vec()))
            .unwrap();
        assert_eq!(names, vec!["red".to_string(), "green".to_string()]);
        assert_eq!(handle.with(|model| Ok(model.num_classes())).unwrap(), 2);
    }
}
