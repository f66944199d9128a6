//! Activation and gradient capture for one designated layer.
//!
//! A forward pass hands back a [`LayerCapture`] owning a detached copy of the
//! layer output. The backward pass consumes that capture and returns
//! [`GradCamInputs`], so an activation can only ever be paired with the
//! gradient computed from it.

use ndarray::{Array1, Array3, ArrayView1, ArrayView3};
use tracing::trace;

use crate::error::{PipelineError, PipelineResult};

/// Observation point bound to one named layer of a classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecorder {
    layer: String,
}

impl ActivationRecorder {
    pub fn attach(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
        }
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Record the designated layer's output and the class scores of the same pass.
    ///
    /// Both are copied into owned storage, detached from whatever produced them.
    pub fn record_forward(
        &self,
        activation: ArrayView3<'_, f32>,
        logits: ArrayView1<'_, f32>,
    ) -> LayerCapture {
        trace!(
            layer = %self.layer,
            shape = ?activation.shape(),
            classes = logits.len(),
            "Recorded forward activation"
        );
        LayerCapture {
            layer: self.layer.clone(),
            activation: activation.to_owned(),
            logits: logits.to_owned(),
        }
    }

    /// Record the gradient that reached the layer during backpropagation of
    /// `target_class`'s score.
    pub fn record_backward(
        &self,
        capture: LayerCapture,
        gradient: Array3<f32>,
        target_class: usize,
    ) -> PipelineResult<GradCamInputs> {
        if capture.layer != self.layer {
            return Err(PipelineError::Model(anyhow::anyhow!(
                "capture from layer '{}' handed to recorder for '{}'",
                capture.layer,
                self.layer
            )));
        }
        if gradient.shape() != capture.activation.shape() {
            return Err(PipelineError::shape_mismatch(
                "layer gradient",
                capture.activation.shape(),
                gradient.shape(),
            ));
        }
        trace!(layer = %self.layer, target_class, "Recorded backward gradient");
        Ok(GradCamInputs {
            activation: capture.activation,
            gradient,
            target_class,
        })
    }
}

/// Output of one forward pass: class scores plus the designated layer's activation.
#[derive(Debug, Clone)]
pub struct LayerCapture {
    layer: String,
    activation: Array3<f32>,
    logits: Array1<f32>,
}

impl LayerCapture {
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Activation `A` with shape (channels, height, width).
    pub fn activation(&self) -> &Array3<f32> {
        &self.activation
    }

    pub fn logits(&self) -> &Array1<f32> {
        &self.logits
    }

    /// Softmax of the captured logits.
    pub fn probabilities(&self) -> Array1<f32> {
        softmax(self.logits.view())
    }

    /// Index of the highest-scoring class, `None` when there are no classes.
    pub fn predicted_class(&self) -> Option<usize> {
        argmax(self.logits.view())
    }
}

/// Activation and gradient of the same pass, ready for the saliency builder.
#[derive(Debug, Clone)]
pub struct GradCamInputs {
    pub activation: Array3<f32>,
    pub gradient: Array3<f32>,
    pub target_class: usize,
}

pub fn softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// First index of the maximum value.
pub fn argmax(values: ArrayView1<'_, f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}
