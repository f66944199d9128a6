//! Grad-CAM saliency maps.
//!
//! Channel weights are the spatial mean of the gradient; the raw map is the
//! rectified weighted sum of activation channels. The map is upsampled to the
//! working resolution and min-max normalized with an epsilon guard.

use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, Axis};
use tracing::debug;

use crate::capture::{GradCamInputs, LayerCapture};
use crate::error::{PipelineError, PipelineResult};
use crate::model::Classifier;

/// Guard added to the dynamic range during normalization.
pub const NORMALIZE_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMapBuilder {
    output_height: usize,
    output_width: usize,
    epsilon: f32,
}

impl SaliencyMapBuilder {
    pub fn new(output_height: usize, output_width: usize) -> Self {
        Self {
            output_height,
            output_width,
            epsilon: NORMALIZE_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn output_size(&self) -> (usize, usize) {
        (self.output_height, self.output_width)
    }

    /// Forward `input`, backpropagate `target_class`, and build the map.
    pub fn generate<C: Classifier + ?Sized>(
        &self,
        model: &mut C,
        input: &Array4<f32>,
        target_class: usize,
    ) -> PipelineResult<Array2<f32>> {
        check_class(model, target_class)?;
        let capture = model.forward(input)?;
        self.generate_from_capture(model, capture, target_class)
    }

    /// Build the map from a forward pass that has already run.
    pub fn generate_from_capture<C: Classifier + ?Sized>(
        &self,
        model: &mut C,
        capture: LayerCapture,
        target_class: usize,
    ) -> PipelineResult<Array2<f32>> {
        check_class(model, target_class)?;
        let inputs = model.backward(capture, target_class)?;
        self.build(&inputs)
    }

    pub fn build(&self, inputs: &GradCamInputs) -> PipelineResult<Array2<f32>> {
        if inputs.gradient.shape() != inputs.activation.shape() {
            return Err(PipelineError::shape_mismatch(
                "gradient vs activation",
                inputs.activation.shape(),
                inputs.gradient.shape(),
            ));
        }
        let weights = channel_weights(&inputs.gradient);
        let raw = rectified_weighted_sum(&inputs.activation, &weights);
        let upsampled = upsample_bilinear(raw.view(), self.output_height, self.output_width);
        let normalized = normalize(&upsampled, self.epsilon);

        debug!(
            target_class = inputs.target_class,
            layer_shape = ?inputs.activation.shape(),
            output = ?normalized.dim(),
            "Built saliency map"
        );
        Ok(normalized)
    }
}

fn check_class<C: Classifier + ?Sized>(model: &C, target_class: usize) -> PipelineResult<()> {
    let num_classes = model.num_classes();
    if target_class >= num_classes {
        return Err(PipelineError::ClassOutOfRange {
            index: target_class,
            num_classes,
        });
    }
    Ok(())
}

/// Global average pool of the gradient over both spatial axes.
pub fn channel_weights(gradient: &Array3<f32>) -> Array1<f32> {
    let (channels, height, width) = gradient.dim();
    if height == 0 || width == 0 {
        return Array1::zeros(channels);
    }
    gradient.sum_axis(Axis(2)).sum_axis(Axis(1)) / (height * width) as f32
}

/// `relu(Σ_c w_c · A_c)`
pub fn rectified_weighted_sum(activation: &Array3<f32>, weights: &Array1<f32>) -> Array2<f32> {
    let (_, height, width) = activation.dim();
    let mut cam = Array2::<f32>::zeros((height, width));
    for (channel, &weight) in activation.axis_iter(Axis(0)).zip(weights.iter()) {
        cam.scaled_add(weight, &channel);
    }
    cam.mapv_inplace(|v| v.max(0.0));
    cam
}

/// Bilinear resize with half-pixel centers (corners not aligned).
///
/// Source coordinates below zero clamp to the first row/column, and the last
/// row/column is replicated past the far edge.
pub fn upsample_bilinear(src: ArrayView2<'_, f32>, dst_h: usize, dst_w: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    let mut dst = Array2::<f32>::zeros((dst_h, dst_w));
    if src_h == 0 || src_w == 0 {
        return dst;
    }

    let scale_y = src_h as f64 / dst_h as f64;
    let scale_x = src_w as f64 / dst_w as f64;

    for dst_y in 0..dst_h {
        let src_yf = ((dst_y as f64 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (src_yf.floor() as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_yf - y0 as f64).clamp(0.0, 1.0) as f32;

        for dst_x in 0..dst_w {
            let src_xf = ((dst_x as f64 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (src_xf.floor() as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_xf - x0 as f64).clamp(0.0, 1.0) as f32;

            let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
            let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
            dst[[dst_y, dst_x]] = top * (1.0 - fy) + bottom * fy;
        }
    }

    dst
}

/// `(v - min) / (max - min + epsilon)`; a flat map normalizes to all zeros.
pub fn normalize(map: &Array2<f32>, epsilon: f32) -> Array2<f32> {
    if map.is_empty() {
        return map.clone();
    }
    let min = map.fold(f32::INFINITY, |acc, &v| acc.min(v));
    let max = map.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let range = max - min + epsilon;
    map.mapv(|v| ((v - min) / range).clamp(0.0, 1.0))
}
