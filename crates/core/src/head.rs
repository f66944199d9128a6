//! Classification head that sits after the designated layer.
//!
//! ConvNeXt-style: global average pool over space, layer norm over channels,
//! then a linear layer. Because the head is evaluated in-process, the gradient
//! of any class score with respect to the designated layer is exact.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LAYER_NORM_EPSILON: f32 = 1e-6;

/// Channel-wise layer norm applied to the pooled feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierHead {
    /// (classes, channels)
    weight: Array2<f32>,
    bias: Array1<f32>,
    norm: Option<LayerNorm>,
}

/// On-disk JSON layout of the head weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadWeights {
    pub weight: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub norm: Option<LayerNormWeights>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNormWeights {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub epsilon: f32,
}

fn default_layer_norm_epsilon() -> f32 {
    DEFAULT_LAYER_NORM_EPSILON
}

struct NormState {
    normalized: Array1<f32>,
    inv_std: f32,
}

impl ClassifierHead {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>, norm: Option<LayerNorm>) -> Result<Self> {
        let (classes, channels) = weight.dim();
        if classes == 0 || channels == 0 {
            bail!("classifier head must have at least one class and one channel");
        }
        if bias.len() != classes {
            bail!(
                "bias has {} entries but weight has {classes} rows",
                bias.len()
            );
        }
        if let Some(norm) = &norm {
            if norm.gamma.len() != channels || norm.beta.len() != channels {
                bail!(
                    "layer norm expects {channels} channels, got gamma={} beta={}",
                    norm.gamma.len(),
                    norm.beta.len()
                );
            }
            if !(norm.epsilon > 0.0) {
                bail!("layer norm epsilon must be positive, got {}", norm.epsilon);
            }
        }
        Ok(Self { weight, bias, norm })
    }

    pub fn from_weights(weights: HeadWeights) -> Result<Self> {
        let classes = weights.weight.len();
        let channels = weights.weight.first().map(Vec::len).unwrap_or(0);
        if weights.weight.iter().any(|row| row.len() != channels) {
            bail!("head weight rows have inconsistent lengths");
        }
        let flat: Vec<f32> = weights.weight.into_iter().flatten().collect();
        let weight = Array2::from_shape_vec((classes, channels), flat)
            .context("failed to shape head weight matrix")?;
        let norm = weights.norm.map(|norm| LayerNorm {
            gamma: Array1::from(norm.gamma),
            beta: Array1::from(norm.beta),
            epsilon: norm.epsilon,
        });
        Self::new(weight, Array1::from(weights.bias), norm)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read head weights: {}", path.display()))?;
        let weights: HeadWeights = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse head weights JSON: {}", path.display()))?;
        Self::from_weights(weights)
            .with_context(|| format!("invalid head weights: {}", path.display()))
    }

    pub fn num_classes(&self) -> usize {
        self.weight.nrows()
    }

    pub fn channels(&self) -> usize {
        self.weight.ncols()
    }

    /// Class scores for an activation of shape (channels, height, width).
    pub fn forward(&self, activation: ArrayView3<'_, f32>) -> Result<Array1<f32>> {
        let pooled = self.pool(activation)?;
        let features = match &self.norm {
            Some(norm) => {
                let state = normalize(pooled.view(), norm.epsilon);
                &state.normalized * &norm.gamma + &norm.beta
            }
            None => pooled,
        };
        Ok(self.weight.dot(&features) + &self.bias)
    }

    /// d(score[class]) / d(activation), same shape as `activation`.
    pub fn score_gradient(
        &self,
        activation: ArrayView3<'_, f32>,
        class: usize,
    ) -> Result<Array3<f32>> {
        if class >= self.num_classes() {
            bail!(
                "class {class} out of range for head with {} classes",
                self.num_classes()
            );
        }
        let pooled = self.pool(activation)?;
        let row = self.weight.row(class);

        let grad_pooled = match &self.norm {
            Some(norm) => {
                let state = normalize(pooled.view(), norm.epsilon);
                let upstream = &row * &norm.gamma;
                let mean_upstream = upstream.mean().unwrap_or(0.0);
                let mean_projected = (&upstream * &state.normalized).mean().unwrap_or(0.0);
                (&upstream - mean_upstream - &state.normalized * mean_projected) * state.inv_std
            }
            None => row.to_owned(),
        };

        let (_, height, width) = activation.dim();
        let spatial = (height * width) as f32;
        let per_cell = grad_pooled / spatial;
        Ok(Array3::from_shape_fn(activation.raw_dim(), |(c, _, _)| {
            per_cell[c]
        }))
    }

    fn pool(&self, activation: ArrayView3<'_, f32>) -> Result<Array1<f32>> {
        let (channels, height, width) = activation.dim();
        if channels != self.channels() {
            bail!(
                "activation has {channels} channels but the head expects {}",
                self.channels()
            );
        }
        if height == 0 || width == 0 {
            bail!("activation has an empty spatial extent ({height}x{width})");
        }
        let flat = activation
            .to_shape((channels, height * width))
            .context("failed to flatten activation")?;
        flat.mean_axis(Axis(1))
            .context("failed to pool activation")
    }
}

fn normalize(values: ArrayView1<'_, f32>, epsilon: f32) -> NormState {
    let mean = values.mean().unwrap_or(0.0);
    let centered = values.mapv(|v| v - mean);
    let variance = centered.mapv(|v| v * v).mean().unwrap_or(0.0);
    let inv_std = 1.0 / (variance + epsilon).sqrt();
    NormState {
        normalized: centered * inv_std,
        inv_std,
    }
}
