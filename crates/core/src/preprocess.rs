//! Classifier input preparation: resize, scale to [0,1], per-channel normalize.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::config::ModelConfig;

pub const DEFAULT_INPUT_SIZE: u32 = 224;
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

/// The network input and the resized RGB image it was built from.
///
/// The resized image is the compositing source for the saliency overlay, so
/// the two are always at the same working resolution.
pub struct PreparedInput {
    pub tensor: Array4<f32>,
    pub resized: RgbImage,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE, IMAGENET_MEAN, IMAGENET_STD)
    }
}

impl Preprocessor {
    pub fn new(size: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { size, mean, std }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.input_size, config.mean, config.std)
    }

    /// Working resolution (square side) of the classifier input.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn prepare(&self, image: &RgbImage) -> PreparedInput {
        let resized = if image.dimensions() == (self.size, self.size) {
            image.clone()
        } else {
            imageops::resize(image, self.size, self.size, FilterType::Triangle)
        };
        let tensor = self.to_tensor(&resized);
        PreparedInput { tensor, resized }
    }

    /// NCHW batch of one, `(v / 255 - mean) / std` per channel.
    pub fn to_tensor(&self, image: &RgbImage) -> Array4<f32> {
        let (width, height) = image.dimensions();
        Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
            let value = image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            (value - self.mean[c]) / self.std[c]
        })
    }
}
