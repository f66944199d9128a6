//! Saliency overlay compositing: jet heatmap blended over the source image.

use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array2, Array3};
use tracing::debug;

use crate::colormap::apply_jet;
use crate::config::SaliencyConfig;
use crate::error::{PipelineError, PipelineResult};

pub const HEATMAP_WEIGHT: f32 = 0.6;
pub const SOURCE_WEIGHT: f32 = 0.4;
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapCompositor {
    heatmap_weight: f32,
    source_weight: f32,
    jpeg_quality: u8,
}

impl Default for HeatmapCompositor {
    fn default() -> Self {
        Self {
            heatmap_weight: HEATMAP_WEIGHT,
            source_weight: SOURCE_WEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl HeatmapCompositor {
    pub fn from_config(config: &SaliencyConfig) -> Self {
        Self {
            heatmap_weight: config.heatmap_weight,
            source_weight: config.source_weight,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Color-mapped heatmap of a normalized saliency map.
    pub fn heatmap(cam: &Array2<f32>) -> RgbImage {
        let (height, width) = cam.dim();
        let intensity = GrayImage::from_fn(width as u32, height as u32, |x, y| {
            Luma([to_u8(cam[[y as usize, x as usize]])])
        });
        apply_jet(&intensity)
    }

    /// Blended overlay as (height, width, 3) floats, every value in [0, 1].
    pub fn blend(&self, cam: &Array2<f32>, source: &RgbImage) -> PipelineResult<Array3<f32>> {
        let (width, height) = source.dimensions();
        let expected = [height as usize, width as usize];
        if cam.shape() != expected {
            return Err(PipelineError::shape_mismatch(
                "saliency map vs source image",
                &expected,
                cam.shape(),
            ));
        }

        let heatmap = Self::heatmap(cam);
        Ok(Array3::from_shape_fn(
            (height as usize, width as usize, 3),
            |(y, x, c)| {
                let heat = heatmap.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
                let src = source.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
                (self.heatmap_weight * heat + self.source_weight * src).clamp(0.0, 1.0)
            },
        ))
    }

    /// Overlay image at the source's resolution.
    pub fn composite(&self, cam: &Array2<f32>, source: &RgbImage) -> PipelineResult<RgbImage> {
        let blended = self.blend(cam, source)?;
        let (width, height) = source.dimensions();
        Ok(RgbImage::from_fn(width, height, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([
                to_u8(blended[[y, x, 0]]),
                to_u8(blended[[y, x, 1]]),
                to_u8(blended[[y, x, 2]]),
            ])
        }))
    }

    pub fn encode_jpeg(&self, image: &RgbImage) -> PipelineResult<Vec<u8>> {
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality).encode_image(image)?;
        Ok(bytes)
    }

    /// Composite, encode as JPEG, and base64 the payload for transport.
    pub fn composite_base64(&self, cam: &Array2<f32>, source: &RgbImage) -> PipelineResult<String> {
        let overlay = self.composite(cam, source)?;
        let jpeg = self.encode_jpeg(&overlay)?;
        debug!(
            width = overlay.width(),
            height = overlay.height(),
            jpeg_bytes = jpeg.len(),
            "Encoded saliency overlay"
        );
        Ok(general_purpose::STANDARD.encode(jpeg))
    }
}

/// Scale a [0, 1] value to 8 bits, truncating.
fn to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colormap::jet;

    fn gradient_cam(height: usize, width: usize) -> Array2<f32> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            (y * width + x) as f32 / (height * width - 1) as f32
        })
    }

    #[test]
    fn composite_matches_source_dimensions() {
        let source = RgbImage::from_pixel(12, 8, Rgb([40, 80, 120]));
        let overlay = HeatmapCompositor::default()
            .composite(&gradient_cam(8, 12), &source)
            .unwrap();
        assert_eq!(overlay.dimensions(), (12, 8));
    }

    #[test]
    fn blended_values_stay_in_unit_range() {
        let source = RgbImage::from_pixel(6, 6, Rgb([255, 255, 255]));
        let compositor = HeatmapCompositor::from_config(&SaliencyConfig {
            heatmap_weight: 0.9,
            source_weight: 0.9,
            ..SaliencyConfig::default()
        });
        let blended = compositor.blend(&gradient_cam(6, 6), &source).unwrap();
        assert!(blended.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(blended.iter().any(|&v| v == 1.0));
    }

    #[test]
    fn blend_uses_sixty_forty_weights() {
        let source = RgbImage::from_pixel(1, 1, Rgb([255, 0, 100]));
        let cam = Array2::zeros((1, 1));
        let blended = HeatmapCompositor::default().blend(&cam, &source).unwrap();

        let heat = jet(0);
        for c in 0..3 {
            let expected = 0.6 * heat[c] as f32 / 255.0 + 0.4 * source.get_pixel(0, 0)[c] as f32 / 255.0;
            assert!((blended[[0, 0, c]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn mismatched_cam_is_rejected() {
        let source = RgbImage::new(4, 4);
        let err = HeatmapCompositor::default()
            .composite(&Array2::zeros((4, 5)), &source)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn base64_payload_decodes_to_jpeg_of_source_size() {
        let source = RgbImage::from_pixel(16, 10, Rgb([10, 200, 30]));
        let encoded = HeatmapCompositor::default()
            .composite_base64(&gradient_cam(10, 16), &source)
            .unwrap();

        let bytes = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 10));
    }

    #[test]
    fn heatmap_truncates_scaled_values() {
        let cam = Array2::from_elem((1, 1), 0.999f32);
        assert_eq!(*HeatmapCompositor::heatmap(&cam).get_pixel(0, 0), jet(254));
    }
}
