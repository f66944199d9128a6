//! Region-of-interest annotation: outline a binary mask's outer boundary on a scan.

use std::fs;
use std::path::Path;

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::drawing::draw_filled_circle_mut;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::AnnotationConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::image_io::{read_luma, read_rgb, write_image_atomic};

pub const OUTLINE_WIDTH: u32 = 2;
pub const OUTLINE_COLOR: [u8; 3] = [255, 0, 0];
/// Mask values strictly above this become foreground.
pub const MASK_THRESHOLD: u8 = 1;

/// How outline pixels combine with the scan.
///
/// A unit-weight OpenCV `addWeighted` adds the outline with saturation, which
/// leaves a red outline invisible on white scans and tints gray ones (gray 100
/// becomes (255, 100, 100)). Overwrite is the default so the outline is always
/// pure red. `Additive` reproduces the saturating sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlineBlend {
    /// Outline pixels replace the scan pixel.
    #[default]
    Overwrite,
    /// Outline color is added to the scan pixel, saturating at 255.
    Additive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationOverlayCompositor {
    outline_width: u32,
    outline_color: Rgb<u8>,
    blend: OutlineBlend,
}

impl Default for AnnotationOverlayCompositor {
    fn default() -> Self {
        Self::from_config(&AnnotationConfig::default())
    }
}

impl AnnotationOverlayCompositor {
    pub fn from_config(config: &AnnotationConfig) -> Self {
        Self {
            outline_width: config.outline_width,
            outline_color: Rgb(config.outline_color),
            blend: config.outline_blend,
        }
    }

    /// Outline the outer boundary of `mask` on a copy of `scan`.
    ///
    /// The output always has the scan's dimensions; a mask of another size is
    /// resized nearest-neighbor first.
    pub fn compose(&self, scan: &RgbImage, mask: &GrayImage) -> RgbImage {
        let (width, height) = scan.dimensions();
        let mask = if mask.dimensions() == (width, height) {
            mask.clone()
        } else {
            debug!(
                from = ?mask.dimensions(),
                to = ?(width, height),
                "Resizing mask to scan resolution"
            );
            resize_mask_nearest(mask, width, height)
        };

        let binary = threshold_binary(&mask, MASK_THRESHOLD);
        let contours = external_contours(&binary);
        let outline = self.draw_outline(&contours, width, height);

        let mut result = masked_copy(scan, &binary);
        self.blend_outline(&mut result, &outline);

        debug!(
            contours = contours.len(),
            outline_pixels = outline.pixels().filter(|p| p[0] != 0).count(),
            "Composed annotation overlay"
        );
        result
    }

    /// Coverage canvas (255 on the outline) the size of the scan.
    pub fn draw_outline(&self, contours: &[Contour<i32>], width: u32, height: u32) -> GrayImage {
        let mut canvas = GrayImage::new(width, height);
        if self.outline_width == 0 {
            return canvas;
        }
        let radius = (self.outline_width / 2) as i32;
        for contour in contours {
            for point in &contour.points {
                draw_filled_circle_mut(&mut canvas, (point.x, point.y), radius, Luma([255]));
            }
        }
        canvas
    }

    fn blend_outline(&self, image: &mut RgbImage, outline: &GrayImage) {
        let color = self.outline_color;
        for (pixel, coverage) in image.pixels_mut().zip(outline.pixels()) {
            if coverage[0] == 0 {
                continue;
            }
            match self.blend {
                OutlineBlend::Overwrite => *pixel = color,
                OutlineBlend::Additive => {
                    for c in 0..3 {
                        pixel[c] = pixel[c].saturating_add(color[c]);
                    }
                }
            }
        }
    }
}

/// Nearest-neighbor resize picking source pixel `floor(dst * src / dst_len)`,
/// the same pixel OpenCV's `INTER_NEAREST` picks.
pub fn resize_mask_nearest(src: &GrayImage, dst_w: u32, dst_h: u32) -> GrayImage {
    let (src_w, src_h) = src.dimensions();
    if src_w == 0 || src_h == 0 {
        return GrayImage::new(dst_w, dst_h);
    }

    GrayImage::from_fn(dst_w, dst_h, |dst_x, dst_y| {
        let src_y = (dst_y as f64 * src_h as f64 / dst_h as f64) as u32;
        let src_x = (dst_x as f64 * src_w as f64 / dst_w as f64) as u32;
        *src.get_pixel(src_x.min(src_w - 1), src_y.min(src_h - 1))
    })
}

/// `255` where the value exceeds `threshold`, `0` elsewhere.
pub fn threshold_binary(mask: &GrayImage, threshold: u8) -> GrayImage {
    let (width, height) = mask.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        if mask.get_pixel(x, y)[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Outer borders of top-level regions; holes and nested regions are skipped.
pub fn external_contours(binary: &GrayImage) -> Vec<Contour<i32>> {
    find_contours::<i32>(binary)
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer && contour.parent.is_none())
        .collect()
}

/// Scan pixels under the mask are AND-ed with themselves; the rest are copied.
fn masked_copy(scan: &RgbImage, binary: &GrayImage) -> RgbImage {
    let mut result = scan.clone();
    for (x, y, pixel) in result.enumerate_pixels_mut() {
        if binary.get_pixel(x, y)[0] != 0 {
            let source = scan.get_pixel(x, y);
            for c in 0..3 {
                pixel[c] = source[c] & source[c];
            }
        }
    }
    result
}

/// Read, compose, and atomically write one annotation.
pub fn run_annotation(
    compositor: &AnnotationOverlayCompositor,
    scan_path: &Path,
    mask_path: &Path,
    output_path: &Path,
) -> PipelineResult<()> {
    info!(
        scan = %scan_path.display(),
        mask = %mask_path.display(),
        output = %output_path.display(),
        "Processing annotation"
    );

    let scan = read_rgb(scan_path, "scan")?;
    let mask = read_luma(mask_path, "mask")?;
    let result = compositor.compose(&scan, &mask);

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PipelineError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    write_image_atomic(&result, output_path)?;

    info!(output = %output_path.display(), "Annotation saved");
    Ok(())
}

/// Exit-code wrapper around [`run_annotation`]: `0` on success, `1` on any failure.
pub fn process_annotation(
    compositor: &AnnotationOverlayCompositor,
    scan_path: &Path,
    mask_path: &Path,
    output_path: &Path,
) -> i32 {
    match run_annotation(compositor, scan_path, mask_path, output_path) {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "Annotation failed");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, lo: u32, hi: u32, value: u8) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (lo..hi).contains(&x) && (lo..hi).contains(&y) {
                Luma([value])
            } else {
                Luma([0])
            }
        })
    }

    fn noisy_scan(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn empty_mask_leaves_scan_untouched() {
        let scan = noisy_scan(40, 30);
        let out = AnnotationOverlayCompositor::default().compose(&scan, &GrayImage::new(40, 30));
        assert_eq!(out, scan);
    }

    #[test]
    fn full_mask_outlines_only_the_frame() {
        let scan = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let out = AnnotationOverlayCompositor::default()
            .compose(&scan, &GrayImage::from_pixel(20, 20, Luma([255])));

        for x in 0..20 {
            assert_eq!(*out.get_pixel(x, 0), Rgb(OUTLINE_COLOR));
            assert_eq!(*out.get_pixel(x, 19), Rgb(OUTLINE_COLOR));
            assert_eq!(*out.get_pixel(0, x), Rgb(OUTLINE_COLOR));
            assert_eq!(*out.get_pixel(19, x), Rgb(OUTLINE_COLOR));
        }
        assert_eq!(*out.get_pixel(10, 10), Rgb([255, 255, 255]));
    }

    #[test]
    fn pixels_away_from_the_outline_are_unchanged() {
        let scan = noisy_scan(32, 32);
        let out = AnnotationOverlayCompositor::default().compose(&scan, &square_mask(32, 10, 20, 255));

        assert_eq!(*out.get_pixel(10, 10), Rgb(OUTLINE_COLOR));
        assert_eq!(out.get_pixel(15, 15), scan.get_pixel(15, 15));
        assert_eq!(out.get_pixel(2, 2), scan.get_pixel(2, 2));
        assert_eq!(out.get_pixel(28, 5), scan.get_pixel(28, 5));
    }

    #[test]
    fn additive_blend_saturates() {
        let compositor = AnnotationOverlayCompositor::from_config(&AnnotationConfig {
            outline_blend: OutlineBlend::Additive,
            ..AnnotationConfig::default()
        });
        let scan = RgbImage::from_pixel(10, 10, Rgb([200, 40, 40]));
        let out = compositor.compose(&scan, &square_mask(10, 3, 7, 255));
        assert_eq!(*out.get_pixel(3, 3), Rgb([255, 40, 40]));
    }

    #[test]
    fn additive_blend_tints_gray_scan() {
        let additive = AnnotationOverlayCompositor::from_config(&AnnotationConfig {
            outline_blend: OutlineBlend::Additive,
            ..AnnotationConfig::default()
        });
        let scan = RgbImage::from_pixel(12, 12, Rgb([100, 100, 100]));
        let mask = square_mask(12, 3, 9, 255);

        assert_eq!(*additive.compose(&scan, &mask).get_pixel(3, 3), Rgb([255, 100, 100]));
        assert_eq!(
            *AnnotationOverlayCompositor::default().compose(&scan, &mask).get_pixel(3, 3),
            Rgb([255, 0, 0])
        );
        assert_eq!(*additive.compose(&scan, &mask).get_pixel(6, 6), Rgb([100, 100, 100]));
    }

    #[test]
    fn zero_width_draws_no_outline() {
        let compositor = AnnotationOverlayCompositor::from_config(&AnnotationConfig {
            outline_width: 0,
            ..AnnotationConfig::default()
        });
        let scan = noisy_scan(16, 16);
        assert_eq!(compositor.compose(&scan, &square_mask(16, 4, 12, 255)), scan);
    }

    #[test]
    fn threshold_is_strictly_above_one() {
        let mask = GrayImage::from_raw(4, 1, vec![0, 1, 2, 200]).unwrap();
        let binary = threshold_binary(&mask, MASK_THRESHOLD);
        assert_eq!(binary.into_raw(), vec![0, 0, 255, 255]);
    }

    #[test]
    fn resized_mask_matches_target_and_stays_binary_after_threshold() {
        let mask = GrayImage::from_fn(7, 5, |x, y| Luma([((x * 37 + y * 11) % 256) as u8]));
        let resized = resize_mask_nearest(&mask, 23, 19);
        assert_eq!(resized.dimensions(), (23, 19));

        let binary = threshold_binary(&resized, MASK_THRESHOLD);
        assert!(binary.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn nearest_resize_doubles_each_pixel() {
        let mask = GrayImage::from_raw(2, 1, vec![10, 20]).unwrap();
        let resized = resize_mask_nearest(&mask, 4, 2);
        assert_eq!(resized.into_raw(), vec![10, 10, 20, 20, 10, 10, 20, 20]);
    }

    #[test]
    fn nearest_downsample_keeps_leading_pixels() {
        let mask = GrayImage::from_raw(4, 1, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(resize_mask_nearest(&mask, 2, 1).into_raw(), vec![1, 3]);

        let mask = GrayImage::from_raw(1, 6, vec![5, 6, 7, 8, 9, 10]).unwrap();
        assert_eq!(resize_mask_nearest(&mask, 1, 3).into_raw(), vec![5, 7, 9]);
    }

    #[test]
    fn holes_do_not_produce_contours() {
        let mut ring = square_mask(30, 5, 25, 255);
        for y in 12..18 {
            for x in 12..18 {
                ring.put_pixel(x, y, Luma([0]));
            }
        }
        let contours = external_contours(&ring);
        assert_eq!(contours.len(), 1);
        assert!(contours[0]
            .points
            .iter()
            .all(|p| p.x == 5 || p.x == 24 || p.y == 5 || p.y == 24));
    }

    #[test]
    fn separate_regions_each_get_an_outline() {
        let mut mask = square_mask(40, 2, 10, 255);
        for y in 25..35 {
            for x in 25..35 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        assert_eq!(external_contours(&mask).len(), 2);
    }
}
