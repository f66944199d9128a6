//! Jet color lookup for 8-bit intensity maps.

use image::{GrayImage, Rgb, RgbImage};

/// Jet color for an 8-bit intensity: dark blue at 0, through cyan, yellow and
/// orange, to dark red at 255. Channels are in RGB order.
pub fn jet(value: u8) -> Rgb<u8> {
    let x = value as f32 / 255.0;
    let channel = |center: f32| {
        let v = (1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

pub fn apply_jet(intensity: &GrayImage) -> RgbImage {
    let (width, height) = intensity.dimensions();
    RgbImage::from_fn(width, height, |x, y| jet(intensity.get_pixel(x, y)[0]))
}
