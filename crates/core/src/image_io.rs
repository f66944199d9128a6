//! Image decode/encode plumbing with the not-found / decode / write split.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageError, ImageFormat, ImageReader, RgbImage};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// Decode any supported image file, sniffing the format from its contents.
pub fn read_image(path: &Path, role: &'static str) -> PipelineResult<DynamicImage> {
    if !path.is_file() {
        return Err(PipelineError::InputNotFound {
            role,
            path: path.to_path_buf(),
        });
    }

    let decode_err = |source: ImageError| PipelineError::Decode {
        role,
        path: path.to_path_buf(),
        source,
    };
    let image = ImageReader::open(path)
        .map_err(|e| decode_err(ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| decode_err(ImageError::IoError(e)))?
        .decode()
        .map_err(decode_err)?;

    debug!(
        role,
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "Decoded image"
    );
    Ok(image)
}

pub fn read_rgb(path: &Path, role: &'static str) -> PipelineResult<RgbImage> {
    read_image(path, role).map(|image| image.to_rgb8())
}

pub fn read_luma(path: &Path, role: &'static str) -> PipelineResult<GrayImage> {
    read_image(path, role).map(|image| image.to_luma8())
}

/// Encode `image` in the format implied by the extension of `path`.
pub fn encode_for_path(image: &RgbImage, path: &Path) -> PipelineResult<Vec<u8>> {
    let format = ImageFormat::from_path(path).map_err(|_| PipelineError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;

    let mut buffer = Cursor::new(Vec::new());
    match image.write_to(&mut buffer, format) {
        Ok(()) => Ok(buffer.into_inner()),
        Err(ImageError::Unsupported(_)) => Err(PipelineError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
        Err(other) => Err(PipelineError::Encode(other)),
    }
}

/// Encode and write `image` to `path` without leaving a partial file behind.
///
/// The bytes go to a hidden sibling file first, which is then renamed over
/// the destination.
pub fn write_image_atomic(image: &RgbImage, path: &Path) -> PipelineResult<()> {
    let bytes = encode_for_path(image, path)?;
    let staging = staging_path(path);

    let write_err = |source: std::io::Error| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    };

    fs::write(&staging, &bytes).map_err(|e| {
        let _ = fs::remove_file(&staging);
        write_err(e)
    })?;
    fs::rename(&staging, path).map_err(|e| {
        let _ = fs::remove_file(&staging);
        write_err(e)
    })?;

    debug!(path = %path.display(), bytes = bytes.len(), "Wrote image");
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_rgb(&dir.path().join("scan.png"), "scan").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn directory_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_luma(dir.path(), "mask").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.png");
        fs::write(&path, b"definitely not an image").unwrap();

        let err = read_rgb(&path, "scan").unwrap_err();
        assert!(matches!(err, PipelineError::Decode { role: "scan", .. }));
    }

    #[test]
    fn format_is_sniffed_from_contents() {
        let dir = tempdir().unwrap();
        let png_named_jpg = dir.path().join("mask.jpg");
        let mask = GrayImage::from_pixel(3, 2, Luma([200]));
        mask.save_with_format(&png_named_jpg, ImageFormat::Png).unwrap();

        let decoded = read_luma(&png_named_jpg, "mask").unwrap();
        assert_eq!(decoded, mask);
    }

    #[test]
    fn atomic_write_roundtrips_png_and_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.png");
        let image = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));

        write_image_atomic(&image, &path).unwrap();

        assert_eq!(read_rgb(&path, "output").unwrap(), image);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn unknown_extension_is_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.notanimage");
        let image = RgbImage::new(2, 2);

        let err = write_image_atomic(&image, &path).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn missing_parent_directory_is_a_write_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent").join("out.png");
        let image = RgbImage::new(2, 2);

        let err = write_image_atomic(&image, &path).unwrap_err();
        assert!(matches!(err, PipelineError::Write { .. }));
        assert!(!path.exists());
    }
}
