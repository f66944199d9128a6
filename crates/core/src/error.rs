//! Failure taxonomy shared by the saliency and annotation pipelines.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The path does not resolve to a readable file.
    #[error("{role} not found: {}", path.display())]
    InputNotFound { role: &'static str, path: PathBuf },

    /// The file exists but is not a decodable image.
    #[error("could not read {role} image {}: {source}", path.display())]
    Decode {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("unsupported output format for {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("target class {index} is out of range for {num_classes} classes")]
    ClassOutOfRange { index: usize, num_classes: usize },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("model error: {0:#}")]
    Model(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn shape_mismatch(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Whether the failure means the input file was missing rather than unreadable.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InputNotFound { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_role_and_path() {
        let err = PipelineError::InputNotFound {
            role: "mask",
            path: PathBuf::from("/scans/mask.png"),
        };
        assert_eq!(err.to_string(), "mask not found: /scans/mask.png");
        assert!(err.is_not_found());
    }

    #[test]
    fn class_out_of_range_is_not_a_not_found_error() {
        let err = PipelineError::ClassOutOfRange {
            index: 9,
            num_classes: 8,
        };
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("9"));
    }

    #[test]
    fn shape_mismatch_lists_both_shapes() {
        let err = PipelineError::shape_mismatch("gradient", &[4, 7, 7], &[4, 7, 6]);
        assert_eq!(
            err.to_string(),
            "shape mismatch in gradient: expected [4, 7, 7], got [4, 7, 6]"
        );
    }
}
