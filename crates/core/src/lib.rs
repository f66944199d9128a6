//! Core crate for octlens: Grad-CAM saliency for retinal OCT classification
//! and mask outline annotation.

pub mod annotation;
pub mod backend;
pub mod capture;
pub mod colormap;
pub mod config;
pub mod error;
pub mod head;
pub mod heatmap;
pub mod image_io;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod runtime;
pub mod saliency;

pub use error::{PipelineError, PipelineResult};
