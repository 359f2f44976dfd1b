use thiserror::Error;

use crate::frame::PixelFormat;

/// Failures surfaced by the counting pipeline.
///
/// Every variant means no points were produced for the frame; the pipeline never returns a
/// partial result.
#[derive(Debug, Error)]
pub enum CountError {
    /// Model artifacts were missing or could not be turned into a runnable graph.
    #[error("model initialization failed: {0:#}")]
    Initialization(anyhow::Error),

    /// The pixel buffer is not in a channel layout the pipeline accepts.
    #[error("unsupported pixel format {format:?}; expected Rgb8 or Rgba8")]
    UnsupportedFormat { format: PixelFormat },

    /// The pixel buffer length does not match `width * height * channels`.
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    /// Hardware acceleration was requested but this context has none.
    #[error("hardware acceleration requested but no accelerator is available")]
    AcceleratorUnavailable,

    /// A width, height, stride or tiling factor was zero or out of range.
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    /// An image file could not be read or decoded.
    #[error("failed to load image: {0:#}")]
    ImageLoad(anyhow::Error),

    /// The preprocessing backend failed (GPU readback, tensor construction).
    #[error("preprocessing failed: {0:#}")]
    Preprocessing(anyhow::Error),

    /// Detection was attempted before a model was loaded.
    #[error("model has not been initialized")]
    NotInitialized,

    /// The inference backend failed or produced output of the wrong shape.
    #[error("inference failed: {0:#}")]
    InferenceFailure(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CountError>;
