//! Core P2PNet crowd-counting primitives.
//!
//! This crate generates the anchor grid, preprocesses images (CPU or wgpu), runs the P2PNet
//! ONNX graph with `tract-onnx`, and decodes the predicted head points back onto the source image.

/// Anchor-point grid generation.
pub mod anchors;
/// Pipeline orchestration and the owned counting context.
pub mod detector;
/// Error taxonomy for the counting pipeline.
pub mod error;
/// Host pixel buffers.
pub mod frame;
/// Inference backend boundary and the tract ONNX implementation.
pub mod model;
/// Decoding of raw predictions into points.
pub mod postprocess;
/// Image pre-processing (resize, pad, normalize).
pub mod preprocess;

pub use anchors::{
    AnchorConfig, AnchorPoint, anchor_count, anchors_to_tensor, base_anchor_points,
    generate_anchor_points, shift,
};
pub use detector::{CrowdCounter, CrowdOutput, PipelineConfig, detect_crowd};
pub use error::{CountError, Result};
pub use frame::{PixelBuffer, PixelFormat};
pub use model::{InferenceBackend, ModelSource, P2PNetModel, RawPredictions};
pub use postprocess::{CrowdPoint, PostprocessConfig, decode_predictions};
pub use preprocess::{
    CpuPreprocessor, PreprocessConfig, PreprocessOutput, Preprocessor, ResizePlan,
    WgpuPreprocessor, plan_resize, preprocess_image,
};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
