//! Common helpers shared across the P2PNet crates.

/// Counting settings (model paths, geometry, decoding, telemetry, GPU).
pub mod config;
/// GPU context bootstrap and the preprocessing shader.
pub mod gpu;
/// Image loading, resizing, padding and tensor conversion.
pub mod image_utils;
/// Scoped timing logs for pipeline stages.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use gpu::{GpuAvailability, GpuContext, GpuContextOptions, GpuInitError};
pub use image_utils::{load_image, pad_rgb, resize_image, rgb_to_normalized_chw};
pub use telemetry::{TimingGuard, configure as configure_telemetry, timing_guard};

/// Initialize logging once.
///
/// `RUST_LOG` takes precedence; otherwise `default_filter` is used. Calling this more than once
/// is harmless.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
