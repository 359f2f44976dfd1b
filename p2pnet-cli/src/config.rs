//! Configuration loading and CLI override logic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;
use p2pnet_utils::{
    config::{AppSettings, default_settings_path},
    normalize_path,
};

use crate::args::DetectArgs;

/// Load application settings from a file or use defaults.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        let settings = AppSettings::load_from_path(&resolved)?;
        info!("Loaded settings from {}", resolved.display());
        Ok(settings)
    } else {
        let default_path = default_settings_path();
        if default_path.exists() {
            let settings = AppSettings::load_from_path(&default_path).with_context(|| {
                format!(
                    "failed to load default settings from {}",
                    default_path.display()
                )
            })?;
            info!("Loaded settings from {}", default_path.display());
            Ok(settings)
        } else {
            Ok(AppSettings::default())
        }
    }
}

/// Apply command-line arguments to override loaded or default settings.
pub fn apply_cli_overrides(settings: &mut AppSettings, args: &DetectArgs) {
    if let Some(model) = args.model.as_ref() {
        settings.model.graph_path = model.display().to_string();
    }
    if let Some(weights) = args.weights.as_ref() {
        settings.model.weights_path = Some(weights.display().to_string());
    }

    if args.gpu {
        settings.gpu.enabled = true;
        settings.gpu.preprocessing = true;
    }
    if args.no_gpu {
        settings.gpu.enabled = false;
    }

    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            settings.telemetry.level = lower.clone();
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
        }
    }

    if let Some(size) = args.target_size {
        settings.input.target_size = size;
    }
    if let Some(alignment) = args.alignment {
        settings.input.alignment = alignment;
    }
    if let Some(mode) = args.resize_quality {
        settings.input.resize_quality = mode;
    }
    if let Some(score) = args.score_threshold {
        settings.detection.score_threshold = score;
    }
    if let Some(rounding) = args.rounding {
        settings.detection.rounding = rounding;
    }
}
