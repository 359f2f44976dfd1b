//! Shared configuration types consumed across the P2PNet workspace.
//!
//! These structures describe the model artifacts, the preprocessing geometry, the anchor layout
//! and the decoding policy. They serialize to a single JSON document so the CLI (and any other
//! front end) can persist and reload a full counting setup.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Default location of the P2PNet ONNX graph.
pub const DEFAULT_MODEL_PATH: &str = "models/p2pnet.onnx";

/// Locations of the model artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelSettings {
    /// Path to the ONNX graph (topology, and weights unless stored externally).
    pub graph_path: String,
    /// Optional external weights blob. Must live next to the graph.
    pub weights_path: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            graph_path: DEFAULT_MODEL_PATH.to_string(),
            weights_path: None,
        }
    }
}

/// Resampling preference used when resizing the input image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeQuality {
    /// Bilinear resampling (Triangle filter), matching the reference pipeline.
    #[default]
    Quality,
    /// Nearest-neighbour resampling for throughput.
    Speed,
}

impl fmt::Display for ResizeQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResizeQuality::Quality => "quality",
            ResizeQuality::Speed => "speed",
        })
    }
}

impl FromStr for ResizeQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(ResizeQuality::Quality),
            "speed" => Ok(ResizeQuality::Speed),
            other => Err(format!(
                "invalid resize quality '{other}'; expected 'quality' or 'speed'"
            )),
        }
    }
}

/// Input geometry and normalization applied before inference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputSettings {
    /// Length the longer image side is resized to.
    pub target_size: u32,
    /// Both padded sides are multiples of this value.
    pub alignment: u32,
    /// Per-channel mean subtracted from every RGB pixel.
    pub mean: [f32; 3],
    /// Per-channel multiplier applied after mean subtraction.
    pub norm: [f32; 3],
    /// Resampling preference.
    pub resize_quality: ResizeQuality,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            target_size: 640,
            alignment: 32,
            mean: [123.675, 116.28, 103.53],
            norm: [0.017_124_75, 0.0175, 0.017_429_19],
            resize_quality: ResizeQuality::Quality,
        }
    }
}

/// Anchor grid layout. Must match the layout the network was exported with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnchorSettings {
    /// Pyramid levels `p`; each level has stride `2^p`.
    pub pyramid_levels: Vec<u32>,
    /// Anchor rows per stride cell.
    pub row: u32,
    /// Anchor columns per stride cell.
    pub line: u32,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            pyramid_levels: vec![3],
            row: 2,
            line: 2,
        }
    }
}

/// How decoded coordinates are converted to whole pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateRounding {
    /// Truncate toward zero. A mapped coordinate that lands just below an integer in `f32`
    /// loses a pixel, so results can sit up to 1px low of the exact value.
    #[default]
    Truncate,
    /// Round to the nearest pixel.
    Round,
}

impl FromStr for CoordinateRounding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" | "trunc" => Ok(CoordinateRounding::Truncate),
            "round" | "nearest" => Ok(CoordinateRounding::Round),
            other => Err(format!(
                "invalid coordinate rounding '{other}'; expected 'truncate' or 'round'"
            )),
        }
    }
}

/// Interpretation of the score tensor produced by the network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreActivation {
    /// Scores are already class probabilities.
    #[default]
    Probabilities,
    /// Scores are raw logits; softmax is applied per row before thresholding.
    Softmax,
}

/// Decoding parameters for raw network output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    /// A point is kept when its foreground score is strictly greater than this.
    pub score_threshold: f32,
    /// Pixel conversion policy for decoded coordinates.
    pub rounding: CoordinateRounding,
    /// Score tensor interpretation.
    pub score_activation: ScoreActivation,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            rounding: CoordinateRounding::Truncate,
            score_activation: ScoreActivation::Probabilities,
        }
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether telemetry timing logs are enabled.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }
}

/// GPU runtime preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Whether a GPU context should be created at all.
    pub enabled: bool,
    /// Respect `WGPU_*` environment overrides when initializing the backend.
    pub respect_env: bool,
    /// Run resize, padding and normalization on the GPU when a context exists.
    pub preprocessing: bool,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            preprocessing: true,
        }
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

/// Persistent settings for a counting run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    pub model: ModelSettings,
    pub input: InputSettings,
    pub anchors: AnchorSettings,
    pub detection: DetectionSettings,
    pub telemetry: TelemetrySettings,
    pub gpu: GpuSettings,
}

impl AppSettings {
    /// Load settings from a JSON file. Missing fields fall back to defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

/// Returns the default settings path (`config/p2pnet.json` under the working directory).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/p2pnet.json"))
        .unwrap_or_else(|_| PathBuf::from("config/p2pnet.json"))
}
