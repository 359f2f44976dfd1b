//! Command-line argument definitions for p2pnet-cli.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use p2pnet_utils::config::{CoordinateRounding, ResizeQuality};

/// Count people in images with a P2PNet point-regression model.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct DetectArgs {
    /// Path to an image file or a directory containing images.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Path to the P2PNet ONNX graph (defaults to the settings file, then `models/p2pnet.onnx`).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// External weight data for the graph; must sit in the same directory.
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Optional settings JSON. Defaults to `config/p2pnet.json` when present, otherwise built-in parameters.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the length the longer image side is resized to.
    #[arg(long)]
    pub target_size: Option<u32>,

    /// Override the padding alignment of the network input.
    #[arg(long)]
    pub alignment: Option<u32>,

    /// Resize filter preference (quality or speed).
    #[arg(long, value_name = "MODE")]
    pub resize_quality: Option<ResizeQuality>,

    /// Override the foreground score threshold (points must score strictly above it).
    #[arg(long)]
    pub score_threshold: Option<f32>,

    /// Coordinate conversion (truncate or round).
    #[arg(long, value_name = "MODE")]
    pub rounding: Option<CoordinateRounding>,

    /// Force GPU preprocessing (auto-detect by default).
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "no_gpu")]
    pub gpu: bool,

    /// Disable GPU preprocessing entirely, even if supported.
    #[arg(long = "no-gpu", action = ArgAction::SetTrue)]
    pub no_gpu: bool,

    /// Write counts to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Directory to write annotated images with detected heads marked.
    #[arg(long)]
    pub annotate: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        DetectArgs::command().debug_assert();
    }

    #[test]
    fn parses_overrides() {
        let args = DetectArgs::try_parse_from([
            "p2pnet-cli",
            "--input",
            "crowd.jpg",
            "--score-threshold",
            "0.6",
            "--rounding",
            "round",
            "--resize-quality",
            "speed",
            "--no-gpu",
        ])
        .expect("valid arguments");
        assert_eq!(args.score_threshold, Some(0.6));
        assert_eq!(args.rounding, Some(CoordinateRounding::Round));
        assert_eq!(args.resize_quality, Some(ResizeQuality::Speed));
        assert!(args.no_gpu);
        assert!(args.model.is_none());
    }

    #[test]
    fn gpu_flags_conflict() {
        let result =
            DetectArgs::try_parse_from(["p2pnet-cli", "--input", "a.jpg", "--gpu", "--no-gpu"]);
        assert!(result.is_err());
    }
}
