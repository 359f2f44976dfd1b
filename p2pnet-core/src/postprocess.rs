use anyhow::Result;
use p2pnet_utils::config::{CoordinateRounding, DetectionSettings, ScoreActivation};
use tract_onnx::prelude::{
    Tensor,
    tract_ndarray::{ArrayView2, Axis, Ix2},
};

use crate::model::RawPredictions;
use crate::preprocess::ResizePlan;

/// Column of the score tensor holding the foreground (head) class.
const FOREGROUND_CLASS: usize = 1;

/// Decoding parameters applied to raw network output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessConfig {
    /// A point is kept only when its foreground score is strictly greater than this.
    pub score_threshold: f32,
    /// Conversion of mapped coordinates to whole pixels.
    pub rounding: CoordinateRounding,
    /// Whether scores are probabilities or logits.
    pub score_activation: ScoreActivation,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        DetectionSettings::default().into()
    }
}

impl From<DetectionSettings> for PostprocessConfig {
    fn from(settings: DetectionSettings) -> Self {
        Self {
            score_threshold: settings.score_threshold,
            rounding: settings.rounding,
            score_activation: settings.score_activation,
        }
    }
}

impl From<&DetectionSettings> for PostprocessConfig {
    fn from(settings: &DetectionSettings) -> Self {
        (*settings).into()
    }
}

/// One detected head, in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdPoint {
    pub x: f32,
    pub y: f32,
    /// Foreground probability, always above the configured threshold.
    pub prob: f32,
}

/// Turn raw predictions into source-image points.
///
/// Rows are visited in anchor order so the output order is deterministic. Coordinates are
/// un-padded and un-scaled through `plan`, then rounded per `config.rounding`; they are not
/// clamped to the image bounds. A confident row with a non-finite point fails the whole call.
pub fn decode_predictions(
    raw: &RawPredictions,
    plan: &ResizePlan,
    config: &PostprocessConfig,
) -> Result<Vec<CrowdPoint>> {
    let scores = rows_view(&raw.scores, "scores")?;
    let points = rows_view(&raw.points, "points")?;

    anyhow::ensure!(
        scores.ncols() > FOREGROUND_CLASS,
        "scores need at least {} columns, got {}",
        FOREGROUND_CLASS + 1,
        scores.ncols()
    );
    anyhow::ensure!(
        points.ncols() == 2,
        "points must have 2 columns, got {}",
        points.ncols()
    );
    anyhow::ensure!(
        scores.nrows() == points.nrows(),
        "scores have {} rows but points have {}",
        scores.nrows(),
        points.nrows()
    );

    let mut out = Vec::new();
    for (score_row, point_row) in scores.outer_iter().zip(points.outer_iter()) {
        let prob = match config.score_activation {
            ScoreActivation::Probabilities => score_row[FOREGROUND_CLASS],
            ScoreActivation::Softmax => softmax_at(score_row.iter().copied(), FOREGROUND_CLASS),
        };
        if !prob.is_finite() || prob <= config.score_threshold {
            continue;
        }

        let (px, py) = (point_row[0], point_row[1]);
        anyhow::ensure!(
            px.is_finite() && py.is_finite(),
            "confident prediction (score {prob}) has non-finite point ({px}, {py})"
        );

        let (x, y) = plan.to_original(px, py);
        out.push(CrowdPoint {
            x: round_coord(x, config.rounding),
            y: round_coord(y, config.rounding),
            prob,
        });
    }

    Ok(out)
}

/// Number of rows in a `[N, C]` or `[1, N, C]` tensor.
pub fn prediction_rows(tensor: &Tensor) -> Result<usize> {
    Ok(rows_view(tensor, "prediction")?.nrows())
}

fn rows_view<'a>(tensor: &'a Tensor, name: &str) -> Result<ArrayView2<'a, f32>> {
    let view = tensor
        .to_array_view::<f32>()
        .map_err(|e| anyhow::anyhow!("{name} output not f32: {e}"))?;
    let view = match view.ndim() {
        2 => view,
        3 if view.shape()[0] == 1 => view.index_axis_move(Axis(0), 0),
        _ => anyhow::bail!(
            "{name} output must be [N, C] or [1, N, C], got {:?}",
            tensor.shape()
        ),
    };
    view.into_dimensionality::<Ix2>()
        .map_err(|e| anyhow::anyhow!("{name} output has unexpected layout: {e}"))
}

fn softmax_at(logits: impl Iterator<Item = f32> + Clone, index: usize) -> f32 {
    let max = logits.clone().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    let mut target = 0.0f32;
    for (i, value) in logits.enumerate() {
        let e = (value - max).exp();
        sum += e;
        if i == index {
            target = e;
        }
    }
    target / sum
}

fn round_coord(value: f32, rounding: CoordinateRounding) -> f32 {
    match rounding {
        CoordinateRounding::Truncate => value.trunc(),
        CoordinateRounding::Round => value.round(),
    }
}
