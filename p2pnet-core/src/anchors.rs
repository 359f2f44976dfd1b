//! Anchor-point grid generation.
//!
//! P2PNet predicts one point per anchor. Anchors are laid out on a regular grid per pyramid
//! level: every `stride x stride` cell of the padded input holds `row * line` evenly spaced
//! anchors centered on the cell. Row `i` of the network output corresponds to anchor `i` of the
//! sequence produced here, so the ordering below is part of the model contract:
//! anchors within a cell are row-major (`line` fastest), cells are row-major across the feature
//! map, and levels follow the order they are listed in.

use tract_onnx::prelude::Tensor;

use crate::error::{CountError, Result};

/// A single anchor in padded-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorPoint {
    pub x: f32,
    pub y: f32,
}

impl AnchorPoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Anchor layout shared by every image processed with a given model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorConfig {
    /// Pyramid levels `p`; level `p` uses stride `2^p`.
    pub pyramid_levels: Vec<u32>,
    /// Anchors per cell along the vertical axis.
    pub row: u32,
    /// Anchors per cell along the horizontal axis.
    pub line: u32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            pyramid_levels: vec![3],
            row: 2,
            line: 2,
        }
    }
}

impl AnchorConfig {
    /// Generate the anchor sequence for a padded input of `img_w x img_h`.
    pub fn generate(&self, img_w: u32, img_h: u32) -> Result<Vec<AnchorPoint>> {
        generate_anchor_points(img_w, img_h, &self.pyramid_levels, self.row, self.line)
    }

    /// Number of anchors [`AnchorConfig::generate`] yields for `img_w x img_h`.
    pub fn count(&self, img_w: u32, img_h: u32) -> usize {
        anchor_count(img_w, img_h, &self.pyramid_levels, self.row, self.line)
    }
}

impl From<&p2pnet_utils::config::AnchorSettings> for AnchorConfig {
    fn from(settings: &p2pnet_utils::config::AnchorSettings) -> Self {
        Self {
            pyramid_levels: settings.pyramid_levels.clone(),
            row: settings.row,
            line: settings.line,
        }
    }
}

/// Anchors inside one cell, relative to the cell center.
///
/// Along an axis split into `n` parts the coordinates are `(j + 0.5) * (stride / n) - stride / 2`.
pub fn base_anchor_points(stride: u32, row: u32, line: u32) -> Vec<AnchorPoint> {
    let stride_f = stride as f32;
    let half = stride_f / 2.0;
    let row_step = stride_f / row as f32;
    let line_step = stride_f / line as f32;

    let mut anchors = Vec::with_capacity((row * line) as usize);
    for i in 0..row {
        let y = (i as f32 + 0.5) * row_step - half;
        for j in 0..line {
            let x = (j as f32 + 0.5) * line_step - half;
            anchors.push(AnchorPoint::new(x, y));
        }
    }
    anchors
}

/// Tile `base` over a `feature_w x feature_h` map, offsetting each copy to its cell center.
pub fn shift(
    feature_w: u32,
    feature_h: u32,
    stride: u32,
    base: &[AnchorPoint],
) -> Vec<AnchorPoint> {
    let stride_f = stride as f32;
    let mut shifted = Vec::with_capacity(feature_w as usize * feature_h as usize * base.len());
    for i in 0..feature_h {
        let shift_y = (i as f32 + 0.5) * stride_f;
        for j in 0..feature_w {
            let shift_x = (j as f32 + 0.5) * stride_f;
            shifted.extend(
                base.iter()
                    .map(|anchor| AnchorPoint::new(anchor.x + shift_x, anchor.y + shift_y)),
            );
        }
    }
    shifted
}

/// Generate the full anchor sequence covering an `img_w x img_h` input.
///
/// Feature maps use ceiling division so a partial cell at the right or bottom edge still gets
/// anchors.
pub fn generate_anchor_points(
    img_w: u32,
    img_h: u32,
    pyramid_levels: &[u32],
    row: u32,
    line: u32,
) -> Result<Vec<AnchorPoint>> {
    validate(img_w, img_h, pyramid_levels, row, line)?;

    let mut all = Vec::with_capacity(anchor_count(img_w, img_h, pyramid_levels, row, line));
    for &level in pyramid_levels {
        let stride = 1u32 << level;
        let feature_w = img_w.div_ceil(stride);
        let feature_h = img_h.div_ceil(stride);
        let base = base_anchor_points(stride, row, line);
        all.extend(shift(feature_w, feature_h, stride, &base));
    }
    Ok(all)
}

/// Anchor count for an input size: `sum over levels of ceil(W/s) * ceil(H/s) * row * line`.
///
/// Levels whose stride does not fit in `u32` contribute nothing.
pub fn anchor_count(img_w: u32, img_h: u32, pyramid_levels: &[u32], row: u32, line: u32) -> usize {
    let per_cell = row as usize * line as usize;
    pyramid_levels
        .iter()
        .filter_map(|&level| 1u32.checked_shl(level))
        .map(|stride| {
            img_w.div_ceil(stride) as usize * img_h.div_ceil(stride) as usize * per_cell
        })
        .sum()
}

/// Pack anchors into a `[N, 2]` f32 tensor.
pub fn anchors_to_tensor(anchors: &[AnchorPoint]) -> anyhow::Result<Tensor> {
    let flat: Vec<f32> = anchors.iter().flat_map(|a| [a.x, a.y]).collect();
    Tensor::from_shape(&[anchors.len(), 2], &flat)
        .map_err(|e| anyhow::anyhow!("failed to build anchor tensor: {e}"))
}

fn validate(img_w: u32, img_h: u32, pyramid_levels: &[u32], row: u32, line: u32) -> Result<()> {
    if img_w == 0 || img_h == 0 {
        return Err(CountError::InvalidDimension(format!(
            "anchor grid needs a non-empty image, got {img_w}x{img_h}"
        )));
    }
    if row == 0 || line == 0 {
        return Err(CountError::InvalidDimension(format!(
            "anchor tiling must be at least 1x1, got row={row} line={line}"
        )));
    }
    if pyramid_levels.is_empty() {
        return Err(CountError::InvalidDimension(
            "at least one pyramid level is required".to_string(),
        ));
    }
    if let Some(&level) = pyramid_levels.iter().find(|&&level| level >= 31) {
        return Err(CountError::InvalidDimension(format!(
            "pyramid level {level} is too large"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: AnchorPoint, expected: (f32, f32)) {
        assert!(
            (actual.x - expected.0).abs() < 1e-5 && (actual.y - expected.1).abs() < 1e-5,
            "expected {expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn base_anchors_are_centered_and_row_major() {
        let base = base_anchor_points(8, 2, 2);
        assert_eq!(base.len(), 4);
        assert_close(base[0], (-2.0, -2.0));
        assert_close(base[1], (2.0, -2.0));
        assert_close(base[2], (-2.0, 2.0));
        assert_close(base[3], (2.0, 2.0));
    }

    #[test]
    fn base_anchors_with_uneven_tiling() {
        let base = base_anchor_points(8, 1, 3);
        assert_eq!(base.len(), 3);
        let step = 8.0 / 3.0;
        assert_close(base[0], (0.5 * step - 4.0, 0.0));
        assert_close(base[2], (2.5 * step - 4.0, 0.0));
    }

    #[test]
    fn single_tile_anchor_sits_at_cell_center() {
        let anchors = generate_anchor_points(8, 8, &[3], 1, 1).unwrap();
        assert_eq!(anchors.len(), 1);
        assert_close(anchors[0], (4.0, 4.0));
    }

    #[test]
    fn anchor_count_matches_reference_layout() {
        let anchors = generate_anchor_points(640, 384, &[3], 2, 2).unwrap();
        assert_eq!(anchors.len(), 80 * 48 * 4);
        assert_eq!(anchors.len(), 15_360);
        assert_eq!(anchor_count(640, 384, &[3], 2, 2), 15_360);
    }

    #[test]
    fn partial_cells_are_covered() {
        // 20 / 8 = 2.5 -> 3 cells
        let anchors = generate_anchor_points(20, 9, &[3], 1, 1).unwrap();
        assert_eq!(anchors.len(), 3 * 2);
        assert_close(anchors[2], (20.0, 4.0));
        assert_close(anchors[5], (20.0, 12.0));
    }

    #[test]
    fn cells_are_row_major_then_anchor_order() {
        let anchors = generate_anchor_points(16, 16, &[3], 2, 2).unwrap();
        assert_eq!(anchors.len(), 16);
        // cell (0, 0)
        assert_close(anchors[0], (2.0, 2.0));
        assert_close(anchors[3], (6.0, 6.0));
        // cell (0, 1): next column, same row
        assert_close(anchors[4], (10.0, 2.0));
        // cell (1, 0): second row
        assert_close(anchors[8], (2.0, 10.0));
    }

    #[test]
    fn levels_are_concatenated_in_order() {
        let anchors = generate_anchor_points(32, 32, &[4, 3], 1, 1).unwrap();
        assert_eq!(anchors.len(), 4 + 16);
        assert_close(anchors[0], (8.0, 8.0));
        assert_close(anchors[4], (4.0, 4.0));
        assert_eq!(anchor_count(32, 32, &[4, 3], 1, 1), anchors.len());
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(matches!(
            generate_anchor_points(0, 10, &[3], 2, 2),
            Err(CountError::InvalidDimension(_))
        ));
        assert!(matches!(
            generate_anchor_points(10, 10, &[3], 0, 2),
            Err(CountError::InvalidDimension(_))
        ));
        assert!(matches!(
            generate_anchor_points(10, 10, &[], 2, 2),
            Err(CountError::InvalidDimension(_))
        ));
        assert!(matches!(
            generate_anchor_points(10, 10, &[31], 2, 2),
            Err(CountError::InvalidDimension(_))
        ));
    }

    #[test]
    fn tensor_has_one_row_per_anchor() {
        let anchors = AnchorConfig::default().generate(64, 32).unwrap();
        let tensor = anchors_to_tensor(&anchors).unwrap();
        assert_eq!(tensor.shape(), &[anchors.len(), 2]);
        let data = tensor.as_slice::<f32>().unwrap();
        assert_eq!(data[0], anchors[0].x);
        assert_eq!(data[1], anchors[0].y);
    }
}
