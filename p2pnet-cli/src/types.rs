//! Serializable output records for p2pnet-cli.

use p2pnet_core::CrowdPoint;
use serde::Serialize;

/// A single detected head.
#[derive(Debug, Serialize)]
pub struct PointRecord {
    pub x: f32,
    pub y: f32,
    pub prob: f32,
}

/// Count and points for a single image.
#[derive(Debug, Serialize)]
pub struct ImageCount {
    pub image: String,
    pub count: usize,
    pub points: Vec<PointRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated: Option<String>,
}

impl From<&CrowdPoint> for PointRecord {
    fn from(point: &CrowdPoint) -> Self {
        Self {
            x: point.x,
            y: point.y,
            prob: point.prob,
        }
    }
}
