//! Image annotation: one dot per detected head.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_circle_mut;
use p2pnet_core::CrowdPoint;

const POINT_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const POINT_RADIUS: i32 = 3;

/// Draw `points` over `image`. Points outside the image are skipped.
pub fn draw_points(image: &DynamicImage, points: &[CrowdPoint]) -> RgbaImage {
    let mut canvas = image.to_rgba8();
    let (img_w, img_h) = canvas.dimensions();
    for point in points {
        if point.x < 0.0 || point.y < 0.0 || point.x >= img_w as f32 || point.y >= img_h as f32 {
            continue;
        }
        draw_filled_circle_mut(
            &mut canvas,
            (point.x as i32, point.y as i32),
            POINT_RADIUS,
            POINT_COLOR,
        );
    }
    canvas
}

/// Draw points on an image and save it under `output_dir` with the source file name.
pub fn annotate_image(
    image_path: &Path,
    image: &DynamicImage,
    points: &[CrowdPoint],
    output_dir: &Path,
) -> Result<PathBuf> {
    let canvas = draw_points(image, points);

    let file_name = image_path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("frame.png"));
    let output_path = output_dir.join(file_name);

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    DynamicImage::ImageRgba8(canvas)
        .to_rgb8()
        .save(&output_path)
        .with_context(|| format!("failed to save annotated image {}", output_path.display()))?;

    Ok(output_path)
}
