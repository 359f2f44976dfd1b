use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbImage};
use p2pnet_core::{CrowdCounter, ModelSource, PipelineConfig, PixelBuffer};

fn model_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../models/p2pnet.onnx")
}

fn ready_counter() -> Option<CrowdCounter> {
    let path = model_path();
    if !path.exists() {
        eprintln!("skipping model test ({} missing)", path.display());
        return None;
    }
    let counter = CrowdCounter::new(PipelineConfig::default());
    counter
        .initialize(&ModelSource::new(path))
        .expect("bundled model loads");
    Some(counter)
}

#[test]
fn blank_frame_produces_valid_points() {
    let Some(counter) = ready_counter() else {
        return;
    };
    let data = vec![0u8; 320 * 240 * 4];
    let output = counter
        .detect(&PixelBuffer::rgba(320, 240, &data), false)
        .expect("inference runs");

    assert_eq!(output.anchor_count, 80 * 60 * 4);
    for point in &output.points {
        assert!(point.prob > 0.5 && point.prob <= 1.0);
        assert!(point.x.is_finite() && point.y.is_finite());
    }
}

#[test]
fn repeated_sizes_reuse_the_compiled_plan() {
    let Some(counter) = ready_counter() else {
        return;
    };
    let image = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
    let first = counter.detect_image(&image).expect("first run");
    let second = counter.detect_image(&image).expect("second run");
    assert_eq!(first.points, second.points);
}
