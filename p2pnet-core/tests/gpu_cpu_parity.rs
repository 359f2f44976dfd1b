use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use p2pnet_core::preprocess::{CpuPreprocessor, PreprocessConfig, Preprocessor, WgpuPreprocessor};
use p2pnet_utils::gpu::{GpuAvailability, GpuContext, GpuContextOptions};

/// Bilinear sampling on the GPU and triangle filtering on the CPU differ slightly at edges.
const MEAN_ABS_TOLERANCE: f32 = 0.05;

fn gradient_image(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) * 255 / (width + height)) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

fn gpu_preprocessor() -> Option<Arc<dyn Preprocessor>> {
    let context = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
        GpuAvailability::Available(ctx) => ctx,
        GpuAvailability::Disabled { reason } => {
            eprintln!("skipping GPU parity test (GPU disabled: {reason})");
            return None;
        }
        GpuAvailability::Unavailable { error } => {
            eprintln!("skipping GPU parity test (GPU unavailable: {error})");
            return None;
        }
    };
    match WgpuPreprocessor::new(context) {
        Ok(pre) => Some(Arc::new(pre)),
        Err(err) => {
            eprintln!("skipping GPU parity test (failed to build GPU preprocessor: {err})");
            None
        }
    }
}

#[test]
fn gpu_preprocessing_matches_cpu() {
    let Some(gpu) = gpu_preprocessor() else {
        return;
    };
    let config = PreprocessConfig::default();

    for &(w, h) in &[(1280u32, 720u32), (300, 1000), (640, 640), (97, 53)] {
        let image = gradient_image(w, h);
        let cpu = CpuPreprocessor
            .preprocess(&image, &config)
            .expect("CPU preprocessing");
        let gpu_out = gpu.preprocess(&image, &config).expect("GPU preprocessing");

        assert_eq!(cpu.plan, gpu_out.plan, "plan mismatch for {w}x{h}");
        assert_eq!(cpu.tensor.shape(), gpu_out.tensor.shape());

        let a = cpu.tensor.as_slice::<f32>().unwrap();
        let b = gpu_out.tensor.as_slice::<f32>().unwrap();
        let mean_abs = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f32>() / a.len() as f32;
        assert!(
            mean_abs <= MEAN_ABS_TOLERANCE,
            "mean abs delta {mean_abs} too large for {w}x{h}"
        );
    }
}

#[test]
fn source_wider_than_texture_limit_still_preprocesses() {
    let Some(gpu) = gpu_preprocessor() else {
        return;
    };
    let config = PreprocessConfig::default();
    let image = gradient_image(20_000, 8);

    let cpu = CpuPreprocessor
        .preprocess(&image, &config)
        .expect("CPU preprocessing");
    let gpu_out = gpu
        .preprocess(&image, &config)
        .expect("oversized source should not fail");

    assert_eq!(cpu.plan, gpu_out.plan);
    assert_eq!(cpu.tensor.shape(), gpu_out.tensor.shape());
}
