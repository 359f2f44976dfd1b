use std::{hint::black_box, sync::Arc};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use image::{DynamicImage, Rgb, RgbImage};
use p2pnet_core::{
    AnchorConfig, CpuPreprocessor, PreprocessConfig, Preprocessor, WgpuPreprocessor,
    generate_anchor_points,
};
use p2pnet_utils::{
    config::ResizeQuality,
    gpu::{GpuAvailability, GpuContext, GpuContextOptions},
};

const SOURCE_SIZES: &[(u32, u32)] = &[(1280, 720), (1920, 1080), (720, 1280)];

fn synthetic_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
    }))
}

fn available_preprocessors() -> Vec<(&'static str, Arc<dyn Preprocessor>)> {
    let mut preprocessors: Vec<(&'static str, Arc<dyn Preprocessor>)> =
        vec![("cpu", Arc::new(CpuPreprocessor))];
    if let GpuAvailability::Available(ctx) =
        GpuContext::init_with_fallback(&GpuContextOptions::default())
    {
        match WgpuPreprocessor::new(ctx) {
            Ok(pre) => preprocessors.push(("gpu", Arc::new(pre))),
            Err(err) => eprintln!("GPU preprocessor unavailable: {err}"),
        }
    } else {
        eprintln!("Skipping GPU preprocessing bench (no adapter available)");
    }
    preprocessors
}

fn benchmark_anchors(c: &mut Criterion) {
    let mut group = c.benchmark_group("anchor_generation");
    for &(w, h) in &[(640u32, 384u32), (640, 640), (1280, 736)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{w}x{h}")),
            &(w, h),
            |b, &(w, h)| {
                b.iter(|| {
                    generate_anchor_points(black_box(w), black_box(h), &[3], 2, 2)
                        .expect("valid anchor layout")
                });
            },
        );
    }
    group.bench_function("multi_level_640x640", |b| {
        let config = AnchorConfig {
            pyramid_levels: vec![3, 4, 5],
            ..Default::default()
        };
        b.iter(|| config.generate(black_box(640), black_box(640)).expect("valid layout"));
    });
    group.finish();
}

fn benchmark_preprocessing(c: &mut Criterion) {
    let configs = [
        (
            "quality",
            PreprocessConfig {
                resize_quality: ResizeQuality::Quality,
                ..Default::default()
            },
        ),
        (
            "speed",
            PreprocessConfig {
                resize_quality: ResizeQuality::Speed,
                ..Default::default()
            },
        ),
    ];
    let preprocessors = available_preprocessors();

    let mut group = c.benchmark_group("preprocess");
    for &(w, h) in SOURCE_SIZES {
        let image = synthetic_image(w, h);
        for (backend, preprocessor) in &preprocessors {
            for (label, config) in &configs {
                group.bench_with_input(
                    BenchmarkId::new(format!("{backend}_{label}"), format!("{w}x{h}")),
                    config,
                    |b, cfg| {
                        b.iter(|| {
                            preprocessor
                                .preprocess(black_box(&image), cfg)
                                .expect("preprocessing should succeed")
                        });
                    },
                );
            }
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_anchors, benchmark_preprocessing);
criterion_main!(benches);
