mod annotate;
mod args;
mod config;
mod input;
mod types;

use std::{
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use p2pnet_core::{CrowdCounter, ModelSource};
use p2pnet_utils::{configure_telemetry, init_logging, load_image, normalize_path};
use rayon::prelude::*;

use crate::{
    annotate::annotate_image,
    args::DetectArgs,
    config::{apply_cli_overrides, load_settings},
    input::collect_images,
    types::{ImageCount, PointRecord},
};

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = DetectArgs::parse();

    let mut settings = load_settings(args.config.as_ref())?;
    apply_cli_overrides(&mut settings, &args);
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    let input_path = normalize_path(&args.input)?;
    let mut source = ModelSource::from(&settings.model);
    source.graph = normalize_path(&source.graph)
        .with_context(|| format!("model not found at {}", source.graph.display()))?;
    let annotate_dir = if let Some(dir) = args.annotate.as_ref() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create annotation directory {}", dir.display()))?;
        Some(normalize_path(dir)?)
    } else {
        None
    };

    let counter = CrowdCounter::from_settings(&settings);
    if args.gpu && !counter.has_accelerator() {
        warn!("--gpu requested but no GPU preprocessor could be created; using CPU");
    }

    info!(
        "Loading P2PNet model from {} (target size {}, alignment {})",
        source.graph.display(),
        settings.input.target_size,
        settings.input.alignment
    );
    counter.initialize(&source)?;

    let images = collect_images(&input_path)?;
    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: jpg, jpeg, png, bmp, webp)",
            input_path.display()
        );
    }

    info!("Processing {} image(s)...", images.len());
    let results: Vec<ImageCount> = images
        .par_iter()
        .filter_map(
            |image_path| match count_image(&counter, image_path, annotate_dir.as_deref()) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!("Failed to process {}: {err:#}", image_path.display());
                    None
                }
            },
        )
        .collect();

    if results.is_empty() {
        anyhow::bail!("all images failed; cannot produce output");
    }

    if let Some(json_path) = args.json.as_ref() {
        if let Some(dir) = json_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        let file = File::create(json_path)
            .with_context(|| format!("failed to create {}", json_path.display()))?;
        serde_json::to_writer_pretty(file, &results)
            .with_context(|| format!("failed to write counts JSON to {}", json_path.display()))?;
        info!("Wrote counts to {}", json_path.display());
    } else {
        let json = serde_json::to_string_pretty(&results).context("failed to serialize counts")?;
        println!("{json}");
    }

    Ok(())
}

fn count_image(
    counter: &CrowdCounter,
    image_path: &Path,
    annotate_dir: Option<&Path>,
) -> Result<ImageCount> {
    let image = load_image(image_path)?;
    let output = counter.detect_image_accelerated(&image)?;
    info!("{} -> {} head(s)", image_path.display(), output.count());

    let annotated = annotate_dir.and_then(|dir| {
        match annotate_image(image_path, &image, &output.points, dir) {
            Ok(path) => {
                info!("Annotated image saved to {}", path.display());
                Some(path.display().to_string())
            }
            Err(err) => {
                warn!("Failed to annotate {}: {err}", image_path.display());
                None
            }
        }
    });

    Ok(ImageCount {
        image: image_path.display().to_string(),
        count: output.count(),
        points: output.points.iter().map(PointRecord::from).collect(),
        annotated,
    })
}

