use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use image::{ImageBuffer, Rgb};
use serde::Deserialize;
use tempfile::tempdir;

const MODEL_REL_PATH: &str = "../models/p2pnet.onnx";

#[derive(Debug, Deserialize)]
struct CliPoint {
    x: f32,
    y: f32,
    prob: f32,
}

#[derive(Debug, Deserialize)]
struct CliImageCount {
    image: String,
    count: usize,
    points: Vec<CliPoint>,
    annotated: Option<String>,
}

fn write_test_image(path: &Path, width: u32, height: u32) -> Result<(), Box<dyn Error>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let r = ((x + y) % 255) as u8;
        Rgb([r, 128, 255u8.saturating_sub(r)])
    });
    img.save(path)?;
    Ok(())
}

fn ensure_model_path() -> Option<PathBuf> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(MODEL_REL_PATH);
    if !path.exists() {
        eprintln!(
            "skipping test because P2PNet model is missing at {}",
            path.display()
        );
        return None;
    }
    path.canonicalize().ok()
}

#[test]
fn help_lists_counting_flags() {
    let output = cargo_bin_cmd!("p2pnet-cli")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    for flag in [
        "--input",
        "--model",
        "--weights",
        "--score-threshold",
        "--rounding",
        "--annotate",
        "--no-gpu",
    ] {
        assert!(text.contains(flag), "help output is missing {flag}");
    }
}

#[test]
fn missing_input_argument_fails() {
    cargo_bin_cmd!("p2pnet-cli").assert().failure();
}

#[test]
fn missing_model_fails_with_message() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("crowd.png");
    write_test_image(&image_path, 16, 16)?;

    let output = cargo_bin_cmd!("p2pnet-cli")
        .arg("--input")
        .arg(&image_path)
        .arg("--model")
        .arg(work_dir.path().join("absent.onnx"))
        .arg("--no-gpu")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("model not found"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn invalid_model_file_fails_initialization() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("crowd.png");
    write_test_image(&image_path, 16, 16)?;
    let model_path = work_dir.path().join("broken.onnx");
    fs::write(&model_path, b"not a model")?;

    let output = cargo_bin_cmd!("p2pnet-cli")
        .arg("--input")
        .arg(&image_path)
        .arg("--model")
        .arg(&model_path)
        .arg("--no-gpu")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(
        stderr.contains("model initialization failed"),
        "stderr: {stderr}"
    );
    Ok(())
}

#[test]
fn counts_single_image_to_json() -> Result<(), Box<dyn Error>> {
    let Some(model) = ensure_model_path() else {
        return Ok(());
    };
    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("sample.png");
    let json_path = work_dir.path().join("out.json");
    let annotate_dir = work_dir.path().join("annotated");
    write_test_image(&image_path, 96, 64)?;

    cargo_bin_cmd!("p2pnet-cli")
        .arg("--input")
        .arg(&image_path)
        .arg("--model")
        .arg(&model)
        .arg("--no-gpu")
        .arg("--json")
        .arg(&json_path)
        .arg("--annotate")
        .arg(&annotate_dir)
        .assert()
        .success();

    let parsed: Vec<CliImageCount> = serde_json::from_str(&fs::read_to_string(&json_path)?)?;
    assert_eq!(parsed.len(), 1, "expected exactly one CLI output entry");
    let record = &parsed[0];
    assert_eq!(record.image, image_path.canonicalize()?.display().to_string());
    assert_eq!(record.count, record.points.len());
    for point in &record.points {
        assert!(point.prob > 0.5, "point {point:?} below threshold");
        assert!(point.x.is_finite() && point.y.is_finite());
    }
    assert!(annotate_dir.join("sample.png").exists());
    assert!(record.annotated.is_some());
    Ok(())
}

#[test]
fn threshold_above_one_yields_zero_count() -> Result<(), Box<dyn Error>> {
    let Some(model) = ensure_model_path() else {
        return Ok(());
    };
    let work_dir = tempdir()?;
    let images_dir = work_dir.path().join("images");
    fs::create_dir_all(&images_dir)?;
    write_test_image(&images_dir.join("a.png"), 40, 30)?;
    write_test_image(&images_dir.join("b.png"), 30, 40)?;
    let json_path = work_dir.path().join("out.json");

    cargo_bin_cmd!("p2pnet-cli")
        .arg("--input")
        .arg(&images_dir)
        .arg("--model")
        .arg(&model)
        .arg("--no-gpu")
        .arg("--score-threshold")
        .arg("1.5")
        .arg("--json")
        .arg(&json_path)
        .assert()
        .success();

    let parsed: Vec<CliImageCount> = serde_json::from_str(&fs::read_to_string(&json_path)?)?;
    assert_eq!(parsed.len(), 2);
    assert!(parsed[0].image.ends_with("a.png"));
    assert!(parsed.iter().all(|r| r.count == 0 && r.points.is_empty()));
    assert!(parsed.iter().all(|r| r.annotated.is_none()));
    Ok(())
}
