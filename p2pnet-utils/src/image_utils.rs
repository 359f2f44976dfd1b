use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, imageops::FilterType};
use ndarray::Array3;

/// Load an image from disk into memory.
///
/// # Arguments
///
/// * `path` - The path to the image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Resize an image to the requested resolution using the provided filter.
///
/// # Arguments
///
/// * `image` - The image to resize.
/// * `width` - The target width.
/// * `height` - The target height.
/// * `filter` - The sampling filter to use for resizing.
pub fn resize_image(image: &DynamicImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    image.resize_exact(width, height, filter).to_rgb8()
}

/// Place `image` on a zero-filled canvas of `canvas_w x canvas_h` with its top-left corner at
/// `(left, top)`.
pub fn pad_rgb(image: &RgbImage, canvas_w: u32, canvas_h: u32, left: u32, top: u32) -> RgbImage {
    let mut canvas = RgbImage::new(canvas_w, canvas_h);
    image::imageops::replace(&mut canvas, image, i64::from(left), i64::from(top));
    canvas
}

/// Convert an RGB image into an RGB CHW array with `(value - mean[c]) * norm[c]` applied.
///
/// # Arguments
///
/// * `image` - The RGB image to convert.
/// * `mean` - Per-channel mean, in R, G, B order.
/// * `norm` - Per-channel multiplier, in R, G, B order.
pub fn rgb_to_normalized_chw(image: &RgbImage, mean: [f32; 3], norm: [f32; 3]) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        for c in 0..3 {
            array[(c, yi, xi)] = (f32::from(pixel[c]) - mean[c]) * norm[c];
        }
    }
    array
}
