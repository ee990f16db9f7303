use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{concatenate, Array1, Array3, Axis};
use thiserror::Error;

/// Text detection input shape.
pub const CANVAS_WIDTH: u32 = 2240;
pub const CANVAS_HEIGHT: u32 = 1920;
pub const CHANNELS: usize = 3;

/// Per-channel statistics, RGB order, on a 0..1 scale.
pub const MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const VARIANCE: [f64; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image decoding failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("do not support input image with {0} channels")]
    UnsupportedChannels(u8),
    #[error("pixel buffer does not match image dimensions: {0}")]
    Layout(#[from] ndarray::ShapeError),
}

/// Everything the model emits for one image.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// HWC, always three channels.
    pub resized: Array3<u8>,
    /// CHW, normalized.
    pub tensor: Array3<f32>,
    /// (original width / canvas width, original height / canvas height).
    pub scale: (f64, f64),
}

pub fn preprocess(bytes: &[u8], filter: FilterType) -> Result<PreparedImage, ImageError> {
    let img = image::load_from_memory(bytes)?;
    prepare(&img, filter)
}

pub fn prepare(img: &DynamicImage, filter: FilterType) -> Result<PreparedImage, ImageError> {
    let (width, height) = img.dimensions();
    let scale = scale_pair(width, height);

    let channels = img.color().channel_count();
    if channels != 1 && channels != 3 {
        return Err(ImageError::UnsupportedChannels(channels));
    }

    let resized = resize_image(img, filter);
    let resized = if channels == 1 {
        gray_to_bgr(&resized)?
    } else {
        rgb_array(&resized)?
    };
    let tensor = normalize_mean_variance(&resized);

    Ok(PreparedImage {
        resized,
        tensor,
        scale,
    })
}

pub fn scale_pair(width: u32, height: u32) -> (f64, f64) {
    (
        f64::from(width) / f64::from(CANVAS_WIDTH),
        f64::from(height) / f64::from(CANVAS_HEIGHT),
    )
}

fn resize_image(image: &DynamicImage, filter: FilterType) -> DynamicImage {
    image.resize_exact(CANVAS_WIDTH, CANVAS_HEIGHT, filter)
}

fn rgb_array(image: &DynamicImage) -> Result<Array3<u8>, ImageError> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let array = Array3::from_shape_vec((height as usize, width as usize, CHANNELS), rgb.into_raw())?;
    Ok(array)
}

/// Repeats the single channel into a BGR triple.
fn gray_to_bgr(image: &DynamicImage) -> Result<Array3<u8>, ImageError> {
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    let gray = Array3::from_shape_vec((height as usize, width as usize, 1), luma.into_raw())?;
    let bgr = concatenate(Axis(2), &[gray.view(), gray.view(), gray.view()])?;
    Ok(bgr)
}

/// Applies `(x - mean * 255) / (variance * 255)` per channel and returns CHW.
pub fn normalize_mean_variance(pixels: &Array3<u8>) -> Array3<f32> {
    let mean: Array1<f32> = MEAN.iter().map(|m| (m * 255.0) as f32).collect();
    let variance: Array1<f32> = VARIANCE.iter().map(|v| (v * 255.0) as f32).collect();

    let mut img = pixels.mapv(f32::from);
    img -= &mean;
    img /= &variance;

    img.permuted_axes([2, 0, 1]).as_standard_layout().into_owned()
}
