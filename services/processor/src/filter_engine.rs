//! Image filter pipeline.
//!
//! Decodes an uploaded image, optionally resizes it, applies one named
//! filter and re-encodes the result in the source format. Everything here is
//! synchronous and side-effect free; async callers run it on the blocking
//! pool.
//!
//! | Token | Operation |
//! |---|---|
//! | `BLUR` | one Gaussian pass, sigma = strength / 2 |
//! | `CONTOUR`, `DETAIL`, `EDGE_ENHANCE`, `EMBOSS`, `SMOOTH` | fixed kernel applied `strength` times |
//! | `SHARPEN` | one unsharp mask, radius = max(1, strength / 3), percent = min(500, strength * 50), threshold 3 |
//! | `EDGES` | edge kernel, then contrast scaled by strength / 2 |
//! | anything else | pass-through |

use crate::error::{PipelineError, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Sharpen threshold below which a channel difference is left alone
pub const SHARPEN_THRESHOLD: i32 = 3;

/// Upper bound on the unsharp mask amount, in percent
pub const MAX_SHARPEN_PERCENT: u32 = 500;

/// Largest width or height a resize may produce
pub const MAX_OUTPUT_DIMENSION: u32 = 20_000;

/// Formats we can write back out; anything else falls back to JPEG
const ENCODABLE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::WebP,
    ImageFormat::Tiff,
];

/// Filter selected by a case-sensitive token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Blur,
    Contour,
    Detail,
    EdgeEnhance,
    Emboss,
    Smooth,
    Sharpen,
    Edges,
    PassThrough,
}

impl FilterKind {
    pub fn from_token(token: &str) -> Self {
        match token {
            "BLUR" => FilterKind::Blur,
            "CONTOUR" => FilterKind::Contour,
            "DETAIL" => FilterKind::Detail,
            "EDGE_ENHANCE" => FilterKind::EdgeEnhance,
            "EMBOSS" => FilterKind::Emboss,
            "SMOOTH" => FilterKind::Smooth,
            "SHARPEN" => FilterKind::Sharpen,
            "EDGES" => FilterKind::Edges,
            _ => FilterKind::PassThrough,
        }
    }
}

/// Processing parameters carried by requests, tasks and records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub filter: String,
    pub strength: u32,
    pub resize_factor: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            filter: "BLUR".to_string(),
            strength: 5,
            resize_factor: 1.0,
        }
    }
}

impl FilterParams {
    pub fn new(filter: impl Into<String>, strength: u32, resize_factor: f64) -> Self {
        Self {
            filter: filter.into(),
            strength,
            resize_factor,
        }
    }

    pub fn kind(&self) -> FilterKind {
        FilterKind::from_token(&self.filter)
    }

    /// Run the pipeline on `image_bytes` with these parameters
    pub fn apply(&self, image_bytes: &[u8]) -> Result<FilterOutput> {
        apply(image_bytes, &self.filter, self.strength, self.resize_factor)
    }
}

/// Encoded result of a filter run
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub bytes: Vec<u8>,
    /// Lower-case format token, e.g. `jpeg`, `png`
    pub format: String,
    pub width: u32,
    pub height: u32,
}

/// Unsharp mask settings derived from a strength value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharpenParams {
    pub radius: f32,
    pub percent: u32,
    pub threshold: i32,
}

impl SharpenParams {
    pub fn for_strength(strength: u32) -> Self {
        Self {
            radius: (strength as f32 / 3.0).max(1.0),
            percent: strength.saturating_mul(50).min(MAX_SHARPEN_PERCENT),
            threshold: SHARPEN_THRESHOLD,
        }
    }
}

/// Gaussian sigma used by `BLUR`
pub fn blur_sigma(strength: u32) -> f32 {
    strength as f32 / 2.0
}

/// Contrast factor applied after edge detection by `EDGES`
pub fn contrast_factor(strength: u32) -> f32 {
    strength as f32 / 2.0
}

/// Decode, resize, filter and re-encode an image.
///
/// Unknown filter tokens are a no-op. The output keeps the source encoding
/// (JPEG when the source format cannot be written back).
pub fn apply(
    image_bytes: &[u8],
    filter_name: &str,
    strength: u32,
    resize_factor: f64,
) -> Result<FilterOutput> {
    validate_resize_factor(resize_factor)?;

    let reader = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::Decode(e.to_string()))?;
    let source_format = reader.format();
    let decoded = reader
        .decode()
        .map_err(|e| PipelineError::Decode(e.to_string()))?;

    let shape = ColorShape::of(&decoded);
    let output_format = source_format
        .filter(|f| ENCODABLE_FORMATS.contains(f))
        .unwrap_or(ImageFormat::Jpeg);

    let resized = resize(decoded, resize_factor)?;
    let filtered = run_filter(resized.to_rgba8(), FilterKind::from_token(filter_name), strength);
    let (width, height) = filtered.dimensions();
    let bytes = encode(filtered, output_format, shape)?;

    Ok(FilterOutput {
        bytes,
        format: format_token(output_format).to_string(),
        width,
        height,
    })
}

/// Lower-case token for an encoding
pub fn format_token(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::WebP => "webp",
        ImageFormat::Tiff => "tiff",
        _ => "jpeg",
    }
}

/// Sniff the encoding of raw bytes, returning its token
pub fn detect_format(image_bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(image_bytes).ok().map(format_token)
}

fn validate_resize_factor(resize_factor: f64) -> Result<()> {
    if !resize_factor.is_finite() || resize_factor <= 0.0 {
        return Err(PipelineError::InvalidParameters(format!(
            "resize factor must be a positive number, got {resize_factor}"
        )));
    }
    Ok(())
}

/// Check an upload before it is stored and queued.
///
/// Reads only the header, so a request that would fail in the filter for
/// its resize factor is rejected up front.
pub fn validate_request(image_bytes: &[u8], resize_factor: f64) -> Result<()> {
    validate_resize_factor(resize_factor)?;

    let (width, height) = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| PipelineError::Decode(e.to_string()))?;

    target_dimensions(width, height, resize_factor).map(|_| ())
}

/// Output size for a resize: each side floored, at least 1 px and at most the limit
fn target_dimensions(width: u32, height: u32, resize_factor: f64) -> Result<(u32, u32)> {
    if resize_factor == 1.0 {
        return Ok((width, height));
    }

    let scaled_width = (width as f64 * resize_factor).floor();
    let scaled_height = (height as f64 * resize_factor).floor();

    if scaled_width < 1.0 || scaled_height < 1.0 {
        return Err(PipelineError::InvalidParameters(format!(
            "resize factor {resize_factor} reduces {width}x{height} to nothing"
        )));
    }
    if scaled_width > MAX_OUTPUT_DIMENSION as f64 || scaled_height > MAX_OUTPUT_DIMENSION as f64 {
        return Err(PipelineError::InvalidParameters(format!(
            "resize factor {resize_factor} exceeds {MAX_OUTPUT_DIMENSION}px limit"
        )));
    }

    Ok((scaled_width as u32, scaled_height as u32))
}

fn resize(image: DynamicImage, resize_factor: f64) -> Result<DynamicImage> {
    if resize_factor == 1.0 {
        return Ok(image);
    }

    let (width, height) = target_dimensions(image.width(), image.height(), resize_factor)?;
    Ok(image.resize_exact(width, height, FilterType::Lanczos3))
}

fn run_filter(raster: RgbaImage, kind: FilterKind, strength: u32) -> RgbaImage {
    match kind {
        FilterKind::Blur => gaussian_blur(raster, blur_sigma(strength)),
        FilterKind::Contour => repeat_kernel(raster, &CONTOUR, strength),
        FilterKind::Detail => repeat_kernel(raster, &DETAIL, strength),
        FilterKind::EdgeEnhance => repeat_kernel(raster, &EDGE_ENHANCE_MORE, strength),
        FilterKind::Emboss => repeat_kernel(raster, &EMBOSS, strength),
        FilterKind::Smooth => repeat_kernel(raster, &SMOOTH_MORE, strength),
        FilterKind::Sharpen => unsharp_mask(raster, SharpenParams::for_strength(strength)),
        FilterKind::Edges => {
            adjust_contrast(convolve(&raster, &FIND_EDGES), contrast_factor(strength))
        }
        FilterKind::PassThrough => raster,
    }
}

/// Square convolution kernel: `out = sum / scale + offset`
struct Kernel {
    size: u32,
    weights: &'static [i32],
    scale: i32,
    offset: i32,
}

#[rustfmt::skip]
const CONTOUR: Kernel = Kernel {
    size: 3,
    weights: &[
        -1, -1, -1,
        -1,  8, -1,
        -1, -1, -1,
    ],
    scale: 1,
    offset: 255,
};

#[rustfmt::skip]
const DETAIL: Kernel = Kernel {
    size: 3,
    weights: &[
         0, -1,  0,
        -1, 10, -1,
         0, -1,  0,
    ],
    scale: 6,
    offset: 0,
};

#[rustfmt::skip]
const EDGE_ENHANCE_MORE: Kernel = Kernel {
    size: 3,
    weights: &[
        -1, -1, -1,
        -1,  9, -1,
        -1, -1, -1,
    ],
    scale: 1,
    offset: 0,
};

#[rustfmt::skip]
const EMBOSS: Kernel = Kernel {
    size: 3,
    weights: &[
        -1, 0, 0,
         0, 1, 0,
         0, 0, 0,
    ],
    scale: 1,
    offset: 128,
};

#[rustfmt::skip]
const SMOOTH_MORE: Kernel = Kernel {
    size: 5,
    weights: &[
        1, 1,  1, 1, 1,
        1, 5,  5, 5, 1,
        1, 5, 44, 5, 1,
        1, 5,  5, 5, 1,
        1, 1,  1, 1, 1,
    ],
    scale: 100,
    offset: 0,
};

#[rustfmt::skip]
const FIND_EDGES: Kernel = Kernel {
    size: 3,
    weights: &[
        -1, -1, -1,
        -1,  8, -1,
        -1, -1, -1,
    ],
    scale: 1,
    offset: 0,
};

fn repeat_kernel(mut raster: RgbaImage, kernel: &Kernel, passes: u32) -> RgbaImage {
    for _ in 0..passes {
        raster = convolve(&raster, kernel);
    }
    raster
}

/// Convolve the color channels; alpha is copied through. Edges replicate.
fn convolve(src: &RgbaImage, kernel: &Kernel) -> RgbaImage {
    let (width, height) = src.dimensions();
    if width == 0 || height == 0 {
        return src.clone();
    }

    let radius = (kernel.size / 2) as i64;
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    let mut out = RgbaImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let mut acc = [0i32; 3];
            for ky in 0..kernel.size {
                let sy = (y as i64 + ky as i64 - radius).clamp(0, max_y) as u32;
                for kx in 0..kernel.size {
                    let sx = (x as i64 + kx as i64 - radius).clamp(0, max_x) as u32;
                    let weight = kernel.weights[(ky * kernel.size + kx) as usize];
                    let pixel = src.get_pixel(sx, sy);
                    for (channel, sum) in acc.iter_mut().enumerate() {
                        *sum += weight * pixel[channel] as i32;
                    }
                }
            }

            let alpha = src.get_pixel(x, y)[3];
            out.put_pixel(
                x,
                y,
                Rgba([
                    kernel_output(acc[0], kernel),
                    kernel_output(acc[1], kernel),
                    kernel_output(acc[2], kernel),
                    alpha,
                ]),
            );
        }
    }

    out
}

fn kernel_output(sum: i32, kernel: &Kernel) -> u8 {
    let value = sum as f32 / kernel.scale as f32 + kernel.offset as f32;
    value.round().clamp(0.0, 255.0) as u8
}

fn gaussian_blur(raster: RgbaImage, sigma: f32) -> RgbaImage {
    if sigma <= 0.0 {
        return raster;
    }
    imageops::blur(&raster, sigma)
}

fn unsharp_mask(mut raster: RgbaImage, params: SharpenParams) -> RgbaImage {
    let blurred = imageops::blur(&raster, params.radius);

    for (pixel, soft) in raster.pixels_mut().zip(blurred.pixels()) {
        for channel in 0..3 {
            pixel[channel] =
                sharpen_channel(pixel[channel], soft[channel], params.percent, params.threshold);
        }
    }

    raster
}

fn sharpen_channel(original: u8, blurred: u8, percent: u32, threshold: i32) -> u8 {
    let diff = original as i32 - blurred as i32;
    if diff.abs() < threshold {
        return original;
    }
    let sharpened = original as f32 + diff as f32 * percent as f32 / 100.0;
    sharpened.round().clamp(0.0, 255.0) as u8
}

/// Blend each color channel toward the mean luminance by `factor`
fn adjust_contrast(mut raster: RgbaImage, factor: f32) -> RgbaImage {
    let count = raster.width() as u64 * raster.height() as u64;
    if count == 0 {
        return raster;
    }

    let total: u64 = raster.pixels().map(|p| luminance(p) as u64).sum();
    let mean = ((total as f64 / count as f64) + 0.5).floor() as f32;

    for pixel in raster.pixels_mut() {
        for channel in 0..3 {
            let value = mean + factor * (pixel[channel] as f32 - mean);
            pixel[channel] = value.round().clamp(0.0, 255.0) as u8;
        }
    }

    raster
}

fn luminance(pixel: &Rgba<u8>) -> u32 {
    (pixel[0] as u32 * 299 + pixel[1] as u32 * 587 + pixel[2] as u32 * 114) / 1000
}

/// Channel layout of the decoded source, restored on encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorShape {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
}

impl ColorShape {
    fn of(image: &DynamicImage) -> Self {
        let color = image.color();
        match (color.has_color(), color.has_alpha()) {
            (false, false) => ColorShape::Gray,
            (false, true) => ColorShape::GrayAlpha,
            (true, false) => ColorShape::Rgb,
            (true, true) => ColorShape::Rgba,
        }
    }
}

fn encode(raster: RgbaImage, format: ImageFormat, shape: ColorShape) -> Result<Vec<u8>> {
    let image = DynamicImage::ImageRgba8(raster);
    let image = match (format, shape) {
        // JPEG has no alpha channel
        (ImageFormat::Jpeg, ColorShape::Gray | ColorShape::GrayAlpha) => {
            DynamicImage::ImageLuma8(image.to_luma8())
        }
        (ImageFormat::Jpeg, _) => DynamicImage::ImageRgb8(image.to_rgb8()),
        (ImageFormat::Gif, _) => image,
        (_, ColorShape::Gray) => DynamicImage::ImageLuma8(image.to_luma8()),
        (_, ColorShape::GrayAlpha) => DynamicImage::ImageLumaA8(image.to_luma_alpha8()),
        (_, ColorShape::Rgb) => DynamicImage::ImageRgb8(image.to_rgb8()),
        (_, ColorShape::Rgba) => image,
    };

    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, format)
        .map_err(|e| PipelineError::ProcessingFailed(format!("encode {format:?}: {e}")))?;

    Ok(cursor.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    pub(crate) fn checkerboard(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    pub(crate) fn encode_as(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut cursor, format)
            .unwrap();
        cursor.into_inner()
    }

    pub(crate) fn png(image: &RgbImage) -> Vec<u8> {
        encode_as(image, ImageFormat::Png)
    }

    fn decode(bytes: &[u8]) -> DynamicImage {
        image::load_from_memory(bytes).unwrap()
    }

    fn variance(image: &RgbImage) -> f64 {
        let values: Vec<f64> = image.pixels().map(|p| p[0] as f64).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
    }

    #[test]
    fn test_zero_passes_is_identity() {
        let source = gradient(32, 24);
        let bytes = png(&source);

        for token in ["CONTOUR", "DETAIL", "EDGE_ENHANCE", "EMBOSS", "SMOOTH"] {
            let output = apply(&bytes, token, 0, 1.0).unwrap();
            assert_eq!(output.format, "png");
            assert_eq!(decode(&output.bytes).to_rgb8(), source, "{token} with strength 0");
        }
    }

    #[test]
    fn test_unknown_token_passes_through() {
        let source = gradient(20, 20);
        let bytes = png(&source);

        // Tokens are case-sensitive, so lower-case "blur" is not BLUR
        for token in ["VINTAGE", "blur", ""] {
            let output = apply(&bytes, token, 9, 1.0).unwrap();
            assert_eq!(decode(&output.bytes).to_rgb8(), source);
        }
        assert_eq!(FilterKind::from_token("blur"), FilterKind::PassThrough);
    }

    #[test]
    fn test_unknown_token_after_resize_matches_plain_resize() {
        let bytes = png(&gradient(40, 40));
        let resized_only = apply(&bytes, "NOPE", 3, 0.5).unwrap();
        let zero_pass = apply(&bytes, "EMBOSS", 0, 0.5).unwrap();

        assert_eq!(
            decode(&resized_only.bytes).to_rgb8(),
            decode(&zero_pass.bytes).to_rgb8()
        );
    }

    #[test]
    fn test_resize_factor_one_keeps_dimensions() {
        let bytes = png(&gradient(37, 19));
        let output = apply(&bytes, "SMOOTH", 2, 1.0).unwrap();
        assert_eq!((output.width, output.height), (37, 19));
        assert_eq!(decode(&output.bytes).dimensions(), (37, 19));
    }

    #[test]
    fn test_resize_rounds_down() {
        let bytes = png(&gradient(101, 51));
        let output = apply(&bytes, "BLUR", 0, 0.5).unwrap();
        assert_eq!((output.width, output.height), (50, 25));

        let output = apply(&bytes, "BLUR", 0, 1.5).unwrap();
        assert_eq!((output.width, output.height), (151, 76));
    }

    #[test]
    fn test_blur_scenario() {
        let source = checkerboard(100, 100);
        let output = apply(&png(&source), "BLUR", 10, 1.0).unwrap();

        assert_eq!(output.format, "png");
        let blurred = decode(&output.bytes);
        assert_eq!(blurred.dimensions(), (100, 100));
        assert!(!blurred.color().has_alpha());
        assert!(variance(&blurred.to_rgb8()) < variance(&source) / 4.0);
        assert_eq!(blur_sigma(10), 5.0);
    }

    #[test]
    fn test_sharpen_parameters() {
        let params = SharpenParams::for_strength(20);
        assert!((params.radius - 20.0 / 3.0).abs() < 1e-5);
        assert_eq!(params.percent, 500);
        assert_eq!(params.threshold, 3);

        let params = SharpenParams::for_strength(2);
        assert_eq!(params.radius, 1.0);
        assert_eq!(params.percent, 100);
    }

    #[test]
    fn test_sharpen_increases_local_contrast() {
        let source = RgbImage::from_fn(30, 30, |x, _| {
            if x < 15 {
                Rgb([100, 100, 100])
            } else {
                Rgb([150, 150, 150])
            }
        });
        let output = apply(&png(&source), "SHARPEN", 6, 1.0).unwrap();
        let sharpened = decode(&output.bytes).to_rgb8();

        // Overshoot on both sides of the step
        assert!(sharpened.get_pixel(14, 15)[0] < 100);
        assert!(sharpened.get_pixel(15, 15)[0] > 150);
        // Flat regions far from the edge stay put
        assert_eq!(sharpened.get_pixel(2, 15)[0], 100);
    }

    #[test]
    fn test_contour_of_flat_image_is_white() {
        let source = RgbImage::from_pixel(10, 10, Rgb([90, 40, 200]));
        let output = apply(&png(&source), "CONTOUR", 1, 1.0).unwrap();
        let contoured = decode(&output.bytes).to_rgb8();
        assert!(contoured.pixels().all(|p| *p == Rgb([255, 255, 255])));
    }

    #[test]
    fn test_emboss_of_flat_image_is_mid_gray() {
        let source = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let output = apply(&png(&source), "EMBOSS", 3, 1.0).unwrap();
        let embossed = decode(&output.bytes).to_rgb8();
        assert!(embossed.pixels().all(|p| *p == Rgb([128, 128, 128])));
    }

    #[test]
    fn test_edges_with_zero_strength_flattens() {
        let output = apply(&png(&checkerboard(16, 16)), "EDGES", 0, 1.0).unwrap();
        let flat = decode(&output.bytes).to_rgb8();
        let first = *flat.get_pixel(0, 0);
        assert!(flat.pixels().all(|p| *p == first));
    }

    #[test]
    fn test_alpha_survives_convolution() {
        let source = image::RgbaImage::from_fn(12, 12, |x, _| Rgba([50, 60, 70, (x * 20) as u8]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(source.clone())
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();

        let output = apply(cursor.get_ref(), "DETAIL", 2, 1.0).unwrap();
        let detailed = decode(&output.bytes).to_rgba8();
        for (out, original) in detailed.pixels().zip(source.pixels()) {
            assert_eq!(out[3], original[3]);
        }
    }

    #[test]
    fn test_jpeg_stays_jpeg() {
        let bytes = encode_as(&gradient(64, 48), ImageFormat::Jpeg);
        let output = apply(&bytes, "EMBOSS", 1, 1.0).unwrap();

        assert_eq!(output.format, "jpeg");
        assert_eq!(image::guess_format(&output.bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!(decode(&output.bytes).dimensions(), (64, 48));
    }

    #[test]
    fn test_bmp_round_trip_format() {
        let bytes = encode_as(&gradient(10, 10), ImageFormat::Bmp);
        let output = apply(&bytes, "SMOOTH", 1, 2.0).unwrap();
        assert_eq!(output.format, "bmp");
        assert_eq!(decode(&output.bytes).dimensions(), (20, 20));
        assert_eq!(detect_format(&output.bytes), Some("bmp"));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let result = apply(b"definitely not an image", "BLUR", 5, 1.0);
        assert!(matches!(result, Err(PipelineError::Decode(_))));

        let mut truncated = png(&gradient(10, 10));
        truncated.truncate(30);
        assert!(matches!(
            apply(&truncated, "BLUR", 5, 1.0),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn test_invalid_resize_factor() {
        let bytes = png(&gradient(10, 10));
        for factor in [0.0, -1.0, f64::NAN, f64::INFINITY, 0.01] {
            assert!(matches!(
                apply(&bytes, "BLUR", 1, factor),
                Err(PipelineError::InvalidParameters(_))
            ));
        }
    }

    #[test]
    fn test_filter_params_default() {
        let params = FilterParams::default();
        assert_eq!(params.kind(), FilterKind::Blur);
        assert_eq!(params.strength, 5);
    }

    #[test]
    fn test_sharpen_channel_rounds_fractional_gain() {
        // 100 + 3 * 0.5 = 101.5
        assert_eq!(sharpen_channel(100, 97, 50, 3), 102);
        assert_eq!(sharpen_channel(100, 103, 50, 3), 99);
        assert_eq!(sharpen_channel(250, 200, 500, 3), 255);
        assert_eq!(sharpen_channel(10, 60, 500, 3), 0);
    }

    #[test]
    fn test_sharpen_channel_ignores_diff_below_threshold() {
        assert_eq!(sharpen_channel(100, 98, 500, 3), 100);
        assert_eq!(sharpen_channel(100, 102, 500, 3), 100);
    }

    #[test]
    fn test_validate_request_checks_output_size() {
        let bytes = png(&checkerboard(4, 4));
        assert!(validate_request(&bytes, 0.5).is_ok());
        assert!(validate_request(&bytes, 1.0).is_ok());
        assert!(matches!(
            validate_request(&bytes, 0.1),
            Err(PipelineError::InvalidParameters(_))
        ));
        assert!(matches!(
            validate_request(&bytes, 6000.0),
            Err(PipelineError::InvalidParameters(_))
        ));
        assert!(matches!(
            validate_request(&bytes, -1.0),
            Err(PipelineError::InvalidParameters(_))
        ));
        assert!(matches!(
            validate_request(b"not an image", 0.5),
            Err(PipelineError::Decode(_))
        ));
    }
}
