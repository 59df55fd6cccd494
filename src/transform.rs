//! Image decode, resize and re-encode.
//!
//! The optimizer never decides whether a failure is fatal: callers fall back
//! to the original bytes when anything in here errors, so the worst outcome
//! of a broken image is an unoptimised response.

pub mod params;

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::metadata::Orientation;
use image::{
    DynamicImage, ExtendedColorType, GenericImageView, ImageDecoder, ImageEncoder, ImageReader,
};
use thiserror::Error;

use crate::transform::params::{FitMode, OutputFormat, TransformOptions, DEFAULT_QUALITY};

/// Decoded pixel budget; roughly a 16384x16384 image. Checked against the
/// header-reported dimensions before any pixel memory is allocated.
pub const MAX_DECODED_PIXELS: u64 = 268_435_456;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("image dimensions {width}x{height} exceed the decode pixel budget")]
    DecodeBudgetExceeded { width: u32, height: u32 },
}

#[derive(Debug)]
pub struct OptimizedImage {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Applies the requested transform to `bytes`.
///
/// An empty option set is a passthrough: the bytes are returned unchanged
/// with the content type taken from the format probe. Otherwise the image is
/// decoded (honouring the EXIF orientation, which the re-encode then
/// discards along with the rest of the metadata), resized without ever
/// upscaling, and encoded in the requested format.
pub fn optimize(bytes: &[u8], options: &TransformOptions) -> Result<OptimizedImage, TransformError> {
    let (width, height) = probe_dimensions(bytes)?;
    if u64::from(width) * u64::from(height) > MAX_DECODED_PIXELS {
        return Err(TransformError::DecodeBudgetExceeded { width, height });
    }

    if options.is_noop() {
        let format = image::guess_format(bytes)
            .map_err(|e| TransformError::Decode(e.to_string()))?;
        return Ok(OptimizedImage {
            bytes: Bytes::copy_from_slice(bytes),
            content_type: format.to_mime_type(),
            width,
            height,
        });
    }

    let (img, decoded_format) = decode_oriented(bytes)?;
    let img = resize_with_fit(
        img,
        options.width,
        options.height,
        options.fit.unwrap_or(FitMode::Inside),
    );

    let target = match options.format {
        Some(OutputFormat::Original) | None => encoder_for(decoded_format),
        Some(explicit) => explicit,
    };
    let quality = options.quality.unwrap_or(DEFAULT_QUALITY);
    let (out, content_type) = encode(&img, target, quality)?;

    Ok(OptimizedImage {
        bytes: Bytes::from(out),
        content_type,
        width: img.width(),
        height: img.height(),
    })
}

/// Reads the dimensions from the container header without decoding pixels.
fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), TransformError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TransformError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| TransformError::Decode(e.to_string()))
}

fn decode_oriented(bytes: &[u8]) -> Result<(DynamicImage, image::ImageFormat), TransformError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| TransformError::Decode("unrecognised image format".into()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder)
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    img.apply_orientation(orientation);
    Ok((img, format))
}

/// Maps a decoded container format to the encoder used when no explicit
/// format directive is present. Formats without a matching encoder re-encode
/// as PNG.
fn encoder_for(format: image::ImageFormat) -> OutputFormat {
    match format {
        image::ImageFormat::Jpeg => OutputFormat::Jpeg,
        image::ImageFormat::WebP => OutputFormat::Webp,
        image::ImageFormat::Avif => OutputFormat::Avif,
        _ => OutputFormat::Png,
    }
}

/// Downscale-only resize. The requested box is clamped to the source
/// dimensions first, so a larger target leaves the image at its original
/// size regardless of fit mode.
fn resize_with_fit(
    img: DynamicImage,
    width: Option<u32>,
    height: Option<u32>,
    fit: FitMode,
) -> DynamicImage {
    if width.is_none() && height.is_none() {
        return img;
    }
    let (orig_w, orig_h) = img.dimensions();
    let target_w = width.unwrap_or(orig_w).min(orig_w);
    let target_h = height.unwrap_or(orig_h).min(orig_h);

    // Lanczos3 for quality on downsampling paths.
    let filter = image::imageops::FilterType::Lanczos3;
    match fit {
        FitMode::Inside | FitMode::Contain => img.resize(target_w, target_h, filter),
        FitMode::Cover => img.resize_to_fill(target_w, target_h, filter),
        FitMode::Fill => img.resize_exact(target_w, target_h, filter),
        FitMode::Outside => {
            let scale = f64::max(
                f64::from(target_w) / f64::from(orig_w),
                f64::from(target_h) / f64::from(orig_h),
            )
            .min(1.0);
            let new_w = ((f64::from(orig_w) * scale).round() as u32).max(1);
            let new_h = ((f64::from(orig_h) * scale).round() as u32).max(1);
            img.resize_exact(new_w, new_h, filter)
        }
    }
}

fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<(Vec<u8>, &'static str), TransformError> {
    let mut out = Vec::new();
    let content_type = match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
            "image/jpeg"
        }
        OutputFormat::Webp => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let encoder = webp::Encoder::from_rgb(rgb.as_raw(), w, h);
            let encoded = encoder.encode(f32::from(quality.clamp(1, 100)));
            out.extend_from_slice(&encoded);
            "image/webp"
        }
        OutputFormat::Avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            // Speed 4 balances encoding time and compression ratio.
            let encoder = AvifEncoder::new_with_speed_quality(&mut out, 4, quality.clamp(1, 100));
            encoder
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
            "image/avif"
        }
        OutputFormat::Png => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let encoder = PngEncoder::new_with_quality(
                &mut out,
                CompressionType::Default,
                PngFilterType::Adaptive,
            );
            encoder
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
            "image/png"
        }
        OutputFormat::Original => {
            return Err(TransformError::Encode(
                "original format must be resolved before encoding".into(),
            ))
        }
    };
    Ok((out, content_type))
}
