//! Codec adapter: encoded bytes to pixel buffers and back
//!
//! Decoding goes through the `image` crate. Encoding uses the
//! format-specific libraries directly so that quality and lossless modes can
//! be controlled: `image`'s JPEG encoder, libwebp through `webp`, and for PNG
//! `imagequant` palette reduction followed by an `oxipng` pass.
//!
//! Nothing in here touches the filesystem.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageError, ImageReader, Limits};
use tracing::debug;

use crate::config::{CompressionProfile, OutputFormat};
use crate::error::{DecodeError, EncodeError};
use crate::processing::formats::{detect_format_from_header, format_from_mime};

/// Decoded pixels shared by every pipeline stage
pub type PixelBuffer = DynamicImage;

/// Default decoder side limit
pub const MAX_IMAGE_DIMENSION: u32 = 16_384;

/// libwebp refuses anything larger than this on either side
const WEBP_MAX_DIMENSION: u32 = 16_383;

/// JPEG markers store dimensions as u16
const JPEG_MAX_DIMENSION: u32 = 65_535;

/// Encoder settings derived from a compression profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    /// 1-100; for lossless WebP this is the compression effort
    pub quality: u8,
    pub lossless: bool,
}

impl QualityParams {
    /// Fixed quality table per output format
    pub fn for_profile(profile: CompressionProfile, format: OutputFormat) -> Self {
        let quality = match (format, profile) {
            (_, CompressionProfile::Lossless) => {
                return Self {
                    quality: 100,
                    lossless: true,
                }
            }
            // Upper bound handed to the palette quantizer
            (OutputFormat::Png, CompressionProfile::Smallest) => 70,
            (OutputFormat::Png, CompressionProfile::Balanced) => 85,
            (OutputFormat::Png, CompressionProfile::BestQuality) => 95,
            (_, CompressionProfile::Smallest) => 65,
            (_, CompressionProfile::Balanced) => 80,
            (_, CompressionProfile::BestQuality) => 92,
        };

        Self {
            quality,
            lossless: false,
        }
    }
}

/// Decode with the default dimension limit
pub fn decode(bytes: &[u8], mimetype: &str) -> Result<PixelBuffer, DecodeError> {
    decode_with_limit(bytes, mimetype, MAX_IMAGE_DIMENSION)
}

/// Decode JPEG, PNG or WebP bytes.
///
/// Magic bytes win over the declared MIME type so that mislabeled files still
/// reach the right decoder.
pub fn decode_with_limit(
    bytes: &[u8],
    mimetype: &str,
    max_dimension: u32,
) -> Result<PixelBuffer, DecodeError> {
    let format = detect_format_from_header(bytes)
        .or_else(|| format_from_mime(mimetype))
        .ok_or_else(|| DecodeError::Unsupported(mimetype.to_string()))?;

    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(map_image_error)?;

    if width > max_dimension || height > max_dimension {
        return Err(DecodeError::TooLarge {
            width,
            height,
            limit: max_dimension,
        });
    }

    let mut limits = Limits::no_limits();
    limits.max_image_width = Some(max_dimension);
    limits.max_image_height = Some(max_dimension);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(limits);
    let image = reader.decode().map_err(map_image_error)?;

    debug!(
        "Decoded {:?} {}x{} ({:?})",
        format,
        width,
        height,
        image.color()
    );

    Ok(image)
}

fn map_image_error(err: ImageError) -> DecodeError {
    match err {
        ImageError::Unsupported(e) => DecodeError::Unsupported(e.to_string()),
        other => DecodeError::Corrupt(other.to_string()),
    }
}

/// Encode a pixel buffer into the target format
pub fn encode(
    buffer: &PixelBuffer,
    format: OutputFormat,
    quality: QualityParams,
) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = buffer.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::InvalidDimensions {
            format: format.name(),
            width,
            height,
            reason: "image has no pixels".to_string(),
        });
    }

    let encoded = match format {
        OutputFormat::Jpeg => encode_jpeg(buffer, quality.quality)?,
        OutputFormat::Png if quality.lossless => encode_png_lossless(buffer)?,
        OutputFormat::Png => match encode_png_quantized(buffer, quality.quality)? {
            Some(indexed) => indexed,
            None => {
                debug!("Palette cannot reach the quality floor, keeping truecolor");
                encode_png_lossless(buffer)?
            }
        },
        OutputFormat::WebP => encode_webp(buffer, quality)?,
    };

    debug!(
        "Encoded {}x{} as {} (quality {}, lossless {}): {} bytes",
        width,
        height,
        format,
        quality.quality,
        quality.lossless,
        encoded.len()
    );

    Ok(encoded)
}

fn encode_jpeg(buffer: &PixelBuffer, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = buffer.dimensions();
    if width > JPEG_MAX_DIMENSION || height > JPEG_MAX_DIMENSION {
        return Err(EncodeError::InvalidDimensions {
            format: "jpeg",
            width,
            height,
            reason: format!("JPEG sides are limited to {JPEG_MAX_DIMENSION}px"),
        });
    }

    // JPEG has no alpha channel
    let rgb = buffer.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| EncodeError::failed("jpeg", e.to_string()))?;
    Ok(out)
}

fn encode_png_lossless(buffer: &PixelBuffer) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    buffer
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| EncodeError::failed("png", e.to_string()))?;
    recompress_png(&out)
}

/// Palette-quantize to at most 256 colors, write an indexed PNG, recompress.
///
/// Returns `None` when no palette reaches half of `max_quality`.
fn encode_png_quantized(buffer: &PixelBuffer, max_quality: u8) -> Result<Option<Vec<u8>>, EncodeError> {
    let rgba = buffer.to_rgba8();
    let (width, height) = rgba.dimensions();

    let quant_err = |e: imagequant::Error| EncodeError::failed("png", format!("quantization failed: {e}"));

    let mut attributes = imagequant::Attributes::new();
    attributes
        .set_quality(max_quality.min(100) / 2, max_quality.min(100))
        .map_err(quant_err)?;

    let pixels: Vec<imagequant::RGBA> = rgba
        .pixels()
        .map(|p| imagequant::RGBA {
            r: p[0],
            g: p[1],
            b: p[2],
            a: p[3],
        })
        .collect();

    let mut image = attributes
        .new_image(pixels, width as usize, height as usize, 0.0)
        .map_err(quant_err)?;
    let mut quantized = match attributes.quantize(&mut image) {
        Ok(quantized) => quantized,
        Err(imagequant::Error::QualityTooLow) => return Ok(None),
        Err(e) => return Err(quant_err(e)),
    };
    let (palette, indices) = quantized.remapped(&mut image).map_err(quant_err)?;

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(
            palette
                .iter()
                .flat_map(|c| [c.r, c.g, c.b])
                .collect::<Vec<u8>>(),
        );
        if palette.iter().any(|c| c.a < u8::MAX) {
            encoder.set_trns(palette.iter().map(|c| c.a).collect::<Vec<u8>>());
        }

        let mut writer = encoder
            .write_header()
            .map_err(|e| EncodeError::failed("png", e.to_string()))?;
        writer
            .write_image_data(&indices)
            .map_err(|e| EncodeError::failed("png", e.to_string()))?;
        writer
            .finish()
            .map_err(|e| EncodeError::failed("png", e.to_string()))?;
    }

    recompress_png(&out).map(Some)
}

/// Lossless deflate/filter optimization pass
fn recompress_png(data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut options = oxipng::Options::from_preset(2);
    options.strip = oxipng::StripChunks::Safe;
    oxipng::optimize_from_memory(data, &options)
        .map_err(|e| EncodeError::failed("png", format!("recompression failed: {e}")))
}

fn encode_webp(buffer: &PixelBuffer, quality: QualityParams) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = buffer.dimensions();
    if width > WEBP_MAX_DIMENSION || height > WEBP_MAX_DIMENSION {
        return Err(EncodeError::InvalidDimensions {
            format: "webp",
            width,
            height,
            reason: format!("WebP sides are limited to {WEBP_MAX_DIMENSION}px"),
        });
    }

    let q = f32::from(quality.quality.clamp(1, 100));

    // Skip the alpha plane when the source has none
    let memory = if buffer.color().has_alpha() {
        let rgba = buffer.to_rgba8();
        webp::Encoder::from_rgba(&rgba, width, height).encode_simple(quality.lossless, q)
    } else {
        let rgb = buffer.to_rgb8();
        webp::Encoder::from_rgb(&rgb, width, height).encode_simple(quality.lossless, q)
    }
    .map_err(|e| EncodeError::failed("webp", format!("{e:?}")))?;

    Ok(memory.to_vec())
}
