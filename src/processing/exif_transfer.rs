//! Carrying EXIF from a source file into its optimized output
//!
//! The source block is parsed once, before the source bytes are released,
//! and filtered according to [`ExifOptions`]. After encoding it is
//! re-serialized with the output dimensions and spliced into the JPEG,
//! PNG or WebP container.

use std::io::Cursor;

use exif::experimental::Writer;
use exif::{Context, Field, In, Tag, Value};
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::webp::WebP;
use img_parts::{Bytes, ImageEXIF};
use tracing::debug;

use crate::config::{ExifOptions, OutputFormat};
use crate::error::MetadataError;

/// Filtered EXIF fields of one source image
#[derive(Debug, Clone)]
pub struct ExifPayload {
    fields: Vec<Field>,
    little_endian: bool,
    thumbnail: Option<Vec<u8>>,
}

impl ExifPayload {
    /// Parse and filter the EXIF block of `source`.
    ///
    /// `Ok(None)` when preservation is disabled, the source has no EXIF, or
    /// nothing is left after filtering.
    pub fn read(source: &[u8], options: &ExifOptions) -> Result<Option<Self>, MetadataError> {
        if !options.preserve_all {
            return Ok(None);
        }

        let parsed = match exif::Reader::new().read_from_container(&mut Cursor::new(source)) {
            Ok(parsed) => parsed,
            Err(exif::Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(MetadataError::Read(e)),
        };

        let thumbnail = if options.strip_thumbnail {
            None
        } else {
            embedded_thumbnail(&parsed)
        };

        let mut fields: Vec<Field> = parsed
            .fields()
            .filter(|field| keep_field(field, options, thumbnail.is_some()))
            .map(|field| rewrite_field(field, options))
            .collect();

        if fields.is_empty() {
            return Ok(None);
        }
        if options.update_software && parsed.get_field(Tag::Software, In::PRIMARY).is_none() {
            fields.push(software_field());
        }

        Ok(Some(Self {
            fields,
            little_endian: parsed.little_endian(),
            thumbnail,
        }))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail.is_some()
    }

    /// Serialize to a bare TIFF block, recording the output pixel size
    pub fn to_tiff(&self, dimensions: (u32, u32)) -> Result<Vec<u8>, MetadataError> {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|field| with_dimensions(field, dimensions))
            .collect();

        let mut writer = Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        if let Some(thumbnail) = &self.thumbnail {
            writer.set_jpeg(thumbnail, In::THUMBNAIL);
        }

        let mut tiff = Cursor::new(Vec::new());
        writer
            .write(&mut tiff, self.little_endian)
            .map_err(MetadataError::Write)?;
        Ok(tiff.into_inner())
    }

    /// Splice this payload into freshly encoded output bytes
    pub fn embed(
        &self,
        encoded: &[u8],
        format: OutputFormat,
        dimensions: (u32, u32),
    ) -> Result<Vec<u8>, MetadataError> {
        let tiff = Bytes::from(self.to_tiff(dimensions)?);
        let encoded = Bytes::copy_from_slice(encoded);
        let label = format.mime_type();
        let container = |source| MetadataError::Container { format: label, source };

        let mut output = Vec::with_capacity(encoded.len() + tiff.len() + 16);
        let written = match format {
            OutputFormat::Jpeg => {
                let mut jpeg = Jpeg::from_bytes(encoded).map_err(container)?;
                jpeg.set_exif(Some(tiff));
                jpeg.encoder().write_to(&mut output)
            }
            OutputFormat::Png => {
                let mut png = Png::from_bytes(encoded).map_err(container)?;
                png.set_exif(Some(tiff));
                png.encoder().write_to(&mut output)
            }
            OutputFormat::WebP => {
                let mut webp = WebP::from_bytes(encoded).map_err(container)?;
                webp.set_exif(Some(tiff));
                webp.encoder().write_to(&mut output)
            }
        };
        written.map_err(|source| MetadataError::Io { format: label, source })?;

        debug!("Embedded {} EXIF fields into {} output", self.fields.len(), label);
        Ok(output)
    }
}

fn keep_field(field: &Field, options: &ExifOptions, keep_thumbnail: bool) -> bool {
    if matches!(field.value, Value::Unknown(..)) {
        return false;
    }
    if is_structural(field.tag) {
        return false;
    }
    if field.ifd_num == In::THUMBNAIL {
        if !keep_thumbnail {
            return false;
        }
    } else if field.ifd_num != In::PRIMARY {
        return false;
    }
    if options.strip_gps && field.tag.context() == Context::Gps {
        return false;
    }
    if !options.preserve_copyright && field.tag == Tag::Copyright {
        return false;
    }
    true
}

/// Offsets and pointers the writer synthesizes from the layout it produces
fn is_structural(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::ExifIFDPointer
            | Tag::GPSInfoIFDPointer
            | Tag::InteropIFDPointer
            | Tag::StripOffsets
            | Tag::StripByteCounts
            | Tag::TileOffsets
            | Tag::TileByteCounts
            | Tag::JPEGInterchangeFormat
            | Tag::JPEGInterchangeFormatLength
    )
}

fn rewrite_field(field: &Field, options: &ExifOptions) -> Field {
    if options.update_software && field.tag == Tag::Software && field.ifd_num == In::PRIMARY {
        return software_field();
    }
    field.clone()
}

fn software_field() -> Field {
    Field {
        tag: Tag::Software,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![software_name().into_bytes()]),
    }
}

fn with_dimensions(field: &Field, (width, height): (u32, u32)) -> Field {
    let value = match (field.tag, field.ifd_num) {
        (Tag::PixelXDimension, In::PRIMARY) => Value::Long(vec![width]),
        (Tag::PixelYDimension, In::PRIMARY) => Value::Long(vec![height]),
        _ => return field.clone(),
    };
    Field {
        tag: field.tag,
        ifd_num: field.ifd_num,
        value,
    }
}

/// JPEG thumbnail bytes referenced by IFD1, when present and in bounds
fn embedded_thumbnail(parsed: &exif::Exif) -> Option<Vec<u8>> {
    let offset = parsed
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let length = parsed
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    parsed
        .buf()
        .get(offset..offset.checked_add(length)?)
        .map(<[u8]>::to_vec)
}

/// Value written to the Software tag
pub fn software_name() -> String {
    format!("IronPress {}", crate::VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::codec::{encode, QualityParams};
    use crate::config::CompressionProfile;
    use exif::Rational;
    use image::{DynamicImage, Rgb, RgbImage};

    fn field(tag: Tag, value: Value) -> Field {
        Field {
            tag,
            ifd_num: In::PRIMARY,
            value,
        }
    }

    fn tagged_jpeg() -> Vec<u8> {
        let img = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 7) as u8, (y * 9) as u8, 40]));
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let fields = [
            field(Tag::Make, Value::Ascii(vec![b"Nikon".to_vec()])),
            field(Tag::Software, Value::Ascii(vec![b"Camera 1.0".to_vec()])),
            field(Tag::Copyright, Value::Ascii(vec![b"J. Doe".to_vec()])),
            field(Tag::Orientation, Value::Short(vec![8])),
            field(Tag::PixelXDimension, Value::Long(vec![32])),
            field(Tag::GPSLatitudeRef, Value::Ascii(vec![b"N".to_vec()])),
            field(
                Tag::GPSLatitude,
                Value::Rational(vec![
                    Rational { num: 48, denom: 1 },
                    Rational { num: 51, denom: 1 },
                    Rational { num: 0, denom: 1 },
                ]),
            ),
        ];
        let mut writer = Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, true).unwrap();

        let mut container = Jpeg::from_bytes(jpeg.into()).unwrap();
        container.set_exif(Some(tiff.into_inner().into()));
        let mut out = Vec::new();
        container.encoder().write_to(&mut out).unwrap();
        out
    }

    fn read_back(bytes: &[u8]) -> exif::Exif {
        exif::Reader::new()
            .read_from_container(&mut Cursor::new(bytes))
            .unwrap()
    }

    fn ascii(parsed: &exif::Exif, tag: Tag) -> Option<String> {
        parsed
            .get_field(tag, In::PRIMARY)
            .map(|f| f.display_value().to_string().trim_matches('"').to_string())
    }

    fn small_output(format: OutputFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 12, Rgb([10, 120, 200])));
        encode(&img, format, QualityParams::for_profile(CompressionProfile::Balanced, format)).unwrap()
    }

    #[test]
    fn test_read_keeps_camera_fields() {
        let payload = ExifPayload::read(&tagged_jpeg(), &ExifOptions::default())
            .unwrap()
            .unwrap();
        assert!(!payload.is_empty());
        assert!(!payload.has_thumbnail());

        let output = payload
            .embed(&small_output(OutputFormat::Jpeg), OutputFormat::Jpeg, (16, 12))
            .unwrap();
        let parsed = read_back(&output);

        assert_eq!(ascii(&parsed, Tag::Make).as_deref(), Some("Nikon"));
        assert_eq!(ascii(&parsed, Tag::Copyright).as_deref(), Some("J. Doe"));
        assert_eq!(ascii(&parsed, Tag::Software), Some(software_name()));
        let orientation = parsed.get_field(Tag::Orientation, In::PRIMARY).unwrap();
        assert_eq!(orientation.value.get_uint(0), Some(8));
        let width = parsed.get_field(Tag::PixelXDimension, In::PRIMARY).unwrap();
        assert_eq!(width.value.get_uint(0), Some(16));
        assert!(parsed.get_field(Tag::GPSLatitude, In::PRIMARY).is_some());
    }

    #[test]
    fn test_strip_gps_and_copyright() {
        let options = ExifOptions {
            strip_gps: true,
            preserve_copyright: false,
            update_software: false,
            ..ExifOptions::default()
        };
        let payload = ExifPayload::read(&tagged_jpeg(), &options).unwrap().unwrap();
        let output = payload
            .embed(&small_output(OutputFormat::WebP), OutputFormat::WebP, (16, 12))
            .unwrap();
        let parsed = read_back(&output);

        assert!(parsed.get_field(Tag::GPSLatitude, In::PRIMARY).is_none());
        assert!(parsed.get_field(Tag::GPSLatitudeRef, In::PRIMARY).is_none());
        assert!(parsed.get_field(Tag::Copyright, In::PRIMARY).is_none());
        assert_eq!(ascii(&parsed, Tag::Software).as_deref(), Some("Camera 1.0"));
        assert_eq!(ascii(&parsed, Tag::Make).as_deref(), Some("Nikon"));
    }

    #[test]
    fn test_embed_into_png() {
        let payload = ExifPayload::read(&tagged_jpeg(), &ExifOptions::default())
            .unwrap()
            .unwrap();
        let output = payload
            .embed(&small_output(OutputFormat::Png), OutputFormat::Png, (16, 12))
            .unwrap();
        assert_eq!(ascii(&read_back(&output), Tag::Make).as_deref(), Some("Nikon"));
    }

    #[test]
    fn test_disabled_or_missing_exif() {
        assert!(ExifPayload::read(&tagged_jpeg(), &ExifOptions::strip_all())
            .unwrap()
            .is_none());
        assert!(ExifPayload::read(&small_output(OutputFormat::Jpeg), &ExifOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_gps_only_block_is_dropped_when_stripping() {
        let mut writer = Writer::new();
        let lat_ref = field(Tag::GPSLatitudeRef, Value::Ascii(vec![b"S".to_vec()]));
        writer.push_field(&lat_ref);
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, false).unwrap();

        let mut jpeg = Jpeg::from_bytes(small_output(OutputFormat::Jpeg).into()).unwrap();
        jpeg.set_exif(Some(tiff.into_inner().into()));
        let mut source = Vec::new();
        jpeg.encoder().write_to(&mut source).unwrap();

        let options = ExifOptions {
            strip_gps: true,
            ..ExifOptions::default()
        };
        assert!(ExifPayload::read(&source, &options).unwrap().is_none());
    }

    #[test]
    fn test_garbage_output_is_a_container_error() {
        let payload = ExifPayload::read(&tagged_jpeg(), &ExifOptions::default())
            .unwrap()
            .unwrap();
        let err = payload
            .embed(b"definitely not a jpeg", OutputFormat::Jpeg, (1, 1))
            .unwrap_err();
        assert!(matches!(err, MetadataError::Container { .. }));
    }
}
