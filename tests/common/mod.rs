//! Fixture images shared by the integration tests

#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use img_parts::png::Png;
use img_parts::ImageICC;
use ironpress::processing::{encode, QualityParams};
use ironpress::{CompressionProfile, OutputFormat};

/// Smooth gradient with a little texture, similar to a photo
pub fn photo(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let grain = ((x * 7 + y * 13) % 5) as u8 * 3;
        Rgb([
            ((x * 255) / width.max(1)) as u8 ^ grain,
            ((y * 255) / height.max(1)) as u8,
            (((x + y) * 127) / (width + height).max(1)) as u8 + grain,
        ])
    }))
}

pub fn jpeg_bytes(image: &DynamicImage, quality: u8) -> Vec<u8> {
    let mut out = Vec::new();
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
        .unwrap();
    out
}

pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// Embed an ICC profile into PNG bytes
pub fn with_icc(png: Vec<u8>, icc: Vec<u8>) -> Vec<u8> {
    let mut png = Png::from_bytes(png.into()).unwrap();
    png.set_icc_profile(Some(icc.into()));
    let mut out = Vec::new();
    png.encoder().write_to(&mut out).unwrap();
    out
}

/// A real, decodable 4x4 WebP
pub fn tiny_webp() -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([30, 60, 90])));
    let quality = QualityParams::for_profile(CompressionProfile::Balanced, OutputFormat::WebP);
    encode(&img, OutputFormat::WebP, quality).unwrap()
}

/// JPEG start-of-image and JFIF header followed by junk
pub fn corrupt_jpeg() -> Vec<u8> {
    let mut bytes = b"\xFF\xD8\xFF\xE0\x00\x10JFIF\x00\x01\x01\x00\x00\x01\x00\x01\x00\x00".to_vec();
    bytes.extend_from_slice(&[0x13; 512]);
    bytes
}

pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Write `count` high-quality JPEGs named `photo-N.jpg`
pub fn write_photos(dir: &Path, count: usize, width: u32, height: u32) -> Vec<PathBuf> {
    (0..count)
        .map(|i| write(dir, &format!("photo-{i}.jpg"), &jpeg_bytes(&photo(width, height), 95)))
        .collect()
}
