//! Named option presets for common use cases

use std::collections::HashMap;

use crate::config::options::{
    ColorIntent, CompressionProfile, ExifOptions, OptimizationOptions, OutputFormat, ResizePreset,
};

/// Predefined presets
pub struct Profiles;

impl Profiles {
    /// Web publishing: WebP, Full HD bound
    pub fn web() -> OptimizationOptions {
        OptimizationOptions::new()
            .format(OutputFormat::WebP)
            .profile(CompressionProfile::Balanced)
            .resize(ResizePreset::FullHd)
            .intent(ColorIntent::Perceptual)
    }

    /// Email attachments: small JPEGs readable everywhere, without location
    pub fn email() -> OptimizationOptions {
        OptimizationOptions::new()
            .format(OutputFormat::Jpeg)
            .profile(CompressionProfile::Smallest)
            .resize(ResizePreset::Hd)
            .exif(ExifOptions {
                strip_gps: true,
                ..ExifOptions::default()
            })
    }

    /// Archival copies: lossless PNG at original size
    pub fn archive() -> OptimizationOptions {
        OptimizationOptions::new()
            .format(OutputFormat::Png)
            .profile(CompressionProfile::Lossless)
            .resize(ResizePreset::None)
            .intent(ColorIntent::RelativeColorimetric)
    }

    /// Print proofs: high quality JPEG with exact color reproduction
    pub fn proof() -> OptimizationOptions {
        OptimizationOptions::new()
            .format(OutputFormat::Jpeg)
            .profile(CompressionProfile::BestQuality)
            .resize(ResizePreset::Uhd4k)
            .intent(ColorIntent::AbsoluteColorimetric)
    }

    /// Get all predefined presets
    pub fn all() -> HashMap<String, OptimizationOptions> {
        let mut profiles = HashMap::new();
        profiles.insert("web".to_string(), Self::web());
        profiles.insert("email".to_string(), Self::email());
        profiles.insert("archive".to_string(), Self::archive());
        profiles.insert("proof".to_string(), Self::proof());
        profiles
    }

    /// One-line description used by `ironpress profiles`
    pub fn describe(options: &OptimizationOptions) -> String {
        let resize = match options.resize_preset.bounds() {
            Some((w, h)) => format!("fit {w}x{h}"),
            None => "original size".to_string(),
        };
        let mut text = format!(
            "{} / {:?} / {} / {:?}",
            options.output_format, options.compression_profile, resize, options.color_intent
        );
        if !options.exif.preserve_all {
            text.push_str(" / no EXIF");
        } else if options.exif.strip_gps {
            text.push_str(" / no GPS");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_profiles() {
        let all_profiles = Profiles::all();
        assert_eq!(all_profiles.len(), 4);

        for profile in all_profiles.values() {
            assert!(profile.validate().is_ok());
        }
    }

    #[test]
    fn test_describe() {
        let text = Profiles::describe(&Profiles::web());
        assert!(text.starts_with("webp"));
        assert!(text.contains("fit 1920x1080"));
        assert!(!text.contains("GPS"));

        assert!(Profiles::describe(&Profiles::email()).ends_with("no GPS"));
    }
}
