//! Per-batch optimization options and their validation

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{IronPressError, Result};

/// Suffix appended to the file stem of every optimized output
pub const OUTPUT_SUFFIX: &str = "-optimized";

/// Target encoding of the optimized file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    #[default]
    WebP,
}

impl OutputFormat {
    /// Get file extension for this format
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }

    /// Get MIME type for this format
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }

    /// Whether the format has a lossless encoding mode
    pub fn supports_lossless(self) -> bool {
        !matches!(self, Self::Jpeg)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Trade-off between output size and fidelity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionProfile {
    Smallest,
    #[default]
    Balanced,
    BestQuality,
    Lossless,
}

/// Bounding box the output must fit into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizePreset {
    #[default]
    None,
    #[serde(rename = "4k")]
    Uhd4k,
    #[serde(rename = "2k")]
    Qhd2k,
    #[serde(rename = "fullhd")]
    FullHd,
    Hd,
    Sd,
    Custom { width: u32, height: u32 },
}

impl ResizePreset {
    /// Bounding dimensions, `None` when no resize is requested
    pub fn bounds(self) -> Option<(u32, u32)> {
        match self {
            Self::None => None,
            Self::Uhd4k => Some((3840, 2160)),
            Self::Qhd2k => Some((2560, 1440)),
            Self::FullHd => Some((1920, 1080)),
            Self::Hd => Some((1280, 720)),
            Self::Sd => Some((854, 480)),
            Self::Custom { width, height } => Some((width, height)),
        }
    }
}

impl FromStr for ResizePreset {
    type Err = String;

    /// Accepts a preset name (`4k`, `fullhd`, ...) or `WIDTHxHEIGHT`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "original" => Ok(Self::None),
            "4k" | "uhd" => Ok(Self::Uhd4k),
            "2k" | "qhd" => Ok(Self::Qhd2k),
            "fullhd" | "1080p" => Ok(Self::FullHd),
            "hd" | "720p" => Ok(Self::Hd),
            "sd" | "480p" => Ok(Self::Sd),
            other => {
                let (w, h) = other.split_once('x').ok_or_else(|| {
                    format!("Unknown resize preset '{s}'. Use none, 4k, 2k, fullhd, hd, sd or WIDTHxHEIGHT")
                })?;
                let width = w.parse::<u32>().map_err(|_| "Invalid width value".to_string())?;
                let height = h.parse::<u32>().map_err(|_| "Invalid height value".to_string())?;
                if width == 0 || height == 0 {
                    return Err("Width and height must be greater than 0".to_string());
                }
                Ok(Self::Custom { width, height })
            }
        }
    }
}

/// Where optimized files are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    #[default]
    SameFolder,
    CustomFolder(PathBuf),
}

/// Rendering intent used when converting to sRGB
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorIntent {
    #[default]
    Perceptual,
    RelativeColorimetric,
    Saturation,
    AbsoluteColorimetric,
}

impl ColorIntent {
    pub const ALL: [ColorIntent; 4] = [
        Self::Perceptual,
        Self::RelativeColorimetric,
        Self::Saturation,
        Self::AbsoluteColorimetric,
    ];
}

/// Which EXIF fields survive into the optimized file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct ExifOptions {
    /// Copy the source EXIF at all; `false` writes outputs without metadata
    pub preserve_all: bool,
    /// Drop every GPS field
    pub strip_gps: bool,
    /// Drop the embedded thumbnail IFD
    pub strip_thumbnail: bool,
    /// Replace the Software tag with this program's name and version
    pub update_software: bool,
    pub preserve_copyright: bool,
}

impl Default for ExifOptions {
    fn default() -> Self {
        Self {
            preserve_all: true,
            strip_gps: false,
            strip_thumbnail: true,
            update_software: true,
            preserve_copyright: true,
        }
    }
}

impl ExifOptions {
    /// Write outputs without any EXIF
    pub fn strip_all() -> Self {
        Self {
            preserve_all: false,
            ..Self::default()
        }
    }
}

/// Immutable settings shared by every task of a batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OptimizationOptions {
    pub output_format: OutputFormat,
    pub compression_profile: CompressionProfile,
    pub resize_preset: ResizePreset,
    pub destination: Destination,
    pub color_intent: ColorIntent,
    pub exif: ExifOptions,
}

impl OptimizationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set output format
    pub fn format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Set compression profile
    pub fn profile(mut self, profile: CompressionProfile) -> Self {
        self.compression_profile = profile;
        self
    }

    /// Set resize preset
    pub fn resize(mut self, preset: ResizePreset) -> Self {
        self.resize_preset = preset;
        self
    }

    /// Set output destination
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set rendering intent
    pub fn intent(mut self, intent: ColorIntent) -> Self {
        self.color_intent = intent;
        self
    }

    /// Set EXIF handling
    pub fn exif(mut self, exif: ExifOptions) -> Self {
        self.exif = exif;
        self
    }

    /// Reject option combinations that cannot be honoured.
    ///
    /// Runs before any task is dispatched; a failure here is fatal for the
    /// whole batch.
    pub fn validate(&self) -> Result<()> {
        if self.compression_profile == CompressionProfile::Lossless
            && !self.output_format.supports_lossless()
        {
            return Err(IronPressError::config(format!(
                "Lossless compression is not available for {} output; choose png or webp",
                self.output_format
            )));
        }

        if let ResizePreset::Custom { width, height } = self.resize_preset {
            if width == 0 || height == 0 {
                return Err(IronPressError::config(
                    "Custom resize dimensions must be greater than 0",
                ));
            }
        }

        if let Destination::CustomFolder(folder) = &self.destination {
            if !folder.is_dir() {
                return Err(IronPressError::config(format!(
                    "Destination folder {} does not exist or is not a directory",
                    folder.display()
                )));
            }
        }

        Ok(())
    }

    /// Downgrade lossless JPEG to the best lossy profile instead of rejecting it
    pub fn corrected(mut self) -> Self {
        if self.compression_profile == CompressionProfile::Lossless
            && !self.output_format.supports_lossless()
        {
            warn!(
                "Lossless is not available for {}, using best_quality instead",
                self.output_format
            );
            self.compression_profile = CompressionProfile::BestQuality;
        }
        self
    }

    /// Compute `<stem>-optimized.<ext>` for a source file.
    ///
    /// The result never equals the source path. Batches with several
    /// sources sharing a stem go through [`crate::processing::OutputPlan`]
    /// instead, which numbers the later outputs.
    pub fn output_path_for(&self, source: &Path) -> Result<PathBuf> {
        self.numbered_output_path_for(source, 0)
    }

    /// `<stem>-optimized-<n>.<ext>`, or the plain name for `n == 0`
    pub fn numbered_output_path_for(&self, source: &Path, n: u32) -> Result<PathBuf> {
        let stem = source.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
            IronPressError::ingestion("Invalid input filename", Some(source.to_path_buf()))
        })?;

        let directory = match &self.destination {
            Destination::SameFolder => source.parent().unwrap_or_else(|| Path::new("")),
            Destination::CustomFolder(folder) => folder.as_path(),
        };

        let extension = self.output_format.extension();
        let output = if n == 0 {
            directory.join(format!("{stem}{OUTPUT_SUFFIX}.{extension}"))
        } else {
            directory.join(format!("{stem}{OUTPUT_SUFFIX}-{n}.{extension}"))
        };

        if output == source {
            return Err(IronPressError::ingestion(
                "Refusing to overwrite the original file",
                Some(source.to_path_buf()),
            ));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossless_jpeg_rejected() {
        let options = OptimizationOptions::new()
            .format(OutputFormat::Jpeg)
            .profile(CompressionProfile::Lossless);

        let err = options.validate().unwrap_err();
        assert!(matches!(err, IronPressError::ConfigError { .. }));
    }

    #[test]
    fn test_lossless_jpeg_corrected() {
        let options = OptimizationOptions::new()
            .format(OutputFormat::Jpeg)
            .profile(CompressionProfile::Lossless)
            .corrected();

        assert_eq!(options.compression_profile, CompressionProfile::BestQuality);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_lossless_allowed_for_png_and_webp() {
        for format in [OutputFormat::Png, OutputFormat::WebP] {
            let options = OptimizationOptions::new()
                .format(format)
                .profile(CompressionProfile::Lossless);
            assert!(options.validate().is_ok());
            assert_eq!(options.clone().corrected(), options);
        }
    }

    #[test]
    fn test_zero_custom_dimensions_rejected() {
        let options = OptimizationOptions::new().resize(ResizePreset::Custom { width: 0, height: 10 });
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_missing_destination_rejected() {
        let options = OptimizationOptions::new()
            .destination(Destination::CustomFolder(PathBuf::from("/definitely/not/here")));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("4k".parse::<ResizePreset>().unwrap(), ResizePreset::Uhd4k);
        assert_eq!("FullHD".parse::<ResizePreset>().unwrap(), ResizePreset::FullHd);
        assert_eq!(
            "800x600".parse::<ResizePreset>().unwrap(),
            ResizePreset::Custom { width: 800, height: 600 }
        );
        assert!("0x600".parse::<ResizePreset>().is_err());
        assert!("huge".parse::<ResizePreset>().is_err());
    }

    #[test]
    fn test_preset_bounds() {
        assert_eq!(ResizePreset::None.bounds(), None);
        assert_eq!(ResizePreset::Uhd4k.bounds(), Some((3840, 2160)));
        assert_eq!(ResizePreset::Sd.bounds(), Some((854, 480)));
    }

    #[test]
    fn test_output_path_same_folder() {
        let options = OptimizationOptions::new().format(OutputFormat::WebP);
        let output = options.output_path_for(Path::new("/photos/beach.jpg")).unwrap();
        assert_eq!(output, PathBuf::from("/photos/beach-optimized.webp"));
    }

    #[test]
    fn test_output_path_custom_folder() {
        let dir = tempfile::tempdir().unwrap();
        let options = OptimizationOptions::new()
            .format(OutputFormat::Jpeg)
            .destination(Destination::CustomFolder(dir.path().to_path_buf()));
        let output = options.output_path_for(Path::new("/photos/beach.png")).unwrap();
        assert_eq!(output, dir.path().join("beach-optimized.jpg"));
    }

    #[test]
    fn test_numbered_output_path() {
        let options = OptimizationOptions::new().format(OutputFormat::WebP);
        let source = Path::new("/photos/beach.jpg");
        assert_eq!(
            options.numbered_output_path_for(source, 0).unwrap(),
            options.output_path_for(source).unwrap()
        );
        assert_eq!(
            options.numbered_output_path_for(source, 2).unwrap(),
            PathBuf::from("/photos/beach-optimized-2.webp")
        );
    }

    #[test]
    fn test_exif_options_default_when_missing() {
        let parsed: OptimizationOptions = toml::from_str("output_format = \"jpeg\"").unwrap();
        assert_eq!(parsed.exif, ExifOptions::default());
        assert!(parsed.exif.preserve_all);
        assert!(!parsed.exif.strip_gps);

        let parsed: OptimizationOptions =
            toml::from_str("[exif]\nstrip_gps = true").unwrap();
        assert!(parsed.exif.strip_gps);
        assert!(parsed.exif.strip_thumbnail);
    }

    #[test]
    fn test_options_toml_shape() {
        let options = OptimizationOptions::new()
            .format(OutputFormat::Png)
            .resize(ResizePreset::Custom { width: 640, height: 480 })
            .intent(ColorIntent::Saturation);

        let text = toml::to_string(&options).unwrap();
        assert!(text.contains("output_format = \"png\""));
        assert!(text.contains("color_intent = \"saturation\""));

        let parsed: OptimizationOptions = toml::from_str(&text).unwrap();
        assert_eq!(parsed, options);

        let named: OptimizationOptions = toml::from_str("resize_preset = \"4k\"").unwrap();
        assert_eq!(named.resize_preset, ResizePreset::Uhd4k);
    }
}
