//! Color management: embedded profile detection and conversion to sRGB
//!
//! Wide-gamut sources are described by fixed primaries rather than by their
//! embedded ICC payload. A matrix-shaper profile is rebuilt from those
//! primaries with LittleCMS and transformed into the built-in sRGB profile
//! one scanline at a time, so peak memory stays at one row of scratch space
//! on top of the pixel buffer itself.

use std::fmt;

use image::DynamicImage;
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::webp::WebP;
use img_parts::{Bytes, ImageICC};
use lcms2::{
    CIExyY, CIExyYTRIPLE, InfoType, Intent, Locale, PixelFormat, Profile, Tag, TagSignature,
    ToneCurve, Transform, MLU,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ColorIntent;
use crate::error::{IronPressError, Result};
use crate::processing::codec::PixelBuffer;
use crate::processing::formats::detect_format_from_header;

/// Color space a source image is encoded in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorProfile {
    Srgb,
    AdobeRgb,
    DisplayP3,
    ProPhotoRgb,
    /// Embedded profile we have no primaries for; carries its description
    Unknown(String),
}

/// Tone response of an RGB profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferCurve {
    Gamma(f64),
    /// IEC 61966-2-1 piecewise curve
    Srgb,
}

/// CIE xy chromaticities of a matrix-shaper RGB space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Primaries {
    pub red: (f64, f64),
    pub green: (f64, f64),
    pub blue: (f64, f64),
    pub white: (f64, f64),
    pub transfer: TransferCurve,
}

const D65: (f64, f64) = (0.3127, 0.3290);
const D50: (f64, f64) = (0.3457, 0.3585);

impl Primaries {
    pub const ADOBE_RGB: Self = Self {
        red: (0.6400, 0.3300),
        green: (0.2100, 0.7100),
        blue: (0.1500, 0.0600),
        white: D65,
        transfer: TransferCurve::Gamma(563.0 / 256.0),
    };

    pub const DISPLAY_P3: Self = Self {
        red: (0.6800, 0.3200),
        green: (0.2650, 0.6900),
        blue: (0.1500, 0.0600),
        white: D65,
        transfer: TransferCurve::Srgb,
    };

    pub const PROPHOTO_RGB: Self = Self {
        red: (0.7347, 0.2653),
        green: (0.1596, 0.8404),
        blue: (0.0366, 0.0001),
        white: D50,
        transfer: TransferCurve::Gamma(1.8),
    };

    /// Build an lcms2 profile from these primaries
    pub fn to_profile(&self) -> Result<Profile> {
        let xy = |(x, y): (f64, f64)| CIExyY { x, y, Y: 1.0 };

        let white = xy(self.white);
        let primaries = CIExyYTRIPLE {
            Red: xy(self.red),
            Green: xy(self.green),
            Blue: xy(self.blue),
        };

        let curve = match self.transfer {
            TransferCurve::Gamma(gamma) => ToneCurve::new(gamma),
            TransferCurve::Srgb => ToneCurve::new_parametric(
                4,
                &[2.4, 1.0 / 1.055, 0.055 / 1.055, 1.0 / 12.92, 0.04045],
            )
            .map_err(|e| IronPressError::color_conversion(format!("tone curve: {e}"), None))?,
        };
        let curves: [&ToneCurve; 3] = [&curve, &curve, &curve];

        Profile::new_rgb(&white, &primaries, &curves)
            .map_err(|e| IronPressError::color_conversion(format!("RGB profile: {e}"), None))
    }
}

impl ColorProfile {
    pub fn display_name(&self) -> String {
        match self {
            Self::Srgb => "sRGB".to_string(),
            Self::AdobeRgb => "Adobe RGB (1998)".to_string(),
            Self::DisplayP3 => "Display P3".to_string(),
            Self::ProPhotoRgb => "ProPhoto RGB".to_string(),
            Self::Unknown(name) => format!("Unknown ({name})"),
        }
    }

    /// Fixed primaries for the wide-gamut variants
    pub fn primaries(&self) -> Option<Primaries> {
        match self {
            Self::AdobeRgb => Some(Primaries::ADOBE_RGB),
            Self::DisplayP3 => Some(Primaries::DISPLAY_P3),
            Self::ProPhotoRgb => Some(Primaries::PROPHOTO_RGB),
            Self::Srgb | Self::Unknown(_) => None,
        }
    }

    /// Classify an ICC profile description string
    pub fn from_description(description: &str) -> Self {
        let lower = description.to_lowercase();

        if lower.contains("srgb") {
            Self::Srgb
        } else if lower.contains("adobe") && lower.contains("rgb") {
            Self::AdobeRgb
        } else if lower.contains("p3") {
            Self::DisplayP3
        } else if lower.contains("prophoto") || lower.contains("romm") {
            Self::ProPhotoRgb
        } else {
            Self::Unknown(description.trim().to_string())
        }
    }

    /// Serialize a matching ICC profile, tagged with [`Self::display_name`]
    pub fn to_icc(&self) -> Result<Vec<u8>> {
        let mut profile = match self {
            Self::Srgb => Profile::new_srgb(),
            Self::Unknown(name) => {
                return Err(IronPressError::color_conversion(
                    format!("no primaries known for profile '{name}'"),
                    None,
                ))
            }
            known => match known.primaries() {
                Some(primaries) => primaries.to_profile()?,
                None => Profile::new_srgb(),
            },
        };

        tagged_icc(&mut profile, &self.display_name())
    }
}

impl fmt::Display for ColorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Write `description` into the profile and serialize it
pub fn tagged_icc(profile: &mut Profile, description: &str) -> Result<Vec<u8>> {
    let mut mlu = MLU::new(1);
    mlu.set_text_ascii(description, Locale::none());
    if !profile.write_tag(TagSignature::ProfileDescriptionTag, Tag::MLU(&mlu)) {
        return Err(IronPressError::color_conversion(
            "could not write profile description",
            None,
        ));
    }

    profile
        .icc()
        .map_err(|e| IronPressError::color_conversion(format!("ICC serialization: {e}"), None))
}

impl From<ColorIntent> for Intent {
    fn from(intent: ColorIntent) -> Self {
        match intent {
            ColorIntent::Perceptual => Intent::Perceptual,
            ColorIntent::RelativeColorimetric => Intent::RelativeColorimetric,
            ColorIntent::Saturation => Intent::Saturation,
            ColorIntent::AbsoluteColorimetric => Intent::AbsoluteColorimetric,
        }
    }
}

/// Whether pixels must go through [`convert_to_srgb`] before encoding
pub fn needs_conversion(profile: &ColorProfile) -> bool {
    profile.primaries().is_some()
}

/// Raw ICC payload embedded in a JPEG, PNG or WebP container
pub fn extract_icc(bytes: &[u8]) -> Option<Vec<u8>> {
    let data = Bytes::copy_from_slice(bytes);
    let icc = match detect_format_from_header(bytes)? {
        image::ImageFormat::Jpeg => Jpeg::from_bytes(data).ok()?.icc_profile(),
        image::ImageFormat::Png => Png::from_bytes(data).ok()?.icc_profile(),
        image::ImageFormat::WebP => WebP::from_bytes(data).ok()?.icc_profile(),
        _ => None,
    }?;
    Some(icc.to_vec())
}

/// Detect the color profile of an encoded image.
///
/// Images without an embedded profile are taken to be sRGB. A profile that
/// LittleCMS cannot parse is reported as a `ColorConversionError`.
pub fn detect_profile(bytes: &[u8]) -> Result<ColorProfile> {
    let Some(icc) = extract_icc(bytes) else {
        return Ok(ColorProfile::Srgb);
    };

    let profile = Profile::new_icc(&icc).map_err(|e| {
        IronPressError::color_conversion(format!("malformed embedded ICC profile: {e}"), None)
    })?;

    let description = profile
        .info(InfoType::Description, Locale::none())
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| "untitled".to_string());

    debug!("Embedded ICC profile: {}", description);
    Ok(ColorProfile::from_description(&description))
}

/// [`detect_profile`] with malformed profiles degraded to an unknown tag
pub fn detect_profile_lenient(bytes: &[u8]) -> ColorProfile {
    detect_profile(bytes).unwrap_or_else(|e| {
        warn!("{}; leaving colors untouched", e);
        ColorProfile::Unknown("unreadable ICC profile".to_string())
    })
}

/// Reusable profile-to-sRGB transform.
///
/// Building the transform is the only fallible step; applying it cannot fail,
/// so callers can fall back to the untouched buffer when construction errors.
pub struct SrgbConverter {
    transform: Transform<[u8; 3], [u8; 3]>,
    profile: ColorProfile,
    intent: ColorIntent,
}

impl SrgbConverter {
    /// `Ok(None)` for profiles that need no conversion
    pub fn new(profile: &ColorProfile, intent: ColorIntent) -> Result<Option<Self>> {
        let Some(primaries) = profile.primaries() else {
            return Ok(None);
        };

        let source = primaries.to_profile()?;
        let target = Profile::new_srgb();
        let transform = Transform::new(
            &source,
            PixelFormat::RGB_8,
            &target,
            PixelFormat::RGB_8,
            intent.into(),
        )
        .map_err(|e| IronPressError::color_conversion(format!("transform: {e}"), None))?;

        Ok(Some(Self {
            transform,
            profile: profile.clone(),
            intent,
        }))
    }

    /// Transform every pixel, one scanline at a time.
    ///
    /// 16-bit and float buffers are reduced to 8 bits per channel. Alpha is
    /// carried over as is.
    pub fn apply(&self, buffer: PixelBuffer) -> PixelBuffer {
        if buffer.width() == 0 || buffer.height() == 0 {
            return buffer;
        }

        debug!(
            "Converting {}x{} from {} to sRGB ({:?})",
            buffer.width(),
            buffer.height(),
            self.profile,
            self.intent
        );

        let width = buffer.width() as usize;
        let mut scanline = vec![[0u8; 3]; width];

        if buffer.color().has_alpha() {
            let mut rgba = buffer.into_rgba8();
            for row in rgba.chunks_exact_mut(width * 4) {
                for (px, rgb) in row.chunks_exact(4).zip(scanline.iter_mut()) {
                    *rgb = [px[0], px[1], px[2]];
                }
                self.transform.transform_in_place(&mut scanline);
                for (px, rgb) in row.chunks_exact_mut(4).zip(scanline.iter()) {
                    px[..3].copy_from_slice(rgb);
                }
            }
            DynamicImage::ImageRgba8(rgba)
        } else {
            let mut rgb = buffer.into_rgb8();
            for row in rgb.chunks_exact_mut(width * 3) {
                for (px, slot) in row.chunks_exact(3).zip(scanline.iter_mut()) {
                    *slot = [px[0], px[1], px[2]];
                }
                self.transform.transform_in_place(&mut scanline);
                for (px, slot) in row.chunks_exact_mut(3).zip(scanline.iter()) {
                    px.copy_from_slice(slot);
                }
            }
            DynamicImage::ImageRgb8(rgb)
        }
    }
}

/// Convert pixels from `profile` into sRGB; sRGB and unknown profiles are
/// returned untouched
pub fn convert_to_srgb(
    buffer: PixelBuffer,
    profile: &ColorProfile,
    intent: ColorIntent,
) -> Result<PixelBuffer> {
    match SrgbConverter::new(profile, intent)? {
        Some(converter) => Ok(converter.apply(buffer)),
        None => Ok(buffer),
    }
}
