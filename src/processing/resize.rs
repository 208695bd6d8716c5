//! Downscaling to a preset bounding box

use image::DynamicImage;
use tracing::debug;

use crate::config::ResizePreset;

/// Available resize filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    /// Triangle (linear interpolation), used for previews
    Triangle,
    /// Lanczos with radius 3 (high quality, recommended)
    #[default]
    Lanczos3,
}

impl From<FilterType> for image::imageops::FilterType {
    fn from(filter: FilterType) -> Self {
        match filter {
            FilterType::Triangle => image::imageops::FilterType::Triangle,
            FilterType::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }
}

/// Aspect-preserving resizer that never upscales and never crops
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageResizer {
    filter: FilterType,
}

impl ImageResizer {
    /// Create a new resizer with the Lanczos3 filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resizer with custom filter
    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> FilterType {
        self.filter
    }

    /// Resize to exactly `width`x`height`; the caller computes the box with
    /// [`compute_target`]
    pub fn resize(&self, image: DynamicImage, width: u32, height: u32) -> DynamicImage {
        if width == image.width() && height == image.height() {
            return image;
        }

        debug!(
            "Resizing {}x{} -> {}x{} using {:?}",
            image.width(),
            image.height(),
            width,
            height,
            self.filter
        );

        image.resize_exact(width, height, self.filter.into())
    }

    /// Apply a preset in one step
    pub fn apply_preset(&self, image: DynamicImage, preset: ResizePreset) -> DynamicImage {
        let (width, height) = compute_target(image.width(), image.height(), preset);
        self.resize(image, width, height)
    }
}

/// Target dimensions for a preset.
///
/// scale = min(target_w / w, target_h / h); a scale of 1 or more keeps the
/// original dimensions.
pub fn compute_target(original_width: u32, original_height: u32, preset: ResizePreset) -> (u32, u32) {
    match preset.bounds() {
        Some((max_width, max_height)) => {
            fit_within(original_width, original_height, max_width, max_height)
        }
        None => (original_width, original_height),
    }
}

/// Largest aspect-preserving size inside `max_width`x`max_height`, never
/// larger than the original
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || max_width == 0 || max_height == 0 {
        return (width, height);
    }

    let scale = (f64::from(max_width) / f64::from(width)).min(f64::from(max_height) / f64::from(height));
    if scale >= 1.0 {
        return (width, height);
    }

    let new_width = ((f64::from(width) * scale).round() as u32).clamp(1, max_width);
    let new_height = ((f64::from(height) * scale).round() as u32).clamp(1, max_height);
    (new_width, new_height)
}

/// Preview-sized copy for the thumbnail cache
pub fn create_thumbnail(image: &DynamicImage, max_side: u32) -> DynamicImage {
    let (width, height) = fit_within(image.width(), image.height(), max_side, max_side);
    if (width, height) == (image.width(), image.height()) {
        return image.clone();
    }
    image.resize_exact(width, height, FilterType::Triangle.into())
}
