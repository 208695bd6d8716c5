//! File checks applied at ingestion time, before any pixels are decoded

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{IronPressError, Result};
use crate::processing::formats::{is_supported_mime, sniff_mime};

/// Bytes inspected for content sniffing
const HEADER_LEN: usize = 64;

/// Image validator for checking file limits and compatibility
#[derive(Debug, Clone)]
pub struct ImageValidator {
    max_file_size: u64,
    max_path_length: usize,
    max_dimension: u32,
}

impl ImageValidator {
    /// Create a validator with the default engine limits
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    /// Create a validator with custom limits
    pub fn with_limits(max_file_size: u64, max_path_length: usize, max_dimension: u32) -> Self {
        Self {
            max_file_size,
            max_path_length,
            max_dimension,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_limits(
            config.max_file_size,
            config.max_path_length,
            config.max_dimension,
        )
    }

    /// Validate a file for ingestion.
    ///
    /// Checks run cheapest first: path length, file metadata, then the
    /// leading bytes for the MIME type.
    pub fn validate_file<P: AsRef<Path>>(&self, path: P) -> Result<ValidationResult> {
        let path = path.as_ref();
        debug!("Validating file: {:?}", path);

        let path_length = path.as_os_str().len();
        if path_length > self.max_path_length {
            return Err(IronPressError::ingestion(
                format!(
                    "Path is {path_length} bytes long, the limit is {}",
                    self.max_path_length
                ),
                Some(path.to_path_buf()),
            ));
        }

        let metadata = std::fs::metadata(path).map_err(|e| {
            IronPressError::ingestion(format!("Cannot access file: {e}"), Some(path.to_path_buf()))
        })?;

        if !metadata.is_file() {
            return Err(IronPressError::ingestion(
                "Path is not a regular file",
                Some(path.to_path_buf()),
            ));
        }

        let file_size = metadata.len();
        if file_size == 0 {
            return Err(IronPressError::ingestion(
                "File is empty",
                Some(path.to_path_buf()),
            ));
        }

        if file_size > self.max_file_size {
            return Err(IronPressError::ingestion(
                format!(
                    "File is {:.1}MB, the limit is {:.1}MB",
                    file_size as f64 / 1024.0 / 1024.0,
                    self.max_file_size as f64 / 1024.0 / 1024.0
                ),
                Some(path.to_path_buf()),
            ));
        }

        let header = self.read_header(path)?;
        let mimetype = sniff_mime(&header, path);
        if !is_supported_mime(&mimetype) {
            return Err(IronPressError::ingestion(
                format!("Unsupported file type {mimetype}; expected JPEG, PNG or WebP"),
                Some(path.to_path_buf()),
            ));
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let result = ValidationResult {
            path: path.to_path_buf(),
            file_size,
            mimetype,
            modified,
        };

        debug!("Validation completed: {:?}", result);
        Ok(result)
    }

    fn read_header(&self, path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(path).map_err(|e| {
            IronPressError::ingestion(format!("Cannot open file: {e}"), Some(path.to_path_buf()))
        })?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        file.by_ref()
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)
            .map_err(|e| {
                IronPressError::ingestion(
                    format!("Cannot read file header: {e}"),
                    Some(path.to_path_buf()),
                )
            })?;

        Ok(header)
    }

    /// Validate dimensions announced by an image header
    pub fn validate_dimensions(&self, width: u32, height: u32, path: Option<&Path>) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(IronPressError::ingestion(
                "Image has zero width or height",
                path.map(Path::to_path_buf),
            ));
        }

        if width > self.max_dimension || height > self.max_dimension {
            return Err(IronPressError::ingestion(
                format!(
                    "Image is {width}x{height}, the limit is {}px per side",
                    self.max_dimension
                ),
                path.map(Path::to_path_buf),
            ));
        }

        Ok(())
    }

    /// Cheap pre-filter used while walking directories
    pub fn quick_check<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();

        match std::fs::metadata(path) {
            Ok(metadata) => {
                metadata.is_file() && metadata.len() > 0 && metadata.len() <= self.max_file_size
            }
            Err(_) => false,
        }
    }
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts established by a successful validation
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub path: PathBuf,
    pub file_size: u64,
    pub mimetype: String,
    pub modified: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PNG_MAGIC: [u8; 16] = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    ];

    #[test]
    fn test_validator_creation() {
        let validator = ImageValidator::new();
        assert_eq!(validator.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(validator.max_path_length, 4096);

        let custom = ImageValidator::with_limits(100, 64, 512);
        assert_eq!(custom.max_file_size, 100);
        assert_eq!(custom.max_dimension, 512);
    }

    #[test]
    fn test_missing_file() {
        let validator = ImageValidator::new();
        let err = validator.validate_file("nonexistent.jpg").unwrap_err();
        assert!(matches!(err, IronPressError::IngestionError { .. }));
    }

    #[test]
    fn test_empty_file() {
        let validator = ImageValidator::new();
        let temp_file = NamedTempFile::with_suffix(".png").unwrap();
        assert!(validator.validate_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_oversized_file() {
        let validator = ImageValidator::with_limits(8, 4096, 16_384);
        let mut temp_file = NamedTempFile::with_suffix(".png").unwrap();
        temp_file.write_all(&PNG_MAGIC).unwrap();

        let err = validator.validate_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_long_path() {
        let validator = ImageValidator::with_limits(1024, 16, 16_384);
        let err = validator
            .validate_file("/a/very/long/path/to/some/photo.jpg")
            .unwrap_err();
        assert!(err.to_string().contains("bytes long"));
    }

    #[test]
    fn test_unsupported_content() {
        let validator = ImageValidator::new();
        let mut temp_file = NamedTempFile::with_suffix(".xyz").unwrap();
        temp_file.write_all(b"dummy content").unwrap();

        assert!(validator.validate_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_content_beats_extension() {
        let validator = ImageValidator::new();
        let mut temp_file = NamedTempFile::with_suffix(".dat").unwrap();
        temp_file.write_all(&PNG_MAGIC).unwrap();

        let result = validator.validate_file(temp_file.path()).unwrap();
        assert_eq!(result.mimetype, "image/png");
        assert_eq!(result.file_size, PNG_MAGIC.len() as u64);
    }

    #[test]
    fn test_extension_fallback_for_garbage() {
        let validator = ImageValidator::new();
        let mut temp_file = NamedTempFile::with_suffix(".jpg").unwrap();
        temp_file.write_all(b"not really a jpeg").unwrap();

        let result = validator.validate_file(temp_file.path()).unwrap();
        assert_eq!(result.mimetype, "image/jpeg");
    }

    #[test]
    fn test_dimension_validation() {
        let validator = ImageValidator::new();

        assert!(validator.validate_dimensions(1920, 1080, None).is_ok());
        assert!(validator.validate_dimensions(0, 1080, None).is_err());
        assert!(validator.validate_dimensions(1920, 0, None).is_err());
        assert!(validator.validate_dimensions(50_000, 100, None).is_err());
    }

    #[test]
    fn test_quick_check() {
        let validator = ImageValidator::new();
        assert!(!validator.quick_check("nonexistent.jpg"));

        let mut temp_file = NamedTempFile::with_suffix(".jpg").unwrap();
        temp_file.write_all(b"dummy jpeg content").unwrap();
        assert!(validator.quick_check(temp_file.path()));
    }
}
