//! Error types and handling for IronPress

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for IronPress operations
pub type Result<T> = std::result::Result<T, IronPressError>;

/// Failures raised while turning encoded bytes into a pixel buffer
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes claim a supported format but cannot be decoded
    #[error("corrupt image data: {0}")]
    Corrupt(String),

    /// The bytes are not JPEG, PNG or WebP
    #[error("unsupported image format: {0}")]
    Unsupported(String),

    /// The header announces dimensions beyond the decoder limits
    #[error("image is {width}x{height}, larger than the {limit}px side limit")]
    TooLarge { width: u32, height: u32, limit: u32 },
}

/// Failures raised while encoding a pixel buffer into the target format
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The buffer cannot be represented in the target format
    #[error("cannot encode {width}x{height} image as {format}: {reason}")]
    InvalidDimensions {
        format: &'static str,
        width: u32,
        height: u32,
        reason: String,
    },

    /// The underlying encoder reported an error
    #[error("{format} encoder failed: {message}")]
    Failed { format: &'static str, message: String },
}

impl EncodeError {
    pub(crate) fn failed<S: Into<String>>(format: &'static str, message: S) -> Self {
        Self::Failed {
            format,
            message: message.into(),
        }
    }
}

/// Failures raised while carrying EXIF from a source into its output.
///
/// These never fail a task; the output is written without metadata instead.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unreadable EXIF: {0}")]
    Read(exif::Error),

    #[error("cannot rewrite EXIF: {0}")]
    Write(exif::Error),

    #[error("cannot parse {format} output: {source}")]
    Container {
        format: &'static str,
        source: img_parts::Error,
    },

    #[error("cannot serialize {format} output: {source}")]
    Io {
        format: &'static str,
        source: std::io::Error,
    },
}

/// Coarse classification used in events and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Ingestion,
    Decode,
    ColorConversion,
    Encode,
    Cache,
    Config,
    Io,
    Panic,
    Serde,
    System,
}

/// Main error type for IronPress operations
#[derive(Debug, Error)]
pub enum IronPressError {
    /// File unreadable, rejected or unsupported at ingestion time
    #[error("Ingestion error: {message} (file: {file:?})")]
    IngestionError {
        message: String,
        file: Option<PathBuf>,
    },

    /// Corrupt or unsupported image bytes
    #[error("Decode error: {source} (file: {file:?})")]
    DecodeError {
        #[source]
        source: DecodeError,
        file: Option<PathBuf>,
    },

    /// Malformed or unsupported color profile
    #[error("Color conversion error: {message} (file: {file:?})")]
    ColorConversionError {
        message: String,
        file: Option<PathBuf>,
    },

    /// Target-format encoding failure
    #[error("Encode error: {source} (file: {file:?})")]
    EncodeError {
        #[source]
        source: EncodeError,
        file: Option<PathBuf>,
    },

    /// Thumbnail cache read or write failure
    #[error("Cache error: {message}")]
    CacheError { message: String },

    /// Invalid option combination or configuration file
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// I/O related errors
    #[error("I/O error: {source} (file: {file:?})")]
    IoError {
        #[source]
        source: std::io::Error,
        file: Option<PathBuf>,
    },

    /// A worker panicked while processing a single file
    #[error("Processing panicked: {message} (file: {file:?})")]
    TaskPanicked {
        message: String,
        file: Option<PathBuf>,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerdeError(String),

    /// System resource errors
    #[error("System resource error: {message}")]
    SystemError { message: String },
}

impl IronPressError {
    /// Create a new ingestion error
    pub fn ingestion<S: Into<String>>(message: S, file: Option<PathBuf>) -> Self {
        Self::IngestionError {
            message: message.into(),
            file,
        }
    }

    /// Create a new color conversion error
    pub fn color_conversion<S: Into<String>>(message: S, file: Option<PathBuf>) -> Self {
        Self::ColorConversionError {
            message: message.into(),
            file,
        }
    }

    /// Create a new cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::CacheError {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an error for a worker that panicked
    pub fn panicked<S: Into<String>>(message: S, file: Option<PathBuf>) -> Self {
        Self::TaskPanicked {
            message: message.into(),
            file,
        }
    }

    /// Create a new system error
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::SystemError {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IngestionError { .. } => ErrorKind::Ingestion,
            Self::DecodeError { .. } => ErrorKind::Decode,
            Self::ColorConversionError { .. } => ErrorKind::ColorConversion,
            Self::EncodeError { .. } => ErrorKind::Encode,
            Self::CacheError { .. } => ErrorKind::Cache,
            Self::ConfigError { .. } => ErrorKind::Config,
            Self::IoError { .. } => ErrorKind::Io,
            Self::TaskPanicked { .. } => ErrorKind::Panic,
            Self::SerdeError(_) => ErrorKind::Serde,
            Self::SystemError { .. } => ErrorKind::System,
        }
    }

    /// Check if this error is recoverable (processing can continue)
    pub fn is_recoverable(&self) -> bool {
        match self {
            // These affect a single file; the batch carries on
            Self::IngestionError { .. }
            | Self::DecodeError { .. }
            | Self::ColorConversionError { .. }
            | Self::EncodeError { .. }
            | Self::CacheError { .. }
            | Self::IoError { .. }
            | Self::TaskPanicked { .. } => true,

            // These stop a batch before any work starts
            Self::ConfigError { .. }
            | Self::SerdeError(_)
            | Self::SystemError { .. } => false,
        }
    }

    /// Get the associated file path if available
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::IngestionError { file, .. }
            | Self::DecodeError { file, .. }
            | Self::ColorConversionError { file, .. }
            | Self::EncodeError { file, .. }
            | Self::IoError { file, .. }
            | Self::TaskPanicked { file, .. } => file.as_deref(),
            _ => None,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::DecodeError {
                source: DecodeError::Corrupt(_),
                ..
            } => "The file is damaged or is not a valid image.".to_string(),
            Self::DecodeError {
                source: DecodeError::Unsupported(format),
                ..
            } => format!("Unsupported image format: {format}. Supported formats: JPEG, PNG, WebP"),
            Self::DecodeError {
                source: DecodeError::TooLarge { width, height, limit },
                ..
            } => format!(
                "Image is too large ({width}x{height}). Maximum supported side: {limit} pixels"
            ),
            Self::EncodeError { source, .. } => format!("Could not write the optimized image: {source}"),
            Self::IoError { source, .. } => format!("File system error: {source}"),
            Self::TaskPanicked { .. } => {
                "An unexpected internal error occurred while processing this file.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for IronPressError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            source: err,
            file: None,
        }
    }
}

impl From<DecodeError> for IronPressError {
    fn from(err: DecodeError) -> Self {
        Self::DecodeError {
            source: err,
            file: None,
        }
    }
}

impl From<EncodeError> for IronPressError {
    fn from(err: EncodeError) -> Self {
        Self::EncodeError {
            source: err,
            file: None,
        }
    }
}

impl From<toml::de::Error> for IronPressError {
    fn from(err: toml::de::Error) -> Self {
        Self::SerdeError(format!("TOML parsing error: {err}"))
    }
}

impl From<serde_yaml::Error> for IronPressError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SerdeError(format!("YAML parsing error: {err}"))
    }
}

/// Error context extension for adding file path information
pub trait ErrorContext<T> {
    /// Add file context to an error
    fn with_file_context(self, file: &Path) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<IronPressError>,
{
    fn with_file_context(self, file: &Path) -> Result<T> {
        self.map_err(|e| {
            let mut error = e.into();

            match &mut error {
                IronPressError::IngestionError { file: f, .. }
                | IronPressError::DecodeError { file: f, .. }
                | IronPressError::ColorConversionError { file: f, .. }
                | IronPressError::EncodeError { file: f, .. }
                | IronPressError::IoError { file: f, .. }
                | IronPressError::TaskPanicked { file: f, .. } => {
                    if f.is_none() {
                        *f = Some(file.to_path_buf());
                    }
                }
                _ => {}
            }

            error
        })
    }
}

/// Self-describing failure payload carried by per-file events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(path: &Path, error: &IronPressError) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: error.kind(),
            message: error.user_message(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}
