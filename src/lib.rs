//! IronPress - parallel batch image optimizer
//!
//! Decodes JPEG, PNG and WebP sources, converts wide-gamut images to sRGB,
//! downsizes them to a preset bounding box and re-encodes them as JPEG, PNG or
//! WebP. Batches run on a work-stealing pool with a bounded number of decoded
//! buffers in flight; previews are served from a persistent thumbnail cache.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ironpress::{BatchScheduler, IngestOptions, OptimizationOptions, OutputFormat, ResizePreset};
//! use std::path::PathBuf;
//!
//! let ingested = ironpress::ingest(&[PathBuf::from("photos")], &IngestOptions::default(), None)?;
//!
//! let options = OptimizationOptions::new()
//!     .format(OutputFormat::WebP)
//!     .resize(ResizePreset::FullHd);
//!
//! let report = BatchScheduler::new().run(ingested.tasks(), options)?;
//! println!(
//!     "{} optimized, {:.1}% smaller",
//!     report.summary.succeeded, report.summary.average_reduction_percentage
//! );
//! # Ok::<(), ironpress::IronPressError>(())
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod error;
pub mod parallel;
pub mod processing;
pub mod system;

// Re-export commonly used types
pub use cache::ThumbnailCache;
pub use config::{
    ColorIntent, CompressionProfile, Config, Destination, ExifOptions, OptimizationOptions,
    OutputFormat, ResizePreset,
};
pub use error::{IronPressError, Result, TaskError};
pub use parallel::{BatchEvent, BatchHandle, BatchReport, BatchScheduler, BatchSummary, CancelToken};
pub use processing::metadata::{ingest, ingest_with_events, IngestOptions, IngestReport};
pub use processing::{ImageTask, OptimizationResult, ProcessingEngine};

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::ErrorContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from `RUST_LOG` and log the host capabilities.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        info!("IronPress v{} initialized", VERSION);
    }

    system::log_system_requirements();
    Ok(())
}

/// Initialize logging from the `[logging]` section of a configuration
pub fn init_with_config(config: &Config) -> Result<()> {
    if install_subscriber(&config.logging)? {
        info!("IronPress v{} initialized with custom config", VERSION);
    }

    system::log_system_requirements();
    Ok(())
}

/// `RUST_LOG` still wins over the configured level
fn install_subscriber(logging: &LoggingConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| IronPressError::config(format!("Invalid log level '{}': {e}", logging.level)))?;

    let file = match &logging.file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_file_context(path)?,
        ),
        None => None,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match (logging.json_format, file) {
        (true, Some(file)) => builder.json().with_writer(Mutex::new(file)).try_init(),
        (true, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, Some(file)) => builder.with_ansi(false).with_writer(Mutex::new(file)).try_init(),
        (false, None) => builder.with_writer(std::io::stderr).try_init(),
    };

    Ok(installed.is_ok())
}
