//! Core image processing functionality

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EngineConfig, OptimizationOptions, OutputFormat};
use crate::error::{ErrorContext, Result};

pub mod codec;
pub mod color;
pub mod exif_transfer;
pub mod formats;
pub mod memory;
pub mod metadata;
pub mod resize;
pub mod validation;

pub use codec::{decode, encode, PixelBuffer, QualityParams};
pub use color::{convert_to_srgb, detect_profile, needs_conversion, ColorProfile, SrgbConverter};
pub use exif_transfer::ExifPayload;
pub use memory::{BudgetPermit, DecodeBudget};
pub use metadata::{ingest, ingest_with_events, CaptureMetadata, ImageTask, IngestOptions, IngestReport, IngestedFile};
pub use resize::{compute_target, FilterType, ImageResizer};
pub use validation::ImageValidator;

/// Encoded source bytes, read into memory or mapped for very large files
pub enum SourceBytes {
    Buffered(Vec<u8>),
    Mapped(Mmap),
}

impl SourceBytes {
    /// Read `path`, memory-mapping it when it exceeds `mmap_threshold` bytes
    pub fn open(path: &Path, mmap_threshold: u64) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        if size > mmap_threshold {
            debug!("Using memory mapping for large file: {:?}", path);
            // The mapping is read-only and dropped before the pipeline writes
            // its output, which never targets the source path
            let mmap = unsafe { Mmap::map(&file)? };
            Ok(Self::Mapped(mmap))
        } else {
            let mut buffer = Vec::with_capacity(size as usize);
            std::io::Read::read_to_end(&mut &file, &mut buffer)?;
            Ok(Self::Buffered(buffer))
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

impl Deref for SourceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Buffered(bytes) => bytes,
            Self::Mapped(mmap) => mmap,
        }
    }
}

/// Per-file outcome of a successful optimization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub original_path: PathBuf,
    pub optimized_path: PathBuf,
    pub original_size_kb: f64,
    pub optimized_size_kb: f64,
    /// Negative when the output is larger than the source
    pub reduction_percentage: f64,
    pub format: OutputFormat,
    /// Output width and height
    pub dimensions: (u32, u32),
    pub color_converted: bool,
}

impl OptimizationResult {
    pub fn new(
        original_path: PathBuf,
        optimized_path: PathBuf,
        original_bytes: u64,
        optimized_bytes: u64,
        format: OutputFormat,
        dimensions: (u32, u32),
        color_converted: bool,
    ) -> Self {
        Self {
            original_path,
            optimized_path,
            original_size_kb: original_bytes as f64 / 1024.0,
            optimized_size_kb: optimized_bytes as f64 / 1024.0,
            reduction_percentage: reduction_percentage(original_bytes, optimized_bytes),
            format,
            dimensions,
            color_converted,
        }
    }
}

/// `(1 - optimized / original) * 100`
pub fn reduction_percentage(original_bytes: u64, optimized_bytes: u64) -> f64 {
    if original_bytes == 0 {
        return 0.0;
    }
    (1.0 - optimized_bytes as f64 / original_bytes as f64) * 100.0
}

/// Output paths for a whole batch, assigned before any task runs.
///
/// Every output is distinct and none of them is a source of the batch.
/// The first task of a stem gets `<stem>-optimized.<ext>`; later ones, and
/// any whose plain name is itself a batch input, get `-optimized-1`,
/// `-optimized-2` and so on.
#[derive(Debug, Clone, Default)]
pub struct OutputPlan {
    outputs: HashMap<PathBuf, PathBuf>,
}

impl OutputPlan {
    pub fn new(tasks: &[ImageTask], options: &OptimizationOptions) -> Self {
        let sources: HashSet<PathBuf> = tasks.iter().map(|t| comparable(&t.source_path)).collect();
        let mut taken = HashSet::new();
        let mut outputs = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let mut n = 0;
            // A naming error is reported by the task itself when it runs
            while let Ok(candidate) = options.numbered_output_path_for(&task.source_path, n) {
                let key = comparable(&candidate);
                if !sources.contains(&key) && taken.insert(key) {
                    if n > 0 {
                        debug!("Output name for {:?} is taken, using {:?}", task.source_path, candidate);
                    }
                    outputs.insert(task.source_path.clone(), candidate);
                    break;
                }
                n += 1;
            }
        }

        Self { outputs }
    }

    pub fn output_for(&self, source: &Path) -> Option<&Path> {
        self.outputs.get(source).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Same file, spelled the same way: the directory is canonicalized so
/// `photos/a.jpg` and `./photos/a.jpg` compare equal
fn comparable(path: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
    parent
        .canonicalize()
        .map(|dir| dir.join(name))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Write through a temp file next to `path` so an interrupted run never
/// leaves a truncated output behind
fn write_output(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".ironpress-")
        .suffix(".part")
        .tempfile_in(directory)?;
    temp.write_all(bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Runs one task through decode, color conversion, resize and encode
#[derive(Clone)]
pub struct ProcessingEngine {
    options: OptimizationOptions,
    quality: QualityParams,
    resizer: ImageResizer,
    max_dimension: u32,
    mmap_threshold: u64,
    budget: Option<Arc<DecodeBudget>>,
    plan: Option<Arc<OutputPlan>>,
}

impl ProcessingEngine {
    /// Create an engine for validated options
    pub fn new(options: OptimizationOptions) -> Self {
        let engine = EngineConfig::default();
        Self {
            quality: QualityParams::for_profile(options.compression_profile, options.output_format),
            options,
            resizer: ImageResizer::new(),
            max_dimension: engine.max_dimension,
            mmap_threshold: engine.mmap_threshold,
            budget: None,
            plan: None,
        }
    }

    /// Take decoder and I/O limits from the engine configuration
    pub fn with_limits(mut self, engine: &EngineConfig) -> Self {
        self.max_dimension = engine.max_dimension;
        self.mmap_threshold = engine.mmap_threshold;
        self
    }

    /// Hold a budget permit from decode until the encoded bytes exist
    pub fn with_budget(mut self, budget: Arc<DecodeBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Take output paths from a batch-wide plan instead of the bare naming rule
    pub fn with_output_plan(mut self, plan: Arc<OutputPlan>) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Where `source` will be written
    pub fn output_path(&self, source: &Path) -> Result<PathBuf> {
        match self.plan.as_ref().and_then(|plan| plan.output_for(source)) {
            Some(path) => Ok(path.to_path_buf()),
            None => self.options.output_path_for(source),
        }
    }

    pub fn options(&self) -> &OptimizationOptions {
        &self.options
    }

    pub fn quality(&self) -> QualityParams {
        self.quality
    }

    /// Optimize one task and write the output file
    pub fn process(&self, task: &ImageTask) -> Result<OptimizationResult> {
        let start_time = Instant::now();
        let source = task.source_path.as_path();
        let output_path = self.output_path(source)?;

        debug!("Processing file: {:?} -> {:?}", source, output_path);

        let bytes = SourceBytes::open(source, self.mmap_threshold).with_file_context(source)?;

        let permit = self.budget.as_ref().map(|budget| budget.acquire());
        let image = codec::decode_with_limit(&bytes, &task.detected_mimetype, self.max_dimension)
            .with_file_context(source)?;
        let exif = self.read_exif(&bytes, source);
        drop(bytes);

        let (image, color_converted) = self.convert_color(image, task);

        let (width, height) = compute_target(image.width(), image.height(), self.options.resize_preset);
        let image = self.resizer.resize(image, width, height);

        let encoded = codec::encode(&image, self.options.output_format, self.quality)
            .with_file_context(source)?;
        drop(image);
        drop(permit);

        let encoded = match exif {
            Some(exif) => self.attach_exif(encoded, &exif, (width, height), source),
            None => encoded,
        };

        write_output(&output_path, &encoded).with_file_context(&output_path)?;

        let result = OptimizationResult::new(
            source.to_path_buf(),
            output_path,
            task.byte_size,
            encoded.len() as u64,
            self.options.output_format,
            (width, height),
            color_converted,
        );

        debug!(
            "Optimized {:?} in {:.2}s: {:.1}KB -> {:.1}KB ({:.1}%)",
            source,
            start_time.elapsed().as_secs_f64(),
            result.original_size_kb,
            result.optimized_size_kb,
            result.reduction_percentage
        );

        Ok(result)
    }

    /// Unreadable source EXIF is logged and the output goes without
    fn read_exif(&self, bytes: &[u8], source: &Path) -> Option<ExifPayload> {
        ExifPayload::read(bytes, &self.options.exif).unwrap_or_else(|e| {
            warn!("Not copying EXIF from {:?}: {}", source, e);
            None
        })
    }

    fn attach_exif(
        &self,
        encoded: Vec<u8>,
        exif: &ExifPayload,
        dimensions: (u32, u32),
        source: &Path,
    ) -> Vec<u8> {
        match exif.embed(&encoded, self.options.output_format, dimensions) {
            Ok(tagged) => tagged,
            Err(e) => {
                warn!("Writing {:?} without EXIF: {}", source, e);
                encoded
            }
        }
    }

    /// A profile that cannot be turned into a transform is logged and the
    /// pixels are encoded as decoded
    fn convert_color(&self, image: PixelBuffer, task: &ImageTask) -> (PixelBuffer, bool) {
        if !task.needs_color_conversion {
            return (image, false);
        }

        match SrgbConverter::new(&task.detected_color_profile, self.options.color_intent) {
            Ok(Some(converter)) => (converter.apply(image), true),
            Ok(None) => (image, false),
            Err(e) => {
                warn!("Skipping color conversion for {:?}: {}", task.source_path, e);
                (image, false)
            }
        }
    }
}
