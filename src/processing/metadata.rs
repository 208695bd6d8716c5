//! Ingestion: turning user-supplied paths into immutable image tasks
//!
//! Everything here reads container headers only. Pixel data is decoded just
//! once, for the preview, and only when the thumbnail cache misses.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::Sender;
use exif::{In, Tag, Value};
use image::ImageReader;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{render_thumbnail_from_bytes, ThumbnailCache};
use crate::config::{Config, EngineConfig};
use crate::error::{ErrorContext, IronPressError, Result, TaskError};
use crate::parallel::progress::IngestEvent;
use crate::processing::color::{detect_profile_lenient, needs_conversion, ColorProfile};
use crate::processing::formats::is_supported_input_format;
use crate::processing::validation::ImageValidator;
use crate::processing::SourceBytes;

/// One source image, as established at ingestion time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTask {
    pub source_path: PathBuf,
    pub byte_size: u64,
    pub detected_mimetype: String,
    pub last_modified: SystemTime,
    pub detected_color_profile: ColorProfile,
    pub needs_color_conversion: bool,
    /// Read from the header; `None` when the header is unreadable
    pub dimensions: Option<(u32, u32)>,
}

impl ImageTask {
    /// Inspect a single file with the default limits and no preview
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = IngestOptions {
            previews: false,
            ..IngestOptions::default()
        };
        let validator = ImageValidator::from_config(&options.engine);
        inspect(path.as_ref(), &options, &validator, None).map(|file| file.task)
    }

    /// Seconds since the Unix epoch
    pub fn last_modified_timestamp(&self) -> u64 {
        self.last_modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Camera settings read from EXIF
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub make: Option<String>,
    pub model: Option<String>,
    pub date_taken: Option<String>,
    pub orientation: Option<u32>,
    pub iso: Option<u32>,
    /// e.g. `1/250` or `2.50s`
    pub exposure_time: Option<String>,
    pub f_number: Option<f64>,
    /// Millimetres
    pub focal_length: Option<f64>,
}

impl CaptureMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Metadata record emitted for every accepted file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedFile {
    pub task: ImageTask,
    pub preview_path: Option<PathBuf>,
    pub capture: Option<CaptureMetadata>,
}

/// Limits and switches for one ingestion run
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub engine: EngineConfig,
    /// Generate previews through the thumbnail cache
    pub previews: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            previews: true,
        }
    }
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: config.engine.clone(),
            previews: config.cache.enabled,
        }
    }
}

/// Outcome of [`ingest`]; both lists are sorted by path
#[derive(Debug, Default)]
pub struct IngestReport {
    pub accepted: Vec<IngestedFile>,
    pub rejected: Vec<TaskError>,
}

impl IngestReport {
    /// Tasks ready to hand to the scheduler
    pub fn tasks(&self) -> Vec<ImageTask> {
        self.accepted.iter().map(|file| file.task.clone()).collect()
    }
}

/// Ingest files and directories
pub fn ingest(paths: &[PathBuf], options: &IngestOptions, cache: Option<&ThumbnailCache>) -> Result<IngestReport> {
    ingest_with_events(paths, options, cache, None)
}

/// [`ingest`], streaming one event per file as it is inspected
pub fn ingest_with_events(
    paths: &[PathBuf],
    options: &IngestOptions,
    cache: Option<&ThumbnailCache>,
    events: Option<&Sender<IngestEvent>>,
) -> Result<IngestReport> {
    let candidates = expand_inputs(paths, options.engine.max_scan_depth);
    let total = candidates.len();
    if total == 0 {
        return Ok(IngestReport::default());
    }

    let limit = options.engine.max_files;
    info!("Ingesting {} files", total.min(limit));

    let validator = ImageValidator::from_config(&options.engine);
    let current = AtomicUsize::new(0);

    let report_outcome = |result: Result<IngestedFile>, path: &Path| {
        let position = current.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok(file) => {
                if let Some(events) = events {
                    let _ = events.send(IngestEvent::Scanned {
                        file: Box::new(file.clone()),
                        current: position,
                        total,
                    });
                }
                Ok(file)
            }
            Err(e) => {
                warn!("Rejected {:?}: {}", path, e);
                let error = TaskError::new(path, &e);
                if let Some(events) = events {
                    let _ = events.send(IngestEvent::Rejected {
                        path: path.to_path_buf(),
                        error: error.clone(),
                        current: position,
                        total,
                    });
                }
                Err(error)
            }
        }
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.engine.worker_count())
        .thread_name(|i| format!("ironpress-ingest-{i}"))
        .build()
        .map_err(|e| IronPressError::system(format!("Failed to start ingestion pool: {e}")))?;

    let outcomes: Vec<std::result::Result<IngestedFile, TaskError>> = pool.install(|| {
        candidates
            .par_iter()
            .enumerate()
            .map(|(index, path)| {
                let result = if index < limit {
                    inspect(path, options, &validator, cache)
                } else {
                    Err(IronPressError::ingestion(
                        format!("Batch limit of {limit} files exceeded"),
                        Some(path.clone()),
                    ))
                };

                report_outcome(result, path)
            })
            .collect()
    });

    let mut report = IngestReport::default();
    for outcome in outcomes {
        match outcome {
            Ok(file) => report.accepted.push(file),
            Err(error) => report.rejected.push(error),
        }
    }

    info!(
        "Ingestion finished: {} accepted, {} rejected",
        report.accepted.len(),
        report.rejected.len()
    );
    Ok(report)
}

/// Expand directories, then sort and deduplicate
fn expand_inputs(paths: &[PathBuf], max_depth: usize) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for input in paths {
        if input.is_dir() {
            for entry in WalkDir::new(input).max_depth(max_depth) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable entry under {:?}: {}", input, e);
                        continue;
                    }
                };

                let supported = entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(is_supported_input_format);

                if entry.file_type().is_file() && supported {
                    files.push(absolute(entry.path()));
                }
            }
        } else {
            files.push(absolute(input));
        }
    }

    files.sort();
    files.dedup();
    debug!("Expanded {} inputs to {} files", paths.len(), files.len());
    files
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn inspect(
    path: &Path,
    options: &IngestOptions,
    validator: &ImageValidator,
    cache: Option<&ThumbnailCache>,
) -> Result<IngestedFile> {
    let validation = validator.validate_file(path)?;
    let bytes = SourceBytes::open(path, options.engine.mmap_threshold).with_file_context(path)?;

    let dimensions = read_dimensions(&bytes);
    if let Some((width, height)) = dimensions {
        validator.validate_dimensions(width, height, Some(path))?;
    }

    let detected_color_profile = detect_profile_lenient(&bytes);
    let task = ImageTask {
        source_path: path.to_path_buf(),
        byte_size: validation.file_size,
        needs_color_conversion: needs_conversion(&detected_color_profile),
        detected_mimetype: validation.mimetype,
        last_modified: validation.modified,
        detected_color_profile,
        dimensions,
    };

    let capture = read_capture_metadata(&bytes);

    let preview_path = match cache {
        Some(cache) if options.previews => {
            let generated = cache.get_or_create(path, task.last_modified, || {
                render_thumbnail_from_bytes(
                    &bytes,
                    &task.detected_mimetype,
                    cache.thumbnail_size(),
                    cache.thumbnail_quality(),
                )
            });
            match generated {
                Ok(_) => Some(cache.entry_path(path, task.last_modified)).filter(|p| p.exists()),
                Err(e) => {
                    debug!("No preview for {:?}: {}", path, e);
                    None
                }
            }
        }
        _ => None,
    };

    Ok(IngestedFile {
        task,
        preview_path,
        capture,
    })
}

/// Width and height from the container header, without decoding pixels
pub fn read_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// EXIF capture settings; `None` when the file carries no EXIF block
pub fn read_capture_metadata(bytes: &[u8]) -> Option<CaptureMetadata> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;

    let ascii = |tag: Tag| -> Option<String> {
        match &exif.get_field(tag, In::PRIMARY)?.value {
            Value::Ascii(values) => values
                .first()
                .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').trim().to_string())
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    };
    let uint = |tag: Tag| exif.get_field(tag, In::PRIMARY)?.value.get_uint(0);
    let rational = |tag: Tag| match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(values) => values.first().filter(|r| r.denom != 0).copied(),
        _ => None,
    };

    let exposure_time = rational(Tag::ExposureTime).map(|r| {
        if r.num == 1 {
            format!("1/{}", r.denom)
        } else {
            format!("{:.2}s", r.to_f64())
        }
    });

    let metadata = CaptureMetadata {
        make: ascii(Tag::Make),
        model: ascii(Tag::Model),
        date_taken: ascii(Tag::DateTimeOriginal).or_else(|| ascii(Tag::DateTime)),
        orientation: uint(Tag::Orientation),
        iso: uint(Tag::PhotographicSensitivity),
        exposure_time,
        f_number: rational(Tag::FNumber).map(|r| r.to_f64()),
        focal_length: rational(Tag::FocalLength).map(|r| r.to_f64()),
    };

    (!metadata.is_empty()).then_some(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use exif::experimental::Writer;
    use exif::{Field, Rational};
    use image::{DynamicImage, Rgb, RgbImage};
    use img_parts::jpeg::Jpeg;
    use img_parts::ImageEXIF;

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 90]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
            .unwrap();
        out
    }

    fn with_exif(jpeg: Vec<u8>) -> Vec<u8> {
        let fields = [
            Field {
                tag: Tag::Make,
                ifd_num: In::PRIMARY,
                value: Value::Ascii(vec![b"Canon".to_vec()]),
            },
            Field {
                tag: Tag::Model,
                ifd_num: In::PRIMARY,
                value: Value::Ascii(vec![b"EOS R5".to_vec()]),
            },
            Field {
                tag: Tag::Orientation,
                ifd_num: In::PRIMARY,
                value: Value::Short(vec![6]),
            },
            Field {
                tag: Tag::PhotographicSensitivity,
                ifd_num: In::PRIMARY,
                value: Value::Short(vec![400]),
            },
            Field {
                tag: Tag::ExposureTime,
                ifd_num: In::PRIMARY,
                value: Value::Rational(vec![Rational { num: 1, denom: 250 }]),
            },
            Field {
                tag: Tag::FNumber,
                ifd_num: In::PRIMARY,
                value: Value::Rational(vec![Rational { num: 28, denom: 10 }]),
            },
        ];

        let mut writer = Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, false).unwrap();

        let mut jpeg = Jpeg::from_bytes(jpeg.into()).unwrap();
        jpeg.set_exif(Some(tiff.into_inner().into()));
        let mut out = Vec::new();
        jpeg.encoder().write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_read_dimensions_from_header() {
        assert_eq!(read_dimensions(&jpeg_bytes(40, 24)), Some((40, 24)));
        assert_eq!(read_dimensions(b"not an image"), None);
    }

    #[test]
    fn test_capture_metadata() {
        let bytes = with_exif(jpeg_bytes(16, 16));
        let capture = read_capture_metadata(&bytes).unwrap();

        assert_eq!(capture.make.as_deref(), Some("Canon"));
        assert_eq!(capture.model.as_deref(), Some("EOS R5"));
        assert_eq!(capture.orientation, Some(6));
        assert_eq!(capture.iso, Some(400));
        assert_eq!(capture.exposure_time.as_deref(), Some("1/250"));
        assert!((capture.f_number.unwrap() - 2.8).abs() < 1e-9);
        assert_eq!(capture.focal_length, None);
    }

    #[test]
    fn test_no_exif() {
        assert_eq!(read_capture_metadata(&jpeg_bytes(8, 8)), None);
    }

    #[test]
    fn test_task_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.jpg");
        std::fs::write(&path, jpeg_bytes(32, 20)).unwrap();

        let task = ImageTask::from_path(&path).unwrap();
        assert_eq!(task.detected_mimetype, "image/jpeg");
        assert_eq!(task.dimensions, Some((32, 20)));
        assert_eq!(task.detected_color_profile, ColorProfile::Srgb);
        assert!(!task.needs_color_conversion);
        assert!(task.last_modified_timestamp() > 0);
    }

    #[test]
    fn test_ingest_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), jpeg_bytes(20, 20)).unwrap();
        std::fs::write(dir.path().join("a.jpg"), with_exif(jpeg_bytes(20, 20))).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored by the walker").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/c.jpg"), jpeg_bytes(20, 20)).unwrap();
        std::fs::write(dir.path().join("empty.png"), b"").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ThumbnailCache::open_in(cache_dir.path()).unwrap();
        let inputs = vec![dir.path().to_path_buf(), dir.path().join("b.jpg")];
        let report = ingest(&inputs, &IngestOptions::default(), Some(&cache)).unwrap();

        let names: Vec<_> = report
            .accepted
            .iter()
            .map(|f| f.task.source_path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["a.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].path.ends_with("empty.png"));

        assert!(report.accepted[0].capture.is_some());
        assert!(report.accepted[1].capture.is_none());
        for file in &report.accepted {
            assert!(file.preview_path.as_ref().unwrap().exists());
        }
    }

    #[test]
    fn test_ingest_limits_and_events() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1.jpg", "2.jpg", "3.jpg"] {
            std::fs::write(dir.path().join(name), jpeg_bytes(10, 10)).unwrap();
        }

        let mut options = IngestOptions {
            previews: false,
            ..IngestOptions::default()
        };
        options.engine.max_files = 2;

        let (tx, rx) = unbounded();
        let report = ingest_with_events(&[dir.path().to_path_buf()], &options, None, Some(&tx)).unwrap();
        drop(tx);

        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].message.contains("limit"));

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 3);
        let mut positions: Vec<_> = events
            .iter()
            .map(|e| match e {
                IngestEvent::Scanned { current, total, .. } | IngestEvent::Rejected { current, total, .. } => {
                    assert_eq!(*total, 3);
                    *current
                }
            })
            .collect();
        positions.sort_unstable();
        assert_eq!(positions, [1, 2, 3]);
    }

    #[test]
    fn test_ingest_nothing() {
        let report = ingest(&[], &IngestOptions::default(), None).unwrap();
        assert!(report.accepted.is_empty() && report.rejected.is_empty());
    }
}
