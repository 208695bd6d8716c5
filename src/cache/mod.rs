//! Persistent preview cache
//!
//! Previews live as `<key>.webp` files in one flat directory. The key is a
//! blake3 digest of the absolute source path and its modification time, so an
//! edited source simply misses and the stale entry ages out. Entries older
//! than the retention window are purged whenever the cache is opened.
//!
//! Concurrent requests for the same key are coalesced: the first caller
//! generates while the others block on the in-flight slot and receive the
//! same bytes. Requests for different keys never wait on each other.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use image::{ImageFormat, ImageReader};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, OutputFormat};
use crate::error::{ErrorContext, IronPressError, Result};
use crate::processing::codec::{self, QualityParams};
use crate::processing::formats::{is_complete_webp, sniff_mime};
use crate::processing::resize::create_thumbnail;

const ENTRY_EXTENSION: &str = "webp";

/// Result shared between the generating caller and those waiting on it
type Shared = std::result::Result<Arc<Vec<u8>>, String>;

#[derive(Default)]
struct Slot {
    state: Mutex<Option<Shared>>,
    ready: Condvar,
}

impl Slot {
    fn wait(&self) -> Shared {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut state);
        }
    }
}

/// Disk-backed thumbnail store
pub struct ThumbnailCache {
    directory: PathBuf,
    retention: Duration,
    thumbnail_size: u32,
    thumbnail_quality: u8,
    in_flight: Mutex<HashMap<String, Arc<Slot>>>,
}

/// Entry count and size of the cache directory
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub directory: PathBuf,
    pub entries: usize,
    pub total_bytes: u64,
}

impl ThumbnailCache {
    /// Open (creating if needed) the cache described by `config` and evict
    /// expired entries
    pub fn open(config: &CacheConfig) -> Result<Self> {
        Self::open_with_eviction(config).map(|(cache, _)| cache)
    }

    /// [`ThumbnailCache::open`], also returning how many entries were evicted
    pub fn open_with_eviction(config: &CacheConfig) -> Result<(Self, usize)> {
        let directory = config.directory();
        fs::create_dir_all(&directory).map_err(|e| {
            IronPressError::cache(format!(
                "Failed to create cache directory {}: {e}",
                directory.display()
            ))
        })?;

        let cache = Self {
            directory,
            retention: config.retention(),
            thumbnail_size: config.thumbnail_size,
            thumbnail_quality: config.thumbnail_quality,
            in_flight: Mutex::new(HashMap::new()),
        };

        let evicted = match cache.purge_expired() {
            Ok(removed) => {
                if removed > 0 {
                    info!("Evicted {} expired thumbnails", removed);
                }
                removed
            }
            Err(e) => {
                warn!("Thumbnail eviction failed: {}", e);
                0
            }
        };

        Ok((cache, evicted))
    }

    /// Open a cache in `directory` with default settings
    pub fn open_in<P: Into<PathBuf>>(directory: P) -> Result<Self> {
        Self::open(&CacheConfig {
            directory: Some(directory.into()),
            ..CacheConfig::default()
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Location of the entry for a source path at a given modification time
    pub fn entry_path(&self, source: &Path, modified: SystemTime) -> PathBuf {
        self.entry_path_for_key(&cache_key(source, modified))
    }

    fn entry_path_for_key(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    /// Whether a usable entry exists
    pub fn contains(&self, source: &Path, modified: SystemTime) -> bool {
        self.read_entry(&cache_key(source, modified)).is_some()
    }

    /// Return the cached preview or run `generator` to produce it.
    ///
    /// At most one generator runs per key at a time. Cache I/O failures are
    /// logged and never fail the call; generator errors are returned.
    pub fn get_or_create<F>(&self, source: &Path, modified: SystemTime, generator: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let key = cache_key(source, modified);

        if let Some(bytes) = self.read_entry(&key) {
            debug!("Thumbnail cache hit for {:?}", source);
            return Ok(bytes);
        }

        let (slot, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot::default());
                    in_flight.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            debug!("Waiting for in-flight thumbnail of {:?}", source);
            return slot
                .wait()
                .map(|bytes| bytes.as_ref().clone())
                .map_err(|message| IronPressError::cache(format!("Thumbnail generation failed: {message}")));
        }

        let publication = Publication {
            cache: self,
            key: &key,
            slot: &slot,
            done: false,
        };

        // Another leader may have finished between the first read and the lock
        if let Some(bytes) = self.read_entry(&key) {
            publication.publish(Ok(Arc::new(bytes.clone())));
            return Ok(bytes);
        }

        debug!("Generating thumbnail for {:?}", source);
        match generator() {
            Ok(bytes) => {
                if let Err(e) = self.write_entry(&key, &bytes) {
                    warn!("Could not store thumbnail for {:?}: {}", source, e);
                }
                publication.publish(Ok(Arc::new(bytes.clone())));
                Ok(bytes)
            }
            Err(e) => {
                publication.publish(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Preview for a file on disk, generated with [`render_thumbnail_from_bytes`]
    pub fn thumbnail_for(&self, source: &Path) -> Result<Vec<u8>> {
        let source = fs::canonicalize(source).with_file_context(source)?;
        let modified = fs::metadata(&source)
            .and_then(|m| m.modified())
            .with_file_context(&source)?;

        self.get_or_create(&source, modified, || {
            let bytes = fs::read(&source).with_file_context(&source)?;
            render_thumbnail_from_bytes(
                &bytes,
                &sniff_mime(&bytes, &source),
                self.thumbnail_size,
                self.thumbnail_quality,
            )
            .with_file_context(&source)
        })
    }

    pub fn thumbnail_size(&self) -> u32 {
        self.thumbnail_size
    }

    pub fn thumbnail_quality(&self) -> u8 {
        self.thumbnail_quality
    }

    fn read_entry(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path_for_key(key);
        match fs::read(&path) {
            Ok(bytes) if is_intact(&bytes) => Some(bytes),
            Ok(_) => {
                warn!("Discarding corrupt thumbnail {:?}", path);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not remove {:?}: {}", path, e);
                }
                None
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Could not read thumbnail {:?}: {}", path, e);
                None
            }
        }
    }

    /// Write through a temp file in the same directory so readers never see a
    /// partial entry
    fn write_entry(&self, key: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.directory)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.directory)?;
        temp.write_all(bytes)?;
        temp.persist(self.entry_path_for_key(key))
            .map_err(|e| IronPressError::cache(format!("Failed to persist thumbnail: {}", e.error)))?;
        Ok(())
    }

    /// Remove entries older than the retention window, returning how many
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(UNIX_EPOCH);

        self.remove_entries(|modified| modified < cutoff)
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<usize> {
        self.remove_entries(|_| true)
    }

    fn remove_entries<F: Fn(SystemTime) -> bool>(&self, should_remove: F) -> Result<usize> {
        let entries = fs::read_dir(&self.directory).map_err(|e| {
            IronPressError::cache(format!(
                "Failed to read cache directory {}: {e}",
                self.directory.display()
            ))
        })?;

        let mut removed = 0;
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            if should_remove(modified) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Could not remove {:?}: {}", path, e),
                }
            }
        }

        debug!("Removed {} cache entries", removed);
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let entries = fs::read_dir(&self.directory).map_err(|e| {
            IronPressError::cache(format!(
                "Failed to read cache directory {}: {e}",
                self.directory.display()
            ))
        })?;

        let mut stats = CacheStats {
            directory: self.directory.clone(),
            entries: 0,
            total_bytes: 0,
        };

        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                stats.entries += 1;
                stats.total_bytes += metadata.len();
            }
        }

        Ok(stats)
    }
}

/// Publishes the leader's outcome exactly once, including when the
/// generator panics
struct Publication<'a> {
    cache: &'a ThumbnailCache,
    key: &'a str,
    slot: &'a Arc<Slot>,
    done: bool,
}

impl Publication<'_> {
    fn publish(mut self, result: Shared) {
        self.finish(result);
    }

    fn finish(&mut self, result: Shared) {
        if self.done {
            return;
        }
        self.done = true;

        *self.slot.state.lock() = Some(result);
        self.slot.ready.notify_all();
        self.cache.in_flight.lock().remove(self.key);
    }
}

impl Drop for Publication<'_> {
    fn drop(&mut self) {
        self.finish(Err("generator panicked".to_string()));
    }
}

/// blake3 digest of the path bytes followed by the mtime in nanoseconds
pub fn cache_key(source: &Path, modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_os_str().as_encoded_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Stock generator: decode, fit within 150x150, WebP quality 60
pub fn render_thumbnail(source: &Path) -> Result<Vec<u8>> {
    let defaults = CacheConfig::default();
    let bytes = fs::read(source).with_file_context(source)?;
    render_thumbnail_from_bytes(
        &bytes,
        &sniff_mime(&bytes, source),
        defaults.thumbnail_size,
        defaults.thumbnail_quality,
    )
    .with_file_context(source)
}

/// Render a preview from encoded bytes already in memory
pub fn render_thumbnail_from_bytes(bytes: &[u8], mimetype: &str, max_side: u32, quality: u8) -> Result<Vec<u8>> {
    let image = codec::decode(bytes, mimetype)?;
    let thumbnail = create_thumbnail(&image, max_side);
    drop(image);

    let encoded = codec::encode(
        &thumbnail,
        OutputFormat::WebP,
        QualityParams {
            quality,
            lossless: false,
        },
    )?;
    Ok(encoded)
}

/// A stored entry is served only when its RIFF length matches the file and
/// the VP8 header parses
fn is_intact(bytes: &[u8]) -> bool {
    is_complete_webp(bytes)
        && ImageReader::with_format(Cursor::new(bytes), ImageFormat::WebP)
            .into_dimensions()
            .is_ok()
}
