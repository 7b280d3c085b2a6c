//! Batch selection workflow for generated images.
//!
//! Images land in a fast scratch directory; a batch session picks the keepers
//! and copies them into a per-batch directory and the persistent output
//! directory. Each batch carries a `metadata.json` sidecar.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const METADATA_FILE: &str = "metadata.json";
pub const ARCHIVE_DIR: &str = "auto_archive";
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "webp"];

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid metadata {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid selection pattern {0:?}")]
    Pattern(String),
    #[error("batch {0:?} does not exist")]
    UnknownBatch(String),
}

pub type BatchResult<T> = Result<T, BatchError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BatchError + '_ {
    move |source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Contents of a batch's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub name: String,
    pub started: String,
    pub temp_count: u64,
    pub selected_count: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_selection: Option<String>,
}

impl BatchMetadata {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started: iso_now(),
            temp_count: 0,
            selected_count: 0,
            status: "active".to_string(),
            last_selection: None,
        }
    }

    pub fn load(path: &Path) -> BatchResult<Self> {
        let content = fs::read_to_string(path).map_err(io_err(path))?;
        serde_json::from_str(&content).map_err(|source| BatchError::Metadata {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> BatchResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|source| BatchError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err(path))
    }
}

fn iso_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Directory layout of the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPaths {
    /// Fast local scratch directory the generator writes into.
    pub temp_dir: PathBuf,
    /// Persistent output directory.
    pub output_dir: PathBuf,
    /// Root holding one directory per batch.
    pub batch_dir: PathBuf,
}

impl Default for WorkflowPaths {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/opt/ComfyUI/temp"),
            output_dir: PathBuf::from("/workspace/sweettea/output"),
            batch_dir: PathBuf::from("/workspace/batches"),
        }
    }
}

/// An image waiting in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl TempImage {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.modified)
            .unwrap_or_default()
    }
}

/// Per-batch summary for `stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub name: String,
    pub started: String,
    pub selected_count: u64,
    pub size_bytes: u64,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Parse a selection pattern into 1-based indices.
///
/// Accepts `lastN` (the N newest, capped at `available`), `A-B` (end capped
/// at `available`), `a,b,c` and a single index. List and single indices are
/// not range-checked here.
pub fn parse_selection(pattern: &str, available: usize) -> BatchResult<Vec<usize>> {
    let pattern = pattern.trim();
    let bad = || BatchError::Pattern(pattern.to_string());
    let parse = |s: &str| s.trim().parse::<usize>().map_err(|_| bad());

    if let Some(n) = pattern.strip_prefix("last") {
        let n = parse(n)?;
        return Ok((1..=n.min(available)).collect());
    }
    if let Some((start, end)) = pattern.split_once('-') {
        let (start, end) = (parse(start)?, parse(end)?);
        // Indices past `available` are never selectable.
        return Ok((start..=end.min(available)).collect());
    }
    if pattern.contains(',') {
        return pattern.split(',').map(parse).collect();
    }
    Ok(vec![parse(pattern)?])
}

/// Batch selection workflow over a `WorkflowPaths` layout.
#[derive(Debug, Clone)]
pub struct BatchWorkflow {
    paths: WorkflowPaths,
}

impl BatchWorkflow {
    /// Open the workflow, creating the batch root if needed.
    pub fn new(paths: WorkflowPaths) -> BatchResult<Self> {
        fs::create_dir_all(&paths.batch_dir).map_err(io_err(&paths.batch_dir))?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &WorkflowPaths {
        &self.paths
    }

    pub fn batch_path(&self, name: &str) -> PathBuf {
        self.paths.batch_dir.join(name)
    }

    /// Start a batch: write fresh metadata and reset the scratch directory.
    pub fn start_batch(&self, name: Option<&str>) -> BatchResult<String> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| Local::now().format(TIMESTAMP_FORMAT).to_string());

        let batch_path = self.batch_path(&name);
        fs::create_dir_all(&batch_path).map_err(io_err(&batch_path))?;
        BatchMetadata::new(&name).save(&batch_path.join(METADATA_FILE))?;

        self.reset_temp()?;
        log::info!("Batch '{}' started at {:?}", name, batch_path);
        Ok(name)
    }

    /// Images in the scratch directory, newest first.
    pub fn list_temp(&self) -> BatchResult<Vec<TempImage>> {
        let temp = &self.paths.temp_dir;
        if !temp.exists() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(temp).map_err(io_err(temp))? {
            let entry = entry.map_err(io_err(temp))?;
            let path = entry.path();
            if !path.is_file() || !is_image(&path) {
                continue;
            }
            let meta = entry.metadata().map_err(io_err(&path))?;
            images.push(TempImage {
                size_bytes: meta.len(),
                modified: meta.modified().map_err(io_err(&path))?,
                path,
            });
        }

        images.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(images)
    }

    /// Copy the images at 1-based `indices` (into `list_temp` order) into the
    /// batch and output directories. Out-of-range indices are skipped.
    pub fn select_indices(&self, indices: &[usize], batch: &str) -> BatchResult<Vec<String>> {
        let batch_path = self.batch_path(batch);
        fs::create_dir_all(&batch_path).map_err(io_err(&batch_path))?;
        fs::create_dir_all(&self.paths.output_dir).map_err(io_err(&self.paths.output_dir))?;

        let images = self.list_temp()?;
        let mut selected = Vec::new();

        for &idx in indices {
            if idx == 0 || idx > images.len() {
                log::debug!("Skipping out-of-range index {} ({} images)", idx, images.len());
                continue;
            }
            let src = &images[idx - 1].path;
            let new_name = self.selection_name(src, batch)?;

            let batch_dst = batch_path.join(&new_name);
            fs::copy(src, &batch_dst).map_err(io_err(&batch_dst))?;
            let output_dst = self.paths.output_dir.join(&new_name);
            fs::copy(src, &output_dst).map_err(io_err(&output_dst))?;

            log::info!("Selected: {:?} -> {}", src.file_name().unwrap_or_default(), new_name);
            selected.push(new_name);
        }

        let metadata_path = batch_path.join(METADATA_FILE);
        if metadata_path.exists() {
            let mut metadata = BatchMetadata::load(&metadata_path)?;
            metadata.selected_count += selected.len() as u64;
            metadata.last_selection = Some(iso_now());
            metadata.save(&metadata_path)?;
        }

        log::info!("Moved {} images to {:?}", selected.len(), batch_path);
        Ok(selected)
    }

    /// Select by pattern (`last5`, `1-10`, `1,3,5`, `7`).
    pub fn select(&self, pattern: &str, batch: &str) -> BatchResult<Vec<String>> {
        let available = self.list_temp()?.len();
        let indices = parse_selection(pattern, available)?;
        self.select_indices(&indices, batch)
    }

    /// `<batch>_<crc32 of contents>_<timestamp><.ext>`
    fn selection_name(&self, src: &Path, batch: &str) -> BatchResult<String> {
        let bytes = fs::read(src).map_err(io_err(src))?;
        let hash = crc32fast::hash(&bytes);
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        let ext = src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Ok(format!("{batch}_{hash:08x}_{timestamp}{ext}"))
    }

    /// Number of entries currently in the scratch directory.
    pub fn temp_entry_count(&self) -> BatchResult<usize> {
        let temp = &self.paths.temp_dir;
        if !temp.exists() {
            return Ok(0);
        }
        Ok(fs::read_dir(temp).map_err(io_err(temp))?.count())
    }

    /// Delete everything in the scratch directory.
    pub fn clear_temp(&self) -> BatchResult<()> {
        self.reset_temp()?;
        log::info!("Temp directory cleared");
        Ok(())
    }

    fn reset_temp(&self) -> BatchResult<()> {
        let temp = &self.paths.temp_dir;
        if temp.exists() {
            fs::remove_dir_all(temp).map_err(io_err(temp))?;
        }
        fs::create_dir_all(temp).map_err(io_err(temp))
    }

    /// Summaries of `batch`, or of the 10 most recent batches (by name).
    pub fn stats(&self, batch: Option<&str>) -> BatchResult<Vec<BatchSummary>> {
        let mut batches = match batch {
            Some(name) => {
                let path = self.batch_path(name);
                if !path.is_dir() {
                    return Err(BatchError::UnknownBatch(name.to_string()));
                }
                vec![path]
            }
            None => {
                let root = &self.paths.batch_dir;
                let mut dirs = Vec::new();
                for entry in fs::read_dir(root).map_err(io_err(root))? {
                    let path = entry.map_err(io_err(root))?.path();
                    if path.is_dir() {
                        dirs.push(path);
                    }
                }
                dirs
            }
        };
        batches.sort_by(|a, b| b.cmp(a));

        let mut summaries = Vec::new();
        for dir in batches.into_iter().take(10) {
            let metadata_path = dir.join(METADATA_FILE);
            if !metadata_path.exists() {
                continue;
            }
            let metadata = BatchMetadata::load(&metadata_path)?;

            let mut size_bytes = 0;
            for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
                let path = entry.map_err(io_err(&dir))?.path();
                if path.is_file() && is_image(&path) {
                    size_bytes += fs::metadata(&path).map_err(io_err(&path))?.len();
                }
            }

            summaries.push(BatchSummary {
                name: metadata.name,
                started: metadata.started.chars().take(19).collect(),
                selected_count: metadata.selected_count,
                size_bytes,
            });
        }
        Ok(summaries)
    }

    /// Move scratch files older than `threshold` into
    /// `<batch_dir>/auto_archive/<YYYYMMDD>/`. Returns the new paths.
    pub fn auto_organize(&self, threshold: Duration) -> BatchResult<Vec<PathBuf>> {
        let temp = &self.paths.temp_dir;
        if !temp.exists() {
            return Ok(Vec::new());
        }

        let now = SystemTime::now();
        let mut old_files = Vec::new();
        for entry in fs::read_dir(temp).map_err(io_err(temp))? {
            let entry = entry.map_err(io_err(temp))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(io_err(&path))?;
            if now.duration_since(modified).unwrap_or_default() > threshold {
                old_files.push(path);
            }
        }

        if old_files.is_empty() {
            return Ok(Vec::new());
        }
        log::info!(
            "Found {} files older than {} minutes",
            old_files.len(),
            threshold.as_secs() / 60
        );

        let archive = self
            .paths
            .batch_dir
            .join(ARCHIVE_DIR)
            .join(Local::now().format("%Y%m%d").to_string());
        fs::create_dir_all(&archive).map_err(io_err(&archive))?;

        let mut moved = Vec::with_capacity(old_files.len());
        for src in old_files {
            let Some(name) = src.file_name() else {
                continue;
            };
            let dst = archive.join(name);
            move_file(&src, &dst)?;
            moved.push(dst);
        }

        log::info!("Archived to {:?}", archive);
        Ok(moved)
    }
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> BatchResult<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(io_err(dst))?;
    fs::remove_file(src).map_err(io_err(src))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("last3", 10).unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_selection("last5", 2).unwrap(), vec![1, 2]);
        assert_eq!(parse_selection("2-4", 10).unwrap(), vec![2, 3, 4]);
        assert_eq!(parse_selection("1, 3,5", 10).unwrap(), vec![1, 3, 5]);
        assert_eq!(parse_selection("7", 3).unwrap(), vec![7]);
        assert!(parse_selection("4-2", 10).unwrap().is_empty());
        assert_eq!(parse_selection("2-9", 4).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_parse_selection_huge_range_is_capped() {
        assert_eq!(parse_selection("1-2305843009213693952", 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            parse_selection(&format!("2-{}", usize::MAX), 2).unwrap(),
            vec![2]
        );
        assert!(parse_selection("5-1000000000000", 3).unwrap().is_empty());
    }

    #[test]
    fn test_parse_selection_errors() {
        for bad in ["lastx", "a-3", "1,,2", "", "first2"] {
            assert!(
                matches!(parse_selection(bad, 5), Err(BatchError::Pattern(_))),
                "pattern {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_is_image() {
        assert!(is_image(Path::new("a/b/ComfyUI_0001.png")));
        assert!(is_image(Path::new("x.JPG")));
        assert!(is_image(Path::new("x.webp")));
        assert!(!is_image(Path::new("x.json")));
        assert!(!is_image(Path::new("png")));
    }

    #[test]
    fn test_metadata_roundtrip_keeps_last_selection_optional() {
        let metadata = BatchMetadata::new("portraits");
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("last_selection"));
        let parsed: BatchMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.status, "active");
    }
}
