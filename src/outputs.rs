//! Packaging of generated outputs into a zip archive for download.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDate};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const DOWNLOAD_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Error)]
pub enum OutputsError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write archive {path:?}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    Date(String),
}

pub type OutputsResult<T> = Result<T, OutputsError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> OutputsError + '_ {
    move |source| OutputsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Which outputs go into the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFilter {
    #[default]
    All,
    /// The N most recently modified images.
    Last(usize),
    /// Images modified on or after this local date.
    Since(NaiveDate),
}

/// Parse `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> OutputsResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| OutputsError::Date(value.to_string()))
}

/// A written archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadArchive {
    pub path: PathBuf,
    pub file_count: usize,
    pub size_bytes: u64,
}

/// Zips images from the output directory into the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPackager {
    pub output_dir: PathBuf,
    pub download_dir: PathBuf,
}

impl Default for OutputPackager {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/workspace/sweettea/output"),
            download_dir: PathBuf::from("/workspace/downloads"),
        }
    }
}

fn is_download_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| DOWNLOAD_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl OutputPackager {
    pub fn new(output_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            download_dir: download_dir.into(),
        }
    }

    /// Images matching `filter`, newest first.
    pub fn collect(&self, filter: OutputFilter) -> OutputsResult<Vec<PathBuf>> {
        let dir = &self.output_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let path = entry.map_err(io_err(dir))?.path();
            if !path.is_file() || !is_download_image(&path) {
                continue;
            }
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(io_err(&path))?;
            files.push((modified, path));
        }
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let selected = match filter {
            OutputFilter::All => files,
            OutputFilter::Last(n) => files.into_iter().take(n).collect(),
            OutputFilter::Since(date) => files
                .into_iter()
                .filter(|(modified, _)| DateTime::<Local>::from(*modified).date_naive() >= date)
                .collect(),
        };
        Ok(selected.into_iter().map(|(_, path)| path).collect())
    }

    /// Write `outputs_<timestamp>.zip` (Deflate). `None` when nothing matches.
    pub fn create_zip(&self, filter: OutputFilter) -> OutputsResult<Option<DownloadArchive>> {
        let files = self.collect(filter)?;
        if files.is_empty() {
            log::info!("No files to download from {:?}", self.output_dir);
            return Ok(None);
        }

        fs::create_dir_all(&self.download_dir).map_err(io_err(&self.download_dir))?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let zip_path = self.download_dir.join(format!("outputs_{timestamp}.zip"));

        let zip_err = |source| OutputsError::Zip {
            path: zip_path.clone(),
            source,
        };
        let mut zip = ZipWriter::new(File::create(&zip_path).map_err(io_err(&zip_path))?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for file in &files {
            let Some(name) = file.file_name() else {
                continue;
            };
            zip.start_file(name.to_string_lossy().into_owned(), options)
                .map_err(zip_err)?;
            let mut src = File::open(file).map_err(io_err(file))?;
            io::copy(&mut src, &mut zip).map_err(io_err(&zip_path))?;
        }
        zip.finish().map_err(zip_err)?;

        let size_bytes = fs::metadata(&zip_path).map_err(io_err(&zip_path))?.len();
        log::info!("Created {:?} with {} files", zip_path, files.len());
        Ok(Some(DownloadArchive {
            path: zip_path,
            file_count: files.len(),
            size_bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2025-03-01").unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
        );
        assert!(matches!(parse_date("03/01/2025"), Err(OutputsError::Date(_))));
        assert!(parse_date("2025-13-01").is_err());
    }

    #[test]
    fn test_is_download_image() {
        assert!(is_download_image(Path::new("x.jpeg")));
        assert!(is_download_image(Path::new("x.PNG")));
        assert!(!is_download_image(Path::new("metadata.json")));
    }

    #[test]
    fn test_missing_output_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let packager = OutputPackager::new(dir.path().join("missing"), dir.path().join("dl"));
        assert!(packager.collect(OutputFilter::All).unwrap().is_empty());
        assert!(packager.create_zip(OutputFilter::All).unwrap().is_none());
        assert!(!dir.path().join("dl").exists());
    }
}
