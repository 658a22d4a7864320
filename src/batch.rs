//! Retroactive compression of a legacy upload directory.
//!
//! Candidates are numbered in file-name order before any work starts, then
//! processed on a bounded worker pool. A file that fails keeps its number, so
//! the outputs of a run with failures have gaps (`1.webp`, `2.webp`,
//! `4.webp`, ...). Originals are only removed once their replacement is on
//! disk.
//!
//! Outputs (`<n>.webp`) are never candidates again, and numbering continues
//! after the highest output already in the directory, so repeated runs only
//! pick up files added since the last one.

use crate::cancel::CancelFlag;
use crate::compressor::Compressor;
use crate::config::{BATCH_MAX_DIMENSION, BATCH_TARGET_BYTES, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::formats::{AcceptedFormat, CANONICAL_EXTENSION, extension_of, is_accepted_path};
use crate::human_size;
use crate::normalizer;
use crate::store;
use rayon::prelude::*;
use serde::Serialize;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;
use walkdir::WalkDir;

/// Run-scoped rename counter. Each run owns its own instance.
#[derive(Debug)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// `n` for a batch output named `<n>.webp`.
pub fn artifact_number(path: &Path) -> Option<u64> {
    if extension_of(path).as_deref() != Some(CANONICAL_EXTENSION) {
        return None;
    }
    let stem = path.file_stem().and_then(OsStr::to_str)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FileOutcome {
    #[serde(rename_all = "camelCase")]
    Succeeded {
        original: String,
        new_name: String,
        bytes_before: u64,
        bytes_after: u64,
    },
    Failed { original: String, reason: String },
    Skipped { original: String },
}

/// State of one batch invocation; summarized and discarded at the end.
#[derive(Debug)]
pub struct BatchRun {
    pub id: Uuid,
    pub directory: PathBuf,
    pub candidates: Vec<PathBuf>,
    pub outcomes: Vec<FileOutcome>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Renamed {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub message: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub renamed: Vec<Renamed>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<BatchFailure>,
}

impl BatchRun {
    fn summarize(self, cancelled: bool) -> BatchSummary {
        let mut summary = BatchSummary {
            run_id: self.id,
            message: String::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled,
            renamed: Vec::new(),
            failures: Vec::new(),
        };
        let mut total_before: u64 = 0;
        let mut total_after: u64 = 0;

        for outcome in self.outcomes {
            match outcome {
                FileOutcome::Succeeded {
                    original,
                    new_name,
                    bytes_before,
                    bytes_after,
                } => {
                    summary.succeeded += 1;
                    total_before = total_before.saturating_add(bytes_before);
                    total_after = total_after.saturating_add(bytes_after);
                    summary.renamed.push(Renamed {
                        from: original,
                        to: new_name,
                    });
                }
                FileOutcome::Failed { original, reason } => {
                    summary.failed += 1;
                    summary.failures.push(BatchFailure {
                        file: original,
                        reason,
                    });
                }
                FileOutcome::Skipped { .. } => summary.skipped += 1,
            }
        }

        let saved = total_before.saturating_sub(total_after);
        let pct = if total_before > 0 {
            (saved as f64) / (total_before as f64) * 100.0
        } else {
            0.0
        };
        summary.message = format!(
            "Compressed {} of {} image(s) in {}. Total saved: {} ({:.2}%){}",
            summary.succeeded,
            self.candidates.len(),
            self.directory.display(),
            human_size(saved),
            pct,
            if cancelled { ". Run was cancelled." } else { "" }
        );
        summary
    }
}

#[derive(Debug)]
pub struct BatchCompressor {
    compressor: Compressor,
    target_bytes: u64,
    max_dimension: u32,
    jobs: usize,
}

impl BatchCompressor {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            compressor: Compressor::new(config.compression)?,
            target_bytes: BATCH_TARGET_BYTES,
            max_dimension: BATCH_MAX_DIMENSION,
            jobs: config.jobs.max(1),
        })
    }

    fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Err(PipelineError::io(
                format!("list {}", dir.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let files = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        Ok(files)
    }

    /// Accepted images directly inside `dir` that are not outputs of an
    /// earlier run, sorted by file name.
    pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
        let files = Self::list_files(dir)?
            .into_iter()
            .filter(|path| is_accepted_path(path) && artifact_number(path).is_none())
            .collect();
        Ok(files)
    }

    /// First number not taken by an existing `<n>.webp` in `dir`.
    pub fn next_free_number(dir: &Path) -> Result<u64> {
        let highest = Self::list_files(dir)?
            .iter()
            .filter_map(|path| artifact_number(path))
            .max();
        Ok(highest.map_or(1, |n| n.saturating_add(1)))
    }

    pub fn run(&self, dir: &Path, cancel: &CancelFlag) -> Result<BatchSummary> {
        let candidates = Self::discover(dir)?;
        let mut run = BatchRun {
            id: Uuid::new_v4(),
            directory: dir.to_path_buf(),
            candidates,
            outcomes: Vec::new(),
        };
        log::info!(
            "🗂  batch {}: {} candidate(s) in {}",
            run.id,
            run.candidates.len(),
            dir.display()
        );

        let counter = SequenceCounter::starting_at(Self::next_free_number(dir)?);
        let numbered: Vec<(u64, &PathBuf)> =
            run.candidates.iter().map(|p| (counter.next(), p)).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| PipelineError::io("start batch workers", io::Error::other(e)))?;

        let outcomes: Vec<FileOutcome> = pool.install(|| {
            numbered
                .par_iter()
                .map(|(seq, path)| self.process_candidate(path, *seq, cancel))
                .collect()
        });
        run.outcomes = outcomes;

        let summary = run.summarize(cancel.is_cancelled());
        log::info!("{}", summary.message);
        Ok(summary)
    }

    fn process_candidate(&self, path: &Path, seq: u64, cancel: &CancelFlag) -> FileOutcome {
        let original = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("file")
            .to_string();

        if cancel.is_cancelled() {
            return FileOutcome::Skipped { original };
        }

        match self.replace(path, seq) {
            Ok((new_name, bytes_before, bytes_after)) => {
                log::info!(
                    "{} → {}: {} → {}",
                    original,
                    new_name,
                    human_size(bytes_before),
                    human_size(bytes_after)
                );
                FileOutcome::Succeeded {
                    original,
                    new_name,
                    bytes_before,
                    bytes_after,
                }
            }
            Err(e) => {
                log::warn!("❌ {}: failed ({})", original, e);
                FileOutcome::Failed {
                    original,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn replace(&self, path: &Path, seq: u64) -> Result<(String, u64, u64)> {
        let raster = normalizer::decode_file(path)?;
        let source_format = raster.source_format;
        let result = self.compressor.compress(
            &raster,
            self.target_bytes,
            self.max_dimension,
            self.max_dimension,
        )?;
        drop(raster);

        // a WebP source is already canonical; never swap it for a bigger file
        let bytes = if result.exceeds_source && source_format == AcceptedFormat::WebP {
            log::info!("{}: keeping smaller WebP source", path.display());
            fs::read(path)
                .map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?
        } else {
            result.bytes
        };

        let new_name = format!("{}.{}", seq, CANONICAL_EXTENSION);
        store::replace_original(path, &new_name, &bytes)?;
        Ok((new_name, result.source_size, bytes.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::fs;
    use std::io::Cursor;

    fn write_jpeg(path: &Path, seed: u32) {
        let img = RgbImage::from_fn(96, 64, |x, y| {
            Rgb([
                (x.wrapping_mul(seed) % 256) as u8,
                (y * 3 % 256) as u8,
                ((x + y + seed) % 256) as u8,
            ])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn compressor(jobs: usize) -> BatchCompressor {
        let config = PipelineConfig {
            jobs,
            ..PipelineConfig::default()
        };
        BatchCompressor::new(&config).unwrap()
    }

    #[test]
    fn test_counter_is_sequential() {
        let counter = SequenceCounter::starting_at(1);
        let values: Vec<u64> = (0..4).map(|_| counter.next()).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.JPG", "notes.txt", "c.webp", "d.gif"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let names: Vec<String> = BatchCompressor::discover(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png", "c.webp"]);
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(artifact_number(Path::new("12.webp")), Some(12));
        assert_eq!(artifact_number(Path::new("dir/3.WEBP")), Some(3));
        assert_eq!(artifact_number(Path::new("12.jpg")), None);
        assert_eq!(artifact_number(Path::new("12a.webp")), None);
        assert_eq!(artifact_number(Path::new("-1.webp")), None);
        assert_eq!(artifact_number(Path::new(".webp")), None);
    }

    #[test]
    fn test_discover_skips_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1.webp", "7.webp", "hero.webp", "2024.jpg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let names: Vec<String> = BatchCompressor::discover(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["2024.jpg", "hero.webp"]);
        assert_eq!(BatchCompressor::next_free_number(dir.path()).unwrap(), 8);
    }

    #[test]
    fn test_next_free_number_of_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(BatchCompressor::next_free_number(dir.path()).unwrap(), 1);
    }

    #[test]
    fn test_second_run_only_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10u32 {
            write_jpeg(&dir.path().join(format!("img_{i:02}.jpg")), i + 1);
        }
        let batch = compressor(3);

        let first = batch.run(dir.path(), &CancelFlag::new()).unwrap();
        assert_eq!(first.succeeded, 10);
        assert_eq!(first.failed, 0);
        let before: Vec<Vec<u8>> = (1..=10)
            .map(|n| fs::read(dir.path().join(format!("{n}.webp"))).unwrap())
            .collect();

        write_jpeg(&dir.path().join("new.jpg"), 42);
        let second = batch.run(dir.path(), &CancelFlag::new()).unwrap();
        assert_eq!(second.succeeded, 1);
        assert_eq!(second.failed, 0);
        assert_eq!(second.renamed[0].from, "new.jpg");
        assert_eq!(second.renamed[0].to, "11.webp");

        for (i, bytes) in before.iter().enumerate() {
            let now = fs::read(dir.path().join(format!("{}.webp", i + 1))).unwrap();
            assert_eq!(&now, bytes);
        }
        assert!(!dir.path().join("new.jpg").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 11);

        // nothing new: a third run is a no-op
        let third = batch.run(dir.path(), &CancelFlag::new()).unwrap();
        assert_eq!(third.succeeded + third.failed + third.skipped, 0);
    }

    #[test]
    fn test_webp_source_never_grows() {
        let dir = tempfile::tempdir().unwrap();
        let img = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 13 % 256) as u8, (y * 29 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let source = webp::Encoder::from_rgb(img.as_raw(), 64, 64)
            .encode(1.0)
            .to_vec();
        fs::write(dir.path().join("tiny.webp"), &source).unwrap();

        let summary = compressor(1).run(dir.path(), &CancelFlag::new()).unwrap();
        assert_eq!(summary.succeeded, 1);
        let out = fs::read(dir.path().join("1.webp")).unwrap();
        assert!(out.len() <= source.len());
        image::load_from_memory_with_format(&out, ImageFormat::WebP).unwrap();
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = tokio_test::assert_err!(
            compressor(1).run(&dir.path().join("nope"), &CancelFlag::new())
        );
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn test_corrupt_file_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10u32 {
            let path = dir.path().join(format!("img_{i:02}.jpg"));
            if i == 3 {
                fs::write(&path, b"\xFF\xD8\xFF\xE0 truncated").unwrap();
            } else {
                write_jpeg(&path, i + 1);
            }
        }

        let summary = compressor(3).run(dir.path(), &CancelFlag::new()).unwrap();
        assert_eq!(summary.succeeded, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
        assert!(!summary.cancelled);
        assert_eq!(summary.failures[0].file, "img_03.jpg");

        let expected: Vec<String> = [1, 2, 3, 5, 6, 7, 8, 9, 10]
            .iter()
            .map(|n| format!("{n}.webp"))
            .collect();
        let produced: Vec<String> = summary.renamed.iter().map(|r| r.to.clone()).collect();
        assert_eq!(produced, expected);
        assert_eq!(summary.renamed[3].from, "img_04.jpg");
        assert_eq!(summary.renamed[3].to, "5.webp");

        for name in &expected {
            let bytes = fs::read(dir.path().join(name)).unwrap();
            image::load_from_memory_with_format(&bytes, ImageFormat::WebP).unwrap();
        }
        // the corrupt original stays, every other original is gone
        assert!(dir.path().join("img_03.jpg").exists());
        assert!(!dir.path().join("4.webp").exists());
        assert!(!dir.path().join("img_00.jpg").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 10);
    }

    #[test]
    fn test_cancelled_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3u32 {
            write_jpeg(&dir.path().join(format!("p{i}.jpg")), i + 2);
        }
        let cancel = CancelFlag::new();
        cancel.cancel();

        let summary = compressor(2).run(dir.path(), &cancel).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.succeeded, 0);
        assert!(dir.path().join("p0.jpg").exists());
    }

    #[test]
    fn test_summary_json_omits_empty_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_jpeg(&dir.path().join("only.jpg"), 5);

        let summary = compressor(1).run(dir.path(), &CancelFlag::new()).unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["renamed"][0]["to"], "1.webp");
        assert!(json.get("failures").is_none());
        assert!(json["message"].as_str().unwrap().starts_with("Compressed 1 of 1"));
    }
}
