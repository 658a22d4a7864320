//! Per-request processing of staged uploads.
//!
//! Each staged file gets its own blocking task; tasks are joined in arrival
//! order before the response is built. One file failing never affects its
//! siblings.
//!
//! A request that is abandoned part way (client gone, handler future dropped)
//! takes its stored artifacts with it: everything already written is removed,
//! and tasks that finish later delete their own output instead of keeping it.

use crate::cancel::CancelFlag;
use crate::compressor::Compressor;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::human_size;
use crate::normalizer;
use crate::receiver::{StagedUploads, UploadRole, UploadedFile};
use crate::store;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// A compressed upload that is now in the canonical store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub field: String,
    #[serde(skip)]
    pub role: UploadRole,
    pub original_filename: String,
    pub file_name: String,
    pub relative_path: String,
    pub quality: u8,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub met_budget: bool,
    pub exceeds_source: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFailure {
    pub field: String,
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub stored: Vec<StoredImage>,
    pub failures: Vec<FieldFailure>,
}

/// Artifacts one request has stored so far.
#[derive(Debug)]
struct RequestArtifacts {
    cancel: CancelFlag,
    written: Mutex<Vec<PathBuf>>,
}

impl RequestArtifacts {
    fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            written: Mutex::new(Vec::new()),
        }
    }

    /// Keep `path` unless the request was abandoned, in which case it is
    /// removed right away.
    fn record(&self, path: PathBuf) -> Result<()> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            remove_artifact(&path);
            return Err(PipelineError::Cancelled);
        }
        written.push(path);
        Ok(())
    }

    /// Cancel the request and delete everything it stored.
    fn abandon(&self) {
        self.cancel.cancel();
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        for path in written.drain(..) {
            remove_artifact(&path);
        }
    }
}

fn remove_artifact(path: &std::path::Path) {
    match fs::remove_file(path) {
        Ok(()) => log::info!("🧹 removed abandoned {}", path.display()),
        Err(e) => log::warn!("could not remove abandoned {}: {}", path.display(), e),
    }
}

/// Abandons the request's artifacts unless the request ran to completion.
struct AbandonOnDrop {
    artifacts: Arc<RequestArtifacts>,
    armed: bool,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.artifacts.abandon();
        }
    }
}

#[derive(Debug)]
pub struct IngestPipeline {
    upload_root: PathBuf,
    public_prefix: String,
    target_bytes: u64,
    max_width: u32,
    max_height: u32,
    compressor: Compressor,
}

impl IngestPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            upload_root: config.upload_root.clone(),
            public_prefix: config.public_prefix.trim_end_matches('/').to_string(),
            target_bytes: config.upload_target_bytes,
            max_width: config.upload_max_width,
            max_height: config.upload_max_height,
            compressor: Compressor::new(config.compression)?,
        })
    }

    fn relative_path(&self, file_name: &str) -> String {
        if self.public_prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.public_prefix, file_name)
        }
    }

    /// Decode, compress and store one staged upload.
    pub fn process_one(&self, upload: UploadedFile, cancel: &CancelFlag) -> Result<StoredImage> {
        self.process_tracked(upload, &RequestArtifacts::new(cancel.clone()))
    }

    fn process_tracked(
        &self,
        upload: UploadedFile,
        artifacts: &RequestArtifacts,
    ) -> Result<StoredImage> {
        let cancel = &artifacts.cancel;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let field = upload.field.clone();
        let role = upload.role;
        let original_filename = upload.original_filename.clone();
        let file_name = upload.output_name();

        let raster = normalizer::decode_file(&upload.staging_path)?;
        // staging copy is no longer needed once decoded
        drop(upload);

        let result =
            self.compressor
                .compress(&raster, self.target_bytes, self.max_width, self.max_height)?;
        drop(raster);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let stored = store::write_new(&self.upload_root, &file_name, &result.bytes)?;
        artifacts.record(stored)?;

        log::info!(
            "{} ({}): {} → {} at q{} {}x{}{}",
            original_filename,
            field,
            human_size(result.source_size),
            human_size(result.final_size),
            result.final_quality,
            result.final_width,
            result.final_height,
            if result.met_budget { "" } else { " (over budget)" }
        );
        if result.exceeds_source {
            log::warn!("{}: stored copy is larger than the upload", original_filename);
        }

        Ok(StoredImage {
            relative_path: self.relative_path(&file_name),
            field,
            role,
            original_filename,
            file_name,
            quality: result.final_quality,
            size: result.final_size,
            width: result.final_width,
            height: result.final_height,
            met_budget: result.met_budget,
            exceeds_source: result.exceeds_source,
        })
    }

    pub async fn process(
        self: &Arc<Self>,
        staged: StagedUploads,
        cancel: CancelFlag,
    ) -> IngestReport {
        let artifacts = Arc::new(RequestArtifacts::new(cancel.clone()));
        let mut guard = AbandonOnDrop {
            artifacts: Arc::clone(&artifacts),
            armed: true,
        };

        let mut tasks = Vec::with_capacity(staged.len());
        for upload in staged.into_files() {
            let label = (upload.field.clone(), upload.original_filename.clone());
            let pipeline = Arc::clone(self);
            let artifacts = Arc::clone(&artifacts);
            let handle =
                tokio::task::spawn_blocking(move || pipeline.process_tracked(upload, &artifacts));
            tasks.push((label, handle));
        }

        let mut report = IngestReport::default();
        for ((field, file_name), handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome.map_err(|e| e.to_string()),
                Err(e) => Err(format!("worker failed: {}", e)),
            };
            match outcome {
                Ok(stored) => report.stored.push(stored),
                Err(reason) => {
                    log::warn!("❌ {} ({}): {}", file_name, field, reason);
                    report.failures.push(FieldFailure {
                        field,
                        file_name,
                        reason,
                    });
                }
            }
        }

        // cancelled while joining: nothing stored may outlive the request
        if cancel.is_cancelled() && !report.stored.is_empty() {
            artifacts.abandon();
            let reason = PipelineError::Cancelled.to_string();
            for stored in report.stored.drain(..) {
                report.failures.push(FieldFailure {
                    field: stored.field,
                    file_name: stored.original_filename,
                    reason: reason.clone(),
                });
            }
        }
        guard.armed = false;
        report
    }
}
