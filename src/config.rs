use crate::compressor::CompressionSettings;
use std::path::PathBuf;

/// Per-file ceiling for uploads.
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;
pub const MAX_PRIMARY_FILES: usize = 1;
pub const MAX_GALLERY_FILES: usize = 20;

pub const BATCH_TARGET_BYTES: u64 = 25 * 1024;
pub const BATCH_MAX_DIMENSION: u32 = 800;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where per-request artifacts are written.
    pub upload_root: PathBuf,
    /// Where accepted parts wait for decoding.
    pub staging_dir: PathBuf,
    /// Pre-existing store processed by the batch job.
    pub legacy_dir: PathBuf,
    /// Prefix of the relative paths handed back to the CRUD layer.
    pub public_prefix: String,
    pub upload_target_bytes: u64,
    pub upload_max_width: u32,
    pub upload_max_height: u32,
    /// Worker threads for the batch job.
    pub jobs: usize,
    pub compression: CompressionSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("public/uploads"),
            staging_dir: PathBuf::from("tmp/uploads"),
            legacy_dir: PathBuf::from("public/uploads/legacy"),
            public_prefix: "uploads".to_string(),
            upload_target_bytes: BATCH_TARGET_BYTES,
            upload_max_width: BATCH_MAX_DIMENSION,
            upload_max_height: BATCH_MAX_DIMENSION,
            jobs: num_cpus::get(),
            compression: CompressionSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Config rooted under `root`, for tests and one-off tools.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            upload_root: root.join("uploads"),
            staging_dir: root.join("staging"),
            legacy_dir: root.join("legacy"),
            ..Self::default()
        }
    }

    /// Largest request body the receiver can legitimately need.
    pub fn max_request_bytes(&self) -> usize {
        let files = (MAX_PRIMARY_FILES + MAX_GALLERY_FILES) as u64;
        // headroom for boundaries, headers and text fields
        (files * MAX_UPLOAD_BYTES + 1024 * 1024) as usize
    }
}
