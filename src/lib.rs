//! Media ingestion and adaptive compression for CMS uploads.
//!
//! Uploaded or legacy images are decoded, bounded to a maximum size and
//! re-encoded as WebP with a descending quality search until they fit a byte
//! budget. The crate never touches the database; it hands back canonical
//! relative paths for the caller to persist.

use humansize::{format_size, DECIMAL};

pub mod batch;
pub mod cancel;
pub mod compressor;
pub mod config;
pub mod error;
pub mod formats;
pub mod ingest;
pub mod normalizer;
pub mod publisher;
pub mod receiver;
pub mod server;
pub mod store;

pub use batch::{BatchCompressor, BatchSummary};
pub use cancel::CancelFlag;
pub use compressor::{CompressionResult, CompressionSettings, Compressor};
pub use config::PipelineConfig;
pub use error::{PipelineError, ValidationError};
pub use publisher::{publish, PublishedPaths};
pub use receiver::{UploadReceiver, UploadSchema};

pub fn human_size(nbytes: u64) -> String {
    format_size(nbytes, DECIMAL)
}
