use std::io;
use thiserror::Error;

/// Rejection of a single upload part. Every variant names the form field.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unexpected file field `{field}`")]
    UnexpectedField { field: String },

    #[error("Too many files in `{field}` (max: {max})")]
    TooManyFiles { field: String, max: usize },

    #[error("`{field}`: extension `{extension}` is not accepted (allowed: jpeg, jpg, png, webp, avif)")]
    InvalidExtension { field: String, extension: String },

    #[error("`{field}`: content type `{content_type}` is not accepted")]
    InvalidContentType { field: String, content_type: String },

    #[error("`{field}`: file too large (max: {max} bytes)")]
    FileTooLarge { field: String, max: u64 },

    #[error("`{field}`: empty file")]
    EmptyFile { field: String },
}

impl ValidationError {
    pub fn field(&self) -> &str {
        match self {
            Self::UnexpectedField { field }
            | Self::TooManyFiles { field, .. }
            | Self::InvalidExtension { field, .. }
            | Self::InvalidContentType { field, .. }
            | Self::FileTooLarge { field, .. }
            | Self::EmptyFile { field } => field,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to decode {file}: {reason}")]
    Decode { file: String, reason: String },

    #[error("Failed to encode at quality {quality}: {reason}")]
    Encode { quality: u8, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Invalid compression settings: {0}")]
    Settings(String),

    #[error("Malformed multipart body: {0}")]
    Multipart(String),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn decode(file: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            file: file.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
