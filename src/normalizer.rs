//! Decodes staged or legacy files into an in-memory raster.
//!
//! The container is taken from the file's signature rather than its name, so
//! a `.jpg` that is really a GIF is rejected here even though it passed the
//! receiver's extension check.

use crate::error::{PipelineError, Result};
use crate::formats::AcceptedFormat;
use image::{ColorType, DynamicImage};
use std::fs;
use std::path::Path;

/// Decoded pixels plus what we know about where they came from.
#[derive(Debug)]
pub struct DecodedRaster {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    pub color: ColorType,
    pub source_format: AcceptedFormat,
    /// Encoded size of the input, used to keep outputs from growing.
    pub source_len: u64,
}

pub fn decode_file(path: &Path) -> Result<DecodedRaster> {
    let name = path.display().to_string();
    let bytes = fs::read(path).map_err(|e| PipelineError::decode(&name, e))?;
    decode_bytes(&name, &bytes)
}

pub fn decode_bytes(name: &str, bytes: &[u8]) -> Result<DecodedRaster> {
    let kind = infer::get(bytes)
        .ok_or_else(|| PipelineError::decode(name, "unrecognized image signature"))?;
    let format = AcceptedFormat::from_mime(kind.mime_type()).ok_or_else(|| {
        PipelineError::decode(name, format!("unsupported container {}", kind.mime_type()))
    })?;

    let image = image::load_from_memory_with_format(bytes, format.image_format()).map_err(|e| {
        match e {
            image::ImageError::Unsupported(u) => {
                PipelineError::decode(name, format!("unsupported sub-format: {}", u))
            }
            other => PipelineError::decode(name, other),
        }
    })?;

    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::decode(name, "image has no pixels"));
    }

    log::debug!(
        "decoded {} as {} {}x{} ({:?})",
        name,
        format.name(),
        image.width(),
        image.height(),
        image.color()
    );

    Ok(DecodedRaster {
        width: image.width(),
        height: image.height(),
        color: image.color(),
        source_format: format,
        source_len: bytes.len() as u64,
        image,
    })
}
