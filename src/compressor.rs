//! Bounding resize followed by a descending-quality WebP search.
//!
//! The search never loops open-ended: qualities come from a finite schedule
//! `initial, initial - step, ...` that stops at the last value `>= floor`, so
//! one call performs at most `(initial - floor) / step + 1` encodes.

use crate::error::{PipelineError, Result};
use crate::human_size;
use crate::normalizer::DecodedRaster;
use image::imageops::FilterType;
use image::DynamicImage;
use std::borrow::Cow;
use webp::Encoder as WebpEncoder;

pub const DEFAULT_INITIAL_QUALITY: u8 = 50;
pub const DEFAULT_QUALITY_STEP: u8 = 5;
/// Lowest quality ever encoded. Must stay positive.
pub const DEFAULT_QUALITY_FLOOR: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub initial_quality: u8,
    pub step: u8,
    pub floor: u8,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            initial_quality: DEFAULT_INITIAL_QUALITY,
            step: DEFAULT_QUALITY_STEP,
            floor: DEFAULT_QUALITY_FLOOR,
        }
    }
}

impl CompressionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.floor == 0 {
            return Err(PipelineError::Settings("quality floor must be positive".into()));
        }
        if self.step == 0 {
            return Err(PipelineError::Settings("quality step must be positive".into()));
        }
        if self.initial_quality > 100 || self.floor > self.initial_quality {
            return Err(PipelineError::Settings(format!(
                "need 0 < floor ({}) <= initial ({}) <= 100",
                self.floor, self.initial_quality
            )));
        }
        Ok(())
    }

    /// Qualities tried, highest first.
    pub fn schedule(&self) -> impl Iterator<Item = u8> {
        (self.floor..=self.initial_quality)
            .rev()
            .step_by(self.step.max(1) as usize)
    }

    /// Upper bound on encodes per call.
    pub fn max_attempts(&self) -> usize {
        self.schedule().count()
    }
}

/// One (quality, size) probe of the search.
#[derive(Debug, Clone, Copy)]
struct CompressionAttempt {
    quality: u8,
    size: u64,
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub bytes: Vec<u8>,
    pub final_quality: u8,
    pub final_size: u64,
    pub final_width: u32,
    pub final_height: u32,
    /// `false` means best effort: the floor was reached over budget.
    pub met_budget: bool,
    /// The canonical encoding is larger than the input file. Callers decide
    /// whether to keep the source instead.
    pub exceeds_source: bool,
    pub attempts: usize,
    pub source_size: u64,
}

/// Scale `(width, height)` down to fit `(max_width, max_height)`, keeping the
/// aspect ratio. Never scales up.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (w, h)
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    settings: CompressionSettings,
}

impl Compressor {
    pub fn new(settings: CompressionSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    pub fn compress(
        &self,
        raster: &DecodedRaster,
        target_bytes: u64,
        max_width: u32,
        max_height: u32,
    ) -> Result<CompressionResult> {
        if max_width == 0 || max_height == 0 {
            return Err(PipelineError::Settings("bounding box must be non-empty".into()));
        }

        // Resize once, before the search; resizing inside the loop would break
        // the monotonic size/quality relationship.
        let (width, height) = fit_within(raster.width, raster.height, max_width, max_height);
        let image: Cow<'_, DynamicImage> = if (width, height) != (raster.width, raster.height) {
            log::debug!(
                "resizing {}x{} -> {}x{}",
                raster.width,
                raster.height,
                width,
                height
            );
            Cow::Owned(raster.image.resize_exact(width, height, FilterType::Lanczos3))
        } else {
            Cow::Borrowed(&raster.image)
        };

        let has_alpha = raster.color.has_alpha();
        let pixels = if has_alpha {
            image.to_rgba8().into_raw()
        } else {
            image.to_rgb8().into_raw()
        };
        drop(image);
        let encoder = if has_alpha {
            WebpEncoder::from_rgba(&pixels, width, height)
        } else {
            WebpEncoder::from_rgb(&pixels, width, height)
        };

        let mut smallest: Option<(CompressionAttempt, Vec<u8>)> = None;
        let mut attempts = 0usize;

        // Invariant: attempts <= self.settings.max_attempts(), since the
        // schedule is finite and each iteration encodes exactly once.
        for quality in self.settings.schedule() {
            attempts += 1;
            let encoded = encoder
                .encode_simple(false, quality as f32)
                .map_err(|e| PipelineError::Encode {
                    quality,
                    reason: format!("{:?}", e),
                })?;
            let bytes = encoded.to_vec();
            let attempt = CompressionAttempt {
                quality,
                size: bytes.len() as u64,
            };
            log::debug!("quality {} -> {}", attempt.quality, human_size(attempt.size));

            if attempt.size <= target_bytes {
                smallest = Some((attempt, bytes));
                break;
            }
            if smallest.as_ref().is_none_or(|(best, _)| attempt.size < best.size) {
                smallest = Some((attempt, bytes));
            }
        }

        let (chosen, bytes) = smallest.ok_or_else(|| {
            PipelineError::Settings("quality schedule produced no attempts".into())
        })?;

        let result = CompressionResult {
            final_quality: chosen.quality,
            final_size: chosen.size,
            final_width: width,
            final_height: height,
            met_budget: chosen.size <= target_bytes,
            exceeds_source: chosen.size > raster.source_len,
            attempts,
            source_size: raster.source_len,
            bytes,
        };

        if !result.met_budget {
            log::warn!(
                "budget {} not met, best effort {} at quality {}",
                human_size(target_bytes),
                human_size(result.final_size),
                result.final_quality
            );
        }
        if result.exceeds_source {
            log::warn!(
                "canonical output {} is larger than its {} source",
                human_size(result.final_size),
                human_size(result.source_size)
            );
        }
        Ok(result)
    }
}
