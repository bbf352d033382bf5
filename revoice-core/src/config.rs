//! Conversion configuration, frozen at pipeline creation.
//!
//! A [`ConversionConfig`] is validated once in `StreamingPipeline::create`
//! and never mutated afterwards; the chunk size and sample rate in
//! particular are immutable for the pipeline's lifetime because every
//! buffer capacity is derived from them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RevoiceError};

/// Fixed internal sample rate. All PCM inside the pipeline is mono f32 at
/// this rate; device I/O at other rates is resampled at the AudioIo
/// boundary.
pub const WORKING_SAMPLE_RATE: u32 = 48_000;

/// Inclusive chunk-size range in samples. 1024 ≈ 21 ms, 16384 ≈ 341 ms at
/// 48 kHz — the latency/quality knob.
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 16_384;

/// Pitch shift range in semitones.
pub const MIN_PITCH_SHIFT: i32 = -24;
pub const MAX_PITCH_SHIFT: i32 = 24;

/// Feature-retrieval blend range.
pub const MIN_INDEX_RATE: f32 = 0.0;
pub const MAX_INDEX_RATE: f32 = 1.0;

/// Left-context carried into the next conversion is one quarter chunk.
pub(crate) const CONTEXT_DIVISOR: usize = 4;

/// Pitch extraction method for the streaming backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PitchMethod {
    /// Neural pitch estimation (preferred).
    Rmvpe,
    /// Classical autocorrelation tracker; no extra model required.
    Fallback,
}

/// Which conversion backend the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// File-batch adapter around an external converter process. Higher
    /// latency, maximum compatibility.
    Batch,
    /// Direct in-memory neural inference with crossfaded chunk stitching.
    Streaming,
}

/// Options consumed only by the batch adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    /// External file-batch converter executable.
    pub converter_program: PathBuf,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            converter_program: PathBuf::from("rvc-convert"),
        }
    }
}

/// Immutable conversion parameters for one pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Opaque model identifier, resolved by the selected backend (a model
    /// directory for the streaming backend, forwarded verbatim to the
    /// external converter for the batch adapter).
    pub model_id: String,
    /// Samples per processing chunk, in [`MIN_CHUNK_SIZE`, `MAX_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Working sample rate. Only [`WORKING_SAMPLE_RATE`] is accepted.
    pub sample_rate: u32,
    /// Semitone shift in [`MIN_PITCH_SHIFT`, `MAX_PITCH_SHIFT`].
    pub pitch_shift: i32,
    /// Feature-retrieval blend in [`MIN_INDEX_RATE`, `MAX_INDEX_RATE`].
    /// Passed through to the backend unclamped beyond that validation.
    pub index_rate: f32,
    pub pitch_method: PitchMethod,
    pub backend: BackendKind,
    pub batch: BatchOptions,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            chunk_size: 4096,
            sample_rate: WORKING_SAMPLE_RATE,
            pitch_shift: 0,
            index_rate: 0.75,
            pitch_method: PitchMethod::Rmvpe,
            backend: BackendKind::Streaming,
            batch: BatchOptions::default(),
        }
    }
}

impl ConversionConfig {
    /// Check every value against its declared range.
    ///
    /// # Errors
    /// `RevoiceError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(RevoiceError::InvalidConfig(format!(
                "chunk_size out of range: {} (must be {MIN_CHUNK_SIZE} to {MAX_CHUNK_SIZE})",
                self.chunk_size
            )));
        }
        if self.sample_rate != WORKING_SAMPLE_RATE {
            return Err(RevoiceError::InvalidConfig(format!(
                "unsupported sample rate: {} (must be {WORKING_SAMPLE_RATE})",
                self.sample_rate
            )));
        }
        if !(MIN_PITCH_SHIFT..=MAX_PITCH_SHIFT).contains(&self.pitch_shift) {
            return Err(RevoiceError::InvalidConfig(format!(
                "pitch_shift out of range: {} (must be {MIN_PITCH_SHIFT} to {MAX_PITCH_SHIFT})",
                self.pitch_shift
            )));
        }
        if !self.index_rate.is_finite()
            || !(MIN_INDEX_RATE..=MAX_INDEX_RATE).contains(&self.index_rate)
        {
            return Err(RevoiceError::InvalidConfig(format!(
                "index_rate out of range: {} (must be {MIN_INDEX_RATE} to {MAX_INDEX_RATE})",
                self.index_rate
            )));
        }
        Ok(())
    }

    /// Left-context width in samples (CS/4).
    pub fn context_size(&self) -> usize {
        self.chunk_size / CONTEXT_DIVISOR
    }

    /// Duration of one chunk in milliseconds.
    pub fn chunk_duration_ms(&self) -> f64 {
        self.chunk_size as f64 / self.sample_rate as f64 * 1000.0
    }
}
