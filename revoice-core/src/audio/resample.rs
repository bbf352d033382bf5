//! Fixed-ratio sample-rate conversion at the AudioIo boundary.
//!
//! Devices capture and play at their native rates; the pipeline only
//! speaks 48 kHz mono f32. `Resampler` bridges that gap on the non-RT
//! forwarding threads, where allocation is allowed. When the rates already
//! match it is a plain copy and no rubato session exists at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};
use tracing::{error, info};

use crate::error::{Result, RevoiceError};

/// Input frames handed to rubato per processing block (20 ms at 48 kHz).
const BLOCK: usize = 960;

/// Converts mono f32 audio between two fixed sample rates.
pub struct Resampler {
    /// `None` in passthrough mode (equal rates).
    inner: Option<FastFixedIn<f32>>,
    /// Holds partial input blocks between calls.
    pending: Vec<f32>,
    /// Pre-allocated rubato output buffer, `[1][output_frames_max]`.
    output: Vec<Vec<f32>>,
}

impl Resampler {
    /// # Errors
    /// `RevoiceError::AudioStream` if rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                output: Vec::new(),
            });
        }

        let inner = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            BLOCK,
            1, // mono
        )
        .map_err(|e| RevoiceError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = inner.output_frames_max();
        info!(from_rate, to_rate, max_out, "resampling enabled");

        Ok(Self {
            inner: Some(inner),
            pending: Vec::new(),
            output: vec![vec![0.0; max_out]],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed samples, returning whatever full blocks produce (may be empty
    /// while input accumulates). In passthrough mode input comes straight
    /// back.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut inner) = self.inner else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut converted = Vec::new();

        while self.pending.len() >= BLOCK {
            let block = &self.pending[..BLOCK];
            match inner.process_into_buffer(&[block], &mut self.output, None) {
                Ok((_consumed, produced)) => {
                    converted.extend_from_slice(&self.output[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..BLOCK);
        }

        converted
    }
}
