//! Neural submodel capabilities consumed by the streaming backend.
//!
//! The conversion pipeline is three opaque collaborators, loaded once at
//! backend initialization and reused across chunks:
//!
//! 1. content embedder — PCM → frame-level content features
//! 2. pitch predictor — PCM → f0 contour + voiced flags
//! 3. synthesis network + vocoder — features + pitch → PCM
//!
//! Model internals stay behind these traits; the streaming backend only
//! relies on the shape contracts documented per method.

use ndarray::Array2;

use crate::error::Result;

/// Frame stride of the content embedder: one feature frame per 320 samples.
pub const FEATURE_HOP: usize = 320;

/// An f0 contour with per-frame voiced/unvoiced flags.
#[derive(Debug, Clone, Default)]
pub struct PitchTrack {
    /// Fundamental frequency per frame in Hz; unvoiced frames carry 0.0.
    pub f0: Vec<f32>,
    pub voiced: Vec<bool>,
}

impl PitchTrack {
    pub fn len(&self) -> usize {
        self.f0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f0.is_empty()
    }
}

/// PCM → `[T, D]` content features, `T ≈ N / FEATURE_HOP`, `D` model-specific.
pub trait ContentEmbedder: Send {
    fn embed(&mut self, samples: &[f32]) -> Result<Array2<f32>>;
}

/// PCM → f0 contour aligned with the embedder's frame grid.
pub trait PitchPredictor: Send {
    fn predict(&mut self, samples: &[f32]) -> Result<PitchTrack>;
}

/// Features + pitch → `[M]` PCM where `M` is within 1 % of the embedded
/// input length. Larger deviations violate the model contract and are
/// rejected by the streaming backend.
pub trait Synthesizer: Send {
    fn synthesize(
        &mut self,
        features: &Array2<f32>,
        pitch: &PitchTrack,
        pitch_shift: i32,
        index_rate: f32,
    ) -> Result<Vec<f32>>;
}

/// The three submodels of one loaded voice model.
pub struct ModelBundle {
    pub embedder: Box<dyn ContentEmbedder>,
    pub pitch: Box<dyn PitchPredictor>,
    pub synthesizer: Box<dyn Synthesizer>,
}

/// Loads a [`ModelBundle`]; re-invoked when a backend is re-initialized
/// after `cleanup`.
pub trait ModelLoader: Send {
    fn load(&self) -> Result<ModelBundle>;
}

// ---------------------------------------------------------------------------
// Classical pitch fallback
// ---------------------------------------------------------------------------

/// Window length for the autocorrelation search, in samples.
const YIN_WINDOW: usize = 1536;
/// YIN aperiodicity threshold; first dip below this wins.
const YIN_THRESHOLD: f32 = 0.1;

/// YIN-style autocorrelation pitch tracker (de Cheveigné & Kawahara, 2002).
///
/// The `PitchMethod::Fallback` implementation: slower and less robust than
/// the neural predictor but requires no extra model. Emits one frame per
/// [`FEATURE_HOP`] samples to stay aligned with the embedder grid.
pub struct YinPitchPredictor {
    sample_rate: u32,
    min_freq: f32,
    max_freq: f32,
}

impl YinPitchPredictor {
    pub fn new(sample_rate: u32) -> Self {
        // 65 Hz (roughly C2) to 1100 Hz covers spoken and sung voice.
        Self {
            sample_rate,
            min_freq: 65.0,
            max_freq: 1100.0,
        }
    }

    /// Detect the fundamental of one analysis window. Returns 0.0 when the
    /// window is aperiodic (unvoiced or silent).
    fn detect(&self, frame: &[f32]) -> f32 {
        let min_period = (self.sample_rate as f32 / self.max_freq) as usize;
        let max_period = ((self.sample_rate as f32 / self.min_freq) as usize).min(frame.len() / 2);
        if max_period <= min_period {
            return 0.0;
        }

        // Difference function d(τ) = Σ (x[j] - x[j+τ])²
        let window = frame.len() - max_period;
        let mut difference = vec![0.0f32; max_period + 1];
        for (tau, slot) in difference.iter_mut().enumerate().skip(1) {
            let mut sum = 0.0f64;
            for j in 0..window {
                let d = (frame[j] - frame[j + tau]) as f64;
                sum += d * d;
            }
            *slot = sum as f32;
        }

        // Cumulative-mean normalization: d'(0) = 1, d'(τ) = d(τ)·τ / Σ d(j)
        let mut normalized = vec![1.0f32; max_period + 1];
        let mut running = 0.0f32;
        for tau in 1..=max_period {
            running += difference[tau];
            if running > 1e-10 {
                normalized[tau] = difference[tau] * tau as f32 / running;
            }
        }

        // First local minimum below the threshold beats the global one —
        // picking the global minimum causes octave errors on subharmonics.
        let mut tau = min_period;
        let mut best = 0usize;
        while tau < max_period {
            if normalized[tau] < YIN_THRESHOLD {
                while tau + 1 < max_period && normalized[tau + 1] < normalized[tau] {
                    tau += 1;
                }
                best = tau;
                break;
            }
            tau += 1;
        }
        if best == 0 {
            return 0.0;
        }

        // Parabolic interpolation for sub-sample period accuracy.
        let refined = if best > min_period && best + 1 <= max_period {
            let s0 = normalized[best - 1];
            let s1 = normalized[best];
            let s2 = normalized[best + 1];
            let denom = 2.0 * (2.0 * s1 - s2 - s0);
            if denom.abs() > 1e-10 {
                best as f32 + (s2 - s0) / denom
            } else {
                best as f32
            }
        } else {
            best as f32
        };

        self.sample_rate as f32 / refined
    }
}

impl PitchPredictor for YinPitchPredictor {
    fn predict(&mut self, samples: &[f32]) -> Result<PitchTrack> {
        let frames = samples.len() / FEATURE_HOP;
        let mut f0 = Vec::with_capacity(frames);
        let mut voiced = Vec::with_capacity(frames);

        for i in 0..frames {
            let start = i * FEATURE_HOP;
            let end = (start + YIN_WINDOW).min(samples.len());
            let hz = if end - start >= YIN_WINDOW / 2 {
                self.detect(&samples[start..end])
            } else {
                0.0
            };
            voiced.push(hz > 0.0);
            f0.push(hz);
        }

        Ok(PitchTrack { f0, voiced })
    }
}
