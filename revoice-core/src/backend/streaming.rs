//! `StreamingBackend` — direct in-memory neural inference.
//!
//! ## Per-chunk protocol
//!
//! ```text
//! 1. Peak-normalize the chunk (only when peak > 1.0)
//! 2. Prepend the CS/4 left context → model input
//! 3. embedder → pitch predictor → synthesizer
//! 4. Discard the context-aligned output prefix; pad/trim ≤1 % slack to CS
//! 5. Linear crossfade against the previous chunk's tail
//! ```
//!
//! The context gives the feature extractor and pitch tracker acoustic
//! history, reducing edge artifacts; discarding the context-aligned prefix
//! avoids double emission. The crossfade width is 10 % of the chunk — wide
//! enough to hide seams, cheap enough to be negligible.

use tracing::debug;

use crate::backend::models::{ModelBundle, ModelLoader};
use crate::backend::ConversionBackend;
use crate::config::ConversionConfig;
use crate::error::{Result, RevoiceError};

pub struct StreamingBackend {
    chunk_size: usize,
    pitch_shift: i32,
    index_rate: f32,
    fade_len: usize,
    loader: Box<dyn ModelLoader>,
    models: Option<ModelBundle>,
    /// Last `fade_len` samples of the previously emitted chunk; empty
    /// before the first emission and after `cleanup`.
    prev_tail: Vec<f32>,
    chunk_index: u64,
}

impl StreamingBackend {
    pub fn new(config: &ConversionConfig, loader: Box<dyn ModelLoader>) -> Self {
        let fade_len = ((config.chunk_size as f64 * 0.1).round() as usize).max(1);
        Self {
            chunk_size: config.chunk_size,
            pitch_shift: config.pitch_shift,
            index_rate: config.index_rate,
            fade_len,
            loader,
            models: None,
            prev_tail: Vec::new(),
            chunk_index: 0,
        }
    }

    pub fn fade_len(&self) -> usize {
        self.fade_len
    }
}

impl ConversionBackend for StreamingBackend {
    fn initialize(&mut self) -> Result<()> {
        if self.models.is_none() {
            let bundle = self
                .loader
                .load()
                .map_err(|e| RevoiceError::BackendInit(e.to_string()))?;
            self.models = Some(bundle);
        }
        self.prev_tail.clear();
        self.chunk_index = 0;
        debug!(
            chunk_size = self.chunk_size,
            fade_len = self.fade_len,
            "streaming backend ready"
        );
        Ok(())
    }

    fn convert_chunk(&mut self, chunk: &[f32], context: &[f32]) -> Result<Vec<f32>> {
        let models = self
            .models
            .as_mut()
            .ok_or_else(|| RevoiceError::convert("streaming backend not initialized"))?;

        // Peak-normalize only out-of-range input; in-range audio passes
        // through untouched so a no-op model stays bit-exact.
        let peak = chunk.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let mut model_input = Vec::with_capacity(context.len() + chunk.len());
        model_input.extend_from_slice(context);
        if peak > 1.0 {
            model_input.extend(chunk.iter().map(|s| s / peak));
        } else {
            model_input.extend_from_slice(chunk);
        }

        let features = models.embedder.embed(&model_input)?;
        let pitch = models.pitch.predict(&model_input)?;
        let raw = models
            .synthesizer
            .synthesize(&features, &pitch, self.pitch_shift, self.index_rate)?;

        // The output prefix corresponds to the context region.
        if raw.len() < context.len() {
            return Err(RevoiceError::convert(format!(
                "synthesis returned {} samples, shorter than its {}-sample context prefix",
                raw.len(),
                context.len()
            )));
        }
        let mut body = raw[context.len()..].to_vec();

        let slack = ((self.chunk_size as f64) * 0.01).round() as usize;
        let deviation = body.len().abs_diff(self.chunk_size);
        if deviation > slack {
            return Err(RevoiceError::convert(format!(
                "synthesis length contract violated: {} samples for a {}-sample chunk \
                 (allowed slack {slack})",
                body.len(),
                self.chunk_size
            )));
        }
        if deviation > 0 {
            debug!(
                chunk = self.chunk_index,
                got = body.len(),
                expected = self.chunk_size,
                "padding/trimming synthesis output"
            );
            body.resize(self.chunk_size, 0.0);
        }

        // Crossfade the head against the previous tail; the first chunk is
        // emitted as-is.
        if !self.prev_tail.is_empty() {
            let fade = self.fade_len;
            for i in 0..fade {
                let t = i as f32 / fade as f32;
                body[i] = self.prev_tail[i] * (1.0 - t) + body[i] * t;
            }
        }
        self.prev_tail.clear();
        self.prev_tail
            .extend_from_slice(&body[self.chunk_size - self.fade_len..]);
        self.chunk_index += 1;

        Ok(body)
    }

    fn cleanup(&mut self) {
        if self.models.take().is_some() {
            debug!(chunks = self.chunk_index, "streaming backend cleaned up");
        }
        self.prev_tail.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::models::{
        ContentEmbedder, PitchPredictor, PitchTrack, Synthesizer,
    };
    use ndarray::{Array2, Axis};

    use crate::error::Result;

    /// Embedder that smuggles the raw samples through as one-dimensional
    /// "features", one frame per sample.
    struct EchoEmbedder;

    impl ContentEmbedder for EchoEmbedder {
        fn embed(&mut self, samples: &[f32]) -> Result<Array2<f32>> {
            Ok(ndarray::Array1::from(samples.to_vec()).insert_axis(Axis(1)))
        }
    }

    struct FlatPitch;

    impl PitchPredictor for FlatPitch {
        fn predict(&mut self, samples: &[f32]) -> Result<PitchTrack> {
            let frames = samples.len() / crate::backend::models::FEATURE_HOP;
            Ok(PitchTrack {
                f0: vec![200.0; frames],
                voiced: vec![true; frames],
            })
        }
    }

    /// Synthesizer returning the echoed samples unchanged — a no-op model.
    #[derive(Clone)]
    struct EchoSynth;

    impl Synthesizer for EchoSynth {
        fn synthesize(
            &mut self,
            features: &Array2<f32>,
            _pitch: &PitchTrack,
            _pitch_shift: i32,
            _index_rate: f32,
        ) -> Result<Vec<f32>> {
            Ok(features.column(0).to_vec())
        }
    }

    /// Synthesizer whose output length is off by a configurable amount.
    #[derive(Clone)]
    struct SkewedSynth {
        skew: isize,
    }

    impl Synthesizer for SkewedSynth {
        fn synthesize(
            &mut self,
            features: &Array2<f32>,
            _pitch: &PitchTrack,
            _pitch_shift: i32,
            _index_rate: f32,
        ) -> Result<Vec<f32>> {
            let len = (features.nrows() as isize + self.skew).max(0) as usize;
            Ok(vec![0.5; len])
        }
    }

    /// Synthesizer returning a 0→1 ramp over the chunk region, regardless
    /// of input.
    #[derive(Clone)]
    struct RampSynth {
        context_len: usize,
        chunk_len: usize,
    }

    impl Synthesizer for RampSynth {
        fn synthesize(
            &mut self,
            _features: &Array2<f32>,
            _pitch: &PitchTrack,
            _pitch_shift: i32,
            _index_rate: f32,
        ) -> Result<Vec<f32>> {
            let mut out = vec![0.0; self.context_len];
            out.extend((0..self.chunk_len).map(|i| i as f32 / self.chunk_len as f32));
            Ok(out)
        }
    }

    struct TestLoader<S: Synthesizer + Clone + Send + 'static>(S);

    impl<S: Synthesizer + Clone + Send + 'static> ModelLoader for TestLoader<S> {
        fn load(&self) -> Result<ModelBundle> {
            Ok(ModelBundle {
                embedder: Box::new(EchoEmbedder),
                pitch: Box::new(FlatPitch),
                synthesizer: Box::new(self.0.clone()),
            })
        }
    }

    fn config(chunk_size: usize) -> ConversionConfig {
        ConversionConfig {
            chunk_size,
            ..ConversionConfig::default()
        }
    }

    const CS: usize = 1024;

    fn backend_with<S: Synthesizer + Clone + Send + 'static>(
        chunk_size: usize,
        synth: S,
    ) -> StreamingBackend {
        let mut backend =
            StreamingBackend::new(&config(chunk_size), Box::new(TestLoader(synth)));
        backend.initialize().unwrap();
        backend
    }

    #[test]
    fn first_chunk_of_noop_model_is_bit_exact() {
        let mut backend = backend_with(CS, EchoSynth);
        let chunk: Vec<f32> = (0..CS).map(|i| (i as f32 / CS as f32) - 0.5).collect();
        let out = backend.convert_chunk(&chunk, &[]).unwrap();
        assert_eq!(out, chunk, "no context, no previous tail — identity");
    }

    #[test]
    fn context_prefix_is_discarded() {
        let mut backend = backend_with(CS, EchoSynth);
        let context = vec![9.0f32; CS / 4];
        let chunk = vec![0.25f32; CS];
        let out = backend.convert_chunk(&chunk, &context).unwrap();
        assert_eq!(out.len(), CS);
        assert!(
            out.iter().all(|&s| (s - 0.25).abs() < 1e-6),
            "context samples must not leak into the output"
        );
    }

    #[test]
    fn crossfade_blends_exactly_once() {
        let mut backend = backend_with(CS, EchoSynth);
        let fade = backend.fade_len();

        let a = vec![1.0f32; CS];
        let b = vec![0.0f32; CS];
        let out_a = backend.convert_chunk(&a, &[]).unwrap();
        let out_b = backend.convert_chunk(&b, &a[CS - CS / 4..]).unwrap();

        assert_eq!(out_a, a, "first chunk emitted without crossfade");
        // Fade region: 1.0 → 0.0 linearly.
        for (i, &s) in out_b[..fade].iter().enumerate() {
            let expected = 1.0 - i as f32 / fade as f32;
            assert!(
                (s - expected).abs() < 1e-6,
                "fade sample {i}: got {s}, expected {expected}"
            );
        }
        // Beyond the fade region B is unmodified.
        assert!(out_b[fade..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn peak_normalization_only_above_unity() {
        let mut backend = backend_with(CS, EchoSynth);
        let quiet = vec![0.5f32; CS];
        assert_eq!(backend.convert_chunk(&quiet, &[]).unwrap(), quiet);

        let mut backend = backend_with(CS, EchoSynth);
        let hot = vec![2.0f32; CS];
        let out = backend.convert_chunk(&hot, &[]).unwrap();
        assert!(out.iter().all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn small_length_slack_is_padded_or_trimmed() {
        let mut backend = backend_with(CS, SkewedSynth { skew: -3 });
        let out = backend.convert_chunk(&vec![0.1; CS], &[]).unwrap();
        assert_eq!(out.len(), CS);

        let mut backend = backend_with(CS, SkewedSynth { skew: 5 });
        let out = backend.convert_chunk(&vec![0.1; CS], &[]).unwrap();
        assert_eq!(out.len(), CS);
    }

    #[test]
    fn large_length_deviation_is_a_contract_violation() {
        let skew = (CS / 50) as isize; // 2 % — beyond the 1 % slack
        let mut backend = backend_with(CS, SkewedSynth { skew });
        let err = backend.convert_chunk(&vec![0.1; CS], &[]).unwrap_err();
        match err {
            RevoiceError::Convert { retryable, .. } => assert!(!retryable),
            other => panic!("expected Convert error, got {other:?}"),
        }
    }

    #[test]
    fn ramp_chunks_have_monotone_seam() {
        let mut backend = backend_with(
            CS,
            RampSynth {
                context_len: 0,
                chunk_len: CS,
            },
        );
        let fade = backend.fade_len();

        let silence = vec![0.0f32; CS];
        let first = backend.convert_chunk(&silence, &[]).unwrap();
        let second = backend.convert_chunk(&silence, &[]).unwrap();

        // Without the crossfade the second chunk would restart the ramp at
        // 0.0 right after 1.0. With it, every step inside the fade region
        // stays bounded by twice the ramp resolution.
        let mut stream = first;
        stream.extend(second);
        let max_step = 2.0 * (1.0 / fade as f32);
        for pair in stream[CS..CS + fade + 1].windows(2) {
            assert!(
                (pair[1] - pair[0]).abs() <= max_step + 1e-6,
                "seam discontinuity: {} → {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn cleanup_clears_fade_state() {
        let mut backend = backend_with(CS, EchoSynth);
        let chunk = vec![0.7f32; CS];
        let _ = backend.convert_chunk(&chunk, &[]).unwrap();
        backend.cleanup();
        backend.initialize().unwrap();
        let out = backend.convert_chunk(&chunk, &[]).unwrap();
        assert_eq!(out, chunk, "no stale tail after cleanup + re-init");
    }

    #[test]
    fn convert_before_initialize_fails() {
        let mut backend =
            StreamingBackend::new(&config(CS), Box::new(TestLoader(EchoSynth)));
        assert!(backend.convert_chunk(&vec![0.0; CS], &[]).is_err());
    }
}
