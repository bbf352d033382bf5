//! ONNX-backed RVC submodels via the `ort` crate.
//!
//! A `model_id` resolves to a directory holding three exported graphs:
//!
//! | File | Contract |
//! |------|----------|
//! | `content_encoder.onnx` | `waveform [1,N]` → `features [1,T,D]` |
//! | `rmvpe.onnx`           | `waveform [1,N]` → `f0 [1,T]` (0 = unvoiced) |
//! | `synthesis.onnx`       | `features [1,T,D]` + `f0 [1,T]` + `index_rate [1]` → `audio [1,M]` |
//!
//! With `PitchMethod::Fallback` the RMVPE graph is not loaded at all; the
//! autocorrelation tracker stands in. The semitone shift is applied to the
//! f0 contour before synthesis (a 2^(s/12) scale), which is how the
//! synthesis network expects transposition to arrive.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Axis};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Value;
use tracing::{debug, info};

use crate::backend::models::{
    ContentEmbedder, ModelBundle, ModelLoader, PitchPredictor, PitchTrack, Synthesizer,
    YinPitchPredictor,
};
use crate::config::{ConversionConfig, PitchMethod, WORKING_SAMPLE_RATE};
use crate::error::{Result, RevoiceError};

const CONTENT_GRAPH: &str = "content_encoder.onnx";
const PITCH_GRAPH: &str = "rmvpe.onnx";
const SYNTHESIS_GRAPH: &str = "synthesis.onnx";

/// Frames with f0 below this are treated as unvoiced.
const VOICED_FLOOR_HZ: f32 = 1.0;

fn sess_err(e: ort::Error) -> RevoiceError {
    RevoiceError::OnnxSession(e.to_string())
}

fn build_session(path: &Path) -> Result<Session> {
    if !path.is_file() {
        return Err(RevoiceError::ModelNotFound {
            path: path.to_path_buf(),
        });
    }
    SessionBuilder::new()
        .map_err(sess_err)?
        .with_intra_threads(2)
        .map_err(sess_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(sess_err)?
        .commit_from_file(path)
        .map_err(sess_err)
}

/// Loads the three sessions of one voice model directory.
pub struct OnnxModelLoader {
    model_dir: PathBuf,
    pitch_method: PitchMethod,
}

impl OnnxModelLoader {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            model_dir: PathBuf::from(&config.model_id),
            pitch_method: config.pitch_method,
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> Result<ModelBundle> {
        info!(dir = ?self.model_dir, "loading RVC submodels");

        let embedder = OnnxContentEmbedder {
            session: build_session(&self.model_dir.join(CONTENT_GRAPH))?,
        };
        let pitch: Box<dyn PitchPredictor> = match self.pitch_method {
            PitchMethod::Rmvpe => Box::new(OnnxPitchPredictor {
                session: build_session(&self.model_dir.join(PITCH_GRAPH))?,
            }),
            PitchMethod::Fallback => {
                info!("pitch method: autocorrelation fallback (no RMVPE session)");
                Box::new(YinPitchPredictor::new(WORKING_SAMPLE_RATE))
            }
        };
        let synthesizer = OnnxSynthesizer {
            session: build_session(&self.model_dir.join(SYNTHESIS_GRAPH))?,
        };

        info!("RVC submodels ready");
        Ok(ModelBundle {
            embedder: Box::new(embedder),
            pitch,
            synthesizer: Box::new(synthesizer),
        })
    }
}

struct OnnxContentEmbedder {
    session: Session,
}

impl ContentEmbedder for OnnxContentEmbedder {
    fn embed(&mut self, samples: &[f32]) -> Result<Array2<f32>> {
        let waveform = Value::from_array(
            Array1::from(samples.to_vec()).insert_axis(Axis(0)),
        )
        .map_err(sess_err)?;
        let outputs = self
            .session
            .run(ort::inputs!["waveform" => waveform])
            .map_err(sess_err)?;

        let (shape, data) = outputs["features"]
            .try_extract_tensor::<f32>()
            .map_err(sess_err)?;
        if shape.len() < 3 {
            return Err(RevoiceError::OnnxSession(format!(
                "content encoder returned rank-{} tensor, expected [1, T, D]",
                shape.len()
            )));
        }
        let frames = shape[1] as usize;
        let dim = shape[2] as usize;
        debug!(frames, dim, "content features extracted");

        Array2::from_shape_vec((frames, dim), data.to_vec())
            .map_err(|e| RevoiceError::OnnxSession(format!("feature reshape failed: {e}")))
    }
}

struct OnnxPitchPredictor {
    session: Session,
}

impl PitchPredictor for OnnxPitchPredictor {
    fn predict(&mut self, samples: &[f32]) -> Result<PitchTrack> {
        let waveform = Value::from_array(
            Array1::from(samples.to_vec()).insert_axis(Axis(0)),
        )
        .map_err(sess_err)?;
        let outputs = self
            .session
            .run(ort::inputs!["waveform" => waveform])
            .map_err(sess_err)?;

        let (_shape, data) = outputs["f0"]
            .try_extract_tensor::<f32>()
            .map_err(sess_err)?;
        let f0: Vec<f32> = data.to_vec();
        let voiced = f0.iter().map(|&hz| hz >= VOICED_FLOOR_HZ).collect();
        Ok(PitchTrack { f0, voiced })
    }
}

struct OnnxSynthesizer {
    session: Session,
}

impl Synthesizer for OnnxSynthesizer {
    fn synthesize(
        &mut self,
        features: &Array2<f32>,
        pitch: &PitchTrack,
        pitch_shift: i32,
        index_rate: f32,
    ) -> Result<Vec<f32>> {
        let scale = 2f32.powf(pitch_shift as f32 / 12.0);
        let shifted: Vec<f32> = pitch
            .f0
            .iter()
            .zip(&pitch.voiced)
            .map(|(&hz, &voiced)| if voiced { hz * scale } else { 0.0 })
            .collect();

        let features_value = Value::from_array(features.clone().insert_axis(Axis(0)))
            .map_err(sess_err)?;
        let f0_value = Value::from_array(Array1::from(shifted).insert_axis(Axis(0)))
            .map_err(sess_err)?;
        let index_value =
            Value::from_array(Array1::from(vec![index_rate])).map_err(sess_err)?;

        let outputs = self
            .session
            .run(ort::inputs![
                "features" => features_value,
                "f0" => f0_value,
                "index_rate" => index_value
            ])
            .map_err(sess_err)?;

        let (_shape, data) = outputs["audio"]
            .try_extract_tensor::<f32>()
            .map_err(sess_err)?;
        Ok(data.to_vec())
    }
}
