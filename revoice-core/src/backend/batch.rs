//! `BatchAdapter` — file-batch conversion through an external converter.
//!
//! The adapter trades latency for compatibility: every chunk round-trips
//! through a scratch WAV file and one converter process invocation.
//!
//! ```text
//! chunk ──► chunk_NNNNNN_in.wav ──► <converter> ──► chunk_NNNNNN_out.wav ──► chunk
//! ```
//!
//! The external converter is stateless per file, so `context` is ignored;
//! audible seams at chunk boundaries are the accepted cost of this backend.
//! Scratch files live in a temp directory owned by the adapter instance and
//! are deleted best-effort after every chunk.

use std::path::Path;
use std::process::Command;
use std::time::Instant;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::backend::ConversionBackend;
use crate::config::{ConversionConfig, PitchMethod};
use crate::error::{Result, RevoiceError};

pub struct BatchAdapter {
    config: ConversionConfig,
    temp_dir: Option<TempDir>,
    chunk_index: u64,
    /// Converter outputs that needed padding or trimming to chunk size.
    length_mismatches: u64,
}

impl BatchAdapter {
    pub fn new(config: ConversionConfig) -> Self {
        Self {
            config,
            temp_dir: None,
            chunk_index: 0,
            length_mismatches: 0,
        }
    }

    fn run_converter(&self, input: &Path, output: &Path) -> Result<()> {
        let mut command = Command::new(&self.config.batch.converter_program);
        command
            .arg(input)
            .arg(output)
            .arg("--model")
            .arg(&self.config.model_id)
            .arg("--pitch-shift")
            .arg(self.config.pitch_shift.to_string())
            .arg("--index-rate")
            .arg(self.config.index_rate.to_string());
        if self.config.pitch_method == PitchMethod::Rmvpe {
            command.arg("--rmvpe");
        }

        // Spawn failures may be transient (fork pressure); worth one retry.
        let result = command.output().map_err(|e| {
            RevoiceError::convert_retryable(format!(
                "failed to launch converter {:?}: {e}",
                self.config.batch.converter_program
            ))
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RevoiceError::convert(format!(
                "converter exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn convert_via_files(&mut self, chunk: &[f32], input: &Path, output: &Path) -> Result<Vec<f32>> {
        let write_started = Instant::now();
        write_chunk_wav(input, chunk, self.config.sample_rate)?;
        let write_ms = write_started.elapsed().as_secs_f64() * 1000.0;

        let convert_started = Instant::now();
        self.run_converter(input, output)?;
        let convert_ms = convert_started.elapsed().as_secs_f64() * 1000.0;

        let read_started = Instant::now();
        let (mut samples, rate) = read_converted_wav(output)?;
        let read_ms = read_started.elapsed().as_secs_f64() * 1000.0;

        if samples.is_empty() {
            return Err(RevoiceError::convert("converter produced empty audio"));
        }
        if rate != self.config.sample_rate {
            samples = resample_linear(&samples, rate, self.config.sample_rate);
        }
        if samples.len() != chunk.len() {
            self.length_mismatches += 1;
            debug!(
                chunk = self.chunk_index,
                got = samples.len(),
                expected = chunk.len(),
                "converter output length mismatch; padding/trimming"
            );
            samples.resize(chunk.len(), 0.0);
        }

        debug!(
            chunk = self.chunk_index,
            write_ms = format_args!("{write_ms:.1}"),
            convert_ms = format_args!("{convert_ms:.1}"),
            read_ms = format_args!("{read_ms:.1}"),
            "batch chunk converted"
        );
        Ok(samples)
    }
}

impl ConversionBackend for BatchAdapter {
    fn initialize(&mut self) -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("revoice-batch-")
            .tempdir()
            .map_err(|e| {
                RevoiceError::BackendInit(format!("cannot create scratch directory: {e}"))
            })?;
        info!(
            dir = ?temp_dir.path(),
            converter = ?self.config.batch.converter_program,
            chunk_ms = format_args!("{:.1}", self.config.chunk_duration_ms()),
            "batch adapter initialized"
        );
        self.temp_dir = Some(temp_dir);
        self.chunk_index = 0;
        self.length_mismatches = 0;
        Ok(())
    }

    fn convert_chunk(&mut self, chunk: &[f32], _context: &[f32]) -> Result<Vec<f32>> {
        let dir = self
            .temp_dir
            .as_ref()
            .ok_or_else(|| RevoiceError::convert("batch adapter not initialized"))?
            .path()
            .to_path_buf();

        let input = dir.join(format!("chunk_{:06}_in.wav", self.chunk_index));
        let output = dir.join(format!("chunk_{:06}_out.wav", self.chunk_index));
        self.chunk_index += 1;

        let result = self.convert_via_files(chunk, &input, &output);
        remove_scratch(&input);
        remove_scratch(&output);
        result
    }

    fn cleanup(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(dir = ?path, "failed to remove scratch directory: {e}");
            }
            info!(
                chunks = self.chunk_index,
                length_mismatches = self.length_mismatches,
                "batch adapter cleaned up"
            );
        }
    }
}

fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = ?path, "failed to delete scratch file: {e}");
        }
    }
}

/// Write mono float32 PCM as a WAV file at the working rate.
fn write_chunk_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| RevoiceError::convert(format!("cannot create scratch WAV: {e}")))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| RevoiceError::convert(format!("scratch WAV write failed: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| RevoiceError::convert(format!("scratch WAV finalize failed: {e}")))?;
    Ok(())
}

/// Read the converter's output WAV as mono f32, downmixing by averaging if
/// the converter emitted more than one channel.
fn read_converted_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| RevoiceError::convert(format!("cannot read converter output: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| RevoiceError::convert(format!("converter output corrupt: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| RevoiceError::convert(format!("converter output corrupt: {e}")))?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Linear resampling. The external converter is expected to emit at the
/// working rate, so this is a compatibility path, not a quality path.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a * (1.0 - frac) + b * frac
        })
        .collect()
}
