//! Synthetic end-to-end latency benchmark.
//!
//! Drives a passthrough pipeline with a sine tone at real-time pace and
//! reports per-chunk processing times plus the pipeline's own latency
//! estimate. No audio devices or models required.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use revoice_core::{
    BackendHandle, ConversionConfig, PassthroughBackend, StreamingPipeline,
};

#[derive(Debug)]
struct Args {
    chunk_size: usize,
    seconds: u64,
    output: Option<std::path::PathBuf>,
}

#[derive(Debug, Serialize)]
struct Summary {
    chunk_size: usize,
    seconds: u64,
    chunks_processed: u64,
    chunks_dropped: u64,
    input_drops: u64,
    p50_processing_ms: f64,
    p95_processing_ms: f64,
    final_estimated_latency_ms: f64,
}

fn parse_args() -> Result<Args, String> {
    let mut chunk_size = 4096usize;
    let mut seconds = 5u64;
    let mut output = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--chunk-size" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --chunk-size".into());
                };
                chunk_size = v
                    .parse()
                    .map_err(|_| "invalid value for --chunk-size".to_string())?;
            }
            "--seconds" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --seconds".into());
                };
                seconds = v
                    .parse::<u64>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(1, 120);
            }
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = Some(std::path::PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p revoice-core --bin latency_bench -- \\
  [--chunk-size <samples>] [--seconds <n>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args {
        chunk_size,
        seconds,
        output,
    })
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx]
}

fn main() {
    if let Err(e) = run() {
        eprintln!("latency_bench failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;

    let config = ConversionConfig {
        chunk_size: args.chunk_size,
        ..ConversionConfig::default()
    };
    let rate = config.sample_rate;
    let pipeline = Arc::new(
        StreamingPipeline::with_backend(config, BackendHandle::new(PassthroughBackend::new()))
            .map_err(|e| e.to_string())?,
    );
    pipeline.start().map_err(|e| e.to_string())?;

    // 20 ms feed blocks at real-time pace.
    let block = rate as usize / 50;
    let block_period = Duration::from_millis(20);
    let total_blocks = args.seconds * 50;

    let mut processing_samples = Vec::with_capacity(total_blocks as usize);
    let mut phase = 0usize;
    let started = Instant::now();

    for i in 0..total_blocks {
        let sine: Vec<f32> = (0..block)
            .map(|j| {
                let t = (phase + j) as f32 / rate as f32;
                (2.0 * std::f32::consts::PI * 1000.0 * t).sin() * 0.5
            })
            .collect();
        phase += block;

        pipeline.process_input(&sine).map_err(|e| e.to_string())?;
        let _ = pipeline.get_output(block);

        let snapshot = pipeline.metrics();
        if snapshot.chunks_processed > 0 {
            processing_samples.push(snapshot.last_processing_ms);
        }

        let next = started + block_period * (i as u32 + 1);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    let snapshot = pipeline.metrics();
    pipeline.stop().map_err(|e| e.to_string())?;

    processing_samples.sort_by(|a, b| a.total_cmp(b));
    let summary = Summary {
        chunk_size: args.chunk_size,
        seconds: args.seconds,
        chunks_processed: snapshot.chunks_processed,
        chunks_dropped: snapshot.chunks_dropped,
        input_drops: snapshot.input_drops,
        p50_processing_ms: percentile(&processing_samples, 0.50),
        p95_processing_ms: percentile(&processing_samples, 0.95),
        final_estimated_latency_ms: snapshot.estimated_latency_ms,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    println!("{json}");
    if let Some(path) = args.output {
        std::fs::write(&path, json).map_err(|e| e.to_string())?;
        eprintln!("summary written to {}", path.display());
    }
    Ok(())
}
