//! `BufferManager` — the three rings of one pipeline instance.
//!
//! ```text
//! write_input ──► input ring ──► read_chunk_for_processing ──► worker
//!                                   │ (chunk tail saved as next context)
//!                                   ▼
//!                               context ring
//!
//! worker ──► write_output ──► output ring ──► read_output ──► playback
//! ```
//!
//! Decoupling buffering from both I/O and inference lets the worker run at
//! its own pace; bounded rings enforce backpressure instead of letting
//! queues grow without limit.

use serde::Serialize;

use crate::buffering::RingBuffer;
use crate::config::CONTEXT_DIVISOR;

/// Input ring capacity in chunks. Large enough that a multi-chunk burst of
/// input survives intact while the worker catches up.
pub const INPUT_CAPACITY_CHUNKS: usize = 10;

/// Output ring capacity in chunks (converted audio awaiting playback).
pub const OUTPUT_CAPACITY_CHUNKS: usize = 20;

/// Fill levels and drop counters for monitoring.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferHealth {
    /// Input ring fill as a fraction of capacity, `0.0 ..= 1.0`.
    pub input_fill: f32,
    pub output_fill: f32,
    pub context_fill: f32,
    pub input_drops: u64,
    pub output_drops: u64,
}

/// Owns the input / context / output rings for a single pipeline.
pub struct BufferManager {
    chunk_size: usize,
    context_size: usize,
    input: RingBuffer,
    context: RingBuffer,
    output: RingBuffer,
}

impl BufferManager {
    pub fn new(chunk_size: usize) -> Self {
        let context_size = chunk_size / CONTEXT_DIVISOR;
        Self {
            chunk_size,
            context_size,
            input: RingBuffer::new(chunk_size * INPUT_CAPACITY_CHUNKS),
            context: RingBuffer::new(context_size),
            output: RingBuffer::new(chunk_size * OUTPUT_CAPACITY_CHUNKS),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// Append captured PCM. Called from the capture path at any rate; the
    /// input ring's overflow policy bounds memory under overload.
    pub fn write_input(&self, samples: &[f32]) {
        self.input.write(samples);
    }

    /// Pull one chunk plus its left context, or `None` while fewer than a
    /// full chunk is buffered.
    ///
    /// The context ring is drained as this chunk's context and refilled
    /// with the chunk's own tail, so after the k-th call it holds exactly
    /// the last CS/4 samples of the k-th chunk. Single consumer: only the
    /// worker thread calls this.
    pub fn read_chunk_for_processing(&self) -> Option<(Vec<f32>, Vec<f32>)> {
        if self.input.size() < self.chunk_size {
            return None;
        }
        let chunk = self.input.read(self.chunk_size);
        let context = self.context.read(self.context_size);
        self.context.write(&chunk[self.chunk_size - self.context_size..]);
        Some((chunk, context))
    }

    /// Append converted PCM for playback.
    pub fn write_output(&self, samples: &[f32]) {
        self.output.write(samples);
    }

    /// Up to `n` converted samples, FIFO.
    pub fn read_output(&self, n: usize) -> Vec<f32> {
        self.output.read(n)
    }

    /// Converted samples currently awaiting playback.
    pub fn output_size(&self) -> usize {
        self.output.size()
    }

    pub fn health(&self) -> BufferHealth {
        BufferHealth {
            input_fill: self.input.size() as f32 / self.input.capacity() as f32,
            output_fill: self.output.size() as f32 / self.output.capacity() as f32,
            context_fill: self.context.size() as f32 / self.context.capacity() as f32,
            input_drops: self.input.drops(),
            output_drops: self.output.drops(),
        }
    }

    /// Return all rings to empty and zero the drop counters. The pipeline
    /// only calls this while not running.
    pub fn reset(&self) {
        self.input.reset();
        self.context.reset();
        self.output.reset();
    }
}
