//! `PassthroughBackend` — identity conversion without a model.
//!
//! Exercises the full buffering/worker/playback path end-to-end; used by
//! tests and the latency benchmark.

use tracing::debug;

use crate::backend::ConversionBackend;
use crate::error::Result;

/// Returns every chunk unchanged.
pub struct PassthroughBackend {
    chunks_seen: u64,
}

impl PassthroughBackend {
    pub fn new() -> Self {
        Self { chunks_seen: 0 }
    }
}

impl Default for PassthroughBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionBackend for PassthroughBackend {
    fn initialize(&mut self) -> Result<()> {
        debug!("PassthroughBackend::initialize — no-op");
        Ok(())
    }

    fn convert_chunk(&mut self, chunk: &[f32], _context: &[f32]) -> Result<Vec<f32>> {
        self.chunks_seen += 1;
        Ok(chunk.to_vec())
    }

    fn cleanup(&mut self) {
        debug!(chunks_seen = self.chunks_seen, "PassthroughBackend::cleanup");
    }
}
