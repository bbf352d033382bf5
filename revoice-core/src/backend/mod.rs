//! Conversion backend capability.
//!
//! The pipeline drives any implementor of [`ConversionBackend`] through
//! three blocking operations and never inspects backend internals.
//! Backends are interchangeable at pipeline creation via
//! [`create_backend`]; tests and the benchmark binary inject their own
//! through [`BackendHandle::new`].

pub mod batch;
pub mod models;
pub mod passthrough;
pub mod streaming;

#[cfg(feature = "onnx")]
pub mod onnx;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{BackendKind, ConversionConfig};
use crate::error::Result;

#[cfg(not(feature = "onnx"))]
use crate::error::RevoiceError;

/// Contract for voice conversion backends.
///
/// `&mut self` throughout: backends are stateful (crossfade tails, scratch
/// directories, model sessions). All mutation is serialised through the
/// [`BackendHandle`] mutex, and after `start()` only the worker thread
/// converts.
pub trait ConversionBackend: Send + 'static {
    /// Load models and allocate scratch resources. Called once before the
    /// worker enters its loop; may take several seconds and is treated as
    /// part of `start()`.
    ///
    /// # Errors
    /// `RevoiceError::BackendInit` when model files are missing, weights
    /// are incompatible, or scratch space cannot be created.
    fn initialize(&mut self) -> Result<()>;

    /// Convert one chunk.
    ///
    /// `chunk` is exactly the configured chunk size; `context` holds up to
    /// CS/4 samples of the preceding input (empty on the very first call).
    /// The returned chunk must be exactly chunk-size long — backends pad or
    /// trim internally. May take arbitrarily long; the pipeline measures
    /// but never interrupts.
    ///
    /// # Errors
    /// `RevoiceError::Convert { retryable, .. }`. Retryable failures get
    /// one immediate retry from the worker; persistent failures are
    /// absorbed as silence.
    fn convert_chunk(&mut self, chunk: &[f32], context: &[f32]) -> Result<Vec<f32>>;

    /// Release models, temp files and carried state. Idempotent; resource
    /// leaks are logged, never fatal. A later `initialize` restores a
    /// clean state.
    fn cleanup(&mut self);
}

/// Thread-safe reference-counted handle to any [`ConversionBackend`].
///
/// `parking_lot::Mutex` so a panic inside `convert_chunk` does not poison
/// the lock — the worker's failure path still reaches `cleanup`.
#[derive(Clone)]
pub struct BackendHandle(pub Arc<Mutex<dyn ConversionBackend>>);

impl BackendHandle {
    pub fn new<B: ConversionBackend>(backend: B) -> Self {
        Self(Arc::new(Mutex::new(backend)))
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle").finish_non_exhaustive()
    }
}

/// Build the backend selected by `config.backend`.
///
/// # Errors
/// `RevoiceError::BackendInit` when the streaming backend is requested
/// without the `onnx` feature compiled in.
pub fn create_backend(config: &ConversionConfig) -> Result<BackendHandle> {
    match config.backend {
        BackendKind::Batch => Ok(BackendHandle::new(batch::BatchAdapter::new(config.clone()))),
        BackendKind::Streaming => {
            #[cfg(feature = "onnx")]
            {
                let loader = Box::new(onnx::OnnxModelLoader::new(config));
                Ok(BackendHandle::new(streaming::StreamingBackend::new(
                    config, loader,
                )))
            }
            #[cfg(not(feature = "onnx"))]
            {
                Err(RevoiceError::BackendInit(
                    "streaming backend requires the 'onnx' feature".into(),
                ))
            }
        }
    }
}
