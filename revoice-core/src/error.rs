use thiserror::Error;

use crate::events::PipelineState;

/// All errors produced by revoice-core.
#[derive(Debug, Error)]
pub enum RevoiceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("non-finite sample at offset {offset} in input")]
    NonFiniteInput { offset: usize },

    #[error("backend initialization failed: {0}")]
    BackendInit(String),

    /// Per-chunk conversion failure. The worker retries a `retryable`
    /// failure once before substituting silence for the chunk.
    #[error("chunk conversion failed: {detail}")]
    Convert { retryable: bool, detail: String },

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("pipeline cannot start from state {state:?}")]
    NotStartable { state: PipelineState },

    #[error("pipeline is running")]
    AlreadyRunning,

    #[error("pipeline worker fault: {0}")]
    WorkerFault(String),

    #[cfg(feature = "onnx")]
    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RevoiceError {
    /// A non-retryable per-chunk conversion failure.
    pub fn convert(detail: impl Into<String>) -> Self {
        Self::Convert {
            retryable: false,
            detail: detail.into(),
        }
    }

    /// A per-chunk conversion failure worth one immediate retry.
    pub fn convert_retryable(detail: impl Into<String>) -> Self {
        Self::Convert {
            retryable: true,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RevoiceError>;
