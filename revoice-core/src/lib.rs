//! # revoice-core
//!
//! Real-time retrieval-based voice conversion (RVC) streaming engine.
//!
//! ## Architecture
//!
//! ```text
//! Mic → AudioIo.capture → StreamingPipeline.process_input → input ring
//!                                                              │
//!                                  (worker thread pulls chunk + context)
//!                                                              ▼
//!                                            ConversionBackend.convert_chunk
//!                                                              │
//!                                                              ▼
//!                              output ring → StreamingPipeline.get_output
//!                                                              │
//!                                          AudioIo.playback → Speakers
//! ```
//!
//! The device callbacks are zero-alloc; all heap work happens on the
//! forwarding threads and the single inference worker. Two interchangeable
//! backends exist: a file-batch adapter around an external converter and a
//! native streaming backend with crossfaded overlap-add stitching.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod backend;
pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;

// Convenience re-exports for downstream crates
pub use audio::{AudioIo, AudioIoConfig};
pub use backend::{passthrough::PassthroughBackend, BackendHandle, ConversionBackend};
pub use config::{BackendKind, ConversionConfig, PitchMethod, WORKING_SAMPLE_RATE};
pub use engine::worker::MetricsSnapshot;
pub use engine::StreamingPipeline;
pub use error::{Result, RevoiceError};
pub use events::{PipelineState, PipelineStatusEvent};

#[cfg(feature = "onnx")]
pub use backend::onnx::OnnxModelLoader;
