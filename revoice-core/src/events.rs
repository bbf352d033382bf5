//! Pipeline status events broadcast to subscribers.
//!
//! Subscribers receive a [`PipelineStatusEvent`] on every lifecycle
//! transition, including the `Failed` transition raised from inside the
//! worker thread — the only way a caller learns about a worker fault
//! without polling `state()`.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a `StreamingPipeline`.
///
/// ```text
/// Created ──start()──► Running ──stop()──► Stopping ──► Stopped
///                         │
///                         └── backend fault ──► Failed
/// ```
///
/// `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Pipeline constructed; `start()` not yet called.
    Created,
    /// Worker thread active, audio flowing.
    Running,
    /// `stop()` requested; waiting for the worker to drain.
    Stopping,
    /// Cleanly stopped.
    Stopped,
    /// Unrecoverable fault — a new pipeline must be created.
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }
}

/// Emitted on the status channel when the pipeline state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatusEvent {
    pub state: PipelineState,
    /// Optional human-readable detail (e.g. the fault message).
    pub detail: Option<String>,
}
