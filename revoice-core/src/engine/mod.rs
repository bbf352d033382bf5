//! `StreamingPipeline` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! StreamingPipeline::create(config)          state = Created
//!     └─► start()     backend.initialize() → worker spawned → Running
//!         └─► stop()  stop flag → join (≤2 s) → backend.cleanup → Stopped
//! ```
//!
//! A backend fault inside the worker transitions the pipeline to `Failed`
//! and emits a status event; the caller is never unwound across threads.
//!
//! ## Threading
//!
//! The pipeline is `Send + Sync` — all fields use interior mutability, so
//! `Arc<StreamingPipeline>` can be shared between the audio threads and a
//! controlling thread. `process_input`, `get_output` and `metrics` never
//! block on inference; they contend only for short ring-buffer locks.

pub mod worker;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::backend::{self, BackendHandle};
use crate::buffering::manager::BufferManager;
use crate::config::ConversionConfig;
use crate::error::{Result, RevoiceError};
use crate::events::{PipelineState, PipelineStatusEvent};
use worker::{Metrics, MetricsSnapshot, WorkerContext};

/// Status channel capacity: enough for every transition of one lifecycle
/// plus slack for slow subscribers.
const BROADCAST_CAP: usize = 64;

/// How long `stop()` waits for the worker before declaring the pipeline
/// failed. The worker is never interrupted mid-chunk; it is left to drain.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Tick granularity of the metrics-callback timer thread.
const CALLBACK_TICK: Duration = Duration::from_millis(50);

type MetricsCallback = Arc<dyn Fn(MetricsSnapshot) + Send + Sync>;

pub struct StreamingPipeline {
    config: ConversionConfig,
    backend: BackendHandle,
    buffer: Arc<BufferManager>,
    state: Arc<Mutex<PipelineState>>,
    stop_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
    status_tx: broadcast::Sender<PipelineStatusEvent>,
    metrics_callback: Mutex<Option<(MetricsCallback, Duration)>>,
    callback_thread: Mutex<Option<JoinHandle<()>>>,
    underrun_padding: AtomicU64,
}

impl StreamingPipeline {
    /// Create a pipeline with the backend selected by `config.backend`.
    pub fn create(config: ConversionConfig) -> Result<Self> {
        let backend = backend::create_backend(&config)?;
        Self::with_backend(config, backend)
    }

    /// Create a pipeline around an explicit backend handle. This is how
    /// tests and embedders inject custom backends.
    pub fn with_backend(config: ConversionConfig, backend: BackendHandle) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let buffer = Arc::new(BufferManager::new(config.chunk_size));

        Ok(Self {
            config,
            backend,
            buffer,
            state: Arc::new(Mutex::new(PipelineState::Created)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            metrics: Arc::new(Metrics::default()),
            status_tx,
            metrics_callback: Mutex::new(None),
            callback_thread: Mutex::new(None),
            underrun_padding: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Subscribe to lifecycle events, including worker-side `Failed`
    /// transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<PipelineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Initialize the backend and spawn the worker.
    ///
    /// Model loading happens on the calling thread and may take seconds;
    /// the pipeline reports `Running` for that window, matching the
    /// contract that initialization is part of `start()`.
    ///
    /// # Errors
    /// - `RevoiceError::NotStartable` unless the state is `Created`.
    /// - `RevoiceError::BackendInit` when the backend fails to come up;
    ///   the pipeline is then `Failed`.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Created {
                return Err(RevoiceError::NotStartable { state: *state });
            }
            *state = PipelineState::Running;
        }
        self.send_status(PipelineState::Running, None);

        if let Err(e) = self.backend.0.lock().initialize() {
            *self.state.lock() = PipelineState::Failed;
            self.send_status(PipelineState::Failed, Some(e.to_string()));
            return Err(e);
        }

        let ctx = WorkerContext {
            chunk_size: self.config.chunk_size,
            sample_rate: self.config.sample_rate,
            backend: self.backend.clone(),
            buffer: Arc::clone(&self.buffer),
            stop: Arc::clone(&self.stop_flag),
            state: Arc::clone(&self.state),
            status_tx: self.status_tx.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let handle = std::thread::Builder::new()
            .name("revoice-worker".into())
            .spawn(move || worker::run(ctx))?;
        *self.worker.lock() = Some(handle);

        self.spawn_metrics_callback();
        info!(
            chunk_size = self.config.chunk_size,
            backend = ?self.config.backend,
            "pipeline started"
        );
        Ok(())
    }

    /// Append captured PCM.
    ///
    /// Non-blocking and safe from any thread at any rate; the input ring's
    /// overflow policy bounds memory. Outside `Running` this is a no-op.
    ///
    /// # Errors
    /// `RevoiceError::NonFiniteInput` when the data contains NaN or ∞ —
    /// surfaced synchronously, pipeline state unaffected.
    pub fn process_input(&self, samples: &[f32]) -> Result<()> {
        if let Some(offset) = samples.iter().position(|s| !s.is_finite()) {
            return Err(RevoiceError::NonFiniteInput { offset });
        }
        if self.state() != PipelineState::Running {
            return Ok(());
        }
        self.buffer.write_input(samples);
        Ok(())
    }

    /// Up to `n` converted samples, FIFO. Empty when nothing is buffered —
    /// the playback side fills the gap with silence — and always empty once
    /// the pipeline is `Stopped` or `Failed`.
    pub fn get_output(&self, n: usize) -> Vec<f32> {
        match self.state() {
            PipelineState::Running | PipelineState::Stopping => {
                let out = self.buffer.read_output(n);
                if out.len() < n {
                    self.underrun_padding
                        .fetch_add((n - out.len()) as u64, Ordering::Relaxed);
                }
                out
            }
            _ => Vec::new(),
        }
    }

    /// Non-blocking metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.buffer.health())
    }

    /// Samples of silence the playback side had to synthesize because
    /// `get_output` came up short.
    pub fn underrun_padding(&self) -> u64 {
        self.underrun_padding.load(Ordering::Relaxed)
    }

    /// Register a metrics callback invoked every `interval_ms` from a
    /// dedicated timer thread (never the worker) while the pipeline runs.
    /// Takes effect at `start()`.
    pub fn set_metrics_callback<F>(&self, callback: F, interval_ms: u64)
    where
        F: Fn(MetricsSnapshot) + Send + Sync + 'static,
    {
        *self.metrics_callback.lock() = Some((
            Arc::new(callback),
            Duration::from_millis(interval_ms.max(1)),
        ));
    }

    /// Cooperative shutdown: set the stop flag, join the worker (bounded),
    /// clean up the backend. Idempotent — a second call is a no-op, and a
    /// call on a `Failed` pipeline re-attempts resource reclaim.
    ///
    /// # Errors
    /// `RevoiceError::WorkerFault` when the worker is still inside
    /// `convert_chunk` after the join timeout; the pipeline is then
    /// `Failed` and a later `stop()` may retry.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PipelineState::Stopped => return Ok(()),
                PipelineState::Created => {
                    *state = PipelineState::Stopped;
                    drop(state);
                    self.send_status(PipelineState::Stopped, None);
                    return Ok(());
                }
                PipelineState::Running => {
                    *state = PipelineState::Stopping;
                    drop(state);
                    self.send_status(PipelineState::Stopping, None);
                }
                // Stopping: a concurrent stop() is in flight — fall through
                // and serialize on the worker handle below.
                // Failed: re-attempt reclaim.
                PipelineState::Stopping | PipelineState::Failed => {}
            }
        }
        self.stop_flag.store(true, Ordering::Release);

        // Holding the handle lock across the join serializes concurrent
        // stop() calls.
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("worker thread panicked outside the conversion guard");
                }
            } else {
                // Still inside convert_chunk. Leave it to drain on its own;
                // the handle goes back so a later stop() can retry.
                *self.state.lock() = PipelineState::Failed;
                self.send_status(
                    PipelineState::Failed,
                    Some("worker did not stop within the join timeout".into()),
                );
                *worker = Some(handle);
                return Err(RevoiceError::WorkerFault(format!(
                    "worker still converting after {STOP_JOIN_TIMEOUT:?}"
                )));
            }
        }
        drop(worker);

        self.backend.0.lock().cleanup();

        {
            let mut state = self.state.lock();
            if *state != PipelineState::Failed {
                *state = PipelineState::Stopped;
                drop(state);
                self.send_status(PipelineState::Stopped, None);
            }
        }
        // The callback thread exits on its own once it observes a terminal
        // state, so this join is bounded by one timer tick.
        self.join_callback_thread();
        info!("pipeline stopped");
        Ok(())
    }

    /// Return all rings to empty and zero every counter. Only legal while
    /// the pipeline is not running.
    ///
    /// # Errors
    /// `RevoiceError::AlreadyRunning` in `Running` or `Stopping`.
    pub fn reset_buffers(&self) -> Result<()> {
        match self.state() {
            PipelineState::Running | PipelineState::Stopping => Err(RevoiceError::AlreadyRunning),
            _ => {
                self.buffer.reset();
                self.metrics.reset();
                self.underrun_padding.store(0, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn send_status(&self, state: PipelineState, detail: Option<String>) {
        let _ = self.status_tx.send(PipelineStatusEvent { state, detail });
    }

    fn spawn_metrics_callback(&self) {
        let Some((callback, interval)) = self.metrics_callback.lock().clone() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let metrics = Arc::clone(&self.metrics);
        let buffer = Arc::clone(&self.buffer);

        let handle = std::thread::Builder::new()
            .name("revoice-metrics".into())
            .spawn(move || {
                let mut since_last = Duration::ZERO;
                loop {
                    std::thread::sleep(CALLBACK_TICK);
                    let current = *state.lock();
                    if current.is_terminal() {
                        break;
                    }
                    since_last += CALLBACK_TICK;
                    if since_last >= interval && current == PipelineState::Running {
                        callback(metrics.snapshot(buffer.health()));
                        since_last = Duration::ZERO;
                    }
                }
            });
        match handle {
            Ok(handle) => *self.callback_thread.lock() = Some(handle),
            Err(e) => warn!("failed to spawn metrics callback thread: {e}"),
        }
    }

    fn join_callback_thread(&self) {
        if let Some(handle) = self.callback_thread.lock().take() {
            if handle.join().is_err() {
                warn!("metrics callback thread panicked");
            }
        }
    }
}

impl Drop for StreamingPipeline {
    fn drop(&mut self) {
        // Dropping a running pipeline without stop(): flag the worker and
        // callback threads down so they exit instead of spinning forever on
        // the Arcs they hold.
        self.stop_flag.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if matches!(*state, PipelineState::Running | PipelineState::Stopping) {
            *state = PipelineState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::passthrough::PassthroughBackend;
    use crate::backend::ConversionBackend;

    fn config(chunk_size: usize) -> ConversionConfig {
        ConversionConfig {
            chunk_size,
            ..ConversionConfig::default()
        }
    }

    fn passthrough_pipeline(chunk_size: usize) -> StreamingPipeline {
        StreamingPipeline::with_backend(
            config(chunk_size),
            BackendHandle::new(PassthroughBackend::new()),
        )
        .unwrap()
    }

    struct InitFailBackend;

    impl ConversionBackend for InitFailBackend {
        fn initialize(&mut self) -> Result<()> {
            Err(RevoiceError::BackendInit("weights missing".into()))
        }

        fn convert_chunk(&mut self, chunk: &[f32], _context: &[f32]) -> Result<Vec<f32>> {
            Ok(chunk.to_vec())
        }

        fn cleanup(&mut self) {}
    }

    #[test]
    fn create_validates_config() {
        let mut cfg = ConversionConfig::default();
        cfg.chunk_size = 100;
        let result =
            StreamingPipeline::with_backend(cfg, BackendHandle::new(PassthroughBackend::new()));
        assert!(matches!(result, Err(RevoiceError::InvalidConfig(_))));
    }

    #[test]
    fn lifecycle_created_running_stopped() {
        let pipeline = passthrough_pipeline(1024);
        assert_eq!(pipeline.state(), PipelineState::Created);
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn start_twice_is_rejected() {
        let pipeline = passthrough_pipeline(1024);
        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.start(),
            Err(RevoiceError::NotStartable { .. })
        ));
        pipeline.stop().unwrap();
        assert!(matches!(
            pipeline.start(),
            Err(RevoiceError::NotStartable {
                state: PipelineState::Stopped
            })
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let pipeline = passthrough_pipeline(1024);
        pipeline.start().unwrap();
        pipeline.stop().unwrap();
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn stop_on_created_pipeline_goes_straight_to_stopped() {
        let pipeline = passthrough_pipeline(1024);
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn init_failure_fails_the_pipeline() {
        let pipeline =
            StreamingPipeline::with_backend(config(1024), BackendHandle::new(InitFailBackend))
                .unwrap();
        let mut status_rx = pipeline.subscribe_status();
        assert!(matches!(
            pipeline.start(),
            Err(RevoiceError::BackendInit(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        // Running then Failed.
        assert_eq!(
            status_rx.try_recv().unwrap().state,
            PipelineState::Running
        );
        assert_eq!(status_rx.try_recv().unwrap().state, PipelineState::Failed);
    }

    #[test]
    fn non_finite_input_is_rejected_synchronously() {
        let pipeline = passthrough_pipeline(1024);
        pipeline.start().unwrap();
        let err = pipeline
            .process_input(&[0.0, 1.0, f32::NAN, 2.0])
            .unwrap_err();
        assert!(matches!(
            err,
            RevoiceError::NonFiniteInput { offset: 2 }
        ));
        assert_eq!(pipeline.state(), PipelineState::Running, "state unaffected");
        pipeline
            .process_input(&[0.0, f32::INFINITY])
            .unwrap_err();
        pipeline.stop().unwrap();
    }

    #[test]
    fn io_is_a_no_op_outside_running() {
        let pipeline = passthrough_pipeline(1024);
        pipeline.process_input(&[0.1; 64]).unwrap();
        assert!(pipeline.get_output(64).is_empty());
        assert_eq!(pipeline.metrics().input_fill, 0.0);

        pipeline.start().unwrap();
        pipeline.stop().unwrap();
        pipeline.process_input(&[0.1; 64]).unwrap();
        assert!(pipeline.get_output(64).is_empty());
    }

    #[test]
    fn reset_buffers_requires_not_running() {
        let pipeline = passthrough_pipeline(1024);
        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.reset_buffers(),
            Err(RevoiceError::AlreadyRunning)
        ));
        pipeline.stop().unwrap();
        pipeline.reset_buffers().unwrap();
        let snap = pipeline.metrics();
        assert_eq!(snap.chunks_processed, 0);
        assert_eq!(snap.input_fill, 0.0);
    }

    #[test]
    fn metrics_callback_fires_from_timer_thread() {
        use std::sync::atomic::AtomicUsize;

        let pipeline = Arc::new(passthrough_pipeline(1024));
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            pipeline.set_metrics_callback(
                move |_snapshot| {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                60,
            );
        }
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        pipeline.stop().unwrap();
        assert!(
            fired.load(Ordering::SeqCst) >= 1,
            "callback should have fired at least once"
        );
    }
}
