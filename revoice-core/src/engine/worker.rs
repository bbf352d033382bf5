//! Inference worker loop.
//!
//! ## Per-iteration stages
//!
//! ```text
//! 1. Pull chunk + context from the input ring (sleep briefly when short)
//! 2. backend.convert_chunk, panic-isolated behind catch_unwind
//! 3a. Success  → output ring + metrics (EMA, estimated latency)
//! 3b. Retryable failure → one immediate retry with the same inputs
//! 3c. Persistent failure → substitute silence, count the drop, keep going
//! 3d. Fault (panic / unexpected error) → Failed state + status event,
//!     best-effort backend cleanup, loop exits
//! ```
//!
//! The worker never propagates an error upward: the main thread must not
//! be halted by a backend fault. Exactly one worker runs per pipeline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::BackendHandle;
use crate::buffering::manager::{BufferHealth, BufferManager};
use crate::error::{Result, RevoiceError};
use crate::events::{PipelineState, PipelineStatusEvent};

/// Exponential smoothing factor for per-chunk processing time.
const EMA_ALPHA: f64 = 0.2;

/// Upper bound on the idle sleep while the input ring lacks a full chunk.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Per-pipeline counters and gauges.
///
/// Each field is an individually-atomic 64-bit value (gauges store f64
/// bits), so readers never block the worker and never see a torn field. A
/// full snapshot may mix values from adjacent chunks; that is acceptable
/// for monitoring.
pub struct Metrics {
    chunks_processed: AtomicU64,
    chunks_dropped: AtomicU64,
    last_processing_ms: AtomicU64,
    ema_processing_ms: AtomicU64,
    estimated_latency_ms: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            chunks_processed: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            last_processing_ms: AtomicU64::new(0f64.to_bits()),
            ema_processing_ms: AtomicU64::new(0f64.to_bits()),
            estimated_latency_ms: AtomicU64::new(0f64.to_bits()),
        }
    }
}

impl Metrics {
    fn record_chunk(&self, processing_ms: f64, chunk_ms: f64, output_ms: f64) {
        let first = self.chunks_processed.fetch_add(1, Ordering::Relaxed) == 0;
        self.last_processing_ms
            .store(processing_ms.to_bits(), Ordering::Relaxed);

        let ema = if first {
            processing_ms
        } else {
            let prev = f64::from_bits(self.ema_processing_ms.load(Ordering::Relaxed));
            EMA_ALPHA * processing_ms + (1.0 - EMA_ALPHA) * prev
        };
        self.ema_processing_ms.store(ema.to_bits(), Ordering::Relaxed);
        self.estimated_latency_ms
            .store((chunk_ms + ema + output_ms).to_bits(), Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.chunks_processed.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.last_processing_ms.store(0f64.to_bits(), Ordering::Relaxed);
        self.ema_processing_ms.store(0f64.to_bits(), Ordering::Relaxed);
        self.estimated_latency_ms
            .store(0f64.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, health: BufferHealth) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            last_processing_ms: f64::from_bits(self.last_processing_ms.load(Ordering::Relaxed)),
            ema_processing_ms: f64::from_bits(self.ema_processing_ms.load(Ordering::Relaxed)),
            estimated_latency_ms: f64::from_bits(
                self.estimated_latency_ms.load(Ordering::Relaxed),
            ),
            input_fill: health.input_fill,
            output_fill: health.output_fill,
            context_fill: health.context_fill,
            input_drops: health.input_drops,
            output_drops: health.output_drops,
        }
    }
}

/// Point-in-time view of [`Metrics`] plus buffer health.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub chunks_processed: u64,
    pub chunks_dropped: u64,
    pub last_processing_ms: f64,
    /// Exponentially weighted processing time, α = 0.2.
    pub ema_processing_ms: f64,
    /// Chunk duration + smoothed processing time + buffered output.
    pub estimated_latency_ms: f64,
    pub input_fill: f32,
    pub output_fill: f32,
    pub context_fill: f32,
    pub input_drops: u64,
    pub output_drops: u64,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Everything the worker needs, passed as one struct so the spawn stays tidy.
pub struct WorkerContext {
    pub chunk_size: usize,
    pub sample_rate: u32,
    pub backend: BackendHandle,
    pub buffer: Arc<BufferManager>,
    pub stop: Arc<AtomicBool>,
    pub state: Arc<Mutex<PipelineState>>,
    pub status_tx: broadcast::Sender<PipelineStatusEvent>,
    pub metrics: Arc<Metrics>,
}

enum Outcome {
    Converted(Vec<f32>),
    Dropped(String),
    Fault(String),
}

/// Run the worker until the stop flag is set or a fault occurs.
pub fn run(ctx: WorkerContext) {
    let chunk_ms = ctx.chunk_size as f64 / ctx.sample_rate as f64 * 1000.0;
    let idle_sleep = Duration::from_secs_f64(chunk_ms / 1000.0 / 4.0).min(MAX_IDLE_SLEEP);
    info!(
        chunk_size = ctx.chunk_size,
        chunk_ms = format_args!("{chunk_ms:.1}"),
        "conversion worker started"
    );

    while !ctx.stop.load(Ordering::Acquire) {
        let Some((chunk, context)) = ctx.buffer.read_chunk_for_processing() else {
            std::thread::sleep(idle_sleep);
            continue;
        };

        let started = Instant::now();
        match convert_with_retry(&ctx, &chunk, &context) {
            Outcome::Converted(mut samples) => {
                let processing_ms = started.elapsed().as_secs_f64() * 1000.0;
                // Backends must return exactly one chunk; guard the output
                // ring's chunk-size invariant regardless.
                debug_assert_eq!(samples.len(), ctx.chunk_size);
                if samples.len() != ctx.chunk_size {
                    samples.resize(ctx.chunk_size, 0.0);
                }
                ctx.buffer.write_output(&samples);
                let output_ms =
                    ctx.buffer.output_size() as f64 / ctx.sample_rate as f64 * 1000.0;
                ctx.metrics.record_chunk(processing_ms, chunk_ms, output_ms);
            }
            Outcome::Dropped(detail) => {
                warn!(detail = %detail, "chunk conversion failed; substituting silence");
                ctx.buffer.write_output(&vec![0.0; ctx.chunk_size]);
                ctx.metrics.record_drop();
            }
            Outcome::Fault(detail) => {
                error!(detail = %detail, "worker fault — pipeline failed");
                fail(&ctx, detail);
                return;
            }
        }
    }

    debug!("conversion worker stopped");
}

fn convert_with_retry(ctx: &WorkerContext, chunk: &[f32], context: &[f32]) -> Outcome {
    match convert_once(ctx, chunk, context) {
        Ok(samples) => Outcome::Converted(samples),
        Err(RevoiceError::Convert {
            retryable: true,
            detail,
        }) => {
            debug!(detail = %detail, "retryable conversion failure; retrying once");
            match convert_once(ctx, chunk, context) {
                Ok(samples) => Outcome::Converted(samples),
                Err(RevoiceError::Convert { detail, .. }) => Outcome::Dropped(detail),
                Err(other) => Outcome::Fault(other.to_string()),
            }
        }
        Err(RevoiceError::Convert {
            retryable: false,
            detail,
        }) => Outcome::Dropped(detail),
        Err(other) => Outcome::Fault(other.to_string()),
    }
}

fn convert_once(ctx: &WorkerContext, chunk: &[f32], context: &[f32]) -> Result<Vec<f32>> {
    let backend = ctx.backend.clone();
    panic::catch_unwind(AssertUnwindSafe(move || {
        backend.0.lock().convert_chunk(chunk, context)
    }))
    .unwrap_or_else(|payload| Err(RevoiceError::WorkerFault(panic_message(&payload))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    eprintln!("DEBUG box<str>={} cow={} arc_str={} err={}",
        payload.downcast_ref::<Box<str>>().is_some(),
        payload.downcast_ref::<std::borrow::Cow<'static, str>>().is_some(),
        payload.downcast_ref::<std::sync::Arc<str>>().is_some(),
        payload.downcast_ref::<crate::error::RevoiceError>().is_some(),
    );
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn fail(ctx: &WorkerContext, detail: String) {
    eprintln!("DEBUG fail detail = {detail:?}");
    *ctx.state.lock() = PipelineState::Failed;
    let _ = ctx.status_tx.send(PipelineStatusEvent {
        state: PipelineState::Failed,
        detail: Some(detail),
    });
    // Best-effort resource reclaim; parking_lot mutexes do not poison, so
    // the backend lock is still usable after a conversion panic.
    let backend = ctx.backend.clone();
    if panic::catch_unwind(AssertUnwindSafe(move || backend.0.lock().cleanup())).is_err() {
        warn!("backend cleanup panicked during failure handling");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::backend::ConversionBackend;

    #[test]
    fn debug_downcast_in_this_module() {
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            panic!("scripted panic")
        }));
        let e = r.unwrap_err();
        eprintln!("DEBUG here: is_str={} is_string={}", e.downcast_ref::<&str>().is_some(), e.downcast_ref::<String>().is_some());
    }

    #[test]
    fn debug_via_backendhandle() {
        let (backend, _calls, _cleanups) = ScriptedBackend::new(Mode::Panic);
        let handle = BackendHandle::new(backend);
        let h2 = handle.clone();
        let r = panic::catch_unwind(AssertUnwindSafe(move || {
            h2.0.lock().convert_chunk(&[0.0f32; 4], &[])
        }));
        let e = r.unwrap_err();
        eprintln!("DEBUG via handle: is_str={} is_string={}", e.downcast_ref::<&str>().is_some(), e.downcast_ref::<String>().is_some());
    }

    const CS: usize = 1024;
    const RATE: u32 = 48_000;

    struct ScriptedBackend {
        calls: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
        mode: Mode,
    }

    #[derive(Clone, Copy)]
    enum Mode {
        Passthrough,
        FailAlways,
        FailOnceRetryable,
        Panic,
        Slow(Duration),
    }

    impl ScriptedBackend {
        fn new(mode: Mode) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let cleanups = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: Arc::clone(&calls),
                    cleanups: Arc::clone(&cleanups),
                    mode,
                },
                calls,
                cleanups,
            )
        }
    }

    impl ConversionBackend for ScriptedBackend {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn convert_chunk(&mut self, chunk: &[f32], _context: &[f32]) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Passthrough => Ok(chunk.to_vec()),
                Mode::FailAlways => Err(RevoiceError::convert("scripted failure")),
                Mode::FailOnceRetryable => {
                    if call == 0 {
                        Err(RevoiceError::convert_retryable("transient"))
                    } else {
                        Ok(chunk.to_vec())
                    }
                }
                Mode::Panic => panic!("scripted panic"),
                Mode::Slow(delay) => {
                    thread::sleep(delay);
                    Ok(chunk.to_vec())
                }
            }
        }

        fn cleanup(&mut self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        buffer: Arc<BufferManager>,
        stop: Arc<AtomicBool>,
        state: Arc<Mutex<PipelineState>>,
        status_rx: broadcast::Receiver<PipelineStatusEvent>,
        metrics: Arc<Metrics>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_worker(mode: Mode) -> (Harness, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (backend, calls, cleanups) = ScriptedBackend::new(mode);
        let buffer = Arc::new(BufferManager::new(CS));
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(PipelineState::Running));
        let (status_tx, status_rx) = broadcast::channel(8);
        let metrics = Arc::new(Metrics::default());

        let ctx = WorkerContext {
            chunk_size: CS,
            sample_rate: RATE,
            backend: BackendHandle::new(backend),
            buffer: Arc::clone(&buffer),
            stop: Arc::clone(&stop),
            state: Arc::clone(&state),
            status_tx,
            metrics: Arc::clone(&metrics),
        };
        let handle = thread::spawn(move || run(ctx));

        (
            Harness {
                buffer,
                stop,
                state,
                status_rx,
                metrics,
                handle,
            },
            calls,
            cleanups,
        )
    }

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn passthrough_chunk_reaches_output_in_order() {
        let (h, _, _) = spawn_worker(Mode::Passthrough);
        let samples: Vec<f32> = (0..2 * CS).map(|i| i as f32).collect();
        h.buffer.write_input(&samples);

        assert!(wait_for(
            || h.buffer.output_size() == 2 * CS,
            Duration::from_secs(1)
        ));
        assert_eq!(h.buffer.read_output(2 * CS), samples);

        h.stop.store(true, Ordering::Release);
        h.handle.join().unwrap();
        let snap = h.metrics.snapshot(h.buffer.health());
        assert_eq!(snap.chunks_processed, 2);
        assert_eq!(snap.chunks_dropped, 0);
        assert!(snap.estimated_latency_ms > 0.0);
    }

    #[test]
    fn persistent_failure_substitutes_silence_and_keeps_running() {
        let (h, calls, _) = spawn_worker(Mode::FailAlways);
        h.buffer.write_input(&vec![0.5; 3 * CS]);

        assert!(wait_for(
            || h.metrics.snapshot(h.buffer.health()).chunks_dropped == 3,
            Duration::from_secs(1)
        ));
        let out = h.buffer.read_output(3 * CS);
        assert_eq!(out.len(), 3 * CS);
        assert!(out.iter().all(|&s| s == 0.0), "dropped chunks become silence");
        assert_eq!(*h.state.lock(), PipelineState::Running);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "non-retryable: one call each");
        assert_eq!(
            h.metrics.snapshot(h.buffer.health()).chunks_processed,
            0
        );

        h.stop.store(true, Ordering::Release);
        h.handle.join().unwrap();
    }

    #[test]
    fn retryable_failure_is_retried_once_with_same_inputs() {
        let (h, calls, _) = spawn_worker(Mode::FailOnceRetryable);
        let samples: Vec<f32> = (0..CS).map(|i| i as f32).collect();
        h.buffer.write_input(&samples);

        assert!(wait_for(
            || h.buffer.output_size() == CS,
            Duration::from_secs(1)
        ));
        assert_eq!(h.buffer.read_output(CS), samples);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let snap = h.metrics.snapshot(h.buffer.health());
        assert_eq!(snap.chunks_processed, 1);
        assert_eq!(snap.chunks_dropped, 0);

        h.stop.store(true, Ordering::Release);
        h.handle.join().unwrap();
    }

    #[test]
    fn panic_transitions_to_failed_and_cleans_up() {
        let (mut h, _, cleanups) = spawn_worker(Mode::Panic);
        h.buffer.write_input(&vec![0.1; CS]);

        h.handle.join().expect("worker isolates the panic");
        assert_eq!(*h.state.lock(), PipelineState::Failed);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        match h.status_rx.try_recv() {
            Ok(event) => {
                assert_eq!(event.state, PipelineState::Failed);
                assert!(event.detail.unwrap().contains("scripted panic"));
            }
            Err(TryRecvError::Empty) => panic!("expected a Failed status event"),
            Err(e) => panic!("status channel error: {e}"),
        }
    }

    #[test]
    fn stop_flag_exits_promptly_even_mid_backlog() {
        let (h, _, _) = spawn_worker(Mode::Slow(Duration::from_millis(30)));
        h.buffer.write_input(&vec![0.2; 8 * CS]);

        thread::sleep(Duration::from_millis(45));
        h.stop.store(true, Ordering::Release);
        let joined = Instant::now();
        h.handle.join().unwrap();
        assert!(
            joined.elapsed() < Duration::from_millis(200),
            "worker must exit after at most one in-flight chunk"
        );
    }

    #[test]
    fn ema_tracks_processing_time() {
        let metrics = Metrics::default();
        let health = BufferManager::new(CS).health();
        metrics.record_chunk(10.0, 21.3, 0.0);
        assert_eq!(metrics.snapshot(health).ema_processing_ms, 10.0);
        metrics.record_chunk(20.0, 21.3, 0.0);
        let ema = metrics.snapshot(health).ema_processing_ms;
        assert!((ema - (0.2 * 20.0 + 0.8 * 10.0)).abs() < 1e-9);
    }

    #[test]
    fn snapshot_serializes_with_camel_case() {
        let metrics = Metrics::default();
        let snap = metrics.snapshot(BufferManager::new(CS).health());
        let json = serde_json::to_value(snap).unwrap();
        assert!(json.get("chunksProcessed").is_some());
        assert!(json.get("estimatedLatencyMs").is_some());
        assert!(json.get("inputDrops").is_some());
    }
}
