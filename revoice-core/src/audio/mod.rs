//! Audio capture and playback around a running pipeline.
//!
//! # Design constraints
//!
//! The cpal callbacks run on OS audio threads at elevated priority. They
//! **must not** allocate, block on a mutex, or perform I/O. Both directions
//! therefore talk to their device callback through a lock-free SPSC ring:
//!
//! ```text
//! capture cb ──► SPSC ring ──► forwarder thread ──resample──► process_input
//! get_output ──resample──► feeder thread ──► SPSC ring ──► playback cb
//! ```
//!
//! The forwarder/feeder threads own the rate conversion and the (briefly
//! locking) pipeline calls.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). Each stream is created and dropped on its own dedicated
//! thread; open success or failure travels back to `start()` over a sync
//! channel.

pub mod device;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::StreamingPipeline;
use crate::error::{Result, RevoiceError};

/// Samples pulled from the pipeline per feeder iteration (20 ms at 48 kHz).
const FEED_BLOCK: usize = 960;

/// Capacity of the callback-facing rings (≈ 1.4 s at 48 kHz).
const DEVICE_RING_CAPACITY: usize = 1 << 16;

/// Sleep while a device ring has nothing to exchange.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// Device selection for [`AudioIo::start`].
#[derive(Debug, Clone, Default)]
pub struct AudioIoConfig {
    /// Preferred input device name; `None` selects the system default.
    pub preferred_input: Option<String>,
    /// Preferred output device name; `None` selects the system default.
    pub preferred_output: Option<String>,
}

/// Handle to the running capture + playback threads.
///
/// Holds a peer reference to the pipeline — it pushes input and pulls
/// output but does not own the pipeline's lifecycle.
pub struct AudioIo {
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    capture_thread: Option<JoinHandle<()>>,
    playback_thread: Option<JoinHandle<()>>,
}

impl AudioIo {
    /// Open capture and playback around `pipeline` and start streaming.
    ///
    /// Blocks until both devices are confirmed open (or either fails).
    ///
    /// # Errors
    /// `RevoiceError::NoDefaultInputDevice` / `NoDefaultOutputDevice` when
    /// no device exists, `RevoiceError::AudioStream` when cpal fails to
    /// build or play a stream.
    #[cfg(feature = "audio-cpal")]
    pub fn start(pipeline: Arc<StreamingPipeline>, config: AudioIoConfig) -> Result<Self> {
        use std::sync::mpsc;

        let running = Arc::new(AtomicBool::new(true));
        let underruns = Arc::new(AtomicU64::new(0));

        let (capture_open_tx, capture_open_rx) = mpsc::channel::<Result<u32>>();
        let capture_thread = {
            let pipeline = Arc::clone(&pipeline);
            let running = Arc::clone(&running);
            let preferred = config.preferred_input.clone();
            std::thread::Builder::new()
                .name("revoice-capture".into())
                .spawn(move || cpal_io::capture_loop(pipeline, running, preferred, capture_open_tx))?
        };
        match capture_open_rx.recv() {
            Ok(Ok(rate)) => info!(rate, "capture stream open"),
            Ok(Err(e)) => {
                running.store(false, Ordering::Release);
                let _ = capture_thread.join();
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                return Err(RevoiceError::AudioStream(
                    "capture thread died during startup".into(),
                ));
            }
        }

        let (playback_open_tx, playback_open_rx) = mpsc::channel::<Result<u32>>();
        let playback_thread = {
            let pipeline = Arc::clone(&pipeline);
            let running = Arc::clone(&running);
            let underruns = Arc::clone(&underruns);
            let preferred = config.preferred_output.clone();
            std::thread::Builder::new()
                .name("revoice-playback".into())
                .spawn(move || {
                    cpal_io::playback_loop(pipeline, running, underruns, preferred, playback_open_tx)
                })?
        };
        match playback_open_rx.recv() {
            Ok(Ok(rate)) => info!(rate, "playback stream open"),
            Ok(Err(e)) => {
                running.store(false, Ordering::Release);
                let _ = capture_thread.join();
                let _ = playback_thread.join();
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                let _ = capture_thread.join();
                return Err(RevoiceError::AudioStream(
                    "playback thread died during startup".into(),
                ));
            }
        }

        Ok(Self {
            running,
            underruns,
            capture_thread: Some(capture_thread),
            playback_thread: Some(playback_thread),
        })
    }

    /// Stub when the `audio-cpal` feature is disabled.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn start(_pipeline: Arc<StreamingPipeline>, _config: AudioIoConfig) -> Result<Self> {
        Err(RevoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Playback callbacks that had to zero-fill because the ring ran dry.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Stop both directions and release the devices.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.capture_thread.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked");
            }
        }
        if let Some(handle) = self.playback_thread.take() {
            if handle.join().is_err() {
                warn!("playback thread panicked");
            }
        }
        info!(underruns = self.underruns(), "audio io stopped");
    }
}

impl Drop for AudioIo {
    fn drop(&mut self) {
        if self.capture_thread.is_some() || self.playback_thread.is_some() {
            self.stop();
        }
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_io {
    use super::*;

    use std::sync::mpsc;

    use tracing::{debug, error};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
    use ringbuf::traits::{Consumer, Observer, Producer, Split};
    use ringbuf::{HeapCons, HeapProd, HeapRb};

    use crate::audio::resample::Resampler;
    use crate::config::WORKING_SAMPLE_RATE;

    enum Direction {
        Input,
        Output,
    }

    fn select_device(
        host: &cpal::Host,
        preferred: Option<&str>,
        direction: Direction,
    ) -> Result<cpal::Device> {
        let mut selected = None;
        if let Some(name) = preferred {
            let devices = match direction {
                Direction::Input => host.input_devices(),
                Direction::Output => host.output_devices(),
            };
            match devices {
                Ok(mut devices) => {
                    selected =
                        devices.find(|d| d.name().map(|n| n == name).unwrap_or(false));
                    if selected.is_none() {
                        warn!("preferred device '{name}' not found, falling back to default");
                    }
                }
                Err(e) => warn!("failed to list devices while resolving preference: {e}"),
            }
        }

        if let Some(device) = selected {
            return Ok(device);
        }
        match direction {
            Direction::Input => host
                .default_input_device()
                .ok_or(RevoiceError::NoDefaultInputDevice),
            Direction::Output => host
                .default_output_device()
                .ok_or(RevoiceError::NoDefaultOutputDevice),
        }
    }

    // ── Capture ──────────────────────────────────────────────────────────

    pub(super) fn capture_loop(
        pipeline: Arc<StreamingPipeline>,
        running: Arc<AtomicBool>,
        preferred: Option<String>,
        open_tx: mpsc::Sender<Result<u32>>,
    ) {
        let (producer, mut consumer) = HeapRb::<f32>::new(DEVICE_RING_CAPACITY).split();

        let opened = open_capture_stream(producer, Arc::clone(&running), preferred.as_deref())
            .and_then(|(stream, rate)| {
                Resampler::new(rate, WORKING_SAMPLE_RATE).map(|rs| (stream, rate, rs))
            });
        let (stream, _rate, mut resampler) = match opened {
            Ok(parts) => {
                let _ = open_tx.send(Ok(parts.1));
                parts
            }
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };

        let mut scratch = vec![0.0f32; FEED_BLOCK * 2];
        while running.load(Ordering::Acquire) {
            let n = consumer.pop_slice(&mut scratch);
            if n == 0 {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            let converted = resampler.push(&scratch[..n]);
            if converted.is_empty() {
                continue;
            }
            if let Err(e) = pipeline.process_input(&converted) {
                warn!(error = %e, "pipeline rejected captured audio");
            }
        }

        // The stream must drop on this thread to release the device.
        drop(stream);
        debug!("capture loop exited");
    }

    fn open_capture_stream(
        producer: HeapProd<f32>,
        running: Arc<AtomicBool>,
        preferred: Option<&str>,
    ) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let device = select_device(&host, preferred, Direction::Input)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| RevoiceError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_capture::<f32>(&device, &config, producer, running),
            SampleFormat::I16 => build_capture::<i16>(&device, &config, producer, running),
            SampleFormat::U16 => build_capture::<u16>(&device, &config, producer, running),
            fmt => Err(RevoiceError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| RevoiceError::AudioStream(e.to_string()))?;
        Ok((stream, sample_rate))
    }

    fn build_capture<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: HeapProd<f32>,
        running: Arc<AtomicBool>,
    ) -> Result<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels as usize;
        let mut mix: Vec<f32> = Vec::new();
        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / channels;
                    mix.resize(frames, 0.0);
                    // Downmix multichannel input by averaging.
                    for (slot, frame) in mix.iter_mut().zip(data.chunks_exact(channels)) {
                        let mut sum = 0.0f32;
                        for s in frame {
                            sum += f32::from_sample(*s);
                        }
                        *slot = sum / channels as f32;
                    }
                    let written = producer.push_slice(&mix);
                    if written < mix.len() {
                        warn!("capture ring full: dropped {} frames", mix.len() - written);
                    }
                },
                |err| error!("capture stream error: {err}"),
                None,
            )
            .map_err(|e| RevoiceError::AudioStream(e.to_string()))
    }

    // ── Playback ─────────────────────────────────────────────────────────

    pub(super) fn playback_loop(
        pipeline: Arc<StreamingPipeline>,
        running: Arc<AtomicBool>,
        underruns: Arc<AtomicU64>,
        preferred: Option<String>,
        open_tx: mpsc::Sender<Result<u32>>,
    ) {
        let (mut producer, consumer) = HeapRb::<f32>::new(DEVICE_RING_CAPACITY).split();

        let opened = open_playback_stream(
            consumer,
            Arc::clone(&running),
            Arc::clone(&underruns),
            preferred.as_deref(),
        )
        .and_then(|(stream, rate)| {
            Resampler::new(WORKING_SAMPLE_RATE, rate).map(|rs| (stream, rate, rs))
        });
        let (stream, _rate, mut resampler) = match opened {
            Ok(parts) => {
                let _ = open_tx.send(Ok(parts.1));
                parts
            }
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };

        // Pre-roll: silence covering one full chunk of processing latency,
        // so the first real output lands before the ring ever runs dry.
        let chunk_size = pipeline.config().chunk_size;
        let preroll_blocks = chunk_size.div_ceil(FEED_BLOCK) + 1;
        let silence = vec![0.0f32; FEED_BLOCK];
        for _ in 0..preroll_blocks {
            let out = resampler.push(&silence);
            producer.push_slice(&out);
        }
        debug!(preroll_blocks, "playback pre-roll queued");

        while running.load(Ordering::Acquire) {
            if producer.vacant_len() < FEED_BLOCK * 2 {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            let samples = pipeline.get_output(FEED_BLOCK);
            if samples.is_empty() {
                // Nothing converted yet; the callback pads with silence.
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            let out = resampler.push(&samples);
            let pushed = producer.push_slice(&out);
            if pushed < out.len() {
                warn!("playback ring full: dropped {} frames", out.len() - pushed);
            }
        }

        drop(stream);
        debug!("playback loop exited");
    }

    fn open_playback_stream(
        consumer: HeapCons<f32>,
        running: Arc<AtomicBool>,
        underruns: Arc<AtomicU64>,
        preferred: Option<&str>,
    ) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let device = select_device(&host, preferred, Direction::Output)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| RevoiceError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "playback config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_playback::<f32>(&device, &config, consumer, running, underruns)
            }
            SampleFormat::I16 => {
                build_playback::<i16>(&device, &config, consumer, running, underruns)
            }
            SampleFormat::U16 => {
                build_playback::<u16>(&device, &config, consumer, running, underruns)
            }
            fmt => Err(RevoiceError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| RevoiceError::AudioStream(e.to_string()))?;
        Ok((stream, sample_rate))
    }

    fn build_playback<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: HeapCons<f32>,
        running: Arc<AtomicBool>,
        underruns: Arc<AtomicU64>,
    ) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels as usize;
        let mut mono: Vec<f32> = Vec::new();
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _info| {
                    let frames = data.len() / channels;
                    mono.resize(frames, 0.0);
                    if !running.load(Ordering::Relaxed) {
                        data.fill(T::EQUILIBRIUM);
                        return;
                    }
                    let got = consumer.pop_slice(&mut mono[..frames]);
                    if got < frames {
                        // Underrun: satisfy the callback with silence.
                        underruns.fetch_add(1, Ordering::Relaxed);
                        mono[got..frames].fill(0.0);
                    }
                    // Upmix mono by duplication across device channels.
                    for (frame, &sample) in data.chunks_exact_mut(channels).zip(mono.iter()) {
                        let value = T::from_sample(sample);
                        for slot in frame {
                            *slot = value;
                        }
                    }
                },
                |err| error!("playback stream error: {err}"),
                None,
            )
            .map_err(|e| RevoiceError::AudioStream(e.to_string()))
    }
}
