//! Capture loop
//!
//! One dedicated thread runs [`StreamScheduler`]: every cycle it grabs the
//! screen, decides whether the image is worth sending, encodes it under the
//! current quality budget and queues it for the broadcast transport. The
//! loop paces itself to the target frame rate and never exits on a cycle
//! error; only [`StreamHandle::stop`] ends it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::desktop::{
    AdaptiveEncoder, CapturedImage, ChangeDetector, EncodeOutcome, EncodedFrame, EncoderSettings,
    FrameType, Quality, QualityBudget, RuntimeParams, ScreenSource, DEFAULT_QUALITY,
};
use crate::error::CaptureResult;
use crate::stream::clients::{
    heartbeat_channel, ClientConditionTracker, Heartbeat, HeartbeatSender, TrackerSettings,
};

/// Pipeline settings, fixed for the lifetime of the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Quality requested for every frame before adaptation
    pub base_quality: Quality,
    /// A keyframe is forced every this many cycles
    pub keyframe_interval: u64,
    /// Dissimilarity above which a delta frame is sent
    pub motion_threshold: f64,
    /// Capacity of the outgoing work queue
    pub queue_capacity: usize,
    /// Lag above which quality is capped
    pub lag_soft_limit_ms: f64,
    /// Lag above which frames are dropped
    pub lag_hard_limit_ms: f64,
    /// Quality cap while a viewer is lagging
    pub lagging_quality_cap: Quality,
    /// Pause after a failed cycle
    pub retry_delay: Duration,
    /// Encoder tuning
    pub encoder: EncoderSettings,
    /// Client tracker tuning
    pub tracker: TrackerSettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            base_quality: DEFAULT_QUALITY,
            keyframe_interval: 30,
            motion_threshold: 0.015,
            queue_capacity: 2,
            lag_soft_limit_ms: 100.0,
            lag_hard_limit_ms: 200.0,
            lagging_quality_cap: 70,
            retry_delay: Duration::from_millis(100),
            encoder: EncoderSettings::default(),
            tracker: TrackerSettings::default(),
        }
    }
}

impl StreamSettings {
    /// Builds scheduler settings from the persisted configuration
    pub fn from_config(config: &Config) -> Self {
        let stream = &config.stream;
        let adaptation = &config.adaptation;
        let compression = &config.compression;

        Self {
            base_quality: stream.base_quality,
            keyframe_interval: stream.keyframe_interval.max(1),
            motion_threshold: stream.motion_threshold,
            queue_capacity: stream.queue_capacity.max(1),
            lag_soft_limit_ms: adaptation.lag_soft_limit_ms as f64,
            lag_hard_limit_ms: adaptation.lag_hard_limit_ms as f64,
            lagging_quality_cap: adaptation.lagging_quality_cap,
            retry_delay: Duration::from_millis(stream.capture_retry_delay_ms),
            encoder: EncoderSettings {
                delta_quality_ceiling: stream.delta_quality_ceiling,
                keyframe_level: compression.keyframe_level,
                delta_level: compression.delta_level,
                quantization_step: compression.quantization_step,
            },
            tracker: TrackerSettings {
                smoothing: adaptation.lag_smoothing,
                stale_after: Duration::from_secs(adaptation.client_stale_after_secs),
            },
        }
    }

    /// Maps the observed viewer lag onto a quality budget
    pub fn resolve_budget(&self, requested: Quality, lag_ms: f64) -> QualityBudget {
        if lag_ms > self.lag_hard_limit_ms {
            QualityBudget::Drop
        } else if lag_ms > self.lag_soft_limit_ms {
            QualityBudget::Encode(requested.min(self.lagging_quality_cap))
        } else {
            QualityBudget::Encode(requested)
        }
    }
}

/// Returns true when cycle `counter` must carry a keyframe
pub fn is_keyframe(counter: u64, interval: u64) -> bool {
    counter % interval.max(1) == 0
}

/// Why a cycle produced nothing, when that was the intended behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The outgoing queue was at capacity
    QueueFull,
    /// The most constrained viewer is too far behind
    ClientLagging,
    /// Not a keyframe and the screen did not change enough
    NoChange,
    /// Nothing is draining the outgoing queue any more
    TransportClosed,
}

/// Which stage of a cycle failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// The screen source returned an error
    Capture,
    /// The encoder could not produce a frame; paced like a skip
    Encode,
    /// The cycle panicked
    Internal,
}

/// Result of one capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A frame was queued for broadcast
    Sent {
        /// Type of the queued frame
        frame_type: FrameType,
        /// Payload size
        bytes: usize,
    },
    /// Deliberately produced nothing
    Skipped(SkipReason),
    /// A stage failed; the loop backs off and continues
    Failed(FailureStage),
}

impl CycleOutcome {
    /// Returns true if a frame was queued
    pub fn is_sent(&self) -> bool {
        matches!(self, CycleOutcome::Sent { .. })
    }

    /// Returns the queued frame type, if any
    pub fn frame_type(&self) -> Option<FrameType> {
        match self {
            CycleOutcome::Sent { frame_type, .. } => Some(*frame_type),
            _ => None,
        }
    }
}

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    /// Cycles run
    pub cycles: u64,
    /// Keyframes queued
    pub keyframes_sent: u64,
    /// Delta frames queued
    pub deltas_sent: u64,
    /// Payload bytes queued
    pub bytes_sent: u64,
    /// Cycles skipped because the queue was full
    pub skipped_queue_full: u64,
    /// Cycles skipped because a viewer was lagging
    pub skipped_client_lagging: u64,
    /// Cycles skipped for lack of change
    pub skipped_no_change: u64,
    /// Cycles skipped because the transport was gone
    pub skipped_transport_closed: u64,
    /// Failed captures
    pub capture_failures: u64,
    /// Failed encodes
    pub encode_failures: u64,
    /// Panicked cycles
    pub internal_failures: u64,
    /// Moving average of cycle processing time
    pub avg_cycle_time_ms: f64,
}

impl PipelineStats {
    /// Returns the total number of frames queued
    pub fn frames_sent(&self) -> u64 {
        self.keyframes_sent + self.deltas_sent
    }

    /// Returns the total number of deliberately skipped cycles
    pub fn frames_skipped(&self) -> u64 {
        self.skipped_queue_full
            + self.skipped_client_lagging
            + self.skipped_no_change
            + self.skipped_transport_closed
    }

    /// Returns the total number of failed cycles
    pub fn failures(&self) -> u64 {
        self.capture_failures + self.encode_failures + self.internal_failures
    }

    fn record(&mut self, outcome: CycleOutcome, elapsed: Duration) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Sent { frame_type, bytes } => {
                match frame_type {
                    FrameType::Keyframe => self.keyframes_sent += 1,
                    FrameType::Delta => self.deltas_sent += 1,
                }
                self.bytes_sent += bytes as u64;
            }
            CycleOutcome::Skipped(SkipReason::QueueFull) => self.skipped_queue_full += 1,
            CycleOutcome::Skipped(SkipReason::ClientLagging) => self.skipped_client_lagging += 1,
            CycleOutcome::Skipped(SkipReason::NoChange) => self.skipped_no_change += 1,
            CycleOutcome::Skipped(SkipReason::TransportClosed) => {
                self.skipped_transport_closed += 1
            }
            CycleOutcome::Failed(FailureStage::Capture) => self.capture_failures += 1,
            CycleOutcome::Failed(FailureStage::Encode) => self.encode_failures += 1,
            CycleOutcome::Failed(FailureStage::Internal) => self.internal_failures += 1,
        }

        let ms = elapsed.as_secs_f64() * 1000.0;
        if self.avg_cycle_time_ms == 0.0 {
            self.avg_cycle_time_ms = ms;
        } else {
            self.avg_cycle_time_ms = self.avg_cycle_time_ms * 0.9 + ms * 0.1;
        }
    }
}

/// The other ends of the scheduler's channels
pub struct PipelineEndpoints {
    /// Encoded frames in cycle order
    pub frames: mpsc::Receiver<EncodedFrame>,
    /// Where connection handlers push heartbeats
    pub heartbeats: HeartbeatSender,
    /// Where control messages publish new runtime parameters
    pub params: watch::Sender<RuntimeParams>,
    /// Latest pipeline counters
    pub stats: watch::Receiver<PipelineStats>,
}

/// Adaptive capture loop state
pub struct StreamScheduler {
    settings: StreamSettings,
    detector: ChangeDetector,
    encoder: AdaptiveEncoder,
    tracker: ClientConditionTracker,
    heartbeats: mpsc::Receiver<Heartbeat>,
    params: watch::Receiver<RuntimeParams>,
    queue: mpsc::Sender<EncodedFrame>,
    counter: u64,
    stats: PipelineStats,
    stats_tx: watch::Sender<PipelineStats>,
}

impl StreamScheduler {
    /// Creates a scheduler and the channel ends the rest of the host talks
    /// to it through
    pub fn new(settings: StreamSettings, params: RuntimeParams) -> (Self, PipelineEndpoints) {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (heartbeat_tx, heartbeat_rx) = heartbeat_channel();
        let (params_tx, params_rx) = watch::channel(params);
        let (stats_tx, stats_rx) = watch::channel(PipelineStats::default());

        let scheduler = Self {
            detector: ChangeDetector::new(),
            encoder: AdaptiveEncoder::new(settings.encoder),
            tracker: ClientConditionTracker::new(settings.tracker),
            heartbeats: heartbeat_rx,
            params: params_rx,
            queue: queue_tx,
            counter: 0,
            stats: PipelineStats::default(),
            stats_tx,
            settings,
        };

        let endpoints = PipelineEndpoints {
            frames: queue_rx,
            heartbeats: heartbeat_tx,
            params: params_tx,
            stats: stats_rx,
        };

        (scheduler, endpoints)
    }

    /// Returns the settings
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Returns the number of cycles that reached the frame-type decision
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Returns the counters
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Returns the viewer tracker
    pub fn tracker(&self) -> &ClientConditionTracker {
        &self.tracker
    }

    /// Returns the current runtime parameters
    pub fn params(&self) -> RuntimeParams {
        *self.params.borrow()
    }

    /// Runs one full cycle: apply pending heartbeats, capture, process.
    pub fn run_cycle<S: ScreenSource + ?Sized>(&mut self, source: &mut S) -> CycleOutcome {
        let start = Instant::now();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.refresh_clients();
            match self.capture(source) {
                Ok(image) => self.process_image(image),
                Err(e) => {
                    error!("Failed to capture frame: {}", e);
                    CycleOutcome::Failed(FailureStage::Capture)
                }
            }
        }));

        let outcome = result.unwrap_or_else(|_| {
            error!("Capture cycle panicked");
            CycleOutcome::Failed(FailureStage::Internal)
        });

        self.stats.record(outcome, start.elapsed());
        self.stats_tx.send_replace(self.stats.clone());
        outcome
    }

    fn refresh_clients(&mut self) {
        self.tracker.drain(&mut self.heartbeats);
        self.tracker.evict_stale();
    }

    fn capture<S: ScreenSource + ?Sized>(&mut self, source: &mut S) -> CaptureResult<CapturedImage> {
        let scale = self.params.borrow().scale;
        source.capture()?.scaled(scale)
    }

    /// Runs the decision pipeline on an already captured image.
    ///
    /// Counts the cycle, checks backpressure, scores the change, resolves
    /// the quality budget and encodes when the frame is a keyframe or the
    /// screen changed enough.
    pub fn process_image(&mut self, image: CapturedImage) -> CycleOutcome {
        self.counter += 1;
        let frame_type = if is_keyframe(self.counter, self.settings.keyframe_interval) {
            FrameType::Keyframe
        } else {
            FrameType::Delta
        };

        // Claiming the slot up front makes check-and-enqueue one step
        let permit = match self.queue.clone().try_reserve_owned() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(cycle = self.counter, "Work queue full, skipping cycle");
                return CycleOutcome::Skipped(SkipReason::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(cycle = self.counter, "Work queue closed, skipping cycle");
                return CycleOutcome::Skipped(SkipReason::TransportClosed);
            }
        };

        let score = self.detector.score(&image);

        let lag_ms = self.tracker.worst_lag_ms();
        let budget = self.settings.resolve_budget(self.settings.base_quality, lag_ms);
        if budget == QualityBudget::Drop {
            debug!(cycle = self.counter, lag_ms, "Viewer lagging, dropping frame");
            return CycleOutcome::Skipped(SkipReason::ClientLagging);
        }

        if !frame_type.is_keyframe() && score <= self.settings.motion_threshold {
            return CycleOutcome::Skipped(SkipReason::NoChange);
        }

        match self.encoder.encode(&image, frame_type, budget) {
            EncodeOutcome::Encoded(frame) => {
                let bytes = frame.size_bytes();
                debug!(
                    cycle = self.counter,
                    %frame_type,
                    score,
                    lag_ms,
                    quality = frame.quality,
                    bytes,
                    "Queued frame"
                );
                permit.send(frame);
                CycleOutcome::Sent { frame_type, bytes }
            }
            EncodeOutcome::Skipped => CycleOutcome::Failed(FailureStage::Encode),
        }
    }

    /// Runs cycles until `is_running` is cleared, holding the target cadence.
    pub fn run<S: ScreenSource + ?Sized>(mut self, source: &mut S, is_running: &AtomicBool) {
        info!(
            "Starting capture loop at {} FPS (keyframe every {} cycles)",
            self.params().frame_rate,
            self.settings.keyframe_interval
        );

        while is_running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            let outcome = self.run_cycle(source);

            // A failed encode is a skipped frame; only a broken source backs off
            if let CycleOutcome::Failed(FailureStage::Capture | FailureStage::Internal) = outcome {
                std::thread::sleep(self.settings.retry_delay);
                continue;
            }

            let interval = self.params().frame_interval();
            let elapsed = cycle_start.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }

        info!(
            "Capture loop stopped after {} cycles ({} frames sent, {} skipped, {} failed)",
            self.stats.cycles,
            self.stats.frames_sent(),
            self.stats.frames_skipped(),
            self.stats.failures()
        );
    }

    /// Moves the loop onto a dedicated thread.
    ///
    /// `open_source` runs on that thread, since screen grabbers are usually
    /// not `Send`. It is retried after `retry_delay` until it succeeds or
    /// the handle is stopped.
    pub fn spawn<F, S>(self, mut open_source: F) -> std::io::Result<StreamHandle>
    where
        F: FnMut() -> CaptureResult<S> + Send + 'static,
        S: ScreenSource,
    {
        let is_running = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&is_running);
        let stats = self.stats_tx.subscribe();
        let retry_delay = self.settings.retry_delay;

        let thread = std::thread::Builder::new()
            .name("desk-stream-capture".to_string())
            .spawn(move || {
                let mut source = loop {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    match open_source() {
                        Ok(source) => break source,
                        Err(e) => {
                            warn!("Failed to open screen source, retrying: {}", e);
                            std::thread::sleep(retry_delay);
                        }
                    }
                };
                self.run(&mut source, &running);
            })?;

        Ok(StreamHandle {
            is_running,
            thread: Some(thread),
            stats,
        })
    }
}

/// Handle to a capture loop running on its own thread
pub struct StreamHandle {
    is_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: watch::Receiver<PipelineStats>,
}

impl StreamHandle {
    /// Returns whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
            && self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Returns the latest counters
    pub fn stats(&self) -> PipelineStats {
        self.stats.borrow().clone()
    }

    /// Stops the loop and waits for the current cycle to finish.
    ///
    /// The screen source is dropped on the capture thread before this
    /// returns.
    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            info!("Stopping capture loop");
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
