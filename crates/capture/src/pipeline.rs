//! Capture pipeline
//!
//! Ties a backend, a transfer pool and a sink together and runs the event
//! loop on the calling thread:
//!
//! ```text
//!  Idle ──start()──► Streaming ──stop / fault──► Draining ──all finalized──► Stopped
//! ```
//!
//! The stop signal is sampled once per loop iteration, before blocking on the
//! backend, never while a completion is being dispatched. Completions are
//! dispatched synchronously from the loop, so resubmission never happens
//! inside a transport callback.

use crate::error::{CaptureError, Result};
use crate::pool::{CompletionOutcome, DispatchMode, TransferPool};
use crate::sink::PacketSink;
use crate::transport::{IsoBackend, TransferError, TransferLayout};
use common::{MetricsSnapshot, StreamMetrics};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Cross-thread request to stop streaming
///
/// Cloning shares the flag; raising it from any clone is observed by the
/// event loop at its next iteration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Streaming,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Streaming => "streaming",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why the stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// External stop signal (Ctrl+C, SIGTERM)
    StopRequested,
    /// Initial fill failed at `slot`
    SubmitFailed { slot: usize, error: TransferError },
    /// The transport refused to take `slot` back
    ResubmitFailed { slot: usize, error: TransferError },
    /// The sink stopped accepting data
    SinkClosed(io::ErrorKind),
    /// The device disconnected
    DeviceLost,
    /// Event handling failed
    TransportFault(TransferError),
    /// Drain did not finish in time; `abandoned` transfers were leaked
    DrainTimedOut { abandoned: usize },
}

impl StopReason {
    /// Whether the stream ended on request rather than because of a fault
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            StopReason::StopRequested | StopReason::SinkClosed(io::ErrorKind::BrokenPipe)
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StopRequested => write!(f, "stop requested"),
            StopReason::SubmitFailed { slot, error } => {
                write!(f, "initial submission of transfer {} failed: {}", slot, error)
            }
            StopReason::ResubmitFailed { slot, error } => {
                write!(f, "resubmission of transfer {} failed: {}", slot, error)
            }
            StopReason::SinkClosed(kind) => write!(f, "output closed ({:?})", kind),
            StopReason::DeviceLost => write!(f, "device disconnected"),
            StopReason::TransportFault(error) => write!(f, "event handling failed: {}", error),
            StopReason::DrainTimedOut { abandoned } => {
                write!(f, "drain timed out with {} transfers outstanding", abandoned)
            }
        }
    }
}

/// Event loop timing
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Upper bound on one blocking wait for completions
    pub event_timeout: Duration,
    /// How long to wait for cancellations to be confirmed
    pub drain_timeout: Duration,
    /// Period of the stats log line, if any
    pub stats_interval: Option<Duration>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            stats_interval: None,
        }
    }
}

/// Result of a finished capture run
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub stop_reason: Option<StopReason>,
    pub iterations: u64,
    /// Transfers whose buffers were freed
    pub released: usize,
    pub metrics: MetricsSnapshot,
}

/// Isochronous capture pipeline
pub struct Pipeline<B: IsoBackend, S: PacketSink> {
    backend: B,
    pool: TransferPool<B::Transfer>,
    sink: S,
    state: PipelineState,
    stop: StopSignal,
    metrics: Arc<StreamMetrics>,
    settings: LoopSettings,
    completed: Vec<usize>,
    iterations: u64,
    /// Consecutive failed waits
    wait_failures: u64,
    drain_started: Option<Instant>,
    stop_reason: Option<StopReason>,
    last_stats: Instant,
}

impl<B: IsoBackend, S: PacketSink> Pipeline<B, S> {
    /// Allocate `transfers` transfers and build an idle pipeline
    pub fn new(
        mut backend: B,
        transfers: usize,
        layout: TransferLayout,
        sink: S,
        stop: StopSignal,
        settings: LoopSettings,
    ) -> Result<Self> {
        let pool = TransferPool::allocate(&mut backend, transfers, layout)
            .map_err(|(slot, source)| CaptureError::Allocation { slot, source })?;

        Ok(Self {
            backend,
            pool,
            sink,
            state: PipelineState::Idle,
            stop,
            metrics: Arc::new(StreamMetrics::new()),
            settings,
            completed: Vec::with_capacity(transfers),
            iterations: 0,
            wait_failures: 0,
            drain_started: None,
            stop_reason: None,
            last_stats: Instant::now(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn pool(&self) -> &TransferPool<B::Transfer> {
        &self.pool
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Completed event-loop iterations
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// Submit every transfer and enter `Streaming`
    ///
    /// If any submission fails, the transfers already submitted are cancelled
    /// and drained before the error is returned, so the pipeline can be
    /// finished without leaking buffers.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            warn!("Pipeline already started ({})", self.state);
            return Ok(());
        }

        match self.pool.submit_all() {
            Ok(()) => {
                self.state = PipelineState::Streaming;
                self.metrics.mark_started();
                info!("Streaming with {} transfers in flight", self.pool.in_flight());
                Ok(())
            }
            Err(e) => {
                self.begin_drain(StopReason::SubmitFailed {
                    slot: e.slot,
                    error: e.source.clone(),
                });
                self.run();
                Err(CaptureError::Submit {
                    slot: e.slot,
                    source: e.source,
                })
            }
        }
    }

    /// Run the event loop until the pipeline is stopped
    pub fn run(&mut self) -> Option<StopReason> {
        while !matches!(self.step(), PipelineState::Stopped | PipelineState::Idle) {}
        self.stop_reason.clone()
    }

    /// One event-loop iteration: observe the stop signal, wait for
    /// completions, dispatch them
    pub fn step(&mut self) -> PipelineState {
        match self.state {
            PipelineState::Idle | PipelineState::Stopped => return self.state,
            PipelineState::Streaming => {
                if self.stop.is_raised() {
                    info!("Stop requested, draining transfers");
                    self.begin_drain(StopReason::StopRequested);
                }
            }
            PipelineState::Draining => {}
        }

        if self.state == PipelineState::Draining && self.check_drain_deadline() {
            return self.state;
        }
        if self.state == PipelineState::Stopped {
            return self.state;
        }

        let mut completed = std::mem::take(&mut self.completed);
        completed.clear();
        match self.backend.wait(self.settings.event_timeout, &mut completed) {
            Ok(()) => self.wait_failures = 0,
            Err(e) if self.state == PipelineState::Streaming => {
                warn!("Error handling USB events: {}", e);
                self.wait_failures = 1;
                let reason = if e.is_fatal() {
                    StopReason::DeviceLost
                } else {
                    StopReason::TransportFault(e)
                };
                self.begin_drain(reason);
            }
            Err(e) => {
                self.wait_failures += 1;
                debug!(
                    "Error handling USB events while {} ({} in a row): {}",
                    self.state, self.wait_failures, e
                );
                self.back_off_failed_wait();
            }
        }

        for &slot in &completed {
            self.dispatch(slot);
        }
        self.completed = completed;
        self.iterations += 1;

        if self.state == PipelineState::Draining && self.pool.outstanding() == 0 {
            self.enter_stopped();
        }
        self.log_stats();
        self.state
    }

    fn dispatch(&mut self, slot: usize) {
        let mode = match self.state {
            PipelineState::Streaming => DispatchMode::Stream,
            _ => DispatchMode::Drain,
        };

        match self
            .pool
            .on_completion(slot, mode, &mut self.sink, &self.metrics)
        {
            CompletionOutcome::Resubmitted { bytes } => {
                trace!("Transfer {} returned {} bytes, resubmitted", slot, bytes);
            }
            CompletionOutcome::Finalized { status } => {
                trace!(
                    "Transfer {} finalized ({:?}), {} outstanding",
                    slot,
                    status,
                    self.pool.outstanding()
                );
            }
            CompletionOutcome::ResubmitFailed { error } => {
                error!("Failed to resubmit transfer {}: {}", slot, error);
                self.begin_drain(StopReason::ResubmitFailed { slot, error });
            }
            CompletionOutcome::SinkFailed { error } => {
                if error.kind() == io::ErrorKind::BrokenPipe {
                    info!("Output closed by reader");
                } else {
                    error!("Failed to write audio: {}", error);
                }
                self.begin_drain(StopReason::SinkClosed(error.kind()));
            }
            CompletionOutcome::DeviceLost => {
                warn!("Device disconnected during streaming");
                self.begin_drain(StopReason::DeviceLost);
            }
            CompletionOutcome::Spurious => {}
        }
    }

    /// Enter `Draining` and request cancellation of every in-flight transfer
    fn begin_drain(&mut self, reason: StopReason) {
        if matches!(self.state, PipelineState::Draining | PipelineState::Stopped) {
            debug!("Already {}, ignoring: {}", self.state, reason);
            return;
        }

        if !reason.is_clean() {
            warn!("Stopping stream: {}", reason);
        }
        self.state = PipelineState::Draining;
        self.drain_started = Some(Instant::now());
        self.stop_reason = Some(reason);

        let cancelled = self.pool.cancel_outstanding();
        self.pool.finalize_idle();
        info!(
            "Draining: {} transfers cancelled, {} outstanding",
            cancelled,
            self.pool.outstanding()
        );

        if self.pool.outstanding() == 0 {
            self.enter_stopped();
        }
    }

    /// A failed wait returns immediately; sleep out the event timeout so a
    /// dead transport does not spin until the drain deadline
    fn back_off_failed_wait(&self) {
        let mut pause = self.settings.event_timeout;
        if let Some(started) = self.drain_started {
            pause = pause.min(self.settings.drain_timeout.saturating_sub(started.elapsed()));
        }
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }

    /// Returns true if the drain deadline expired and the pipeline stopped
    fn check_drain_deadline(&mut self) -> bool {
        if self.pool.outstanding() == 0 {
            self.enter_stopped();
            return true;
        }

        let expired = self
            .drain_started
            .is_some_and(|started| started.elapsed() >= self.settings.drain_timeout);
        if !expired {
            return false;
        }

        if let Some(reason) = &self.stop_reason {
            error!("Drain timed out after stream stopped: {}", reason);
        }
        let abandoned = self.pool.abandon_outstanding();
        self.stop_reason = Some(StopReason::DrainTimedOut { abandoned });
        self.enter_stopped();
        true
    }

    fn enter_stopped(&mut self) {
        self.state = PipelineState::Stopped;
        info!(
            "Stream stopped after {} iterations ({} transfers finalized)",
            self.iterations,
            self.pool.finalized()
        );
    }

    fn log_stats(&mut self) {
        let Some(interval) = self.settings.stats_interval else {
            return;
        };
        if self.last_stats.elapsed() < interval {
            return;
        }
        self.last_stats = Instant::now();

        let snapshot = self.metrics.snapshot();
        info!(
            "Captured {} at {}, {} packets dropped ({} loss), {} transfers",
            snapshot.format_bytes_forwarded(),
            snapshot.format_throughput(),
            snapshot.packets_dropped,
            snapshot.format_loss_rate(),
            snapshot.transfers_completed
        );
    }

    /// Release every transfer and return the sink
    ///
    /// Only valid once the pipeline is stopped (or never started).
    pub fn finish(self) -> Result<(CaptureSummary, S)> {
        let Pipeline {
            pool,
            sink,
            metrics,
            iterations,
            stop_reason,
            ..
        } = self;

        let released = pool.release().map_err(|(pool, outstanding)| {
            error!("Refusing to free {} transfers still in flight", outstanding);
            drop(pool);
            CaptureError::PoolBusy { outstanding }
        })?;

        let summary = CaptureSummary {
            stop_reason,
            iterations,
            released,
            metrics: metrics.snapshot(),
        };
        Ok((summary, sink))
    }
}
