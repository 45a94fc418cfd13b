//! Stream metrics for the isochronous capture pipeline
//!
//! Counters are plain atomics so the capture thread can update them while the
//! main thread reads a snapshot for the shutdown summary.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Rolling window size for throughput samples
const ROLLING_WINDOW_SIZE: usize = 256;

/// Window over which throughput is averaged
const ROLLING_WINDOW: Duration = Duration::from_secs(5);

/// Throughput sample for bandwidth calculation
#[derive(Debug, Clone, Copy)]
struct ThroughputSample {
    /// Bytes forwarded to the sink
    bytes: u64,
    /// Timestamp when the transfer completed
    timestamp: Instant,
}

/// Rolling throughput calculator
#[derive(Debug)]
struct RollingThroughput {
    samples: VecDeque<ThroughputSample>,
    window_duration: Duration,
}

impl RollingThroughput {
    fn new(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(ROLLING_WINDOW_SIZE),
            window_duration,
        }
    }

    fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back(ThroughputSample {
            bytes,
            timestamp: now,
        });
        self.prune_old_samples(now);
    }

    fn prune_old_samples(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window_duration).unwrap_or(now);
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff || self.samples.len() > ROLLING_WINDOW_SIZE {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Calculate bytes per second over the rolling window
    fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let total_bytes: u64 = self.samples.iter().map(|s| s.bytes).sum();
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => {
                let secs = last.timestamp.duration_since(first.timestamp).as_secs_f64();
                if secs > 0.0 {
                    total_bytes as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

/// Counters for one capture run
#[derive(Debug)]
pub struct StreamMetrics {
    /// Transfers returned by the host controller (any status)
    transfers_completed: AtomicU64,
    /// Transfers whose transfer-level status was not OK
    transfers_failed: AtomicU64,
    /// Transfers confirmed cancelled during drain
    transfers_cancelled: AtomicU64,
    /// Resubmissions rejected by the transport
    resubmit_failures: AtomicU64,
    /// Packets with OK status and a payload
    packets_ok: AtomicU64,
    /// Packets with OK status but no payload
    packets_empty: AtomicU64,
    /// Packets skipped because of a per-packet error status
    packets_dropped: AtomicU64,
    /// Payload bytes handed to the sink
    bytes_forwarded: AtomicU64,
    throughput: RwLock<RollingThroughput>,
    started_at: RwLock<Option<Instant>>,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            transfers_cancelled: AtomicU64::new(0),
            resubmit_failures: AtomicU64::new(0),
            packets_ok: AtomicU64::new(0),
            packets_empty: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            throughput: RwLock::new(RollingThroughput::new(ROLLING_WINDOW)),
            started_at: RwLock::new(None),
        }
    }

    /// Mark the start of streaming
    pub fn mark_started(&self) {
        if let Ok(mut started_at) = self.started_at.write() {
            *started_at = Some(Instant::now());
        }
    }

    /// Time since streaming started
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .read()
            .ok()
            .and_then(|started_at| started_at.map(|t| t.elapsed()))
    }

    /// Record a returned transfer and the payload bytes it produced
    pub fn transfer_completed(&self, bytes: u64) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        if bytes > 0 {
            self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
            if let Ok(mut throughput) = self.throughput.write() {
                throughput.add_sample(bytes);
            }
        }
    }

    /// Record a transfer that came back with a transfer-level error
    pub fn transfer_failed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_cancelled(&self) {
        self.transfers_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resubmit_failed(&self) {
        self.resubmit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_ok(&self) {
        self.packets_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_empty(&self) {
        self.packets_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfers_completed(&self) -> u64 {
        self.transfers_completed.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    /// Payload throughput in bytes per second
    pub fn throughput_bps(&self) -> f64 {
        self.throughput
            .read()
            .map(|t| t.bytes_per_second())
            .unwrap_or(0.0)
    }

    /// Fraction of packets lost to per-packet errors (0.0 - 1.0)
    pub fn loss_rate(&self) -> f64 {
        let ok = self.packets_ok.load(Ordering::Relaxed) + self.packets_empty.load(Ordering::Relaxed);
        let dropped = self.packets_dropped.load(Ordering::Relaxed);
        let total = ok + dropped;
        if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_completed: self.transfers_completed(),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_cancelled: self.transfers_cancelled.load(Ordering::Relaxed),
            resubmit_failures: self.resubmit_failures.load(Ordering::Relaxed),
            packets_ok: self.packets_ok.load(Ordering::Relaxed),
            packets_empty: self.packets_empty.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped(),
            bytes_forwarded: self.bytes_forwarded(),
            throughput_bps: self.throughput_bps(),
            loss_rate: self.loss_rate(),
            uptime: self.uptime(),
        }
    }
}

/// Snapshot of metrics for logging
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub transfers_cancelled: u64,
    pub resubmit_failures: u64,
    pub packets_ok: u64,
    pub packets_empty: u64,
    pub packets_dropped: u64,
    pub bytes_forwarded: u64,
    pub throughput_bps: f64,
    /// Loss rate (0.0 - 1.0)
    pub loss_rate: f64,
    pub uptime: Option<Duration>,
}

impl MetricsSnapshot {
    pub fn format_bytes_forwarded(&self) -> String {
        format_bytes(self.bytes_forwarded)
    }

    pub fn format_throughput(&self) -> String {
        format_bytes_per_second(self.throughput_bps)
    }

    /// Format loss rate as percentage
    pub fn format_loss_rate(&self) -> String {
        format!("{:.2}%", self.loss_rate * 100.0)
    }

    pub fn format_uptime(&self) -> String {
        match self.uptime {
            Some(d) => format_duration(d),
            None => "N/A".to_string(),
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bytes per second as human-readable string
pub fn format_bytes_per_second(bps: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;

    if bps >= MB {
        format!("{:.2} MB/s", bps / MB)
    } else if bps >= KB {
        format!("{:.2} KB/s", bps / KB)
    } else {
        format!("{:.0} B/s", bps)
    }
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
