//! m8-audio-capture
//!
//! Streams raw PCM from the isochronous audio endpoint of an M8 tracker.
//! A fixed pool of transfers is kept in flight; every completion is
//! forwarded to a [`PacketSink`](sink::PacketSink) and resubmitted from the
//! event loop until a stop is requested or the stream faults, after which
//! the pool is drained and released.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod sink;
pub mod test_utils;
pub mod transport;
pub mod usb;

pub use config::CaptureConfig;
pub use error::{CaptureError, Result};
pub use pipeline::{CaptureSummary, LoopSettings, Pipeline, PipelineState, StopReason, StopSignal};
pub use pool::TransferPool;
pub use sink::{OutputTarget, PacketSink, StreamSink};
pub use transport::{IsoBackend, IsoTransfer, TransferError, TransferLayout, TransferStatus};
