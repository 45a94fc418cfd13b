//! Common utilities for m8-audio-capture
//!
//! Shared error type, logging setup and stream metrics used by the capture
//! crate and its binary.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{MetricsSnapshot, StreamMetrics};
