//! Capture error types
//!
//! Everything here is a setup failure: the binary exits non-zero on any of
//! them. Faults that happen while streaming never surface as errors; they end
//! the stream through the drain sequence and are reported as a
//! [`StopReason`](crate::pipeline::StopReason).

use crate::transport::TransferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to initialise libusb: {0}")]
    Context(#[source] rusb::Error),

    #[error("no capture device found (tried {candidates})")]
    DeviceNotFound { candidates: String },

    #[error("failed to detach kernel driver from interface {interface}: {source}")]
    KernelDriver {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("failed to claim interface {interface}: {source}")]
    ClaimInterface {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("failed to select alternate setting {alt_setting} on interface {interface}: {source}")]
    AltSetting {
        interface: u8,
        alt_setting: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("failed to allocate transfer {slot}: {source}")]
    Allocation {
        slot: usize,
        #[source]
        source: TransferError,
    },

    #[error("failed to submit transfer {slot}: {source}")]
    Submit {
        slot: usize,
        #[source]
        source: TransferError,
    },

    #[error("transfer pool still has {outstanding} transfers in flight")]
    PoolBusy { outstanding: usize },

    #[error("output error: {0}")]
    Output(#[from] common::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
