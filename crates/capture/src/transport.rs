//! Isochronous transport abstraction
//!
//! The pool never talks to libusb directly. It drives transfers through the
//! [`IsoBackend`] / [`IsoTransfer`] pair, which the libusb backend implements
//! for real hardware and the scripted backend in `test_utils` implements for
//! tests.
//!
//! A transfer owns its buffer. Between `submit()` and the completion that
//! reports it back, the buffer belongs to the host controller and must not be
//! read, written or freed.

use rusb::ffi::constants::{
    LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_INVALID_PARAM, LIBUSB_ERROR_IO,
    LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NO_MEM, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_NOT_SUPPORTED, LIBUSB_ERROR_OTHER, LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE,
    LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED,
    LIBUSB_TRANSFER_NO_DEVICE, LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL,
    LIBUSB_TRANSFER_TIMED_OUT,
};
use std::os::raw::c_int;
use std::time::Duration;
use thiserror::Error;

/// Buffer geometry shared by every transfer in a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLayout {
    /// Isochronous endpoint address (IN endpoints have bit 7 set)
    pub endpoint: u8,
    /// Packets per transfer
    pub packets: usize,
    /// Bytes reserved for each packet
    pub packet_size: usize,
}

impl TransferLayout {
    /// Total buffer size of one transfer
    pub fn buffer_len(&self) -> usize {
        self.packets * self.packet_size
    }

    /// Offset of packet `index` inside the transfer buffer
    pub fn packet_offset(&self, index: usize) -> usize {
        index * self.packet_size
    }
}

/// Completion status of a transfer or of a single isochronous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Map a raw `libusb_transfer_status` value
    pub fn from_raw(status: c_int) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// One packet of a returned transfer
///
/// Only valid while the owning transfer is reclaimed; the payload borrows the
/// transfer buffer.
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket<'a> {
    pub status: TransferStatus,
    /// Bytes the device actually delivered
    pub actual_length: usize,
    /// Offset of the packet inside the transfer buffer
    pub offset: usize,
    /// `actual_length` bytes starting at `offset`
    pub payload: &'a [u8],
}

impl IsoPacket<'_> {
    /// Whether this packet carries audio that should reach the sink
    pub fn has_payload(&self) -> bool {
        self.status.is_ok() && self.actual_length > 0
    }
}

/// Errors returned when allocating, submitting or cancelling transfers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("device disconnected")]
    NoDevice,

    #[error("resource busy")]
    Busy,

    #[error("transfer not found (not in flight)")]
    NotFound,

    #[error("out of memory")]
    NoMemory,

    #[error("input/output error")]
    Io,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("operation not supported")]
    NotSupported,

    #[error("transport error code {0}")]
    Other(i32),
}

impl TransferError {
    /// Map a negative `libusb_error` return code
    pub fn from_code(code: c_int) -> Self {
        match code {
            LIBUSB_ERROR_IO => TransferError::Io,
            LIBUSB_ERROR_INVALID_PARAM => TransferError::InvalidParam,
            LIBUSB_ERROR_NO_DEVICE => TransferError::NoDevice,
            LIBUSB_ERROR_NOT_FOUND => TransferError::NotFound,
            LIBUSB_ERROR_BUSY => TransferError::Busy,
            LIBUSB_ERROR_NO_MEM => TransferError::NoMemory,
            LIBUSB_ERROR_NOT_SUPPORTED => TransferError::NotSupported,
            other => TransferError::Other(other),
        }
    }

    /// Whether the device is gone for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::NoDevice)
    }
}

impl From<rusb::Error> for TransferError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NoDevice => TransferError::NoDevice,
            rusb::Error::Busy => TransferError::Busy,
            rusb::Error::NotFound => TransferError::NotFound,
            rusb::Error::NoMem => TransferError::NoMemory,
            rusb::Error::Io => TransferError::Io,
            rusb::Error::InvalidParam => TransferError::InvalidParam,
            rusb::Error::NotSupported => TransferError::NotSupported,
            rusb::Error::Timeout => TransferError::Other(LIBUSB_ERROR_TIMEOUT),
            rusb::Error::Overflow => TransferError::Other(LIBUSB_ERROR_OVERFLOW),
            rusb::Error::Pipe => TransferError::Other(LIBUSB_ERROR_PIPE),
            rusb::Error::Interrupted => TransferError::Other(LIBUSB_ERROR_INTERRUPTED),
            _ => TransferError::Other(LIBUSB_ERROR_OTHER),
        }
    }
}

/// A single isochronous transfer bound to its buffer
pub trait IsoTransfer {
    /// Hand the transfer to the host controller
    fn submit(&mut self) -> Result<(), TransferError>;

    /// Request cancellation of an in-flight transfer
    ///
    /// Cancellation is asynchronous: the transfer is only finished once its
    /// completion has been dispatched.
    fn cancel(&mut self) -> Result<(), TransferError>;

    /// Take the buffer back after the backend reported this transfer complete
    ///
    /// Called exactly once per completion, before any packet is read.
    fn reclaim(&mut self) -> TransferStatus;

    fn packet_count(&self) -> usize;

    /// Packet `index` of the last reclaimed completion
    fn packet(&self, index: usize) -> IsoPacket<'_>;
}

/// Factory and event source for isochronous transfers
pub trait IsoBackend {
    type Transfer: IsoTransfer;

    /// Allocate one transfer and its buffer for pool slot `slot`
    fn alloc_transfer(
        &mut self,
        slot: usize,
        layout: TransferLayout,
    ) -> Result<Self::Transfer, TransferError>;

    /// Block until at least one transfer completes or `timeout` elapses
    ///
    /// Slots of completed transfers are appended to `completed` in the order
    /// the host controller returned them.
    fn wait(&mut self, timeout: Duration, completed: &mut Vec<usize>) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_geometry() {
        let layout = TransferLayout {
            endpoint: 0x85,
            packets: 2,
            packet_size: 180,
        };
        assert_eq!(layout.buffer_len(), 360);
        assert_eq!(layout.packet_offset(0), 0);
        assert_eq!(layout.packet_offset(1), 180);
    }

    #[test]
    fn test_status_from_raw() {
        assert_eq!(TransferStatus::from_raw(0), TransferStatus::Completed);
        assert_eq!(TransferStatus::from_raw(1), TransferStatus::Error);
        assert_eq!(TransferStatus::from_raw(3), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from_raw(5), TransferStatus::NoDevice);
        assert_eq!(TransferStatus::from_raw(42), TransferStatus::Error);
    }

    #[test]
    fn test_error_from_code() {
        assert_eq!(TransferError::from_code(-4), TransferError::NoDevice);
        assert_eq!(TransferError::from_code(-5), TransferError::NotFound);
        assert_eq!(TransferError::from_code(-99), TransferError::Other(-99));
        assert!(TransferError::from_code(-4).is_fatal());
        assert!(!TransferError::from_code(-1).is_fatal());
    }

    #[test]
    fn test_libusb_constants_map_to_variants() {
        use rusb::ffi::constants::LIBUSB_TRANSFER_ERROR;

        let statuses = [
            (LIBUSB_TRANSFER_COMPLETED, TransferStatus::Completed),
            (LIBUSB_TRANSFER_ERROR, TransferStatus::Error),
            (LIBUSB_TRANSFER_TIMED_OUT, TransferStatus::TimedOut),
            (LIBUSB_TRANSFER_CANCELLED, TransferStatus::Cancelled),
            (LIBUSB_TRANSFER_STALL, TransferStatus::Stall),
            (LIBUSB_TRANSFER_NO_DEVICE, TransferStatus::NoDevice),
            (LIBUSB_TRANSFER_OVERFLOW, TransferStatus::Overflow),
        ];
        for (raw, status) in statuses {
            assert_eq!(TransferStatus::from_raw(raw), status);
        }

        let errors = [
            (LIBUSB_ERROR_IO, TransferError::Io),
            (LIBUSB_ERROR_INVALID_PARAM, TransferError::InvalidParam),
            (LIBUSB_ERROR_NO_DEVICE, TransferError::NoDevice),
            (LIBUSB_ERROR_NOT_FOUND, TransferError::NotFound),
            (LIBUSB_ERROR_BUSY, TransferError::Busy),
            (LIBUSB_ERROR_NO_MEM, TransferError::NoMemory),
            (LIBUSB_ERROR_NOT_SUPPORTED, TransferError::NotSupported),
        ];
        for (code, error) in errors {
            assert_eq!(TransferError::from_code(code), error);
        }
        assert_eq!(
            TransferError::from(rusb::Error::Timeout),
            TransferError::Other(LIBUSB_ERROR_TIMEOUT)
        );
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(TransferError::from(rusb::Error::NoDevice), TransferError::NoDevice);
        assert_eq!(TransferError::from(rusb::Error::Busy), TransferError::Busy);
        assert_eq!(TransferError::from(rusb::Error::Io), TransferError::Io);
    }

    #[test]
    fn test_packet_payload_rule() {
        let data = [1u8, 2, 3];
        let ok = IsoPacket {
            status: TransferStatus::Completed,
            actual_length: 3,
            offset: 0,
            payload: &data,
        };
        let empty = IsoPacket {
            actual_length: 0,
            payload: &data[..0],
            ..ok
        };
        let failed = IsoPacket {
            status: TransferStatus::Error,
            ..ok
        };
        assert!(ok.has_payload());
        assert!(!empty.has_payload());
        assert!(!failed.has_payload());
    }
}
