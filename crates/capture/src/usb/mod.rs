//! USB subsystem
//!
//! Device session setup and the libusb isochronous backend.

pub mod libusb;
pub mod session;

pub use libusb::{LibusbBackend, LibusbTransfer};
pub use session::{DeviceListing, DeviceSession, list_candidates};
