//! libusb isochronous backend
//!
//! rusb has no safe wrapper for asynchronous transfers, so transfers are
//! driven through `rusb::ffi`. The transfer callback does nothing but record
//! the completed slot; dispatch happens later from the event loop, after
//! `handle_events` has returned.
//!
//! Ownership rules:
//! - the buffer and the `libusb_transfer` are allocated together and freed
//!   together in [`LibusbTransfer`]'s `Drop`
//! - libusb owns the buffer from a successful submit until the callback for
//!   that submission has run
//! - the pool never drops a transfer libusb still owns

use super::session::DeviceSession;
use crate::transport::{
    IsoBackend, IsoPacket, IsoTransfer, TransferError, TransferLayout, TransferStatus,
};
use rusb::UsbContext;
use rusb::ffi;
use rusb::ffi::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Timeout of 0 means no timeout; isochronous packets are paced by the bus
const NO_TIMEOUT: c_uint = 0;

type CompletionQueue = Rc<RefCell<VecDeque<usize>>>;

/// Data reachable from a transfer's `user_data`
struct CallbackContext {
    slot: usize,
    completions: CompletionQueue,
}

/// Transfer callback, runs on the thread calling `handle_events`
extern "system" fn transfer_complete(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data points at the CallbackContext boxed by the owning
    // LibusbTransfer, which outlives every submission of this transfer.
    let context = unsafe { &*((*transfer).user_data as *const CallbackContext) };
    record_completion(&context.completions, context.slot);
}

/// Queue `slot` for dispatch; returns false if the completion was lost
fn record_completion(completions: &CompletionQueue, slot: usize) -> bool {
    match completions.try_borrow_mut() {
        Ok(mut queue) => {
            queue.push_back(slot);
            true
        }
        Err(_) => {
            // The slot stays outstanding until the drain deadline abandons it
            error!("Completion queue busy, lost completion of transfer {}", slot);
            false
        }
    }
}

/// Isochronous backend bound to an open device session
pub struct LibusbBackend<'a> {
    session: &'a DeviceSession,
    completions: CompletionQueue,
}

impl<'a> LibusbBackend<'a> {
    pub fn new(session: &'a DeviceSession) -> Self {
        Self {
            session,
            completions: Rc::new(RefCell::new(VecDeque::new())),
        }
    }
}

impl<'a> IsoBackend for LibusbBackend<'a> {
    type Transfer = LibusbTransfer<'a>;

    fn alloc_transfer(
        &mut self,
        slot: usize,
        layout: TransferLayout,
    ) -> Result<LibusbTransfer<'a>, TransferError> {
        LibusbTransfer::new(self.session, slot, layout, Rc::clone(&self.completions))
    }

    fn wait(&mut self, timeout: Duration, completed: &mut Vec<usize>) -> Result<(), TransferError> {
        let has_pending = !self.completions.borrow().is_empty();
        if !has_pending {
            match self.session.context().handle_events(Some(timeout)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => return Err(e.into()),
            }
        }

        completed.extend(self.completions.borrow_mut().drain(..));
        Ok(())
    }
}

/// One libusb isochronous transfer and the buffer it reads into
pub struct LibusbTransfer<'a> {
    raw: NonNull<ffi::libusb_transfer>,
    buffer: NonNull<u8>,
    layout: TransferLayout,
    callback: Box<CallbackContext>,
    _session: &'a DeviceSession,
}

impl<'a> LibusbTransfer<'a> {
    fn new(
        session: &'a DeviceSession,
        slot: usize,
        layout: TransferLayout,
        completions: CompletionQueue,
    ) -> Result<Self, TransferError> {
        let packets = c_int::try_from(layout.packets).map_err(|_| TransferError::InvalidParam)?;
        let length =
            c_int::try_from(layout.buffer_len()).map_err(|_| TransferError::InvalidParam)?;
        let packet_length =
            c_uint::try_from(layout.packet_size).map_err(|_| TransferError::InvalidParam)?;

        // SAFETY: plain allocation call; a null result is handled below.
        let raw = NonNull::new(unsafe { ffi::libusb_alloc_transfer(packets) })
            .ok_or(TransferError::NoMemory)?;

        let buffer = vec![0u8; layout.buffer_len()].into_boxed_slice();
        // Leaked here, reclaimed in Drop from the same pointer and length.
        let buffer = NonNull::new(Box::into_raw(buffer) as *mut u8).ok_or(TransferError::NoMemory)?;

        let callback = Box::new(CallbackContext { slot, completions });
        let user_data = &*callback as *const CallbackContext as *mut c_void;

        // SAFETY: `raw` was just allocated with room for `packets` packet
        // descriptors and is not shared with libusb until submit.
        unsafe {
            let transfer = raw.as_ptr();
            (*transfer).dev_handle = session.handle().as_raw();
            (*transfer).flags = 0;
            (*transfer).endpoint = layout.endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
            (*transfer).timeout = NO_TIMEOUT;
            (*transfer).buffer = buffer.as_ptr();
            (*transfer).length = length;
            (*transfer).num_iso_packets = packets;
            (*transfer).callback = transfer_complete;
            (*transfer).user_data = user_data;

            let descriptors = packet_descriptors(transfer);
            for index in 0..layout.packets {
                (*descriptors.add(index)).length = packet_length;
            }
        }

        trace!("Allocated libusb transfer for slot {}", slot);
        Ok(Self {
            raw,
            buffer,
            layout,
            callback,
            _session: session,
        })
    }

    fn buffer(&self) -> &[u8] {
        // SAFETY: only called while libusb does not own the buffer (after
        // reclaim), and the allocation is `buffer_len()` bytes.
        unsafe { std::slice::from_raw_parts(self.buffer.as_ptr(), self.layout.buffer_len()) }
    }
}

/// Pointer to the flexible packet descriptor array that follows the transfer
unsafe fn packet_descriptors(
    transfer: *mut ffi::libusb_transfer,
) -> *mut ffi::libusb_iso_packet_descriptor {
    // SAFETY: caller passes a transfer allocated by libusb_alloc_transfer.
    unsafe { ptr::addr_of_mut!((*transfer).iso_packet_desc) as *mut ffi::libusb_iso_packet_descriptor }
}

impl IsoTransfer for LibusbTransfer<'_> {
    fn submit(&mut self) -> Result<(), TransferError> {
        // SAFETY: the transfer is fully initialised and not in flight; the
        // pool tracks ownership so a transfer is never submitted twice.
        let rc = unsafe { ffi::libusb_submit_transfer(self.raw.as_ptr()) };
        if rc < 0 {
            Err(TransferError::from_code(rc))
        } else {
            Ok(())
        }
    }

    fn cancel(&mut self) -> Result<(), TransferError> {
        // SAFETY: cancelling a transfer that is not in flight is reported as
        // LIBUSB_ERROR_NOT_FOUND and has no other effect.
        let rc = unsafe { ffi::libusb_cancel_transfer(self.raw.as_ptr()) };
        if rc < 0 {
            Err(TransferError::from_code(rc))
        } else {
            Ok(())
        }
    }

    fn reclaim(&mut self) -> TransferStatus {
        // SAFETY: the callback for this submission has run, so libusb no
        // longer touches the transfer.
        TransferStatus::from_raw(unsafe { (*self.raw.as_ptr()).status })
    }

    fn packet_count(&self) -> usize {
        self.layout.packets
    }

    fn packet(&self, index: usize) -> IsoPacket<'_> {
        assert!(index < self.layout.packets, "packet index out of range");

        // SAFETY: index is within the descriptor array allocated for this
        // transfer and libusb is done with it.
        let descriptor = unsafe { &*packet_descriptors(self.raw.as_ptr()).add(index) };

        // Packets are laid out back to back at their requested lengths
        let offset = self.layout.packet_offset(index);
        let actual_length = (descriptor.actual_length as usize).min(self.layout.packet_size);
        IsoPacket {
            status: TransferStatus::from_raw(descriptor.status),
            actual_length,
            offset,
            payload: &self.buffer()[offset..offset + actual_length],
        }
    }
}

impl Drop for LibusbTransfer<'_> {
    fn drop(&mut self) {
        // SAFETY: the pool only drops transfers libusb does not own (idle or
        // finalized); in-flight ones are leaked instead. The buffer pointer
        // and length are the ones produced by Box::into_raw in `new`.
        unsafe {
            ffi::libusb_free_transfer(self.raw.as_ptr());
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.buffer.as_ptr(),
                self.layout.buffer_len(),
            )));
        }
        trace!("Freed libusb transfer for slot {}", self.callback.slot);
    }
}
