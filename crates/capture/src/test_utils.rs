//! Test utilities for the capture pipeline
//!
//! [`MockBackend`] is an in-memory isochronous transport. It behaves like a
//! host controller that returns transfers in submission order, fills their
//! buffers from a script and confirms cancellations. Every transfer it hands
//! out reports back when it is dropped, so tests can check that no buffer is
//! freed while still in flight and none is freed twice.
//!
//! # Example
//!
//! ```
//! use capture::test_utils::{MockBackend, ScriptedTransfer};
//! use capture::transport::TransferStatus;
//!
//! let mut backend = MockBackend::new();
//! backend.bus_mut().script([ScriptedTransfer::packets(vec![
//!     (TransferStatus::Completed, vec![1, 2]),
//!     (TransferStatus::Error, vec![]),
//! ])]);
//! assert_eq!(backend.bus().allocated(), 0);
//! ```

use crate::pipeline::StopSignal;
use crate::transport::{
    IsoBackend, IsoPacket, IsoTransfer, TransferError, TransferLayout, TransferStatus,
};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// What the device returns for one completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedTransfer {
    pub status: TransferStatus,
    pub packets: Vec<(TransferStatus, Vec<u8>)>,
}

impl ScriptedTransfer {
    /// A completed transfer with the given per-packet results
    pub fn packets(packets: Vec<(TransferStatus, Vec<u8>)>) -> Self {
        Self {
            status: TransferStatus::Completed,
            packets,
        }
    }

    /// A transfer that failed as a whole
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status,
            packets: Vec::new(),
        }
    }
}

/// Shared state of the simulated host controller
#[derive(Debug, Default)]
pub struct MockBus {
    /// Submitted transfers in the order the "controller" will return them
    queue: VecDeque<usize>,
    cancelled: HashSet<usize>,
    cancel_requests: usize,
    /// Results waiting to be reclaimed, by slot
    landed: HashMap<usize, ScriptedTransfer>,
    script: VecDeque<ScriptedTransfer>,
    buffer_lens: Vec<usize>,
    submissions: HashMap<usize, usize>,
    submission_failures: HashMap<(usize, usize), TransferError>,
    allocation_failure: Option<usize>,
    released: Vec<usize>,
    violations: Vec<String>,
    completions_per_wait: Option<usize>,
    ignore_cancel: bool,
    wait_calls: usize,
    wait_failures: HashMap<usize, TransferError>,
    stop_after: Option<(usize, StopSignal)>,
}

impl MockBus {
    /// Queue results for upcoming completions, consumed in completion order
    ///
    /// Once the script runs out every packet comes back full.
    pub fn script(&mut self, transfers: impl IntoIterator<Item = ScriptedTransfer>) {
        self.script.extend(transfers);
    }

    /// Fail the allocation of `slot`
    pub fn fail_allocation_at(&mut self, slot: usize) {
        self.allocation_failure = Some(slot);
    }

    /// Fail the `nth` (1-based) submission of `slot`
    pub fn fail_submission(&mut self, slot: usize, nth: usize, error: TransferError) {
        self.submission_failures.insert((slot, nth), error);
    }

    /// Fail the `nth` (1-based) call to `wait`
    pub fn fail_wait(&mut self, nth: usize, error: TransferError) {
        self.wait_failures.insert(nth, error);
    }

    /// Limit how many transfers complete per `wait` call
    pub fn set_completions_per_wait(&mut self, limit: usize) {
        self.completions_per_wait = Some(limit);
    }

    /// Never confirm cancellations, like a wedged device
    pub fn set_ignore_cancel(&mut self, ignore: bool) {
        self.ignore_cancel = ignore;
    }

    /// Raise `signal` at the start of the `nth` (1-based) call to `wait`
    pub fn raise_stop_after_waits(&mut self, nth: usize, signal: StopSignal) {
        self.stop_after = Some((nth, signal));
    }

    pub fn allocated(&self) -> usize {
        self.buffer_lens.len()
    }

    pub fn buffer_lens(&self) -> &[usize] {
        &self.buffer_lens
    }

    /// Transfers currently owned by the controller
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn submissions(&self, slot: usize) -> usize {
        self.submissions.get(&slot).copied().unwrap_or(0)
    }

    pub fn total_submissions(&self) -> usize {
        self.submissions.values().sum()
    }

    /// Cancellations accepted for in-flight transfers
    pub fn cancel_requests(&self) -> usize {
        self.cancel_requests
    }

    /// Slots whose transfer was dropped, in drop order
    pub fn released(&self) -> Vec<usize> {
        self.released.clone()
    }

    /// Ownership rule violations observed so far
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn wait_calls(&self) -> usize {
        self.wait_calls
    }

    fn submit(&mut self, slot: usize) -> Result<(), TransferError> {
        let count = self.submissions.entry(slot).or_insert(0);
        *count += 1;
        if let Some(error) = self.submission_failures.remove(&(slot, *count)) {
            return Err(error);
        }
        if self.queue.contains(&slot) {
            self.violations
                .push(format!("transfer {} submitted while in flight", slot));
        }
        self.queue.push_back(slot);
        Ok(())
    }

    fn cancel(&mut self, slot: usize) -> Result<(), TransferError> {
        if !self.queue.contains(&slot) {
            return Err(TransferError::NotFound);
        }
        if self.cancelled.insert(slot) {
            self.cancel_requests += 1;
        }
        Ok(())
    }

    fn complete_next(&mut self, completed: &mut Vec<usize>) {
        let limit = self.completions_per_wait.unwrap_or(self.queue.len());
        let mut pending = std::mem::take(&mut self.queue);
        let mut returned = 0;
        while returned < limit {
            let Some(slot) = pending.pop_front() else {
                break;
            };
            if self.cancelled.contains(&slot) {
                if self.ignore_cancel {
                    self.queue.push_back(slot);
                    continue;
                }
                self.landed
                    .insert(slot, ScriptedTransfer::status(TransferStatus::Cancelled));
            } else {
                let result = self
                    .script
                    .pop_front()
                    .unwrap_or_else(|| ScriptedTransfer::status(TransferStatus::Completed));
                self.landed.insert(slot, result);
            }
            completed.push(slot);
            returned += 1;
        }
        self.queue.extend(pending);
    }

    fn reclaim(&mut self, slot: usize) -> ScriptedTransfer {
        self.cancelled.remove(&slot);
        self.landed.remove(&slot).unwrap_or_else(|| {
            self.violations
                .push(format!("transfer {} reclaimed without completion", slot));
            ScriptedTransfer::status(TransferStatus::Error)
        })
    }

    fn release(&mut self, slot: usize) {
        if self.queue.contains(&slot) {
            self.violations
                .push(format!("transfer {} freed while in flight", slot));
        }
        if self.released.contains(&slot) {
            self.violations
                .push(format!("transfer {} freed twice", slot));
        }
        self.released.push(slot);
    }
}

/// Simulated isochronous backend
#[derive(Debug, Default)]
pub struct MockBackend {
    bus: Rc<RefCell<MockBus>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> Ref<'_, MockBus> {
        self.bus.borrow()
    }

    pub fn bus_mut(&self) -> RefMut<'_, MockBus> {
        self.bus.borrow_mut()
    }

    /// Handle on the bus that outlives a pipeline owning this backend
    pub fn shared_bus(&self) -> Rc<RefCell<MockBus>> {
        Rc::clone(&self.bus)
    }
}

impl IsoBackend for MockBackend {
    type Transfer = MockTransfer;

    fn alloc_transfer(
        &mut self,
        slot: usize,
        layout: TransferLayout,
    ) -> Result<MockTransfer, TransferError> {
        let mut bus = self.bus.borrow_mut();
        if bus.allocation_failure == Some(slot) {
            return Err(TransferError::NoMemory);
        }
        bus.buffer_lens.push(layout.buffer_len());

        Ok(MockTransfer {
            slot,
            layout,
            buffer: vec![0; layout.buffer_len()],
            packets: Vec::new(),
            bus: Rc::clone(&self.bus),
        })
    }

    fn wait(&mut self, _timeout: Duration, completed: &mut Vec<usize>) -> Result<(), TransferError> {
        let mut bus = self.bus.borrow_mut();
        bus.wait_calls += 1;
        let call = bus.wait_calls;

        if let Some((nth, signal)) = &bus.stop_after {
            if call >= *nth {
                signal.raise();
            }
        }
        if let Some(error) = bus.wait_failures.remove(&call) {
            return Err(error);
        }

        bus.complete_next(completed);
        Ok(())
    }
}

/// Simulated transfer with its own buffer
#[derive(Debug)]
pub struct MockTransfer {
    slot: usize,
    layout: TransferLayout,
    buffer: Vec<u8>,
    /// (status, actual length) of each packet from the last completion
    packets: Vec<(TransferStatus, usize)>,
    bus: Rc<RefCell<MockBus>>,
}

impl MockTransfer {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl IsoTransfer for MockTransfer {
    fn submit(&mut self) -> Result<(), TransferError> {
        self.bus.borrow_mut().submit(self.slot)
    }

    fn cancel(&mut self) -> Result<(), TransferError> {
        self.bus.borrow_mut().cancel(self.slot)
    }

    fn reclaim(&mut self) -> TransferStatus {
        let result = self.bus.borrow_mut().reclaim(self.slot);
        let packet_size = self.layout.packet_size;

        self.buffer.fill(0);
        self.packets.clear();
        for index in 0..self.layout.packets {
            let offset = self.layout.packet_offset(index);
            let packet = match result.packets.get(index) {
                Some((status, data)) => {
                    let len = data.len().min(packet_size);
                    self.buffer[offset..offset + len].copy_from_slice(&data[..len]);
                    (*status, len)
                }
                None if result.packets.is_empty() && result.status.is_ok() => {
                    // Unscripted completion: a full packet tagged with its slot
                    self.buffer[offset..offset + packet_size].fill(self.slot as u8);
                    (TransferStatus::Completed, packet_size)
                }
                None => (result.status, 0),
            };
            self.packets.push(packet);
        }
        result.status
    }

    fn packet_count(&self) -> usize {
        self.packets.len()
    }

    fn packet(&self, index: usize) -> IsoPacket<'_> {
        let (status, actual_length) = self.packets[index];
        let offset = self.layout.packet_offset(index);
        IsoPacket {
            status,
            actual_length,
            offset,
            payload: &self.buffer[offset..offset + actual_length],
        }
    }
}

impl Drop for MockTransfer {
    fn drop(&mut self) {
        if let Ok(mut bus) = self.bus.try_borrow_mut() {
            bus.release(self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> TransferLayout {
        TransferLayout {
            endpoint: 0x85,
            packets: 2,
            packet_size: 4,
        }
    }

    #[test]
    fn test_completes_in_submission_order() {
        let mut backend = MockBackend::new();
        let mut a = backend.alloc_transfer(0, layout()).unwrap();
        let mut b = backend.alloc_transfer(1, layout()).unwrap();
        b.submit().unwrap();
        a.submit().unwrap();

        let mut completed = Vec::new();
        backend.wait(Duration::ZERO, &mut completed).unwrap();
        assert_eq!(completed, vec![1, 0]);
    }

    #[test]
    fn test_unscripted_completion_fills_packets() {
        let mut backend = MockBackend::new();
        let mut transfer = backend.alloc_transfer(3, layout()).unwrap();
        transfer.submit().unwrap();

        let mut completed = Vec::new();
        backend.wait(Duration::ZERO, &mut completed).unwrap();
        assert_eq!(transfer.reclaim(), TransferStatus::Completed);
        assert_eq!(transfer.packet_count(), 2);
        assert_eq!(transfer.packet(1).payload, &[3, 3, 3, 3]);
        assert_eq!(transfer.packet(1).offset, 4);
    }

    #[test]
    fn test_cancel_requires_in_flight() {
        let mut backend = MockBackend::new();
        let mut transfer = backend.alloc_transfer(0, layout()).unwrap();
        assert_eq!(transfer.cancel(), Err(TransferError::NotFound));

        transfer.submit().unwrap();
        assert_eq!(transfer.cancel(), Ok(()));

        let mut completed = Vec::new();
        backend.wait(Duration::ZERO, &mut completed).unwrap();
        assert_eq!(transfer.reclaim(), TransferStatus::Cancelled);
    }

    #[test]
    fn test_drop_while_in_flight_is_flagged() {
        let mut backend = MockBackend::new();
        let mut transfer = backend.alloc_transfer(0, layout()).unwrap();
        transfer.submit().unwrap();
        drop(transfer);

        assert_eq!(backend.bus().violations().len(), 1);
    }

    #[test]
    fn test_oversized_scripted_payload_is_truncated() {
        let mut backend = MockBackend::new();
        backend.bus_mut().script([ScriptedTransfer::packets(vec![(
            TransferStatus::Completed,
            vec![1, 2, 3, 4, 5, 6],
        )])]);
        let mut transfer = backend.alloc_transfer(0, layout()).unwrap();
        transfer.submit().unwrap();

        let mut completed = Vec::new();
        backend.wait(Duration::ZERO, &mut completed).unwrap();
        transfer.reclaim();
        assert_eq!(transfer.packet(0).payload, &[1, 2, 3, 4]);
        assert_eq!(transfer.packet(1).actual_length, 0);
    }
}
