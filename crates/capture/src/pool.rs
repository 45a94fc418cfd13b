//! Transfer pool
//!
//! Owns a fixed set of isochronous transfers, each bound to its own buffer.
//! Every descriptor is in exactly one state at a time:
//!
//! ```text
//!   Idle ──submit──► InFlight ──completion──► (resubmit) InFlight
//!                       │                          │
//!                     cancel                  no resubmit
//!                       ▼                          ▼
//!                   Cancelling ──completion──► Finalized
//! ```
//!
//! A transfer is only dropped (buffer freed) from `Idle` or `Finalized`.
//! Anything still owned by the host controller when the pool goes away is
//! leaked on purpose.

use crate::sink::PacketSink;
use crate::transport::{IsoBackend, IsoTransfer, TransferError, TransferLayout, TransferStatus};
use common::StreamMetrics;
use std::io;
use tracing::{debug, error, trace, warn};

/// Lifecycle state of one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// Allocated, owned by the pool, never submitted
    Idle,
    /// Owned by the host controller
    InFlight,
    /// Cancel requested, completion not yet seen
    Cancelling,
    /// Terminal; the buffer may be released
    Finalized,
}

impl DescriptorState {
    /// Whether the host controller may still touch the buffer
    pub fn is_outstanding(self) -> bool {
        matches!(self, DescriptorState::InFlight | DescriptorState::Cancelling)
    }
}

/// How a completion should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Forward payloads and resubmit
    Stream,
    /// Ignore payloads and finalize
    Drain,
}

/// Result of dispatching one completion
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Payload forwarded and the transfer is back in flight
    Resubmitted { bytes: usize },
    /// Transfer reached its terminal state
    Finalized { status: TransferStatus },
    /// Payload forwarded, but the transport refused the resubmission
    ResubmitFailed { error: TransferError },
    /// The sink refused a payload; the transfer is finalized
    SinkFailed { error: io::Error },
    /// The device went away; the transfer is finalized
    DeviceLost,
    /// Completion for a slot that is not outstanding
    Spurious,
}

/// Failed initial fill
#[derive(Debug)]
pub struct SubmitError {
    pub slot: usize,
    pub source: TransferError,
    /// Transfers that were already submitted and have been asked to cancel
    pub cancelled: usize,
}

/// One transfer and its lifecycle state
struct Descriptor<T> {
    transfer: T,
    state: DescriptorState,
}

/// Fixed-size pool of isochronous transfers
pub struct TransferPool<T: IsoTransfer> {
    descriptors: Vec<Descriptor<T>>,
    layout: TransferLayout,
}

impl<T: IsoTransfer> TransferPool<T> {
    /// Allocate `count` transfers from `backend`
    ///
    /// On failure every transfer allocated so far is released before the
    /// error is returned.
    pub fn allocate<B>(
        backend: &mut B,
        count: usize,
        layout: TransferLayout,
    ) -> Result<Self, (usize, TransferError)>
    where
        B: IsoBackend<Transfer = T>,
    {
        if layout.packets.checked_mul(layout.packet_size).is_none() {
            warn!(
                "Transfer layout of {} x {} bytes does not fit in memory",
                layout.packets, layout.packet_size
            );
            return Err((0, TransferError::InvalidParam));
        }

        let mut descriptors = Vec::new();
        if let Err(e) = descriptors.try_reserve_exact(count) {
            warn!("Cannot reserve a pool of {} transfers: {}", count, e);
            return Err((0, TransferError::NoMemory));
        }
        for slot in 0..count {
            match backend.alloc_transfer(slot, layout) {
                Ok(transfer) => descriptors.push(Descriptor {
                    transfer,
                    state: DescriptorState::Idle,
                }),
                Err(e) => {
                    warn!(
                        "Allocation of transfer {} failed ({}), releasing {} allocated transfers",
                        slot,
                        e,
                        descriptors.len()
                    );
                    return Err((slot, e));
                }
            }
        }

        debug!(
            "Allocated {} transfers of {} x {} bytes on endpoint {:#x}",
            count, layout.packets, layout.packet_size, layout.endpoint
        );
        Ok(Self {
            descriptors,
            layout,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn layout(&self) -> TransferLayout {
        self.layout
    }

    pub fn state(&self, slot: usize) -> Option<DescriptorState> {
        self.descriptors.get(slot).map(|d| d.state)
    }

    /// Transfers the host controller still owns
    pub fn outstanding(&self) -> usize {
        self.count(DescriptorState::is_outstanding)
    }

    pub fn in_flight(&self) -> usize {
        self.count(|s| s == DescriptorState::InFlight)
    }

    pub fn finalized(&self) -> usize {
        self.count(|s| s == DescriptorState::Finalized)
    }

    fn count(&self, predicate: impl Fn(DescriptorState) -> bool) -> usize {
        self.descriptors.iter().filter(|d| predicate(d.state)).count()
    }

    /// Submit every idle transfer
    ///
    /// If one submission fails, the ones already in flight are cancelled and
    /// the remaining idle transfers are finalized; the caller must keep
    /// pumping completions until [`outstanding`](Self::outstanding) is zero.
    pub fn submit_all(&mut self) -> Result<(), SubmitError> {
        for slot in 0..self.descriptors.len() {
            let descriptor = &mut self.descriptors[slot];
            if descriptor.state != DescriptorState::Idle {
                continue;
            }

            match descriptor.transfer.submit() {
                Ok(()) => {
                    descriptor.state = DescriptorState::InFlight;
                    trace!("Submitted transfer {}", slot);
                }
                Err(source) => {
                    error!("Failed to submit transfer {}: {}", slot, source);
                    descriptor.state = DescriptorState::Finalized;
                    let cancelled = self.cancel_outstanding();
                    self.finalize_idle();
                    return Err(SubmitError {
                        slot,
                        source,
                        cancelled,
                    });
                }
            }
        }

        debug!("Submitted {} transfers", self.descriptors.len());
        Ok(())
    }

    /// Request cancellation of every in-flight transfer
    ///
    /// Returns how many cancellations were requested. A transfer that the
    /// transport no longer knows about is still waiting on its completion, so
    /// it is marked `Cancelling` either way.
    pub fn cancel_outstanding(&mut self) -> usize {
        let mut requested = 0;
        for (slot, descriptor) in self.descriptors.iter_mut().enumerate() {
            if descriptor.state != DescriptorState::InFlight {
                continue;
            }
            match descriptor.transfer.cancel() {
                Ok(()) => trace!("Cancel requested for transfer {}", slot),
                Err(TransferError::NotFound) => {
                    trace!("Transfer {} already completing", slot);
                }
                Err(e) => warn!("Failed to cancel transfer {}: {}", slot, e),
            }
            descriptor.state = DescriptorState::Cancelling;
            requested += 1;
        }
        requested
    }

    /// Mark never-submitted transfers as finished
    pub fn finalize_idle(&mut self) {
        for descriptor in &mut self.descriptors {
            if descriptor.state == DescriptorState::Idle {
                descriptor.state = DescriptorState::Finalized;
            }
        }
    }

    /// Handle one completion reported by the backend
    ///
    /// In [`DispatchMode::Stream`] every OK packet with a payload is written
    /// to `sink` in buffer order and the transfer is resubmitted. In
    /// [`DispatchMode::Drain`], or for a transfer being cancelled, the
    /// payload is ignored and the transfer is finalized.
    pub fn on_completion<S: PacketSink + ?Sized>(
        &mut self,
        slot: usize,
        mode: DispatchMode,
        sink: &mut S,
        metrics: &StreamMetrics,
    ) -> CompletionOutcome {
        let Some(descriptor) = self.descriptors.get_mut(slot) else {
            warn!("Completion for unknown transfer slot {}", slot);
            return CompletionOutcome::Spurious;
        };

        if !descriptor.state.is_outstanding() {
            warn!(
                "Completion for transfer {} in state {:?}, ignoring",
                slot, descriptor.state
            );
            return CompletionOutcome::Spurious;
        }

        let status = descriptor.transfer.reclaim();

        if descriptor.state == DescriptorState::Cancelling || mode == DispatchMode::Drain {
            descriptor.state = DescriptorState::Finalized;
            if status == TransferStatus::Cancelled {
                metrics.transfer_cancelled();
            }
            trace!("Transfer {} finalized ({:?})", slot, status);
            return CompletionOutcome::Finalized { status };
        }

        let bytes = match status {
            TransferStatus::Completed => {
                match forward_packets(&descriptor.transfer, sink, metrics) {
                    Ok(bytes) => {
                        metrics.transfer_completed(bytes as u64);
                        bytes
                    }
                    Err(error) => {
                        descriptor.state = DescriptorState::Finalized;
                        return CompletionOutcome::SinkFailed { error };
                    }
                }
            }
            TransferStatus::NoDevice => {
                metrics.transfer_failed();
                descriptor.state = DescriptorState::Finalized;
                return CompletionOutcome::DeviceLost;
            }
            other => {
                // The whole batch is lost; keep the slot in rotation.
                debug!("Transfer {} returned {:?}, skipping payload", slot, other);
                metrics.transfer_failed();
                0
            }
        };

        match descriptor.transfer.submit() {
            Ok(()) => {
                descriptor.state = DescriptorState::InFlight;
                CompletionOutcome::Resubmitted { bytes }
            }
            Err(error) => {
                metrics.resubmit_failed();
                descriptor.state = DescriptorState::Finalized;
                CompletionOutcome::ResubmitFailed { error }
            }
        }
    }

    /// Release every transfer and buffer
    ///
    /// Fails without releasing anything if the host controller still owns a
    /// transfer.
    pub fn release(mut self) -> Result<usize, (Self, usize)> {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            return Err((self, outstanding));
        }
        let released = self.descriptors.len();
        self.descriptors.clear();
        debug!("Released {} transfers", released);
        Ok(released)
    }

    /// Give up on transfers that never reported back
    ///
    /// Outstanding transfers are leaked rather than freed: their buffers may
    /// still be written by the host controller. Returns the number leaked.
    pub fn abandon_outstanding(&mut self) -> usize {
        let (outstanding, settled): (Vec<_>, Vec<_>) = std::mem::take(&mut self.descriptors)
            .into_iter()
            .partition(|d| d.state.is_outstanding());
        let leaked = outstanding.len();
        for descriptor in outstanding {
            std::mem::forget(descriptor);
        }
        self.descriptors = settled;
        if leaked > 0 {
            error!("Abandoned {} transfers still owned by the host controller", leaked);
        }
        leaked
    }
}

impl<T: IsoTransfer> Drop for TransferPool<T> {
    fn drop(&mut self) {
        self.abandon_outstanding();
    }
}

/// Write every OK packet payload of a reclaimed transfer to the sink
fn forward_packets<T, S>(transfer: &T, sink: &mut S, metrics: &StreamMetrics) -> io::Result<usize>
where
    T: IsoTransfer,
    S: PacketSink + ?Sized,
{
    let mut bytes = 0;
    for index in 0..transfer.packet_count() {
        let packet = transfer.packet(index);
        if packet.has_payload() {
            sink.write_payload(packet.payload)?;
            bytes += packet.payload.len();
            metrics.packet_ok();
        } else if packet.status.is_ok() {
            metrics.packet_empty();
        } else {
            trace!("Packet {} dropped ({:?})", index, packet.status);
            metrics.packet_dropped();
        }
    }
    if bytes > 0 {
        sink.flush()?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, ScriptedTransfer};
    use std::time::Duration;

    fn layout() -> TransferLayout {
        TransferLayout {
            endpoint: 0x85,
            packets: 2,
            packet_size: 4,
        }
    }

    fn pump(
        backend: &mut MockBackend,
        pool: &mut TransferPool<crate::test_utils::MockTransfer>,
        mode: DispatchMode,
        sink: &mut Vec<u8>,
        metrics: &StreamMetrics,
    ) -> Vec<CompletionOutcome> {
        let mut completed = Vec::new();
        backend.wait(Duration::from_millis(1), &mut completed).unwrap();
        completed
            .into_iter()
            .map(|slot| pool.on_completion(slot, mode, sink, metrics))
            .collect()
    }

    #[test]
    fn test_allocate_sizes_buffers() {
        let mut backend = MockBackend::new();
        let pool = TransferPool::allocate(&mut backend, 4, layout()).unwrap();

        assert_eq!(pool.len(), 4);
        assert_eq!(backend.bus().allocated(), 4);
        assert!(backend.bus().buffer_lens().iter().all(|&len| len == 8));
        assert!((0..4).all(|slot| pool.state(slot) == Some(DescriptorState::Idle)));
    }

    #[test]
    fn test_allocation_failure_releases_partial_pool() {
        let mut backend = MockBackend::new();
        backend.bus_mut().fail_allocation_at(3);

        let result = TransferPool::allocate(&mut backend, 8, layout());
        let (slot, err) = result.err().unwrap();

        assert_eq!(slot, 3);
        assert_eq!(err, TransferError::NoMemory);
        assert_eq!(backend.bus().released(), vec![0, 1, 2]);
        assert!(backend.bus().violations().is_empty());
    }

    #[test]
    fn test_submit_all_puts_every_transfer_in_flight() {
        let mut backend = MockBackend::new();
        let mut pool = TransferPool::allocate(&mut backend, 4, layout()).unwrap();

        pool.submit_all().unwrap();

        assert_eq!(pool.in_flight(), 4);
        assert_eq!(backend.bus().in_flight(), 4);
    }

    #[test]
    fn test_submit_failure_cancels_earlier_transfers() {
        let mut backend = MockBackend::new();
        backend.bus_mut().fail_submission(2, 1, TransferError::Busy);
        let mut pool = TransferPool::allocate(&mut backend, 5, layout()).unwrap();

        let err = pool.submit_all().unwrap_err();

        assert_eq!(err.slot, 2);
        assert_eq!(err.source, TransferError::Busy);
        assert_eq!(err.cancelled, 2);
        assert_eq!(pool.state(0), Some(DescriptorState::Cancelling));
        assert_eq!(pool.state(1), Some(DescriptorState::Cancelling));
        assert_eq!(pool.state(2), Some(DescriptorState::Finalized));
        assert_eq!(pool.state(4), Some(DescriptorState::Finalized));
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_completion_forwards_ok_packets_and_resubmits() {
        let mut backend = MockBackend::new();
        backend.bus_mut().script([ScriptedTransfer::packets(vec![
            (TransferStatus::Completed, vec![1, 2, 3, 4]),
            (TransferStatus::Completed, vec![5, 6]),
        ])]);
        let mut pool = TransferPool::allocate(&mut backend, 1, layout()).unwrap();
        pool.submit_all().unwrap();

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        let outcomes = pump(&mut backend, &mut pool, DispatchMode::Stream, &mut sink, &metrics);

        assert!(matches!(outcomes[..], [CompletionOutcome::Resubmitted { bytes: 6 }]));
        assert_eq!(sink, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(backend.bus().submissions(0), 2);
    }

    #[test]
    fn test_errored_packet_is_skipped() {
        let mut backend = MockBackend::new();
        backend.bus_mut().script([ScriptedTransfer::packets(vec![
            (TransferStatus::Error, vec![9, 9, 9, 9]),
            (TransferStatus::Completed, vec![7, 7]),
        ])]);
        let mut pool = TransferPool::allocate(&mut backend, 1, layout()).unwrap();
        pool.submit_all().unwrap();

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        pump(&mut backend, &mut pool, DispatchMode::Stream, &mut sink, &metrics);

        assert_eq!(sink, vec![7, 7]);
        assert_eq!(metrics.packets_dropped(), 1);
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_transfer_level_error_keeps_slot_in_rotation() {
        let mut backend = MockBackend::new();
        backend
            .bus_mut()
            .script([ScriptedTransfer::status(TransferStatus::Overflow)]);
        let mut pool = TransferPool::allocate(&mut backend, 1, layout()).unwrap();
        pool.submit_all().unwrap();

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        let outcomes = pump(&mut backend, &mut pool, DispatchMode::Stream, &mut sink, &metrics);

        assert!(matches!(outcomes[..], [CompletionOutcome::Resubmitted { bytes: 0 }]));
        assert!(sink.is_empty());
        assert_eq!(metrics.snapshot().transfers_failed, 1);
    }

    #[test]
    fn test_no_device_finalizes() {
        let mut backend = MockBackend::new();
        backend
            .bus_mut()
            .script([ScriptedTransfer::status(TransferStatus::NoDevice)]);
        let mut pool = TransferPool::allocate(&mut backend, 1, layout()).unwrap();
        pool.submit_all().unwrap();

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        let outcomes = pump(&mut backend, &mut pool, DispatchMode::Stream, &mut sink, &metrics);

        assert!(matches!(outcomes[..], [CompletionOutcome::DeviceLost]));
        assert_eq!(pool.state(0), Some(DescriptorState::Finalized));
        assert_eq!(backend.bus().submissions(0), 1);
    }

    #[test]
    fn test_resubmit_failure_finalizes() {
        let mut backend = MockBackend::new();
        backend.bus_mut().fail_submission(0, 2, TransferError::Io);
        let mut pool = TransferPool::allocate(&mut backend, 2, layout()).unwrap();
        pool.submit_all().unwrap();

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        let outcomes = pump(&mut backend, &mut pool, DispatchMode::Stream, &mut sink, &metrics);

        assert!(matches!(
            outcomes[0],
            CompletionOutcome::ResubmitFailed {
                error: TransferError::Io
            }
        ));
        assert_eq!(pool.state(0), Some(DescriptorState::Finalized));
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(metrics.snapshot().resubmit_failures, 1);
    }

    #[test]
    fn test_drain_mode_ignores_payload() {
        let mut backend = MockBackend::new();
        let mut pool = TransferPool::allocate(&mut backend, 2, layout()).unwrap();
        pool.submit_all().unwrap();

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        let outcomes = pump(&mut backend, &mut pool, DispatchMode::Drain, &mut sink, &metrics);

        assert_eq!(outcomes.len(), 2);
        assert!(sink.is_empty());
        assert_eq!(pool.finalized(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_cancelled_completion_is_counted_once() {
        let mut backend = MockBackend::new();
        let mut pool = TransferPool::allocate(&mut backend, 3, layout()).unwrap();
        pool.submit_all().unwrap();
        assert_eq!(pool.cancel_outstanding(), 3);

        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        pump(&mut backend, &mut pool, DispatchMode::Drain, &mut sink, &metrics);

        assert_eq!(pool.finalized(), 3);
        assert_eq!(metrics.snapshot().transfers_cancelled, 3);

        // A duplicate completion for a finalized slot changes nothing
        let outcome = pool.on_completion(1, DispatchMode::Drain, &mut sink, &metrics);
        assert!(matches!(outcome, CompletionOutcome::Spurious));
        assert_eq!(pool.finalized(), 3);
    }

    #[test]
    fn test_release_refuses_outstanding_transfers() {
        let mut backend = MockBackend::new();
        let mut pool = TransferPool::allocate(&mut backend, 2, layout()).unwrap();
        pool.submit_all().unwrap();

        let (mut pool, outstanding) = pool.release().err().unwrap();
        assert_eq!(outstanding, 2);
        assert!(backend.bus().released().is_empty());

        pool.cancel_outstanding();
        let metrics = StreamMetrics::new();
        let mut sink = Vec::new();
        pump(&mut backend, &mut pool, DispatchMode::Drain, &mut sink, &metrics);

        assert_eq!(pool.release().ok(), Some(2));
        assert_eq!(backend.bus().released(), vec![0, 1]);
        assert!(backend.bus().violations().is_empty());
    }

    #[test]
    fn test_dropping_busy_pool_leaks_instead_of_freeing() {
        let mut backend = MockBackend::new();
        let mut pool = TransferPool::allocate(&mut backend, 3, layout()).unwrap();
        pool.submit_all().unwrap();

        drop(pool);

        assert!(backend.bus().released().is_empty());
        assert!(backend.bus().violations().is_empty());
    }
}
