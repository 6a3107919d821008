//! Host buffer flow control
//!
//! When the host advertises a finite ACL buffer capacity, the driver must never deliver more
//! unacknowledged ACL packets than the host can hold. [`HostBufferCredits`] carries the counters
//! shared between the send path (where the host configures, acknowledges and resets them through
//! command execution) and the general receive task. [`CreditManager`] is the receive task's
//! private bookkeeping: the admission rules and the FIFO queue of nodes waiting for credit.
//!
//! The available credit is always recomputed from `total - (sent - acked)` at the point of use.
//! The counters change concurrently with the receive task, so a cached value would go stale
//! across any suspension point.

use crate::link_layer::{PacketClass, ReceiveNode};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Credit available without bound, flow control is disabled
const UNLIMITED: i32 = -1;

/// The shared host buffer credit state
///
/// `total` is the capacity the host advertised; zero or negative means host flow control is
/// disabled and the whole credit machinery is bypassed. `sent` counts ACL packets delivered to
/// the host and `acked` counts the packets the host has confirmed consumed.
///
/// The link layer updates this state from command execution: the host buffer configuration
/// command sets `total`, the host's completed-packets command adds to `acked`, and a controller
/// reset raises the reset flag. Each of the latter two also raises the credit signal so the
/// general receive task re-evaluates its pending queue.
#[derive(Debug, Default)]
pub struct HostBufferCredits {
    total: AtomicI32,
    sent: AtomicU32,
    acked: AtomicU32,
    reset: AtomicBool,
    signal: Notify,
}

impl HostBufferCredits {
    pub fn new() -> Self {
        HostBufferCredits::default()
    }

    /// Set the host's advertised ACL buffer capacity
    ///
    /// A `total` of zero or less disables host buffer flow control.
    pub fn set_total(&self, total: i32) {
        self.total.store(total, Ordering::SeqCst)
    }

    /// The host acknowledged `completed` consumed ACL packets
    pub fn ack(&self, completed: u32) {
        self.acked.fetch_add(completed, Ordering::SeqCst);

        self.signal.notify_one()
    }

    /// Raise the reset flag
    ///
    /// The flag is edge triggered; the general receive task clears it on its next invocation and
    /// empties its pending queue without releasing the queued nodes, as the link layer reclaims
    /// all node memory itself as part of a reset.
    pub fn signal_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);

        self.signal.notify_one()
    }

    /// Credits currently available, or [`UNLIMITED`] when flow control is disabled
    pub fn available(&self) -> i32 {
        let total = self.total.load(Ordering::SeqCst);

        if total <= 0 {
            return UNLIMITED;
        }

        let sent = self.sent.load(Ordering::SeqCst);
        let acked = self.acked.load(Ordering::SeqCst);

        total - sent.wrapping_sub(acked) as i32
    }

    pub fn total(&self) -> i32 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u32 {
        self.acked.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn raise_signal(&self) {
        self.signal.notify_one()
    }

    /// Wait for the credit signal
    pub(crate) async fn signaled(&self) {
        self.signal.notified().await
    }
}

/// Admission bookkeeping for the general receive task
///
/// The manager decides, per classified node, whether it may be encoded now or must wait in the
/// pending queue for host credit. The queue holds owned nodes; a node is either in flight in the
/// task's batch or in this queue, never both, and ordering within the queue is never changed.
pub(crate) struct CreditManager<N> {
    credits: Arc<HostBufferCredits>,
    pending: VecDeque<N>,
    count: i32,
}

impl<N: ReceiveNode> CreditManager<N> {
    pub(crate) fn new(credits: Arc<HostBufferCredits>) -> Self {
        CreditManager {
            credits,
            pending: VecDeque::new(),
            count: UNLIMITED,
        }
    }

    /// Refresh the credit count
    ///
    /// This must run before any other flow control decision of an iteration. The reset flag is
    /// consumed first; on reset the pending queue is emptied without touching the link layer, the
    /// queued nodes were already reclaimed upstream.
    pub(crate) fn refresh(&mut self) {
        if self.credits.take_reset() {
            log::debug!("fc: reset, flushing {} pending node(s)", self.pending.len());

            self.pending.clear();
        }

        self.count = self.credits.available();
    }

    /// Decide whether `node` may be processed now
    ///
    /// Returns the node back when it is admitted; otherwise the node was appended to the pending
    /// queue. With flow control disabled every node passes straight through and the pending queue
    /// is never touched.
    pub(crate) fn admit(&mut self, node: N) -> Option<N> {
        if self.count == UNLIMITED {
            return Some(node);
        }

        let pend = !self.pending.is_empty();

        match node.packet_class() {
            PacketClass::EventRequired | PacketClass::EventDiscardable => Some(node),
            PacketClass::EventConnectionRelated => {
                // a connection related event must always eventually get through
                self.count = 1;

                if pend {
                    log::debug!("fc: queuing item: {:?}", node.packet_class());

                    self.pending.push_back(node);

                    None
                } else {
                    Some(node)
                }
            }
            PacketClass::AclData => {
                if pend || self.count <= 0 {
                    log::debug!("fc: queuing item: {:?}", node.packet_class());

                    self.pending.push_back(node);

                    None
                } else {
                    Some(node)
                }
            }
        }
    }

    /// Dequeue the head of the pending queue if it is admissible
    ///
    /// Only connection related events and ACL data can wait in the pending queue; anything else
    /// found here means admission put a node where it never belongs, which is a broken contract,
    /// not a runtime condition.
    pub(crate) fn take_ready(&mut self) -> Option<N> {
        let class = self.pending.front()?.packet_class();

        match class {
            PacketClass::EventConnectionRelated => {
                log::debug!("fc: dequeuing event");

                self.pending.pop_front()
            }
            PacketClass::AclData if self.count > 0 => {
                log::debug!("fc: dequeuing ACL data");

                self.pending.pop_front()
            }
            // no credit, the host's next acknowledgement re-raises the signal
            PacketClass::AclData => None,
            PacketClass::EventRequired | PacketClass::EventDiscardable => {
                unreachable!("non flow controlled node in the pending queue")
            }
        }
    }

    /// Raise the credit signal when the pending head could be processed
    ///
    /// The credit count is recomputed first since encoding may have changed `sent` since
    /// [`refresh`](Self::refresh). Raising the signal makes the general receive task run another
    /// iteration without waiting on new input, which is what drains the queue as soon as credit
    /// is available while keeping FIFO order.
    pub(crate) fn schedule_if_ready(&mut self) {
        self.count = self.credits.available();

        let Some(head) = self.pending.front() else { return };

        let ready = match head.packet_class() {
            PacketClass::EventConnectionRelated => true,
            PacketClass::AclData => self.count > 0,
            PacketClass::EventRequired | PacketClass::EventDiscardable => {
                unreachable!("non flow controlled node in the pending queue")
            }
        };

        if ready {
            log::debug!("fc: signalling");

            self.credits.raise_signal()
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
