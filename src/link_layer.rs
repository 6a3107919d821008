//! The boundary between this driver and the link layer
//!
//! The link layer owns the radio and produces receive nodes, this driver only moves those nodes
//! into packets the host stack can consume. Everything the driver needs from the link layer is
//! behind the [`LinkLayer`] trait so the driver never touches the radio (or a mock of it in tests)
//! directly.
//!
//! A receive node stays owned by the link layer's memory pool. Ownership of a node is passed to
//! the driver by [`dequeue_receive_node`] and handed back with [`release_node`]. The driver
//! guarantees every dequeued node is released exactly once, whether or not it was encoded into a
//! packet.
//!
//! [`dequeue_receive_node`]: LinkLayer::dequeue_receive_node
//! [`release_node`]: LinkLayer::release_node

use crate::buffer::OutboundBuffer;
use crate::flow_control::HostBufferCredits;
use crate::ConnectionHandle;
use core::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

/// The class of a receive node
///
/// Every node the link layer produces maps to exactly one class. The class decides both how the
/// node is encoded and whether host buffer flow control applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// An event the host must never lose
    ///
    /// These are encoded into an event packet with a blocking buffer allocation and are exempt
    /// from flow control.
    EventRequired,
    /// An event tied to the lifetime of a connection
    ///
    /// Connection related events are exempt from the credit count but still queue behind pending
    /// ACL data so that ordering is kept.
    EventConnectionRelated,
    /// An event whose loss is acceptable under buffer pressure
    ///
    /// Discardable events are batched together and silently dropped when no event buffer can be
    /// acquired within a short bounded wait.
    EventDiscardable,
    /// ACL data destined for a host buffer
    ///
    /// Admitted only while the host has buffer credits (or flow control is disabled).
    AclData,
}

/// A unit of receive data produced by the link layer
///
/// The contents of a node are opaque to this driver. The only things the driver reads from a node
/// are its [`PacketClass`] and, for connection scoped traffic, its connection handle.
pub trait ReceiveNode: Send {
    /// Classify this node
    ///
    /// Classification is a pure function of the node's contents and is stable for the node's
    /// lifetime.
    fn packet_class(&self) -> PacketClass;

    /// The connection this node belongs to, if any
    fn connection_handle(&self) -> Option<ConnectionHandle>;
}

/// A completion notification from the link layer
///
/// The pair of a connection handle and the number of outbound packets the link layer has finished
/// with since the last poll. These are turned into *Number of Completed Packets* style events and
/// delivered on the priority path so the host can return buffer credits without waiting behind
/// bulk receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub handle: ConnectionHandle,
    pub completed: u8,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{}", self.handle.get_raw_handle(), self.completed)
    }
}

/// The outcome of executing an HCI command on the link layer
///
/// `reply` is the synchronous command response, if the command produced one. It must be delivered
/// on the priority path so the host stack never waits on its own command behind the general
/// receive pipeline. `node` is a receive node produced as a side effect of command execution; the
/// driver enqueues it on the general receive queue.
pub struct CommandOutcome<N> {
    pub reply: Option<OutboundBuffer>,
    pub node: Option<N>,
}

/// The wake primitive handed to the link layer
///
/// The link layer calls [`wake`](RxWaker::wake) whenever new receive data exists. Waking is
/// edge-insensitive, the priority receive task drains everything available before waiting again,
/// so coalesced wakes are never lost work.
#[derive(Clone)]
pub struct RxWaker {
    notify: Arc<Notify>,
}

impl RxWaker {
    pub(crate) fn new(notify: Arc<Notify>) -> Self {
        RxWaker { notify }
    }

    /// Signal that receive data is available
    pub fn wake(&self) {
        self.notify.notify_one()
    }
}

/// The link layer
///
/// This is everything the driver requires of the component below it: the receive queues, the node
/// memory pool, and the opaque encode/execute capabilities for turning nodes and host packets
/// into wire traffic. All methods are synchronous and short; the driver serializes access behind
/// a mutex shared by its two receive tasks and the send path.
pub trait LinkLayer {
    type Node: ReceiveNode;
    type Error: fmt::Debug + fmt::Display;

    /// Initialize the link layer
    ///
    /// `waker` is the primitive the link layer must signal whenever receive data becomes
    /// available. `credits` is the shared host buffer credit state; command execution updates it
    /// when the host configures its buffers, acknowledges ACL packets, or resets the controller.
    fn init(&mut self, waker: RxWaker, credits: Arc<HostBufferCredits>) -> Result<(), Self::Error>;

    /// Poll for a completion notification
    ///
    /// Returns `None` once all pending completions have been drained.
    fn poll_completion(&mut self) -> Option<Completion>;

    /// Take ownership of the next ordinary receive node
    fn dequeue_receive_node(&mut self) -> Option<Self::Node>;

    /// Return a node to the link layer's memory pool
    fn release_node(&mut self, node: Self::Node);

    /// Per connection receive flow control release
    ///
    /// Called once for every consumed node associated with `handle`, before the node is released.
    fn clear_flow_control(&mut self, handle: ConnectionHandle);

    /// Encode an event class node into `buffer`
    ///
    /// Encoded bytes are appended, which is what allows the driver to concatenate several
    /// discardable events into one buffer.
    fn encode_event(&mut self, node: &Self::Node, buffer: &mut OutboundBuffer);

    /// Encode an ACL data node into `buffer`
    fn encode_acl(&mut self, node: &Self::Node, buffer: &mut OutboundBuffer);

    /// Encode a completion notification into `buffer`
    fn encode_num_completed(&mut self, completion: Completion, buffer: &mut OutboundBuffer);

    /// Execute an HCI command packet
    ///
    /// # Error
    /// An error means the command could not be executed at all; when an error is returned the
    /// driver hands the command packet back to its caller.
    fn execute_command(&mut self, command: &[u8]) -> Result<CommandOutcome<Self::Node>, Self::Error>;

    /// Accept an outbound ACL data packet
    ///
    /// A returned event, if any, is delivered on the priority path.
    fn execute_acl(&mut self, data: &[u8]) -> Result<Option<OutboundBuffer>, Self::Error>;
}
