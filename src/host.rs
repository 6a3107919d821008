//! The boundary with the upper host stack
//!
//! The host stack receives packets from this driver on two paths. The normal path carries the
//! bulk of the receive pipeline's output. The priority path carries synchronous command replies
//! and buffer credit updates; it bypasses the general pipeline so those packets are never stuck
//! behind a batch of ordinary receive processing.

use crate::buffer::OutboundBuffer;
use tokio::sync::mpsc;

/// Packet acceptance of the upper host stack
///
/// Both methods transfer ownership of the packet to the host stack. Delivery is fire and forget;
/// a host stack that needs to exert backpressure does so through the buffer reserve, not by
/// refusing delivery.
pub trait HostInterface {
    /// Accept an inbound packet on the normal path
    fn deliver(&self, packet: OutboundBuffer);

    /// Accept a packet on the low latency priority path
    fn deliver_priority(&self, packet: OutboundBuffer);
}

/// A channel backed [`HostInterface`]
///
/// The two delivery paths map onto two unbounded channels. This is the implementation used by a
/// host stack living in its own async task; it is also what the driver's own tests consume.
pub struct HostChannels {
    normal: mpsc::UnboundedSender<OutboundBuffer>,
    priority: mpsc::UnboundedSender<OutboundBuffer>,
}

/// The receiving halves matching a [`HostChannels`]
pub struct HostChannelReceivers {
    pub normal: mpsc::UnboundedReceiver<OutboundBuffer>,
    pub priority: mpsc::UnboundedReceiver<OutboundBuffer>,
}

impl HostChannels {
    /// Create the pair of delivery channels
    pub fn unbounded() -> (HostChannels, HostChannelReceivers) {
        let (normal, normal_receiver) = mpsc::unbounded_channel();
        let (priority, priority_receiver) = mpsc::unbounded_channel();

        let channels = HostChannels { normal, priority };

        let receivers = HostChannelReceivers {
            normal: normal_receiver,
            priority: priority_receiver,
        };

        (channels, receivers)
    }
}

impl HostInterface for HostChannels {
    fn deliver(&self, packet: OutboundBuffer) {
        if self.normal.send(packet).is_err() {
            log::error!("host receiver closed, inbound packet dropped")
        }
    }

    fn deliver_priority(&self, packet: OutboundBuffer) {
        if self.priority.send(packet).is_err() {
            log::error!("host receiver closed, priority packet dropped")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;

    #[tokio::test]
    async fn paths_are_independent() {
        let (channels, mut receivers) = HostChannels::unbounded();

        let mut event = OutboundBuffer::new(BufferKind::Event);
        event.extend_from_slice(&[0x13, 0x05]);

        channels.deliver_priority(event);

        let mut acl = OutboundBuffer::new(BufferKind::AclIn);
        acl.extend_from_slice(&[0x01, 0x00]);

        channels.deliver(acl);

        let priority = receivers.priority.recv().await.unwrap();
        assert_eq!(priority.kind(), BufferKind::Event);

        let normal = receivers.normal.recv().await.unwrap();
        assert_eq!(normal.kind(), BufferKind::AclIn);
    }
}
