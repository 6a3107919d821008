//! The receive pipeline
//!
//! Two long lived tasks cooperate to move link layer receive data up to the host stack.
//!
//! The priority receive task drains completion notifications ahead of everything else and feeds
//! ordinary receive nodes into the general receive queue. The general receive task multiplexes
//! over the credit signal and that queue, runs flow control admission, encodes admitted nodes and
//! delivers the results.
//!
//! [`encode_nodes`] is the single place nodes are turned into outbound buffers and the single
//! place node ownership returns to the link layer. Exactly one buffer (or a deliberate drop of
//! discardable events) is produced per call, and every node the call consumed is released
//! afterwards whether it was encoded or not.

use crate::buffer::{BufferKind, BufferReserve, OutboundBuffer, WaitPolicy};
use crate::flow_control::{CreditManager, HostBufferCredits};
use crate::host::HostInterface;
use crate::link_layer::{LinkLayer, PacketClass, ReceiveNode};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// The most receive nodes one encoding pass will look at
pub const MAX_CONCAT_MESSAGES: usize = 5;

/// How long to wait for an event buffer when everything scanned is discardable
const DISCARDABLE_ALLOC_WAIT: Duration = Duration::from_millis(5);

async fn take_blocking<R>(reserve: &R, kind: BufferKind) -> OutboundBuffer
where
    R: BufferReserve,
{
    match reserve.take(kind, WaitPolicy::Blocking).await {
        Some(buffer) => buffer,
        None => unreachable!("a blocking buffer allocation resolved to none"),
    }
}

/// Encode a prefix of `nodes` into at most one outbound buffer
///
/// Nodes are scanned in order until a buffer has been produced or the concatenation limit is hit.
/// A required or connection related event allocates an event buffer with a blocking wait, the one
/// point of the pipeline allowed to block indefinitely. ACL data allocates an ACL buffer the same
/// way. Discardable events are skipped over during the scan; when the scan ends with only
/// discardables consumed, a single bounded wait allocation either yields the buffer they are all
/// concatenated into or, on expiry, they are dropped.
///
/// Every consumed node is removed from `nodes`, has its per connection flow control cleared, and
/// is released back to the link layer pool.
pub(crate) async fn encode_nodes<L, R>(
    link: &Mutex<L>,
    reserve: &R,
    nodes: &mut VecDeque<L::Node>,
) -> Option<OutboundBuffer>
where
    L: LinkLayer,
    R: BufferReserve,
{
    let mut buffer: Option<OutboundBuffer> = None;
    let mut consumed = 0;

    for node in nodes.iter() {
        if buffer.is_some() || consumed == MAX_CONCAT_MESSAGES {
            break;
        }

        match node.packet_class() {
            PacketClass::EventRequired | PacketClass::EventConnectionRelated => {
                let mut event = take_blocking(reserve, BufferKind::Event).await;

                link.lock().await.encode_event(node, &mut event);

                buffer = Some(event);
            }
            PacketClass::EventDiscardable => (),
            PacketClass::AclData => {
                let mut acl = take_blocking(reserve, BufferKind::AclIn).await;

                link.lock().await.encode_acl(node, &mut acl);

                buffer = Some(acl);
            }
        }

        consumed += 1;
    }

    if buffer.is_none() {
        // everything scanned was discardable
        let taken = reserve
            .take(BufferKind::Event, WaitPolicy::BoundedWait(DISCARDABLE_ALLOC_WAIT))
            .await;

        match taken {
            Some(mut event) => {
                let mut link = link.lock().await;

                for node in nodes.iter().take(consumed) {
                    link.encode_event(node, &mut event);
                }

                buffer = Some(event);
            }
            None => log::debug!("no event buffer, dropping {} discardable node(s)", consumed),
        }
    }

    assert!(consumed > 0, "an encoding pass consumed zero receive nodes");

    let mut link = link.lock().await;

    for node in nodes.drain(..consumed) {
        if let Some(handle) = node.connection_handle() {
            link.clear_flow_control(handle);
        }

        link.release_node(node);
    }

    buffer
}

/// Deliver an encoded buffer to the host stack
///
/// An empty buffer is recycled instead of delivered. A delivered ACL buffer counts against the
/// host's credits.
fn deliver<H>(host: &H, credits: &HostBufferCredits, buffer: OutboundBuffer)
where
    H: HostInterface,
{
    if buffer.is_empty() {
        return;
    }

    log::debug!("packet in: type:{} len:{}", buffer.kind(), buffer.len());

    if buffer.kind() == BufferKind::AclIn {
        credits.inc_sent();
    }

    host.deliver(buffer)
}

/// The priority receive task
///
/// Runs ahead of the general receive task by never doing bulk work: completions are encoded and
/// delivered on the priority path one by one with a cooperative yield in between, ordinary nodes
/// are only moved onto the general receive queue. When the link layer has nothing, the task parks
/// on the wake primitive the link layer was initialized with.
pub(crate) async fn prio_recv_task<L, R, H>(
    link: Arc<Mutex<L>>,
    reserve: Arc<R>,
    host: Arc<H>,
    fifo: mpsc::UnboundedSender<L::Node>,
    waker: Arc<Notify>,
) where
    L: LinkLayer,
    R: BufferReserve,
    H: HostInterface,
{
    loop {
        loop {
            let completion = link.lock().await.poll_completion();

            let Some(completion) = completion else { break };

            let mut event = take_blocking(reserve.as_ref(), BufferKind::Event).await;

            link.lock().await.encode_num_completed(completion, &mut event);

            log::debug!("num complete: {}", completion);

            host.deliver_priority(event);

            tokio::task::yield_now().await;
        }

        let node = link.lock().await.dequeue_receive_node();

        if let Some(node) = node {
            log::debug!("rx node enqueue");

            if let Err(mpsc::error::SendError(node)) = fifo.send(node) {
                // the general receive task is gone, hand the node back
                link.lock().await.release_node(node);

                return;
            }

            continue;
        }

        log::trace!("waiting for rx");

        waker.notified().await;
    }
}

/// The general receive task
///
/// One iteration is woken by exactly one of two sources, checked in this order: the credit
/// signal, which drains at most one admissible node from the pending queue with no new input
/// required, or the general receive queue, from which additional immediately available nodes are
/// batched opportunistically. Flow control runs before encoding either way.
pub(crate) async fn recv_task<L, R, H>(
    link: Arc<Mutex<L>>,
    reserve: Arc<R>,
    host: Arc<H>,
    credits: Arc<HostBufferCredits>,
    mut fifo: mpsc::UnboundedReceiver<L::Node>,
) where
    L: LinkLayer,
    R: BufferReserve,
    H: HostInterface,
{
    let mut flow: CreditManager<L::Node> = CreditManager::new(credits.clone());

    loop {
        log::trace!("blocking");

        tokio::select! {
            biased;

            _ = credits.signaled() => {
                flow.refresh();

                if let Some(ready) = flow.take_ready() {
                    let mut single = VecDeque::with_capacity(1);

                    single.push_back(ready);

                    if let Some(buffer) = encode_nodes(&link, reserve.as_ref(), &mut single).await {
                        deliver(host.as_ref(), &credits, buffer);
                    }

                    flow.schedule_if_ready();
                }
            }

            dequeued = fifo.recv() => {
                // the channel closes when the driver is dropped
                let Some(first) = dequeued else { return };

                let mut nodes = VecDeque::with_capacity(MAX_CONCAT_MESSAGES);

                nodes.push_back(first);

                while nodes.len() < MAX_CONCAT_MESSAGES {
                    match fifo.try_recv() {
                        Ok(node) => nodes.push_back(node),
                        Err(_) => break,
                    }
                }

                log::trace!("unblocked");

                flow.refresh();

                // this iteration already has input; anything admissible at the head of the
                // pending queue is signalled for a later iteration to keep FIFO order
                flow.schedule_if_ready();

                let mut admitted = VecDeque::with_capacity(nodes.len());

                for node in nodes.drain(..) {
                    if let Some(node) = flow.admit(node) {
                        admitted.push_back(node);
                    }
                }

                while !admitted.is_empty() {
                    if let Some(buffer) = encode_nodes(&link, reserve.as_ref(), &mut admitted).await {
                        deliver(host.as_ref(), &credits, buffer);
                    }
                }
            }
        }

        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostChannels;
    use crate::link_layer::{CommandOutcome, Completion, RxWaker};
    use crate::ConnectionHandle;
    use core::convert::Infallible;

    struct TestNode {
        id: u8,
        class: PacketClass,
        handle: Option<ConnectionHandle>,
    }

    impl TestNode {
        fn new(id: u8, class: PacketClass) -> Self {
            TestNode {
                id,
                class,
                handle: None,
            }
        }

        fn with_handle(id: u8, class: PacketClass, raw_handle: u16) -> Self {
            TestNode {
                id,
                class,
                handle: Some(ConnectionHandle::try_from(raw_handle).unwrap()),
            }
        }
    }

    impl ReceiveNode for TestNode {
        fn packet_class(&self) -> PacketClass {
            self.class
        }

        fn connection_handle(&self) -> Option<ConnectionHandle> {
            self.handle
        }
    }

    #[derive(Default)]
    struct TestLink {
        completions: VecDeque<Completion>,
        rx_queue: VecDeque<TestNode>,
        released: Vec<u8>,
        cleared: Vec<ConnectionHandle>,
    }

    impl LinkLayer for TestLink {
        type Node = TestNode;
        type Error = Infallible;

        fn init(&mut self, _: RxWaker, _: Arc<HostBufferCredits>) -> Result<(), Infallible> {
            Ok(())
        }

        fn poll_completion(&mut self) -> Option<Completion> {
            self.completions.pop_front()
        }

        fn dequeue_receive_node(&mut self) -> Option<TestNode> {
            self.rx_queue.pop_front()
        }

        fn release_node(&mut self, node: TestNode) {
            self.released.push(node.id)
        }

        fn clear_flow_control(&mut self, handle: ConnectionHandle) {
            self.cleared.push(handle)
        }

        fn encode_event(&mut self, node: &TestNode, buffer: &mut OutboundBuffer) {
            buffer.extend_from_slice(&[node.id])
        }

        fn encode_acl(&mut self, node: &TestNode, buffer: &mut OutboundBuffer) {
            buffer.extend_from_slice(&[node.id])
        }

        fn encode_num_completed(&mut self, completion: Completion, buffer: &mut OutboundBuffer) {
            buffer.extend_from_slice(&completion.handle.get_raw_handle().to_le_bytes());
            buffer.extend_from_slice(&[completion.completed]);
        }

        fn execute_command(&mut self, _: &[u8]) -> Result<CommandOutcome<TestNode>, Infallible> {
            unimplemented!("not part of the receive pipeline")
        }

        fn execute_acl(&mut self, _: &[u8]) -> Result<Option<OutboundBuffer>, Infallible> {
            unimplemented!("not part of the receive pipeline")
        }
    }

    /// A reserve with unlimited buffers
    struct OpenReserve;

    impl BufferReserve for OpenReserve {
        async fn take(&self, kind: BufferKind, _: WaitPolicy) -> Option<OutboundBuffer> {
            Some(OutboundBuffer::new(kind))
        }
    }

    /// A reserve that is out of buffers for any bounded or non blocking wait
    struct StarvedReserve;

    impl BufferReserve for StarvedReserve {
        async fn take(&self, kind: BufferKind, wait: WaitPolicy) -> Option<OutboundBuffer> {
            match wait {
                WaitPolicy::Blocking => Some(OutboundBuffer::new(kind)),
                WaitPolicy::BoundedWait(_) | WaitPolicy::NonBlocking => None,
            }
        }
    }

    #[tokio::test]
    async fn discardable_events_are_batched_into_one_buffer() {
        let link = Mutex::new(TestLink::default());

        let mut nodes: VecDeque<TestNode> = (1..=3)
            .map(|id| TestNode::new(id, PacketClass::EventDiscardable))
            .collect();

        let buffer = encode_nodes(&link, &OpenReserve, &mut nodes).await.unwrap();

        assert_eq!(buffer.kind(), BufferKind::Event);
        assert_eq!(&*buffer, &[1, 2, 3]);

        assert!(nodes.is_empty());
        assert_eq!(link.lock().await.released, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn discardable_events_drop_under_buffer_pressure() {
        let link = Mutex::new(TestLink::default());

        let mut nodes: VecDeque<TestNode> = (1..=2)
            .map(|id| TestNode::new(id, PacketClass::EventDiscardable))
            .collect();

        let buffer = encode_nodes(&link, &StarvedReserve, &mut nodes).await;

        assert!(buffer.is_none());

        // dropped, but still released exactly once each
        assert!(nodes.is_empty());
        assert_eq!(link.lock().await.released, vec![1, 2]);
    }

    #[tokio::test]
    async fn required_event_stops_the_scan() {
        let link = Mutex::new(TestLink::default());

        let mut nodes = VecDeque::from([
            TestNode::new(1, PacketClass::EventDiscardable),
            TestNode::new(2, PacketClass::EventRequired),
            TestNode::new(3, PacketClass::AclData),
        ]);

        let buffer = encode_nodes(&link, &OpenReserve, &mut nodes).await.unwrap();

        // the discardable node scanned ahead of the required event is consumed without
        // being encoded
        assert_eq!(buffer.kind(), BufferKind::Event);
        assert_eq!(&*buffer, &[2]);

        assert_eq!(nodes.len(), 1);
        assert_eq!(link.lock().await.released, vec![1, 2]);
    }

    #[tokio::test]
    async fn acl_data_clears_connection_flow_control() {
        let link = Mutex::new(TestLink::default());

        let mut nodes = VecDeque::from([TestNode::with_handle(7, PacketClass::AclData, 0x0004)]);

        let buffer = encode_nodes(&link, &OpenReserve, &mut nodes).await.unwrap();

        assert_eq!(buffer.kind(), BufferKind::AclIn);
        assert_eq!(&*buffer, &[7]);

        let link = link.lock().await;

        assert_eq!(link.cleared, vec![ConnectionHandle::try_from(0x0004).unwrap()]);
        assert_eq!(link.released, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_releases_every_node_exactly_once() {
        let link = Arc::new(Mutex::new(TestLink::default()));
        let credits = Arc::new(HostBufferCredits::new());
        let (host, mut receivers) = HostChannels::unbounded();

        let (fifo_tx, fifo_rx) = mpsc::unbounded_channel();

        tokio::spawn(recv_task(
            link.clone(),
            Arc::new(OpenReserve),
            Arc::new(host),
            credits.clone(),
            fifo_rx,
        ));

        fifo_tx.send(TestNode::new(1, PacketClass::EventRequired)).unwrap();
        fifo_tx.send(TestNode::new(2, PacketClass::EventDiscardable)).unwrap();
        fifo_tx
            .send(TestNode::with_handle(3, PacketClass::AclData, 0x0001))
            .unwrap();
        fifo_tx.send(TestNode::new(4, PacketClass::EventDiscardable)).unwrap();
        fifo_tx.send(TestNode::new(5, PacketClass::EventDiscardable)).unwrap();

        let first = receivers.normal.recv().await.unwrap();
        assert_eq!(&*first, &[1]);

        // node 2 is consumed by the same pass that encodes the ACL data and dropped
        let second = receivers.normal.recv().await.unwrap();
        assert_eq!(second.kind(), BufferKind::AclIn);
        assert_eq!(&*second, &[3]);

        let third = receivers.normal.recv().await.unwrap();
        assert_eq!(&*third, &[4, 5]);

        let mut released = link.lock().await.released.clone();
        released.sort_unstable();

        assert_eq!(released, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_acl_data_keeps_enqueue_order() {
        let link = Arc::new(Mutex::new(TestLink::default()));
        let credits = Arc::new(HostBufferCredits::new());
        let (host, mut receivers) = HostChannels::unbounded();

        // one host buffer, already in use: no credit until the host acknowledges
        credits.set_total(1);
        credits.inc_sent();

        let (fifo_tx, fifo_rx) = mpsc::unbounded_channel();

        tokio::spawn(recv_task(
            link.clone(),
            Arc::new(OpenReserve),
            Arc::new(host),
            credits.clone(),
            fifo_rx,
        ));

        for id in 1..=3 {
            fifo_tx
                .send(TestNode::with_handle(id, PacketClass::AclData, id as u16))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1)).await;

        // everything pends while the host holds the buffer
        assert!(receivers.normal.try_recv().is_err());

        for id in 1..=3u8 {
            credits.ack(1);

            let delivered = tokio::time::timeout(Duration::from_secs(5), receivers.normal.recv())
                .await
                .expect("acknowledgement did not release a pending node")
                .unwrap();

            assert_eq!(&*delivered, &[id]);
        }

        assert!(receivers.normal.try_recv().is_err());
        assert_eq!(link.lock().await.released, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn completions_are_delivered_on_the_priority_path() {
        let handle = ConnectionHandle::try_from(0x0002).unwrap();

        let mut test_link = TestLink::default();

        test_link.completions.push_back(Completion { handle, completed: 2 });
        test_link.rx_queue.push_back(TestNode::new(9, PacketClass::EventRequired));

        let link = Arc::new(Mutex::new(test_link));
        let (host, mut receivers) = HostChannels::unbounded();
        let waker = Arc::new(Notify::new());

        let (fifo_tx, mut fifo_rx) = mpsc::unbounded_channel();

        tokio::spawn(prio_recv_task(
            link.clone(),
            Arc::new(OpenReserve),
            Arc::new(host),
            fifo_tx,
            waker.clone(),
        ));

        let completion = receivers.priority.recv().await.unwrap();
        assert_eq!(&*completion, &[0x02, 0x00, 2]);

        // the ordinary node was moved onto the general receive queue
        let node = fifo_rx.recv().await.unwrap();
        assert_eq!(node.id, 9);

        // nothing left: the task parks on the waker until the link layer signals again
        link.lock().await.rx_queue.push_back(TestNode::new(10, PacketClass::AclData));

        waker.notify_one();

        let node = tokio::time::timeout(Duration::from_secs(5), fifo_rx.recv())
            .await
            .expect("wake primitive did not resume the priority task")
            .unwrap();

        assert_eq!(node.id, 10);
    }
}
