//! An HCI transport driver for a Bluetooth controller's link layer
//!
//! This crate is the glue between a link layer implementation and a host stack speaking the Host
//! Controller Interface. Downward it accepts command and ACL data packets from the host and
//! executes them against the link layer. Upward it runs a two task receive pipeline that
//! classifies what the link layer produced, applies host buffer flow control, encodes receive
//! nodes into HCI packets and delivers them over the [`HostInterface`].
//!
//! The three boundaries are all traits so the driver is generic over the link layer
//! ([`LinkLayer`]), the buffer allocator ([`BufferReserve`]) and the host stack
//! ([`HostInterface`]). [`PooledBufferReserve`] and [`HostChannels`] are the stock
//! implementations of the latter two.
//!
//! # Receive ordering
//! Completion notifications and synchronous command replies travel on a dedicated priority path
//! and can overtake everything else. All other upward traffic is delivered in the order the link
//! layer produced it, even while parts of it wait for host buffer credits.
//!
//! [`HostChannels`]: host::HostChannels
//! [`PooledBufferReserve`]: buffer::PooledBufferReserve
//! [`BufferReserve`]: buffer::BufferReserve
//! [`HostInterface`]: host::HostInterface
//! [`LinkLayer`]: link_layer::LinkLayer

pub mod buffer;
pub mod flow_control;
pub mod host;
pub mod link_layer;
mod recv;

use buffer::{BufferKind, BufferReserve, OutboundBuffer};
use core::fmt;
use flow_control::HostBufferCredits;
use host::HostInterface;
use link_layer::{LinkLayer, RxWaker};
pub use recv::MAX_CONCAT_MESSAGES;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// A connection handle
///
/// This is used as an identifier of a connection by both the host and interface. Its value is
/// assigned by the controller, and must be in the range between 0 and 0x0EFF.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle {
    handle: u16,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.handle)
    }
}

impl fmt::LowerHex for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.handle)
    }
}

impl fmt::UpperHex for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.handle)
    }
}

impl AsRef<u16> for ConnectionHandle {
    fn as_ref(&self) -> &u16 {
        &self.handle
    }
}

impl ConnectionHandle {
    pub const MAX: u16 = 0x0EFF;

    const ERROR: &'static str = "raw connection handle value larger than the maximum (0x0EFF)";

    pub fn get_raw_handle(&self) -> u16 {
        self.handle
    }
}

impl TryFrom<u16> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        if raw <= ConnectionHandle::MAX {
            Ok(ConnectionHandle { handle: raw })
        } else {
            Err(Self::ERROR)
        }
    }
}

impl TryFrom<[u8; 2]> for ConnectionHandle {
    type Error = &'static str;

    fn try_from(raw: [u8; 2]) -> Result<Self, Self::Error> {
        ConnectionHandle::try_from(u16::from_le_bytes(raw))
    }
}

/// The physical bus a driver is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    /// No physical transport, the controller shares the address space with the host
    Virtual,
    Uart,
    Usb,
    Spi,
    Sdio,
}

/// The identity a driver presents to the host stack
#[derive(Debug, Clone, Copy)]
pub struct TransportRegistration {
    pub name: &'static str,
    pub bus: Bus,
}

/// The transport driver
///
/// A driver is constructed over its three boundary implementations and then
/// [`open`](HciDriver::open)ed once, which initializes the link layer and spawns the receive
/// pipeline. After that the host pushes packets down with [`send`](HciDriver::send) and receives
/// everything coming up through the [`HostInterface`] it provided.
pub struct HciDriver<L: LinkLayer, R, H> {
    link: Arc<Mutex<L>>,
    reserve: Arc<R>,
    host: Arc<H>,
    credits: Arc<HostBufferCredits>,
    rx_waker: Arc<Notify>,
    fifo_tx: mpsc::UnboundedSender<L::Node>,
    fifo_rx: Mutex<Option<mpsc::UnboundedReceiver<L::Node>>>,
}

impl<L, R, H> HciDriver<L, R, H>
where
    L: LinkLayer + Send + 'static,
    L::Node: Send + Sync + 'static,
    R: BufferReserve + Send + Sync + 'static,
    H: HostInterface + Send + Sync + 'static,
{
    pub fn new(link: L, reserve: R, host: H) -> Self {
        let (fifo_tx, fifo_rx) = mpsc::unbounded_channel();

        HciDriver {
            link: Arc::new(Mutex::new(link)),
            reserve: Arc::new(reserve),
            host: Arc::new(host),
            credits: Arc::new(HostBufferCredits::new()),
            rx_waker: Arc::new(Notify::new()),
            fifo_tx,
            fifo_rx: Mutex::new(Some(fifo_rx)),
        }
    }

    /// The shared host buffer credit state
    ///
    /// The link layer's command execution updates this state; a host stack embedding the driver
    /// does not normally need to touch it.
    pub fn credits(&self) -> &Arc<HostBufferCredits> {
        &self.credits
    }

    pub fn registration(&self) -> TransportRegistration {
        TransportRegistration {
            name: "Controller",
            bus: Bus::Virtual,
        }
    }

    /// Open the transport
    ///
    /// The link layer is initialized with the receive wake primitive and the shared credit state,
    /// and the two receive tasks are spawned onto the current runtime. Opening an already opened
    /// driver fails without touching the link layer.
    ///
    /// # Error
    /// [`OpenError::AlreadyOpened`] on a second open, or the link layer's own initialization
    /// error.
    pub async fn open(&self) -> Result<(), OpenError<L::Error>> {
        let fifo_rx = {
            let mut slot = self.fifo_rx.lock().await;

            slot.take().ok_or(OpenError::AlreadyOpened)?
        };

        {
            let mut link = self.link.lock().await;

            link.init(RxWaker::new(self.rx_waker.clone()), self.credits.clone())
                .map_err(OpenError::LinkLayer)?;
        }

        tokio::spawn(recv::prio_recv_task(
            self.link.clone(),
            self.reserve.clone(),
            self.host.clone(),
            self.fifo_tx.clone(),
            self.rx_waker.clone(),
        ));

        tokio::spawn(recv::recv_task(
            self.link.clone(),
            self.reserve.clone(),
            self.host.clone(),
            self.credits.clone(),
            fifo_rx,
        ));

        log::debug!("transport open");

        Ok(())
    }

    /// Send a packet from the host down to the controller
    ///
    /// Command packets are executed synchronously; a command reply and any outbound ACL event go
    /// back up the priority path before this method returns. A receive node produced as a command
    /// side effect joins the general receive queue.
    ///
    /// # Error
    /// The packet could not be processed. Every error variant carries the packet back to the
    /// caller, the driver never silently consumes a packet it rejected.
    pub async fn send(&self, packet: OutboundBuffer) -> Result<(), SendError<L::Error>> {
        log::debug!("packet out: type:{} len:{}", packet.kind(), packet.len());

        if packet.is_empty() {
            log::error!("empty {} packet", packet.kind());

            return Err(SendError::EmptyPacket(packet));
        }

        match packet.kind() {
            BufferKind::Command => self.handle_command(packet).await,
            BufferKind::AclOut => self.handle_acl(packet).await,
            _ => Err(SendError::UnknownPacket(packet)),
        }
    }

    async fn handle_command(&self, packet: OutboundBuffer) -> Result<(), SendError<L::Error>> {
        let outcome = {
            let mut link = self.link.lock().await;

            match link.execute_command(&packet) {
                Ok(outcome) => outcome,
                Err(e) => return Err(SendError::LinkLayer(e, packet)),
            }
        };

        if let Some(reply) = outcome.reply {
            log::debug!("command reply: len:{}", reply.len());

            self.host.deliver_priority(reply);
        }

        if let Some(node) = outcome.node {
            if let Err(mpsc::error::SendError(node)) = self.fifo_tx.send(node) {
                // the pipeline is gone, at least keep the node pool intact
                self.link.lock().await.release_node(node);
            }
        }

        Ok(())
    }

    async fn handle_acl(&self, packet: OutboundBuffer) -> Result<(), SendError<L::Error>> {
        let reply = {
            let mut link = self.link.lock().await;

            match link.execute_acl(&packet) {
                Ok(reply) => reply,
                Err(e) => return Err(SendError::LinkLayer(e, packet)),
            }
        };

        if let Some(reply) = reply {
            self.host.deliver_priority(reply);
        }

        Ok(())
    }
}

/// Error for [`open`](HciDriver::open)
#[derive(Debug)]
pub enum OpenError<E> {
    /// The driver was already opened
    AlreadyOpened,
    /// The link layer failed to initialize
    LinkLayer(E),
}

impl<E: fmt::Display> fmt::Display for OpenError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpenError::AlreadyOpened => f.write_str("the transport is already open"),
            OpenError::LinkLayer(e) => write!(f, "link layer initialization failed: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for OpenError<E> {}

/// Error for [`send`](HciDriver::send)
///
/// Every variant returns ownership of the rejected packet; use
/// [`into_packet`](SendError::into_packet) to get it back.
#[derive(Debug)]
pub enum SendError<E> {
    /// The packet carries no payload
    EmptyPacket(OutboundBuffer),
    /// The packet kind is not one the host may send
    UnknownPacket(OutboundBuffer),
    /// The link layer rejected the packet
    LinkLayer(E, OutboundBuffer),
}

impl<E> SendError<E> {
    /// Recover the packet the driver rejected
    pub fn into_packet(self) -> OutboundBuffer {
        match self {
            SendError::EmptyPacket(packet) => packet,
            SendError::UnknownPacket(packet) => packet,
            SendError::LinkLayer(_, packet) => packet,
        }
    }
}

impl<E: fmt::Display> fmt::Display for SendError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendError::EmptyPacket(packet) => write!(f, "empty {} packet", packet.kind()),
            SendError::UnknownPacket(packet) => {
                write!(f, "a {} packet cannot be sent to the controller", packet.kind())
            }
            SendError::LinkLayer(e, _) => write!(f, "link layer error: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for SendError<E> {}
