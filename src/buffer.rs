//! Outbound buffers and the buffer allocator boundary
//!
//! Every packet this driver hands upward or accepts downward travels in an [`OutboundBuffer`]
//! tagged with its wire type. Buffers for the receive pipeline come from a [`BufferReserve`],
//! with the wait policy stated explicitly at every allocation site. The policy is what preserves
//! the driver's delivery guarantees: required and connection related events may block
//! indefinitely for a buffer, discardable events only ever wait a short bounded time and are
//! dropped on expiry.

use core::fmt;
use core::future::Future;
use core::ops::{Deref, DerefMut};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The wire type of a buffer
///
/// `Command` and `AclOut` travel downward from the host, `Event` and `AclIn` travel upward from
/// this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Command,
    AclOut,
    Event,
    AclIn,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Command => f.write_str("command"),
            BufferKind::AclOut => f.write_str("ACL out"),
            BufferKind::Event => f.write_str("event"),
            BufferKind::AclIn => f.write_str("ACL in"),
        }
    }
}

/// How long an allocation is allowed to wait for a free buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wait until a buffer is available, however long that takes
    Blocking,
    /// Wait at most this long, then give up
    BoundedWait(Duration),
    /// Fail immediately when no buffer is free
    NonBlocking,
}

/// A buffer holding one encoded HCI packet
///
/// The driver owns a buffer from allocation until it is delivered to the host stack; delivery
/// transfers ownership. Dropping a buffer that came from a [`PooledBufferReserve`] returns its
/// slot to the pool.
pub struct OutboundBuffer {
    kind: BufferKind,
    data: Vec<u8>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl OutboundBuffer {
    /// Create an empty buffer not associated with any reserve
    pub fn new(kind: BufferKind) -> Self {
        OutboundBuffer {
            kind,
            data: Vec::new(),
            _permit: None,
        }
    }

    pub(crate) fn with_permit(kind: BufferKind, permit: OwnedSemaphorePermit) -> Self {
        OutboundBuffer {
            kind,
            data: Vec::new(),
            _permit: Some(permit),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }
}

impl Deref for OutboundBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for OutboundBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl fmt::Debug for OutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundBuffer")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The buffer allocator boundary
///
/// An implementation decides how many buffers of each kind exist. The driver states its patience
/// through the [`WaitPolicy`] on every call; an implementation must honor it.
///
/// # Note
/// A [`Blocking`](WaitPolicy::Blocking) take must never resolve to `None`. The driver treats that
/// as a broken allocator contract and aborts.
pub trait BufferReserve {
    /// Take a buffer of the given kind
    ///
    /// Returns `None` when the wait policy expired (or, for
    /// [`NonBlocking`](WaitPolicy::NonBlocking), when no buffer was immediately free).
    fn take(&self, kind: BufferKind, wait: WaitPolicy) -> impl Future<Output = Option<OutboundBuffer>> + Send;
}

/// A semaphore backed buffer reserve
///
/// Event buffers and ACL buffers draw from separate fixed-size pools. A buffer's pool slot is
/// held for the buffer's whole lifetime and returned when the buffer is dropped, so host-side
/// consumption directly gates how fast the receive pipeline can allocate.
#[derive(Clone)]
pub struct PooledBufferReserve {
    events: Arc<Semaphore>,
    acl: Arc<Semaphore>,
}

impl PooledBufferReserve {
    /// Create a reserve with `event_count` event buffers and `acl_count` ACL buffers
    pub fn new(event_count: usize, acl_count: usize) -> Self {
        PooledBufferReserve {
            events: Arc::new(Semaphore::new(event_count)),
            acl: Arc::new(Semaphore::new(acl_count)),
        }
    }

    fn pool(&self, kind: BufferKind) -> &Arc<Semaphore> {
        match kind {
            BufferKind::Event | BufferKind::Command => &self.events,
            BufferKind::AclIn | BufferKind::AclOut => &self.acl,
        }
    }
}

impl BufferReserve for PooledBufferReserve {
    async fn take(&self, kind: BufferKind, wait: WaitPolicy) -> Option<OutboundBuffer> {
        let pool = self.pool(kind).clone();

        let permit = match wait {
            WaitPolicy::Blocking => pool.acquire_owned().await.ok()?,
            WaitPolicy::BoundedWait(duration) => tokio::time::timeout(duration, pool.acquire_owned())
                .await
                .ok()?
                .ok()?,
            WaitPolicy::NonBlocking => pool.try_acquire_owned().ok()?,
        };

        Some(OutboundBuffer::with_permit(kind, permit))
    }
}
