//! Message channel boundary for the conduit.
//!
//! The engine never talks to a broker directly: hosts wire it to a
//! `ChannelReader` for inbound work and a `ChannelWriter` for results.
//! Bodies are opaque bytes; encoding belongs to the host. The in-memory
//! broker in [`memory`] is the reference implementation.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{MemoryBroker, MemoryReader, MemoryWriter};

/// Opaque broker-assigned tag identifying one delivery for
/// acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound message as handed to the consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub tag: DeliveryTag,
    pub queue: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Each queue endpoint can be claimed exactly once.
    #[error("channel endpoint for queue {0} already claimed")]
    EndpointClaimed(String),

    #[error("channel is closed")]
    Closed,

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Inbound side of a queue.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    /// Start consuming. Deliveries arrive on the returned channel until
    /// the reader is closed or the writer side hangs up.
    async fn connect(&self) -> Result<mpsc::Receiver<Delivery>, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;

    /// Messages published but not yet handed to the consumer.
    fn pending_count(&self) -> usize;

    fn acknowledge(&self, tag: DeliveryTag) -> Result<(), ChannelError>;
}

/// Outbound side of a queue.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn publish(&self, body: &[u8]) -> Result<(), ChannelError>;

    fn is_available(&self) -> bool;
}
