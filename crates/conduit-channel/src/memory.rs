//! In-memory broker: named queues over framed duplex pipes.
//!
//! Each queue is one `tokio::io::duplex` byte pipe with length-delimited
//! frames, so the wire discipline matches a real broker connection
//! (bounded buffering, backpressure on publish, EOF on writer close).
//! Endpoints are claimable once per queue.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{ChannelError, ChannelReader, ChannelWriter, Delivery, DeliveryTag};

const PIPE_CAPACITY: usize = 64 * 1024;
const DELIVERY_BUFFER: usize = 64;

struct QueueEntry {
    write_end: Option<DuplexStream>,
    read_end: Option<DuplexStream>,
    pending: Arc<AtomicUsize>,
}

impl QueueEntry {
    fn new() -> Self {
        let (write_end, read_end) = tokio::io::duplex(PIPE_CAPACITY);
        Self {
            write_end: Some(write_end),
            read_end: Some(read_end),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Broker with named queues. The factory for reader/writer endpoints.
#[derive(Default)]
pub struct MemoryBroker {
    queues: DashMap<String, QueueEntry>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self, queue: &str) -> Result<MemoryWriter, ChannelError> {
        let mut entry = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueEntry::new);
        let end = entry
            .write_end
            .take()
            .ok_or_else(|| ChannelError::EndpointClaimed(queue.to_string()))?;

        Ok(MemoryWriter {
            queue: queue.to_string(),
            framed: Mutex::new(FramedWrite::new(end, LengthDelimitedCodec::new())),
            pending: Arc::clone(&entry.pending),
            open: AtomicBool::new(true),
        })
    }

    pub fn reader(&self, queue: &str) -> Result<MemoryReader, ChannelError> {
        let mut entry = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueEntry::new);
        let end = entry
            .read_end
            .take()
            .ok_or_else(|| ChannelError::EndpointClaimed(queue.to_string()))?;

        Ok(MemoryReader {
            queue: queue.to_string(),
            read_end: StdMutex::new(Some(end)),
            pending: Arc::clone(&entry.pending),
            unacked: Arc::new(DashMap::new()),
            pump: StdMutex::new(None),
        })
    }
}

pub struct MemoryWriter {
    queue: String,
    framed: Mutex<FramedWrite<DuplexStream, LengthDelimitedCodec>>,
    pending: Arc<AtomicUsize>,
    open: AtomicBool,
}

impl MemoryWriter {
    /// Flush and hang up. The reader side sees EOF once buffered frames
    /// are drained.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.framed.lock().await.close().await?;
            tracing::debug!(queue = %self.queue, "writer closed");
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelWriter for MemoryWriter {
    async fn publish(&self, body: &[u8]) -> Result<(), ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Closed);
        }

        // Count before the frame hits the pipe: the reader may consume it
        // immediately.
        self.pending.fetch_add(1, Ordering::AcqRel);
        let mut framed = self.framed.lock().await;
        if let Err(e) = framed.send(Bytes::copy_from_slice(body)).await {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(e.into());
        }

        tracing::trace!(queue = %self.queue, bytes = body.len(), "published");
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

pub struct MemoryReader {
    queue: String,
    read_end: StdMutex<Option<DuplexStream>>,
    pending: Arc<AtomicUsize>,
    unacked: Arc<DashMap<u64, ()>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ChannelReader for MemoryReader {
    async fn connect(&self) -> Result<mpsc::Receiver<Delivery>, ChannelError> {
        let end = lock(&self.read_end).take().ok_or(ChannelError::Closed)?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let mut framed = FramedRead::new(end, LengthDelimitedCodec::new());
        let pending = Arc::clone(&self.pending);
        let unacked = Arc::clone(&self.unacked);
        let queue = self.queue.clone();

        let handle = tokio::spawn(async move {
            let mut tag = 0u64;
            while let Some(frame) = framed.next().await {
                match frame {
                    Ok(body) => {
                        tag += 1;
                        unacked.insert(tag, ());
                        // Off the wire: no longer pending at the broker.
                        pending.fetch_sub(1, Ordering::AcqRel);
                        let delivery = Delivery {
                            body: body.freeze(),
                            tag: DeliveryTag::new(tag),
                            queue: queue.clone(),
                        };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "frame decode failed");
                        break;
                    }
                }
            }
            tracing::debug!(queue = %queue, "delivery pump exiting");
        });

        *lock(&self.pump) = Some(handle);
        tracing::debug!(queue = %self.queue, "reader connected");
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        lock(&self.read_end).take();
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
        if !self.unacked.is_empty() {
            tracing::warn!(
                queue = %self.queue,
                outstanding = self.unacked.len(),
                "closing with unacknowledged deliveries"
            );
        }
        tracing::debug!(queue = %self.queue, "reader closed");
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn acknowledge(&self, tag: DeliveryTag) -> Result<(), ChannelError> {
        self.unacked
            .remove(&tag.raw())
            .map(|_| ())
            .ok_or(ChannelError::UnknownDeliveryTag(tag))
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_deliver() {
        let broker = MemoryBroker::new();
        let writer = broker.writer("work").unwrap();
        let reader = broker.reader("work").unwrap();

        writer.publish(b"hello").await.unwrap();
        assert_eq!(reader.pending_count(), 1);

        let mut deliveries = reader.connect().await.unwrap();
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(&delivery.body[..], b"hello");
        assert_eq!(delivery.queue, "work");
        assert_eq!(reader.pending_count(), 0);
    }

    #[tokio::test]
    async fn acknowledge_is_tracked_per_tag() {
        let broker = MemoryBroker::new();
        let writer = broker.writer("work").unwrap();
        let reader = broker.reader("work").unwrap();

        writer.publish(b"one").await.unwrap();
        let mut deliveries = reader.connect().await.unwrap();
        let delivery = deliveries.recv().await.unwrap();

        reader.acknowledge(delivery.tag).unwrap();
        let err = reader.acknowledge(delivery.tag).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownDeliveryTag(_)));
    }

    #[tokio::test]
    async fn endpoints_claimable_once() {
        let broker = MemoryBroker::new();
        let _writer = broker.writer("work").unwrap();
        assert!(matches!(
            broker.writer("work"),
            Err(ChannelError::EndpointClaimed(_))
        ));

        let _reader = broker.reader("work").unwrap();
        assert!(matches!(
            broker.reader("work"),
            Err(ChannelError::EndpointClaimed(_))
        ));
    }

    #[tokio::test]
    async fn writer_close_ends_the_delivery_stream() {
        let broker = MemoryBroker::new();
        let writer = broker.writer("work").unwrap();
        let reader = broker.reader("work").unwrap();

        writer.publish(b"last").await.unwrap();
        writer.close().await.unwrap();
        assert!(!writer.is_available());
        assert!(matches!(
            writer.publish(b"late").await,
            Err(ChannelError::Closed)
        ));

        let mut deliveries = reader.connect().await.unwrap();
        // Buffered frame still arrives, then the stream ends.
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(&delivery.body[..], b"last");
        assert!(deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_reader_cannot_reconnect() {
        let broker = MemoryBroker::new();
        let reader = broker.reader("work").unwrap();

        reader.close().await.unwrap();
        assert!(matches!(reader.connect().await, Err(ChannelError::Closed)));
    }
}
