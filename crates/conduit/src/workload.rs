//! The processing body a pod runs for each message.

use async_trait::async_trait;

use crate::message::MessageIn;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct WorkloadError(String);

impl WorkloadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One unit of work. Implementations are shared across every pod of a
/// conduit and may run concurrently, bounded only by the pod count.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Produce the outbound payload for a message. An error moves the pod
    /// into the faulted state; the message is still drained in order.
    async fn run(&self, message: &MessageIn) -> Result<String, WorkloadError>;
}

/// Canonical synthetic workload: holds the slot for the message's
/// processing duration, then echoes the payload.
pub struct DelayWorkload;

#[async_trait]
impl Workload for DelayWorkload {
    async fn run(&self, message: &MessageIn) -> Result<String, WorkloadError> {
        tokio::time::sleep(message.processing()).await;
        Ok(format!("processed: {}", message.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delay_workload_echoes_payload() {
        let message = MessageIn {
            id: 1,
            payload: "hello".to_string(),
            processing_ms: 1,
        };
        let out = DelayWorkload.run(&message).await.unwrap();
        assert_eq!(out, "processed: hello");
    }
}
