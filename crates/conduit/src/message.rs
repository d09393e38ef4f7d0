//! Message types flowing through the conduit.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound ids are derived from the source id by a fixed offset.
pub const OUTBOUND_ID_OFFSET: u64 = 10_000;

/// A unit of work. Ids are caller-assigned and expected to form a
/// contiguous ascending sequence across the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIn {
    pub id: u64,
    pub payload: String,
    /// Simulated (or real) processing cost in milliseconds.
    pub processing_ms: u64,
}

impl MessageIn {
    pub fn processing(&self) -> Duration {
        Duration::from_millis(self.processing_ms)
    }
}

impl fmt::Display for MessageIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.id, self.payload)
    }
}

/// Identity of the pod that produced a result. The slot index is only
/// present when pods are pooled and recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodIdentity {
    pub instance: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// A processed result as it leaves the conduit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOut {
    pub id: u64,
    pub source_message_id: u64,
    pub payload: String,
    /// Echoes the processing cost the message asked for; the measured
    /// wall time lives on the pod.
    pub runtime_ms: u64,
    pub processed_by: PodIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageOut {
    /// Skeleton result for a message entering a pod. Identity fields are
    /// fixed here, before any of the work has run; the payload (or error)
    /// is filled in when the work finishes.
    pub(crate) fn from_source(message: &MessageIn, processed_by: PodIdentity) -> Self {
        Self {
            id: message.id + OUTBOUND_ID_OFFSET,
            source_message_id: message.id,
            payload: String::new(),
            runtime_ms: message.processing_ms,
            processed_by,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for MessageOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageOut:{:05}:{:05}:{}",
            self.id, self.source_message_id, self.payload
        )
    }
}
