//! conduit: admission-gated concurrent processing with ordered drain.
//!
//! Producers reserve a slot (a claim check), load exactly one message per
//! reservation, and results are emitted in admission order no matter how
//! the underlying work interleaves. The drain loop blocks on each pod in
//! turn, so a fast message queued behind a slow one waits for it.

mod conduit;
mod config;
mod free_list;
mod gate;
mod message;
mod pod;
mod workload;

pub use conduit::{Conduit, ConduitError};
pub use config::{ConduitConfig, ConfigError};
pub use gate::ClaimCheck;
pub use message::{MessageIn, MessageOut, OUTBOUND_ID_OFFSET, PodIdentity};
pub use pod::{Pod, PodError, PodState};
pub use workload::{DelayWorkload, Workload, WorkloadError};
