//! Pod: a single worker slot with a linear lifecycle.
//!
//! `WaitingToLoad → Loading → Running → ReadyToUnload → WaitingToLoad`,
//! with `Faulted` standing in for `ReadyToUnload` when the workload
//! errors. The state lives in a watch channel: transitions are
//! compare-and-swapped under the channel's lock and completion waits are
//! race-free and idempotent.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use crate::message::{MessageIn, MessageOut, PodIdentity};
use crate::workload::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    WaitingToLoad,
    Loading,
    Running,
    ReadyToUnload,
    Faulted,
}

impl PodState {
    /// True once the drain loop may take the result out.
    pub fn is_unloadable(&self) -> bool {
        matches!(self, Self::ReadyToUnload | Self::Faulted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingToLoad => "waiting_to_load",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::ReadyToUnload => "ready_to_unload",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PodError {
    /// The pod was asked to start while holding earlier work: a dispatch
    /// logic bug, not a runtime condition.
    #[error("pod {pod} cannot load a message in state {state}")]
    NotIdle { pod: String, state: PodState },
}

pub struct Pod {
    instance: Uuid,
    index: Option<usize>,
    state: watch::Sender<PodState>,
    result: StdMutex<Option<MessageOut>>,
    last_execution: StdMutex<Duration>,
    workload: Arc<dyn Workload>,
}

impl Pod {
    /// A pod with a stable slot index, built once and recycled through
    /// the free-list.
    pub fn pooled(index: usize, workload: Arc<dyn Workload>) -> Arc<Self> {
        Arc::new(Self {
            instance: Uuid::new_v4(),
            index: Some(index),
            state: watch::Sender::new(PodState::WaitingToLoad),
            result: StdMutex::new(None),
            last_execution: StdMutex::new(Duration::ZERO),
            workload,
        })
    }

    /// A throwaway pod serving a single message.
    pub fn ephemeral(workload: Arc<dyn Workload>) -> Arc<Self> {
        Arc::new(Self {
            instance: Uuid::new_v4(),
            index: None,
            state: watch::Sender::new(PodState::WaitingToLoad),
            result: StdMutex::new(None),
            last_execution: StdMutex::new(Duration::ZERO),
            workload,
        })
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn identity(&self) -> PodIdentity {
        PodIdentity {
            instance: self.instance,
            index: self.index,
        }
    }

    pub fn state(&self) -> PodState {
        *self.state.borrow()
    }

    /// Wall time of the most recent processing run.
    pub fn last_execution(&self) -> Duration {
        *lock(&self.last_execution)
    }

    /// Source id of the message currently held, or 0 when empty.
    pub fn current_message_id(&self) -> u64 {
        lock(&self.result)
            .as_ref()
            .map(|out| out.source_message_id)
            .unwrap_or(0)
    }

    /// Accept a message and run it on its own task. Only legal while the
    /// pod is idle.
    pub fn start(self: &Arc<Self>, message: MessageIn) -> Result<(), PodError> {
        let admitted = self.state.send_if_modified(|state| {
            if *state == PodState::WaitingToLoad {
                *state = PodState::Loading;
                true
            } else {
                false
            }
        });
        if !admitted {
            return Err(PodError::NotIdle {
                pod: self.to_string(),
                state: self.state(),
            });
        }

        let pod = Arc::clone(self);
        tokio::spawn(async move { pod.process(message).await });
        Ok(())
    }

    async fn process(self: Arc<Self>, message: MessageIn) {
        let started = Instant::now();
        self.state.send_replace(PodState::Running);

        // Identity and source id are fixed before the work runs; only the
        // payload (or error) is filled in afterwards.
        let mut out = MessageOut::from_source(&message, self.identity());

        tracing::debug!(
            pod = %self,
            message = message.id,
            processing_ms = message.processing_ms,
            "processing started"
        );

        let next = match self.workload.run(&message).await {
            Ok(payload) => {
                out.payload = payload;
                PodState::ReadyToUnload
            }
            Err(e) => {
                tracing::warn!(pod = %self, message = message.id, error = %e, "workload failed");
                out.error = Some(e.to_string());
                PodState::Faulted
            }
        };

        *lock(&self.last_execution) = started.elapsed();
        // The result must be in place before the state flip releases any
        // waiter.
        *lock(&self.result) = Some(out);
        self.state.send_replace(next);

        tracing::debug!(pod = %self, state = %next, "processing complete");
    }

    /// Block until this pod's work is unloadable. Returns immediately if
    /// it already is.
    pub async fn wait_ready(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives on self, so this cannot fail.
        let _ = rx.wait_for(|state| state.is_unloadable()).await;
    }

    /// Hand the result to the caller and reset the pod for reuse. An
    /// empty pod is tolerated with a warning.
    pub fn unload(&self) -> Option<MessageOut> {
        let out = lock(&self.result).take();
        if out.is_none() {
            tracing::warn!(pod = %self, "no message to unload");
        }
        self.state.send_replace(PodState::WaitingToLoad);
        out
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{index}:{}", self.state()),
            None => {
                let id = self.instance.simple().to_string();
                write!(f, "{}:{}", &id[..8], self.state())
            }
        }
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
    use crate::message::OUTBOUND_ID_OFFSET;
    use crate::workload::{DelayWorkload, WorkloadError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FailingWorkload;

    #[async_trait]
    impl Workload for FailingWorkload {
        async fn run(&self, _message: &MessageIn) -> Result<String, WorkloadError> {
            Err(WorkloadError::new("boom"))
        }
    }

    fn message(id: u64, processing_ms: u64) -> MessageIn {
        MessageIn {
            id,
            payload: id.to_string(),
            processing_ms,
        }
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let pod = Pod::pooled(0, Arc::new(DelayWorkload));
        assert_eq!(pod.state(), PodState::WaitingToLoad);
        assert_eq!(pod.current_message_id(), 0);

        pod.start(message(7, 10)).unwrap();
        pod.wait_ready().await;

        assert_eq!(pod.state(), PodState::ReadyToUnload);
        assert_eq!(pod.current_message_id(), 7);

        let out = pod.unload().expect("result present");
        assert_eq!(out.id, 7 + OUTBOUND_ID_OFFSET);
        assert_eq!(out.source_message_id, 7);
        assert_eq!(out.payload, "processed: 7");
        assert_eq!(out.processed_by.index, Some(0));
        assert_eq!(out.processed_by.instance, pod.instance());

        assert_eq!(pod.state(), PodState::WaitingToLoad);
        assert_eq!(pod.current_message_id(), 0);
        assert!(pod.last_execution() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn start_requires_idle_pod() {
        let pod = Pod::pooled(1, Arc::new(DelayWorkload));
        pod.start(message(1, 100)).unwrap();

        let err = pod.start(message(2, 100)).unwrap_err();
        assert!(matches!(err, PodError::NotIdle { .. }));
    }

    #[tokio::test]
    async fn wait_ready_is_idempotent() {
        let pod = Pod::ephemeral(Arc::new(DelayWorkload));
        pod.start(message(3, 5)).unwrap();

        pod.wait_ready().await;
        timeout(Duration::from_millis(100), pod.wait_ready())
            .await
            .expect("second wait returns immediately");
    }

    #[tokio::test]
    async fn unload_of_empty_pod_is_tolerated() {
        let pod = Pod::pooled(0, Arc::new(DelayWorkload));
        assert!(pod.unload().is_none());
        assert_eq!(pod.state(), PodState::WaitingToLoad);
    }

    #[tokio::test]
    async fn failed_workload_faults_the_pod_but_still_drains() {
        let pod = Pod::ephemeral(Arc::new(FailingWorkload));
        pod.start(message(9, 0)).unwrap();
        pod.wait_ready().await;

        assert_eq!(pod.state(), PodState::Faulted);
        let out = pod.unload().expect("faulted result still unloads");
        assert_eq!(out.source_message_id, 9);
        assert_eq!(out.error.as_deref(), Some("boom"));
        assert_eq!(pod.state(), PodState::WaitingToLoad);
    }
}
