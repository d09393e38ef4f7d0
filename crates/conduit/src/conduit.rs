//! The conduit engine: admission, dispatch, and the ordered drain loop.
//!
//! Flow:
//! 1. A producer reserves a slot (`wait_for_slot`) and gets a claim check
//! 2. `load_message` validates the claim check, assigns a pod, starts the
//!    work, and enqueues the pod on the in-flight channel
//! 3. The drain task consumes the in-flight channel in admission order,
//!    blocking on each pod in turn, and fans the result out to listeners
//! 4. `stop` drains everything admitted before the call, then returns
//!
//! The drain task is the single consumer of the in-flight channel and
//! waits for the head pod before touching the next, so emission order
//! equals admission order no matter when each pod actually finishes.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{ConduitConfig, ConfigError};
use crate::free_list::FreeList;
use crate::gate::{ClaimCheck, SlotGate, SlotPermit};
use crate::message::{MessageIn, MessageOut};
use crate::pod::{Pod, PodError};
use crate::workload::{DelayWorkload, Workload};

#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    /// The presented claim check is not the most recently issued one:
    /// the producer loaded without re-reserving.
    #[error("invalid claim check")]
    InvalidTicket,

    /// The free-list was empty despite a granted reservation. The gate
    /// makes this unreachable; seeing it means the admission protocol
    /// was bypassed.
    #[error("no idle pod available despite a granted reservation")]
    NoIdlePod,

    /// The engine has been stopped.
    #[error("conduit is stopped")]
    Stopped,

    #[error(transparent)]
    Pod(#[from] PodError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

type Listener = Box<dyn Fn(&MessageOut) + Send>;
type Listeners = Arc<StdMutex<Vec<Listener>>>;

/// A pod travelling the conduit together with the admission permit it
/// was loaded under. Dropping the permit reopens the gate.
struct InFlight {
    pod: Arc<Pod>,
    permit: SlotPermit,
}

pub struct Conduit {
    config: ConduitConfig,
    workload: Arc<dyn Workload>,
    /// Fixed pool, empty when pods are built per message.
    pods: Vec<Arc<Pod>>,
    free_list: Option<Arc<FreeList>>,
    gate: SlotGate,
    inflight_tx: mpsc::Sender<InFlight>,
    in_flight: Arc<AtomicUsize>,
    listeners: Listeners,
    shutdown_tx: watch::Sender<bool>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Conduit {
    /// Build an engine around the canonical delay workload. Must be
    /// called from within a tokio runtime: the drain task starts here.
    pub fn new(config: ConduitConfig) -> Result<Self, ConduitError> {
        Self::with_workload(config, Arc::new(DelayWorkload))
    }

    pub fn with_workload(
        config: ConduitConfig,
        workload: Arc<dyn Workload>,
    ) -> Result<Self, ConduitError> {
        config.validate()?;

        let gate = SlotGate::new(config.pod_count);
        let (inflight_tx, inflight_rx) = mpsc::channel(config.pod_count);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let listeners: Listeners = Arc::new(StdMutex::new(Vec::new()));

        let (pods, free_list) = if config.reuse_pods {
            let pods: Vec<_> = (0..config.pod_count)
                .map(|index| Pod::pooled(index, Arc::clone(&workload)))
                .collect();
            let free_list = Arc::new(FreeList::new(config.pod_count));
            for index in 0..config.pod_count {
                free_list.release(index);
            }
            (pods, Some(free_list))
        } else {
            (Vec::new(), None)
        };

        tracing::debug!(
            pod_count = config.pod_count,
            reuse_pods = config.reuse_pods,
            "conduit starting"
        );

        let drain = DrainLoop {
            inflight_rx,
            shutdown_rx,
            free_list: free_list.clone(),
            in_flight: Arc::clone(&in_flight),
            listeners: Arc::clone(&listeners),
        };
        let handle = tokio::spawn(drain.run());

        Ok(Self {
            config,
            workload,
            pods,
            free_list,
            gate,
            inflight_tx,
            in_flight,
            listeners,
            shutdown_tx,
            drain: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.config
    }

    /// True iff nothing is currently travelling the conduit.
    pub fn is_empty(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    /// Block until a processing slot is available, then issue a claim
    /// check for it. The claim check must accompany the next
    /// `load_message`; issuing a new one invalidates it.
    pub async fn wait_for_slot(&self) -> Result<ClaimCheck, ConduitError> {
        self.gate.reserve().await.ok_or(ConduitError::Stopped)
    }

    /// Load one message under a previously granted reservation: assign a
    /// pod, start the work, and enqueue the pod for the drain loop.
    pub async fn load_message(
        &self,
        claim: ClaimCheck,
        message: MessageIn,
    ) -> Result<(), ConduitError> {
        if !self.gate.validate(&claim) {
            // The stale claim's permit returns to the gate on drop; the
            // reservation it displaced is unaffected.
            return Err(ConduitError::InvalidTicket);
        }
        let permit = claim.into_permit();

        tracing::debug!(message = message.id, "loading message");

        let pod = match &self.free_list {
            Some(free_list) => {
                let index = free_list.try_pop().ok_or(ConduitError::NoIdlePod)?;
                tracing::debug!(pod = index, "next pod up");
                Arc::clone(&self.pods[index])
            }
            None => Pod::ephemeral(Arc::clone(&self.workload)),
        };

        if let Err(e) = pod.start(message) {
            // Put the slot back before surfacing the dispatch bug.
            if let (Some(free_list), Some(index)) = (&self.free_list, pod.index()) {
                free_list.release(index);
            }
            return Err(e.into());
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self
            .inflight_tx
            .send(InFlight { pod, permit })
            .await
            .is_err()
        {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(ConduitError::Stopped);
        }

        tracing::debug!(
            in_flight = self.in_flight.load(Ordering::Acquire),
            "pods in conduit"
        );
        Ok(())
    }

    /// Stop the engine. Producers must have stopped reserving and loading
    /// first; every message admitted before this call is fully drained
    /// and its completion event fired before this returns. Idempotent.
    pub async fn stop(&self) {
        let handle = self.drain.lock().await.take();
        let Some(handle) = handle else {
            tracing::debug!("stop called on an already stopped conduit");
            return;
        };

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "drain task failed");
        }
        tracing::info!("conduit stop complete");
    }

    /// Register a completion listener. Listeners run synchronously on the
    /// drain task, exactly once per admitted message, in admission order,
    /// and must not block for long: a stalled listener stalls every
    /// future drain.
    pub fn on_message_ready<F>(&self, listener: F)
    where
        F: Fn(&MessageOut) + Send + 'static,
    {
        lock(&self.listeners).push(Box::new(listener));
    }

    /// Channel-flavored completion listener: every drained result is
    /// forwarded to the returned receiver, in admission order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MessageOut> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_message_ready(move |out| {
            let _ = tx.send(out.clone());
        });
        rx
    }
}

struct DrainLoop {
    inflight_rx: mpsc::Receiver<InFlight>,
    shutdown_rx: watch::Receiver<bool>,
    free_list: Option<Arc<FreeList>>,
    in_flight: Arc<AtomicUsize>,
    listeners: Listeners,
}

impl DrainLoop {
    async fn run(mut self) {
        tracing::info!("drain loop starting");

        loop {
            tokio::select! {
                biased;

                entry = self.inflight_rx.recv() => match entry {
                    Some(entry) => self.drain_one(entry).await,
                    None => break,
                },

                _ = self.shutdown_rx.changed() => {
                    // Everything admitted before the stop signal is
                    // already on the channel; finish it before exiting.
                    while let Ok(entry) = self.inflight_rx.try_recv() {
                        self.drain_one(entry).await;
                    }
                    break;
                }
            }
        }

        tracing::info!("drain loop exiting");
    }

    async fn drain_one(&self, entry: InFlight) {
        let InFlight { pod, permit } = entry;

        // Head-of-line blocking: later pods may already be done, but this
        // one defines the emission order.
        pod.wait_ready().await;

        tracing::info!(
            pod = %pod,
            message = pod.current_message_id(),
            elapsed_ms = pod.last_execution().as_millis() as u64,
            "message completed"
        );

        if let Some(out) = pod.unload() {
            self.notify(&out);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        // Repopulate the free-list before the permit reopens the gate, so
        // a woken producer always finds an idle pod.
        if let (Some(free_list), Some(index)) = (&self.free_list, pod.index()) {
            free_list.release(index);
        }
        drop(permit);
    }

    fn notify(&self, out: &MessageOut) {
        for listener in lock(&self.listeners).iter() {
            listener(out);
        }
    }
}

fn lock(listeners: &Listeners) -> std::sync::MutexGuard<'_, Vec<Listener>> {
    match listeners.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
