//! Claim-check admission gate.
//!
//! Availability is a bounded channel of slot permits, seeded full at
//! construction. A reservation consumes one permit and mints the current
//! claim check; the permit rides inside the ticket and is returned to
//! the channel when the ticket is dropped unused, or by the drain loop
//! once a loaded message's slot has actually been recycled. Only the
//! most recently issued ticket is valid at load time.

use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Proof that a slot reservation was granted. Must be presented, by
/// value, to load a message; issuing a new claim check invalidates all
/// earlier ones.
#[must_use = "a claim check must be presented to load a message"]
pub struct ClaimCheck {
    ticket: Uuid,
    issued_at: DateTime<Utc>,
    permit: SlotPermit,
}

impl ClaimCheck {
    pub fn ticket(&self) -> Uuid {
        self.ticket
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub(crate) fn into_permit(self) -> SlotPermit {
        self.permit
    }
}

/// One admission permit. Returns itself to the gate on drop.
pub(crate) struct SlotPermit {
    slots: mpsc::Sender<()>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        // The channel capacity equals the number of permits in existence,
        // so the return cannot be refused.
        let _ = self.slots.try_send(());
    }
}

pub(crate) struct SlotGate {
    slots_tx: mpsc::Sender<()>,
    slots_rx: Mutex<mpsc::Receiver<()>>,
    current: StdMutex<Option<Uuid>>,
}

impl SlotGate {
    pub(crate) fn new(capacity: usize) -> Self {
        let (slots_tx, slots_rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            let _ = slots_tx.try_send(());
        }
        Self {
            slots_tx,
            slots_rx: Mutex::new(slots_rx),
            current: StdMutex::new(None),
        }
    }

    /// Block until a slot permit is available, then issue the new current
    /// claim check. `None` only if the gate has been torn down.
    pub(crate) async fn reserve(&self) -> Option<ClaimCheck> {
        {
            let mut slots = self.slots_rx.lock().await;
            slots.recv().await?;
        }

        let ticket = Uuid::new_v4();
        *self.current() = Some(ticket);
        tracing::trace!(%ticket, "claim check issued");

        Some(ClaimCheck {
            ticket,
            issued_at: Utc::now(),
            permit: SlotPermit {
                slots: self.slots_tx.clone(),
            },
        })
    }

    /// True only for the most recently issued claim check.
    pub(crate) fn validate(&self, claim: &ClaimCheck) -> bool {
        *self.current() == Some(claim.ticket)
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<Uuid>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn newest_ticket_wins() {
        let gate = SlotGate::new(2);

        let first = gate.reserve().await.unwrap();
        assert!(gate.validate(&first));

        let second = gate.reserve().await.unwrap();
        assert!(!gate.validate(&first));
        assert!(gate.validate(&second));
        assert_ne!(first.ticket(), second.ticket());
    }

    #[tokio::test]
    async fn reserve_blocks_when_exhausted() {
        let gate = SlotGate::new(1);
        let _held = gate.reserve().await.unwrap();

        let blocked = timeout(Duration::from_millis(50), gate.reserve()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn dropped_ticket_frees_its_slot() {
        let gate = SlotGate::new(1);

        let ticket = gate.reserve().await.unwrap();
        drop(ticket);

        let _claim = timeout(Duration::from_millis(100), gate.reserve())
            .await
            .expect("slot freed by drop")
            .unwrap();
    }
}
