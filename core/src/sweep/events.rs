use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

use crate::prelude::FaultKind;
use crate::records::SpectrumFrame;
use crate::sweep::config::CycleConfig;
use crate::sweep::state::{StateChange, SweepStatus};

/// Classified failure pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepFault {
    pub kind: FaultKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SweepFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SweepEvent {
    Spectrum(Arc<SpectrumFrame>),
    Status(SweepStatus),
    CycleConfig(CycleConfig),
    StatusChange(StateChange),
    Error(SweepFault),
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SweepEvent>,
}

/// Push fan-out to a dynamic set of subscribers.
///
/// Each subscriber owns a bounded channel. `publish` awaits delivery to every
/// subscriber in turn, so a subscriber whose channel is full holds up the ones
/// after it: receivers must drain promptly or forward into their own queue.
/// The wait per subscriber is capped by the delivery timeout; a subscriber
/// that misses it is detached and its stream ends once drained.
/// Ordering is FIFO per subscriber only.
pub struct EventBus {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
    delivery_timeout: Duration,
}

impl EventBus {
    pub fn new(capacity: usize, delivery_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            delivery_timeout,
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.swap(|current| {
            let mut next = current.to_vec();
            next.push(Subscriber { id, tx: tx.clone() });
            next
        });
        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Delivers `event` to every current subscriber; returns how many received it.
    pub async fn publish(&self, event: SweepEvent) -> usize {
        let subscribers = self.snapshot();
        let mut delivered = 0;
        let mut detached = Vec::new();
        for subscriber in subscribers.iter() {
            match subscriber
                .tx
                .send_timeout(event.clone(), self.delivery_timeout)
                .await
            {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    log::warn!(
                        "detaching subscriber {}: no room for {} ms",
                        subscriber.id,
                        self.delivery_timeout.as_millis()
                    );
                    detached.push(subscriber.id);
                }
                Err(SendTimeoutError::Closed(_)) => detached.push(subscriber.id),
            }
        }
        self.remove_all(&detached);
        delivered
    }

    /// Delivers `event` without waiting; a subscriber with a full channel is
    /// detached instead of being waited on.
    pub fn notify(&self, event: SweepEvent) -> usize {
        let subscribers = self.snapshot();
        let mut delivered = 0;
        let mut detached = Vec::new();
        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("detaching subscriber {}: channel full", subscriber.id);
                    detached.push(subscriber.id);
                }
                Err(TrySendError::Closed(_)) => detached.push(subscriber.id),
            }
        }
        self.remove_all(&detached);
        delivered
    }

    fn remove_all(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        self.swap(|current| {
            current
                .iter()
                .filter(|subscriber| !ids.contains(&subscriber.id))
                .cloned()
                .collect()
        });
    }

    fn remove(&self, id: u64) {
        self.swap(|current| {
            current
                .iter()
                .filter(|subscriber| subscriber.id != id)
                .cloned()
                .collect()
        });
    }

    fn snapshot(&self) -> Arc<Vec<Subscriber>> {
        match self.subscribers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, build: impl FnOnce(&[Subscriber]) -> Vec<Subscriber>) {
        let mut guard = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = build(guard.as_slice());
        *guard = Arc::new(next);
    }
}

/// Receiving end of a subscription; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<SweepEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<SweepEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SweepEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
