//! Machine event bus
//!
//! Events are broadcast to live subscribers and kept in a bounded backlog so
//! a late subscriber can ask for the most recent ones (`tail`). Taking the
//! backlog snapshot and subscribing happen under the same lock as publishing,
//! so a subscriber sees neither gaps nor duplicates between the two.

use chrono::Utc;
use futures::Stream;
use nodeplane_core::{ActorId, EventPayload, MachineEvent, MachineStage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{trace, warn};

const DEFAULT_BACKLOG: usize = 1024;

struct Inner {
    tx: broadcast::Sender<MachineEvent>,
    backlog: Mutex<Backlog>,
    capacity: usize,
}

struct Backlog {
    next_id: u64,
    events: VecDeque<MachineEvent>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                tx,
                backlog: Mutex::new(Backlog {
                    next_id: 1,
                    events: VecDeque::with_capacity(capacity),
                }),
                capacity,
            }),
        }
    }

    pub fn publish(&self, actor_id: Option<&ActorId>, payload: EventPayload) -> MachineEvent {
        let mut backlog = self
            .inner
            .backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = MachineEvent {
            id: backlog.next_id,
            actor_id: actor_id.cloned(),
            timestamp: Utc::now(),
            payload,
        };
        backlog.next_id += 1;
        if backlog.events.len() == self.inner.capacity {
            backlog.events.pop_front();
        }
        backlog.events.push_back(event.clone());
        // no receivers is fine
        let _ = self.inner.tx.send(event.clone());
        trace!(id = event.id, "machine event published");
        event
    }

    pub fn status(&self, stage: MachineStage, ready: bool) -> MachineEvent {
        self.publish(None, EventPayload::MachineStatus { stage, ready })
    }

    /// The last `tail` events plus a receiver for everything after them.
    pub fn subscribe(&self, tail: usize) -> (Vec<MachineEvent>, broadcast::Receiver<MachineEvent>) {
        let backlog = self
            .inner
            .backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = backlog.events.len().saturating_sub(tail);
        let recent = backlog.events.iter().skip(skip).cloned().collect();
        (recent, self.inner.tx.subscribe())
    }

    /// Event stream starting with the last `tail` events. Lagging subscribers
    /// skip what they missed; the stream ends when the bus is gone.
    pub fn stream(&self, tail: usize) -> impl Stream<Item = MachineEvent> + Send + 'static {
        let (recent, mut rx) = self.subscribe(tail);
        async_stream::stream! {
            for event in recent {
                yield event;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event subscriber lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Most recent machine status, if any was published.
    pub fn last_status(&self) -> Option<(MachineStage, bool)> {
        let backlog = self
            .inner
            .backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        backlog.events.iter().rev().find_map(|e| match e.payload {
            EventPayload::MachineStatus { stage, ready } => Some((stage, ready)),
            _ => None,
        })
    }
}
