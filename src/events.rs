//! Live status and log events.
//!
//! ```text
//! Executor → EventHub::publish(event) → [Subscription 1, Subscription 2, ...]
//! ```
//!
//! All runs share one broadcast channel and each [`Subscription`] filters for
//! the run it cares about, so the hub keeps no per-run state. Publishing never
//! waits on subscribers: a subscriber that falls more than the channel capacity
//! behind loses the oldest events and keeps going from there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{LogLine, Run, RunStatus, Stream};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Wire shape: `{"kind": "log"|"status", "run_id", "timestamp", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Log { stream: Stream, content: String },
    Status { status: RunStatus },
}

impl Event {
    pub fn log(line: &LogLine) -> Self {
        Self {
            run_id: line.run_id,
            timestamp: line.timestamp,
            payload: EventPayload::Log {
                stream: line.stream,
                content: line.content.clone(),
            },
        }
    }

    pub fn status(run: &Run) -> Self {
        Self {
            run_id: run.id,
            timestamp: Utc::now(),
            payload: EventPayload::Status { status: run.status },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Log { .. } => "log",
            EventPayload::Status { .. } => "status",
        }
    }

    /// The status carried by a terminal `status` event.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self.payload {
            EventPayload::Status { status } if status.is_terminal() => Some(status),
            _ => None,
        }
    }
}

/// Broadcast relay from executors to live listeners.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Hand the event to every current subscriber. Returns how many there were.
    pub fn publish(&self, event: Event) -> usize {
        // An error only means nobody is listening.
        self.tx.send(event).unwrap_or(0)
    }

    /// Listen from now on. `run_id` restricts delivery to one run.
    pub fn subscribe(&self, run_id: Option<Uuid>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            run_id,
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A live listener. Dropping it unregisters.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    run_id: Option<Uuid>,
    missed: u64,
}

impl Subscription {
    /// Next matching event, or `None` once every hub handle is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.run_id.map_or(true, |id| id == event.run_id) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed += n;
                    tracing::warn!(
                        missed = n,
                        run_id = ?self.run_id,
                        "Subscriber fell behind, dropped oldest events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped because this subscriber lagged.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn unsubscribe(self) {}
}
