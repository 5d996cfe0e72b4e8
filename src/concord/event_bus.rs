//! Per-discussion event fan-out.
//!
//! Every agent utterance, consensus snapshot, user interjection, and terminal
//! event flows through the [`EventBus`] to all current subscribers of that
//! discussion. Delivery is at-most-once over small bounded queues: one slow
//! or dead subscriber is dropped on the spot and never stalls the turn loop
//! or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Everything observers can see, as a closed tagged union.
///
/// Serialises with a `"type"` discriminator; unknown tags fail
/// decoding, which makes them protocol errors rather than something to
/// skip silently. Every variant
/// carries the discussion id and an ISO-8601 timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscussionEvent {
    /// Greeting delivered synchronously to each new subscriber.
    Connected {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        message: String,
    },
    AgentMessage {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        role_name: String,
        backing_model_id: String,
        body: String,
        turn: u32,
    },
    UserMessage {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        body: String,
        user_tag: String,
    },
    ConsensusUpdate {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        reached: bool,
        confidence: f32,
        summary: String,
        agreements: Vec<String>,
        disagreements: Vec<String>,
    },
    DiscussionComplete {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        total_turns: u32,
        consensus_reached: bool,
        final_summary: String,
    },
    DiscussionStopped {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        reason: String,
    },
    Error {
        discussion_id: String,
        timestamp: DateTime<Utc>,
        message: String,
    },
    Keepalive {
        discussion_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl DiscussionEvent {
    pub fn discussion_id(&self) -> &str {
        match self {
            DiscussionEvent::Connected { discussion_id, .. }
            | DiscussionEvent::AgentMessage { discussion_id, .. }
            | DiscussionEvent::UserMessage { discussion_id, .. }
            | DiscussionEvent::ConsensusUpdate { discussion_id, .. }
            | DiscussionEvent::DiscussionComplete { discussion_id, .. }
            | DiscussionEvent::DiscussionStopped { discussion_id, .. }
            | DiscussionEvent::Error { discussion_id, .. }
            | DiscussionEvent::Keepalive { discussion_id, .. } => discussion_id,
        }
    }

    /// True for the events after which no further events may follow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscussionEvent::DiscussionComplete { .. }
                | DiscussionEvent::DiscussionStopped { .. }
                | DiscussionEvent::Error { .. }
        )
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<DiscussionEvent>,
}

/// A subscriber's handle on one discussion's event stream.
///
/// `recv()` returns `None` once the discussion closes (end-of-stream).
/// Dropping the subscription (or calling [`Subscription::cancel`]) detaches
/// it; the bus notices on the next publish.
pub struct Subscription {
    rx: mpsc::Receiver<DiscussionEvent>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<DiscussionEvent> {
        self.rx.recv().await
    }

    /// Stop receiving; already-queued events stay readable via `recv`.
    pub fn cancel(&mut self) {
        self.rx.close();
    }
}

/// Process-wide registry of per-discussion subscriber sets.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    queue_bound: usize,
}

impl EventBus {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            queue_bound,
        }
    }

    /// Register a new subscriber for `discussion_id`.
    ///
    /// The `connected` greeting is placed in the queue before registration
    /// returns, so it precedes any event published afterwards.
    pub async fn subscribe(&self, discussion_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_bound);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let greeting = DiscussionEvent::Connected {
            discussion_id: discussion_id.to_string(),
            timestamp: Utc::now(),
            message: "Connected to discussion".to_string(),
        };
        // Queue capacity is >= 1 and the channel is empty, so this cannot fail.
        let _ = tx.try_send(greeting);

        let mut map = self.subscribers.lock().await;
        map.entry(discussion_id.to_string())
            .or_insert_with(Vec::new)
            .push(Subscriber { id, tx });

        log::info!(
            "concord::event_bus: subscriber {} connected to {} ({} total)",
            id,
            &discussion_id[..discussion_id.len().min(8)],
            map.get(discussion_id).map(|v| v.len()).unwrap_or(0)
        );

        Subscription { rx }
    }

    /// Deliver `event` to every live subscriber of its discussion.
    ///
    /// Uses `try_send`: a full or closed queue marks the subscriber dead and
    /// removes it; the publisher never waits.
    pub async fn publish(&self, event: DiscussionEvent) {
        let discussion_id = event.discussion_id().to_string();
        let mut map = self.subscribers.lock().await;

        let subs = match map.get_mut(&discussion_id) {
            Some(subs) => subs,
            None => return,
        };

        let mut dropped = 0usize;
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "concord::event_bus: dropping subscriber {} of {}: {}",
                    sub.id,
                    &discussion_id[..discussion_id.len().min(8)],
                    e
                );
                dropped += 1;
                false
            }
        });

        if dropped > 0 && subs.is_empty() {
            map.remove(&discussion_id);
        }
    }

    /// Close the discussion's stream: every subscriber observes end-of-stream.
    pub async fn close(&self, discussion_id: &str) {
        let removed = self.subscribers.lock().await.remove(discussion_id);
        if let Some(subs) = removed {
            log::info!(
                "concord::event_bus: closed {} ({} subscribers)",
                &discussion_id[..discussion_id.len().min(8)],
                subs.len()
            );
        }
        // Dropping the senders is the end-of-stream signal.
    }

    /// Process-wide teardown: close every discussion's stream.
    pub async fn shutdown(&self) {
        let mut map = self.subscribers.lock().await;
        let count: usize = map.values().map(|v| v.len()).sum();
        map.clear();
        log::info!("concord::event_bus: shutdown, {} subscribers disconnected", count);
    }

    pub async fn subscriber_count(&self, discussion_id: &str) -> usize {
        self.subscribers
            .lock()
            .await
            .get(discussion_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}
