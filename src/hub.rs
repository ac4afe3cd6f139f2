use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use crate::models::ProcessedEvent;

/// In-memory broker fanning processed events out to session
/// subscribers, grouped by channel plus an "all" bus.
///
/// Publishing never blocks: each subscriber reads through a bounded
/// broadcast buffer, and a subscriber that falls behind loses its
/// oldest unread events while the hub's lag counter grows. Backpressure
/// never propagates upstream to the pipeline.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    channels: RwLock<HashMap<String, broadcast::Sender<ProcessedEvent>>>,
    all: broadcast::Sender<ProcessedEvent>,
    capacity: usize,
    lagged: AtomicU64,
}

/// Handle for one subscription. Dropping it (or the receiver) is the
/// unsubscribe; senders with no remaining receivers are reaped on the
/// next publish.
pub struct Subscription {
    pub receiver: broadcast::Receiver<ProcessedEvent>,
    /// The subscribed channel; `None` for the all bus.
    #[allow(dead_code)]
    pub channel: Option<String>,
}

impl SessionHub {
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                channels: RwLock::new(HashMap::new()),
                all,
                capacity: capacity.max(1),
                lagged: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to one channel's events.
    #[allow(dead_code)]
    pub fn subscribe(&self, channel_id: &str) -> Subscription {
        let mut channels = self.write_channels();
        let sender = channels
            .entry(channel_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0);
        Subscription {
            receiver: sender.subscribe(),
            channel: Some(channel_id.to_string()),
        }
    }

    /// Subscribe to every channel at once.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            receiver: self.inner.all.subscribe(),
            channel: None,
        }
    }

    /// Publish an event to its channel bus and the all bus. Events are
    /// delivered to each subscriber in publish order per channel.
    pub fn publish(&self, event: ProcessedEvent) {
        let channel_id = event.channel_id.clone();

        let _ = self.inner.all.send(event.clone());

        let stale = {
            let channels = self.read_channels();
            match channels.get(&channel_id) {
                Some(sender) => {
                    let delivered = sender.send(event).unwrap_or(0);
                    delivered == 0 && sender.receiver_count() == 0
                }
                None => false,
            }
        };

        // Reap channels whose last subscriber disconnected.
        if stale {
            let mut channels = self.write_channels();
            if channels
                .get(&channel_id)
                .is_some_and(|s| s.receiver_count() == 0)
            {
                debug!(channel_id, "reaping channel with no subscribers");
                channels.remove(&channel_id);
            }
        }

        metrics::counter!("hub_events_published_total", 1);
    }

    /// Called by session writers when their receiver reports lost
    /// events.
    pub fn note_lag(&self, skipped: u64) {
        self.inner.lagged.fetch_add(skipped, Ordering::Relaxed);
        metrics::counter!("hub_events_dropped_total", skipped);
    }

    pub fn lagged_total(&self) -> u64 {
        self.inner.lagged.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        let per_channel: usize = self
            .read_channels()
            .values()
            .map(|s| s.receiver_count())
            .sum();
        per_channel + self.inner.all.receiver_count()
    }

    fn read_channels(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, broadcast::Sender<ProcessedEvent>>> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_channels(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, broadcast::Sender<ProcessedEvent>>> {
        self.inner
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
