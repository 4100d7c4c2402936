//! Inbound event source port.
//!
//! The engine's intake worker subscribes once and offers every envelope to
//! the correlation engine. `BroadcastEventSource` is the in-process source
//! backed by a `tokio::sync::broadcast` channel.

use std::pin::Pin;

use futures_util::Stream;
use tokio::sync::broadcast;
use waypost_types::correlation::EventEnvelope;

pub type EventStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send + 'static>>;

/// Supplies inbound events.
pub trait EventSource: Send + Sync {
    /// Subscribe to events.
    ///
    /// `type_hint` lists the event types some registration currently waits
    /// for; sources may use it to filter upstream and are free to ignore it.
    fn subscribe(&self, type_hint: Option<Vec<String>>) -> EventStream;
}

#[derive(Clone)]
pub struct BroadcastEventSource {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventSource {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; returns the number of subscribers that will see it.
    pub fn publish(&self, event: EventEnvelope) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl EventSource for BroadcastEventSource {
    fn subscribe(&self, type_hint: Option<Vec<String>>) -> EventStream {
        let mut receiver = self.sender.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let wanted = type_hint
                            .as_ref()
                            .is_none_or(|types| types.iter().any(|t| *t == event.event_type));
                        if wanted {
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event source lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for BroadcastEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEventSource")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_sees_hinted_types_only() {
        let source = BroadcastEventSource::new(8);
        let mut stream = source.subscribe(Some(vec!["order.paid".to_string()]));

        source.publish(EventEnvelope::new("1", "/t", "order.created", json!({})));
        source.publish(EventEnvelope::new("2", "/t", "order.paid", json!({})));

        let first = stream.next().await.unwrap();
        assert_eq!(first.id, "2");
    }

    #[tokio::test]
    async fn stream_ends_when_source_dropped() {
        let source = BroadcastEventSource::new(8);
        let mut stream = source.subscribe(None);
        source.publish(EventEnvelope::new("1", "/t", "x", json!(null)));
        drop(source);

        assert_eq!(stream.next().await.map(|e| e.id), Some("1".to_string()));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let source = BroadcastEventSource::new(1);
        assert_eq!(source.publish(EventEnvelope::new("1", "/t", "x", json!(null))), 0);
    }
}
