use crate::daemon::records::BroadcastEvent;
use crate::util::logging::warn;
use futures_util::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// In-process fan-out channel for freshly persisted locations. The
/// sender lives as long as the bus, so the channel never closes under
/// observer churn; each subscription gets its own bounded buffer and
/// sees every event published after it attached, in publish order.
/// There is no replay for late subscribers.
#[derive(Clone)]
pub struct LocationBus {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl LocationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `event` to every currently attached observer. Returns
    /// the number of observers that received it; publishing with no
    /// observers attached simply drops the event.
    pub fn publish(&self, event: BroadcastEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn observers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocationBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Detach handle for one observer; dropping it detaches without
/// affecting the bus or any other observer.
pub struct Subscription {
    rx: broadcast::Receiver<BroadcastEvent>,
}

impl Subscription {
    /// Next event, or `None` once this observer is finished: either
    /// the bus itself is gone, or the observer lagged past the bus
    /// capacity and is disconnected rather than handed a gapped
    /// sequence.
    pub async fn next(&mut self) -> Option<BroadcastEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("observer lagged by {missed} events; disconnecting");
                None
            }
        }
    }

    /// Stream view with the same lag policy as `next`.
    pub fn into_stream(self) -> impl Stream<Item = BroadcastEvent> {
        BroadcastStream::new(self.rx)
            .take_while(|item| match item {
                Ok(_) => true,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!("observer lagged by {missed} events; disconnecting");
                    false
                }
            })
            .filter_map(|item| item.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::records::{Geometry, LocationProperties, LocationRecord};
    use serde_json::Map;

    fn event(n: u8) -> BroadcastEvent {
        BroadcastEvent::for_location(LocationRecord {
            id: Some(format!("{n:x}")),
            kind: "Feature".to_string(),
            properties: LocationProperties {
                timestamp: None,
                battery_state: None,
                battery_level: None,
                extra: Map::new(),
            },
            geometry: Geometry {
                kind: "Point".to_string(),
                coordinates: [f64::from(n), 0.0],
            },
        })
    }

    #[tokio::test(flavor = "current_thread")]
    async fn all_observers_see_all_events_in_order() {
        let bus = LocationBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        for n in 0..4 {
            assert_eq!(bus.publish(event(n)), 2);
        }

        for sub in [&mut first, &mut second] {
            for n in 0..4 {
                assert_eq!(sub.next().await.unwrap(), event(n));
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn late_subscriber_gets_no_replay() {
        let bus = LocationBus::new(16);
        let mut early = bus.subscribe();
        bus.publish(event(0));
        bus.publish(event(1));

        let mut late = bus.subscribe();
        bus.publish(event(2));

        assert_eq!(early.next().await.unwrap(), event(0));
        assert_eq!(late.next().await.unwrap(), event(2));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn one_disconnect_does_not_affect_others() {
        let bus = LocationBus::new(16);
        let first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(event(0));
        drop(first);
        bus.publish(event(1));

        assert_eq!(second.next().await.unwrap(), event(0));
        assert_eq!(second.next().await.unwrap(), event(1));
        assert_eq!(bus.observers(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn publish_without_observers_drops_event() {
        let bus = LocationBus::new(16);
        assert_eq!(bus.publish(event(0)), 0);
        let mut sub = bus.subscribe();
        bus.publish(event(1));
        assert_eq!(sub.next().await.unwrap(), event(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lagging_observer_is_disconnected_not_stalled() {
        let bus = LocationBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for n in 0..5 {
            bus.publish(event(n));
            // The fast observer keeps draining, the slow one never does.
            assert_eq!(fast.next().await.unwrap(), event(n));
        }

        assert_eq!(slow.next().await, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_view_yields_published_events() {
        let bus = LocationBus::new(16);
        let sub = bus.subscribe();
        bus.publish(event(0));
        bus.publish(event(1));
        drop(bus);

        let stream = sub.into_stream();
        let events: Vec<_> = tokio_stream::StreamExt::collect(stream).await;
        assert_eq!(events, vec![event(0), event(1)]);
    }
}
