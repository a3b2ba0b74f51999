//! Connection Status Publisher
//!
//! Mirrors connection lifecycle events onto the bus `connection:*` topics.
//! Market data events are ignored here; the multiplexer routes those.

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::bus::{EventBus, topics};
use crate::infrastructure::feed::ConnectionEvent;

const SOURCE: &str = "connection";

/// Publishes connection lifecycle events on the bus.
#[derive(Debug, Clone)]
pub struct ConnectionStatusPublisher {
    bus: EventBus,
}

impl ConnectionStatusPublisher {
    /// Create a publisher on `bus`.
    #[must_use]
    pub const fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publish one event. Returns false for events without a status topic.
    pub fn publish(&self, event: &ConnectionEvent) -> bool {
        let Some((topic, payload)) = status_of(event) else {
            return false;
        };
        self.bus.publish(topic, payload, Some(SOURCE));
        true
    }

    /// Forward events until cancelled or the manager is dropped.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        self.publish(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Status publisher lagged behind connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

fn status_of(event: &ConnectionEvent) -> Option<(&'static str, Value)> {
    match event {
        ConnectionEvent::Connected => Some((topics::CONNECTION_CONNECTED, json!({}))),
        ConnectionEvent::Disconnected { reason } => Some((
            topics::CONNECTION_DISCONNECTED,
            json!({ "reason": reason }),
        )),
        ConnectionEvent::Reconnecting { attempt, delay } => Some((
            topics::CONNECTION_RECONNECTING,
            json!({ "attempt": attempt, "delayMs": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) }),
        )),
        ConnectionEvent::Error(message) => {
            Some((topics::CONNECTION_ERROR, json!({ "message": message })))
        }
        ConnectionEvent::MaxReconnectAttemptsReached { attempts } => Some((
            topics::CONNECTION_ERROR,
            json!({ "message": "max reconnect attempts reached", "attempts": attempts, "fatal": true }),
        )),
        ConnectionEvent::PriceUpdate(_)
        | ConnectionEvent::DepthUpdate(_)
        | ConnectionEvent::OhlcUpdate(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::market::PriceTick;
    use crate::infrastructure::bus::BusEvent;

    fn capture(bus: &EventBus) -> Arc<Mutex<Vec<BusEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe("connection:*", move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        seen
    }

    #[test]
    fn lifecycle_events_map_to_topics() {
        let bus = EventBus::new();
        let seen = capture(&bus);
        let publisher = ConnectionStatusPublisher::new(bus);

        assert!(publisher.publish(&ConnectionEvent::Connected));
        assert!(publisher.publish(&ConnectionEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(2),
        }));
        assert!(publisher.publish(&ConnectionEvent::Disconnected {
            reason: "closed".to_string(),
        }));
        assert!(publisher.publish(&ConnectionEvent::MaxReconnectAttemptsReached { attempts: 5 }));

        let events = seen.lock().unwrap();
        let topics: Vec<_> = events.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "connection:connected",
                "connection:reconnecting",
                "connection:disconnected",
                "connection:error",
            ]
        );
        assert_eq!(events[1].payload["delayMs"], 2000);
        assert_eq!(events[3].payload["fatal"], true);
    }

    #[test]
    fn market_data_is_not_published() {
        let bus = EventBus::new();
        let seen = capture(&bus);
        let publisher = ConnectionStatusPublisher::new(bus);

        let handled = publisher.publish(&ConnectionEvent::PriceUpdate(PriceTick {
            symbol: "EURUSD".to_string(),
            bid: Decimal::ONE,
            ask: Decimal::ONE,
            last: None,
            volume: None,
            timestamp: Utc::now(),
        }));

        assert!(!handled);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_when_sender_closes() {
        let bus = EventBus::new();
        let seen = capture(&bus);
        let (tx, rx) = broadcast::channel(8);
        let publisher = ConnectionStatusPublisher::new(bus);

        tx.send(ConnectionEvent::Error("boom".to_string())).unwrap();
        drop(tx);
        publisher.run(rx, CancellationToken::new()).await;

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["message"], "boom");
    }
}
