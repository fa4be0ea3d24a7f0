/*!
Bus MQTT simulé pour tests sans broker

Implémente le trait `Publisher` du kernel : chaque publication est enregistrée,
et `simulate_incoming` route un message vers les handlers dont le filtre correspond.
*/

use greenbox_kernel::bus::{BusError, MessageHandler, Publisher};
use greenbox_kernel::topics;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MockMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Clone, Default)]
pub struct MockBus {
    published: Arc<Mutex<Vec<MockMessage>>>,
    handlers: Arc<Mutex<Vec<(String, Arc<dyn MessageHandler>)>>>,
    offline: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().push((filter.to_string(), handler));
        tracing::debug!(filter, "[mock] subscribed");
    }

    /// Livre un message aux handlers abonnés ; retourne le nombre de handlers atteints.
    pub fn simulate_incoming(&self, topic: &str, payload: &[u8]) -> usize {
        let targets: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .lock()
            .iter()
            .filter(|(filter, _)| topics::matches(topic, filter))
            .map(|(_, h)| h.clone())
            .collect();
        for handler in &targets {
            handler.on_message(topic, payload);
        }
        targets.len()
    }

    pub fn simulate_json(&self, topic: &str, payload: &Value) -> usize {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        self.simulate_incoming(topic, &bytes)
    }

    /// Fait échouer les publications suivantes (broker injoignable).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    /// Payloads JSON publiés sur les topics correspondant au filtre.
    pub fn json_matching(&self, filter: &str) -> Vec<(String, Value)> {
        self.published
            .lock()
            .iter()
            .filter(|m| topics::matches(&m.topic, filter))
            .filter_map(|m| m.json().map(|v| (m.topic.clone(), v)))
            .collect()
    }

    pub fn last_json(&self, topic: &str) -> Option<Value> {
        self.find_messages_by_topic(topic).last().and_then(MockMessage::json)
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Publisher for MockBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Rejected("mock bus offline".into()));
        }
        tracing::debug!(topic, bytes = payload.len(), "[mock] published");
        self.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_kernel::bus::publish_json;

    #[test]
    fn records_publishes() {
        let bus = MockBus::new();
        assert!(publish_json(&bus, "/gh1/rb1/alerts/ph", &serde_json::json!({"message": "x"})));
        assert_eq!(bus.published_messages().len(), 1);
        assert_eq!(bus.last_json("/gh1/rb1/alerts/ph").unwrap()["message"], "x");

        bus.set_offline(true);
        assert!(!publish_json(&bus, "/gh1/rb1/alerts/ph", &1));
        assert_eq!(bus.published_messages().len(), 1);
    }

    #[test]
    fn routes_by_filter() {
        let bus = MockBus::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        bus.subscribe(
            "/+/+/statistics/state",
            Arc::new(move |topic: &str, _: &[u8]| sink.lock().push(topic.to_string())),
        );

        assert_eq!(bus.simulate_incoming("/gh1/rb1/statistics/state", b"{}"), 1);
        assert_eq!(bus.simulate_incoming("/gh1/rb1/alerts/ph", b"{}"), 0);
        assert_eq!(seen.lock().as_slice(), ["/gh1/rb1/statistics/state".to_string()]);
    }
}
