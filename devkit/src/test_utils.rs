/*!
Test Harness pour les démons Greenbox

Facilite l'écriture de tests avec:
- Bus simulé partagé
- Expectations sur le nombre de messages par topic
- Attente d'un message (boucles temporisées des actionneurs/capteurs)
*/

use crate::mqtt_stub::MockBus;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub struct TestHarness {
    pub bus: MockBus,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();

        Self {
            bus: MockBus::new(),
            expectations: Vec::new(),
        }
    }

    /// On s'attend à exactement `count` messages sur `topic`.
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual = self.bus.find_messages_by_topic(&expectation.topic).len();
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual
                );
            }
        }
        Ok(())
    }

    /// Attend le dernier message JSON d'un topic (temps tokio, compatible horloge en pause).
    pub async fn wait_for_message(&self, topic: &str, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.bus.last_json(topic) {
                return Some(msg);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(topic, "timeout waiting for message");
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.bus.last_json(topic) else {
            anyhow::bail!("No message on {}", topic);
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for msg in self.bus.published_messages() {
            *counts.entry(msg.topic).or_insert(0) += 1;
        }
        counts
    }

    pub fn reset(&mut self) {
        self.bus.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_kernel::bus::publish_json;
    use serde_json::json;

    #[tokio::test]
    async fn harness_checks_expectations_and_fields() {
        let mut harness = TestHarness::new();
        harness.expect_messages("/gh1/rb1/statistics/state", 1);

        publish_json(
            &harness.bus,
            "/gh1/rb1/statistics/state",
            &json!({"metrics": {"temperature": {"median": 22.0}}}),
        );

        harness.verify_expectations().unwrap();
        harness
            .assert_field_equals("/gh1/rb1/statistics/state", "metrics.temperature.median", &json!(22.0))
            .unwrap();
        assert!(harness
            .assert_field_equals("/gh1/rb1/statistics/state", "metrics.humidity.median", &json!(1))
            .is_err());
        assert_eq!(harness.topic_counts()["/gh1/rb1/statistics/state"], 1);

        let msg = harness.wait_for_message("/gh1/rb1/statistics/state", Duration::from_millis(10)).await;
        assert!(msg.is_some());
        harness.reset();
        assert!(harness.wait_for_message("/gh1/rb1/statistics/state", Duration::from_millis(10)).await.is_none());
    }
}
