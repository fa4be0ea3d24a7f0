use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusHealthReport {
    pub client_id: String,
    pub uptime_seconds: u64,
    pub status: LinkStatus,
    pub reconnects: u32,
}

/// Suivi de l'état du lien MQTT d'un client (partagé avec la boucle d'événements).
#[derive(Clone)]
pub struct BusHealth {
    start_time: Instant,
    reconnects: Arc<AtomicU32>,
    status: Arc<parking_lot::Mutex<LinkStatus>>,
}

impl BusHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconnects: Arc::new(AtomicU32::new(0)),
            status: Arc::new(parking_lot::Mutex::new(LinkStatus::Connecting)),
        }
    }

    pub fn mark_connected(&self) {
        *self.status.lock() = LinkStatus::Connected;
    }

    pub fn mark_disconnected(&self) {
        *self.status.lock() = LinkStatus::Disconnected;
    }

    /// Retourne le numéro de la tentative de reconnexion.
    pub fn increment_reconnects(&self) -> u32 {
        *self.status.lock() = LinkStatus::Reconnecting;
        self.reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    pub fn report(&self, client_id: &str) -> BusHealthReport {
        BusHealthReport {
            client_id: client_id.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            status: self.status(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for BusHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_status_and_reconnects() {
        let health = BusHealth::new();
        assert_eq!(health.status(), LinkStatus::Connecting);
        health.mark_connected();
        assert_eq!(health.status(), LinkStatus::Connected);
        assert_eq!(health.increment_reconnects(), 1);
        assert_eq!(health.increment_reconnects(), 2);
        assert_eq!(health.status(), LinkStatus::Reconnecting);

        let report = health.report("greenbox-test");
        assert_eq!(report.reconnects, 2);
        assert_eq!(report.client_id, "greenbox-test");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "reconnecting");
    }
}
