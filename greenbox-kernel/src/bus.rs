/**
 * CLIENT BUS MQTT - Publication/abonnement partagés par tous les démons Greenbox
 *
 * RÔLE :
 * Encapsule rumqttc : une boucle d'événements par client, QoS 2 partout,
 * jamais de messages retenus, identifiant client stable.
 *
 * FONCTIONNEMENT :
 * - publish() ne bloque jamais : try_publish dans le canal de la boucle
 * - Reconnexion avec attente exponentielle 1s → 30s
 * - Au ConnAck suivant la première connexion, réabonnement au dernier topic
 * - stop() : désabonnement, DISCONNECT, attente bornée de la boucle
 *
 * UTILITÉ DANS GREENBOX :
 * 🎯 Transport : capteurs, actionneurs, statistiques et contrôleur parlent via ce client
 * 🎯 Tests : le trait Publisher permet de substituer un bus simulé (devkit)
 */

use crate::health::BusHealth;
use crate::state::{new_state, Shared};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const BUS_QOS: QoS = QoS::ExactlyOnce;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Tout ce qui sait pousser un payload sur le bus.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Reçoit les publications entrantes de l'abonnement d'un client.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn on_message(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

/// Sérialise `message` et le publie ; un échec est loggé et renvoie `false`.
pub fn publish_json<P, T>(bus: &P, topic: &str, message: &T) -> bool
where
    P: Publisher + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = match serde_json::to_vec(message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic, error = %e, "failed to encode payload");
            return false;
        }
    };
    match bus.publish(topic, payload) {
        Ok(()) => true,
        Err(e) => {
            warn!(topic, error = %e, "publish failed");
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub capacity: usize,
}

impl BusOptions {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(60),
            capacity: 100,
        }
    }
}

pub struct BusClient {
    client: AsyncClient,
    client_id: String,
    subscription: Shared<Option<String>>,
    health: BusHealth,
    stop_tx: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

struct LoopContext {
    client: AsyncClient,
    client_id: String,
    subscription: Shared<Option<String>>,
    handler: Option<Arc<dyn MessageHandler>>,
    health: BusHealth,
}

impl BusClient {
    /// Connexion en arrière-plan ; à appeler dans un runtime tokio.
    pub fn start(options: BusOptions, handler: Option<Arc<dyn MessageHandler>>) -> Self {
        let mut opts = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        opts.set_keep_alive(options.keep_alive);
        let (client, eventloop) = AsyncClient::new(opts, options.capacity);

        let subscription = new_state(None);
        let health = BusHealth::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = LoopContext {
            client: client.clone(),
            client_id: options.client_id.clone(),
            subscription: subscription.clone(),
            handler,
            health: health.clone(),
        };
        let handle = tokio::spawn(run_event_loop(eventloop, ctx, stop_rx));
        info!(client = %options.client_id, host = %options.host, port = options.port, "bus client started");

        Self {
            client,
            client_id: options.client_id,
            subscription,
            health,
            stop_tx,
            event_loop: Mutex::new(Some(handle)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn health(&self) -> &BusHealth {
        &self.health
    }

    /// Abonnement à `topic`, rejoué après chaque reconnexion.
    pub async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        *self.subscription.lock() = Some(topic.to_string());
        self.client.subscribe(topic, BUS_QOS).await?;
        info!(client = %self.client_id, topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self) -> Result<(), BusError> {
        let topic = self.subscription.lock().take();
        if let Some(topic) = topic {
            self.client.unsubscribe(topic.clone()).await?;
            debug!(client = %self.client_id, topic = %topic, "unsubscribed");
        }
        Ok(())
    }

    /// Désabonnement, DISCONNECT, puis attente de la boucle pendant `timeout` au plus.
    pub async fn stop(&self, timeout: Duration) {
        if let Err(e) = self.unsubscribe().await {
            warn!(client = %self.client_id, error = %e, "unsubscribe on stop failed");
        }
        if let Err(e) = self.client.disconnect().await {
            warn!(client = %self.client_id, error = %e, "disconnect request failed");
        }
        let handle = self.event_loop.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                let _ = self.stop_tx.send(true);
                handle.abort();
                warn!(client = %self.client_id, "event loop did not finish in time, aborted");
            }
        }
        info!(client = %self.client_id, "bus client stopped");
    }
}

impl Publisher for BusClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let size = payload.len();
        self.client.try_publish(topic, BUS_QOS, false, payload)?;
        debug!(client = %self.client_id, topic, bytes = size, "published");
        Ok(())
    }
}

async fn run_event_loop(mut eventloop: EventLoop, ctx: LoopContext, mut stop_rx: watch::Receiver<bool>) {
    let mut backoff = RECONNECT_MIN;
    let mut connected_once = false;

    loop {
        let event = tokio::select! {
            _ = stop_rx.changed() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                backoff = RECONNECT_MIN;
                on_connack(&ctx, connected_once);
                connected_once = true;
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                if let Some(handler) = &ctx.handler {
                    handler.on_message(&p.topic, &p.payload);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client = %ctx.client_id, "disconnect sent, leaving event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                ctx.health.mark_disconnected();
                let attempt = ctx.health.increment_reconnects();
                warn!(
                    client = %ctx.client_id,
                    error = %e,
                    attempt,
                    retry_in_s = backoff.as_secs(),
                    "bus connection error"
                );
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff);
            }
        }
    }
    ctx.health.mark_disconnected();
}

/// Première connexion : rien à rejouer (subscribe() passe par la file de la boucle).
/// Reconnexion : le dernier abonnement est rejoué. Retourne `true` si un
/// réabonnement a été mis en file.
fn on_connack(ctx: &LoopContext, connected_once: bool) -> bool {
    ctx.health.mark_connected();
    if !connected_once {
        info!(client = %ctx.client_id, "connected to broker");
        return false;
    }
    let topic = ctx.subscription.lock().clone();
    let Some(topic) = topic else {
        info!(client = %ctx.client_id, "reconnected");
        return false;
    };
    match ctx.client.try_subscribe(topic.clone(), BUS_QOS) {
        Ok(()) => {
            info!(client = %ctx.client_id, topic = %topic, "reconnected, subscription replayed");
            true
        }
        Err(e) => {
            warn!(client = %ctx.client_id, topic = %topic, error = %e, "resubscribe failed");
            false
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::LinkStatus;

    struct Recorder(Mutex<Vec<(String, Vec<u8>)>>);

    impl Publisher for Recorder {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            self.0.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct Refusing;

    impl Publisher for Refusing {
        fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BusError> {
            Err(BusError::Rejected("offline".into()))
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut delay = RECONNECT_MIN;
        let mut seen = vec![];
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn publish_json_reports_outcome() {
        let rec = Recorder(Mutex::new(vec![]));
        assert!(publish_json(&rec, "/gh1/rb1/alerts/ph", &serde_json::json!({"message": "x"})));
        let sent = rec.0.lock();
        assert_eq!(sent[0].0, "/gh1/rb1/alerts/ph");
        assert_eq!(sent[0].1, br#"{"message":"x"}"#.to_vec());

        assert!(!publish_json(&Refusing, "/t", &1));
    }

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |topic: &str, _payload: &[u8]| {
            sink.lock().push(topic.to_string());
        });
        handler.on_message("/gh1/rb1/statistics/state", b"{}");
        assert_eq!(seen.lock().as_slice(), ["/gh1/rb1/statistics/state".to_string()]);
    }

    fn loop_context(subscription: Option<&str>) -> (LoopContext, EventLoop) {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("greenbox-test", "127.0.0.1", 1), 10);
        let ctx = LoopContext {
            client,
            client_id: "greenbox-test".into(),
            subscription: new_state(subscription.map(str::to_string)),
            handler: None,
            health: BusHealth::new(),
        };
        (ctx, eventloop)
    }

    #[test]
    fn first_connack_does_not_replay_subscription() {
        let (ctx, _eventloop) = loop_context(Some("/gh1/rb1/actuators/+/+/data"));
        assert!(!on_connack(&ctx, false));
        assert_eq!(ctx.health.status(), LinkStatus::Connected);
    }

    #[test]
    fn reconnect_replays_last_subscription() {
        let (ctx, _eventloop) = loop_context(Some("/gh1/rb1/actuators/+/+/data"));
        ctx.health.mark_disconnected();
        assert!(on_connack(&ctx, true));
        assert_eq!(ctx.health.status(), LinkStatus::Connected);
        assert!(on_connack(&ctx, true));
    }

    #[test]
    fn reconnect_without_subscription_replays_nothing() {
        let (ctx, _eventloop) = loop_context(None);
        assert!(!on_connack(&ctx, true));
        assert_eq!(ctx.health.status(), LinkStatus::Connected);
    }

    #[tokio::test]
    async fn publish_without_broker_does_not_block() {
        let bus = BusClient::start(BusOptions::new("greenbox-test", "127.0.0.1", 1), None);
        assert!(bus.publish("/gh1/rb1/alerts/ph", b"{}".to_vec()).is_ok());
        bus.stop(Duration::from_millis(100)).await;
    }
}
