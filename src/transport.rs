// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pub/sub transport abstraction
//!
//! The pipeline talks to the broker through the [`Transport`] trait and
//! receives traffic as [`TransportEvent`]s on a bounded channel. The
//! production implementation is [`MqttTransport`] (rumqttc, mqtts by
//! default); tests substitute an in-memory transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{IngestError, Result};

/// Events delivered by a transport to the dispatch task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Session (re)established; topics must be (re)subscribed
    Connected,
    /// Session lost; the transport keeps retrying
    Disconnected,
    /// Broker refused some topics of a subscribe batch
    SubscribeRejected { count: usize },
    /// Message published on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

/// Subscription control over a pub/sub session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe every topic in one batch call
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Unsubscribe every topic
    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    /// Whether a session is currently established
    fn is_connected(&self) -> bool;
}

/// MQTT transport backed by a rumqttc client and its event loop task
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    qos: QoS,
}

impl MqttTransport {
    /// Open a session with automatic reconnection
    ///
    /// Returns the transport, the event stream for the dispatch task, and
    /// the handle of the event loop task (stopped through `cancel`).
    pub fn connect(
        config: &BrokerConfig,
        events_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<TransportEvent>, JoinHandle<()>) {
        let (host, port) = config.endpoint();
        let mut options = MqttOptions::new(config.client_id(), host.clone(), port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(config.clean_session);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if config.use_tls() {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(config.connect_timeout().as_secs().max(1));
        eventloop.set_network_options(network);

        let (tx, rx) = mpsc::channel(events_capacity);
        let connected = Arc::new(AtomicBool::new(false));

        info!(host = %host, port, tls = config.use_tls(), "Connecting to MQTT broker");

        let handle = tokio::spawn(run_event_loop(
            eventloop,
            tx,
            Arc::clone(&connected),
            config.reconnect_interval(),
            cancel,
        ));

        (
            Self {
                client,
                connected,
                qos: QoS::AtLeastOnce,
            },
            rx,
            handle,
        )
    }

    /// Send a DISCONNECT to the broker
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not sent: {}", e);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), self.qos));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| IngestError::Subscribe {
                count: topics.len(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            self.client
                .unsubscribe(topic.clone())
                .await
                .map_err(|e| IngestError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Poll the rumqttc event loop, translating packets into events
///
/// rumqttc reconnects on the next `poll` after an error; the sleep between
/// attempts is the configured reconnect interval.
async fn run_event_loop(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    reconnect_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "Broker refused connection");
                    continue;
                }
                connected.store(true, Ordering::SeqCst);
                info!("Connected to MQTT broker");
                TransportEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .filter(|c| matches!(c, SubscribeReasonCode::Failure))
                    .count();
                if rejected == 0 {
                    debug!(topics = ack.return_codes.len(), "Subscription acknowledged");
                    continue;
                }
                TransportEvent::SubscribeRejected { count: rejected }
            }
            Ok(_) => continue,
            Err(e) => {
                let was_connected = connected.swap(false, Ordering::SeqCst);
                error!("MQTT connection error: {}", e);
                if was_connected && tx.send(TransportEvent::Disconnected).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_interval) => {}
                }
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping MQTT event loop");
            break;
        }
    }

    connected.store(false, Ordering::SeqCst);
}
