// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Ingestion service
//!
//! [`IngestService`] wires the pieces together: a single dispatch task
//! consumes transport events, resolves topics through the
//! [`SubscriptionManager`], feeds the [`ReadingCoalescer`], and hands
//! flushed readings to the [`PersistQueue`]. All buffer and deadline state
//! lives on that one task, so no per-device locking is needed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zephy::memory::{MemoryStore, MemoryTransport};
//! use zephy::{IngestConfig, IngestService};
//!
//! # async fn run() -> zephy::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let (transport, events) = MemoryTransport::with_events(64);
//! let transport = Arc::new(transport);
//!
//! let service = IngestService::new(
//!     IngestConfig::default(),
//!     transport.clone(),
//!     store.clone(),
//!     store.clone(),
//! );
//! service.start(events).await?;
//! transport.connect().await;
//! // ...
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coalescer::ReadingCoalescer;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::metric::Reading;
use crate::metrics::IngestMetrics;
use crate::persist::{PersistQueue, Persister};
use crate::registry::Registry;
use crate::subscription::{ReloadSummary, SubscriptionManager};
use crate::transport::{Transport, TransportEvent};
use crate::validation::ValidationGate;

struct Running {
    cancel: CancellationToken,
    driver: JoinHandle<usize>,
    queue: Arc<PersistQueue>,
}

/// The ingestion pipeline with injectable collaborators
pub struct IngestService {
    config: IngestConfig,
    subscriptions: Arc<SubscriptionManager>,
    persister: Arc<dyn Persister>,
    metrics: Arc<IngestMetrics>,
    running: Mutex<Option<Running>>,
}

impl IngestService {
    pub fn new(
        config: IngestConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        Self {
            config,
            subscriptions: Arc::new(SubscriptionManager::new(transport, registry)),
            persister,
            metrics: Arc::new(IngestMetrics::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionManager> {
        Arc::clone(&self.subscriptions)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn the persistence workers and the dispatch task
    pub async fn start(&self, events: mpsc::Receiver<TransportEvent>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(IngestError::Service("already running".into()));
        }

        let queue = Arc::new(PersistQueue::spawn(
            &self.config.persist,
            Arc::clone(&self.persister),
            Arc::clone(&self.metrics),
        ));
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            subscriptions: Arc::clone(&self.subscriptions),
            metrics: Arc::clone(&self.metrics),
            queue: Arc::clone(&queue),
        };
        let coalescer = ReadingCoalescer::new(self.config.coalescer.flush_timeout());
        let driver = tokio::spawn(dispatcher.run(events, coalescer, cancel.clone()));

        info!(
            flush_timeout_ms = self.config.coalescer.flush_timeout_ms,
            workers = self.config.persist.workers,
            "Ingestion service started"
        );

        *running = Some(Running {
            cancel,
            driver,
            queue,
        });
        Ok(())
    }

    /// Stop dispatch, discard pending buffers, and drain persistence
    ///
    /// Pending partial buffers are dropped, not flushed. Calling `stop` on
    /// a stopped service does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        match running.driver.await {
            Ok(discarded) => self.metrics.record_timers_cancelled(discarded),
            Err(e) => error!("Dispatch task failed: {}", e),
        }

        match Arc::try_unwrap(running.queue) {
            Ok(queue) => queue.shutdown().await,
            Err(_) => warn!("Persist queue still referenced, not drained"),
        }

        info!("Ingestion service stopped");
    }

    /// Rebuild the topic directory and resubscribe
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let result = self.subscriptions.reload().await;
        self.metrics.record_reload(result.is_ok());

        match &result {
            Ok(summary) => self.metrics.set_subscribed_topics(summary.new_count),
            Err(e @ IngestError::Subscribe { .. }) => {
                self.metrics.record_subscribe_failure();
                error!("Reload subscribe failed: {}", e);
            }
            Err(e) => warn!("Reload failed: {}", e),
        }
        result
    }

    /// Queue a pre-assembled reading for persistence
    ///
    /// Every present value must pass the range gate; a reading with no
    /// values at all is refused.
    pub async fn submit_reading(&self, reading: Reading) -> Result<()> {
        if reading.values.is_empty() {
            return Err(IngestError::InvalidPayload {
                topic: format!("readings/{}", reading.device_id),
                reason: "no metric values".into(),
            });
        }
        let gate = ValidationGate::new();
        for (metric, value) in reading.values.present() {
            gate.check(metric, value)
                .map_err(|rejection| IngestError::Rejected {
                    device: reading.device_id.clone(),
                    metric: metric.to_string(),
                    reason: rejection.to_string(),
                })?;
        }

        let running = self.running.lock().await;
        let running = running
            .as_ref()
            .ok_or_else(|| IngestError::Service("not running".into()))?;

        if running.queue.submit(reading) {
            self.metrics.record_submitted();
            Ok(())
        } else {
            Err(IngestError::Service("persistence queue rejected reading".into()))
        }
    }
}

/// State shared by the dispatch task
struct Dispatcher {
    subscriptions: Arc<SubscriptionManager>,
    metrics: Arc<IngestMetrics>,
    queue: Arc<PersistQueue>,
}

impl Dispatcher {
    /// Event loop; returns the number of deadlines discarded on stop
    async fn run(
        self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut coalescer: ReadingCoalescer,
        cancel: CancellationToken,
    ) -> usize {
        let mut events_open = true;

        loop {
            let deadline = coalescer.next_deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle(event, &mut coalescer).await,
                    None => {
                        warn!("Transport event stream closed");
                        events_open = false;
                    }
                },

                _ = wait_until(deadline) => {
                    for reading in coalescer.expire(Instant::now()) {
                        self.flush(reading);
                    }
                }
            }
        }

        let discarded = coalescer.cancel_all();
        if discarded > 0 {
            info!(buffers = discarded, "Discarded pending buffers on shutdown");
        }
        discarded
    }

    async fn handle(&self, event: TransportEvent, coalescer: &mut ReadingCoalescer) {
        match event {
            TransportEvent::Connected => match self.subscriptions.on_connected().await {
                Ok(count) => self.metrics.set_subscribed_topics(count),
                Err(e) => {
                    if matches!(e, IngestError::Subscribe { .. }) {
                        self.metrics.record_subscribe_failure();
                    }
                    self.metrics.set_subscribed_topics(0);
                    error!("Subscribing after connect failed: {}", e);
                }
            },
            TransportEvent::Disconnected => {
                self.metrics.set_subscribed_topics(0);
                warn!("Transport disconnected");
            }
            TransportEvent::SubscribeRejected { count } => {
                self.metrics.record_subscribe_failure();
                error!(topics = count, "Broker rejected subscriptions");
            }
            TransportEvent::Message { topic, payload } => {
                self.metrics.record_message();
                self.on_message(&topic, &payload, coalescer);
            }
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8], coalescer: &mut ReadingCoalescer) {
        // Overdue buffers flush before a queued message can reach them
        let now = Instant::now();
        for reading in coalescer.expire(now) {
            self.flush(reading);
        }

        let accepted = self
            .subscriptions
            .dispatch(topic, payload)
            .and_then(|sample| {
                debug!(
                    topic,
                    device = %sample.device_id,
                    metric = %sample.metric,
                    value = sample.value,
                    "Sample received"
                );
                coalescer.accept(sample, now)
            });

        match accepted {
            Ok(flushed) => {
                self.metrics.record_accepted();
                if let Some(reading) = flushed {
                    self.flush(reading);
                }
            }
            Err(e) => {
                let reason = e.drop_reason();
                if let Some(reason) = reason {
                    self.metrics.record_drop(reason);
                }
                warn!(
                    topic,
                    reason = reason.map(|r| r.as_str()).unwrap_or("error"),
                    "Dropping message: {}",
                    e
                );
            }
        }
    }

    fn flush(&self, reading: Reading) {
        let partial = reading.is_partial();
        self.metrics.record_flush(partial);
        debug!(
            device = %reading.device_id,
            partial,
            metrics = reading.values.present_count(),
            "Flushing reading"
        );
        self.queue.submit(reading);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, MemoryTransport};
    use crate::metric::{Metric, MetricValues};

    fn service() -> (Arc<MemoryStore>, IngestService, mpsc::Receiver<TransportEvent>) {
        let store = Arc::new(MemoryStore::new());
        let (transport, events) = MemoryTransport::with_events(16);
        let service = IngestService::new(
            IngestConfig::default(),
            Arc::new(transport),
            store.clone(),
            store.clone(),
        );
        (store, service, events)
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (_store, service, events) = service();
        service.start(events).await.unwrap();

        let (_tx, other) = mpsc::channel(1);
        assert!(matches!(
            service.start(other).await,
            Err(IngestError::Service(_))
        ));

        service.stop().await;
        assert!(!service.is_running().await);
        // Second stop is a no-op
        service.stop().await;
    }

    #[tokio::test]
    async fn test_submit_reading_validates() {
        let (store, service, events) = service();
        service.start(events).await.unwrap();

        let bad = Reading::now("D1", MetricValues::new().with(Metric::Humidity, 140.0));
        assert!(matches!(
            service.submit_reading(bad).await,
            Err(IngestError::Rejected { .. })
        ));
        let empty = Reading::now("D1", MetricValues::new());
        assert!(service.submit_reading(empty).await.is_err());

        let good = Reading::now("D1", MetricValues::new().with(Metric::Humidity, 40.0));
        service.submit_reading(good).await.unwrap();

        service.stop().await;
        assert_eq!(store.readings_for("D1").len(), 1);
        let s = service.metrics().snapshot();
        assert_eq!(s.readings_submitted, 1);
        assert_eq!(s.readings_partial, 0);
        assert_eq!(s.readings_complete, 0);
    }

    #[tokio::test]
    async fn test_submit_reading_requires_running() {
        let (_store, service, _events) = service();
        let reading = Reading::now("D1", MetricValues::new().with(Metric::Humidity, 40.0));
        assert!(matches!(
            service.submit_reading(reading).await,
            Err(IngestError::Service(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_while_disconnected() {
        let (_store, service, _events) = service();
        assert!(matches!(
            service.reload().await,
            Err(IngestError::NotConnected)
        ));
        assert_eq!(service.metrics().snapshot().reload_failures, 1);
    }
}
