// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Subscription management
//!
//! The [`SubscriptionManager`] owns the current [`TopicDirectory`] and keeps
//! the transport's subscriptions in line with it. Dispatch reads the
//! directory pointer at call time, so a reload takes effect for the very
//! next message.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::directory::TopicDirectory;
use crate::error::{IngestError, Result};
use crate::metric::{DeviceId, Metric};
use crate::registry::Registry;
use crate::transport::Transport;
use crate::validation::parse_value;

/// Outcome of a reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Topics in the replaced directory
    pub old_count: usize,
    /// Topics in the new directory
    pub new_count: usize,
    /// Topics now subscribed, sorted
    pub topics: Vec<String>,
}

/// A resolved, parsed message ready for the coalescer
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub device_id: DeviceId,
    pub metric: Metric,
    pub value: f64,
}

/// Owns the topic directory and the transport subscriptions
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    directory: ArcSwap<TopicDirectory>,
    reload_lock: Mutex<()>,
}

impl SubscriptionManager {
    /// Create a manager with an empty directory
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn Registry>) -> Self {
        Self {
            transport,
            registry,
            directory: ArcSwap::from_pointee(TopicDirectory::empty()),
            reload_lock: Mutex::new(()),
        }
    }

    /// Current directory snapshot
    pub fn directory(&self) -> Arc<TopicDirectory> {
        self.directory.load_full()
    }

    /// Whether the transport has a live session
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Build the directory and subscribe every topic after a (re)connect
    ///
    /// Sessions are clean, so every connect starts without subscriptions.
    /// Returns the number of topics requested.
    pub async fn on_connected(&self) -> Result<usize> {
        let _guard = self.reload_lock.lock().await;

        let entries = self.registry.enabled_devices().await?;
        let directory = Arc::new(TopicDirectory::build(&entries));
        let topics = directory.topics();
        self.directory.store(Arc::clone(&directory));

        if topics.is_empty() {
            warn!("No topics to subscribe to");
            return Ok(0);
        }

        self.transport.subscribe(&topics).await?;
        info!(topics = topics.len(), "Subscribed to topics");
        Ok(topics.len())
    }

    /// Rebuild the directory from the registry and resubscribe
    ///
    /// Order: build new directory, unsubscribe old topics, subscribe new
    /// topics, swap the directory. Messages for topics between the
    /// unsubscribe and subscribe steps are not delivered by the transport.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        if !self.transport.is_connected() {
            return Err(IngestError::NotConnected);
        }
        let _guard = self.reload_lock.lock().await;

        let entries = self.registry.enabled_devices().await?;
        let fresh = Arc::new(TopicDirectory::build(&entries));
        let old_topics = self.directory.load().topics();
        let new_topics = fresh.topics();

        if !old_topics.is_empty() {
            match self.transport.unsubscribe(&old_topics).await {
                Ok(()) => info!(topics = old_topics.len(), "Unsubscribed from old topics"),
                Err(e) => error!(topics = old_topics.len(), "Unsubscribe failed: {}", e),
            }
        }

        let subscribed = if new_topics.is_empty() {
            Ok(())
        } else {
            self.transport.subscribe(&new_topics).await
        };

        self.directory.store(fresh);

        subscribed?;
        info!(
            old = old_topics.len(),
            new = new_topics.len(),
            "Topic directory reloaded"
        );

        Ok(ReloadSummary {
            old_count: old_topics.len(),
            new_count: new_topics.len(),
            topics: new_topics,
        })
    }

    /// Resolve a message against the current directory
    ///
    /// Returns the device, metric and numeric value, or the drop reason.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Sample> {
        let device_id = self
            .directory
            .load()
            .resolve(topic)
            .cloned()
            .ok_or_else(|| IngestError::UnrecognizedTopic(topic.to_string()))?;

        let metric = Metric::from_topic(topic)
            .ok_or_else(|| IngestError::UnknownMetric(topic.to_string()))?;

        let value = parse_value(payload).ok_or_else(|| IngestError::InvalidPayload {
            topic: topic.to_string(),
            reason: "not a number".to_string(),
        })?;

        Ok(Sample {
            device_id,
            metric,
            value,
        })
    }
}
