// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Reading persistence
//!
//! Flushed readings leave the dispatch path through a bounded
//! [`PersistQueue`] and are written by a fixed pool of workers, so a slow
//! store never stalls message handling. When the queue is full the new
//! reading is dropped and counted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::PersistConfig;
use crate::error::{IngestError, Result};
use crate::metric::{DeviceId, Reading};
use crate::metrics::{DropReason, IngestMetrics};

/// Store for finalized readings
///
/// An implementation stores the reading and then marks the device's
/// last-activity time.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist(&self, reading: &Reading) -> Result<()>;
}

/// Appends readings as JSON lines and keeps a last-activity index
///
/// The index file is a JSON object mapping device id to the time of its
/// most recent stored reading, rewritten after every append.
pub struct JsonLinesPersister {
    readings_path: PathBuf,
    activity_path: PathBuf,
    activity: Mutex<BTreeMap<DeviceId, DateTime<Utc>>>,
}

impl JsonLinesPersister {
    /// Open a persister, loading an existing activity index if present
    pub async fn open(
        readings_path: impl Into<PathBuf>,
        activity_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let activity_path = activity_path.into();
        let activity = match tokio::fs::read(&activity_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            readings_path: readings_path.into(),
            activity_path,
            activity: Mutex::new(activity),
        })
    }

    pub fn readings_path(&self) -> &Path {
        &self.readings_path
    }

    /// Last stored reading time for a device
    pub async fn last_activity(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.activity.lock().await.get(device_id).copied()
    }

    async fn append(&self, reading: &Reading) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(reading)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.readings_path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl Persister for JsonLinesPersister {
    async fn persist(&self, reading: &Reading) -> Result<()> {
        // Held across both writes so index rewrites never interleave
        let mut activity = self.activity.lock().await;

        self.append(reading)
            .await
            .map_err(|e| IngestError::Persist {
                device: reading.device_id.clone(),
                reason: e.to_string(),
            })?;

        activity.insert(reading.device_id.clone(), Utc::now());
        let index = serde_json::to_vec_pretty(&*activity)?;
        tokio::fs::write(&self.activity_path, index)
            .await
            .map_err(|e| IngestError::Persist {
                device: reading.device_id.clone(),
                reason: format!("activity index: {}", e),
            })
    }
}

/// Bounded hand-off from the dispatch path to persistence workers
pub struct PersistQueue {
    tx: mpsc::Sender<Reading>,
    workers: Vec<JoinHandle<()>>,
    metrics: Arc<IngestMetrics>,
}

impl PersistQueue {
    /// Spawn `config.workers` workers draining a queue of
    /// `config.queue_capacity` readings
    pub fn spawn(
        config: &PersistConfig,
        persister: Arc<dyn Persister>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&persister),
                    Arc::clone(&metrics),
                ))
            })
            .collect();

        Self {
            tx,
            workers,
            metrics,
        }
    }

    /// Queue a reading without waiting
    ///
    /// Returns `false` and counts a drop when the queue is full or every
    /// worker has gone away.
    pub fn submit(&self, reading: Reading) -> bool {
        match self.tx.try_send(reading) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(reading)) => {
                warn!(device = %reading.device_id, "Persist queue full, dropping reading");
                self.metrics.record_drop(DropReason::QueueFull);
                false
            }
            Err(mpsc::error::TrySendError::Closed(reading)) => {
                error!(device = %reading.device_id, "Persist queue closed, dropping reading");
                self.metrics.record_drop(DropReason::QueueClosed);
                false
            }
        }
    }

    /// Readings waiting for a worker
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Close the queue, let workers drain it, and wait for them
    pub async fn shutdown(self) {
        let Self { tx, workers, .. } = self;
        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Persist worker panicked: {}", e);
            }
        }
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Reading>>>,
    persister: Arc<dyn Persister>,
    metrics: Arc<IngestMetrics>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(reading) = next else { break };

        match persister.persist(&reading).await {
            Ok(()) => {
                metrics.record_persisted();
                debug!(
                    worker = id,
                    device = %reading.device_id,
                    metrics = reading.values.present_count(),
                    "Reading stored"
                );
            }
            Err(e) => {
                metrics.record_drop(DropReason::PersistFailed);
                error!(worker = id, device = %reading.device_id, "Persist failed: {}", e);
            }
        }
    }
    debug!(worker = id, "Persist worker stopped");
}
