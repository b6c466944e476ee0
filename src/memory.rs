// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! In-memory collaborators for testing and local runs
//!
//! [`MemoryStore`] plays both registry and persister; [`MemoryTransport`]
//! behaves like a broker session that only delivers messages on
//! subscribed topics.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{IngestError, Result};
use crate::metric::{DeviceId, Reading};
use crate::persist::Persister;
use crate::registry::{DeviceRecord, LocationRecord, Registry, RegistryEntry, RegistryFile};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Default)]
struct StoreInner {
    registry: RegistryFile,
    readings: Vec<Reading>,
    last_activity: HashMap<DeviceId, DateTime<Utc>>,
    persist_delay: Option<Duration>,
}

/// In-memory registry and reading store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    fail_persist: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreInner> {
        lock(&self.inner)
    }

    /// Create or rename a location
    pub fn add_location(&self, id: &str, name: &str) {
        let mut inner = self.state();
        let locations = &mut inner.registry.locations;
        match locations.iter_mut().find(|l| l.id == id) {
            Some(location) => location.name = Some(name.to_string()),
            None => locations.push(LocationRecord {
                id: id.to_string(),
                name: Some(name.to_string()),
            }),
        }
    }

    /// Rename an existing location (no-op when absent)
    pub fn rename_location(&self, id: &str, name: &str) {
        let mut inner = self.state();
        if let Some(location) = inner.registry.locations.iter_mut().find(|l| l.id == id) {
            location.name = Some(name.to_string());
        }
    }

    /// Delete a location; devices pointing at it lose their location
    pub fn remove_location(&self, id: &str) {
        self.state().registry.locations.retain(|l| l.id != id);
    }

    /// Create (enabled) or replace a device
    pub fn add_device(&self, id: &str, location: Option<&str>) {
        let mut inner = self.state();
        inner.registry.devices.retain(|d| d.id != id);
        inner.registry.devices.push(DeviceRecord {
            id: id.to_string(),
            location: location.map(str::to_string),
            enabled: true,
        });
    }

    /// Point a device at another location
    pub fn move_device(&self, id: &str, location: &str) {
        let mut inner = self.state();
        if let Some(device) = inner.registry.devices.iter_mut().find(|d| d.id == id) {
            device.location = Some(location.to_string());
        }
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) {
        let mut inner = self.state();
        if let Some(device) = inner.registry.devices.iter_mut().find(|d| d.id == id) {
            device.enabled = enabled;
        }
    }

    pub fn remove_device(&self, id: &str) {
        self.state().registry.devices.retain(|d| d.id != id);
    }

    /// Make subsequent persist calls fail
    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Simulate a slow store
    pub fn set_persist_delay(&self, delay: Option<Duration>) {
        self.state().persist_delay = delay;
    }

    /// All stored readings, in persist order
    pub fn readings(&self) -> Vec<Reading> {
        self.state().readings.clone()
    }

    /// Stored readings for one device
    pub fn readings_for(&self, device_id: &str) -> Vec<Reading> {
        self.state()
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn last_activity(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.state().last_activity.get(device_id).copied()
    }
}

#[async_trait]
impl Registry for MemoryStore {
    async fn enabled_devices(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.state().registry.enabled_entries())
    }
}

#[async_trait]
impl Persister for MemoryStore {
    async fn persist(&self, reading: &Reading) -> Result<()> {
        let delay = self.state().persist_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(IngestError::Persist {
                device: reading.device_id.clone(),
                reason: "store unavailable".to_string(),
            });
        }

        let mut inner = self.state();
        inner.readings.push(reading.clone());
        inner
            .last_activity
            .insert(reading.device_id.clone(), Utc::now());
        Ok(())
    }
}

/// In-memory broker session
#[derive(Debug, Default)]
pub struct MemoryTransport {
    connected: AtomicBool,
    subscribed: Mutex<BTreeSet<String>>,
    unsubscribed: Mutex<Vec<String>>,
    subscribe_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    events: Option<mpsc::Sender<TransportEvent>>,
}

impl MemoryTransport {
    /// A transport without an event stream (subscription bookkeeping only)
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport feeding an event stream
    pub fn with_events(capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                events: Some(tx),
                ..Self::default()
            },
            rx,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Establish a clean session and announce it
    pub async fn connect(&self) {
        lock(&self.subscribed).clear();
        self.set_connected(true);
        self.emit(TransportEvent::Connected).await;
    }

    /// Drop the session and announce it
    pub async fn disconnect(&self) {
        self.set_connected(false);
        self.emit(TransportEvent::Disconnected).await;
    }

    /// Publish on a topic; delivered only if connected and subscribed
    pub async fn publish(&self, topic: &str, payload: &str) -> bool {
        let deliverable =
            self.is_connected() && lock(&self.subscribed).contains(topic);
        if deliverable {
            self.emit(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.as_bytes().to_vec(),
            })
            .await;
        }
        deliverable
    }

    /// Make subsequent subscribe calls fail
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Currently subscribed topics, sorted
    pub fn subscribed(&self) -> Vec<String> {
        lock(&self.subscribed).iter().cloned().collect()
    }

    /// Every topic ever unsubscribed, in call order
    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.unsubscribed).clone()
    }

    /// Number of subscribe batch calls
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone means the service stopped
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(IngestError::Subscribe {
                count: topics.len(),
                reason: "not authorized".to_string(),
            });
        }
        lock(&self.subscribed).extend(topics.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        let mut subscribed = lock(&self.subscribed);
        let mut log = lock(&self.unsubscribed);
        for topic in topics {
            subscribed.remove(topic);
            log.push(topic.clone());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
