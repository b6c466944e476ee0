//! # Zephy - Device telemetry ingestion
//!
//! Receives single-metric sensor messages over MQTT, routes each topic to
//! the device that owns it, and coalesces the per-metric messages into one
//! timestamped reading per device.
//!
//! ## Key Features
//!
//! - **Topic routing**: `<location-slug>/<metric>` topics derived from the
//!   device registry, rebuilt and resubscribed on demand
//! - **Coalescing**: complete readings flush immediately, partial ones
//!   after a configurable timeout (60 s by default)
//! - **Range gate**: out-of-range or non-numeric values never touch a buffer
//! - **Bounded persistence**: a fixed worker pool behind a bounded queue
//! - **Observable drops**: every dropped message is counted by reason
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use zephy::{Metric, ReadingCoalescer, Sample};
//!
//! let mut coalescer = ReadingCoalescer::new(Duration::from_secs(60));
//! let now = Instant::now();
//!
//! let sample = Sample { device_id: "D1".into(), metric: Metric::Temperature, value: 24.5 };
//! assert!(coalescer.accept(sample, now).unwrap().is_none());
//!
//! let flushed = coalescer.expire(now + Duration::from_secs(60));
//! assert_eq!(flushed[0].values.temperature, Some(24.5));
//! assert_eq!(flushed[0].values.humidity, None);
//! ```
//!
//! ## Modules
//!
//! - [`metric`]: Metric catalogue, value slots and readings
//! - [`validation`]: Per-metric range gate
//! - [`registry`]: Device/location registry boundary
//! - [`directory`]: Slug normalisation and the topic directory
//! - [`transport`]: Pub/sub transport (MQTT)
//! - [`subscription`]: Directory ownership, reload and dispatch
//! - [`coalescer`]: Per-device buffers and flush deadlines
//! - [`persist`]: Persister trait and bounded persistence pool
//! - [`service`]: The assembled pipeline
//! - [`metrics`]: Ingestion counters

// Modules
pub mod coalescer;
pub mod config;
pub mod directory;
pub mod error;
pub mod memory;
pub mod metric;
pub mod metrics;
pub mod persist;
pub mod registry;
pub mod service;
pub mod subscription;
pub mod transport;
pub mod validation;

// Re-exports for convenient access
pub use coalescer::{DeviceBuffer, ReadingCoalescer};
pub use config::{BrokerConfig, CoalescerConfig, IngestConfig, PersistConfig};
pub use directory::{slugify, topic_key, SlugCollision, TopicDirectory};
pub use error::{IngestError, Result};
pub use metric::{DeviceId, Metric, MetricValues, Reading};
pub use metrics::{DropReason, IngestMetrics, MetricsSnapshot};
pub use persist::{JsonLinesPersister, PersistQueue, Persister};
pub use registry::{FileRegistry, Registry, RegistryEntry};
pub use service::IngestService;
pub use subscription::{ReloadSummary, Sample, SubscriptionManager};
pub use transport::{MqttTransport, Transport, TransportEvent};
pub use validation::{MetricRange, ValidationGate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
