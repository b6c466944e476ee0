//! Metric catalogue and reading types
//!
//! This module defines the core types flowing through the pipeline:
//! - The fixed metric catalogue and its topic/field names
//! - Per-metric value slots (absent, never zero)
//! - The finalized [`Reading`] handed to the persister

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a device (registry id)
pub type DeviceId = String;

/// Metric types a device publishes, one topic each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    /// Ambient temperature in °C
    Temperature,
    /// Relative humidity in %
    Humidity,
    /// Air quality index
    AirQuality,
}

impl Metric {
    /// Every metric, in catalogue order
    pub const ALL: [Metric; 3] = [Metric::Temperature, Metric::Humidity, Metric::AirQuality];

    /// Last path segment used on the wire (`<slug>/<segment>`)
    pub fn topic_segment(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::AirQuality => "airquality",
        }
    }

    /// Field name used in stored readings
    pub fn field_name(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::AirQuality => "airQuality",
        }
    }

    /// Map a topic segment to a metric (case-insensitive exact match)
    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.topic_segment().eq_ignore_ascii_case(segment))
    }

    /// Map a full topic to a metric using its last path segment
    pub fn from_topic(topic: &str) -> Option<Self> {
        topic.rsplit('/').next().and_then(Self::from_segment)
    }

    fn index(&self) -> usize {
        match self {
            Metric::Temperature => 0,
            Metric::Humidity => 1,
            Metric::AirQuality => 2,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// One value slot per metric
///
/// Slots that never received a value stay `None`; they are omitted from
/// stored readings rather than defaulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(
        default,
        rename = "airQuality",
        skip_serializing_if = "Option::is_none"
    )]
    pub air_quality: Option<f64>,
}

impl MetricValues {
    /// Create an all-absent set
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value for a metric
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.slots()[metric.index()]
    }

    /// Write a value into a metric slot, replacing any previous value
    pub fn set(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::Temperature => self.temperature = Some(value),
            Metric::Humidity => self.humidity = Some(value),
            Metric::AirQuality => self.air_quality = Some(value),
        }
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, value);
        self
    }

    /// Every slot is present
    pub fn is_complete(&self) -> bool {
        self.slots().iter().all(Option::is_some)
    }

    /// Every slot is absent
    pub fn is_empty(&self) -> bool {
        self.slots().iter().all(Option::is_none)
    }

    /// Number of present slots
    pub fn present_count(&self) -> usize {
        self.slots().iter().filter(|v| v.is_some()).count()
    }

    /// Iterate over present `(metric, value)` pairs in catalogue order
    pub fn present(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        Metric::ALL
            .into_iter()
            .filter_map(move |m| self.get(m).map(|v| (m, v)))
    }

    /// Reset every slot to absent
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn slots(&self) -> [Option<f64>; 3] {
        [self.temperature, self.humidity, self.air_quality]
    }
}

/// A finalized, timestamped reading for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device the reading belongs to
    #[serde(rename = "device")]
    pub device_id: DeviceId,
    /// Flush time (server clock)
    pub timestamp: DateTime<Utc>,
    /// Metric values present at flush time
    #[serde(flatten)]
    pub values: MetricValues,
}

impl Reading {
    /// Create a reading stamped with the current time
    pub fn now(device_id: impl Into<DeviceId>, values: MetricValues) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            values,
        }
    }

    /// At least one metric is absent
    pub fn is_partial(&self) -> bool {
        !self.values.is_complete()
    }
}
