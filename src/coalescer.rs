// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Reading coalescer
//!
//! Devices publish each metric as its own message. The coalescer keeps one
//! buffer per device and merges those messages into a single [`Reading`]:
//!
//! - a buffer that becomes complete is flushed immediately;
//! - otherwise the buffer's flush deadline is (re)armed, and once it passes
//!   whatever arrived is flushed as a partial reading.
//!
//! The coalescer itself is synchronous and clock-agnostic: callers pass
//! `now` and poll [`expire`](ReadingCoalescer::expire) at
//! [`next_deadline`](ReadingCoalescer::next_deadline). Each buffer holds at
//! most one deadline, and accepting a value always clears it before
//! re-arming, so a buffer cannot be flushed twice for one accumulation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{IngestError, Result};
use crate::metric::{DeviceId, MetricValues, Reading};
use crate::subscription::Sample;
use crate::validation::ValidationGate;

/// Per-device accumulation state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceBuffer {
    values: MetricValues,
    deadline: Option<Instant>,
}

impl DeviceBuffer {
    /// Values accumulated since the last flush
    pub fn values(&self) -> &MetricValues {
        &self.values
    }

    /// Pending partial-flush deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn take(&mut self) -> MetricValues {
        self.deadline = None;
        std::mem::take(&mut self.values)
    }
}

/// Merges single-metric samples into per-device readings
#[derive(Debug)]
pub struct ReadingCoalescer {
    gate: ValidationGate,
    flush_timeout: Duration,
    buffers: HashMap<DeviceId, DeviceBuffer>,
}

impl ReadingCoalescer {
    pub fn new(flush_timeout: Duration) -> Self {
        Self {
            gate: ValidationGate::new(),
            flush_timeout,
            buffers: HashMap::new(),
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    /// Feed one sample
    ///
    /// Returns the completed reading when this sample fills the last empty
    /// slot. Values refused by the gate return an error and leave the
    /// buffer and its deadline untouched.
    pub fn accept(&mut self, sample: Sample, now: Instant) -> Result<Option<Reading>> {
        self.gate
            .check(sample.metric, sample.value)
            .map_err(|rejection| IngestError::Rejected {
                device: sample.device_id.clone(),
                metric: sample.metric.to_string(),
                reason: rejection.to_string(),
            })?;

        let buffer = self.buffers.entry(sample.device_id.clone()).or_default();
        buffer.values.set(sample.metric, sample.value);
        buffer.deadline = None;

        if buffer.values.is_complete() {
            let values = buffer.take();
            self.buffers.remove(&sample.device_id);
            return Ok(Some(Reading::now(sample.device_id, values)));
        }

        buffer.deadline = Some(now + self.flush_timeout);
        Ok(None)
    }

    /// Flush every buffer whose deadline has passed
    ///
    /// Partial readings carry only the metrics that arrived. A buffer with
    /// nothing in it produces no reading.
    pub fn expire(&mut self, now: Instant) -> Vec<Reading> {
        let due: Vec<DeviceId> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut readings = Vec::with_capacity(due.len());
        for device_id in due {
            let Some(mut buffer) = self.buffers.remove(&device_id) else {
                continue;
            };
            let values = buffer.take();
            if values.is_empty() {
                continue;
            }
            readings.push(Reading::now(device_id, values));
        }
        readings
    }

    /// Earliest pending deadline across all devices
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers.values().filter_map(|b| b.deadline).min()
    }

    /// Drop every buffer and its deadline without flushing
    ///
    /// Returns the number of deadlines that were pending.
    pub fn cancel_all(&mut self) -> usize {
        let pending = self
            .buffers
            .values()
            .filter(|b| b.deadline.is_some())
            .count();
        self.buffers.clear();
        pending
    }

    /// Devices with an accumulation in progress
    pub fn pending_devices(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, device_id: &str) -> Option<&DeviceBuffer> {
        self.buffers.get(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn sample(device: &str, metric: Metric, value: f64) -> Sample {
        Sample {
            device_id: device.into(),
            metric,
            value,
        }
    }

    #[test]
    fn test_complete_flushes_immediately() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();

        assert!(coalescer
            .accept(sample("D1", Metric::Temperature, 24.5), t0)
            .unwrap()
            .is_none());
        assert!(coalescer
            .accept(sample("D1", Metric::Humidity, 61.0), t0)
            .unwrap()
            .is_none());
        let reading = coalescer
            .accept(sample("D1", Metric::AirQuality, 42.0), t0)
            .unwrap()
            .unwrap();

        assert_eq!(reading.device_id, "D1");
        assert!(!reading.is_partial());
        assert_eq!(reading.values.temperature, Some(24.5));
        assert_eq!(coalescer.pending_devices(), 0);
        assert!(coalescer.next_deadline().is_none());
        assert!(coalescer.expire(t0 + TIMEOUT * 2).is_empty());
    }

    #[test]
    fn test_partial_flush_after_timeout() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();

        coalescer
            .accept(sample("D1", Metric::Temperature, 24.5), t0)
            .unwrap();
        coalescer
            .accept(sample("D1", Metric::Humidity, 61.0), t0)
            .unwrap();

        assert!(coalescer.expire(t0 + TIMEOUT - Duration::from_millis(1)).is_empty());

        let readings = coalescer.expire(t0 + TIMEOUT);
        assert_eq!(readings.len(), 1);
        let values = readings[0].values;
        assert_eq!(values.temperature, Some(24.5));
        assert_eq!(values.humidity, Some(61.0));
        assert_eq!(values.air_quality, None);

        // Exactly one flush per accumulation
        assert!(coalescer.expire(t0 + TIMEOUT * 3).is_empty());
        assert!(coalescer.buffer("D1").is_none());
    }

    #[test]
    fn test_accept_rearms_deadline() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(40);

        coalescer
            .accept(sample("D1", Metric::Temperature, 20.0), t0)
            .unwrap();
        coalescer
            .accept(sample("D1", Metric::Temperature, 21.0), t1)
            .unwrap();

        assert_eq!(coalescer.next_deadline(), Some(t1 + TIMEOUT));
        assert!(coalescer.expire(t0 + TIMEOUT).is_empty());

        let readings = coalescer.expire(t1 + TIMEOUT);
        assert_eq!(readings[0].values.temperature, Some(21.0));
    }

    #[test]
    fn test_rejected_value_leaves_state_untouched() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();

        coalescer
            .accept(sample("D1", Metric::Humidity, 50.0), t0)
            .unwrap();
        let before = coalescer.buffer("D1").cloned();

        let result = coalescer.accept(
            sample("D1", Metric::Temperature, 180.0),
            t0 + Duration::from_secs(30),
        );
        assert!(matches!(result, Err(IngestError::Rejected { .. })));
        assert!(coalescer
            .accept(sample("D1", Metric::AirQuality, f64::NAN), t0)
            .is_err());

        assert_eq!(coalescer.buffer("D1").cloned(), before);
        assert_eq!(coalescer.next_deadline(), Some(t0 + TIMEOUT));
    }

    #[test]
    fn test_rejected_first_value_creates_no_buffer() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        assert!(coalescer
            .accept(sample("D9", Metric::Humidity, 101.0), Instant::now())
            .is_err());
        assert_eq!(coalescer.pending_devices(), 0);
        assert!(coalescer.next_deadline().is_none());
    }

    #[test]
    fn test_devices_are_independent() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();

        coalescer
            .accept(sample("D1", Metric::Temperature, 20.0), t0)
            .unwrap();
        coalescer
            .accept(sample("D2", Metric::Humidity, 30.0), t0 + Duration::from_secs(10))
            .unwrap();

        let readings = coalescer.expire(t0 + TIMEOUT);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "D1");
        assert_eq!(
            coalescer.next_deadline(),
            Some(t0 + Duration::from_secs(10) + TIMEOUT)
        );
    }

    #[test]
    fn test_later_value_overwrites_slot() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();

        coalescer
            .accept(sample("D1", Metric::Temperature, 20.0), t0)
            .unwrap();
        coalescer
            .accept(sample("D1", Metric::Temperature, 22.0), t0)
            .unwrap();
        assert_eq!(
            coalescer.buffer("D1").unwrap().values().temperature,
            Some(22.0)
        );
        assert_eq!(coalescer.buffer("D1").unwrap().values().present_count(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let mut coalescer = ReadingCoalescer::new(TIMEOUT);
        let t0 = Instant::now();
        coalescer
            .accept(sample("D1", Metric::Temperature, 20.0), t0)
            .unwrap();
        coalescer
            .accept(sample("D2", Metric::Temperature, 20.0), t0)
            .unwrap();

        assert_eq!(coalescer.cancel_all(), 2);
        assert_eq!(coalescer.pending_devices(), 0);
        assert!(coalescer.expire(t0 + TIMEOUT).is_empty());
    }
}
