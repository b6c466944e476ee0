// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-metric sanity checks
//!
//! A value must be finite and fall inside a static closed range for its
//! metric. Rejected values never reach a device buffer.

use crate::metric::Metric;
use std::fmt;

/// Closed value range for one metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricRange {
    pub min: f64,
    pub max: f64,
}

impl MetricRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Inclusive on both ends
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Why a value was refused
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// NaN or ±infinity
    NotFinite,
    /// Outside the metric's closed range
    OutOfRange { min: f64, max: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotFinite => write!(f, "value is not finite"),
            Rejection::OutOfRange { min, max } => {
                write!(f, "value outside [{}, {}]", min, max)
            }
        }
    }
}

/// Stateless range gate
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationGate;

impl ValidationGate {
    pub fn new() -> Self {
        Self
    }

    /// Static range for a metric
    pub fn range(metric: Metric) -> MetricRange {
        match metric {
            Metric::Temperature => MetricRange::new(-50.0, 100.0),
            Metric::Humidity => MetricRange::new(0.0, 100.0),
            Metric::AirQuality => MetricRange::new(0.0, 500.0),
        }
    }

    /// Check a value, returning the reason on refusal
    pub fn check(&self, metric: Metric, value: f64) -> Result<(), Rejection> {
        if !value.is_finite() {
            return Err(Rejection::NotFinite);
        }
        let range = Self::range(metric);
        if !range.contains(value) {
            return Err(Rejection::OutOfRange {
                min: range.min,
                max: range.max,
            });
        }
        Ok(())
    }

    /// `true` when the value may enter a buffer
    pub fn validate(&self, metric: Metric, value: f64) -> bool {
        self.check(metric, value).is_ok()
    }
}

/// Parse a raw message payload as a decimal number
///
/// Returns `None` for non-UTF-8 or non-numeric payloads. Textual `NaN`/`inf`
/// parse successfully and are refused later by the gate.
pub fn parse_value(payload: &[u8]) -> Option<f64> {
    std::str::from_utf8(payload).ok()?.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds_are_inclusive() {
        let gate = ValidationGate::new();
        assert!(gate.validate(Metric::Temperature, -50.0));
        assert!(gate.validate(Metric::Temperature, 100.0));
        assert!(!gate.validate(Metric::Temperature, 100.01));
        assert!(gate.validate(Metric::Humidity, 0.0));
        assert!(!gate.validate(Metric::Humidity, -0.1));
        assert!(gate.validate(Metric::AirQuality, 500.0));
        assert!(!gate.validate(Metric::AirQuality, 501.0));
    }

    #[test]
    fn test_non_finite_rejected() {
        let gate = ValidationGate::new();
        assert_eq!(
            gate.check(Metric::Humidity, f64::NAN),
            Err(Rejection::NotFinite)
        );
        assert_eq!(
            gate.check(Metric::Temperature, f64::INFINITY),
            Err(Rejection::NotFinite)
        );
        assert_eq!(
            gate.check(Metric::AirQuality, f64::NEG_INFINITY),
            Err(Rejection::NotFinite)
        );
    }

    #[test]
    fn test_out_of_range_reports_bounds() {
        let gate = ValidationGate::new();
        let rejection = gate.check(Metric::Humidity, 140.0).unwrap_err();
        assert_eq!(
            rejection,
            Rejection::OutOfRange {
                min: 0.0,
                max: 100.0
            }
        );
        assert!(rejection.to_string().contains("[0, 100]"));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value(b"24.5"), Some(24.5));
        assert_eq!(parse_value(b"  61\n"), Some(61.0));
        assert_eq!(parse_value(b"-3e1"), Some(-30.0));
        assert_eq!(parse_value(b"warm"), None);
        assert_eq!(parse_value(b""), None);
        assert_eq!(parse_value(&[0xff, 0xfe]), None);
        assert!(parse_value(b"NaN").unwrap().is_nan());
    }
}
