// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Topic directory
//!
//! Maps `<location-slug>/<metric>` topics to device ids. A directory is
//! built in one pass from a registry snapshot and never mutated afterwards;
//! topology changes produce a new directory that replaces the old one.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::metric::{DeviceId, Metric};
use crate::registry::RegistryEntry;

/// Normalize a location display name into a topic-safe slug
///
/// Diacritics are stripped, letters lowercased, and every run of
/// characters outside `[a-z0-9]` collapses to a single `-`. Leading and
/// trailing dashes are trimmed.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.nfd().filter(|c| !is_combining_mark(*c)) {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Build a topic key from a slug and metric
pub fn topic_key(slug: &str, metric: Metric) -> String {
    format!("{}/{}", slug, metric.topic_segment())
}

/// A slug claimed by more than one device; the last one processed wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugCollision {
    pub slug: String,
    pub previous: DeviceId,
    pub winner: DeviceId,
}

/// Immutable topic → device mapping
#[derive(Debug, Clone, Default)]
pub struct TopicDirectory {
    routes: HashMap<String, DeviceId>,
    collisions: Vec<SlugCollision>,
    skipped: Vec<DeviceId>,
}

impl TopicDirectory {
    /// An empty directory (nothing subscribed yet)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a directory from a registry snapshot
    ///
    /// Devices without a resolvable location name are skipped with a
    /// warning. When two devices normalize to the same slug, the later one
    /// overwrites the earlier one and the collision is logged.
    pub fn build(entries: &[RegistryEntry]) -> Self {
        let mut routes = HashMap::with_capacity(entries.len() * Metric::ALL.len());
        let mut owners: HashMap<String, &RegistryEntry> = HashMap::new();
        let mut collisions = Vec::new();
        let mut skipped = Vec::new();

        for entry in entries {
            let slug = match entry.location_name.as_deref().map(slugify) {
                Some(slug) if !slug.is_empty() => slug,
                _ => {
                    warn!(device = %entry.device_id, "Device without a valid location, skipping");
                    skipped.push(entry.device_id.clone());
                    continue;
                }
            };

            if let Some(previous) = owners.insert(slug.clone(), entry) {
                if previous.device_id != entry.device_id {
                    warn!(
                        slug = %slug,
                        previous = %previous.device_id,
                        winner = %entry.device_id,
                        same_location = previous.location_id == entry.location_id,
                        "Location slug collision, last device wins"
                    );
                    collisions.push(SlugCollision {
                        slug: slug.clone(),
                        previous: previous.device_id.clone(),
                        winner: entry.device_id.clone(),
                    });
                }
            }

            debug!(
                location = entry.location_name.as_deref().unwrap_or_default(),
                slug = %slug,
                device = %entry.device_id,
                "Mapped location"
            );

            for metric in Metric::ALL {
                routes.insert(topic_key(&slug, metric), entry.device_id.clone());
            }
        }

        info!(
            devices = entries.len(),
            topics = routes.len(),
            collisions = collisions.len(),
            "Topic directory built"
        );

        Self {
            routes,
            collisions,
            skipped,
        }
    }

    /// Device id for a topic, if routed
    pub fn resolve(&self, topic: &str) -> Option<&DeviceId> {
        self.routes.get(topic)
    }

    /// Whether a topic is routed
    pub fn contains(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }

    /// All routed topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Distinct devices reachable through this directory
    pub fn device_count(&self) -> usize {
        let mut devices: Vec<&DeviceId> = self.routes.values().collect();
        devices.sort();
        devices.dedup();
        devices.len()
    }

    /// Number of routed topics
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Slug collisions observed while building
    pub fn collisions(&self) -> &[SlugCollision] {
        &self.collisions
    }

    /// Devices skipped for lack of a location
    pub fn skipped(&self) -> &[DeviceId] {
        &self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_case_and_whitespace() {
        assert_eq!(slugify("Puerto Maldonado"), "puerto-maldonado");
        assert_eq!(slugify("PUERTO   MALDONADO"), "puerto-maldonado");
        assert_eq!(slugify("  --Puerto_Maldonado!! "), "puerto-maldonado");
    }

    #[test]
    fn test_slugify_strips_diacritics() {
        assert_eq!(slugify("Habitación Principal"), "habitacion-principal");
        assert_eq!(slugify("Ñuñoa"), "nunoa");
        assert_eq!(slugify("São Paulo 2"), "sao-paulo-2");
    }

    #[test]
    fn test_slugify_degenerate() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify("42"), "42");
    }

    #[test]
    fn test_build_emits_one_topic_per_metric() {
        let dir = TopicDirectory::build(&[RegistryEntry::new("D1", "l1", "Puerto Maldonado")]);

        assert_eq!(dir.len(), 3);
        assert_eq!(
            dir.topics(),
            vec![
                "puerto-maldonado/airquality",
                "puerto-maldonado/humidity",
                "puerto-maldonado/temperature",
            ]
        );
        assert_eq!(
            dir.resolve("puerto-maldonado/humidity").map(String::as_str),
            Some("D1")
        );
        assert!(dir.resolve("puerto-maldonado/co2").is_none());
    }

    #[test]
    fn test_build_skips_unlocated() {
        let dir = TopicDirectory::build(&[
            RegistryEntry::unlocated("D1"),
            RegistryEntry::new("D2", "l2", "***"),
            RegistryEntry::new("D3", "l3", "Lima"),
        ]);

        assert_eq!(dir.len(), 3);
        assert_eq!(dir.device_count(), 1);
        assert_eq!(dir.skipped(), &["D1".to_string(), "D2".to_string()]);
    }

    #[test]
    fn test_collision_last_write_wins() {
        let dir = TopicDirectory::build(&[
            RegistryEntry::new("D1", "l1", "Puerto Maldonado"),
            RegistryEntry::new("D2", "l2", "PUERTO   MALDONADO"),
        ]);

        assert_eq!(dir.len(), 3);
        assert_eq!(
            dir.resolve("puerto-maldonado/temperature")
                .map(String::as_str),
            Some("D2")
        );
        assert_eq!(
            dir.collisions(),
            &[SlugCollision {
                slug: "puerto-maldonado".into(),
                previous: "D1".into(),
                winner: "D2".into(),
            }]
        );
    }

    #[test]
    fn test_empty_directory() {
        let dir = TopicDirectory::build(&[]);
        assert!(dir.is_empty());
        assert!(dir.topics().is_empty());
        assert!(TopicDirectory::empty().is_empty());
    }
}
