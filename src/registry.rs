// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Device/location registry boundary
//!
//! The registry is owned elsewhere; the pipeline only asks for the current
//! set of enabled devices joined with their location's display name, and
//! only when (re)building the topic directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::metric::DeviceId;

/// An enabled device joined with its location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub device_id: DeviceId,
    pub location_id: Option<String>,
    /// Display name; `None` when the device has no resolvable location
    pub location_name: Option<String>,
}

impl RegistryEntry {
    pub fn new(
        device_id: impl Into<DeviceId>,
        location_id: impl Into<String>,
        location_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            location_id: Some(location_id.into()),
            location_name: Some(location_name.into()),
        }
    }

    /// A device whose location could not be resolved
    pub fn unlocated(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            location_id: None,
            location_name: None,
        }
    }
}

/// Source of registry snapshots
#[async_trait]
pub trait Registry: Send + Sync {
    /// All enabled devices, each joined to its location
    async fn enabled_devices(&self) -> Result<Vec<RegistryEntry>>;
}

/// Location row of a registry file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Device row of a registry file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Registry snapshot file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub locations: Vec<LocationRecord>,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

impl RegistryFile {
    /// Parse a TOML registry snapshot
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Join enabled devices with their locations
    pub fn enabled_entries(&self) -> Vec<RegistryEntry> {
        let names: HashMap<&str, Option<&str>> = self
            .locations
            .iter()
            .map(|l| (l.id.as_str(), l.name.as_deref()))
            .collect();

        self.devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| {
                let location_name = d
                    .location
                    .as_deref()
                    .and_then(|id| names.get(id).copied().flatten())
                    .map(str::to_string);
                RegistryEntry {
                    device_id: d.id.clone(),
                    location_id: d.location.clone(),
                    location_name,
                }
            })
            .collect()
    }
}

/// TOML-file-backed registry
///
/// The file is re-read on every query, so editing it and triggering a
/// reload picks up topology changes without a restart.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn enabled_devices(&self) -> Result<Vec<RegistryEntry>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            IngestError::Registry(format!("reading {}: {}", self.path.display(), e))
        })?;
        Ok(RegistryFile::parse(&content)?.enabled_entries())
    }
}
