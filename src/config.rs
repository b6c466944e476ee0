// Zephy - Device telemetry ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the ingestion pipeline
//!
//! Every field has a default; a TOML file only needs the values that
//! differ. Broker credentials can also come from the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Default partial-flush timeout (60 s)
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 60_000;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Broker connection
    pub broker: BrokerConfig,
    /// Reading coalescer
    pub coalescer: CoalescerConfig,
    /// Persistence worker pool
    pub persist: PersistConfig,
    /// Transport → dispatch event queue capacity
    pub events_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            coalescer: CoalescerConfig::default(),
            persist: PersistConfig::default(),
            events_capacity: 256,
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MQTT_BROKER_URL`, `MQTT_BROKER_PORT`, `MQTT_USERNAME`,
    /// `MQTT_PASSWORD` from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides from an arbitrary lookup
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MQTT_BROKER_URL") {
            self.broker.url = url;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            self.broker.port = port.trim().parse().map_err(|_| {
                IngestError::Config(format!("MQTT_BROKER_PORT is not a port: {}", port))
            })?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        Ok(())
    }

    /// Validate pipeline settings (broker settings are checked separately
    /// by [`BrokerConfig::validate`])
    pub fn validate(&self) -> Result<()> {
        if self.coalescer.flush_timeout_ms == 0 {
            return Err(IngestError::Config(
                "coalescer.flush_timeout_ms must be > 0".into(),
            ));
        }
        if self.persist.workers == 0 {
            return Err(IngestError::Config("persist.workers must be > 0".into()));
        }
        if self.persist.queue_capacity == 0 {
            return Err(IngestError::Config(
                "persist.queue_capacity must be > 0".into(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(IngestError::Config("events_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address, with or without `mqtt://` / `mqtts://`
    pub url: String,
    /// Broker port (8883 for mqtts)
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id; generated when absent
    pub client_id: Option<String>,
    /// Force TLS on/off; inferred from the URL scheme when absent
    pub tls: Option<bool>,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    /// Bound on a single connect attempt
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            port: 8883,
            username: None,
            password: None,
            client_id: None,
            tls: None,
            reconnect_interval_ms: 5_000,
            connect_timeout_ms: 30_000,
            keep_alive_secs: 30,
            clean_session: true,
        }
    }
}

impl BrokerConfig {
    /// Split the URL into scheme (if any) and the remainder
    fn split_scheme(&self) -> (Option<&str>, &str) {
        match self.url.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, self.url.as_str()),
        }
    }

    /// Host name and port to connect to
    ///
    /// A port embedded in the URL (`host:1883`) takes precedence over
    /// [`port`](Self::port).
    pub fn endpoint(&self) -> (String, u16) {
        let (_, rest) = self.split_scheme();
        let authority = rest.split('/').next().unwrap_or_default();
        match authority.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (authority.to_string(), self.port),
            },
            None => (authority.to_string(), self.port),
        }
    }

    /// Whether the session is encrypted
    pub fn use_tls(&self) -> bool {
        if let Some(tls) = self.tls {
            return tls;
        }
        !matches!(self.split_scheme().0, Some("mqtt") | Some("tcp"))
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("zephy-ingest-{}", std::process::id()))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Check that a broker and credentials are configured
    pub fn validate(&self) -> Result<()> {
        if self.endpoint().0.is_empty() {
            return Err(IngestError::Config("broker.url is not set".into()));
        }
        if self.username.is_none() || self.password.is_none() {
            return Err(IngestError::Config(
                "broker.username and broker.password are required".into(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.reconnect_interval_ms == 0 {
            return Err(IngestError::Config(
                "broker timeouts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Reading coalescer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Time after the last accepted metric before a partial flush
    pub flush_timeout_ms: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
        }
    }
}

impl CoalescerConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flush_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Persistence pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Concurrent persistence calls
    pub workers: usize,
    /// Readings waiting for a worker before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.broker.connect_timeout(), Duration::from_secs(30));
        assert!(config.broker.clean_session);
        assert_eq!(config.coalescer.flush_timeout(), Duration::from_secs(60));
        assert_eq!(config.persist.workers, 4);
        assert_eq!(config.events_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_timeout_saturates() {
        let config = CoalescerConfig::with_timeout(Duration::from_millis(1500));
        assert_eq!(config.flush_timeout_ms, 1500);

        let config = CoalescerConfig::with_timeout(Duration::MAX);
        assert_eq!(config.flush_timeout_ms, u64::MAX);
    }

    #[test]
    fn test_partial_toml() {
        let config: IngestConfig = toml::from_str(
            r#"
            events_capacity = 64

            [broker]
            url = "mqtts://broker.example.com"
            username = "zephy"

            [coalescer]
            flush_timeout_ms = 15000
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.username.as_deref(), Some("zephy"));
        assert_eq!(config.coalescer.flush_timeout(), Duration::from_secs(15));
        assert_eq!(config.persist.queue_capacity, 1024);
        assert_eq!(config.events_capacity, 64);
    }

    #[test]
    fn test_endpoint_parsing() {
        let mut broker = BrokerConfig {
            url: "mqtts://abc.s1.eu.hivemq.cloud".into(),
            ..Default::default()
        };
        assert_eq!(broker.endpoint(), ("abc.s1.eu.hivemq.cloud".into(), 8883));
        assert!(broker.use_tls());

        broker.url = "abc.s1.eu.hivemq.cloud".into();
        assert_eq!(broker.endpoint().0, "abc.s1.eu.hivemq.cloud");
        assert!(broker.use_tls());

        broker.url = "mqtt://localhost:1883/".into();
        assert_eq!(broker.endpoint(), ("localhost".into(), 1883));
        assert!(!broker.use_tls());

        broker.tls = Some(true);
        assert!(broker.use_tls());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = IngestConfig::default();
        config
            .apply_env_with(|key| match key {
                "MQTT_BROKER_URL" => Some("broker.local".into()),
                "MQTT_BROKER_PORT" => Some("8884".into()),
                "MQTT_USERNAME" => Some("user".into()),
                "MQTT_PASSWORD" => Some("secret".into()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.broker.endpoint(), ("broker.local".into(), 8884));
        assert!(config.broker.validate().is_ok());
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = IngestConfig::default();
        let result = config.apply_env_with(|key| {
            (key == "MQTT_BROKER_PORT").then(|| "eighty".to_string())
        });
        assert!(matches!(result, Err(IngestError::Config(_))));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = IngestConfig::default();
        config.persist.workers = 0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.coalescer.flush_timeout_ms = 0;
        assert!(config.validate().is_err());

        let broker = BrokerConfig::default();
        assert!(matches!(broker.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zephy.toml");
        std::fs::write(&path, "[persist]\nworkers = 2\n").unwrap();

        let config = IngestConfig::from_file(&path).unwrap();
        assert_eq!(config.persist.workers, 2);

        std::fs::write(&path, "[persist]\nworkers = 0\n").unwrap();
        assert!(IngestConfig::from_file(&path).is_err());
    }
}
