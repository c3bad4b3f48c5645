// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent configuration.
//!
//! Supports both programmatic and file-based configuration.

use crate::announcer::Announcer;
use crate::error::{AnnounceError, ConfigError};
use crate::properties::{
    default_partition_weights, PartitionData, PartitionWeights, UriSpecificProperties,
};
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name (for identification).
    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Status reporting interval (seconds, 0 to disable).
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Announcements to manage.
    #[serde(default)]
    pub announcers: Vec<AnnouncerConfig>,
}

fn default_agent_name() -> String {
    "beacon-agent".to_string()
}

fn default_status_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            status_interval_secs: default_status_interval(),
            log_level: default_log_level(),
            announcers: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configuration announcing a single address.
    pub fn single(cluster: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            announcers: vec![AnnouncerConfig::new(cluster, address)],
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announcers.is_empty() {
            return Err(ConfigError::Invalid("No announcers configured".into()));
        }

        let mut seen = HashSet::new();
        for (i, announcer) in self.announcers.iter().enumerate() {
            announcer.validate(i)?;
            if !seen.insert((announcer.cluster.as_str(), announcer.address.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "Announcer {} duplicates {} in cluster {}",
                    i, announcer.address, announcer.cluster
                )));
            }
        }

        Ok(())
    }

    /// Add an announcer.
    pub fn add_announcer(&mut self, announcer: AnnouncerConfig) {
        self.announcers.push(announcer);
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

/// Configuration for a single announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncerConfig {
    /// Cluster to announce in.
    pub cluster: String,

    /// Address to announce.
    pub address: String,

    /// Cluster used for dark warmup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_cluster: Option<String>,

    /// Enable dark warmup.
    #[serde(default)]
    pub warmup_enabled: bool,

    /// Time spent in the warmup cluster (seconds).
    #[serde(default)]
    pub warmup_duration_secs: u64,

    /// Partition weights. Empty means partition 0 with weight 1.0.
    #[serde(default)]
    pub partitions: Vec<PartitionWeightConfig>,

    /// Extra uri-specific properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl AnnouncerConfig {
    /// Create a new announcer config.
    pub fn new(cluster: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            address: address.into(),
            warmup_cluster: None,
            warmup_enabled: false,
            warmup_duration_secs: 0,
            partitions: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Enable dark warmup through `cluster`.
    pub fn warmup(mut self, cluster: impl Into<String>, duration_secs: u64) -> Self {
        self.warmup_cluster = Some(cluster.into());
        self.warmup_enabled = true;
        self.warmup_duration_secs = duration_secs;
        self
    }

    /// Add a partition weight.
    pub fn partition(mut self, id: i32, weight: f64) -> Self {
        self.partitions.push(PartitionWeightConfig { id, weight });
        self
    }

    /// Add an extra property.
    pub fn property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.cluster.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Announcer {} has empty cluster",
                index
            )));
        }

        Url::parse(&self.address).map_err(|e| {
            ConfigError::Invalid(format!(
                "Announcer {} has invalid address {}: {}",
                index, self.address, e
            ))
        })?;

        if self.warmup_enabled {
            match self.warmup_cluster.as_deref() {
                None | Some("") => {
                    return Err(ConfigError::Invalid(format!(
                        "Announcer {} enables warmup without a warmup cluster",
                        index
                    )));
                }
                Some(warmup) if warmup == self.cluster => {
                    return Err(ConfigError::Invalid(format!(
                        "Announcer {} uses its own cluster ({}) for warmup",
                        index, self.cluster
                    )));
                }
                Some(_) => {}
            }
        }

        for partition in &self.partitions {
            if !partition.weight.is_finite() || partition.weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "Announcer {} has invalid weight {} for partition {}",
                    index, partition.weight, partition.id
                )));
            }
        }

        Ok(())
    }

    /// Partition weights to announce.
    pub fn partition_weights(&self) -> PartitionWeights {
        if self.partitions.is_empty() {
            return default_partition_weights(1.0);
        }
        self.partitions
            .iter()
            .map(|p| (p.id, PartitionData::new(p.weight)))
            .collect()
    }

    pub fn warmup_duration(&self) -> Duration {
        Duration::from_secs(self.warmup_duration_secs)
    }

    /// Build the announcer. `scheduler` drives the warmup timer.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(&self, scheduler: Arc<dyn Scheduler>) -> Result<Announcer, AnnounceError> {
        let address =
            Url::parse(&self.address).map_err(|e| AnnounceError::InvalidAddress {
                cluster: self.cluster.clone(),
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        let properties: UriSpecificProperties = self.properties.clone();
        let mut builder = Announcer::builder(self.cluster.clone())
            .address(address)
            .partition_weights(self.partition_weights())
            .extra_properties(properties)
            .scheduler(scheduler)
            .warmup_enabled(self.warmup_enabled)
            .warmup_duration(self.warmup_duration());

        if let Some(warmup) = &self.warmup_cluster {
            builder = builder.warmup_cluster(warmup.clone());
        }

        builder.build()
    }
}

/// Weight of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionWeightConfig {
    /// Partition id.
    pub id: i32,

    /// Relative weight (>= 0).
    pub weight: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::io::Write;

    const EXAMPLE: &str = r#"
name = "profile-agent"
status_interval_secs = 5

[[announcers]]
cluster = "profile-service"
address = "http://10.0.0.12:8080/profile"
warmup_cluster = "profile-service-warmup"
warmup_enabled = true
warmup_duration_secs = 30

[[announcers.partitions]]
id = 0
weight = 0.5

[[announcers.partitions]]
id = 3
weight = 2.0

[announcers.properties]
zone = "us-east-1a"
"#;

    #[test]
    fn test_parse_example() {
        let config: AgentConfig = toml::from_str(EXAMPLE).expect("parse");
        assert_eq!(config.name, "profile-agent");
        assert_eq!(config.status_interval(), Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());

        let announcer = &config.announcers[0];
        assert_eq!(announcer.warmup_cluster.as_deref(), Some("profile-service-warmup"));
        assert_eq!(announcer.warmup_duration(), Duration::from_secs(30));
        let weights = announcer.partition_weights();
        assert_eq!(weights.len(), 2);
        assert_eq!(weights[&3].weight(), 2.0);
        assert_eq!(announcer.properties["zone"], serde_json::json!("us-east-1a"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(EXAMPLE.as_bytes()).expect("write");
        let config = AgentConfig::from_file(file.path()).expect("load");
        assert_eq!(config.announcers.len(), 1);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"name = \"empty\"\n").expect("write");
        assert!(matches!(
            AgentConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            AgentConfig::from_file("/nonexistent/beacon.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_err()); // No announcers

        config.add_announcer(AnnouncerConfig::new("", "http://h:1/"));
        assert!(config.validate().is_err()); // Empty cluster

        config.announcers[0] = AnnouncerConfig::new("c", "not a url");
        assert!(config.validate().is_err());

        config.announcers[0] = AnnouncerConfig::new("c", "http://h:1/").warmup("c", 5);
        assert!(config.validate().is_err()); // Warmup in own cluster

        let mut no_warmup_cluster = AnnouncerConfig::new("c", "http://h:1/");
        no_warmup_cluster.warmup_enabled = true;
        config.announcers[0] = no_warmup_cluster;
        assert!(config.validate().is_err());

        config.announcers[0] = AnnouncerConfig::new("c", "http://h:1/").partition(0, -1.0);
        assert!(config.validate().is_err());

        config.announcers[0] = AnnouncerConfig::new("c", "http://h:1/").partition(0, f64::NAN);
        assert!(config.validate().is_err());

        config.announcers[0] = AnnouncerConfig::new("c", "http://h:1/");
        assert!(config.validate().is_ok());

        config.add_announcer(AnnouncerConfig::new("c", "http://h:1/"));
        assert!(config.validate().is_err()); // Duplicate
    }

    #[test]
    fn test_default_partition() {
        let announcer = AnnouncerConfig::new("c", "http://h:1/");
        let weights = announcer.partition_weights();
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[&0].weight(), 1.0);
    }

    #[test]
    fn test_config_serialization() {
        let config = AgentConfig::single("c", "http://h:1/");
        let toml_str = config.to_toml().expect("serialize");
        assert!(toml_str.contains("cluster = \"c\""));
        let parsed: AgentConfig = toml::from_str(&toml_str).expect("reparse");
        assert!(parsed.validate().is_ok());
    }

    #[tokio::test]
    async fn test_build_announcer() {
        let config = AnnouncerConfig::new("c", "http://h:1/svc")
            .warmup("c-warmup", 10)
            .partition(2, 0.25)
            .property("zone", serde_json::json!("b"));
        let scheduler = Arc::new(TokioScheduler::current().expect("runtime"));

        let announcer = config.build(scheduler).expect("build");
        assert_eq!(announcer.cluster(), "c");
        assert_eq!(announcer.warmup_cluster().as_deref(), Some("c-warmup"));
        assert_eq!(
            announcer.address(),
            Some(Url::parse("http://h:1/svc").expect("url"))
        );
        assert_eq!(announcer.partition_weights()[&2].weight(), 0.25);
        assert_eq!(announcer.extra_properties()["zone"], serde_json::json!("b"));
        assert!(!announcer.is_up());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_address() {
        let config = AnnouncerConfig::new("c", "not a url");
        let scheduler = Arc::new(TokioScheduler::current().expect("runtime"));

        let err = config.build(scheduler).expect_err("invalid address");
        assert!(matches!(
            &err,
            AnnounceError::InvalidAddress { cluster, address, .. }
                if cluster == "c" && address == "not a url"
        ));
        assert!(err.to_string().starts_with("Invalid address not a url for cluster c"));
    }
}
