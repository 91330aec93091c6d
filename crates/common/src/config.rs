//! Engine and session configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::NodeConfig;

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout budgets
    pub timeouts: TimeoutConfig,

    /// Embedded listener configuration
    pub listener: ListenerConfig,

    /// Manual driver configuration
    pub manual: ManualConfig,

    /// Scheduling configuration
    pub scheduler: SchedulerConfig,
}

/// Timeout budgets, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a single driver observation or control call
    pub operation_ms: u64,

    /// Default budget for awaiting an inbound message
    pub await_ms: u64,

    /// Budget for provisioning or deprovisioning one node
    pub provision_ms: u64,

    /// Optional budget for a whole run
    pub run_ms: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_ms: 30_000,
            await_ms: 30_000,
            provision_ms: 120_000,
            run_ms: None,
        }
    }
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn await_inbound(&self) -> Duration {
        Duration::from_millis(self.await_ms)
    }

    pub fn provision(&self) -> Duration {
        Duration::from_millis(self.provision_ms)
    }

    pub fn run(&self) -> Option<Duration> {
        self.run_ms.map(Duration::from_millis)
    }
}

/// Embedded listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind; port 0 picks a free port
    pub bind: SocketAddr,

    /// Externally visible base URL (defaults to http://<bound address>)
    pub public_base_url: Option<String>,

    /// Unmatched messages kept per run for late expectations
    pub buffer_capacity: usize,

    /// How long an unmatched message stays eligible for matching
    pub retention_ms: u64,

    /// Rejected inbound messages kept for inspection
    pub rejection_log_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            public_base_url: None,
            buffer_capacity: 64,
            retention_ms: 10_000,
            rejection_log_capacity: 256,
        }
    }
}

impl ListenerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Manual driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    /// Prompt attempts before malformed operator input becomes an error
    pub max_attempts: u32,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run disjoint constellations concurrently
    pub parallel: bool,

    /// Upper bound on concurrently executing constellations
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_parallel: 4,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading engine configuration from {}", path.display());
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.manual.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "manual.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_parallel == 0 {
            return Err(Error::InvalidConfig(
                "scheduler.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.listener.buffer_capacity == 0 {
            return Err(Error::InvalidConfig(
                "listener.buffer_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Role-to-driver assignment for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Registered driver name
    pub driver: String,

    #[serde(flatten)]
    pub node: NodeConfig,
}

impl BindingConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            node: NodeConfig::default(),
        }
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }
}

/// A named assignment of roles to driver bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstellationConfig {
    pub name: String,

    #[serde(default)]
    pub roles: BTreeMap<String, BindingConfig>,
}

impl ConstellationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, role: impl Into<String>, binding: BindingConfig) -> Self {
        self.roles.insert(role.into(), binding);
        self
    }

    /// Driver names used by this constellation
    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.roles.values().map(|b| b.driver.as_str())
    }
}

/// A session: which tests to run against which constellations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Test names to run; empty means every known test
    #[serde(default)]
    pub tests: Vec<String>,

    pub constellations: Vec<ConstellationConfig>,
}

impl SessionConfig {
    /// Parse a session from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let session: Self = serde_json::from_str(json)?;
        session.validate()?;
        Ok(session)
    }

    /// Parse a session from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let session: Self = serde_yaml::from_str(yaml)?;
        session.validate()?;
        Ok(session)
    }

    /// Parse a session file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(Error::InvalidConfig(format!(
                "Unrecognized session file type: {}",
                path.display()
            ))),
        }
    }

    /// Load all session files from a directory, in path order
    pub fn load_all(dir: &Path) -> Result<Vec<Self>> {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "json" || ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        info!("Loading {} session files from {}", paths.len(), dir.display());

        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for constellation in &self.constellations {
            if !seen.insert(constellation.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate constellation name: {}",
                    constellation.name
                )));
            }
        }
        Ok(())
    }
}
