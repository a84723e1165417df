use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SchedError};

/// Name of the distinguished local host. A configuration that does not
/// define it is rejected, so lookups against it never fail at runtime.
pub const LOCAL_HOST: &str = "local";

/// Top-level daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Port the client interface listens on.
    pub port: u16,
    /// Directory agent logs are written to.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Seconds between periodic agent/job refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Seconds of silence after which a running agent is considered
    /// unresponsive.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/dispatchd")
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_stale_after() -> u64 {
    600
}

/// One execution target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostEntry {
    /// Address the host is reached at; `localhost` means no ssh hop.
    pub address: String,
    /// Working directory agents run in on this host.
    pub directory: PathBuf,
    /// Maximum concurrently running agents on this host.
    pub max: u32,
    /// Free-form host kind, e.g. "local" or "build".
    #[serde(default)]
    pub kind: String,
}

/// One agent type (meta-agent) template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentEntry {
    /// Command line used to start a worker of this type.
    pub command: String,
    /// Maximum concurrently running instances of this type.
    pub max: u32,
    /// Special behaviour flags: EXCLUSIVE, NOEMAIL, NOKILL, LOCAL.
    #[serde(default)]
    pub special: Vec<String>,
}

/// Fully parsed scheduler configuration.
///
/// `BTreeMap` keeps host/agent iteration order stable so that two loads
/// of the same file produce identical registries.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub daemon: DaemonSection,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.refresh_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.daemon.stale_after_secs)
    }

    /// Validate invariants the rest of the daemon relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.hosts.contains_key(LOCAL_HOST) {
            return Err(SchedError::Config(format!(
                "hosts must define a \"{}\" entry",
                LOCAL_HOST
            )));
        }
        for (name, host) in &self.hosts {
            if host.max == 0 {
                return Err(SchedError::Config(format!(
                    "host {} has max = 0, it could never run an agent",
                    name
                )));
            }
        }
        for (name, agent) in &self.agents {
            if agent.command.trim().is_empty() {
                return Err(SchedError::Config(format!(
                    "agent {} has an empty command",
                    name
                )));
            }
            for flag in &agent.special {
                if !matches!(flag.as_str(), "EXCLUSIVE" | "NOEMAIL" | "NOKILL" | "LOCAL") {
                    return Err(SchedError::Config(format!(
                        "agent {} has unknown special flag {}",
                        name, flag
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where configuration comes from.
///
/// The daemon only ever sees a validated [`SchedulerConfig`]; transport
/// and encoding live behind this trait.
pub trait ConfigSource: Send {
    fn load(&self) -> Result<SchedulerConfig>;
}

/// Reads a TOML file from disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<SchedulerConfig> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| SchedError::ConfigIo {
            path: self.path.display().to_string(),
            source: e,
        })?;
        let config: SchedulerConfig = toml::from_str(&text)
            .map_err(|e| SchedError::Config(format!("{}: {}", self.path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
