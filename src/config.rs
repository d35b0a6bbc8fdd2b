//! Instance Manager Configuration
//!
//! Defines the configuration for the instance lifecycle manager including:
//! - Substrate namespace and public address
//! - External port range and allocation retries
//! - Instance lifetime and sweep cadence
//! - Resource and security defaults for workloads

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Namespace all instance resources are created in
    pub namespace: String,
    /// Externally reachable host used to build access URLs
    pub public_host: String,
    /// External port range
    pub ports: PortRange,
    /// Maximum reservation attempts before giving up on a port
    pub allocation_attempts: u32,
    /// Default instance lifetime in seconds
    pub instance_ttl_secs: u64,
    /// Reconciliation sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Promote running instances to ready when the workload reports healthy
    pub readiness_probe: bool,
    /// Workload resource defaults
    pub resources: ResourceDefaults,
    /// Workload security settings
    pub security: SecurityConfig,
    /// Docker backend settings
    pub docker: DockerSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: "ctf-instances".to_string(),
            public_host: "127.0.0.1".to_string(),
            ports: PortRange::default(),
            allocation_attempts: 32,
            instance_ttl_secs: 7200, // 2 hours
            sweep_interval_secs: 60,
            readiness_probe: true,
            resources: ResourceDefaults::default(),
            security: SecurityConfig::default(),
            docker: DockerSettings::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ManagerConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot satisfy the instance invariants
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            anyhow::bail!("namespace must not be empty");
        }
        if self.public_host.trim().is_empty() {
            anyhow::bail!("public_host must not be empty");
        }
        if self.ports.low == 0 || self.ports.low > self.ports.high {
            anyhow::bail!(
                "invalid port range {}-{}",
                self.ports.low,
                self.ports.high
            );
        }
        if self.allocation_attempts == 0 {
            anyhow::bail!("allocation_attempts must be at least 1");
        }
        if self.instance_ttl_secs == 0 {
            anyhow::bail!("instance_ttl_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be positive");
        }
        // uid 0 would run challenge code or forwarders as root
        if self.security.run_as_user == 0 {
            anyhow::bail!("security.run_as_user must not be 0");
        }
        if self.docker.forwarder_user == 0 {
            anyhow::bail!("docker.forwarder_user must not be 0");
        }
        Ok(())
    }

    pub fn instance_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Inclusive external port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        // NodePort-style range
        Self {
            low: 30000,
            high: 31999,
        }
    }
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }

    pub fn len(&self) -> usize {
        if self.low > self.high {
            0
        } else {
            (self.high - self.low) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fallback resources applied when a challenge limit does not parse
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cpu_limit: "500m".to_string(),
            memory_limit: "512Mi".to_string(),
            cpu_request: "100m".to_string(),
            memory_request: "256Mi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// UID the challenge process runs as
    pub run_as_user: u32,
    pub read_only_root_filesystem: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            run_as_user: 1000,
            read_only_root_filesystem: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Docker socket; local defaults when unset
    pub socket_path: Option<String>,
    /// Client timeout in seconds
    pub timeout_secs: u64,
    /// Image of the port-forwarding container backing an exposure
    pub exposure_image: String,
    /// UID the forwarding container runs as
    pub forwarder_user: u32,
    /// Pull challenge images that are not present locally
    pub pull_missing_images: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout_secs: 120,
            exposure_image: "alpine/socat:latest".to_string(),
            forwarder_user: 1000,
            pull_missing_images: true,
        }
    }
}
