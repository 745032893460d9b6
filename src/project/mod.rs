//! Canonical project model
//!
//! The compose pipeline converts the permissive file AST into these types.
//! Everything downstream (resolver, orchestrator) works exclusively on this
//! model; map fields are `BTreeMap` so iteration order is deterministic.

pub mod resolver;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the network synthesized when a project declares none
pub const DEFAULT_NETWORK: &str = "default";

/// A fully normalized compose project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// Project name
    pub name: String,
    /// Services keyed by name
    pub services: BTreeMap<String, Service>,
    /// Networks keyed by name
    pub networks: BTreeMap<String, Network>,
    /// Top-level volumes keyed by name
    pub volumes: BTreeMap<String, Volume>,
}

impl Project {
    /// Container ID for a service: its `container_name` override, or
    /// `<project>_<service>`.
    pub fn container_id(&self, service: &Service) -> String {
        service
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.name, service.name))
    }

    /// Runtime network ID for a declared network: the external name (or
    /// declared name) for external networks, `<project>_<name>` otherwise.
    pub fn network_id(&self, network: &Network) -> String {
        if network.external {
            network
                .external_name
                .clone()
                .unwrap_or_else(|| network.name.clone())
        } else {
            format!("{}_{}", self.name, network.name)
        }
    }
}

/// A normalized service definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Image reference, when set
    pub image: Option<String>,
    /// Build configuration, when the service builds its image
    pub build: Option<BuildConfig>,
    /// Command override (None = use the image's)
    pub command: Option<Vec<String>>,
    /// Entrypoint override (None = use the image's; `[""]` clears it)
    pub entrypoint: Option<Vec<String>>,
    /// Working directory override
    pub working_dir: Option<String>,
    /// Effective environment (env_file merged, service values winning)
    pub environment: BTreeMap<String, String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// Networks to attach, in declared order
    pub networks: Vec<String>,
    /// Plain dependencies
    pub depends_on: Vec<String>,
    /// Dependencies gated on a passing healthcheck
    pub depends_on_healthy: Vec<String>,
    /// Dependencies gated on the container running
    pub depends_on_started: Vec<String>,
    /// Dependencies gated on successful completion
    pub depends_on_completed: Vec<String>,
    /// Healthcheck, when configured
    pub health_check: Option<HealthCheck>,
    /// Restart policy string
    pub restart: Option<String>,
    /// Explicit container name override
    pub container_name: Option<String>,
    /// Profiles this service belongs to
    pub profiles: Vec<String>,
    /// User labels
    pub labels: BTreeMap<String, String>,
    /// CPU limit
    pub cpus: Option<f64>,
    /// Memory limit, as written (`256m`, `1g`, `max`)
    pub memory: Option<String>,
    /// Allocate a terminal
    pub tty: bool,
    /// Keep stdin open
    pub stdin_open: bool,
}

impl Service {
    /// Every dependency name, across all four condition kinds.
    pub fn all_dependencies(&self) -> Vec<&str> {
        self.depends_on
            .iter()
            .chain(&self.depends_on_healthy)
            .chain(&self.depends_on_started)
            .chain(&self.depends_on_completed)
            .map(String::as_str)
            .collect()
    }
}

/// A project network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    /// Network name as declared
    pub name: String,
    /// Driver; only `bridge` is supported
    pub driver: String,
    /// Externally managed (never created or deleted by this tool)
    pub external: bool,
    /// Runtime name of an external network, when it differs
    pub external_name: Option<String>,
}

/// A top-level project volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name as declared
    pub name: String,
    /// Driver
    pub driver: String,
    /// Externally managed
    pub external: bool,
}

/// Network protocol for a published port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// A single host-to-container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to bind; defaults to all interfaces when absent
    pub host_ip: Option<String>,
    /// Host port
    pub host_port: u16,
    /// Container port
    pub container_port: u16,
    /// Protocol
    pub protocol: Protocol,
}

/// Kind of a volume mount
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    #[default]
    Volume,
    Tmpfs,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
            MountKind::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// A normalized volume mount.
///
/// Anonymous volumes carry an empty `source`; the orchestrator derives a
/// deterministic name from the project, service, and target at mount time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path (bind), volume name (volume), or empty (anonymous/tmpfs)
    pub source: String,
    /// Container path
    pub target: String,
    /// Mount read-only
    pub read_only: bool,
    /// Mount kind
    pub kind: MountKind,
}

/// A normalized healthcheck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe argv
    pub test: Vec<String>,
    /// Delay between probes
    pub interval: Option<Duration>,
    /// Per-probe timeout
    pub timeout: Option<Duration>,
    /// Probe attempts before giving up
    pub retries: Option<u32>,
    /// Grace period before the first probe
    pub start_period: Option<Duration>,
}

/// A normalized build configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build context directory (absolute after conversion)
    pub context: PathBuf,
    /// Dockerfile path, relative to the context unless absolute
    pub dockerfile: Option<String>,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Target stage
    pub target: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_default_and_override() {
        let mut project = Project {
            name: "proj".to_string(),
            ..Default::default()
        };
        let mut svc = Service {
            name: "web".to_string(),
            ..Default::default()
        };
        project.services.insert("web".to_string(), svc.clone());
        assert_eq!(project.container_id(&svc), "proj_web");

        svc.container_name = Some("custom".to_string());
        assert_eq!(project.container_id(&svc), "custom");
    }

    #[test]
    fn test_network_id_scoping() {
        let project = Project {
            name: "proj".to_string(),
            ..Default::default()
        };
        let scoped = Network {
            name: "backend".to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        assert_eq!(project.network_id(&scoped), "proj_backend");

        let external = Network {
            name: "backend".to_string(),
            driver: "bridge".to_string(),
            external: true,
            external_name: Some("shared".to_string()),
        };
        assert_eq!(project.network_id(&external), "shared");

        let external_unnamed = Network {
            name: "backend".to_string(),
            driver: "bridge".to_string(),
            external: true,
            external_name: None,
        };
        assert_eq!(project.network_id(&external_unnamed), "backend");
    }

    #[test]
    fn test_all_dependencies_unions_conditions() {
        let svc = Service {
            name: "web".to_string(),
            depends_on: vec!["a".to_string()],
            depends_on_healthy: vec!["b".to_string()],
            depends_on_started: vec!["c".to_string()],
            depends_on_completed: vec!["d".to_string()],
            ..Default::default()
        };
        let deps = svc.all_dependencies();
        assert_eq!(deps, vec!["a", "b", "c", "d"]);
    }
}
