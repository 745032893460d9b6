//! Runtime adapter interfaces
//!
//! The orchestrator drives a container runtime exclusively through these
//! traits. Production implementations live in a separate runtime library;
//! [`memory::InMemoryRuntime`] ships here for tests and development.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// ID of the runtime's always-present default network
pub const DEFAULT_NETWORK_ID: &str = "default";

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but not started
    Created,
    /// Running
    Running,
    /// Stopped
    Stopped,
    /// Exited
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Exited => write!(f, "exited"),
        }
    }
}

/// A container as enumerated by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Stable container ID
    pub id: String,
    /// Current status
    pub status: ContainerStatus,
    /// Configuration the container was created with
    pub configuration: ContainerConfiguration,
}

/// Full container configuration handed to `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfiguration {
    /// Stable container ID
    pub id: String,
    /// Image reference
    pub image: String,
    /// Init process executable
    pub executable: String,
    /// Init process arguments
    pub arguments: Vec<String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Environment
    pub environment: BTreeMap<String, String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Published ports
    pub published_ports: Vec<PublishedPort>,
    /// Filesystem mounts
    pub mounts: Vec<Mount>,
    /// Network attachments, in order
    pub networks: Vec<NetworkAttachment>,
    /// CPU count
    pub cpus: u32,
    /// Memory limit in bytes
    pub memory_bytes: u64,
    /// Attach a terminal to the init process
    pub terminal: bool,
    /// Hostname inside the container
    pub hostname: String,
}

/// A host-published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    /// Host address
    pub host_ip: String,
    /// Host port
    pub host_port: u16,
    /// Container port
    pub container_port: u16,
    /// `tcp` or `udp`
    pub protocol: String,
}

/// Filesystem backing a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountFilesystem {
    /// Shared host directory
    Virtiofs,
    /// Memory-backed scratch space
    Tmpfs,
    /// Block volume
    Ext4,
}

impl std::fmt::Display for MountFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountFilesystem::Virtiofs => write!(f, "virtiofs"),
            MountFilesystem::Tmpfs => write!(f, "tmpfs"),
            MountFilesystem::Ext4 => write!(f, "ext4"),
        }
    }
}

/// A mount inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host source; empty for tmpfs
    pub source: String,
    /// Destination inside the container
    pub destination: String,
    /// Backing filesystem
    pub filesystem: MountFilesystem,
    /// Mount options such as `ro`
    pub options: Vec<String>,
}

/// A network the container joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Runtime network ID
    pub network: String,
    /// Hostname on that network
    pub hostname: String,
}

/// Spec for a process spawned inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Executable
    pub executable: String,
    /// Arguments
    pub arguments: Vec<String>,
    /// Extra environment
    pub environment: BTreeMap<String, String>,
    /// Working directory override
    pub working_dir: Option<String>,
    /// User override
    pub user: Option<String>,
    /// Allocate a terminal
    pub terminal: bool,
}

/// How the spawned process's stdio is wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Attach to the caller's terminal
    Inherit,
    /// Discard
    Null,
}

/// Handle to a process spawned with [`ContainerClient::create_process`].
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Start the process.
    async fn start(&self) -> Result<()>;
    /// Wait for the process and return its exit code.
    async fn wait(&self) -> Result<i32>;
    /// Deliver a signal.
    async fn kill(&self, signal: i32) -> Result<()>;
}

/// One ordered log source of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A readable log file of a container.
#[derive(Debug, Clone)]
pub struct LogFile {
    /// Which stream the file carries
    pub stream: LogStream,
    /// Path to the file on the host
    pub path: PathBuf,
}

/// Image metadata, including the pieces of its config the orchestrator needs.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    /// Image reference
    pub reference: String,
    /// Default entrypoint
    pub entrypoint: Vec<String>,
    /// Default command
    pub command: Vec<String>,
    /// Default working directory
    pub working_dir: Option<String>,
}

/// Network creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// NAT through the host
    Nat,
}

/// Runtime network metadata.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    /// Runtime network ID
    pub id: String,
    /// Mode the network was created with
    pub mode: NetworkMode,
}

/// Runtime volume metadata.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Volume name
    pub name: String,
    /// Resolved host source backing the volume
    pub source: String,
    /// Filesystem format
    pub format: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// Container operations.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Enumerate all containers.
    async fn list(&self) -> Result<Vec<ContainerSummary>>;
    /// Fetch one container by ID.
    async fn get(&self, id: &str) -> Result<ContainerSummary>;
    /// Create a container; fails with `AlreadyExists` when the ID is taken.
    async fn create(&self, configuration: ContainerConfiguration) -> Result<()>;
    /// Prepare the container sandbox; idempotent.
    async fn bootstrap(&self, id: &str) -> Result<()>;
    /// Start the init process.
    async fn start(&self, id: &str) -> Result<()>;
    /// Request a graceful stop (SIGTERM to the init process).
    async fn stop(&self, id: &str) -> Result<()>;
    /// Deliver a signal to the init process.
    async fn kill(&self, id: &str, signal: i32) -> Result<()>;
    /// Delete the container.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;
    /// Spawn a process inside a running container.
    async fn create_process(
        &self,
        id: &str,
        spec: ProcessSpec,
        stdio: StdioMode,
    ) -> Result<Arc<dyn ProcessHandle>>;
    /// Ordered log sources of the container.
    async fn logs(&self, id: &str) -> Result<Vec<LogFile>>;
}

/// Image operations.
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Resolve a local image by reference.
    async fn get(&self, reference: &str) -> Result<ImageInfo>;
    /// Fetch an image from its registry.
    async fn fetch(&self, reference: &str) -> Result<ImageInfo>;
}

/// Network operations.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Create a network by ID.
    async fn create(&self, id: &str, mode: NetworkMode) -> Result<NetworkInfo>;
    /// Fetch a network by ID.
    async fn get(&self, id: &str) -> Result<NetworkInfo>;
    /// Delete a network by ID.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Volume operations.
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Create a volume.
    async fn create(&self, name: &str, labels: BTreeMap<String, String>) -> Result<VolumeInfo>;
    /// Enumerate volumes.
    async fn list(&self) -> Result<Vec<VolumeInfo>>;
    /// Inspect a volume by name.
    async fn inspect(&self, name: &str) -> Result<VolumeInfo>;
    /// Delete a volume by name.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Aggregated handle over the four runtime clients.
#[derive(Clone)]
pub struct RuntimeClient {
    pub containers: Arc<dyn ContainerClient>,
    pub images: Arc<dyn ImageClient>,
    pub networks: Arc<dyn NetworkClient>,
    pub volumes: Arc<dyn VolumeClient>,
}

impl RuntimeClient {
    /// A runtime backed entirely by process memory.
    pub fn in_memory() -> Self {
        let runtime = Arc::new(memory::InMemoryRuntime::new());
        Self {
            containers: runtime.clone(),
            images: runtime.clone(),
            networks: runtime.clone(),
            volumes: runtime,
        }
    }
}
