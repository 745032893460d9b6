//! In-memory runtime
//!
//! A process-local implementation of the runtime traits with the semantics
//! the orchestrator depends on: ID collisions report `AlreadyExists`, misses
//! report `NotFound`, volumes resolve to a synthetic host source, and logs
//! are real files on disk. Integration tests drive the orchestrator against
//! this runtime; the helper methods let them stage failures and inspect what
//! the orchestrator did.

use super::{
    ContainerClient, ContainerConfiguration, ContainerStatus, ContainerSummary, ImageClient,
    ImageInfo, LogFile, LogStream, NetworkClient, NetworkInfo, NetworkMode, ProcessHandle,
    ProcessSpec, StdioMode, VolumeClient, VolumeInfo, DEFAULT_NETWORK_ID,
};
use crate::error::{ConvoyError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct ContainerEntry {
    configuration: ContainerConfiguration,
    status: ContainerStatus,
    bootstrapped: bool,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerEntry>,
    images: HashMap<String, ImageInfo>,
    networks: HashMap<String, NetworkInfo>,
    volumes: HashMap<String, VolumeInfo>,
    exec_exit_codes: HashMap<String, i32>,
    exec_history: Vec<(String, Vec<String>)>,
    create_counts: HashMap<String, u32>,
}

/// An in-memory container runtime.
pub struct InMemoryRuntime {
    state: RwLock<State>,
    base_dir: PathBuf,
}

impl InMemoryRuntime {
    /// Create an empty runtime with the default network present.
    pub fn new() -> Self {
        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let base_dir = std::env::temp_dir().join(format!(
            "convoy-mem-{}-{}",
            std::process::id(),
            instance
        ));

        let mut state = State::default();
        state.networks.insert(
            DEFAULT_NETWORK_ID.to_string(),
            NetworkInfo {
                id: DEFAULT_NETWORK_ID.to_string(),
                mode: NetworkMode::Nat,
            },
        );

        Self {
            state: RwLock::new(state),
            base_dir,
        }
    }

    /// Register an image so `get` resolves it.
    pub async fn seed_image(&self, info: ImageInfo) {
        let mut state = self.state.write().await;
        state.images.insert(info.reference.clone(), info);
    }

    /// Exit code future `create_process` calls in `id` will report.
    pub async fn set_exec_exit_code(&self, id: &str, code: i32) {
        let mut state = self.state.write().await;
        state.exec_exit_codes.insert(id.to_string(), code);
    }

    /// Every `create_process` invocation so far, as `(container, argv)`.
    pub async fn exec_history(&self) -> Vec<(String, Vec<String>)> {
        self.state.read().await.exec_history.clone()
    }

    /// How many times a container with this ID has been created.
    pub async fn create_count(&self, id: &str) -> u32 {
        self.state
            .read()
            .await
            .create_counts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Force a container's reported status.
    pub async fn set_container_status(&self, id: &str, status: ContainerStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        entry.status = status;
        Ok(())
    }

    /// Drop a container without lifecycle checks, as if it exited and was
    /// reaped.
    pub async fn force_remove(&self, id: &str) {
        let mut state = self.state.write().await;
        state.containers.remove(id);
    }

    /// Insert a container directly, bypassing lifecycle checks.
    pub async fn force_create(&self, configuration: ContainerConfiguration) {
        let mut state = self.state.write().await;
        state.containers.insert(
            configuration.id.clone(),
            ContainerEntry {
                configuration,
                status: ContainerStatus::Created,
                bootstrapped: false,
            },
        );
    }

    /// Look up a container without going through the client trait.
    pub async fn force_get(&self, id: &str) -> Option<ContainerSummary> {
        let state = self.state.read().await;
        state.containers.get(id).map(|entry| ContainerSummary {
            id: entry.configuration.id.clone(),
            status: entry.status,
            configuration: entry.configuration.clone(),
        })
    }

    /// All volumes, without going through the client trait.
    pub async fn volume_list(&self) -> Vec<VolumeInfo> {
        let state = self.state.read().await;
        state.volumes.values().cloned().collect()
    }

    /// Append a line to one of a container's log files.
    pub fn append_log(&self, id: &str, stream: LogStream, line: &str) -> Result<()> {
        use std::io::Write;
        let path = self.log_path(id, stream);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn log_path(&self, id: &str, stream: LogStream) -> PathBuf {
        self.base_dir.join("logs").join(format!("{}.{}.log", id, stream))
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryProcess {
    exit_code: i32,
}

#[async_trait]
impl ProcessHandle for MemoryProcess {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        Ok(self.exit_code)
    }

    async fn kill(&self, _signal: i32) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ContainerClient for InMemoryRuntime {
    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .values()
            .map(|entry| ContainerSummary {
                id: entry.configuration.id.clone(),
                status: entry.status,
                configuration: entry.configuration.clone(),
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<ContainerSummary> {
        let state = self.state.read().await;
        state
            .containers
            .get(id)
            .map(|entry| ContainerSummary {
                id: entry.configuration.id.clone(),
                status: entry.status,
                configuration: entry.configuration.clone(),
            })
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))
    }

    async fn create(&self, configuration: ContainerConfiguration) -> Result<()> {
        let mut state = self.state.write().await;
        if state.containers.contains_key(&configuration.id) {
            return Err(ConvoyError::AlreadyExists(format!(
                "container {}",
                configuration.id
            )));
        }
        let id = configuration.id.clone();
        state.containers.insert(
            id.clone(),
            ContainerEntry {
                configuration,
                status: ContainerStatus::Created,
                bootstrapped: false,
            },
        );
        *state.create_counts.entry(id).or_insert(0) += 1;
        Ok(())
    }

    async fn bootstrap(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        entry.bootstrapped = true;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        entry.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        if entry.status == ContainerStatus::Running {
            entry.status = ContainerStatus::Stopped;
        }
        Ok(())
    }

    async fn kill(&self, id: &str, _signal: i32) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        entry.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        if entry.status == ContainerStatus::Running && !force {
            return Err(ConvoyError::Internal(format!(
                "container {} is running",
                id
            )));
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn create_process(
        &self,
        id: &str,
        spec: ProcessSpec,
        _stdio: StdioMode,
    ) -> Result<Arc<dyn ProcessHandle>> {
        let mut state = self.state.write().await;
        let entry = state
            .containers
            .get(id)
            .ok_or_else(|| ConvoyError::NotFound(format!("container {}", id)))?;
        if entry.status != ContainerStatus::Running {
            return Err(ConvoyError::Internal(format!(
                "container {} is not running",
                id
            )));
        }
        let mut argv = vec![spec.executable.clone()];
        argv.extend(spec.arguments.iter().cloned());
        state.exec_history.push((id.to_string(), argv));
        let exit_code = state.exec_exit_codes.get(id).copied().unwrap_or(0);
        Ok(Arc::new(MemoryProcess { exit_code }))
    }

    async fn logs(&self, id: &str) -> Result<Vec<LogFile>> {
        {
            let state = self.state.read().await;
            if !state.containers.contains_key(id) {
                return Err(ConvoyError::NotFound(format!("container {}", id)));
            }
        }
        let mut files = Vec::new();
        for stream in [LogStream::Stdout, LogStream::Stderr] {
            let path = self.log_path(id, stream);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !path.exists() {
                std::fs::File::create(&path)?;
            }
            files.push(LogFile { stream, path });
        }
        Ok(files)
    }
}

#[async_trait]
impl ImageClient for InMemoryRuntime {
    async fn get(&self, reference: &str) -> Result<ImageInfo> {
        let state = self.state.read().await;
        state
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| ConvoyError::NotFound(format!("image {}", reference)))
    }

    async fn fetch(&self, reference: &str) -> Result<ImageInfo> {
        let mut state = self.state.write().await;
        let info = state
            .images
            .entry(reference.to_string())
            .or_insert_with(|| ImageInfo {
                reference: reference.to_string(),
                entrypoint: Vec::new(),
                command: vec!["/bin/sh".to_string()],
                working_dir: None,
            });
        Ok(info.clone())
    }
}

#[async_trait]
impl NetworkClient for InMemoryRuntime {
    async fn create(&self, id: &str, mode: NetworkMode) -> Result<NetworkInfo> {
        let mut state = self.state.write().await;
        if state.networks.contains_key(id) {
            return Err(ConvoyError::AlreadyExists(format!("network {}", id)));
        }
        let info = NetworkInfo {
            id: id.to_string(),
            mode,
        };
        state.networks.insert(id.to_string(), info.clone());
        Ok(info)
    }

    async fn get(&self, id: &str) -> Result<NetworkInfo> {
        let state = self.state.read().await;
        state
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| ConvoyError::NotFound(format!("network {}", id)))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ConvoyError::NotFound(format!("network {}", id)))
    }
}

#[async_trait]
impl VolumeClient for InMemoryRuntime {
    async fn create(&self, name: &str, labels: BTreeMap<String, String>) -> Result<VolumeInfo> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.volumes.get(name) {
            // concurrent reconciliations may race on the same named volume
            return Ok(existing.clone());
        }
        let info = VolumeInfo {
            name: name.to_string(),
            source: self
                .base_dir
                .join("volumes")
                .join(name)
                .to_string_lossy()
                .into_owned(),
            format: "ext4".to_string(),
            labels,
        };
        state.volumes.insert(name.to_string(), info.clone());
        Ok(info)
    }

    async fn list(&self) -> Result<Vec<VolumeInfo>> {
        let state = self.state.read().await;
        Ok(state.volumes.values().cloned().collect())
    }

    async fn inspect(&self, name: &str) -> Result<VolumeInfo> {
        let state = self.state.read().await;
        state
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| ConvoyError::NotFound(format!("volume {}", name)))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ConvoyError::NotFound(format!("volume {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn containers(runtime: &InMemoryRuntime) -> &dyn ContainerClient {
        runtime
    }

    fn config(id: &str) -> ContainerConfiguration {
        ContainerConfiguration {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_collision_is_already_exists() {
        let runtime = InMemoryRuntime::new();
        containers(&runtime).create(config("c1")).await.unwrap();
        let err = containers(&runtime).create(config("c1")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let runtime = InMemoryRuntime::new();
        let err = containers(&runtime).get("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lifecycle_status_transitions() {
        let runtime = InMemoryRuntime::new();
        let client = containers(&runtime);
        client.create(config("c1")).await.unwrap();
        assert_eq!(client.get("c1").await.unwrap().status, ContainerStatus::Created);

        client.start("c1").await.unwrap();
        assert_eq!(client.get("c1").await.unwrap().status, ContainerStatus::Running);

        client.stop("c1").await.unwrap();
        assert_eq!(client.get("c1").await.unwrap().status, ContainerStatus::Stopped);

        client.delete("c1", false).await.unwrap();
        assert!(client.get("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_running_requires_force() {
        let runtime = InMemoryRuntime::new();
        let client = containers(&runtime);
        client.create(config("c1")).await.unwrap();
        client.start("c1").await.unwrap();
        assert!(client.delete("c1", false).await.is_err());
        client.delete("c1", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_create_is_idempotent() {
        let runtime = InMemoryRuntime::new();
        let first = VolumeClient::create(&runtime, "data", BTreeMap::new())
            .await
            .unwrap();
        let second = VolumeClient::create(&runtime, "data", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(first.source, second.source);
    }

    #[tokio::test]
    async fn test_fetch_registers_image() {
        let runtime = InMemoryRuntime::new();
        assert!(ImageClient::get(&runtime, "busybox").await.is_err());
        ImageClient::fetch(&runtime, "busybox").await.unwrap();
        assert!(ImageClient::get(&runtime, "busybox").await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_reports_configured_exit_code() {
        let runtime = InMemoryRuntime::new();
        let client = containers(&runtime);
        client.create(config("c1")).await.unwrap();
        client.start("c1").await.unwrap();
        runtime.set_exec_exit_code("c1", 7).await;

        let handle = client
            .create_process(
                "c1",
                ProcessSpec {
                    executable: "true".to_string(),
                    ..Default::default()
                },
                StdioMode::Null,
            )
            .await
            .unwrap();
        handle.start().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_default_network_exists() {
        let runtime = InMemoryRuntime::new();
        assert!(NetworkClient::get(&runtime, DEFAULT_NETWORK_ID).await.is_ok());
    }
}
