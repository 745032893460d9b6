//! Per-service container reconciliation
//!
//! One service at a time: figure out the expected container, compare it
//! against what the runtime has (by configuration hash), and reuse or
//! recreate accordingly. Within a service the steps are strictly
//! sequential: stop existing, ensure image, create, bootstrap, start.

use super::build;
use super::fingerprint;
use super::network;
use super::volume;
use super::{Orchestrator, PullPolicy, UpOptions};
use super::{LABEL_CONFIG_HASH, LABEL_CONTAINER, LABEL_PROJECT, LABEL_SERVICE};
use crate::error::{ConvoyError, Result};
use crate::project::{Project, Service};
use crate::runtime::{ContainerConfiguration, ContainerStatus, ImageInfo, PublishedPort};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// CPU count used when a service declares none
pub const DEFAULT_CPUS: u32 = 4;

/// Memory limit used when a service declares none (2 GiB)
pub const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const STOP_GRACE: Duration = Duration::from_secs(15);
const STOP_POLL: Duration = Duration::from_millis(500);
const KILL_SETTLE: Duration = Duration::from_millis(700);
const SIGKILL: i32 = 9;

impl Orchestrator {
    /// Reconcile one service: reuse the existing container when its
    /// configuration hash matches, recreate it otherwise.
    pub(crate) async fn reconcile_service(
        &self,
        project: &Project,
        service: &Service,
        network_ids: &BTreeMap<String, String>,
        options: &UpOptions,
    ) -> Result<()> {
        let container_id = project.container_id(service);

        if options.no_recreate {
            if let Ok(existing) = self.runtime.containers.get(&container_id).await {
                debug!("keeping existing container {} (no-recreate)", container_id);
                let hash = existing
                    .configuration
                    .labels
                    .get(LABEL_CONFIG_HASH)
                    .cloned()
                    .unwrap_or_default();
                self.record_container(&project.name, &service.name, &container_id, &hash)
                    .await;
                if existing.status != ContainerStatus::Running {
                    self.runtime.containers.start(&container_id).await?;
                }
                return Ok(());
            }
        }

        let image = self.ensure_image(project, service, options).await?;
        let (config, hash) = self
            .container_configuration(project, service, &image, network_ids)
            .await?;

        match self.runtime.containers.get(&container_id).await {
            Ok(existing) => {
                let current = existing.configuration.labels.get(LABEL_CONFIG_HASH);
                if !options.force_recreate && current.map(String::as_str) == Some(hash.as_str()) {
                    debug!("reusing container {} (config hash unchanged)", container_id);
                    self.record_container(&project.name, &service.name, &container_id, &hash)
                        .await;
                    if existing.status != ContainerStatus::Running {
                        self.runtime.containers.start(&container_id).await?;
                    }
                    return Ok(());
                }
                info!("recreating container {}", container_id);
                self.stop_and_remove(&container_id).await?;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        self.runtime.containers.create(config).await?;
        self.record_container(&project.name, &service.name, &container_id, &hash)
            .await;
        self.runtime.containers.bootstrap(&container_id).await?;
        self.runtime.containers.start(&container_id).await?;
        info!("started container {}", container_id);
        Ok(())
    }

    /// Make the service's image available, honoring the pull policy. A
    /// service with a `build` block must already have its built image.
    pub(crate) async fn ensure_image(
        &self,
        project: &Project,
        service: &Service,
        options: &UpOptions,
    ) -> Result<ImageInfo> {
        let reference = build::effective_image(&project.name, service);

        if service.build.is_some() {
            return self.runtime.images.get(&reference).await.map_err(|_| {
                ConvoyError::NotFound(format!(
                    "built image '{}' for service '{}' is missing",
                    reference, service.name
                ))
            });
        }

        match options.pull_policy {
            PullPolicy::Always => self.runtime.images.fetch(&reference).await,
            PullPolicy::Missing => match self.runtime.images.get(&reference).await {
                Ok(info) => Ok(info),
                Err(err) if err.is_not_found() => self.runtime.images.fetch(&reference).await,
                Err(err) => Err(err),
            },
            PullPolicy::Never => self.runtime.images.get(&reference).await,
        }
    }

    /// Assemble the container configuration and its fingerprint.
    pub(crate) async fn container_configuration(
        &self,
        project: &Project,
        service: &Service,
        image: &ImageInfo,
        network_ids: &BTreeMap<String, String>,
    ) -> Result<(ContainerConfiguration, String)> {
        let container_id = project.container_id(service);

        let entrypoint = effective_entrypoint(service, image);
        let command = service
            .command
            .clone()
            .unwrap_or_else(|| image.command.clone());
        let mut exec: Vec<String> = entrypoint.into_iter().chain(command).collect();
        let executable = if exec.is_empty() {
            String::new()
        } else {
            exec.remove(0)
        };

        let published_ports: Vec<PublishedPort> = service
            .ports
            .iter()
            .map(|p| PublishedPort {
                host_ip: p
                    .host_ip
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                host_port: p.host_port,
                container_port: p.container_port,
                protocol: p.protocol.to_string(),
            })
            .collect();

        let mounts = volume::resolve_mounts(&self.runtime, project, service).await?;
        let mount_keys = volume::mount_fingerprint_keys(project, service);
        let networks = network::service_attachments(service, &container_id, network_ids)?;

        let mut labels = service.labels.clone();
        labels.insert(LABEL_PROJECT.to_string(), project.name.clone());
        labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
        labels.insert(LABEL_CONTAINER.to_string(), container_id.clone());

        let mut config = ContainerConfiguration {
            id: container_id.clone(),
            image: image.reference.clone(),
            executable,
            arguments: exec,
            working_dir: service
                .working_dir
                .clone()
                .or_else(|| image.working_dir.clone()),
            environment: service.environment.clone(),
            labels,
            published_ports,
            mounts,
            networks,
            cpus: service
                .cpus
                .map(|c| (c.ceil().max(1.0)) as u32)
                .unwrap_or(DEFAULT_CPUS),
            memory_bytes: parse_memory_bytes(service.memory.as_deref()).map_err(|e| {
                ConvoyError::InvalidArgument(format!("service '{}': {}", service.name, e))
            })?,
            terminal: service.tty,
            hostname: container_id,
        };

        let hash = fingerprint::config_hash(&config, &mount_keys, service.health_check.as_ref());
        config
            .labels
            .insert(LABEL_CONFIG_HASH.to_string(), hash.clone());
        Ok((config, hash))
    }

    /// Graceful stop (SIGTERM, bounded wait), escalation to SIGKILL, then
    /// delete with a forced retry.
    pub(crate) async fn stop_and_remove(&self, id: &str) -> Result<()> {
        if let Err(err) = self.runtime.containers.stop(id).await {
            warn!("stop of {} failed: {}", id, err);
        }

        let stopped = timeout(STOP_GRACE, async {
            loop {
                match self.runtime.containers.get(id).await {
                    Ok(summary) if summary.status == ContainerStatus::Running => {
                        sleep(STOP_POLL).await;
                    }
                    _ => return,
                }
            }
        })
        .await
        .is_ok();

        if !stopped {
            warn!("container {} ignored SIGTERM, killing", id);
            let _ = self.runtime.containers.kill(id, SIGKILL).await;
            sleep(KILL_SETTLE).await;
        }

        match self.runtime.containers.delete(id, false).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                debug!("delete of {} failed ({}), retrying with force", id, err);
                self.runtime.containers.delete(id, true).await
            }
        }
    }
}

fn effective_entrypoint(service: &Service, image: &ImageInfo) -> Vec<String> {
    match &service.entrypoint {
        Some(ep) if ep.len() == 1 && ep[0].is_empty() => Vec::new(),
        Some(ep) if !ep.is_empty() => ep.clone(),
        _ => image.entrypoint.clone(),
    }
}

/// Parse a memory limit: a plain byte count or `<number><k|m|g>` with an
/// optional trailing `b`. `max` keeps the default.
fn parse_memory_bytes(memory: Option<&str>) -> std::result::Result<u64, String> {
    let Some(raw) = memory else {
        return Ok(DEFAULT_MEMORY_BYTES);
    };
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("max") {
        return Ok(DEFAULT_MEMORY_BYTES);
    }

    let lower = raw.to_ascii_lowercase();
    let digits_end = lower
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(digits_end);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid memory limit '{}'", raw))?;

    let multiplier: u64 = match unit.trim_end_matches('b') {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown memory unit in '{}'", raw)),
    };
    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory_bytes(Some("256m")).unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_bytes(Some("1g")).unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes(Some("512k")).unwrap(), 512 * 1024);
        assert_eq!(parse_memory_bytes(Some("1024")).unwrap(), 1024);
        assert_eq!(parse_memory_bytes(Some("1gb")).unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_defaults() {
        assert_eq!(parse_memory_bytes(None).unwrap(), DEFAULT_MEMORY_BYTES);
        assert_eq!(parse_memory_bytes(Some("max")).unwrap(), DEFAULT_MEMORY_BYTES);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory_bytes(Some("lots")).is_err());
        assert!(parse_memory_bytes(Some("12q")).is_err());
    }

    #[test]
    fn test_entrypoint_precedence() {
        let image = ImageInfo {
            reference: "img".to_string(),
            entrypoint: vec!["/entry".to_string()],
            command: vec!["serve".to_string()],
            working_dir: None,
        };

        let mut service = Service {
            name: "app".to_string(),
            ..Default::default()
        };
        assert_eq!(effective_entrypoint(&service, &image), vec!["/entry"]);

        service.entrypoint = Some(vec!["/custom".to_string()]);
        assert_eq!(effective_entrypoint(&service, &image), vec!["/custom"]);

        // the single-empty-string sentinel clears the image entrypoint
        service.entrypoint = Some(vec![String::new()]);
        assert!(effective_entrypoint(&service, &image).is_empty());
    }
}
