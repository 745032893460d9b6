//! Volume mount resolution
//!
//! Turns the project model's [`VolumeMount`]s into runtime [`Mount`]s. Named
//! and anonymous volumes are created lazily on first mount, labeled so later
//! invocations (and `down --volumes`) can find them again.

use crate::error::{ConvoyError, Result};
use crate::orchestrator::{LABEL_ANONYMOUS, LABEL_PROJECT, LABEL_SERVICE, LABEL_TARGET};
use crate::project::{MountKind, Project, Service, VolumeMount};
use crate::runtime::{Mount, MountFilesystem, RuntimeClient};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// Deterministic name for an anonymous volume mount.
pub fn anonymous_volume_name(project: &str, service: &str, target: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let name = format!("{}_{}_anon_{}", project, service, &digest[..12]);
    sanitize_volume_name(&name)
}

fn sanitize_volume_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The logical volume name a mount resolves through, when it is
/// volume-backed.
pub fn logical_volume_name(project: &Project, service: &Service, mount: &VolumeMount) -> Option<String> {
    match mount.kind {
        MountKind::Volume => Some(if mount.source.is_empty() {
            anonymous_volume_name(&project.name, &service.name, &mount.target)
        } else {
            mount.source.clone()
        }),
        MountKind::Bind | MountKind::Tmpfs => None,
    }
}

/// Fingerprint keys for a service's mounts: `dest=source:options`, with the
/// logical volume name as the source for volume mounts and the absolute host
/// path for binds.
pub fn mount_fingerprint_keys(project: &Project, service: &Service) -> Vec<String> {
    service
        .volumes
        .iter()
        .map(|mount| {
            let source = logical_volume_name(project, service, mount)
                .unwrap_or_else(|| mount.source.clone());
            let options = if mount.read_only { "ro" } else { "" };
            format!("{}={}:{}", mount.target, source, options)
        })
        .collect()
}

/// Resolve every mount of `service` into runtime mounts, creating managed
/// volumes as needed.
pub async fn resolve_mounts(
    runtime: &RuntimeClient,
    project: &Project,
    service: &Service,
) -> Result<Vec<Mount>> {
    let mut mounts = Vec::with_capacity(service.volumes.len());
    for mount in &service.volumes {
        mounts.push(resolve_mount(runtime, project, service, mount).await?);
    }
    Ok(mounts)
}

async fn resolve_mount(
    runtime: &RuntimeClient,
    project: &Project,
    service: &Service,
    mount: &VolumeMount,
) -> Result<Mount> {
    let mut options = Vec::new();
    if mount.read_only {
        options.push("ro".to_string());
    }

    match mount.kind {
        MountKind::Bind => Ok(Mount {
            source: mount.source.clone(),
            destination: mount.target.clone(),
            filesystem: MountFilesystem::Virtiofs,
            options,
        }),
        MountKind::Tmpfs => Ok(Mount {
            source: String::new(),
            destination: mount.target.clone(),
            filesystem: MountFilesystem::Tmpfs,
            options,
        }),
        MountKind::Volume => {
            let anonymous = mount.source.is_empty();
            let name = logical_volume_name(project, service, mount).expect("volume mount");
            let external = project
                .volumes
                .get(&mount.source)
                .map(|v| v.external)
                .unwrap_or(false);

            let info = match runtime.volumes.inspect(&name).await {
                Ok(info) => info,
                Err(err) if err.is_not_found() => {
                    if external {
                        return Err(ConvoyError::NotFound(format!(
                            "external volume '{}' does not exist",
                            name
                        )));
                    }
                    debug!("creating volume {}", name);
                    let mut labels = BTreeMap::new();
                    labels.insert(LABEL_PROJECT.to_string(), project.name.clone());
                    labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
                    labels.insert(LABEL_TARGET.to_string(), mount.target.clone());
                    labels.insert(LABEL_ANONYMOUS.to_string(), anonymous.to_string());
                    runtime.volumes.create(&name, labels).await?
                }
                Err(err) => return Err(err),
            };

            Ok(Mount {
                source: info.source,
                destination: mount.target.clone(),
                filesystem: MountFilesystem::Ext4,
                options,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Volume;
    use regex::Regex;

    fn project_with(service: Service) -> (Project, Service) {
        let mut project = Project {
            name: "proj".to_string(),
            ..Default::default()
        };
        project
            .services
            .insert(service.name.clone(), service.clone());
        (project, service)
    }

    #[test]
    fn test_anonymous_name_shape() {
        let name = anonymous_volume_name("proj", "app", "/cache");
        let re = Regex::new(r"^proj_app_anon_[0-9a-f]{12}$").unwrap();
        assert!(re.is_match(&name), "got: {name}");
    }

    #[test]
    fn test_anonymous_name_is_deterministic() {
        assert_eq!(
            anonymous_volume_name("proj", "app", "/cache"),
            anonymous_volume_name("proj", "app", "/cache")
        );
        assert_ne!(
            anonymous_volume_name("proj", "app", "/cache"),
            anonymous_volume_name("proj", "app", "/other")
        );
    }

    #[test]
    fn test_sanitize_strips_odd_characters() {
        assert_eq!(sanitize_volume_name("a b/c"), "a_b_c");
        assert_eq!(sanitize_volume_name("ok-1.2_x"), "ok-1.2_x");
    }

    #[test]
    fn test_mount_fingerprint_keys_use_logical_names() {
        let service = Service {
            name: "app".to_string(),
            volumes: vec![
                VolumeMount {
                    source: String::new(),
                    target: "/cache".to_string(),
                    read_only: false,
                    kind: MountKind::Volume,
                },
                VolumeMount {
                    source: "/host/data".to_string(),
                    target: "/data".to_string(),
                    read_only: true,
                    kind: MountKind::Bind,
                },
            ],
            ..Default::default()
        };
        let (project, service) = project_with(service);

        let keys = mount_fingerprint_keys(&project, &service);
        assert!(keys[0].starts_with("/cache=proj_app_anon_"));
        assert_eq!(keys[1], "/data=/host/data:ro");
    }

    #[tokio::test]
    async fn test_resolve_creates_labeled_anonymous_volume() {
        let runtime = RuntimeClient::in_memory();
        let service = Service {
            name: "app".to_string(),
            volumes: vec![VolumeMount {
                source: String::new(),
                target: "/cache".to_string(),
                read_only: false,
                kind: MountKind::Volume,
            }],
            ..Default::default()
        };
        let (project, service) = project_with(service);

        let mounts = resolve_mounts(&runtime, &project, &service).await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].filesystem, MountFilesystem::Ext4);

        let volumes = runtime.volumes.list().await.unwrap();
        assert_eq!(volumes.len(), 1);
        let labels = &volumes[0].labels;
        assert_eq!(labels.get(LABEL_PROJECT).unwrap(), "proj");
        assert_eq!(labels.get(LABEL_SERVICE).unwrap(), "app");
        assert_eq!(labels.get(LABEL_TARGET).unwrap(), "/cache");
        assert_eq!(labels.get(LABEL_ANONYMOUS).unwrap(), "true");
    }

    #[tokio::test]
    async fn test_missing_external_volume_fails() {
        let runtime = RuntimeClient::in_memory();
        let service = Service {
            name: "app".to_string(),
            volumes: vec![VolumeMount {
                source: "shared".to_string(),
                target: "/shared".to_string(),
                read_only: false,
                kind: MountKind::Volume,
            }],
            ..Default::default()
        };
        let (mut project, service) = project_with(service);
        project.volumes.insert(
            "shared".to_string(),
            Volume {
                name: "shared".to_string(),
                driver: "local".to_string(),
                external: true,
            },
        );

        let err = resolve_mounts(&runtime, &project, &service).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_bind_mount_is_virtiofs_with_ro() {
        let runtime = RuntimeClient::in_memory();
        let service = Service {
            name: "app".to_string(),
            volumes: vec![VolumeMount {
                source: "/host/src".to_string(),
                target: "/src".to_string(),
                read_only: true,
                kind: MountKind::Bind,
            }],
            ..Default::default()
        };
        let (project, service) = project_with(service);

        let mounts = resolve_mounts(&runtime, &project, &service).await.unwrap();
        assert_eq!(mounts[0].filesystem, MountFilesystem::Virtiofs);
        assert_eq!(mounts[0].options, vec!["ro"]);
        assert!(runtime.volumes.list().await.unwrap().is_empty());
    }
}
