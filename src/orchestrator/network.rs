//! Project network management
//!
//! Only the bridge driver is supported. Project-scoped networks are created
//! NAT-mode when missing; external networks must already exist.

use crate::error::{ConvoyError, Result};
use crate::project::{Project, Service};
use crate::runtime::{NetworkAttachment, NetworkMode, RuntimeClient, DEFAULT_NETWORK_ID};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Ensure every declared network exists in the runtime.
///
/// Returns the mapping from declared network name to runtime network ID.
pub async fn ensure_networks(
    runtime: &RuntimeClient,
    project: &Project,
) -> Result<BTreeMap<String, String>> {
    let mut ids = BTreeMap::new();

    for (name, network) in &project.networks {
        if network.driver != "bridge" {
            return Err(ConvoyError::InvalidArgument(format!(
                "network '{}': unsupported driver '{}' (only bridge is supported)",
                name, network.driver
            )));
        }

        let id = project.network_id(network);
        match runtime.networks.get(&id).await {
            Ok(_) => {
                debug!("network {} already exists", id);
            }
            Err(err) if err.is_not_found() => {
                if network.external {
                    return Err(ConvoyError::NotFound(format!(
                        "external network '{}' does not exist",
                        id
                    )));
                }
                info!("creating network {}", id);
                runtime.networks.create(&id, NetworkMode::Nat).await?;
            }
            Err(err) => return Err(err),
        }
        ids.insert(name.clone(), id);
    }

    Ok(ids)
}

/// Network attachments for a service, preserving declared order. Services
/// with no declared networks land on the runtime's default network.
pub fn service_attachments(
    service: &Service,
    container_id: &str,
    network_ids: &BTreeMap<String, String>,
) -> Result<Vec<NetworkAttachment>> {
    if service.networks.is_empty() {
        return Ok(vec![NetworkAttachment {
            network: DEFAULT_NETWORK_ID.to_string(),
            hostname: container_id.to_string(),
        }]);
    }

    service
        .networks
        .iter()
        .map(|name| {
            let id = network_ids.get(name).ok_or_else(|| {
                ConvoyError::NotFound(format!(
                    "service '{}' references undeclared network '{}'",
                    service.name, name
                ))
            })?;
            Ok(NetworkAttachment {
                network: id.clone(),
                hostname: container_id.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Network;

    fn project() -> Project {
        let mut project = Project {
            name: "proj".to_string(),
            ..Default::default()
        };
        project.networks.insert(
            "default".to_string(),
            Network {
                name: "default".to_string(),
                driver: "bridge".to_string(),
                external: false,
                external_name: None,
            },
        );
        project
    }

    #[tokio::test]
    async fn test_creates_missing_project_network() {
        let runtime = RuntimeClient::in_memory();
        let ids = ensure_networks(&runtime, &project()).await.unwrap();
        assert_eq!(ids.get("default").unwrap(), "proj_default");
        assert!(runtime.networks.get("proj_default").await.is_ok());
    }

    #[tokio::test]
    async fn test_existing_network_is_reused() {
        let runtime = RuntimeClient::in_memory();
        runtime
            .networks
            .create("proj_default", NetworkMode::Nat)
            .await
            .unwrap();
        let ids = ensure_networks(&runtime, &project()).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_external_network_fails() {
        let runtime = RuntimeClient::in_memory();
        let mut project = project();
        project.networks.insert(
            "shared".to_string(),
            Network {
                name: "shared".to_string(),
                driver: "bridge".to_string(),
                external: true,
                external_name: Some("corp-net".to_string()),
            },
        );

        let err = ensure_networks(&runtime, &project).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("corp-net"));
    }

    #[tokio::test]
    async fn test_unsupported_driver_rejected() {
        let runtime = RuntimeClient::in_memory();
        let mut project = project();
        project.networks.insert(
            "over".to_string(),
            Network {
                name: "over".to_string(),
                driver: "overlay".to_string(),
                external: false,
                external_name: None,
            },
        );

        let err = ensure_networks(&runtime, &project).await.unwrap_err();
        assert!(matches!(err, ConvoyError::InvalidArgument(_)));
    }

    #[test]
    fn test_attachments_preserve_declared_order() {
        let service = Service {
            name: "app".to_string(),
            networks: vec!["zebra".to_string(), "alpha".to_string()],
            ..Default::default()
        };
        let mut ids = BTreeMap::new();
        ids.insert("zebra".to_string(), "proj_zebra".to_string());
        ids.insert("alpha".to_string(), "proj_alpha".to_string());

        let attachments = service_attachments(&service, "proj_app", &ids).unwrap();
        let nets: Vec<&str> = attachments.iter().map(|a| a.network.as_str()).collect();
        assert_eq!(nets, vec!["proj_zebra", "proj_alpha"]);
        assert!(attachments.iter().all(|a| a.hostname == "proj_app"));
    }

    #[test]
    fn test_unattached_service_uses_runtime_default() {
        let service = Service {
            name: "app".to_string(),
            ..Default::default()
        };
        let attachments = service_attachments(&service, "proj_app", &BTreeMap::new()).unwrap();
        assert_eq!(attachments[0].network, DEFAULT_NETWORK_ID);
    }
}
