//! Configuration fingerprinting
//!
//! A container's effective configuration is reduced to a canonical JSON
//! document and hashed. The hash is stored as a label on the container;
//! reconciliation compares it against the expected value to decide between
//! reuse and recreate. Map-order differences in the input must not change
//! the hash, so every collection is sorted before serialization.

use crate::orchestrator::LABEL_CONFIG_HASH;
use crate::project::HealthCheck;
use crate::runtime::ContainerConfiguration;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Compute the configuration hash for a container.
///
/// `mount_keys` are the logical `dest=source:options` descriptors, with the
/// volume name (not the resolved host path) as the source for named and
/// anonymous volumes, so host-side churn does not invalidate the hash.
pub fn config_hash(
    config: &ContainerConfiguration,
    mount_keys: &[String],
    health: Option<&HealthCheck>,
) -> String {
    let mut ports: Vec<String> = config
        .published_ports
        .iter()
        .map(|p| {
            format!(
                "{}:{}->{}/{}",
                p.host_ip, p.host_port, p.container_port, p.protocol
            )
        })
        .collect();
    ports.sort();

    let mut mounts = mount_keys.to_vec();
    mounts.sort();

    let labels: BTreeMap<&String, &String> = config
        .labels
        .iter()
        .filter(|(key, _)| key.as_str() != LABEL_CONFIG_HASH)
        .collect();

    let healthcheck = health.map(|hc| {
        json!({
            "test": hc.test,
            "interval": hc.interval.map(|d| d.as_secs()),
            "timeout": hc.timeout.map(|d| d.as_secs()),
            "retries": hc.retries,
            "start_period": hc.start_period.map(|d| d.as_secs()),
        })
    });

    let canonical = json!({
        "image": config.image,
        "executable": config.executable,
        "arguments": config.arguments,
        "workdir": config.working_dir,
        "environment": config.environment,
        "cpus": config.cpus,
        "memory": config.memory_bytes,
        "ports": ports,
        "mounts": mounts,
        "labels": labels,
        "healthcheck": healthcheck,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PublishedPort;

    fn base_config() -> ContainerConfiguration {
        ContainerConfiguration {
            id: "proj_app".to_string(),
            image: "busybox".to_string(),
            executable: "/bin/sh".to_string(),
            arguments: vec!["-c".to_string(), "sleep 1".to_string()],
            cpus: 4,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let config = base_config();
        assert_eq!(
            config_hash(&config, &[], None),
            config_hash(&config, &[], None)
        );
    }

    #[test]
    fn test_hash_ignores_port_order() {
        let mut a = base_config();
        a.published_ports = vec![
            PublishedPort {
                host_ip: "0.0.0.0".to_string(),
                host_port: 80,
                container_port: 80,
                protocol: "tcp".to_string(),
            },
            PublishedPort {
                host_ip: "0.0.0.0".to_string(),
                host_port: 443,
                container_port: 443,
                protocol: "tcp".to_string(),
            },
        ];
        let mut b = base_config();
        b.published_ports = a.published_ports.iter().rev().cloned().collect();

        assert_eq!(config_hash(&a, &[], None), config_hash(&b, &[], None));
    }

    #[test]
    fn test_hash_ignores_mount_key_order() {
        let config = base_config();
        let forward = vec!["/a=x:".to_string(), "/b=y:ro".to_string()];
        let backward: Vec<String> = forward.iter().rev().cloned().collect();
        assert_eq!(
            config_hash(&config, &forward, None),
            config_hash(&config, &backward, None)
        );
    }

    #[test]
    fn test_hash_changes_with_image() {
        let a = base_config();
        let mut b = base_config();
        b.image = "alpine".to_string();
        assert_ne!(config_hash(&a, &[], None), config_hash(&b, &[], None));
    }

    #[test]
    fn test_hash_excludes_own_label() {
        let a = base_config();
        let mut b = base_config();
        b.labels
            .insert(LABEL_CONFIG_HASH.to_string(), "stale".to_string());
        assert_eq!(config_hash(&a, &[], None), config_hash(&b, &[], None));
    }

    #[test]
    fn test_hash_includes_healthcheck() {
        let config = base_config();
        let hc = HealthCheck {
            test: vec!["/bin/true".to_string()],
            interval: None,
            timeout: None,
            retries: None,
            start_period: None,
        };
        assert_ne!(
            config_hash(&config, &[], None),
            config_hash(&config, &[], Some(&hc))
        );
    }
}
