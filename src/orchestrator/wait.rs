//! Dependency gates and health polling
//!
//! Startup waits happen here: `service_started` polls the runtime until the
//! dependency's container reports running, `service_healthy` execs the
//! dependency's healthcheck until it passes, and
//! `service_completed_successfully` polls until the container disappears
//! from the runtime.

use crate::error::{ConvoyError, Result};
use crate::project::HealthCheck;
use crate::runtime::{ContainerClient, ContainerStatus, ProcessSpec, StdioMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Deadline for a `service_started` wait
pub const STARTED_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for a `service_completed_successfully` wait
pub const COMPLETED_TIMEOUT: Duration = Duration::from_secs(600);

/// Default deadline for the `up --wait` phase
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default delay between health probes
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of health probes before giving up
pub const DEFAULT_HEALTH_RETRIES: u32 = 10;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wait until container `id` exists and reports running.
pub async fn wait_for_started(containers: &Arc<dyn ContainerClient>, id: &str) -> Result<()> {
    timeout(STARTED_TIMEOUT, async {
        loop {
            if let Ok(summary) = containers.get(id).await {
                if summary.status == ContainerStatus::Running {
                    return;
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| {
        ConvoyError::Timeout(format!(
            "container {} did not reach running within {}s",
            id,
            STARTED_TIMEOUT.as_secs()
        ))
    })
}

/// Wait until container `id` disappears from the runtime listing.
///
/// Disappearance approximates successful completion; the adapter surface has
/// no exit-status hook.
pub async fn wait_for_completion(containers: &Arc<dyn ContainerClient>, id: &str) -> Result<()> {
    timeout(COMPLETED_TIMEOUT, async {
        loop {
            match containers.get(id).await {
                Err(err) if err.is_not_found() => return,
                _ => sleep(POLL_INTERVAL).await,
            }
        }
    })
    .await
    .map_err(|_| {
        ConvoyError::Timeout(format!(
            "container {} did not complete within {}s",
            id,
            COMPLETED_TIMEOUT.as_secs()
        ))
    })
}

/// Run one health probe inside the running container; true on exit code 0.
pub async fn run_healthcheck_once(
    containers: &Arc<dyn ContainerClient>,
    id: &str,
    health: &HealthCheck,
) -> Result<bool> {
    let Some((executable, arguments)) = health.test.split_first() else {
        return Ok(true);
    };
    let spec = ProcessSpec {
        executable: executable.clone(),
        arguments: arguments.to_vec(),
        ..Default::default()
    };
    let process = containers.create_process(id, spec, StdioMode::Null).await?;
    process.start().await?;
    let code = process.wait().await?;
    debug!("healthcheck in {} exited {}", id, code);
    Ok(code == 0)
}

/// Probe container `id` until its healthcheck passes.
///
/// Sleeps `start_period` first, then probes up to `retries` times with
/// `interval` between attempts.
pub async fn wait_for_healthy(
    containers: &Arc<dyn ContainerClient>,
    id: &str,
    health: &HealthCheck,
) -> Result<()> {
    if let Some(start_period) = health.start_period {
        sleep(start_period).await;
    }

    let interval = health.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL);
    let retries = health.retries.unwrap_or(DEFAULT_HEALTH_RETRIES);

    for attempt in 1..=retries {
        match run_healthcheck_once(containers, id, health).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                debug!("healthcheck attempt {}/{} failed for {}", attempt, retries, id);
            }
            Err(err) => {
                debug!(
                    "healthcheck attempt {}/{} errored for {}: {}",
                    attempt, retries, id, err
                );
            }
        }
        if attempt < retries {
            sleep(interval).await;
        }
    }

    Err(ConvoyError::Timeout(format!(
        "container {} did not become healthy after {} attempts",
        id, retries
    )))
}
