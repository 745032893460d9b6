//! Command execution inside running containers
//!
//! Spawns a process through the runtime with the caller's terminal attached
//! (unless detached) and forwards the first SIGINT/SIGTERM to it exactly
//! once; later signals are left alone.

use crate::error::{ConvoyError, Result};
use crate::runtime::{ContainerClient, ProcessSpec, StdioMode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Options for `exec`
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Do not wait for the process
    pub detach: bool,
    /// Keep stdin attached
    pub interactive: bool,
    /// Allocate a terminal
    pub tty: bool,
    /// Run as this user
    pub user: Option<String>,
    /// Working directory inside the container
    pub workdir: Option<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
}

/// Run `command` inside container `id` and return its exit code (0 when
/// detached).
pub(crate) async fn exec_in_container(
    containers: &Arc<dyn ContainerClient>,
    id: &str,
    command: &[String],
    options: &ExecOptions,
) -> Result<i32> {
    let (executable, arguments) = command.split_first().ok_or_else(|| {
        ConvoyError::InvalidArgument("exec requires a command".to_string())
    })?;

    let environment: BTreeMap<String, String> = options.env.iter().cloned().collect();
    let spec = ProcessSpec {
        executable: executable.clone(),
        arguments: arguments.to_vec(),
        environment,
        working_dir: options.workdir.clone(),
        user: options.user.clone(),
        terminal: options.tty,
    };
    let stdio = if options.detach {
        StdioMode::Null
    } else {
        StdioMode::Inherit
    };

    let process = containers.create_process(id, spec, stdio).await?;
    process.start().await?;
    if options.detach {
        return Ok(0);
    }

    wait_forwarding_signals(process).await
}

#[cfg(unix)]
async fn wait_forwarding_signals(process: Arc<dyn crate::runtime::ProcessHandle>) -> Result<i32> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut waiter = {
        let process = process.clone();
        tokio::spawn(async move { process.wait().await })
    };

    let mut forwarded = false;
    loop {
        tokio::select! {
            result = &mut waiter => {
                return result.map_err(|e| ConvoyError::Internal(format!("exec wait: {}", e)))?;
            }
            _ = sigint.recv(), if !forwarded => {
                debug!("forwarding SIGINT to exec process");
                forwarded = true;
                let _ = process.kill(SIGINT).await;
            }
            _ = sigterm.recv(), if !forwarded => {
                debug!("forwarding SIGTERM to exec process");
                forwarded = true;
                let _ = process.kill(SIGTERM).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_forwarding_signals(process: Arc<dyn crate::runtime::ProcessHandle>) -> Result<i32> {
    process.wait().await
}

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::InMemoryRuntime;
    use crate::runtime::{ContainerConfiguration, RuntimeClient};

    async fn running(runtime: &RuntimeClient, id: &str) {
        runtime
            .containers
            .create(ContainerConfiguration {
                id: id.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime.containers.start(id).await.unwrap();
    }

    fn client() -> (Arc<InMemoryRuntime>, RuntimeClient) {
        let backend = Arc::new(InMemoryRuntime::new());
        let runtime = RuntimeClient {
            containers: backend.clone(),
            images: backend.clone(),
            networks: backend.clone(),
            volumes: backend.clone(),
        };
        (backend, runtime)
    }

    #[tokio::test]
    async fn test_exec_returns_exit_code() {
        let (backend, runtime) = client();
        running(&runtime, "proj_app").await;
        backend.set_exec_exit_code("proj_app", 3).await;

        let code = exec_in_container(
            &runtime.containers,
            "proj_app",
            &["ls".to_string(), "-l".to_string()],
            &ExecOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(code, 3);

        let history = backend.exec_history().await;
        assert_eq!(history[0].1, vec!["ls", "-l"]);
    }

    #[tokio::test]
    async fn test_exec_detached_returns_zero() {
        let (backend, runtime) = client();
        running(&runtime, "proj_app").await;
        backend.set_exec_exit_code("proj_app", 9).await;

        let code = exec_in_container(
            &runtime.containers,
            "proj_app",
            &["sleep".to_string()],
            &ExecOptions {
                detach: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_exec_empty_command_rejected() {
        let (_, runtime) = client();
        let err = exec_in_container(&runtime.containers, "proj_app", &[], &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_exec_on_stopped_container_fails() {
        let (_, runtime) = client();
        runtime
            .containers
            .create(ContainerConfiguration {
                id: "proj_app".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = exec_in_container(
            &runtime.containers,
            "proj_app",
            &["true".to_string()],
            &ExecOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConvoyError::Internal(_)));
    }
}
