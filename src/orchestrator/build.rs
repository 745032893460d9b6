//! Image building
//!
//! Builds are delegated to an external builder executable. This module plans
//! build requests (deterministic tags, context and dockerfile checks),
//! locates the builder, and runs it with captured stderr.

use crate::error::{ConvoyError, Result};
use crate::project::{BuildConfig, Service};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Name of the external builder executable
pub const BUILDER_EXECUTABLE: &str = "convoy-builder";

/// Standard install locations probed when discovery fails elsewhere
const STANDARD_LOCATIONS: &[&str] = &["/usr/local/bin", "/opt/convoy/bin", "/usr/bin"];

/// Cache key for a completed build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub project: String,
    pub service: String,
    pub context: PathBuf,
    pub dockerfile: String,
    pub args: String,
}

/// A planned build for one service.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Cache key
    pub key: BuildKey,
    /// Tag the image is built under
    pub tag: String,
    /// Context directory
    pub context: PathBuf,
    /// Dockerfile argument passed to the builder, when not the default
    pub dockerfile: Option<String>,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Target stage
    pub target: Option<String>,
}

/// Deterministic tag for a built image:
/// `<project>_<service>:<12 hex of SHA-256(project, service, context,
/// dockerfile, sorted args)>`.
pub fn deterministic_tag(project: &str, service: &str, build: &BuildConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update(b"\0");
    hasher.update(service.as_bytes());
    hasher.update(b"\0");
    hasher.update(build.context.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(build.dockerfile.as_deref().unwrap_or("Dockerfile").as_bytes());
    hasher.update(b"\0");
    hasher.update(sorted_args(&build.args).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}:{}", project, service, &digest[..12])
}

/// The image a service runs: its declared image, the deterministic build
/// tag, or `unknown` (unreachable when the image-or-build invariant holds).
pub fn effective_image(project: &str, service: &Service) -> String {
    if let Some(image) = &service.image {
        image.clone()
    } else if let Some(build) = &service.build {
        deterministic_tag(project, &service.name, build)
    } else {
        "unknown".to_string()
    }
}

fn sorted_args(args: &BTreeMap<String, String>) -> String {
    args.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Plan the build for `service`, verifying that the context directory and
/// dockerfile exist.
pub fn plan_build(project: &str, service: &Service, build: &BuildConfig) -> Result<BuildRequest> {
    if !build.context.is_dir() {
        return Err(ConvoyError::NotFound(format!(
            "service '{}': build context {} does not exist",
            service.name,
            build.context.display()
        )));
    }

    let dockerfile_name = build.dockerfile.as_deref().unwrap_or("Dockerfile");
    let dockerfile_path = if Path::new(dockerfile_name).is_absolute() {
        PathBuf::from(dockerfile_name)
    } else {
        build.context.join(dockerfile_name)
    };
    if !dockerfile_path.is_file() {
        return Err(ConvoyError::NotFound(format!(
            "service '{}': dockerfile {} does not exist",
            service.name,
            dockerfile_path.display()
        )));
    }

    Ok(BuildRequest {
        key: BuildKey {
            project: project.to_string(),
            service: service.name.to_string(),
            context: build.context.clone(),
            dockerfile: dockerfile_name.to_string(),
            args: sorted_args(&build.args),
        },
        tag: effective_image(project, service),
        context: build.context.clone(),
        dockerfile: build.dockerfile.clone(),
        args: build.args.clone(),
        target: build.target.clone(),
    })
}

/// Adapter around the external builder executable.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    executable: Option<PathBuf>,
}

impl ImageBuilder {
    /// Builder using the discovery chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pinned to a specific executable.
    pub fn with_executable(path: PathBuf) -> Self {
        Self {
            executable: Some(path),
        }
    }

    /// Locate the builder executable: explicit path, `which`, the current
    /// executable's sibling, then standard install locations.
    pub fn locate(&self) -> Result<PathBuf> {
        if let Some(path) = &self.executable {
            return Ok(path.clone());
        }
        if let Ok(path) = which::which(BUILDER_EXECUTABLE) {
            return Ok(path);
        }
        if let Ok(current) = std::env::current_exe() {
            if let Some(dir) = current.parent() {
                let sibling = dir.join(BUILDER_EXECUTABLE);
                if sibling.is_file() {
                    return Ok(sibling);
                }
            }
        }
        for dir in STANDARD_LOCATIONS {
            let candidate = Path::new(dir).join(BUILDER_EXECUTABLE);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(ConvoyError::NotFound(format!(
            "builder executable '{}' (install it or pass an explicit path)",
            BUILDER_EXECUTABLE
        )))
    }

    /// Run one build. The builder's non-zero exit becomes an error carrying
    /// its captured stderr.
    pub async fn build(&self, request: &BuildRequest) -> Result<()> {
        let executable = self.locate()?;
        info!(
            "building {} from {}",
            request.tag,
            request.context.display()
        );

        let mut command = Command::new(&executable);
        command.arg("build");
        if let Some(dockerfile) = &request.dockerfile {
            command.arg("--file").arg(dockerfile);
        }
        for (key, value) in &request.args {
            command.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        if let Some(target) = &request.target {
            command.arg("--target").arg(target);
        }
        command
            .arg("--tag")
            .arg(&request.tag)
            .arg(&request.context)
            .current_dir(&request.context);

        debug!("running {:?}", command);
        let output = command.output().await.map_err(|e| {
            ConvoyError::Internal(format!("failed to run {}: {}", executable.display(), e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConvoyError::Internal(format!(
                "build of {} failed ({}): {}",
                request.tag,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
