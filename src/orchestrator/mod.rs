//! Project orchestration
//!
//! The orchestrator reconciles a [`Project`] against the runtime. It is a
//! single-writer actor: every mutation of per-project state (container
//! records, the build cache) happens behind one mutex, and operations
//! interleave only at await points. Parallelism shows up in two bounded
//! places: concurrent builds and concurrent provisioning within one
//! dependency level.

pub mod build;
pub mod exec;
pub mod fingerprint;
pub mod logs;
pub mod network;
pub mod reconcile;
pub mod volume;
pub mod wait;

pub use build::ImageBuilder;
pub use exec::ExecOptions;
pub use logs::{LogEntry, LogOptions};

use crate::error::{ConvoyError, Result};
use crate::project::resolver::{self, ServicePlan};
use crate::project::{Project, Service};
use crate::runtime::{ContainerStatus, ContainerSummary, RuntimeClient};
use build::{BuildKey, BuildRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Label binding a container to its project
pub const LABEL_PROJECT: &str = "com.apple.compose.project";
/// Label binding a container to its service
pub const LABEL_SERVICE: &str = "com.apple.compose.service";
/// Label carrying the container's compose name
pub const LABEL_CONTAINER: &str = "com.apple.compose.container";
/// Label carrying the configuration fingerprint
pub const LABEL_CONFIG_HASH: &str = "com.apple.container.compose.config-hash";
/// Volume label carrying the mount target
pub const LABEL_TARGET: &str = "com.apple.compose.target";
/// Volume label marking anonymous volumes
pub const LABEL_ANONYMOUS: &str = "com.apple.compose.anonymous";

/// Maximum concurrent image builds
const MAX_CONCURRENT_BUILDS: usize = 3;

/// Project-state entries untouched longer than this are purged
const PROJECT_STATE_TTL: Duration = Duration::from_secs(3600);

/// Image pull policy for `up`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    /// Always fetch
    Always,
    /// Fetch only when the image is absent
    #[default]
    Missing,
    /// Never fetch; fail when absent
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            other => Err(ConvoyError::InvalidArgument(format!(
                "unknown pull policy '{}' (expected always, missing, or never)",
                other
            ))),
        }
    }
}

/// Options for `up`
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Do not attach to logs after starting
    pub detach: bool,
    /// Recreate containers even when their configuration is unchanged
    pub force_recreate: bool,
    /// Never recreate existing containers
    pub no_recreate: bool,
    /// Start only the selected services, without their dependencies
    pub no_deps: bool,
    /// Remove containers of services no longer in the project
    pub remove_orphans: bool,
    /// Remove containers when the foreground invocation exits
    pub remove_on_exit: bool,
    /// Image pull policy
    pub pull_policy: PullPolicy,
    /// Block until services are running/healthy
    pub wait: bool,
    /// Deadline for the wait phase
    pub wait_timeout: Option<Duration>,
    /// Skip health gates and health waits
    pub no_healthcheck: bool,
}

/// Options for `down`
#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    /// Also delete project volumes (and project-labeled anonymous ones)
    pub remove_volumes: bool,
    /// Also match containers by name prefix
    pub remove_orphans: bool,
}

/// What `down` removed.
#[derive(Debug, Clone, Default)]
pub struct DownReport {
    /// Container IDs removed
    pub removed_containers: Vec<String>,
    /// Volume names removed
    pub removed_volumes: Vec<String>,
}

/// One row of `ps` output.
#[derive(Debug, Clone)]
pub struct PsEntry {
    /// Service name (from the container's label)
    pub service: String,
    /// Shortened container ID
    pub short_id: String,
    /// Image reference
    pub image: String,
    /// Status string
    pub status: String,
    /// Rendered port mappings
    pub ports: String,
}

struct ContainerRecord {
    container_id: String,
    config_hash: String,
}

#[derive(Default)]
struct ProjectState {
    containers: HashMap<String, ContainerRecord>,
    touched: Option<Instant>,
}

#[derive(Default)]
struct OrchestratorState {
    projects: HashMap<String, ProjectState>,
    build_cache: HashMap<BuildKey, String>,
}

/// The orchestrator actor.
pub struct Orchestrator {
    pub(crate) runtime: RuntimeClient,
    builder: ImageBuilder,
    state: Mutex<OrchestratorState>,
}

impl Orchestrator {
    /// Orchestrator over `runtime` with default builder discovery.
    pub fn new(runtime: RuntimeClient) -> Self {
        Self::with_builder(runtime, ImageBuilder::new())
    }

    /// Orchestrator with an explicit image builder.
    pub fn with_builder(runtime: RuntimeClient, builder: ImageBuilder) -> Self {
        Self {
            runtime,
            builder,
            state: Mutex::new(OrchestratorState::default()),
        }
    }

    /// Create and start the project's containers in dependency order.
    pub async fn up(&self, project: &Project, selected: &[String], options: &UpOptions) -> Result<()> {
        let targets = self.select_services(project, selected, options);
        if targets.is_empty() {
            warn!("no services to start for project {}", project.name);
            return Ok(());
        }
        let plan = plan_for(&targets, options)?;

        let network_ids = network::ensure_networks(&self.runtime, project).await?;

        self.build_images(project, &targets).await?;

        if options.remove_orphans {
            self.remove_orphan_containers(project).await;
        }

        for group in &plan.parallel_groups {
            let provisioning = group.iter().map(|name| {
                let service = targets.get(name).expect("planned service");
                self.provision_service(project, service, &targets, &network_ids, options)
            });
            futures::future::try_join_all(provisioning).await?;
        }

        if options.wait {
            let deadline = options.wait_timeout.unwrap_or(wait::DEFAULT_WAIT_TIMEOUT);
            tokio::time::timeout(deadline, self.wait_phase(project, &plan, &targets, options))
                .await
                .map_err(|_| {
                    ConvoyError::Timeout(format!(
                        "services did not become ready within {}s",
                        deadline.as_secs()
                    ))
                })??;
        }

        self.purge_stale_state().await;
        Ok(())
    }

    /// Stop and remove the project's containers, optionally with volumes
    /// and networks. Best-effort throughout: failures are logged, not
    /// propagated.
    pub async fn down(&self, project: &Project, options: &DownOptions) -> Result<DownReport> {
        let mut report = DownReport::default();

        let containers = self
            .project_containers(&project.name, options.remove_orphans)
            .await?;
        for summary in containers {
            if let Err(err) = self.runtime.containers.stop(&summary.id).await {
                warn!("stop of {} failed: {}", summary.id, err);
            }
            match self.runtime.containers.delete(&summary.id, true).await {
                Ok(()) => report.removed_containers.push(summary.id),
                Err(err) => warn!("delete of {} failed: {}", summary.id, err),
            }
        }

        if options.remove_volumes {
            for (name, volume) in &project.volumes {
                if volume.external {
                    continue;
                }
                match self.runtime.volumes.delete(name).await {
                    Ok(()) => report.removed_volumes.push(name.clone()),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => warn!("delete of volume {} failed: {}", name, err),
                }
            }
            if let Ok(volumes) = self.runtime.volumes.list().await {
                for info in volumes {
                    let ours = info.labels.get(LABEL_PROJECT).map(String::as_str)
                        == Some(project.name.as_str());
                    let anonymous = info.labels.get(LABEL_ANONYMOUS).map(String::as_str)
                        == Some("true");
                    if ours && anonymous {
                        match self.runtime.volumes.delete(&info.name).await {
                            Ok(()) => report.removed_volumes.push(info.name),
                            Err(err) => warn!("delete of volume {} failed: {}", info.name, err),
                        }
                    }
                }
            }
        }

        for network in project.networks.values() {
            if network.external {
                continue;
            }
            let id = project.network_id(network);
            match self.runtime.networks.delete(&id).await {
                Ok(()) => debug!("removed network {}", id),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!("delete of network {} failed: {}", id, err),
            }
        }

        {
            let mut state = self.state.lock().await;
            state.projects.remove(&project.name);
        }
        Ok(report)
    }

    /// List the project's containers.
    pub async fn ps(&self, project: &Project) -> Result<Vec<PsEntry>> {
        let mut entries: Vec<PsEntry> = self
            .project_containers(&project.name, false)
            .await?
            .into_iter()
            .map(|summary| {
                let ports = summary
                    .configuration
                    .published_ports
                    .iter()
                    .map(|p| {
                        format!(
                            "{}:{}->{}/{}",
                            p.host_ip, p.host_port, p.container_port, p.protocol
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                PsEntry {
                    service: summary
                        .configuration
                        .labels
                        .get(LABEL_SERVICE)
                        .cloned()
                        .unwrap_or_default(),
                    short_id: summary.id.chars().take(12).collect(),
                    image: summary.configuration.image.clone(),
                    status: summary.status.to_string(),
                    ports,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(entries)
    }

    /// Stream logs for the selected services (all when empty).
    pub async fn logs(
        &self,
        project: &Project,
        selected: &[String],
        options: &LogOptions,
    ) -> Result<mpsc::Receiver<LogEntry>> {
        let mut targets = Vec::new();
        for (name, service) in &project.services {
            if !selected.is_empty() && !selected.iter().any(|s| s == name) {
                continue;
            }
            let container_id = project.container_id(service);
            match self.runtime.containers.get(&container_id).await {
                Ok(_) => targets.push((name.clone(), container_id)),
                Err(err) => warn!("skipping logs for {}: {}", container_id, err),
            }
        }
        logs::stream_logs(&self.runtime.containers, targets, options).await
    }

    /// Execute a command inside a service's container.
    pub async fn exec(
        &self,
        project: &Project,
        service: &str,
        command: &[String],
        options: &ExecOptions,
    ) -> Result<i32> {
        let service = project.services.get(service).ok_or_else(|| {
            ConvoyError::NotFound(format!("service '{}' is not part of the project", service))
        })?;
        let container_id = project.container_id(service);
        self.runtime.containers.get(&container_id).await?;
        exec::exec_in_container(&self.runtime.containers, &container_id, command, options).await
    }

    /// Start the project with default options.
    pub async fn start(&self, project: &Project) -> Result<()> {
        self.up(project, &[], &UpOptions::default()).await
    }

    /// Stop the project, leaving volumes and images in place.
    pub async fn stop(&self, project: &Project) -> Result<DownReport> {
        self.down(project, &DownOptions::default()).await
    }

    /// Stop then start the project.
    pub async fn restart(&self, project: &Project) -> Result<()> {
        self.stop(project).await?;
        self.start(project).await
    }

    /// Remove containers of the selected services (all when empty). Running
    /// containers are skipped unless `force`.
    pub async fn remove(
        &self,
        project: &Project,
        services: &[String],
        force: bool,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for summary in self.project_containers(&project.name, false).await? {
            let service = summary
                .configuration
                .labels
                .get(LABEL_SERVICE)
                .cloned()
                .unwrap_or_default();
            if !services.is_empty() && !services.iter().any(|s| *s == service) {
                continue;
            }
            if summary.status == ContainerStatus::Running && !force {
                warn!("container {} is running; use force to remove", summary.id);
                continue;
            }
            if let Err(err) = self.runtime.containers.stop(&summary.id).await {
                warn!("stop of {} failed: {}", summary.id, err);
            }
            self.runtime.containers.delete(&summary.id, true).await?;
            removed.push(summary.id);
        }
        Ok(removed)
    }

    /// Run each selected service's healthcheck once. Services without a
    /// healthcheck report whether their container is running.
    pub async fn check_health(
        &self,
        project: &Project,
        services: &[String],
    ) -> Result<BTreeMap<String, bool>> {
        let mut results = BTreeMap::new();
        for (name, service) in &project.services {
            if !services.is_empty() && !services.iter().any(|s| s == name) {
                continue;
            }
            let container_id = project.container_id(service);
            let healthy = match &service.health_check {
                Some(health) => {
                    wait::run_healthcheck_once(&self.runtime.containers, &container_id, health)
                        .await
                        .unwrap_or(false)
                }
                None => self
                    .runtime
                    .containers
                    .get(&container_id)
                    .await
                    .map(|s| s.status == ContainerStatus::Running)
                    .unwrap_or(false),
            };
            results.insert(name.clone(), healthy);
        }
        Ok(results)
    }

    // -- internals ----------------------------------------------------------

    fn select_services(
        &self,
        project: &Project,
        selected: &[String],
        options: &UpOptions,
    ) -> BTreeMap<String, Service> {
        if selected.is_empty() {
            return project.services.clone();
        }
        if options.no_deps {
            return project
                .services
                .iter()
                .filter(|(name, _)| selected.iter().any(|s| s == *name))
                .map(|(name, service)| (name.clone(), service.clone()))
                .collect();
        }
        let (reduced, unknown) = resolver::filter_with_dependencies(&project.services, selected);
        for name in unknown {
            warn!("requested service '{}' does not resolve; skipping", name);
        }
        reduced
    }

    async fn provision_service(
        &self,
        project: &Project,
        service: &Service,
        targets: &BTreeMap<String, Service>,
        network_ids: &BTreeMap<String, String>,
        options: &UpOptions,
    ) -> Result<()> {
        for dep in &service.depends_on_started {
            if let Some(dep_service) = targets.get(dep) {
                let dep_id = project.container_id(dep_service);
                debug!("{} waits for {} to start", service.name, dep);
                wait::wait_for_started(&self.runtime.containers, &dep_id).await?;
            }
        }
        if !options.no_healthcheck {
            for dep in &service.depends_on_healthy {
                if let Some(dep_service) = targets.get(dep) {
                    if let Some(health) = &dep_service.health_check {
                        let dep_id = project.container_id(dep_service);
                        debug!("{} waits for {} to become healthy", service.name, dep);
                        wait::wait_for_healthy(&self.runtime.containers, &dep_id, health).await?;
                    }
                }
            }
        }
        for dep in &service.depends_on_completed {
            if let Some(dep_service) = targets.get(dep) {
                let dep_id = project.container_id(dep_service);
                debug!("{} waits for {} to complete", service.name, dep);
                wait::wait_for_completion(&self.runtime.containers, &dep_id).await?;
            }
        }

        self.reconcile_service(project, service, network_ids, options)
            .await
    }

    async fn wait_phase(
        &self,
        project: &Project,
        plan: &ServicePlan,
        targets: &BTreeMap<String, Service>,
        options: &UpOptions,
    ) -> Result<()> {
        for name in &plan.start_order {
            let service = targets.get(name).expect("planned service");
            let container_id = project.container_id(service);
            match &service.health_check {
                Some(health) if !options.no_healthcheck => {
                    wait::wait_for_healthy(&self.runtime.containers, &container_id, health).await?;
                }
                _ => {
                    wait::wait_for_started(&self.runtime.containers, &container_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn build_images(&self, project: &Project, targets: &BTreeMap<String, Service>) -> Result<()> {
        let mut requests: Vec<BuildRequest> = Vec::new();
        {
            let state = self.state.lock().await;
            for service in targets.values() {
                let Some(build_config) = &service.build else {
                    continue;
                };
                let request = build::plan_build(&project.name, service, build_config)?;
                if state.build_cache.contains_key(&request.key) {
                    debug!("build of {} cached", request.tag);
                    continue;
                }
                requests.push(request);
            }
        }
        if requests.is_empty() {
            return Ok(());
        }

        let build_count = requests.len();
        let permits = MAX_CONCURRENT_BUILDS.min(build_count);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();
        for request in requests {
            let builder = self.builder.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                builder.build(&request).await.map(|()| request)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(request)) => {
                    let mut state = self.state.lock().await;
                    state.build_cache.insert(request.key, request.tag);
                }
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(ConvoyError::Internal(format!("build task: {}", err)));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!("built {} image(s) for {}", build_count, project.name);
                Ok(())
            }
        }
    }

    /// Containers belonging to `project`, matched by label, or by the
    /// `<project>_` ID prefix when `include_prefix`.
    async fn project_containers(
        &self,
        project_name: &str,
        include_prefix: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let prefix = format!("{}_", project_name);
        Ok(self
            .runtime
            .containers
            .list()
            .await?
            .into_iter()
            .filter(|summary| {
                let labeled = summary.configuration.labels.get(LABEL_PROJECT).map(String::as_str)
                    == Some(project_name);
                labeled || (include_prefix && summary.id.starts_with(&prefix))
            })
            .collect())
    }

    async fn remove_orphan_containers(&self, project: &Project) {
        let containers = match self.project_containers(&project.name, true).await {
            Ok(containers) => containers,
            Err(err) => {
                warn!("cannot enumerate containers for orphan removal: {}", err);
                return;
            }
        };
        for summary in containers {
            let service = summary.configuration.labels.get(LABEL_SERVICE);
            let orphan = match service {
                Some(name) => !project.services.contains_key(name),
                None => true,
            };
            if !orphan {
                continue;
            }
            info!("removing orphan container {}", summary.id);
            if let Err(err) = self.stop_and_remove(&summary.id).await {
                warn!("orphan removal of {} failed: {}", summary.id, err);
            }
        }
    }

    pub(crate) async fn record_container(
        &self,
        project: &str,
        service: &str,
        container_id: &str,
        config_hash: &str,
    ) {
        let mut state = self.state.lock().await;
        let project_state = state.projects.entry(project.to_string()).or_default();
        project_state.containers.insert(
            service.to_string(),
            ContainerRecord {
                container_id: container_id.to_string(),
                config_hash: config_hash.to_string(),
            },
        );
        project_state.touched = Some(Instant::now());
    }

    /// Recorded configuration hash for a service, when the orchestrator has
    /// reconciled it in this process.
    pub async fn recorded_hash(&self, project: &str, service: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .projects
            .get(project)
            .and_then(|p| p.containers.get(service))
            .map(|record| record.config_hash.clone())
    }

    /// Recorded container ID for a service, when the orchestrator has
    /// reconciled it in this process.
    pub async fn recorded_container(&self, project: &str, service: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .projects
            .get(project)
            .and_then(|p| p.containers.get(service))
            .map(|record| record.container_id.clone())
    }

    async fn purge_stale_state(&self) {
        let mut state = self.state.lock().await;
        state.projects.retain(|name, project| {
            let fresh = project
                .touched
                .map(|touched| touched.elapsed() <= PROJECT_STATE_TTL)
                .unwrap_or(false);
            if !fresh {
                debug!("purging stale state for project {}", name);
            }
            fresh
        });
    }
}

fn plan_for(targets: &BTreeMap<String, Service>, options: &UpOptions) -> Result<ServicePlan> {
    if !options.no_deps {
        return resolver::resolve(targets);
    }
    // with --no-deps, edges to excluded services are dropped
    let restricted: BTreeMap<String, Service> = targets
        .iter()
        .map(|(name, service)| {
            let mut service = service.clone();
            service.depends_on.retain(|d| targets.contains_key(d));
            service.depends_on_healthy.retain(|d| targets.contains_key(d));
            service.depends_on_started.retain(|d| targets.contains_key(d));
            service.depends_on_completed.retain(|d| targets.contains_key(d));
            (name.clone(), service)
        })
        .collect();
    resolver::resolve(&restricted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            image: Some("busybox".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_for_no_deps_drops_external_edges() {
        let mut web = service("web");
        web.depends_on = vec!["db".to_string()];
        let mut targets = BTreeMap::new();
        targets.insert("web".to_string(), web);

        let options = UpOptions {
            no_deps: true,
            ..Default::default()
        };
        let plan = plan_for(&targets, &options).unwrap();
        assert_eq!(plan.start_order, vec!["web"]);
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::Missing);
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }
}
