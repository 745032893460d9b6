//! Compose file to project conversion
//!
//! Runs after merging, in four stages: `extends` resolution, profile
//! filtering, selection filtering, and normalization into the canonical
//! [`Project`] model.

use super::env_file::read_env_file;
use super::file::{
    BuildDef, Command, ComposeFile, DependsOn, HealthcheckDef, ServiceDef, VolumeMountDef,
};
use crate::error::{ConvoyError, Result};
use crate::project::{
    BuildConfig, HealthCheck, MountKind, Network, PortMapping, Project, Protocol, Service, Volume,
    VolumeMount, DEFAULT_NETWORK,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Conversion options
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Explicit project name; falls back to the compose `name` key, then the
    /// lowercased base directory name
    pub project_name: Option<String>,
    /// Active profiles
    pub profiles: Vec<String>,
    /// Explicit service selection (empty = all)
    pub services: Vec<String>,
    /// Directory of the first compose file; anchors env_file and build paths
    pub base_dir: PathBuf,
    /// Directory relative bind-mount sources resolve against
    pub working_dir: PathBuf,
    /// Ambient environment for env_file expansion and `~` resolution
    pub env: BTreeMap<String, String>,
}

/// Convert a merged compose document into a [`Project`].
pub fn convert(file: &ComposeFile, options: &ConvertOptions) -> Result<Project> {
    let resolved = resolve_extends(file)?;
    let filtered = filter_profiles(resolved, &options.profiles);
    let selected = filter_selection(filtered, &options.services);

    let project_name = options
        .project_name
        .clone()
        .or_else(|| file.name.clone())
        .unwrap_or_else(|| directory_name(&options.base_dir));

    let mut project = Project {
        name: project_name,
        ..Default::default()
    };

    for (name, def) in &selected {
        let service = normalize_service(name, def, options)?;
        project.services.insert(name.clone(), service);
    }

    for (name, def) in &file.networks {
        let external = def.external.as_ref().is_some_and(|e| e.is_external());
        project.networks.insert(
            name.clone(),
            Network {
                name: name.clone(),
                driver: def.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                external,
                external_name: if external {
                    def.external
                        .as_ref()
                        .and_then(|e| e.name())
                        .map(str::to_string)
                        .or_else(|| def.name.clone())
                } else {
                    None
                },
            },
        );
    }
    if !project.networks.contains_key(DEFAULT_NETWORK) {
        project.networks.insert(
            DEFAULT_NETWORK.to_string(),
            Network {
                name: DEFAULT_NETWORK.to_string(),
                driver: "bridge".to_string(),
                external: false,
                external_name: None,
            },
        );
    }

    for (name, def) in &file.volumes {
        let external = def.external.as_ref().is_some_and(|e| e.is_external());
        project.volumes.insert(
            name.clone(),
            Volume {
                name: name.clone(),
                driver: def.driver.clone().unwrap_or_else(|| "local".to_string()),
                external,
            },
        );
    }

    Ok(project)
}

fn directory_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "default".to_string())
}

// ---------------------------------------------------------------------------
// Stage 1: extends

fn resolve_extends(file: &ComposeFile) -> Result<BTreeMap<String, ServiceDef>> {
    let mut resolved: BTreeMap<String, ServiceDef> = BTreeMap::new();
    for name in file.services.keys() {
        let mut stack = Vec::new();
        resolve_one(file, name, &mut resolved, &mut stack)?;
    }
    Ok(resolved)
}

fn resolve_one(
    file: &ComposeFile,
    name: &str,
    resolved: &mut BTreeMap<String, ServiceDef>,
    stack: &mut Vec<String>,
) -> Result<ServiceDef> {
    if let Some(done) = resolved.get(name) {
        return Ok(done.clone());
    }
    if stack.iter().any(|s| s == name) {
        let mut path: Vec<&str> = stack.iter().skip_while(|s| *s != name).map(String::as_str).collect();
        path.push(name);
        return Err(ConvoyError::InvalidArgument(format!(
            "circular extends chain: {}",
            path.join(" → ")
        )));
    }

    let def = file
        .services
        .get(name)
        .ok_or_else(|| ConvoyError::NotFound(format!("extends references unknown service '{}'", name)))?;

    let result = match &def.extends {
        None => def.clone(),
        Some(extends) => {
            if let Some(other_file) = extends.file() {
                return Err(ConvoyError::InvalidArgument(format!(
                    "service '{}': extends across files is not supported (file: {})",
                    name, other_file
                )));
            }
            stack.push(name.to_string());
            let base = resolve_one(file, extends.service(), resolved, stack)?;
            stack.pop();
            merge_extended(base, def)
        }
    };

    resolved.insert(name.to_string(), result.clone());
    Ok(result)
}

/// Merge a derived service over its resolved base: scalars overridden,
/// volumes/ports/env_file/profiles concatenated (base first), environment and
/// labels merged with the derived side winning. Dependencies are not
/// inherited. The extends pointer is cleared.
fn merge_extended(base: ServiceDef, derived: &ServiceDef) -> ServiceDef {
    let mut out = base;

    macro_rules! scalar {
        ($($field:ident),+ $(,)?) => {
            $(if derived.$field.is_some() {
                out.$field = derived.$field.clone();
            })+
        };
    }
    scalar!(
        image,
        build,
        command,
        entrypoint,
        container_name,
        working_dir,
        healthcheck,
        deploy,
        restart,
        cpus,
        mem_limit,
        tty,
        stdin_open,
        networks,
    );

    macro_rules! concat_list {
        ($($field:ident),+ $(,)?) => {
            $(if let Some(extra) = &derived.$field {
                let mut merged = out.$field.take().unwrap_or_default();
                merged.extend(extra.iter().cloned());
                out.$field = Some(merged);
            })+
        };
    }
    concat_list!(volumes, ports, profiles);

    if let Some(extra) = &derived.env_file {
        let mut merged = out.env_file.take().map(|f| f.to_vec()).unwrap_or_default();
        merged.extend(extra.to_vec());
        out.env_file = Some(super::file::StringOrList::Multiple(merged));
    }

    if let Some(derived_env) = &derived.environment {
        out.environment = Some(match out.environment.take() {
            Some(base_env) => super::merge::merge_environment_defs(base_env, derived_env.clone()),
            None => derived_env.clone(),
        });
    }
    if let Some(derived_labels) = &derived.labels {
        out.labels = Some(match out.labels.take() {
            Some(base_labels) => super::merge::merge_label_defs(base_labels, derived_labels.clone()),
            None => derived_labels.clone(),
        });
    }

    // dependencies never travel through extends
    out.depends_on = derived.depends_on.clone();
    out.extends = None;
    out
}

// ---------------------------------------------------------------------------
// Stage 2 + 3: profile and selection filters

fn filter_profiles(
    services: BTreeMap<String, ServiceDef>,
    active: &[String],
) -> BTreeMap<String, ServiceDef> {
    services
        .into_iter()
        .filter(|(_, def)| match &def.profiles {
            None => true,
            Some(profiles) if profiles.is_empty() => true,
            Some(profiles) => {
                !active.is_empty() && profiles.iter().any(|p| active.iter().any(|a| a == p))
            }
        })
        .collect()
}

fn filter_selection(
    services: BTreeMap<String, ServiceDef>,
    requested: &[String],
) -> BTreeMap<String, ServiceDef> {
    if requested.is_empty() {
        return services;
    }

    let mut pending: VecDeque<String> = VecDeque::new();
    for name in requested {
        if services.contains_key(name) {
            pending.push_back(name.clone());
        } else {
            warn!("requested service '{}' does not resolve; skipping", name);
        }
    }

    let mut keep: BTreeSet<String> = BTreeSet::new();
    while let Some(name) = pending.pop_front() {
        if !keep.insert(name.clone()) {
            continue;
        }
        if let Some(def) = services.get(&name) {
            if let Some(depends) = &def.depends_on {
                for dep in depends.service_names() {
                    if services.contains_key(&dep) {
                        pending.push_back(dep);
                    } else {
                        warn!("dependency '{}' of '{}' does not resolve; skipping", dep, name);
                    }
                }
            }
        }
    }

    services
        .into_iter()
        .filter(|(name, _)| keep.contains(name))
        .collect()
}

// ---------------------------------------------------------------------------
// Stage 4: normalization

fn normalize_service(name: &str, def: &ServiceDef, options: &ConvertOptions) -> Result<Service> {
    let mut environment: BTreeMap<String, String> = BTreeMap::new();
    if let Some(files) = &def.env_file {
        for spec in files.to_vec() {
            for (key, value) in read_env_file(&spec, &options.base_dir, &options.env)? {
                environment.insert(key, value);
            }
        }
    }
    if let Some(env) = &def.environment {
        environment.extend(env.to_map(&options.env));
    }

    let mut ports = Vec::new();
    if let Some(defs) = &def.ports {
        for entry in defs {
            ports.extend(parse_port_entry(&entry.to_string()).map_err(|e| {
                ConvoyError::InvalidArgument(format!("service '{}': {}", name, e))
            })?);
        }
    }

    let mut volumes = Vec::new();
    if let Some(defs) = &def.volumes {
        for entry in defs {
            volumes.push(normalize_volume(name, entry, options)?);
        }
    }

    let (depends_on, depends_on_healthy, depends_on_started, depends_on_completed) =
        normalize_depends_on(name, def.depends_on.as_ref())?;

    let health_check = match &def.healthcheck {
        Some(hc) => normalize_healthcheck(name, hc)?,
        None => None,
    };

    let networks = def
        .networks
        .as_ref()
        .map(|n| n.names())
        .filter(|names| !names.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_NETWORK.to_string()]);

    let (cpus, memory) = normalize_resources(name, def)?;

    Ok(Service {
        name: name.to_string(),
        image: def.image.clone(),
        build: def.build.as_ref().map(|b| normalize_build(b, options)),
        command: def.command.as_ref().map(Command::to_exec),
        entrypoint: def.entrypoint.as_ref().map(|e| match e {
            // entrypoint strings are a single argv entry, not a shell wrap;
            // `entrypoint: ''` is the clear-image-entrypoint sentinel
            Command::Shell(s) => vec![s.clone()],
            Command::Exec(argv) => argv.clone(),
        }),
        working_dir: def.working_dir.clone(),
        environment,
        ports,
        volumes,
        networks,
        depends_on,
        depends_on_healthy,
        depends_on_started,
        depends_on_completed,
        health_check,
        restart: def.restart.clone(),
        container_name: def.container_name.clone(),
        profiles: def.profiles.clone().unwrap_or_default(),
        labels: def.labels.as_ref().map(|l| l.to_map()).unwrap_or_default(),
        cpus,
        memory,
        tty: def.tty.unwrap_or(false),
        stdin_open: def.stdin_open.unwrap_or(false),
    })
}

fn normalize_build(def: &BuildDef, options: &ConvertOptions) -> BuildConfig {
    let (context, dockerfile, args, target) = match def {
        BuildDef::Simple(path) => (path.clone(), None, BTreeMap::new(), None),
        BuildDef::Full(full) => (
            full.context.clone().unwrap_or_else(|| ".".to_string()),
            full.dockerfile.clone(),
            full.args
                .as_ref()
                .map(|args| {
                    args.iter()
                        .map(|(k, v)| (k.clone(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            full.target.clone(),
        ),
    };

    let context_path = Path::new(&context);
    let context = if context_path.is_absolute() {
        context_path.to_path_buf()
    } else {
        options.base_dir.join(context_path)
    };

    BuildConfig {
        context,
        dockerfile,
        args,
        target,
    }
}

fn normalize_depends_on(
    service: &str,
    depends: Option<&DependsOn>,
) -> Result<(Vec<String>, Vec<String>, Vec<String>, Vec<String>)> {
    let mut plain = Vec::new();
    let mut healthy = Vec::new();
    let mut started = Vec::new();
    let mut completed = Vec::new();

    match depends {
        None => {}
        Some(DependsOn::List(names)) => plain.extend(names.iter().cloned()),
        Some(DependsOn::Map(map)) => {
            for (dep, entry) in map {
                let condition = entry
                    .as_ref()
                    .map(|e| e.condition.as_str())
                    .unwrap_or("service_started");
                match condition {
                    "service_started" => started.push(dep.clone()),
                    "service_healthy" => healthy.push(dep.clone()),
                    "service_completed_successfully" => completed.push(dep.clone()),
                    other => {
                        return Err(ConvoyError::InvalidArgument(format!(
                            "service '{}': unknown depends_on condition '{}' for '{}'",
                            service, other, dep
                        )));
                    }
                }
            }
        }
    }

    Ok((plain, healthy, started, completed))
}

fn normalize_healthcheck(service: &str, def: &HealthcheckDef) -> Result<Option<HealthCheck>> {
    let test = match &def.test {
        None => return Ok(None),
        Some(Command::Shell(s)) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
        Some(Command::Exec(argv)) => {
            if argv.first().map(String::as_str) == Some("NONE") {
                return Ok(None);
            }
            match argv.first().map(String::as_str) {
                Some("CMD-SHELL") => {
                    let cmd = argv.get(1).cloned().unwrap_or_default();
                    vec!["/bin/sh".to_string(), "-c".to_string(), cmd]
                }
                Some("CMD") => argv[1..].to_vec(),
                _ => argv.clone(),
            }
        }
    };

    let parse = |field: &str, value: &Option<String>| -> Result<Option<Duration>> {
        value
            .as_ref()
            .map(|v| {
                parse_duration(v).map_err(|e| {
                    ConvoyError::InvalidArgument(format!(
                        "service '{}': healthcheck {}: {}",
                        service, field, e
                    ))
                })
            })
            .transpose()
    };

    Ok(Some(HealthCheck {
        test,
        interval: parse("interval", &def.interval)?,
        timeout: parse("timeout", &def.timeout)?,
        retries: def.retries,
        start_period: parse("start_period", &def.start_period)?,
    }))
}

fn normalize_resources(service: &str, def: &ServiceDef) -> Result<(Option<f64>, Option<String>)> {
    let limits = def
        .deploy
        .as_ref()
        .and_then(|d| d.resources.as_ref())
        .and_then(|r| r.limits.as_ref());

    let cpus_raw = def
        .cpus
        .as_ref()
        .map(|c| c.to_string())
        .or_else(|| limits.and_then(|l| l.cpus.as_ref()).map(|c| c.to_string()));
    let cpus = cpus_raw
        .map(|raw| {
            raw.parse::<f64>().map_err(|_| {
                ConvoyError::InvalidArgument(format!(
                    "service '{}': invalid cpus value '{}'",
                    service, raw
                ))
            })
        })
        .transpose()?;

    let memory = def
        .mem_limit
        .as_ref()
        .map(|m| m.to_string())
        .or_else(|| limits.and_then(|l| l.memory.as_ref()).map(|m| m.to_string()));

    Ok((cpus, memory))
}

/// Parse a `<number><s|m|h>` duration.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .ok_or_else(|| format!("duration '{}' is missing a unit", s))?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("unknown duration unit '{}' in '{}'", unit, s)),
    };
    Ok(Duration::from_secs_f64(secs))
}

/// Parse one compose port entry into its discrete mappings.
///
/// Accepts `host:container`, `ip:host:container`, and the range form
/// `A-B:C-D`, each with an optional `/tcp` or `/udp` suffix.
pub fn parse_port_entry(entry: &str) -> Result<Vec<PortMapping>> {
    let (spec, protocol) = match entry.rsplit_once('/') {
        Some((spec, proto)) => {
            let protocol: Protocol = proto
                .parse()
                .map_err(|e: String| ConvoyError::InvalidArgument(format!("port '{}': {}", entry, e)))?;
            (spec, protocol)
        }
        None => (entry, Protocol::Tcp),
    };

    let parts: Vec<&str> = spec.split(':').collect();
    let (host_ip, host_part, container_part) = match parts.as_slice() {
        [host, container] => (None, *host, *container),
        [ip, host, container] => (Some(ip.to_string()), *host, *container),
        _ => {
            return Err(ConvoyError::InvalidArgument(format!(
                "port '{}' must be host:container or ip:host:container",
                entry
            )));
        }
    };

    let host_ports = parse_port_range(entry, host_part)?;
    let container_ports = parse_port_range(entry, container_part)?;
    if host_ports.len() != container_ports.len() {
        return Err(ConvoyError::InvalidArgument(format!(
            "port range '{}' maps {} host ports to {} container ports",
            entry,
            host_ports.len(),
            container_ports.len()
        )));
    }

    Ok(host_ports
        .into_iter()
        .zip(container_ports)
        .map(|(host_port, container_port)| PortMapping {
            host_ip: host_ip.clone(),
            host_port,
            container_port,
            protocol,
        })
        .collect())
}

fn parse_port_range(entry: &str, part: &str) -> Result<Vec<u16>> {
    let parse_one = |s: &str| -> Result<u16> {
        let port: u32 = s.parse().map_err(|_| {
            ConvoyError::InvalidArgument(format!("port '{}': '{}' is not a number", entry, s))
        })?;
        if !(1..=65535).contains(&port) {
            return Err(ConvoyError::InvalidArgument(format!(
                "port '{}': {} is outside 1-65535",
                entry, port
            )));
        }
        Ok(port as u16)
    };

    match part.split_once('-') {
        None => Ok(vec![parse_one(part)?]),
        Some((lo, hi)) => {
            let lo = parse_one(lo)?;
            let hi = parse_one(hi)?;
            if lo > hi {
                return Err(ConvoyError::InvalidArgument(format!(
                    "port '{}': range {}-{} is inverted",
                    entry, lo, hi
                )));
            }
            Ok((lo..=hi).collect())
        }
    }
}

fn normalize_volume(
    service: &str,
    def: &VolumeMountDef,
    options: &ConvertOptions,
) -> Result<VolumeMount> {
    match def {
        VolumeMountDef::Long(long) => {
            let kind = match long.mount_type.as_deref() {
                None | Some("volume") => MountKind::Volume,
                Some("bind") => MountKind::Bind,
                Some("tmpfs") => MountKind::Tmpfs,
                Some(other) => {
                    return Err(ConvoyError::InvalidArgument(format!(
                        "service '{}': unsupported mount type '{}'",
                        service, other
                    )));
                }
            };
            let source = match kind {
                MountKind::Bind => resolve_bind_source(
                    long.source.as_deref().unwrap_or_default(),
                    options,
                ),
                MountKind::Tmpfs => String::new(),
                MountKind::Volume => long.source.clone().unwrap_or_default(),
            };
            Ok(VolumeMount {
                source,
                target: long.target.clone(),
                read_only: long.read_only.unwrap_or(false),
                kind,
            })
        }
        VolumeMountDef::Short(spec) => parse_short_volume(service, spec, options),
    }
}

fn parse_short_volume(service: &str, spec: &str, options: &ConvertOptions) -> Result<VolumeMount> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        // bare container path: anonymous volume
        [target] => {
            if !target.starts_with('/') {
                return Err(ConvoyError::InvalidArgument(format!(
                    "service '{}': volume '{}' must be an absolute container path",
                    service, spec
                )));
            }
            Ok(VolumeMount {
                source: String::new(),
                target: target.to_string(),
                read_only: false,
                kind: MountKind::Volume,
            })
        }
        [source, target] | [source, target, _] => {
            let read_only = parts
                .get(2)
                .map(|opts| opts.split(',').any(|o| o == "ro"))
                .unwrap_or(false);
            if is_host_path(source) {
                Ok(VolumeMount {
                    source: resolve_bind_source(source, options),
                    target: target.to_string(),
                    read_only,
                    kind: MountKind::Bind,
                })
            } else {
                Ok(VolumeMount {
                    source: source.to_string(),
                    target: target.to_string(),
                    read_only,
                    kind: MountKind::Volume,
                })
            }
        }
        _ => Err(ConvoyError::InvalidArgument(format!(
            "service '{}': malformed volume '{}'",
            service, spec
        ))),
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/')
        || source.starts_with("./")
        || source.starts_with("../")
        || source.starts_with('~')
        || source == "."
        || source == ".."
}

fn resolve_bind_source(source: &str, options: &ConvertOptions) -> String {
    if let Some(rest) = source.strip_prefix("~/") {
        if let Some(home) = options.env.get("HOME") {
            return Path::new(home).join(rest).to_string_lossy().into_owned();
        }
    }
    if source == "~" {
        if let Some(home) = options.env.get("HOME") {
            return home.clone();
        }
    }
    let path = Path::new(source);
    if path.is_absolute() {
        source.to_string()
    } else {
        options
            .working_dir
            .join(path)
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::{ComposeParser, ParseOptions};

    fn parse(yaml: &str) -> ComposeFile {
        ComposeParser::parse_str(yaml, &ParseOptions::default()).unwrap()
    }

    fn options() -> ConvertOptions {
        ConvertOptions {
            project_name: Some("proj".to_string()),
            base_dir: PathBuf::from("/tmp/proj"),
            working_dir: PathBuf::from("/work"),
            ..Default::default()
        }
    }

    #[test]
    fn test_port_range_expansion() {
        let mappings = parse_port_entry("4510-4512:4510-4512/udp").unwrap();
        assert_eq!(mappings.len(), 3);
        for (i, mapping) in mappings.iter().enumerate() {
            assert_eq!(mapping.host_port, 4510 + i as u16);
            assert_eq!(mapping.container_port, 4510 + i as u16);
            assert_eq!(mapping.protocol, Protocol::Udp);
        }
    }

    #[test]
    fn test_port_range_mismatch_rejected() {
        assert!(parse_port_entry("4510-4512:4510-4511").is_err());
    }

    #[test]
    fn test_port_with_host_ip() {
        let mappings = parse_port_entry("127.0.0.1:8080:80").unwrap();
        assert_eq!(mappings[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(mappings[0].host_port, 8080);
        assert_eq!(mappings[0].container_port, 80);
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(parse_port_entry("0:80").is_err());
    }

    #[test]
    fn test_bare_path_is_anonymous_volume() {
        let file = parse("services:\n  app:\n    image: x\n    volumes: [\"/cache\"]\n");
        let project = convert(&file, &options()).unwrap();
        let mounts = &project.services.get("app").unwrap().volumes;
        assert_eq!(
            mounts[0],
            VolumeMount {
                source: String::new(),
                target: "/cache".to_string(),
                read_only: false,
                kind: MountKind::Volume,
            }
        );
    }

    #[test]
    fn test_relative_bind_source_absolutized() {
        let file = parse("services:\n  app:\n    image: x\n    volumes: [\"./data:/data:ro\"]\n");
        let project = convert(&file, &options()).unwrap();
        let mount = &project.services.get("app").unwrap().volumes[0];
        assert_eq!(mount.source, "/work/data");
        assert_eq!(mount.kind, MountKind::Bind);
        assert!(mount.read_only);
    }

    #[test]
    fn test_tilde_bind_source() {
        let file = parse("services:\n  app:\n    image: x\n    volumes: [\"~/src:/src\"]\n");
        let mut opts = options();
        opts.env.insert("HOME".to_string(), "/home/dev".to_string());
        let project = convert(&file, &opts).unwrap();
        assert_eq!(project.services.get("app").unwrap().volumes[0].source, "/home/dev/src");
    }

    #[test]
    fn test_named_volume_short_form() {
        let file = parse("services:\n  app:\n    image: x\n    volumes: [\"data:/var/lib/data\"]\n");
        let project = convert(&file, &options()).unwrap();
        let mount = &project.services.get("app").unwrap().volumes[0];
        assert_eq!(mount.kind, MountKind::Volume);
        assert_eq!(mount.source, "data");
    }

    #[test]
    fn test_long_form_tmpfs() {
        let yaml = r#"
services:
  app:
    image: x
    volumes:
      - type: tmpfs
        target: /scratch
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        let mount = &project.services.get("app").unwrap().volumes[0];
        assert_eq!(mount.kind, MountKind::Tmpfs);
        assert_eq!(mount.target, "/scratch");
    }

    #[test]
    fn test_healthcheck_none_clears() {
        let yaml = "services:\n  app:\n    image: x\n    healthcheck:\n      test: [\"NONE\"]\n";
        let project = convert(&parse(yaml), &options()).unwrap();
        assert!(project.services.get("app").unwrap().health_check.is_none());
    }

    #[test]
    fn test_healthcheck_cmd_shell() {
        let yaml = r#"
services:
  app:
    image: x
    healthcheck:
      test: ["CMD-SHELL", "curl -f http://localhost/"]
      interval: 10s
      retries: 3
      start_period: 1m
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        let hc = project.services.get("app").unwrap().health_check.as_ref().unwrap();
        assert_eq!(hc.test, vec!["/bin/sh", "-c", "curl -f http://localhost/"]);
        assert_eq!(hc.interval, Some(Duration::from_secs(10)));
        assert_eq!(hc.start_period, Some(Duration::from_secs(60)));
        assert_eq!(hc.retries, Some(3));
    }

    #[test]
    fn test_healthcheck_string_becomes_shell() {
        let yaml = "services:\n  app:\n    image: x\n    healthcheck:\n      test: curl localhost\n";
        let project = convert(&parse(yaml), &options()).unwrap();
        let hc = project.services.get("app").unwrap().health_check.as_ref().unwrap();
        assert_eq!(hc.test[..2], ["/bin/sh", "-c"]);
    }

    #[test]
    fn test_depends_on_conditions_routed() {
        let yaml = r#"
services:
  db:
    image: x
  cache:
    image: x
  done:
    image: x
  app:
    image: x
    depends_on:
      db:
        condition: service_healthy
      cache:
        condition: service_started
      done:
        condition: service_completed_successfully
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        let app = project.services.get("app").unwrap();
        assert_eq!(app.depends_on_healthy, vec!["db"]);
        assert_eq!(app.depends_on_started, vec!["cache"]);
        assert_eq!(app.depends_on_completed, vec!["done"]);
        assert!(app.depends_on.is_empty());
    }

    #[test]
    fn test_default_network_synthesized() {
        let file = parse("services:\n  app:\n    image: x\n");
        let project = convert(&file, &options()).unwrap();
        assert_eq!(project.services.get("app").unwrap().networks, vec!["default"]);
        let default = project.networks.get("default").unwrap();
        assert_eq!(default.driver, "bridge");
        assert!(!default.external);
    }

    #[test]
    fn test_declared_network_order_preserved() {
        let yaml = r#"
services:
  app:
    image: x
    networks:
      zebra: {}
      alpha: {}
networks:
  zebra: {}
  alpha: {}
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        assert_eq!(project.services.get("app").unwrap().networks, vec!["zebra", "alpha"]);
    }

    #[test]
    fn test_extends_merges_base() {
        let yaml = r#"
services:
  base:
    image: shared
    environment:
      COMMON: yes
      LEVEL: base
    volumes: ["/base"]
  derived:
    extends: base
    environment:
      LEVEL: derived
    volumes: ["/derived"]
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        let derived = project.services.get("derived").unwrap();
        assert_eq!(derived.image.as_deref(), Some("shared"));
        assert_eq!(derived.environment.get("COMMON").unwrap(), "yes");
        assert_eq!(derived.environment.get("LEVEL").unwrap(), "derived");
        let targets: Vec<&str> = derived.volumes.iter().map(|v| v.target.as_str()).collect();
        assert_eq!(targets, vec!["/base", "/derived"]);
    }

    #[test]
    fn test_extends_cycle_reports_path() {
        let yaml = r#"
services:
  a:
    image: x
    extends: b
  b:
    image: x
    extends: a
"#;
        let err = convert(&parse(yaml), &options()).unwrap_err().to_string();
        assert!(err.contains("extends"), "got: {err}");
        assert!(err.contains(" → "), "got: {err}");
    }

    #[test]
    fn test_extends_cross_file_rejected() {
        let yaml = r#"
services:
  a:
    image: x
    extends:
      service: b
      file: other.yaml
  b:
    image: x
"#;
        assert!(convert(&parse(yaml), &options()).is_err());
    }

    #[test]
    fn test_profiles_filter_default_set() {
        let yaml = r#"
services:
  always:
    image: x
  debug:
    image: x
    profiles: [debug]
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        assert!(project.services.contains_key("always"));
        assert!(!project.services.contains_key("debug"));
    }

    #[test]
    fn test_profiles_filter_active_set() {
        let yaml = r#"
services:
  always:
    image: x
  debug:
    image: x
    profiles: [debug]
  metrics:
    image: x
    profiles: [metrics]
"#;
        let mut opts = options();
        opts.profiles = vec!["debug".to_string()];
        let project = convert(&parse(yaml), &opts).unwrap();
        assert!(project.services.contains_key("always"));
        assert!(project.services.contains_key("debug"));
        assert!(!project.services.contains_key("metrics"));
    }

    #[test]
    fn test_selection_pulls_dependencies() {
        let yaml = r#"
services:
  db:
    image: x
  web:
    image: x
    depends_on: [db]
  other:
    image: x
"#;
        let mut opts = options();
        opts.services = vec!["web".to_string()];
        let project = convert(&parse(yaml), &opts).unwrap();
        assert!(project.services.contains_key("db"));
        assert!(project.services.contains_key("web"));
        assert!(!project.services.contains_key("other"));
    }

    #[test]
    fn test_project_name_from_directory() {
        let file = parse("services:\n  app:\n    image: x\n");
        let opts = ConvertOptions {
            base_dir: PathBuf::from("/srv/MyApp"),
            working_dir: PathBuf::from("/srv/MyApp"),
            ..Default::default()
        };
        let project = convert(&file, &opts).unwrap();
        assert_eq!(project.name, "myapp");
    }

    #[test]
    fn test_entrypoint_clear_sentinel() {
        let yaml = "services:\n  app:\n    image: x\n    entrypoint: ''\n";
        let project = convert(&parse(yaml), &options()).unwrap();
        let app = project.services.get("app").unwrap();
        assert_eq!(app.entrypoint.as_deref(), Some(&["".to_string()][..]));
    }

    #[test]
    fn test_resources_from_deploy_limits() {
        let yaml = r#"
services:
  app:
    image: x
    deploy:
      resources:
        limits:
          cpus: "1.5"
          memory: 256m
"#;
        let project = convert(&parse(yaml), &options()).unwrap();
        let app = project.services.get("app").unwrap();
        assert_eq!(app.cpus, Some(1.5));
        assert_eq!(app.memory.as_deref(), Some("256m"));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
