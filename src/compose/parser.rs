//! Compose file parsing
//!
//! Loading a compose file is a three-step affair: the sibling `.env` file is
//! folded into the interpolation environment, the raw text is interpolated
//! and screened against the YAML security limits, and only then is the
//! document decoded. Each file of a multi-file project goes through all three
//! steps on its own; merging happens afterwards and only the merged document
//! is validated.

use super::env_file::load_dot_env;
use super::file::{ComposeFile, VolumeMountDef};
use super::interpolate::{interpolate, is_valid_env_name};
use super::merge::merge_files;
use crate::compose::convert::parse_port_entry;
use crate::error::{ConvoyError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names, probed in order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose versions that are known to this implementation
const KNOWN_VERSIONS: &[&str] = &[
    "2", "2.0", "2.1", "2.2", "2.3", "2.4", "3", "3.0", "3.1", "3.2", "3.3", "3.4", "3.5", "3.6",
    "3.7", "3.8", "3.9",
];

/// Maximum document size accepted by the parser
const MAX_DOCUMENT_BYTES: usize = 9 * 1024 * 1024;

/// Maximum leading-space indentation accepted by the parser
const MAX_INDENT_SPACES: usize = 40;

/// YAML tags that are always allowed
const SAFE_TAGS: &[&str] = &[
    "str", "int", "float", "bool", "null", "seq", "map", "binary", "timestamp",
];

/// Short-form volume options
const VOLUME_OPTIONS: &[&str] = &["ro", "rw", "z", "Z", "cached", "delegated"];

/// Parser options
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Permit YAML anchors and merge keys
    pub allow_anchors: bool,
}

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find a compose file in `dir` by its default names.
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Decode a compose document from already-interpolated text.
    pub fn parse_str(content: &str, options: &ParseOptions) -> Result<ComposeFile> {
        check_document_limits(content, options)?;
        serde_yaml::from_str(content).map_err(|e| ConvoyError::Yaml(e.to_string()))
    }

    /// Load a single compose file.
    ///
    /// The `.env` beside the file extends `env` (existing keys win), then the
    /// file text is interpolated against `env` and decoded.
    pub fn load_file(
        path: &Path,
        options: &ParseOptions,
        env: &mut BTreeMap<String, String>,
    ) -> Result<ComposeFile> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvoyError::NotFound(format!("compose file {}: {}", path.display(), e))
        })?;
        if let Some(dir) = path.parent() {
            load_dot_env(dir, env)?;
        }
        let interpolated = interpolate(&content, env)
            .map_err(|e| ConvoyError::InvalidArgument(format!("{}: {}", path.display(), e)))?;
        Self::parse_str(&interpolated, options).map_err(|e| match e {
            ConvoyError::InvalidArgument(msg) => {
                ConvoyError::InvalidArgument(format!("{}: {}", path.display(), msg))
            }
            ConvoyError::Yaml(msg) => ConvoyError::Yaml(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Load an ordered list of compose files, merge them, and validate the
    /// merged document. Returns the document together with any validation
    /// warnings.
    pub fn load_files(
        paths: &[PathBuf],
        options: &ParseOptions,
        env: &mut BTreeMap<String, String>,
    ) -> Result<(ComposeFile, Vec<String>)> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(Self::load_file(path, options, env)?);
        }
        let merged = merge_files(files);
        let warnings = Self::validate(&merged)?;
        Ok((merged, warnings))
    }

    /// Validate a merged compose document.
    pub fn validate(file: &ComposeFile) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if let Some(version) = &file.version {
            if !KNOWN_VERSIONS.contains(&version.as_str()) {
                warnings.push(format!("unsupported compose file version '{}'", version));
            }
        }

        if file.services.is_empty() {
            return Err(ConvoyError::InvalidArgument(
                "compose file defines no services".to_string(),
            ));
        }

        for (name, service) in &file.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(ConvoyError::InvalidArgument(format!(
                    "service '{}' must specify either 'image' or 'build'",
                    name
                )));
            }

            if let Some(env) = &service.environment {
                for key in env.to_map(&BTreeMap::new()).keys() {
                    if !is_valid_env_name(key) {
                        return Err(ConvoyError::InvalidArgument(format!(
                            "service '{}': invalid environment variable name '{}'",
                            name, key
                        )));
                    }
                }
            }

            if let Some(ports) = &service.ports {
                for port in ports {
                    parse_port_entry(&port.to_string()).map_err(|e| {
                        ConvoyError::InvalidArgument(format!("service '{}': {}", name, e))
                    })?;
                }
            }

            if let Some(volumes) = &service.volumes {
                for volume in volumes {
                    if let VolumeMountDef::Short(spec) = volume {
                        validate_short_volume(name, spec)?;
                    }
                }
            }

            if let Some(depends) = &service.depends_on {
                for dep in depends.service_names() {
                    if !file.services.contains_key(&dep) {
                        return Err(ConvoyError::NotFound(format!(
                            "service '{}' depends on unknown service '{}'",
                            name, dep
                        )));
                    }
                }
            }
        }

        detect_depends_on_cycle(file)?;

        Ok(warnings)
    }
}

fn check_document_limits(content: &str, options: &ParseOptions) -> Result<()> {
    if content.len() > MAX_DOCUMENT_BYTES {
        return Err(ConvoyError::InvalidArgument(format!(
            "compose document exceeds the {} byte limit",
            MAX_DOCUMENT_BYTES
        )));
    }

    for (line_no, line) in content.lines().enumerate() {
        let indent = line.len() - line.trim_start_matches(' ').len();
        if indent > MAX_INDENT_SPACES && !line.trim().is_empty() {
            return Err(ConvoyError::InvalidArgument(format!(
                "line {}: indentation deeper than {} spaces",
                line_no + 1,
                MAX_INDENT_SPACES
            )));
        }
    }

    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let tag_re = TAG_RE
        .get_or_init(|| Regex::new(r"(?:^|[\s\[{,])!{1,2}([A-Za-z0-9_:-]+)").expect("tag pattern"));
    for caps in tag_re.captures_iter(content) {
        let tag = caps[1].trim_start_matches("tag:yaml.org,2002:");
        if !SAFE_TAGS.contains(&tag) {
            return Err(ConvoyError::InvalidArgument(format!(
                "unsupported YAML tag '!{}'",
                &caps[1]
            )));
        }
    }

    if !options.allow_anchors {
        static ANCHOR_RE: OnceLock<Regex> = OnceLock::new();
        let anchor_re = ANCHOR_RE
            .get_or_init(|| Regex::new(r"(?:^|\s)&[A-Za-z0-9_][A-Za-z0-9_-]*").expect("anchor pattern"));
        if anchor_re.is_match(content) {
            return Err(ConvoyError::InvalidArgument(
                "YAML anchors are not allowed (enable with --allow-anchors)".to_string(),
            ));
        }
        static MERGE_RE: OnceLock<Regex> = OnceLock::new();
        let merge_re =
            MERGE_RE.get_or_init(|| Regex::new(r"(?m)^\s*<<\s*:").expect("merge key pattern"));
        if merge_re.is_match(content) {
            return Err(ConvoyError::InvalidArgument(
                "YAML merge keys are not allowed (enable with --allow-anchors)".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_short_volume(service: &str, spec: &str) -> Result<()> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.len() {
        1 => {
            if !parts[0].starts_with('/') {
                return Err(ConvoyError::InvalidArgument(format!(
                    "service '{}': volume '{}' must be 'source:target' or an absolute container path",
                    service, spec
                )));
            }
        }
        2 | 3 => {
            if parts[0].is_empty() || parts[1].is_empty() {
                return Err(ConvoyError::InvalidArgument(format!(
                    "service '{}': volume '{}' has an empty component",
                    service, spec
                )));
            }
            if parts.len() == 3 {
                for opt in parts[2].split(',') {
                    if !VOLUME_OPTIONS.contains(&opt) {
                        return Err(ConvoyError::InvalidArgument(format!(
                            "service '{}': unknown volume option '{}' in '{}'",
                            service, opt, spec
                        )));
                    }
                }
            }
        }
        _ => {
            return Err(ConvoyError::InvalidArgument(format!(
                "service '{}': malformed volume '{}'",
                service, spec
            )));
        }
    }
    Ok(())
}

/// DFS cycle detection over `depends_on` edges at the document level.
fn detect_depends_on_cycle(file: &ComposeFile) -> Result<()> {
    fn visit(
        file: &ComposeFile,
        name: &str,
        visited: &mut Vec<String>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        if stack.iter().any(|s| s == name) {
            let mut path: Vec<String> = stack
                .iter()
                .skip_while(|s| *s != name)
                .cloned()
                .collect();
            path.push(name.to_string());
            return Err(ConvoyError::InvalidArgument(format!(
                "circular dependency: {}",
                path.join(" → ")
            )));
        }
        if visited.iter().any(|s| s == name) {
            return Ok(());
        }
        stack.push(name.to_string());
        if let Some(service) = file.services.get(name) {
            if let Some(depends) = &service.depends_on {
                for dep in depends.service_names() {
                    visit(file, &dep, visited, stack)?;
                }
            }
        }
        stack.pop();
        visited.push(name.to_string());
        Ok(())
    }

    let mut visited = Vec::new();
    for name in file.services.keys() {
        let mut stack = Vec::new();
        visit(file, name, &mut visited, &mut stack)?;
    }
    Ok(())
}
