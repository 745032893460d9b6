//! Compose file configuration types
//!
//! These structs mirror the YAML shape of a compose document. Fields that the
//! format allows in two shapes (list or map, string or list) are decoded with
//! untagged enums and canonicalized later by the converter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A parsed compose document, prior to merging and conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Declared compose file version (advisory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Top-level project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDef>,
    /// Top-level networks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkDef>,
    /// Top-level volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeDef>,
    /// Unknown top-level keys are preserved silently
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Service definition as written in the compose file.
///
/// Unknown per-service keys fail decoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMountDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<ServiceNetworks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<NumberOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<NumberOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<ExtendsDef>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildDef {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildDefFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildDefFull {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, NumberOrString>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Command configuration (shell string or exec array)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl Command {
    /// Canonical argv form. A shell string becomes `/bin/sh -c <s>`.
    pub fn to_exec(&self) -> Vec<String> {
        match self {
            Command::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            Command::Exec(argv) => argv.clone(),
        }
    }
}

/// Environment configuration (list of `KEY=value` or map)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// Array of KEY=value strings
    List(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

impl Environment {
    /// Canonical map form. Map keys with a null value fall back to the
    /// ambient environment, then the empty string.
    pub fn to_map(&self, ambient: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match self {
            Environment::List(items) => {
                for item in items {
                    match item.split_once('=') {
                        Some((k, v)) => {
                            out.insert(k.to_string(), v.to_string());
                        }
                        None => {
                            let v = ambient.get(item).cloned().unwrap_or_default();
                            out.insert(item.clone(), v);
                        }
                    }
                }
            }
            Environment::Map(map) => {
                for (k, v) in map {
                    let value = match v {
                        Some(v) => yaml_scalar_to_string(v),
                        None => ambient.get(k).cloned().unwrap_or_default(),
                    };
                    out.insert(k.clone(), value);
                }
            }
        }
        out
    }
}

/// Labels (list of `key=value` or map)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Labels {
    /// Array of "key=value" strings
    List(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, NumberOrString>),
}

impl Labels {
    /// Canonical map form. List entries without `=` map to an empty value.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match self {
            Labels::List(items) => {
                for item in items {
                    match item.split_once('=') {
                        Some((k, v)) => out.insert(k.to_string(), v.to_string()),
                        None => out.insert(item.clone(), String::new()),
                    };
                }
            }
            Labels::Map(map) => {
                for (k, v) in map {
                    out.insert(k.clone(), v.to_string());
                }
            }
        }
        out
    }
}

/// String or list of strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrList {
    /// Canonical list form.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s.clone()],
            StringOrList::Multiple(v) => v.clone(),
        }
    }
}

/// Scalar that the YAML may carry as a number, bool, or string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl std::fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Bool(b) => write!(f, "{}", b),
            NumberOrString::Int(n) => write!(f, "{}", n),
            NumberOrString::Float(n) => write!(f, "{}", n),
            NumberOrString::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Port entry, kept as written (validated and expanded by the converter)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortDef {
    Str(String),
    Num(i64),
}

impl std::fmt::Display for PortDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortDef::Str(s) => write!(f, "{}", s),
            PortDef::Num(n) => write!(f, "{}", n),
        }
    }
}

/// Volume mount (short string or long form)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMountDef {
    /// Short syntax: "source:target:opt" or a bare container path
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (bind, volume, tmpfs)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Service-level network attachments (list or map)
///
/// The map form is kept as a YAML mapping so the declared order survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(serde_yaml::Mapping),
}

impl ServiceNetworks {
    /// Network names in declared order.
    pub fn names(&self) -> Vec<String> {
        match self {
            ServiceNetworks::List(v) => v.clone(),
            ServiceNetworks::Map(m) => m
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
        }
    }
}

/// Service dependencies (list or condition map)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, Option<DependsOnEntry>>),
}

impl DependsOn {
    /// All referenced service names, regardless of condition.
    pub fn service_names(&self) -> Vec<String> {
        match self {
            DependsOn::List(v) => v.clone(),
            DependsOn::Map(m) => m.keys().cloned().collect(),
        }
    }
}

/// Dependency entry in map form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnEntry {
    /// Readiness condition for the dependency
    #[serde(default = "default_condition")]
    pub condition: String,
}

fn default_condition() -> String {
    "service_started".to_string()
}

/// Healthcheck definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
}

/// Deploy block; only resource limits are honored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<DeployResources>,
}

/// Deploy resources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimitsDef>,
}

/// Resource limits inside a deploy block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimitsDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<NumberOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<NumberOrString>,
}

/// Service inheritance pointer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtendsDef {
    /// Base service name in the current file
    Service(String),
    /// Full form
    Full(ExtendsFull),
}

impl ExtendsDef {
    /// The base service name.
    pub fn service(&self) -> &str {
        match self {
            ExtendsDef::Service(s) => s,
            ExtendsDef::Full(f) => &f.service,
        }
    }

    /// The optional external file, which is not supported.
    pub fn file(&self) -> Option<&str> {
        match self {
            ExtendsDef::Service(_) => None,
            ExtendsDef::Full(f) => f.file.as_deref(),
        }
    }
}

/// Full extends form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendsFull {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Top-level network definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Top-level volume definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// External resource marker (bool or `{name}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum External {
    Bool(bool),
    Named { name: String },
}

impl External {
    /// Whether the resource is externally managed.
    pub fn is_external(&self) -> bool {
        match self {
            External::Bool(b) => *b,
            External::Named { .. } => true,
        }
    }

    /// The external name, when one was given.
    pub fn name(&self) -> Option<&str> {
        match self {
            External::Bool(_) => None,
            External::Named { name } => Some(name),
        }
    }
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_list_to_map() {
        let env = Environment::List(vec!["A=1".to_string(), "B=two".to_string()]);
        let map = env.to_map(&BTreeMap::new());
        assert_eq!(map.get("A").unwrap(), "1");
        assert_eq!(map.get("B").unwrap(), "two");
    }

    #[test]
    fn test_environment_map_null_falls_back_to_ambient() {
        let mut inner = BTreeMap::new();
        inner.insert("HOME_DIR".to_string(), None);
        let env = Environment::Map(inner);

        let mut ambient = BTreeMap::new();
        ambient.insert("HOME_DIR".to_string(), "/home/u".to_string());

        let map = env.to_map(&ambient);
        assert_eq!(map.get("HOME_DIR").unwrap(), "/home/u");
    }

    #[test]
    fn test_labels_list_split_on_equals() {
        let labels = Labels::List(vec!["a=b".to_string(), "bare".to_string()]);
        let map = labels.to_map();
        assert_eq!(map.get("a").unwrap(), "b");
        assert_eq!(map.get("bare").unwrap(), "");
    }

    #[test]
    fn test_command_shell_to_exec() {
        let cmd = Command::Shell("echo hi".to_string());
        assert_eq!(cmd.to_exec(), vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_depends_on_variants() {
        let yaml = r#"
services:
  a:
    image: busybox
    depends_on:
      - b
  b:
    image: busybox
    depends_on:
      c:
        condition: service_healthy
  c:
    image: busybox
"#;
        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        let a = file.services.get("a").unwrap();
        assert_eq!(a.depends_on.as_ref().unwrap().service_names(), vec!["b"]);
        let b = file.services.get("b").unwrap();
        match b.depends_on.as_ref().unwrap() {
            DependsOn::Map(m) => {
                let entry = m.get("c").unwrap().as_ref().unwrap();
                assert_eq!(entry.condition, "service_healthy");
            }
            DependsOn::List(_) => panic!("expected map form"),
        }
    }

    #[test]
    fn test_unknown_service_key_rejected() {
        let yaml = r#"
services:
  a:
    image: busybox
    no_such_key: true
"#;
        let result: std::result::Result<ComposeFile, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_top_level_key_preserved() {
        let yaml = r#"
services:
  a:
    image: busybox
x-custom:
  anything: goes
"#;
        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        assert!(file.extra.contains_key("x-custom"));
    }

    #[test]
    fn test_external_forms() {
        let ext: External = serde_yaml::from_str("true").unwrap();
        assert!(ext.is_external());
        assert!(ext.name().is_none());

        let ext: External = serde_yaml::from_str("name: shared-net").unwrap();
        assert!(ext.is_external());
        assert_eq!(ext.name().unwrap(), "shared-net");
    }
}
