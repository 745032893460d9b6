//! Multi-file compose merging
//!
//! An ordered list of compose files collapses into one document, later files
//! overriding earlier ones. Scalars override wholesale; environment and
//! labels merge per key with the override winning; list-shaped fields
//! (ports, volumes, networks, depends_on, profiles, env_file) are replaced
//! entirely by the override.

use super::file::{ComposeFile, Environment, Labels, NumberOrString, ServiceDef};
use std::collections::BTreeMap;

/// Merge an ordered list of compose files into one.
pub fn merge_files(files: Vec<ComposeFile>) -> ComposeFile {
    let mut iter = files.into_iter();
    let mut merged = iter.next().unwrap_or_default();
    for overlay in iter {
        merge_file(&mut merged, overlay);
    }
    merged
}

fn merge_file(base: &mut ComposeFile, overlay: ComposeFile) {
    if overlay.version.is_some() {
        base.version = overlay.version;
    }
    if overlay.name.is_some() {
        base.name = overlay.name;
    }

    for (name, service) in overlay.services {
        match base.services.get_mut(&name) {
            Some(existing) => merge_service(existing, service),
            None => {
                base.services.insert(name, service);
            }
        }
    }

    for (name, network) in overlay.networks {
        base.networks.insert(name, network);
    }
    for (name, volume) in overlay.volumes {
        base.volumes.insert(name, volume);
    }
    for (key, value) in overlay.extra {
        base.extra.insert(key, value);
    }
}

fn merge_service(base: &mut ServiceDef, overlay: ServiceDef) {
    macro_rules! override_field {
        ($($field:ident),+ $(,)?) => {
            $(if overlay.$field.is_some() {
                base.$field = overlay.$field;
            })+
        };
    }

    override_field!(
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
        extends,
    );

    // replaced entirely by the override
    override_field!(env_file, ports, volumes, networks, depends_on, profiles);

    if let Some(overlay_env) = overlay.environment {
        base.environment = Some(match base.environment.take() {
            Some(base_env) => merge_environment_defs(base_env, overlay_env),
            None => overlay_env,
        });
    }

    if let Some(overlay_labels) = overlay.labels {
        base.labels = Some(match base.labels.take() {
            Some(base_labels) => merge_label_defs(base_labels, overlay_labels),
            None => overlay_labels,
        });
    }
}

/// Merge two environment blocks, the overlay winning per key.
pub(crate) fn merge_environment_defs(base: Environment, overlay: Environment) -> Environment {
    let mut merged = env_to_sparse_map(base);
    merged.extend(env_to_sparse_map(overlay));
    Environment::Map(merged)
}

fn env_to_sparse_map(env: Environment) -> BTreeMap<String, Option<serde_yaml::Value>> {
    match env {
        Environment::Map(map) => map,
        Environment::List(items) => items
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(serde_yaml::Value::String(v.to_string()))),
                None => (item, None),
            })
            .collect(),
    }
}

/// Merge two label blocks, the overlay winning per key.
pub(crate) fn merge_label_defs(base: Labels, overlay: Labels) -> Labels {
    let mut merged: BTreeMap<String, NumberOrString> = base
        .to_map()
        .into_iter()
        .map(|(k, v)| (k, NumberOrString::Str(v)))
        .collect();
    for (k, v) in overlay.to_map() {
        merged.insert(k, NumberOrString::Str(v));
    }
    Labels::Map(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ComposeFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_scalar_override_wins() {
        let base = parse("services:\n  app:\n    image: old\n    restart: always\n");
        let overlay = parse("services:\n  app:\n    image: new\n");

        let merged = merge_files(vec![base, overlay]);
        let app = merged.services.get("app").unwrap();
        assert_eq!(app.image.as_deref(), Some("new"));
        assert_eq!(app.restart.as_deref(), Some("always"));
    }

    #[test]
    fn test_environment_merges_per_key() {
        let base = parse("services:\n  app:\n    image: a\n    environment:\n      A: 1\n      B: 2\n");
        let overlay = parse("services:\n  app:\n    environment:\n      B: 9\n      C: 3\n");

        let merged = merge_files(vec![base, overlay]);
        let env = merged
            .services
            .get("app")
            .unwrap()
            .environment
            .as_ref()
            .unwrap()
            .to_map(&BTreeMap::new());
        assert_eq!(env.get("A").unwrap(), "1");
        assert_eq!(env.get("B").unwrap(), "9");
        assert_eq!(env.get("C").unwrap(), "3");
    }

    #[test]
    fn test_ports_replaced_entirely() {
        let base = parse("services:\n  app:\n    image: a\n    ports: [\"80:80\", \"443:443\"]\n");
        let overlay = parse("services:\n  app:\n    ports: [\"8080:80\"]\n");

        let merged = merge_files(vec![base, overlay]);
        let ports = merged.services.get("app").unwrap().ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].to_string(), "8080:80");
    }

    #[test]
    fn test_profiles_replaced_entirely() {
        let base = parse("services:\n  app:\n    image: a\n    profiles: [dev, test]\n");
        let overlay = parse("services:\n  app:\n    profiles: [prod]\n");

        let merged = merge_files(vec![base, overlay]);
        let profiles = merged.services.get("app").unwrap().profiles.as_ref().unwrap();
        assert_eq!(profiles, &vec!["prod".to_string()]);
    }

    #[test]
    fn test_override_only_service_added() {
        let base = parse("services:\n  app:\n    image: a\n");
        let overlay = parse("services:\n  worker:\n    image: w\n");

        let merged = merge_files(vec![base, overlay]);
        assert_eq!(merged.services.len(), 2);
    }

    #[test]
    fn test_labels_merge_per_key() {
        let base = parse("services:\n  app:\n    image: a\n    labels:\n      keep: base\n      shared: base\n");
        let overlay = parse("services:\n  app:\n    labels:\n      shared: override\n");

        let merged = merge_files(vec![base, overlay]);
        let labels = merged.services.get("app").unwrap().labels.as_ref().unwrap().to_map();
        assert_eq!(labels.get("keep").unwrap(), "base");
        assert_eq!(labels.get("shared").unwrap(), "override");
    }

    #[test]
    fn test_top_level_networks_merge() {
        let base = parse("services:\n  app:\n    image: a\nnetworks:\n  front: {}\n");
        let overlay = parse("services:\n  app:\n    image: a\nnetworks:\n  back: {}\n");

        let merged = merge_files(vec![base, overlay]);
        assert!(merged.networks.contains_key("front"));
        assert!(merged.networks.contains_key("back"));
    }
}
