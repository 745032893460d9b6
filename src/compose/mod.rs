//! Compose pipeline
//!
//! Turns one or more compose files into a canonical [`Project`]:
//! interpolation and parsing ([`parser`]), multi-file merging ([`merge`]),
//! and conversion with `extends`, profiles, and normalization ([`convert`]).

pub mod convert;
pub mod env_file;
pub mod file;
pub mod interpolate;
pub mod merge;
pub mod parser;

pub use convert::{convert, ConvertOptions};
pub use file::ComposeFile;
pub use parser::{ComposeParser, ParseOptions, DEFAULT_COMPOSE_FILES};

use crate::error::{ConvoyError, Result};
use crate::project::Project;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

/// Options for the whole pipeline, compose files to project.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Compose files in order; discovered in the working directory when empty
    pub files: Vec<PathBuf>,
    /// Explicit project name
    pub project_name: Option<String>,
    /// Active profiles
    pub profiles: Vec<String>,
    /// Explicit service selection
    pub services: Vec<String>,
    /// `KEY=VAL` overrides layered on top of the process environment
    pub env_overrides: Vec<(String, String)>,
    /// Permit YAML anchors and merge keys
    pub allow_anchors: bool,
}

/// Run the full pipeline: discover/parse/merge/validate/convert.
pub fn load_project(options: &LoadOptions) -> Result<Project> {
    let working_dir = std::env::current_dir()?;

    let files = if options.files.is_empty() {
        let found = ComposeParser::find_compose_file(&working_dir).ok_or_else(|| {
            ConvoyError::NotFound(format!(
                "no compose file found in {}",
                working_dir.display()
            ))
        })?;
        vec![found]
    } else {
        options.files.clone()
    };

    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for (key, value) in &options.env_overrides {
        env.insert(key.clone(), value.clone());
    }

    let parse_options = ParseOptions {
        allow_anchors: options.allow_anchors,
    };
    let (merged, warnings) = ComposeParser::load_files(&files, &parse_options, &mut env)?;
    for warning in warnings {
        warn!("{}", warning);
    }

    let base_dir = files[0]
        .parent()
        .map(|p| {
            if p.as_os_str().is_empty() {
                working_dir.clone()
            } else {
                p.to_path_buf()
            }
        })
        .unwrap_or_else(|| working_dir.clone());

    convert(
        &merged,
        &ConvertOptions {
            project_name: options.project_name.clone(),
            profiles: options.profiles.clone(),
            services: options.services.clone(),
            base_dir,
            working_dir,
            env,
        },
    )
}
