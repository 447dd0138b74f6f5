//! # Config Loader
//!
//! Reads `titan.yaml` (or a `.toml` equivalent) into [`TitanConfig`] and resolves
//! the parts the engines consume: repository [`Target`]s, background
//! [`Application`]s, the selected profile and the routes it serves.
//!
//! Everything here runs before any unit is launched, so every error is fatal to
//! the command being executed.

use crate::{
    core::paths::{self, PathError},
    models::{
        Application, ProfileConfig, Repositories, RouteConfig, ServerConfig, SslConfig, Target,
        TitanConfig,
    },
};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML file at '{path}': {source}")]
    YamlParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to parse TOML file at '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration path '{0}' is not a file.")]
    NotAFile(PathBuf),
    #[error("No configuration file found. Looked in: {}", display_paths(.0))]
    NotFound(Vec<PathBuf>),
    #[error("Repository name '{name}' is used more than once (paths '{first}' and '{second}').")]
    DuplicateTarget {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Repository path '{0}' has no usable final segment to name it by.")]
    UnnamedTarget(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Profile '{name}' not found. Available profiles: {available}")]
    UnknownProfile { name: String, available: String },
    #[error("Profile '{profile}' references unknown route '{route}'.")]
    UnknownRoute { profile: String, route: String },
    #[error("Route '{name}' has an invalid target '{target}': {reason}")]
    InvalidRouteTarget {
        name: String,
        target: String,
        reason: String,
    },
    #[error("HTTPS listener requires both 'server.ssl.cert' and 'server.ssl.key' to be set.")]
    MissingTlsMaterial,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The on-disk syntax of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// TOML when the extension is `.toml`, YAML otherwise.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

// --- LOCATING AND PARSING ---

/// Picks the configuration file to load.
///
/// An explicitly requested path must be a file. Without one, `./titan.yaml` is
/// tried first and `<config_dir>/titan/titan.yaml` second.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        let path = paths::expand_path(&path.to_string_lossy())?;
        if path.is_file() {
            return Ok(path);
        }
        return Err(ConfigError::NotAFile(path));
    }

    let mut tried = vec![PathBuf::from(crate::constants::DEFAULT_CONFIG_FILENAME)];
    match paths::default_config_path() {
        Ok(fallback) => tried.push(fallback),
        Err(e) => log::debug!("No fallback configuration location: {}", e),
    }

    for candidate in &tried {
        if candidate.is_file() {
            log::debug!("Using configuration file '{}'", candidate.display());
            return Ok(candidate.clone());
        }
    }
    Err(ConfigError::NotFound(tried))
}

/// Reads and parses the configuration file at `path`.
pub fn load(path: &Path) -> Result<TitanConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&content, ConfigFormat::from_path(path), path)
}

/// Parses configuration text. `origin` is only used in error messages.
pub fn parse_str(
    content: &str,
    format: ConfigFormat,
    origin: &Path,
) -> Result<TitanConfig, ConfigError> {
    match format {
        ConfigFormat::Yaml => {
            // An empty document is a valid, empty configuration.
            if content.trim().is_empty() {
                return Ok(TitanConfig::default());
            }
            serde_yaml::from_str(content).map_err(|source| ConfigError::YamlParse {
                path: origin.to_path_buf(),
                source,
            })
        }
        ConfigFormat::Toml => toml::from_str(content).map_err(|source| ConfigError::TomlParse {
            path: origin.to_path_buf(),
            source,
        }),
    }
}

// --- RESOLUTION ---

fn base_path(config: &TitanConfig) -> Result<Option<PathBuf>, ConfigError> {
    config
        .base_path
        .as_deref()
        .map(paths::expand_path)
        .transpose()
        .map_err(ConfigError::from)
}

/// Resolves the `repositories` section into targets.
///
/// List-form entries are named after their last path segment; two entries that
/// end up with the same name are rejected.
pub fn resolve_targets(config: &TitanConfig) -> Result<Vec<Target>, ConfigError> {
    let base = base_path(config)?;
    let base = base.as_deref();

    match &config.repositories {
        Repositories::List(raw_paths) => {
            let mut targets: Vec<Target> = Vec::with_capacity(raw_paths.len());
            for raw in raw_paths {
                let path = paths::resolve_under(base, raw)?;
                let name = paths::last_segment(&path)
                    .ok_or_else(|| ConfigError::UnnamedTarget(raw.clone()))?;
                if let Some(existing) = targets.iter().find(|t| t.name == name) {
                    return Err(ConfigError::DuplicateTarget {
                        name,
                        first: existing.path.clone(),
                        second: path,
                    });
                }
                targets.push(Target {
                    name,
                    path,
                    vars: BTreeMap::new(),
                    actions: BTreeMap::new(),
                });
            }
            Ok(targets)
        }
        Repositories::Map(entries) => entries
            .iter()
            .map(|(name, entry)| {
                let repo = entry.clone().into_config();
                Ok(Target {
                    name: name.clone(),
                    path: paths::resolve_under(base, &repo.path)?,
                    vars: repo.vars,
                    actions: repo
                        .actions
                        .into_iter()
                        .map(|(kind, fragments)| (kind, fragments.commands))
                        .collect(),
                })
            })
            .collect(),
    }
}

/// Resolves `server.applications`, keyed by the name tasks refer to them by.
pub fn resolve_applications(
    config: &TitanConfig,
) -> Result<BTreeMap<String, Application>, ConfigError> {
    let base = base_path(config)?;
    config
        .server
        .applications
        .iter()
        .map(|(key, app)| {
            let application = Application {
                name: app.name.clone().unwrap_or_else(|| key.clone()),
                path: paths::resolve_under(base.as_deref(), &app.path)?,
                actions: app.actions.clone(),
            };
            Ok((key.clone(), application))
        })
        .collect()
}

pub fn select_profile<'a>(
    server: &'a ServerConfig,
    name: &str,
) -> Result<&'a ProfileConfig, ConfigError> {
    server
        .profiles
        .get(name)
        .ok_or_else(|| ConfigError::UnknownProfile {
            name: name.to_string(),
            available: if server.profiles.is_empty() {
                "(none)".to_string()
            } else {
                server.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
            },
        })
}

/// The routes served for a profile: all configured routes when the profile does
/// not list any, otherwise exactly the listed ones.
pub fn select_routes(
    server: &ServerConfig,
    profile_name: &str,
    profile: &ProfileConfig,
) -> Result<BTreeMap<String, RouteConfig>, ConfigError> {
    if profile.routes.is_empty() {
        return Ok(server.routes.clone());
    }

    let mut seen = HashSet::new();
    let mut selected = BTreeMap::new();
    for route in &profile.routes {
        if !seen.insert(route.as_str()) {
            continue;
        }
        let config = server
            .routes
            .get(route)
            .ok_or_else(|| ConfigError::UnknownRoute {
                profile: profile_name.to_string(),
                route: route.clone(),
            })?;
        selected.insert(route.clone(), config.clone());
    }
    Ok(selected)
}

/// Expands the certificate and key paths of the HTTPS listener.
///
/// # Errors
/// [`ConfigError::MissingTlsMaterial`] when either path is empty.
pub fn tls_material(ssl: &SslConfig) -> Result<(PathBuf, PathBuf), ConfigError> {
    let cert = ssl.cert.trim();
    let key = ssl.key.trim();
    if cert.is_empty() || key.is_empty() {
        return Err(ConfigError::MissingTlsMaterial);
    }
    Ok((paths::expand_path(cert)?, paths::expand_path(key)?))
}
