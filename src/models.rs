// src/models.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// --- REPOSITORY ACTIONS ---

/// One of the fixed repository actions.
///
/// The declaration order of the variants is the execution order: a target always
/// runs `fetch`, then `clean`, then `install`, then `build`, filtered to the
/// actions requested on the command line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Fetch,
    Clean,
    Install,
    Build,
}

impl ActionKind {
    /// Every action, in execution order.
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Fetch,
        ActionKind::Clean,
        ActionKind::Install,
        ActionKind::Build,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Fetch => "fetch",
            ActionKind::Clean => "clean",
            ActionKind::Install => "install",
            ActionKind::Build => "build",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single conditional script snippet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConditionalFragment {
    /// Literal script text appended to the composed script.
    pub value: String,
    /// Boolean expression gating the fragment. Absent or blank means "always".
    #[serde(default)]
    pub condition: Option<String>,
}

/// The fragments configured for one action of a repository.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionFragments {
    #[serde(default)]
    pub commands: Vec<ConditionalFragment>,
}

/// A scalar usable as an expression variable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum VarValue {
    Number(f64),
    Text(String),
}

/// The detailed form of a repository entry.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub path: String,
    #[serde(default)]
    pub vars: BTreeMap<String, VarValue>,
    #[serde(default)]
    pub actions: BTreeMap<ActionKind, ActionFragments>,
}

/// A repository entry: either a bare path or a detailed table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RepositoryEntry {
    Path(String),
    Detailed(RepositoryConfig),
}

impl RepositoryEntry {
    pub fn into_config(self) -> RepositoryConfig {
        match self {
            RepositoryEntry::Path(path) => RepositoryConfig {
                path,
                ..Default::default()
            },
            RepositoryEntry::Detailed(config) => config,
        }
    }
}

/// The `repositories` section accepts a plain list of paths or a named map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Repositories {
    List(Vec<String>),
    Map(BTreeMap<String, RepositoryEntry>),
}

impl Default for Repositories {
    fn default() -> Self {
        Repositories::Map(BTreeMap::new())
    }
}

// --- SERVER MODELS ---

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfig {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub source: String,
    pub target: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationAction {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationConfig {
    /// Optional display name. The map key is used when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
    #[serde(default)]
    pub actions: BTreeMap<String, ApplicationAction>,
}

/// A reference from a profile to an application action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    /// Only `application` tasks exist today.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Application name.
    pub name: String,
    pub action: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileConfig {
    #[serde(default)]
    pub tasks: Vec<TaskRef>,
    /// Route names served by this profile. Empty means all routes.
    #[serde(default)]
    pub routes: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationConfig>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl: SslConfig::default(),
            routes: BTreeMap::new(),
            applications: BTreeMap::new(),
            profiles: BTreeMap::new(),
        }
    }
}

// --- `titan.yaml` MODEL ---

/// Tool versions installed through the version manager before anything runs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Versions {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub pnpm: Option<String>,
}

/// The deserialized configuration document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TitanConfig {
    #[serde(default)]
    pub versions: Versions,
    /// Directory that relative repository paths are resolved against.
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub repositories: Repositories,
    #[serde(default)]
    pub server: ServerConfig,
}

// --- RESOLVED MODELS (What the engines consume) ---

/// A repository target with its path resolved and its actions normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub path: PathBuf,
    pub vars: BTreeMap<String, VarValue>,
    pub actions: BTreeMap<ActionKind, Vec<ConditionalFragment>>,
}

impl Target {
    pub fn fragments(&self, kind: ActionKind) -> Option<&[ConditionalFragment]> {
        self.actions.get(&kind).map(Vec::as_slice)
    }
}

/// A background application resolved from the `server.applications` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub path: PathBuf,
    pub actions: BTreeMap<String, ApplicationAction>,
}
