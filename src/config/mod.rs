//! Versioned configuration.
//!
//! - [`tree`]: the canonical in-memory document ([`ConfigTree`])
//! - [`codec`]: binary and text encodings of a tree
//! - [`store`]: kernel settings, per-module sub-trees, version counter and
//!   the import/export policy used by replication
//! - [`checker`]: registry of named hardware objects declared by modules
//!
//! The startup file is TOML:
//!
//! ```toml
//! instance_name = "front-door"
//! version = 3
//! plugin_directories = ["/usr/lib/leosac"]
//! autosave = true
//! no_import = ["WIEGAND_READER"]
//!
//! [log]
//! level = "debug"
//!
//! [remote]
//! port = 12345
//! secret_key = "<base64>"
//! public_key = "<base64>"
//!
//! [[remote.security.permission]]
//! pubkey = "<base64>"
//! default = false
//! exceptions = ["MODULE_LIST"]
//!
//! [[modules]]
//! name = "MONITOR"
//! file = "libmonitor.so"
//! level = 10
//! [modules.module_config]
//! topics = ["KERNEL"]
//! ```

pub mod checker;
pub mod codec;
pub mod store;
pub mod tree;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use checker::{ConfigChecker, ObjectType};
pub use codec::ConfigFormat;
pub use store::ConfigStore;
pub use tree::ConfigTree;

/// Default factory configuration directory.
pub const DEFAULT_FACTORY_CONFIG_DIR: &str = "/usr/share/leosac/factory_config";

/// Default directory holding helper scripts.
pub const DEFAULT_SCRIPTS_DIR: &str = "/usr/share/leosac/scripts";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing a configuration file failed.
    #[error("config I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A payload could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A tree could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(String),

    /// A value has the wrong shape.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// A required key is absent.
    #[error("missing required config key `{0}`")]
    MissingKey(String),

    /// Two `[[modules]]` entries share a name.
    #[error("module `{0}` is configured more than once")]
    DuplicateModule(String),

    /// A hardware object name was registered twice.
    #[error("object `{0}` is already registered")]
    DuplicateObject(String),

    /// A referenced hardware object does not exist.
    #[error("object `{name}` of type {object_type} does not exist")]
    MissingObject {
        /// Referenced name.
        name: String,
        /// Expected type.
        object_type: ObjectType,
    },

    /// The export policy tries to export a key that never leaves the unit.
    #[error("`{0}` cannot be marked exportable")]
    NotExportable(String),

    /// An attempt to move the version counter backwards.
    #[error("config version cannot go from {current} to {requested}")]
    VersionRegression {
        /// Current version.
        current: u64,
        /// Rejected version.
        requested: u64,
    },

    /// The store has no backing file to persist to.
    #[error("configuration has no backing file")]
    NoBackingFile,

    /// A shared lock was poisoned by a panicking thread.
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

// ---------------------------------------------------------------------------
// Typed views of kernel sections
// ---------------------------------------------------------------------------

/// `[remote]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteSettings {
    /// TCP port of the remote control endpoint.
    pub port: u16,
    /// Server static secret key (base64).
    pub secret_key: String,
    /// Server static public key (base64).
    pub public_key: String,
    /// Optional permission table. Absent means open access.
    #[serde(default)]
    pub security: Option<SecuritySettings>,
}

/// `[remote.security]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecuritySettings {
    /// One entry per authorized client key.
    #[serde(default)]
    pub permission: Vec<PermissionSettings>,
}

/// One `[[remote.security.permission]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermissionSettings {
    /// Client public key (base64).
    pub pubkey: String,
    /// Whether commands are allowed unless listed in `exceptions`.
    #[serde(default)]
    pub default: bool,
    /// Commands that invert the default.
    #[serde(default)]
    pub exceptions: Vec<String>,
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for JSON log files. Console only when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

/// One `[[modules]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Unique module name.
    pub name: String,
    /// Backing file, resolved against the plugin directories.
    pub file: String,
    /// Start order, lower first.
    #[serde(default = "default_module_level")]
    pub level: i64,
    /// Module-specific settings.
    #[serde(default)]
    pub module_config: toml::Table,
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Level assigned to modules that do not declare one.
pub const DEFAULT_MODULE_LEVEL: i64 = 100;

fn default_module_level() -> i64 {
    DEFAULT_MODULE_LEVEL
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Filesystem locations that may be overridden from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Directory holding the factory kernel configuration.
    pub factory_config_dir: PathBuf,
    /// Directory holding helper scripts.
    pub scripts_dir: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self {
            factory_config_dir: PathBuf::from(DEFAULT_FACTORY_CONFIG_DIR),
            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
        }
    }
}

impl RuntimePaths {
    /// Resolve from `LEOSAC_FACTORY_CONFIG_DIR` / `LEOSAC_SCRIPTS_DIR`.
    pub fn from_env() -> Self {
        Self::from_resolver(|key| std::env::var(key).ok())
    }

    /// Resolve using a custom env resolver (for testing).
    pub fn from_resolver(env: impl Fn(&str) -> Option<String>) -> Self {
        let mut paths = Self::default();
        if let Some(dir) = env("LEOSAC_FACTORY_CONFIG_DIR").filter(|s| !s.is_empty()) {
            paths.factory_config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env("LEOSAC_SCRIPTS_DIR").filter(|s| !s.is_empty()) {
            paths.scripts_dir = PathBuf::from(dir);
        }
        paths
    }
}
