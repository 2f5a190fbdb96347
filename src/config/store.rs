//! Kernel configuration store.
//!
//! Holds the kernel settings, one sub-tree per module and the version
//! counter. Mutated only on the MAIN thread; module threads read it through
//! [`crate::kernel::CoreApi`].

use std::path::{Path, PathBuf};

use toml::Value;
use tracing::{debug, info};

use super::{ConfigError, ConfigTree, LogSettings, ModuleEntry, RemoteSettings};

/// Top-level keys that make up the general configuration.
pub const GENERAL_CONFIG_KEYS: &[&str] = &[
    "remote",
    "plugin_directories",
    "log",
    "network",
    "autosave",
    "sync_dest",
    "no_import",
    "instance_name",
];

/// Keys that never leave the unit.
pub const NEVER_EXPORTED: &[&str] = &["no_import", "instance_name"];

/// Instance name used when the configuration does not set one.
pub const DEFAULT_INSTANCE_NAME: &str = "leosac";

/// Kernel settings, module sub-trees and version counter.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    kconfig: ConfigTree,
    modules: Vec<(String, ConfigTree)>,
    version: u64,
    config_path: Option<PathBuf>,
}

impl ConfigStore {
    /// Create an empty store with no backing file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid
    /// configuration document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut store = Self::from_document(ConfigTree::parse(&text)?)?;
        store.config_path = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            version = store.version,
            modules = store.modules.len(),
            "configuration loaded"
        );
        Ok(store)
    }

    /// Split a full configuration document into kernel settings and module
    /// sub-trees.
    ///
    /// # Errors
    ///
    /// Returns an error on a negative version, a malformed `[[modules]]`
    /// entry or a duplicated module name.
    pub fn from_document(mut doc: ConfigTree) -> Result<Self, ConfigError> {
        let version = match doc.remove("version") {
            None => 0,
            Some(Value::Integer(v)) => u64::try_from(v)
                .map_err(|_| ConfigError::Invalid(format!("version {v} is negative")))?,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "version must be an integer, got {}",
                    other.type_str()
                )))
            }
        };

        let mut store = Self {
            kconfig: ConfigTree::new(),
            modules: Vec::new(),
            version,
            config_path: None,
        };

        match doc.remove("modules") {
            None => {}
            Some(Value::Array(entries)) => {
                for entry in entries {
                    let Value::Table(table) = entry else {
                        return Err(ConfigError::Invalid(
                            "each [[modules]] entry must be a table".to_owned(),
                        ));
                    };
                    let tree = ConfigTree::from(table);
                    let parsed: ModuleEntry = tree.deserialize_into()?;
                    if store.has_config(&parsed.name) {
                        return Err(ConfigError::DuplicateModule(parsed.name));
                    }
                    store.modules.push((parsed.name, tree));
                }
            }
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "modules must be an array of tables".to_owned(),
                ))
            }
        }

        store.kconfig = doc;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Module sub-trees
    // -----------------------------------------------------------------------

    /// Store a module's configuration entry, replacing any previous one.
    ///
    /// Returns `true` when an existing entry was replaced.
    pub fn store_config(&mut self, name: &str, config: ConfigTree) -> bool {
        if let Some(slot) = self.modules.iter_mut().find(|(n, _)| n == name) {
            slot.1 = config;
            return true;
        }
        self.modules.push((name.to_owned(), config));
        false
    }

    /// A module's stored configuration entry.
    pub fn load_config(&self, name: &str) -> Option<&ConfigTree> {
        self.modules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tree)| tree)
    }

    /// Whether a configuration entry exists for `name`.
    pub fn has_config(&self, name: &str) -> bool {
        self.load_config(name).is_some()
    }

    /// Drop a module's configuration entry.
    pub fn remove_config(&mut self, name: &str) -> Option<ConfigTree> {
        let index = self.modules.iter().position(|(n, _)| n == name)?;
        Some(self.modules.remove(index).1)
    }

    /// Names of every module with stored configuration, in storage order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|(n, _)| n.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Kernel settings
    // -----------------------------------------------------------------------

    /// The kernel settings, without modules or version.
    pub fn kconfig(&self) -> &ConfigTree {
        &self.kconfig
    }

    /// Replace one top-level kernel section.
    pub fn set_section(&mut self, key: &str, value: impl Into<Value>) {
        self.kconfig.insert(key, value);
    }

    /// General settings: the allow-listed top-level keys plus the live
    /// version.
    pub fn get_general_config(&self) -> ConfigTree {
        let mut general = ConfigTree::new();
        for key in GENERAL_CONFIG_KEYS {
            if let Some(value) = self.kconfig.get(key) {
                general.insert(*key, value.clone());
            }
        }
        general.insert("version", version_value(self.version));
        general
    }

    /// The part of the general settings allowed to leave the unit.
    ///
    /// Without a `[sync_source]` table everything but `no_import` and
    /// `instance_name` is exported. With one, only keys set to `true` are.
    /// The version is always included so peers can gate imports on it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotExportable`] if `[sync_source]` marks a
    /// local-only key as exportable.
    pub fn get_exportable_general_config(&self) -> Result<ConfigTree, ConfigError> {
        let mut general = self.get_general_config();

        let Some(policy) = self.kconfig.child("sync_source") else {
            for key in NEVER_EXPORTED {
                general.remove(key);
            }
            return Ok(general);
        };

        let mut exported = ConfigTree::new();
        for key in policy.keys() {
            if policy.get_bool(key) != Some(true) {
                continue;
            }
            if NEVER_EXPORTED.contains(&key) {
                return Err(ConfigError::NotExportable(key.to_owned()));
            }
            if let Some(value) = general.get(key) {
                exported.insert(key, value.clone());
            }
        }
        if let Some(version) = general.remove("version") {
            exported.insert("version", version);
        }
        Ok(exported)
    }

    /// Apply a general configuration received from a peer.
    ///
    /// Without a local `[sync_dest]` table the kernel settings are replaced
    /// wholesale, keeping the local `no_import` list. With one, only keys
    /// set to `true` are copied from `incoming`. The version counter is
    /// never taken from `incoming`.
    pub fn set_kconfig(&mut self, incoming: &ConfigTree) {
        let mut incoming = incoming.clone();
        incoming.remove("version");

        match self.kconfig.child("sync_dest") {
            None => {
                let no_import = self.kconfig.get("no_import").cloned();
                self.kconfig = incoming;
                match no_import {
                    Some(list) => {
                        self.kconfig.insert("no_import", list);
                    }
                    None => {
                        self.kconfig.remove("no_import");
                    }
                }
                debug!("kernel configuration replaced");
            }
            Some(policy) => {
                for key in policy.keys() {
                    if policy.get_bool(key) != Some(true) {
                        continue;
                    }
                    if let Some(value) = incoming.get(key) {
                        debug!(key = %key, "importing kernel setting");
                        self.kconfig.insert(key, value.clone());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Version counter
    // -----------------------------------------------------------------------

    /// Current version.
    pub fn config_version(&self) -> u64 {
        self.version
    }

    /// Move the version forward to `version`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::VersionRegression`] if `version` is lower than
    /// the current one.
    pub fn set_config_version(&mut self, version: u64) -> Result<(), ConfigError> {
        if version < self.version {
            return Err(ConfigError::VersionRegression {
                current: self.version,
                requested: version,
            });
        }
        self.version = version;
        Ok(())
    }

    /// Increment the version, returning the new value.
    pub fn bump_version(&mut self) -> u64 {
        self.version = self.version.saturating_add(1);
        self.version
    }

    // -----------------------------------------------------------------------
    // Import policy and typed settings
    // -----------------------------------------------------------------------

    /// Modules listed in `no_import`.
    pub fn non_importable_modules(&self) -> Vec<String> {
        string_list(self.kconfig.get("no_import"))
    }

    /// Whether a peer may overwrite this module's configuration.
    pub fn is_module_importable(&self, name: &str) -> bool {
        !self.non_importable_modules().iter().any(|n| n == name)
    }

    /// Configured instance name.
    pub fn instance_name(&self) -> String {
        self.kconfig
            .get_str("instance_name")
            .unwrap_or(DEFAULT_INSTANCE_NAME)
            .to_owned()
    }

    /// Whether dangling object references are fatal.
    pub fn strict_mode(&self) -> bool {
        self.kconfig.get_bool("strict").unwrap_or(false)
    }

    /// Whether to persist the configuration on clean shutdown.
    pub fn autosave(&self) -> bool {
        self.kconfig.get_bool("autosave").unwrap_or(false)
    }

    /// Module search directories, in lookup order.
    pub fn plugin_directories(&self) -> Vec<PathBuf> {
        string_list(self.kconfig.get("plugin_directories"))
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    /// Parsed `[remote]` section, if present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the section is malformed.
    pub fn remote_settings(&self) -> Result<Option<RemoteSettings>, ConfigError> {
        self.kconfig.section("remote")
    }

    /// Parsed `[log]` section, defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the section is malformed.
    pub fn log_settings(&self) -> Result<LogSettings, ConfigError> {
        Ok(self.kconfig.section("log")?.unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// File the configuration was loaded from.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Set the file [`ConfigStore::save`] writes to.
    pub fn set_config_path(&mut self, path: impl Into<PathBuf>) {
        self.config_path = Some(path.into());
    }

    /// Compose the full document: kernel settings, version and modules.
    pub fn application_config(&self) -> ConfigTree {
        let mut doc = self.kconfig.clone();
        doc.insert("version", version_value(self.version));
        let modules: Vec<Value> = self
            .modules
            .iter()
            .map(|(_, tree)| Value::from(tree.clone()))
            .collect();
        if !modules.is_empty() {
            doc.insert("modules", Value::Array(modules));
        }
        doc
    }

    /// Write the composed document to the backing file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoBackingFile`] when no path is known, or an
    /// I/O or serialization error.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.config_path.as_deref().ok_or(ConfigError::NoBackingFile)?;
        let text = self.application_config().to_toml()?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), version = self.version, "configuration saved");
        Ok(())
    }
}

fn version_value(version: u64) -> Value {
    Value::Integer(i64::try_from(version).unwrap_or(i64::MAX))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
