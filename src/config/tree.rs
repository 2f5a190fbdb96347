//! Canonical in-memory configuration tree.
//!
//! Kernel settings and every module sub-tree are held as a [`ConfigTree`], a
//! thin wrapper over a TOML table. Both wire codecs in [`super::codec`]
//! operate on this one representation.

use serde::de::DeserializeOwned;
use toml::{Table, Value};

use super::ConfigError;

/// A hierarchical configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree(Table);

impl ConfigTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a tree from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not a TOML document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        text.parse::<Table>()
            .map(Self)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render the tree as TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if a value cannot be represented.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(&self.0).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Borrow the underlying table.
    pub fn as_table(&self) -> &Table {
        &self.0
    }

    /// Consume the tree, returning the underlying table.
    pub fn into_table(self) -> Table {
        self.0
    }

    /// Top-level value lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Lookup through nested tables using a dotted path (`remote.port`).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current)
    }

    /// Top-level sub-table, cloned into its own tree.
    pub fn child(&self, key: &str) -> Option<ConfigTree> {
        self.0
            .get(key)
            .and_then(Value::as_table)
            .map(|t| ConfigTree(t.clone()))
    }

    /// Whether a top-level key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert or replace a top-level value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert or replace a top-level sub-table.
    pub fn insert_child(&mut self, key: impl Into<String>, child: ConfigTree) -> Option<Value> {
        self.0.insert(key.into(), Value::Table(child.0))
    }

    /// Remove a top-level key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Top-level keys in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Whether the tree has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value at a dotted path.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    /// Boolean value at a dotted path.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get_path(path).and_then(Value::as_bool)
    }

    /// Integer value at a dotted path.
    pub fn get_integer(&self, path: &str) -> Option<i64> {
        self.get_path(path).and_then(Value::as_integer)
    }

    /// Deserialize the whole tree into a typed settings struct.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the tree does not match `T`.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Value::Table(self.0.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))
    }

    /// Deserialize the value at a dotted path, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value does not match `T`.
    pub fn section<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ConfigError> {
        match self.get_path(path) {
            None => Ok(None),
            Some(value) => value
                .clone()
                .try_into()
                .map(Some)
                .map_err(|e: toml::de::Error| ConfigError::Invalid(format!("{path}: {e}"))),
        }
    }
}

impl From<Table> for ConfigTree {
    fn from(table: Table) -> Self {
        Self(table)
    }
}

impl From<ConfigTree> for Value {
    fn from(tree: ConfigTree) -> Self {
        Value::Table(tree.0)
    }
}
