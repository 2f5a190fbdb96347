//! Binary and text encodings of a [`ConfigTree`].
//!
//! The binary form is `bincode` over [`Node`], a tagged mirror of the TOML
//! value model (TOML values are not self-describing enough for a
//! non-self-describing format). The text form is plain TOML.

use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use super::{ConfigError, ConfigTree};

/// Wire selector for configuration payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// Compact `bincode` encoding.
    Binary,
    /// Human-readable TOML.
    Text,
}

impl ConfigFormat {
    /// Decode the one-byte wire selector (`0` binary, `1` text).
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Binary),
            1 => Some(Self::Text),
            _ => None,
        }
    }

    /// Encode as the one-byte wire selector.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::Text => 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Node {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Datetime(String),
    Array(Vec<Node>),
    Table(Vec<(String, Node)>),
}

impl From<&Value> for Node {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Node::String(s.clone()),
            Value::Integer(i) => Node::Integer(*i),
            Value::Float(f) => Node::Float(*f),
            Value::Boolean(b) => Node::Boolean(*b),
            Value::Datetime(d) => Node::Datetime(d.to_string()),
            Value::Array(items) => Node::Array(items.iter().map(Node::from).collect()),
            Value::Table(table) => Node::Table(table_nodes(table)),
        }
    }
}

fn table_nodes(table: &Table) -> Vec<(String, Node)> {
    table
        .iter()
        .map(|(k, v)| (k.clone(), Node::from(v)))
        .collect()
}

fn node_value(node: Node) -> Result<Value, ConfigError> {
    Ok(match node {
        Node::String(s) => Value::String(s),
        Node::Integer(i) => Value::Integer(i),
        Node::Float(f) => Value::Float(f),
        Node::Boolean(b) => Value::Boolean(b),
        Node::Datetime(d) => Value::Datetime(
            d.parse()
                .map_err(|e| ConfigError::Parse(format!("datetime {d:?}: {e}")))?,
        ),
        Node::Array(items) => Value::Array(
            items
                .into_iter()
                .map(node_value)
                .collect::<Result<_, _>>()?,
        ),
        Node::Table(entries) => Value::Table(nodes_table(entries)?),
    })
}

fn nodes_table(entries: Vec<(String, Node)>) -> Result<Table, ConfigError> {
    let mut table = Table::new();
    for (key, node) in entries {
        table.insert(key, node_value(node)?);
    }
    Ok(table)
}

// ----------------------------------------------------------------------------
// Nesting guard
// ----------------------------------------------------------------------------

/// Deepest value nesting accepted from a binary payload.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Walks the `bincode` layout of `Vec<(String, Node)>` without building it,
/// so that deserialization never recurses past [`MAX_NESTING_DEPTH`].
struct DepthScan<'a> {
    rest: &'a [u8],
}

impl<'a> DepthScan<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ConfigError> {
        if self.rest.len() < len {
            return Err(ConfigError::Parse("truncated binary config".to_owned()));
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, ConfigError> {
        let bytes = <[u8; 4]>::try_from(self.take(4)?)
            .map_err(|_| ConfigError::Parse("truncated binary config".to_owned()))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn len(&mut self) -> Result<usize, ConfigError> {
        let bytes = <[u8; 8]>::try_from(self.take(8)?)
            .map_err(|_| ConfigError::Parse("truncated binary config".to_owned()))?;
        usize::try_from(u64::from_le_bytes(bytes))
            .map_err(|_| ConfigError::Parse("binary config length overflow".to_owned()))
    }

    fn string(&mut self) -> Result<(), ConfigError> {
        let len = self.len()?;
        self.take(len).map(|_| ())
    }

    fn entries(&mut self, depth: usize) -> Result<(), ConfigError> {
        for _ in 0..self.len()? {
            self.string()?;
            self.node(depth)?;
        }
        Ok(())
    }

    fn node(&mut self, depth: usize) -> Result<(), ConfigError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ConfigError::Parse(format!(
                "binary config nested deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        let next = depth.saturating_add(1);
        match self.u32()? {
            0 | 4 => self.string(),
            1 | 2 => self.take(8).map(|_| ()),
            3 => self.take(1).map(|_| ()),
            5 => {
                for _ in 0..self.len()? {
                    self.node(next)?;
                }
                Ok(())
            }
            6 => self.entries(next),
            tag => Err(ConfigError::Parse(format!("unknown binary config tag {tag}"))),
        }
    }
}

fn check_nesting(bytes: &[u8]) -> Result<(), ConfigError> {
    DepthScan { rest: bytes }.entries(1)
}

/// Serialize a tree in the requested format.
///
/// # Errors
///
/// Returns [`ConfigError::Serialize`] if encoding fails.
pub fn encode(tree: &ConfigTree, format: ConfigFormat) -> Result<Vec<u8>, ConfigError> {
    match format {
        ConfigFormat::Binary => bincode::serialize(&table_nodes(tree.as_table()))
            .map_err(|e| ConfigError::Serialize(e.to_string())),
        ConfigFormat::Text => tree.to_toml().map(String::into_bytes),
    }
}

/// Parse a tree previously produced by [`encode`].
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the payload is malformed or a binary
/// payload nests deeper than [`MAX_NESTING_DEPTH`].
pub fn decode(bytes: &[u8], format: ConfigFormat) -> Result<ConfigTree, ConfigError> {
    match format {
        ConfigFormat::Binary => {
            check_nesting(bytes)?;
            let entries: Vec<(String, Node)> =
                bincode::deserialize(bytes).map_err(|e| ConfigError::Parse(e.to_string()))?;
            nodes_table(entries).map(ConfigTree::from)
        }
        ConfigFormat::Text => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| ConfigError::Parse("text config is not UTF-8".to_owned()))?;
            ConfigTree::parse(text)
        }
    }
}
