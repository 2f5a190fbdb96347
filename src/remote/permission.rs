//! Per-client command permissions.
//!
//! Built once from `[remote.security]` and never mutated afterwards; share
//! it with `Arc`. Without a security section every client may run every
//! command, which is logged loudly at startup.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{info, warn};

use super::transport::decode_key;
use crate::config::{ConfigError, SecuritySettings};

/// Permissions of one client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionEntry {
    /// Whether commands are allowed unless listed in `exceptions`.
    pub default_allow: bool,
    /// Denied commands when `default_allow`, allowed ones otherwise.
    pub exceptions: HashSet<String>,
}

impl PermissionEntry {
    /// Whether this entry permits `command`.
    pub fn allows(&self, command: &str) -> bool {
        self.default_allow != self.exceptions.contains(command)
    }
}

/// Permission table keyed by client public key (canonical base64).
#[derive(Debug, Clone, Default)]
pub struct RemoteControlSecurity {
    table: Option<HashMap<String, PermissionEntry>>,
}

impl RemoteControlSecurity {
    /// A table that allows everything to everyone.
    pub fn open() -> Self {
        Self { table: None }
    }

    /// Build the table from the optional `[remote.security]` section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a key is not a base64 32-byte key
    /// or appears twice.
    pub fn from_settings(settings: Option<&SecuritySettings>) -> Result<Self, ConfigError> {
        let Some(settings) = settings else {
            warn!("no [remote.security] section: every client may run every remote command");
            return Ok(Self::open());
        };

        let mut table = HashMap::with_capacity(settings.permission.len());
        for perm in &settings.permission {
            let key = decode_key(&perm.pubkey).map_err(|e| {
                ConfigError::Invalid(format!("remote permission key {:?}: {e}", perm.pubkey))
            })?;
            let pubkey = STANDARD.encode(key);
            let entry = PermissionEntry {
                default_allow: perm.default,
                exceptions: perm.exceptions.iter().cloned().collect(),
            };
            if table.insert(pubkey, entry).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate remote permission for key {}",
                    perm.pubkey.trim()
                )));
            }
        }
        info!(clients = table.len(), "remote permission table loaded");
        Ok(Self { table: Some(table) })
    }

    /// Add or replace one entry.
    #[must_use]
    pub fn with_entry(mut self, pubkey: impl Into<String>, entry: PermissionEntry) -> Self {
        self.table
            .get_or_insert_with(HashMap::new)
            .insert(pubkey.into(), entry);
        self
    }

    /// Whether no security section was configured.
    pub fn is_open(&self) -> bool {
        self.table.is_none()
    }

    /// Whether client `pubkey` may run `command`.
    ///
    /// A key without an entry is denied.
    pub fn allow_request(&self, pubkey: &str, command: &str) -> bool {
        let Some(table) = &self.table else {
            return true;
        };
        match table.get(pubkey) {
            Some(entry) => entry.allows(command),
            None => {
                warn!(client = %pubkey, command = %command, "remote client has no permission entry");
                false
            }
        }
    }
}
