//! Applying a fetched peer configuration to the local unit.
//!
//! Runs on MAIN. The store is snapshotted first; any failure restores the
//! snapshot and restarts the previous module set, so a failed sync never
//! leaves a mix of old and new modules behind.
//!
//! Additional files travel with module configurations and are written where
//! the peer says. The peer named by `SYNC_FROM` is therefore trusted
//! with writes anywhere the local process can write. Paths must be absolute
//! and free of `..` components; anything else fails the sync before any
//! local state changes.

use std::path::{Component, Path};

use tracing::{debug, error, info};

use super::{RemoteConfig, SyncError, SyncOptions};
use crate::config::{ConfigChecker, ConfigStore};
use crate::modules::{ModuleSupervisor, StopMode};

/// What a successful sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The kernel settings changed; the unit must restart.
    pub restart_required: bool,
    /// Modules whose configuration was taken from the peer.
    pub imported: Vec<String>,
    /// Modules whose local configuration was kept.
    pub kept: Vec<String>,
    /// Local modules dropped because the peer does not run them.
    pub removed: Vec<String>,
    /// Configuration version after the sync.
    pub version: u64,
}

/// Replace the local configuration with `remote`, honoring the import
/// policy, and restart the modules.
///
/// # Errors
///
/// Returns the first failure after rolling back. If the rollback itself
/// fails, [`SyncError::RollbackFailed`] carries both causes.
pub fn apply(
    store: &mut ConfigStore,
    supervisor: &mut ModuleSupervisor,
    checker: &ConfigChecker,
    remote: &RemoteConfig,
    options: &SyncOptions,
) -> Result<SyncReport, SyncError> {
    let backup = store.clone();
    match apply_unchecked(store, supervisor, checker, &backup, remote, options) {
        Ok(report) => {
            info!(
                version = report.version,
                imported = report.imported.len(),
                kept = report.kept.len(),
                removed = report.removed.len(),
                restart = report.restart_required,
                "configuration synchronized"
            );
            Ok(report)
        }
        Err(cause) => {
            error!(error = %cause, "sync failed, restoring previous configuration");
            *store = backup;
            match restart_modules(store, supervisor, checker) {
                Ok(()) => Err(cause),
                Err(rollback) => Err(SyncError::RollbackFailed {
                    cause: cause.to_string(),
                    rollback: rollback.to_string(),
                }),
            }
        }
    }
}

fn apply_unchecked(
    store: &mut ConfigStore,
    supervisor: &mut ModuleSupervisor,
    checker: &ConfigChecker,
    backup: &ConfigStore,
    remote: &RemoteConfig,
    options: &SyncOptions,
) -> Result<SyncReport, SyncError> {
    for name in remote.modules() {
        for (path, _) in remote.additional_files(name) {
            check_file_path(path)?;
        }
    }

    let mut report = SyncReport::default();
    checker.clear();

    if options.sync_general_config {
        info!("importing general configuration");
        store.set_kconfig(remote.general_config());
        report.restart_required = true;
    }

    supervisor.stop_modules(StopMode::Hard);

    for name in backup.module_names() {
        if store.is_module_importable(&name) && !remote.has_module(&name) {
            debug!(module = %name, "peer does not run module, dropping it");
            store.remove_config(&name);
            report.removed.push(name);
        }
    }

    for name in remote.modules() {
        if store.is_module_importable(name) {
            let entry = remote
                .module_config(name)
                .ok_or_else(|| SyncError::Incomplete(name.clone()))?;
            info!(module = %name, "importing module configuration");
            store.store_config(name, entry.clone());
            for (path, content) in remote.additional_files(name) {
                write_additional_file(path, content)?;
            }
            report.imported.push(name.clone());
        } else if let Some(local) = backup.load_config(name) {
            debug!(module = %name, "module is not importable, keeping local configuration");
            store.store_config(name, local.clone());
            report.kept.push(name.clone());
        }
    }

    for name in backup.non_importable_modules() {
        if let Some(local) = backup.load_config(&name) {
            if !report.kept.contains(&name) {
                debug!(module = %name, "restoring non-importable module");
                store.store_config(&name, local.clone());
                report.kept.push(name);
            }
        }
    }

    supervisor.load_modules(store)?;
    store.set_config_version(remote.version())?;
    report.version = store.config_version();
    supervisor.init_modules()?;

    if options.autocommit {
        info!("saving configuration after synchronization");
        store.save()?;
    }
    Ok(report)
}

fn restart_modules(
    store: &ConfigStore,
    supervisor: &mut ModuleSupervisor,
    checker: &ConfigChecker,
) -> Result<(), SyncError> {
    supervisor.stop_modules(StopMode::Hard);
    checker.clear();
    supervisor.load_modules(store)?;
    supervisor.init_modules()?;
    Ok(())
}

fn check_file_path(path: &str) -> Result<(), SyncError> {
    let candidate = Path::new(path);
    if !candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SyncError::UnsafePath(path.to_owned()));
    }
    Ok(())
}

fn write_additional_file(path: &str, content: &str) -> Result<(), SyncError> {
    let path = Path::new(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| SyncError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, content).map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "additional configuration file written");
    Ok(())
}
