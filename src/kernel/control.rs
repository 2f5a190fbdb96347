//! Local kernel control endpoint.
//!
//! In-process request/reply, handled on MAIN:
//!
//! | request              | reply                          |
//! |----------------------|--------------------------------|
//! | `RESTART`            | `OK`                           |
//! | `RESET`              | `OK` or `KO, reason`           |
//! | `GET_NETCONFIG`      | `OK, blob` (binary codec)      |
//! | `SET_NETCONFIG blob` | `OK` or `KO, reason`           |
//! | `SCRIPTS_DIR`        | `OK, path`                     |
//! | `FACTORY_CONFIG_DIR` | `OK, path`                     |

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::Kernel;
use crate::config::codec::{self, ConfigFormat};
use crate::config::{ConfigError, ConfigTree};
use crate::message::Message;
use crate::remote::{KO, OK, UNKNOWN_MESSAGE};
use crate::scheduler::{Scheduler, TaskError};

/// Name of the factory kernel configuration inside the factory directory.
pub const FACTORY_CONFIG_FILE: &str = "kernel.toml";

/// Control request names.
pub mod requests {
    /// Restart the kernel.
    pub const RESTART: &str = "RESTART";
    /// Restore the factory configuration and restart.
    pub const RESET: &str = "RESET";
    /// Read the `[network]` section.
    pub const GET_NETCONFIG: &str = "GET_NETCONFIG";
    /// Replace the `[network]` section and persist it.
    pub const SET_NETCONFIG: &str = "SET_NETCONFIG";
    /// Path of the scripts directory.
    pub const SCRIPTS_DIR: &str = "SCRIPTS_DIR";
    /// Path of the factory configuration directory.
    pub const FACTORY_CONFIG_DIR: &str = "FACTORY_CONFIG_DIR";
}

/// Client side of the control endpoint.
#[derive(Clone, Debug)]
pub struct KernelControl {
    scheduler: Arc<Scheduler<Kernel>>,
}

impl KernelControl {
    /// Endpoint bound to `scheduler`'s MAIN queue.
    pub fn new(scheduler: Arc<Scheduler<Kernel>>) -> Self {
        Self { scheduler }
    }

    /// Send `request` and block until MAIN answers.
    ///
    /// # Errors
    ///
    /// Fails if the kernel is shut down or the call is made from MAIN.
    pub fn request(&self, request: Message) -> Result<Message, TaskError> {
        self.scheduler.call_main(move |k| k.handle_control(request))
    }

    /// [`KernelControl::request`] bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// As [`KernelControl::request`], plus a timeout failure.
    pub fn request_timeout(&self, request: Message, timeout: Duration) -> Result<Message, TaskError> {
        self.scheduler
            .call_main_timeout(timeout, move |k| k.handle_control(request))
    }
}

fn ko(reason: impl Into<Vec<u8>>) -> Message {
    Message::new().with(KO).with(reason)
}

impl Kernel {
    /// Handle one control request. Runs on MAIN.
    pub fn handle_control(&mut self, mut request: Message) -> Message {
        let Ok(name) = request.pop_string() else {
            return ko(UNKNOWN_MESSAGE);
        };
        match name.as_str() {
            requests::RESTART => {
                self.restart_later();
                Message::new().with(OK)
            }
            requests::RESET => match self.factory_reset() {
                Ok(()) => {
                    self.restart_later();
                    Message::new().with(OK)
                }
                Err(e) => {
                    error!(error = %e, "factory reset failed");
                    ko(e.to_string())
                }
            },
            requests::GET_NETCONFIG => {
                let network = self.store.kconfig().child("network").unwrap_or_default();
                match codec::encode(&network, ConfigFormat::Binary) {
                    Ok(blob) => Message::new().with(OK).with(blob),
                    Err(e) => ko(e.to_string()),
                }
            }
            requests::SET_NETCONFIG => {
                let Some(blob) = request.pop_front() else {
                    return ko(format!("Malformed message: {name}"));
                };
                match self.set_netconfig(&blob) {
                    Ok(()) => Message::new().with(OK),
                    Err(e) => {
                        warn!(error = %e, "failed to update network configuration");
                        ko(e.to_string())
                    }
                }
            }
            requests::SCRIPTS_DIR => Message::new()
                .with(OK)
                .with(self.paths.scripts_dir.display().to_string()),
            requests::FACTORY_CONFIG_DIR => Message::new()
                .with(OK)
                .with(self.paths.factory_config_dir.display().to_string()),
            _ => ko(UNKNOWN_MESSAGE),
        }
    }

    fn factory_reset(&self) -> Result<(), ConfigError> {
        let target = self.store.config_path().ok_or(ConfigError::NoBackingFile)?;
        let source = self.paths.factory_config_dir.join(FACTORY_CONFIG_FILE);
        info!(from = %source.display(), to = %target.display(), "restoring factory configuration");
        std::fs::copy(&source, target).map_err(|source_err| ConfigError::Io {
            path: source.clone(),
            source: source_err,
        })?;
        Ok(())
    }

    fn set_netconfig(&mut self, blob: &[u8]) -> Result<(), ConfigError> {
        let network: ConfigTree = codec::decode(blob, ConfigFormat::Binary)?;
        self.store.set_section("network", network);
        self.store.save()?;
        info!("network configuration updated");
        Ok(())
    }
}
