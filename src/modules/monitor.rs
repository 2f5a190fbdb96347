//! `MONITOR`: logs bus traffic.
//!
//! ```toml
//! [[modules]]
//! name = "MONITOR"
//! file = "libmonitor.so"
//! [modules.module_config]
//! topics = ["KERNEL", "S_"]
//! [[modules.module_config.objects]]
//! name = "lobby_led"
//! type = "led"
//! [[modules.module_config.references]]
//! name = "lobby_gpio"
//! type = "gpio"
//! ```
//!
//! `objects` are registered in the object-existence checker at start;
//! `references` are verified against it (fatal only in strict mode).

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use super::{ConfigDump, Module, ModuleContext, ModuleError, ModuleFactory, StopMode};
use crate::bus::Subscriber;
use crate::config::{ConfigTree, ObjectType};

/// Backing file name the monitor is registered under.
pub const MODULE_FILE: &str = "libmonitor.so";

/// Name the monitor reports for itself.
pub const MODULE_NAME: &str = "MONITOR";

#[derive(Debug, Deserialize)]
struct MonitorSettings {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    objects: Vec<ObjectDecl>,
    #[serde(default)]
    references: Vec<ObjectDecl>,
}

#[derive(Debug, Deserialize)]
struct ObjectDecl {
    name: String,
    #[serde(rename = "type")]
    object_type: ObjectType,
}

/// Factory for [`Monitor`].
#[derive(Debug, Default)]
pub struct MonitorFactory;

impl ModuleFactory for MonitorFactory {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn start(&self, ctx: ModuleContext) -> Result<Box<dyn Module>, ModuleError> {
        let settings: MonitorSettings = ctx.config.deserialize_into()?;
        let checker = &ctx.shared.checker;

        for object in &settings.objects {
            checker.register_object(&object.name, object.object_type)?;
        }
        for reference in &settings.references {
            checker.check_reference(&reference.name, reference.object_type, ctx.shared.strict)?;
        }

        let subscriber = if settings.topics.is_empty() {
            None
        } else {
            Some(ctx.shared.bus.subscribe(&settings.topics))
        };
        info!(module = %ctx.name, topics = ?settings.topics, "monitor started");

        Ok(Box::new(Monitor {
            name: ctx.name,
            config: ctx.config,
            subscriber,
            seen: 0,
        }))
    }
}

/// Running monitor instance.
pub struct Monitor {
    name: String,
    config: ConfigTree,
    subscriber: Option<Subscriber>,
    seen: u64,
}

impl Module for Monitor {
    fn poll(&mut self, timeout: Duration) -> Result<(), ModuleError> {
        let Some(subscriber) = self.subscriber.as_mut() else {
            std::thread::sleep(timeout);
            return Ok(());
        };
        if let Some(msg) = subscriber.recv_timeout(timeout) {
            self.seen = self.seen.saturating_add(1);
            let frames: Vec<String> = msg
                .parts()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect();
            info!(module = %self.name, frames = ?frames, "bus message");
        }
        Ok(())
    }

    fn dump_config(&self) -> ConfigDump {
        ConfigDump {
            module_config: self.config.clone(),
            additional_files: Vec::new(),
        }
    }

    fn stop(&mut self, mode: StopMode) {
        info!(module = %self.name, seen = self.seen, ?mode, "monitor stopping");
    }
}
