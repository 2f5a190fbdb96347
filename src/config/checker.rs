//! Registry of named hardware objects declared by modules.
//!
//! Modules register the objects they provide (a GPIO pin, an LED, a reader)
//! and other modules verify their references against it at startup. The
//! registry is shared across module threads and guarded by a mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ConfigError;

/// Kind of a registered hardware object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// A general purpose I/O pin.
    Gpio,
    /// An LED (possibly backed by a GPIO).
    Led,
    /// A card or credential reader.
    Reader,
    /// A buzzer.
    Buzzer,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gpio => "GPIO",
            Self::Led => "LED",
            Self::Reader => "READER",
            Self::Buzzer => "BUZZER",
        };
        f.write_str(name)
    }
}

/// Object-existence checker.
#[derive(Debug, Default)]
pub struct ConfigChecker {
    objects: Mutex<HashMap<String, ObjectType>>,
}

impl ConfigChecker {
    /// Create an empty checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a named object.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateObject`] if `name` is already taken.
    pub fn register_object(&self, name: &str, object_type: ObjectType) -> Result<(), ConfigError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| ConfigError::Poisoned("object checker"))?;
        if objects.contains_key(name) {
            return Err(ConfigError::DuplicateObject(name.to_owned()));
        }
        objects.insert(name.to_owned(), object_type);
        Ok(())
    }

    /// Whether any object is registered under `name`.
    pub fn has_object(&self, name: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(name))
            .unwrap_or(false)
    }

    /// Whether an object of the given type is registered under `name`.
    pub fn has_object_of_type(&self, name: &str, object_type: ObjectType) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.get(name) == Some(&object_type))
            .unwrap_or(false)
    }

    /// Forget every registered object.
    pub fn clear(&self) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.clear();
        }
    }

    /// Verify a reference to another module's object.
    ///
    /// In strict mode a dangling reference is an error; otherwise it is only
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingObject`] in strict mode.
    pub fn check_reference(
        &self,
        name: &str,
        object_type: ObjectType,
        strict: bool,
    ) -> Result<(), ConfigError> {
        if self.has_object_of_type(name, object_type) {
            return Ok(());
        }
        if strict {
            return Err(ConfigError::MissingObject {
                name: name.to_owned(),
                object_type,
            });
        }
        warn!(object = %name, kind = %object_type, "referenced object does not exist");
        Ok(())
    }
}
