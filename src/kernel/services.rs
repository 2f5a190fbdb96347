//! Service registry.
//!
//! One service instance per interface type. Modules register the services
//! they implement and look up the ones they consume. The registry is handed
//! to modules explicitly through their context; there is no global instance.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Registry failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// A service is already registered for this interface.
    #[error("a service is already registered for {0}")]
    AlreadyRegistered(&'static str),

    /// No service is registered for this interface.
    #[error("no service registered for {0}")]
    NotRegistered(&'static str),

    /// The service is still referenced outside the registry.
    #[error("service {interface} is still used by {users} holder(s)")]
    InUse {
        /// Interface type name.
        interface: &'static str,
        /// Number of outstanding references.
        users: usize,
    },
}

/// Type-keyed service registry. `ServiceRegistry::default()` is empty.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.lock().len())
            .finish()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` as the implementation of interface `S`.
    ///
    /// The registry takes ownership of the handle; callers keep access
    /// through [`ServiceRegistry::get_service`].
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyRegistered`] if `S` already has one.
    pub fn register_service<S>(&self, service: Arc<S>) -> Result<(), ServiceError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let mut services = self.lock();
        let key = TypeId::of::<S>();
        if services.contains_key(&key) {
            return Err(ServiceError::AlreadyRegistered(std::any::type_name::<S>()));
        }
        services.insert(key, Box::new(service));
        debug!(interface = std::any::type_name::<S>(), "service registered");
        Ok(())
    }

    /// The implementation of interface `S`, if any.
    pub fn get_service<S>(&self) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.lock()
            .get(&TypeId::of::<S>())
            .and_then(|entry| entry.downcast_ref::<Arc<S>>())
            .cloned()
    }

    /// Outstanding references to `S` handed out by the registry.
    pub fn use_count<S>(&self) -> Option<usize>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.lock()
            .get(&TypeId::of::<S>())
            .and_then(|entry| entry.downcast_ref::<Arc<S>>())
            .map(|arc| Arc::strong_count(arc).saturating_sub(1))
    }

    /// Remove the implementation of `S` and give it back.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InUse`] while anyone still holds a handle
    /// obtained from the registry, or [`ServiceError::NotRegistered`].
    pub fn unregister_service<S>(&self) -> Result<Arc<S>, ServiceError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let interface = std::any::type_name::<S>();
        let mut services = self.lock();
        let key = TypeId::of::<S>();
        let users = services
            .get(&key)
            .and_then(|entry| entry.downcast_ref::<Arc<S>>())
            .map(|arc| Arc::strong_count(arc).saturating_sub(1))
            .ok_or(ServiceError::NotRegistered(interface))?;
        if users > 0 {
            return Err(ServiceError::InUse { interface, users });
        }
        let entry = services
            .remove(&key)
            .ok_or(ServiceError::NotRegistered(interface))?;
        let service = entry
            .downcast::<Arc<S>>()
            .map_err(|_| ServiceError::NotRegistered(interface))?;
        debug!(interface, "service unregistered");
        Ok(*service)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
