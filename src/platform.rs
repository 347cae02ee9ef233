//! Provides a tiny DI like container which keeps all central components in one place.
//!
//! The platform is essentially a map of **Arc<T>** services keyed by their type. It also
//! owns the central **is_running** flag which is flipped to *false* once
//! [Platform::terminate](Platform::terminate) is invoked. Long running loops (the RPC
//! server, the registry reaper, heartbeat senders) check this flag periodically and wind
//! themselves down once a shutdown was requested.
//!
//! For components which are known to be installed, [Platform::require](Platform::require)
//! is the right way to obtain them. Code which might run during or after a shutdown
//! should prefer [Platform::find](Platform::find) and gracefully handle the **None**
//! case, as terminating the platform clears the internal service map (so that all Drop
//! handlers run).
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use ganymede::platform::Platform;
//! struct Service {
//!     value: i32,
//! }
//!
//! let platform = Platform::new();
//!
//! // Registers a new service...
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//!
//! // ...which can be fetched later on:
//! assert_eq!(platform.require::<Service>().value, 42);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // ...once terminated, all services are released and the flag is toggled:
//! platform.terminate();
//! assert_eq!(platform.find::<Service>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps all central services of the system in a single place.
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a component for its type.
    ///
    /// A subsequent registration for the same type replaces the previous one.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .services
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered component.
    ///
    /// Returns an empty optional if no component was registered for the requested type
    /// or if the platform is already shutting down.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let services = self.services.lock().unwrap();
        services
            .get(&TypeId::of::<T>())
            .and_then(|service| service.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered component.
    ///
    /// # Panics
    /// Panics if the requested component isn't available. Note that this is also the
    /// case once [terminate](Platform::terminate) has been invoked, as all services are
    /// dropped at that point.
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        match self.find::<T>() {
            Some(service) => service,
            None => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if the platform is still running or if
    /// [terminate](Platform::terminate) has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This immediately releases all services (so that their Drop handlers run sooner or
    /// later) and toggles the [is_running](Platform::is_running) flag to **false**.
    pub fn terminate(&self) {
        self.services.lock().unwrap().clear();
        self.is_running.store(false, Ordering::Release);
    }
}
