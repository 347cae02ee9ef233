//! Provides a builder which sets up and initializes the framework.
//!
//! Ganymede consists of a few optional components; the builder permits to selectively
//! enable or disable them before building the [Platform](crate::platform::Platform).
//!
//! # Example
//! Setting up a cache node with all features enabled:
//! ```no_run
//! use ganymede::builder::Builder;
//! use ganymede::group::{loader_fn, Group};
//! use ganymede::server::RpcServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Install the cache partition to serve...
//!     let group = Group::install(
//!         "main",
//!         2 << 10,
//!         loader_fn(|key: String| async move {
//!             Err(anyhow::anyhow!("{} not exist", key))
//!         }),
//!     );
//!
//!     // Start the main event loop of the server...
//!     RpcServer::install(&platform, group).event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, GANYMEDE_VERSION};

/// Initializes the framework by creating and initializing all enabled components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
}

impl Builder {
    /// Creates a new builder with all components disabled.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
        }
    }

    /// Enables all components.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// We properly initialize **simplelog** to log to stdout. As Ganymede is intended
    /// to run in containers, this is all that is needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the logging setup after [enable_all()](Builder::enable_all) was used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the platform once **CTRL-C** or
    /// **SIGHUP** is received.
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables the signal listener after [enable_all()](Builder::enable_all) was
    /// used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs a [Config](crate::config::Config) loaded from **config/settings.yml**.
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables the config setup after [enable_all()](Builder::enable_all) was used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Builds the [Platform](Platform) with all enabled components registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "GANYMEDE (v {}) running on {} core(s) in {} CPU(s)",
            GANYMEDE_VERSION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            let _ = crate::config::Config::install(&platform);
        }

        platform
    }
}

#[cfg(test)]
mod tests {
    use super::Builder;
    use crate::config::Config;

    #[tokio::test]
    async fn a_full_build_installs_the_config() {
        let platform = Builder::new()
            .enable_all()
            .disable_logging()
            .disable_signals()
            .build()
            .await;

        // No settings.yml is present in the test environment, so defaults apply...
        assert_eq!(
            platform.require::<Config>().server_address(),
            "0.0.0.0:9010"
        );

        platform.terminate();
    }

    #[tokio::test]
    async fn components_can_be_disabled() {
        let platform = Builder::new().build().await;

        assert_eq!(platform.find::<Config>().is_none(), true);

        platform.terminate();
    }
}
