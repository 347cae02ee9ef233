//! Ganymede is a small distributed in-memory cache cluster.
//!
//! # Introduction
//! **Ganymede** keys string-addressed byte values and spreads them over a set of peer
//! nodes using consistent hashing. Each node owns a size-bounded LRU partition and loads
//! misses from a pluggable origin. Clients talk to nodes via a compact, length-prefixed
//! RPC protocol which multiplexes concurrent calls over a single connection.
//!
//! Managed runtimes like **Java**, **node.js** or **Ruby** are great for building
//! sophisticated applications but tend to struggle once large amounts of semi-constant
//! data have to be kept close to the request path. This is where **Rust** shines, as it
//! permits to write low-level and highly optimized code which is still safe to run.
//! Ganymede wraps exactly that capability into a service: a cache tier which is cheap to
//! run, trivially horizontally scalable and honest about its guarantees (it has none
//! beyond "a key lives on one node at a time").
//!
//! # Features
//! * **Byte-bounded LRU partitions** - each node accounts the exact number of bytes
//!   stored (key + value) and evicts the least recently used entries once the configured
//!   budget is exceeded. See [lru](crate::lru).
//! * **Single-flight origin loads** - any number of concurrent misses for the same key
//!   result in exactly one call to the origin loader. All waiters observe the identical
//!   outcome. See [singleflight](crate::singleflight).
//! * **Consistent-hash routing** - peers occupy a configurable number of virtual nodes
//!   on a hash ring, so membership changes only move a small fraction of the key space.
//!   See [ring](crate::ring).
//! * **Framed RPC protocol** - a JSON handshake negotiates the codec, afterwards both
//!   directions exchange length-prefixed header/body records. The client multiplexes
//!   calls by sequence number, the server dispatches every request on its own task.
//!   See [server](crate::server) and [client](crate::client).
//! * **TTL based membership** - a registry tracks peers via HTTP heartbeats and expires
//!   them after a configurable TTL. Alternatively, an external coordinator can be
//!   bridged in via the [discovery](crate::discovery) adapter.
//! * **100% Async/Await** - everything builds upon [tokio](https://tokio.rs/) and the
//!   async primitives provided by Rust.
//!
//! # Using Ganymede
//! Ganymede is intended to be used as a library. The accompanying binary
//! (`ganymede-io`) provides a minimal launcher which can run a registry, a cache node
//! or a one-shot client and mainly serves as an executable example.
//!
//! A short example on how to initialize the library can be found in
//! [Builder](builder::Builder).
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod fmt;
pub mod group;
pub mod idgen;
pub mod lru;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod server;
pub mod signals;
pub mod singleflight;
pub mod value;

/// Contains the version of the Ganymede library.
pub const GANYMEDE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to
/// set up the framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Guarded by a Once as otherwise integration tests would crash when initializing
    // the logging system several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Info,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
