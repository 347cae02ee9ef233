//! Provides the cache partition owned by each node.
//!
//! A [Group](Group) combines a byte-bounded [LruStore](crate::lru::LruStore), an origin
//! [Loader](Loader) and a [SingleFlight](crate::singleflight::SingleFlight) coordinator
//! into a named cache partition. Reads are served from the store if possible; misses
//! are loaded from the origin exactly once per key and generation, no matter how many
//! callers are waiting.
//!
//! Groups are kept in a process-wide registry so that the RPC layer can resolve them by
//! name. Installing a name twice simply yields the already existing instance.
//!
//! # Example
//!
//! ```
//! # use ganymede::group::{loader_fn, Group};
//! # use bytes::Bytes;
//! # #[tokio::main]
//! # async fn main() {
//! let group = Group::install(
//!     "users",
//!     2 << 10,
//!     loader_fn(|key: String| async move {
//!         // Usually this would consult a database...
//!         Ok(Bytes::from(format!("origin value of {}", key)))
//!     }),
//! );
//!
//! let value = group.get("Tom").await.unwrap();
//! assert_eq!(value.to_text(), "origin value of Tom");
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::lru::LruStore;
use crate::singleflight::SingleFlight;
use crate::value::Value;

/// Produces the authoritative bytes for a cache key on miss.
pub trait Loader: Send + Sync + 'static {
    /// Loads the value for the given key from the origin.
    ///
    /// Returning an error marks the key as unavailable; the error is propagated to
    /// every caller waiting on this load.
    fn load(&self, key: &str) -> BoxFuture<'static, anyhow::Result<Bytes>>;
}

struct FnLoader<F>(F);

impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    fn load(&self, key: &str) -> BoxFuture<'static, anyhow::Result<Bytes>> {
        Box::pin((self.0)(key.to_owned()))
    }
}

/// Wraps an async closure into a [Loader](Loader).
pub fn loader_fn<F, Fut>(loader: F) -> Arc<dyn Loader>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    Arc::new(FnLoader(loader))
}

lazy_static::lazy_static! {
    static ref GROUPS: Mutex<HashMap<String, Arc<Group>>> = Mutex::new(HashMap::new());
}

/// A named cache partition: LRU store + origin loader + single-flight coordination.
pub struct Group {
    name: String,
    store: Mutex<LruStore>,
    loader: Arc<dyn Loader>,
    flights: SingleFlight,
}

impl Group {
    /// Creates a group and registers it in the process-wide registry.
    ///
    /// If a group with the given name already exists, the existing instance is
    /// returned and the passed loader and capacity are ignored.
    pub fn install(name: &str, capacity: usize, loader: Arc<dyn Loader>) -> Arc<Group> {
        let mut groups = GROUPS.lock().unwrap();
        if let Some(existing) = groups.get(name) {
            log::debug!("Group {} is already installed, returning it...", name);
            return existing.clone();
        }

        log::info!(
            "Installing cache group {} with a budget of {}...",
            name,
            crate::fmt::format_size(capacity)
        );
        let group = Arc::new(Group {
            name: name.to_owned(),
            store: Mutex::new(LruStore::new(capacity)),
            loader,
            flights: SingleFlight::new(),
        });
        let _ = groups.insert(name.to_owned(), group.clone());

        group
    }

    /// Resolves a previously installed group by name.
    pub fn lookup(name: &str) -> Option<Arc<Group>> {
        GROUPS.lock().unwrap().get(name).cloned()
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value for the given key.
    ///
    /// A hit is answered directly from the store (promoting the entry). On a miss, the
    /// origin loader is consulted via the single-flight coordinator, so that any number
    /// of concurrent misses for the same key cause exactly one origin invocation. The
    /// loaded value is copied into the store before being returned.
    pub async fn get(&self, key: &str) -> anyhow::Result<Value> {
        if let Some(value) = self.store.lock().unwrap().get(key) {
            return Ok(value.clone());
        }

        log::debug!("Cache miss for {} in group {}...", key, self.name);

        let outcome = self
            .flights
            .execute(key, async {
                let bytes = self.loader.load(key).await?;

                // The loader keeps ownership of its buffer, the cache stores its own
                // copy of the bytes.
                let value = Value::from_slice(&bytes);
                self.store.lock().unwrap().add(key, value.clone());
                Ok(value)
            })
            .await;

        outcome.map_err(anyhow::Error::new)
    }

    /// Stores the given value, bypassing the origin.
    pub fn insert(&self, key: &str, value: Value) {
        self.store.lock().unwrap().add(key, value);
    }

    /// Removes the entry for the given key.
    ///
    /// Fails if no such entry is present.
    pub fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.store.lock().unwrap().remove(key)
    }

    /// Returns the number of entries currently stored.
    pub fn entry_count(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    /// Returns the number of bytes currently accounted to this group.
    pub fn used_bytes(&self) -> usize {
        self.store.lock().unwrap().used_bytes()
    }
}
