//! Provides the consistent-hash ring used to route keys to peers.
//!
//! Each real peer occupies a configurable number of *virtual nodes* on the ring, which
//! evens out the key distribution and keeps the amount of key space that moves on a
//! membership change small. A lookup hashes the key and walks clockwise to the next
//! virtual node, wrapping around at the end of the hash space.
//!
//! The ring itself performs no locking. Exactly one owner (the
//! [Registry](crate::registry::Registry) or the [discovery](crate::discovery) adapter)
//! mutates a given ring and wraps it into its own lock; readers go through the same
//! lock so that a lookup always observes either the pre- or post-mutation state.
//!
//! # Example
//!
//! ```
//! # use ganymede::ring::Ring;
//! let mut ring = Ring::new(10);
//! ring.add("tcp@127.0.0.1:9010");
//! ring.add("tcp@127.0.0.1:9011");
//!
//! // Lookups are deterministic...
//! let owner = ring.locate("Tom").unwrap().to_owned();
//! assert_eq!(ring.locate("Tom").unwrap(), owner);
//!
//! // ...and removing a peer reroutes its keys to the survivors:
//! ring.remove(&owner);
//! assert_ne!(ring.locate("Tom").unwrap(), owner);
//! ```
use fnv::FnvHashMap;

/// Computes the position of a virtual node or key on the ring.
pub type HashFn = fn(&[u8]) -> u32;

/// The replica count used by the membership layer.
pub const DEFAULT_REPLICAS: usize = 10;

/// Maps keys to peers via consistent hashing with virtual nodes.
pub struct Ring {
    replicas: usize,
    hash: HashFn,
    keys: Vec<u32>,
    owners: FnvHashMap<u32, String>,
}

impl Ring {
    /// Creates a ring where each peer occupies the given number of virtual nodes,
    /// using CRC32 (IEEE) as hash function.
    pub fn new(replicas: usize) -> Self {
        Ring::with_hasher(replicas, crc32fast::hash)
    }

    /// Creates a ring with a custom hash function.
    ///
    /// This is mainly useful for tests which want a predictable placement.
    pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
        Ring {
            replicas: replicas.max(1),
            hash,
            keys: Vec::new(),
            owners: FnvHashMap::default(),
        }
    }

    fn virtual_hash(&self, index: usize, peer: &str) -> u32 {
        (self.hash)(format!("{}{}", index, peer).as_bytes())
    }

    /// Adds a peer by inserting all of its virtual nodes.
    ///
    /// If two peers collide on a virtual hash, the last writer wins for that slot.
    pub fn add(&mut self, peer: &str) {
        for index in 0..self.replicas {
            let hash = self.virtual_hash(index, peer);
            self.keys.push(hash);
            let _ = self.owners.insert(hash, peer.to_owned());
        }

        self.keys.sort_unstable();
    }

    /// Removes a peer by recomputing and deleting its virtual nodes.
    ///
    /// Only the peer's own virtual hash values are touched, so removing a peer whose
    /// slots were overwritten by a colliding peer stays correct.
    pub fn remove(&mut self, peer: &str) {
        for index in 0..self.replicas {
            let hash = self.virtual_hash(index, peer);
            if let Ok(position) = self.keys.binary_search(&hash) {
                let _ = self.keys.remove(position);
                let _ = self.owners.remove(&hash);
            }
        }
    }

    /// Returns the peer responsible for the given key.
    ///
    /// The owner is the peer of the first virtual node at or after the key's hash,
    /// wrapping to the first virtual node if the hash lies beyond the last one.
    /// Returns **None** on an empty ring.
    pub fn locate(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = match self.keys.binary_search(&hash) {
            Ok(position) => position,
            Err(position) => position % self.keys.len(),
        };

        self.owners.get(&self.keys[index]).map(|peer| peer.as_str())
    }

    /// Determines if no peer is present.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the total number of virtual nodes on the ring.
    pub fn virtual_len(&self) -> usize {
        self.keys.len()
    }
}
