//! Generates cluster-wide unique, monotone 64-bit identifiers.
//!
//! The layout is the classic snowflake scheme: 42 bits of milliseconds since a fixed
//! epoch, 10 bits of node id and a 12 bit sequence which disambiguates ids minted
//! within the same millisecond:
//!
//! ```text
//! | timestamp (42 bit) | node id (10 bit) | sequence (12 bit) |
//! ```
//!
//! Node ids are derived from the node's listen address by hashing "ip:port" with
//! FNV-1a and reducing it to 10 bits, so that a restarting node keeps its identity
//! without any coordination.
//!
//! A [SequenceGenerator](SequenceGenerator) is not safe for concurrent use; callers
//! owning one must serialize access externally.
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds between the Unix epoch and this scheme's epoch (2024-07-01).
const EPOCH_MS: u64 = 1_719_792_000_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_BITS;

/// The largest representable node id (10 bits).
pub const MAX_NODE_ID: u64 = (1 << NODE_BITS) - 1;

const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Mints monotonically increasing identifiers for one node.
pub struct SequenceGenerator {
    node_id: u64,
    last_timestamp: u64,
    sequence: u64,
}

impl SequenceGenerator {
    /// Creates a generator for the given node id.
    ///
    /// Fails if the id does not fit into 10 bits.
    pub fn new(node_id: u64) -> anyhow::Result<SequenceGenerator> {
        if node_id > MAX_NODE_ID {
            return Err(anyhow::anyhow!(
                "node id must be between 0 and {}",
                MAX_NODE_ID
            ));
        }

        Ok(SequenceGenerator {
            node_id,
            last_timestamp: 0,
            sequence: 0,
        })
    }

    /// Creates a generator whose node id is derived from the given listen address.
    pub fn for_peer(ip: &str, port: u16) -> SequenceGenerator {
        SequenceGenerator {
            node_id: node_id_for_peer(ip, port),
            last_timestamp: 0,
            sequence: 0,
        }
    }

    /// Returns the next identifier.
    ///
    /// Within one millisecond the sequence is incremented; when it wraps, the
    /// generator busy-waits for the next millisecond so that ids never repeat.
    pub fn generate(&mut self) -> u64 {
        let mut timestamp = current_millis();

        if timestamp == self.last_timestamp {
            self.sequence = (self.sequence + 1) & MAX_SEQUENCE;
            if self.sequence == 0 {
                while timestamp <= self.last_timestamp {
                    timestamp = current_millis();
                }
            }
        } else {
            self.sequence = 0;
        }

        self.last_timestamp = timestamp;

        ((timestamp - EPOCH_MS) << TIMESTAMP_SHIFT) | (self.node_id << NODE_SHIFT) | self.sequence
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Derives the 10 bit node id for the given listen address.
pub fn node_id_for_peer(ip: &str, port: u16) -> u64 {
    u64::from(fnv1a_32(format!("{}:{}", ip, port).as_bytes())) & MAX_NODE_ID
}

/// Computes the 32 bit FNV-1a hash of the given bytes.
///
/// The `fnv` crate only ships the 64 bit variant, but node ids are specified in terms
/// of the 32 bit hash, so this is spelled out here.
fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }

    hash
}

/// Mints a single identifier for the given listen address.
///
/// This is the one-shot helper used by nodes to derive the key under which they
/// publish themselves at the coordinator.
pub fn generate_peer_id(ip: &str, port: u16) -> u64 {
    SequenceGenerator::for_peer(ip, port).generate()
}

#[cfg(test)]
mod tests {
    use super::{
        fnv1a_32, generate_peer_id, node_id_for_peer, SequenceGenerator, MAX_NODE_ID,
    };

    #[test]
    fn identifiers_increase_strictly() {
        let mut generator = SequenceGenerator::new(42).unwrap();

        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.generate();
            assert_eq!(id > last, true);
            last = id;
        }
    }

    #[test]
    fn the_bit_layout_holds() {
        let mut generator = SequenceGenerator::new(MAX_NODE_ID).unwrap();
        let id = generator.generate();

        // The node id occupies the 10 bits above the 12 sequence bits...
        assert_eq!((id >> 12) & MAX_NODE_ID, MAX_NODE_ID);
        // ...and the timestamp part is non-zero for any current clock:
        assert_eq!(id >> 22 > 0, true);
    }

    #[test]
    fn oversized_node_ids_are_rejected() {
        assert_eq!(SequenceGenerator::new(MAX_NODE_ID).is_ok(), true);
        assert_eq!(SequenceGenerator::new(MAX_NODE_ID + 1).is_err(), true);
    }

    #[test]
    fn node_ids_are_stable_and_within_range() {
        let id = node_id_for_peer("127.0.0.1", 9010);
        assert_eq!(id, node_id_for_peer("127.0.0.1", 9010));
        assert_eq!(id <= MAX_NODE_ID, true);
        assert_ne!(id, node_id_for_peer("127.0.0.1", 9011));

        assert_eq!(generate_peer_id("127.0.0.1", 9010) > 0, true);
    }

    #[test]
    fn the_fnv_reference_vectors_hold() {
        // The well-known FNV-1a test vectors...
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }
}
