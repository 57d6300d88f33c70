use crate::types::ShardId;

/// DJB2 hash function used as the default entity fingerprint.
/// Deterministic for any byte slice; both ends of a deployment must agree on it.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Compute the shard of an entity ID: `fingerprint(entity_id) mod N + 1`.
///
/// Shards are 1-indexed; the result is always in `[1, number_of_shards]`.
///
/// # Panics
///
/// Panics if `number_of_shards` is zero.
pub fn shard_for_entity(entity_id: &str, number_of_shards: u32) -> ShardId {
    assert!(
        number_of_shards >= 1,
        "number_of_shards must be >= 1, got {number_of_shards}"
    );
    ShardId(djb2_hash(entity_id.as_bytes()) % number_of_shards + 1)
}
