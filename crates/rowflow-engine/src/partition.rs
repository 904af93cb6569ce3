//! Key-based row partitioning.
//!
//! The partition of a key depends only on the key and the partition count, so
//! every node of a cluster routes the same key to the same place.

use rowflow_types::Value;

const FNV_SEED: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

fn fnv_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_SEED;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Partition of `key` among `partitions` (at least 1).
///
/// Integers partition by non-negative modulo; nulls land in partition 0;
/// every other value is hashed (FNV-1a) over its text form, binaries over
/// their bytes.
#[must_use]
pub fn partition_of(key: &Value, partitions: usize) -> usize {
    let count = u64::try_from(partitions.max(1)).unwrap_or(u64::MAX);
    let slot = match key {
        Value::Null => 0,
        Value::Integer(v) => {
            let modulus = i64::try_from(count).unwrap_or(i64::MAX);
            v.rem_euclid(modulus).unsigned_abs()
        }
        Value::Binary(bytes) => fnv_hash(bytes) % count,
        other => fnv_hash(other.to_string().as_bytes()) % count,
    };
    usize::try_from(slot).unwrap_or(0)
}
