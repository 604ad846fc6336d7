// Shared primitives: stable hashing, clock access, id placement.

use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for "no value" in grid cells, row keys and accumulators.
pub const NONE: i64 = i64::MIN;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 64-bit FNV-1a. Stable across nodes and restarts; used for text value
/// hashes, segment name hashes and customer id placement.
pub fn hash_bytes(bytes: &[u8]) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

pub fn hash_str(text: &str) -> i64 {
    hash_bytes(text.as_bytes())
}

/// Customer ids hash case-insensitively so `U@x.com` and `u@x.com` land on
/// the same record.
pub fn hash_customer_id(id: &str) -> i64 {
    hash_str(&id.to_lowercase())
}

/// Partition placement: `|hash(id)| % partition_count`.
pub fn partition_for(id_hash: i64, partition_max: usize) -> usize {
    if partition_max == 0 {
        return 0;
    }
    (id_hash.unsigned_abs() % partition_max as u64) as usize
}

/// Fixed-point scale for doubles (4 decimal places on the wire).
pub const UNIT_SCALE: i64 = 10_000;

pub fn scale_double(value: f64) -> i64 {
    (value * UNIT_SCALE as f64).round() as i64
}

pub fn descale_double(value: i64) -> f64 {
    value as f64 / UNIT_SCALE as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_str("banana"), hash_str("banana"));
        assert_ne!(hash_str("banana"), hash_str("pear"));
    }

    #[test]
    fn test_customer_id_case_folding() {
        assert_eq!(hash_customer_id("U@X.com"), hash_customer_id("u@x.com"));
    }

    #[test]
    fn test_partition_placement_in_range() {
        for id in ["a", "b", "someone@example.com", "42"] {
            let p = partition_for(hash_customer_id(id), 16);
            assert!(p < 16);
        }
    }

    #[test]
    fn test_double_scaling_four_decimals() {
        assert_eq!(scale_double(2.5), 25_000);
        assert_eq!(scale_double(0.0001), 1);
        assert_eq!(descale_double(25_000), 2.5);
    }
}
