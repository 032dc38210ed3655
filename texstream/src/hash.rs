//! Content fingerprints for cache keys.
//!
//! djb2 is deliberate: the keys are host-local and a collision only costs a
//! cache miss, never correctness. Do not swap in a cryptographic hash
//! without measuring.

/// djb2 over the input, with wrapping 32-bit arithmetic so the value is
/// identical on every platform.
pub fn djb2(text: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in text.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

/// djb2 rendered as fixed-width lowercase hex, the form used in cache keys
/// and blob names (`fmt-cache/<hash>_<engine>.fmt`).
pub fn djb2_hex(text: &str) -> String {
    format!("{:08x}", djb2(text))
}
