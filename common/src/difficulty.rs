use sha3::{Digest, Keccak256};

// A work submission must hash to at least this many leading hex zeros.
// The hash preimage binds the farmer, the block and its entropy so a
// nonce found for one farmer cannot be replayed for another.

pub const ENTROPY_SIZE: usize = 32;
pub const HASH_SIZE: usize = 32;

// keccak256(farmer_pubkey || block_index_be || entropy || nonce_be)
pub fn work_hash(
    farmer_pubkey: &[u8; 32],
    block_index: u64,
    entropy: &[u8; ENTROPY_SIZE],
    nonce: u64,
) -> [u8; HASH_SIZE] {
    let mut hasher = Keccak256::new();
    hasher.update(farmer_pubkey);
    hasher.update(block_index.to_be_bytes());
    hasher.update(entropy);
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

// Count leading zero nibbles of a hash
pub fn leading_hex_zeros(hash: &[u8]) -> u32 {
    let mut zeros = 0;
    for byte in hash {
        if *byte == 0 {
            zeros += 2;
            continue;
        }
        if byte >> 4 == 0 {
            zeros += 1;
        }
        break;
    }
    zeros
}

pub fn meets_difficulty(hash: &[u8], target_zeros: u32) -> bool {
    leading_hex_zeros(hash) >= target_zeros
}

// How far beyond the target the found hash landed
pub fn difficulty_gap(zeros: u32, target_zeros: u32) -> u32 {
    zeros.saturating_sub(target_zeros)
}
