// ABOUTME: Shared utility functions for Hatchery
// ABOUTME: ID and secret generation plus token hashing

use rand::Rng;
use sha2::{Digest, Sha256};

const ID_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a 12-character lowercase alphanumeric id.
///
/// Lowercase keeps ids valid inside container, pod and claim names.
pub fn generate_id() -> String {
    random_string(12)
}

/// Generate a bearer secret for a registered compute target
pub fn generate_agent_token() -> String {
    format!("hat_{}", random_string(40))
}

/// SHA-256 hex digest of a bearer token; only digests are stored
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ID_CHARSET.len());
            ID_CHARSET[idx] as char
        })
        .collect()
}
