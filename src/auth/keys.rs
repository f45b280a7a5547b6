use rand::Rng;
use sha2::{Digest, Sha256};

const TOKEN_PREFIX: &str = "sk-tg-";
const TOKEN_RANDOM_LEN: usize = 32;

/// Generate a new project token with the format `sk-tg-{32 alphanumeric}`.
///
/// Only [`hash_token`] of the result is ever stored.
pub fn generate_project_token() -> String {
    format!("{TOKEN_PREFIX}{}", generate_random_alphanumeric(TOKEN_RANDOM_LEN))
}

/// SHA-256 digest of a bearer token, returned as a hex string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a random alphanumeric string of the given length.
fn generate_random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
