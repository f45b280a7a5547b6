use sha2::{Digest, Sha256};

use crate::providers::ProviderInput;

/// Prefix shared by every cache entry in the key-value store.
pub const CACHE_PREFIX: &str = "cache:";

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Canonical text form of an input, or `None` when the input is not cacheable.
///
/// Whitespace runs collapse to a single space and the ends are trimmed, so
/// prompts differing only in spacing share an entry. Chat turns keep their
/// role so the same words under a different role do not collide.
pub fn normalize_input(input: &ProviderInput) -> Option<String> {
    match input {
        ProviderInput::Text { prompt } => Some(collapse_whitespace(prompt)),
        ProviderInput::Chat { messages } => Some(
            messages
                .iter()
                .map(|m| format!("{}: {}", m.role.trim(), collapse_whitespace(&m.content)))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        ProviderInput::Audio { .. } => None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Model-scoped cache key: `cache:` followed by a SHA-256 hex digest.
pub fn cache_key(model: &str, input: &ProviderInput) -> Option<String> {
    let normalized = normalize_input(input)?;
    let mut hasher = Sha256::new();
    // Version prefix so a change in normalization never reads stale entries.
    hasher.update(b"v1:");
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    Some(format!("{CACHE_PREFIX}{}", hex(&hasher.finalize())))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
