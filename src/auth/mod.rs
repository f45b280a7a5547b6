pub mod keys;
pub mod middleware;
pub mod projects;

/// Bearer token attached to request extensions by
/// [`middleware::require_bearer`].
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
