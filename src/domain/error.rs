use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid pool key `{key}`: {reason}")]
    InvalidPoolKey { key: String, reason: String },
}

impl DomainError {
    pub fn invalid_pool_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPoolKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
