use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::error::DomainError;

const ISOLATION_MARKER: &str = "-isolated-";

/// Process-wide source of isolation suffixes.
static ISOLATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of a resolver inside the registry.
///
/// Shared keys are plain configuration names. Isolated keys carry a suffix
/// drawn from a process-wide counter, so they never match an existing entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn shared(base: &str) -> Result<Self, DomainError> {
        Ok(Self(validate_base(base)?.to_string()))
    }

    pub fn isolated(base: &str) -> Result<Self, DomainError> {
        let base = validate_base(base)?;
        let suffix = ISOLATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Self(format!("{base}{ISOLATION_MARKER}{suffix}")))
    }

    pub fn is_isolated(&self) -> bool {
        self.0.contains(ISOLATION_MARKER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_base(base: &str) -> Result<&str, DomainError> {
    let trimmed = base.trim();
    if trimmed.is_empty() {
        return Err(DomainError::invalid_pool_key(base, "must not be empty"));
    }
    if trimmed.contains(ISOLATION_MARKER) {
        return Err(DomainError::invalid_pool_key(
            trimmed,
            format!("must not contain `{ISOLATION_MARKER}`"),
        ));
    }
    Ok(trimmed)
}
