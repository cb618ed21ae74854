//! Strongly-typed identifiers used by the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Longest caller-supplied job id accepted.
pub const MAX_JOB_ID_LEN: usize = 256;

/// Identifier of a job.
///
/// Generated ids are UUIDv7 strings (time-ordered). Callers may supply their own
/// id as an idempotency key, so the type wraps a string rather than a `Uuid`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new generated identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap a caller-supplied idempotency key.
    ///
    /// Rejects empty keys, keys longer than [`MAX_JOB_ID_LEN`] and keys containing
    /// whitespace or `:` (the broker's key separator).
    pub fn custom(key: impl Into<String>) -> Result<Self, CoreError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CoreError::invalid_id("JobId: empty"));
        }
        if key.len() > MAX_JOB_ID_LEN {
            return Err(CoreError::invalid_id(format!(
                "JobId: longer than {MAX_JOB_ID_LEN} bytes"
            )));
        }
        if key.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(CoreError::invalid_id(format!(
                "JobId: `{key}` contains whitespace or ':'"
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::custom(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Token identifying one claim of a job (one lease).
///
/// Every claim gets a fresh token; completion, failure and renewal must present
/// the token of the current lease.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LockToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for LockToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| CoreError::invalid_id(format!("LockToken: {e}")))?;
        Ok(Self(uuid))
    }
}
