//! Shared primitives for all Rust crates in Flowline.

#![forbid(unsafe_code)]

/// Resolved runtime configuration consumed by the core components.
pub mod config;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type used across Flowline crates.
pub type CoreResult<T> = Result<T, CoreError>;

/// A validated flow name: the namespace that groups queue records for one
/// family of identical workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowName(String);

impl FlowName {
    /// Creates a validated flow name.
    pub fn new(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CoreError::ConfigInvalid(
                "flow name must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<FlowName> for String {
    fn from(value: FlowName) -> Self {
        value.0
    }
}

impl Display for FlowName {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Identity of one running worker loop: `host_token "-" random8`.
///
/// The host token alone is not assumed unique; the random suffix
/// disambiguates multiple loops on the same host and across restarts.
/// Generated once at loop startup and never persisted outside queue rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh instance identity from the given host token.
    pub fn generate(host_token: &str) -> CoreResult<Self> {
        let host_token = host_token.trim();
        if host_token.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "instance host token must not be empty".to_owned(),
            ));
        }

        let mut suffix = Uuid::new_v4().simple().to_string();
        suffix.truncate(8);

        Ok(Self(format!("{host_token}-{suffix}")))
    }

    /// Wraps an already-formed instance identity, e.g. one read back from a
    /// claimed queue row.
    pub fn from_string(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CoreError::ConfigInvalid(
                "instance id must not be empty".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for InstanceId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Closed error taxonomy used throughout the core.
///
/// Only [`CoreError::ConfigInvalid`], [`CoreError::UnsupportedStore`],
/// [`CoreError::MigrationFailed`], and [`CoreError::MigrationChecksumMismatch`]
/// are fatal at startup; every runtime store error is recoverable and the
/// worker loop keeps running through it.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Connection or transport failure against a named store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A per-query deadline elapsed before the store answered.
    #[error("query timeout: {0}")]
    QueryTimeout(String),

    /// Store-level semantic error: constraint violation, syntax, bad type.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Attempt to move a record through a disallowed lifecycle edge.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// A migration unit failed to apply and was rolled back.
    #[error("migration failed: {0}")]
    MigrationFailed(String),

    /// A previously applied migration unit no longer matches its recorded
    /// checksum.
    #[error("migration checksum mismatch: {0}")]
    MigrationChecksumMismatch(String),

    /// The store lacks a primitive the queue engine requires, such as
    /// skip-locked row claiming.
    #[error("unsupported store: {0}")]
    UnsupportedStore(String),

    /// Attempt to mutate a store declared read-only.
    #[error("read-only store: {0}")]
    ReadOnlyStore(String),

    /// Required configuration option missing or out of range at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A record handler failed; captured as record failure, never fatal to
    /// the worker loop.
    #[error("handler error: {0}")]
    HandlerError(String),
}

impl CoreError {
    /// Process exit code when this error terminates an embedding process.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfigInvalid(_) => 2,
            Self::MigrationFailed(_) | Self::MigrationChecksumMismatch(_) => 3,
            Self::UnsupportedStore(_) => 4,
            _ => 1,
        }
    }

    /// Whether this error must abort startup rather than be retried.
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid(_)
                | Self::UnsupportedStore(_)
                | Self::MigrationFailed(_)
                | Self::MigrationChecksumMismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreError, FlowName, InstanceId};

    #[test]
    fn flow_name_rejects_whitespace() {
        let result = FlowName::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn instance_id_combines_host_token_and_random_suffix() {
        let instance_id = match InstanceId::generate("worker-host") {
            Ok(value) => value,
            Err(error) => panic!("instance id generation failed: {error}"),
        };

        let (prefix, suffix) = match instance_id.as_str().rsplit_once('-') {
            Some(parts) => parts,
            None => panic!("instance id has no suffix separator"),
        };
        assert_eq!(prefix, "worker-host");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|value| value.is_ascii_hexdigit()));
    }

    #[test]
    fn instance_ids_are_unique_per_generation() {
        let first = InstanceId::generate("host").map(|value| value.as_str().to_owned());
        let second = InstanceId::generate("host").map(|value| value.as_str().to_owned());
        assert_ne!(first.unwrap_or_default(), second.unwrap_or_default());
    }

    #[test]
    fn exit_codes_follow_the_embedding_contract() {
        assert_eq!(CoreError::ConfigInvalid(String::new()).exit_code(), 2);
        assert_eq!(CoreError::MigrationFailed(String::new()).exit_code(), 3);
        assert_eq!(
            CoreError::MigrationChecksumMismatch(String::new()).exit_code(),
            3
        );
        assert_eq!(CoreError::UnsupportedStore(String::new()).exit_code(), 4);
        assert_eq!(CoreError::StoreUnavailable(String::new()).exit_code(), 1);
    }

    #[test]
    fn only_startup_errors_are_fatal() {
        assert!(CoreError::ConfigInvalid(String::new()).is_fatal_at_startup());
        assert!(CoreError::UnsupportedStore(String::new()).is_fatal_at_startup());
        assert!(!CoreError::StoreUnavailable(String::new()).is_fatal_at_startup());
        assert!(!CoreError::HandlerError(String::new()).is_fatal_at_startup());
    }
}
