// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! Store failures are split into two families. Transient failures (the
//! coordination-service connection dropped, or the session expired) are never
//! reported to callers: the in-flight operation is abandoned and the
//! reconnect-driven retry path re-drives it. Every other failure is reported
//! to the caller that originated the operation.

use std::fmt;
use thiserror::Error;

/// Kind of announcement operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Publish the address in a cluster.
    MarkUp,
    /// Withdraw the address from a cluster.
    MarkDown,
}

impl Operation {
    /// The operation that undoes this one.
    pub fn opposite(self) -> Self {
        match self {
            Self::MarkUp => Self::MarkDown,
            Self::MarkDown => Self::MarkUp,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkUp => write!(f, "markUp"),
            Self::MarkDown => write!(f, "markDown"),
        }
    }
}

/// Errors reported by a [`DiscoveryStore`](crate::store::DiscoveryStore).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Coordination service session expired")]
    SessionExpired,

    #[error("No discovery store is currently available")]
    NotConnected,

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Uri {uri} is not announced in cluster {cluster}")]
    UriNotFound { cluster: String, uri: String },

    #[error("Discovery store has been shut down")]
    Shutdown,

    #[error("Store operation failed: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure was caused by the connection or session going away.
    ///
    /// Transient failures are recovered by the reconnect-driven retry path and
    /// are not surfaced to callers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss | Self::SessionExpired | Self::NotConnected
        )
    }
}

/// Errors delivered to announcement callbacks.
#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{superseded} cancelled by a more recent {winner}")]
    Cancelled {
        superseded: Operation,
        winner: Operation,
    },

    #[error("No address configured for cluster {0}")]
    AddressNotConfigured(String),

    #[error("Invalid address {address} for cluster {cluster}: {reason}")]
    InvalidAddress {
        cluster: String,
        address: String,
        reason: String,
    },

    #[error("Connection manager is already starting")]
    AlreadyStarting,

    #[error("Completion was dropped without a result")]
    Abandoned,

    #[error("No tokio runtime available")]
    NoRuntime,
}

impl AnnounceError {
    /// Cancellation of a queued `superseded` request by a completed `winner`.
    pub fn cancelled(superseded: Operation) -> Self {
        Self::Cancelled {
            superseded,
            winner: superseded.opposite(),
        }
    }

    /// Whether this is the cancellation-kind error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::ConnectionLoss.is_transient());
        assert!(StoreError::SessionExpired.is_transient());
        assert!(StoreError::NotConnected.is_transient());
        assert!(!StoreError::Shutdown.is_transient());
        assert!(!StoreError::ClusterNotFound("c".into()).is_transient());
        assert!(!StoreError::Backend("boom".into()).is_transient());
    }

    #[test]
    fn test_cancelled_message() {
        let err = AnnounceError::cancelled(Operation::MarkDown);
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "markDown cancelled by a more recent markUp");
    }

    #[test]
    fn test_store_error_accessor() {
        let err = AnnounceError::from(StoreError::Backend("disk full".into()));
        assert_eq!(
            err.store_error(),
            Some(&StoreError::Backend("disk full".into()))
        );
        assert!(AnnounceError::Abandoned.store_error().is_none());
    }
}
