// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery store abstraction.
//!
//! Backend-agnostic interface for publishing instance records into the
//! coordination service. Implementations must deliver completions for
//! operations on the same (cluster, address) in submission order, and must
//! report connection loss or session expiry with a transient
//! [`StoreError`] so callers can tell them apart from real failures.

use crate::error::StoreError;
use crate::properties::{PartitionWeights, UriSpecificProperties};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

/// Per-cluster put/remove of instance records.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    /// Start the store.
    async fn start(&self) -> Result<(), StoreError>;

    /// Shut the store down. Later operations fail with [`StoreError::Shutdown`].
    async fn shutdown(&self) -> Result<(), StoreError>;

    /// Publish `uri` in `cluster`.
    ///
    /// Marking up an address that is already up replaces its record.
    async fn mark_up(
        &self,
        cluster: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        properties: &UriSpecificProperties,
    ) -> Result<(), StoreError>;

    /// Withdraw `uri` from `cluster`. Withdrawing an absent address succeeds.
    async fn mark_down(&self, cluster: &str, uri: &Url) -> Result<(), StoreError>;

    /// Replace the partition weights of an announced address and record
    /// whether clients should skip slow start for it.
    async fn change_weight(
        &self,
        cluster: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        do_not_slow_start: bool,
    ) -> Result<(), StoreError>;

    /// Set one uri-specific property on an announced address.
    ///
    /// `operation` names the caller-level operation, for logging.
    async fn add_uri_specific_property(
        &self,
        cluster: &str,
        operation: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Creates a fresh store for each coordination-service session.
pub trait StoreFactory: Send + Sync {
    fn create_store(&self) -> Arc<dyn DiscoveryStore>;
}

impl<F> StoreFactory for F
where
    F: Fn() -> Arc<dyn DiscoveryStore> + Send + Sync,
{
    fn create_store(&self) -> Arc<dyn DiscoveryStore> {
        self()
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// The store instance of one session.
///
/// The connection manager owns the only strong reference; announcers keep a
/// weak one and re-read it on every operation.
pub struct StoreHandle {
    store: Arc<dyn DiscoveryStore>,
    generation: u64,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn DiscoveryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn store(&self) -> &Arc<dyn DiscoveryStore> {
        &self.store
    }

    /// Monotonic id distinguishing stores across sessions.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
