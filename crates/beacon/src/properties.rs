// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Announced payload: partition weights and uri-specific properties.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

/// Partition used when a service is not partitioned.
pub const DEFAULT_PARTITION_ID: i32 = 0;

/// Property telling clients to skip slow-start ramp-up for this address.
pub const DO_NOT_SLOW_START: &str = "doNotSlowStart";

/// Property telling clients to exclude this address from load balancing.
pub const DO_NOT_LOAD_BALANCE: &str = "doNotLoadBalance";

/// Per-partition announcement data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionData {
    weight: f64,
}

impl PartitionData {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Partition id -> partition data.
pub type PartitionWeights = BTreeMap<i32, PartitionData>;

/// Opaque per-address properties.
pub type UriSpecificProperties = BTreeMap<String, serde_json::Value>;

/// Weights for an unpartitioned service.
pub fn default_partition_weights(weight: f64) -> PartitionWeights {
    let mut weights = PartitionWeights::new();
    weights.insert(DEFAULT_PARTITION_ID, PartitionData::new(weight));
    weights
}

/// What a store holds for one announced address.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UriRecord {
    pub partitions: PartitionWeights,
    pub properties: UriSpecificProperties,
}

/// Snapshot of every address announced in one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct UriProperties {
    cluster: String,
    uris: BTreeMap<Url, UriRecord>,
}

impl UriProperties {
    pub fn new(cluster: impl Into<String>, uris: BTreeMap<Url, UriRecord>) -> Self {
        Self {
            cluster: cluster.into(),
            uris,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Announced addresses.
    pub fn uris(&self) -> impl Iterator<Item = &Url> {
        self.uris.keys()
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.uris.contains_key(uri)
    }

    /// Partition weights announced for `uri`.
    pub fn partition_data(&self, uri: &Url) -> Option<&PartitionWeights> {
        self.uris.get(uri).map(|r| &r.partitions)
    }

    /// Uri-specific properties for `uri`; `None` when it has none.
    pub fn uri_specific_properties(&self, uri: &Url) -> Option<&UriSpecificProperties> {
        self.uris
            .get(uri)
            .map(|r| &r.properties)
            .filter(|p| !p.is_empty())
    }

    /// Number of addresses carrying uri-specific properties.
    pub fn uris_with_properties(&self) -> usize {
        self.uris
            .values()
            .filter(|r| !r.properties.is_empty())
            .count()
    }

    /// Addresses with the given scheme that serve `partition`.
    pub fn uris_by_scheme_and_partition(&self, scheme: &str, partition: i32) -> BTreeSet<Url> {
        self.uris
            .iter()
            .filter(|(uri, record)| {
                uri.scheme() == scheme && record.partitions.contains_key(&partition)
            })
            .map(|(uri, _)| uri.clone())
            .collect()
    }
}
