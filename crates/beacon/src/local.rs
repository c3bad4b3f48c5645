// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process coordination service.
//!
//! A [`LocalEnsemble`] keeps ephemeral announcement nodes in memory, keyed by
//! cluster and address and owned by a session. [`LocalConnection`] opens
//! sessions against it and raises the same lifecycle events a remote
//! connection would, plus drill hooks to simulate connection loss and session
//! expiry. [`LocalStore`] implements [`DiscoveryStore`] on top.
//!
//! Used by the agent binary and by tests; it is not a client of any remote
//! service.

use crate::connection::{ConnectionEvent, ConnectionListener, CoordinationConnection, ListenerSet};
use crate::error::StoreError;
use crate::properties::{
    PartitionWeights, UriProperties, UriRecord, UriSpecificProperties, DO_NOT_SLOW_START,
};
use crate::store::{DiscoveryStore, StoreFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

struct Node {
    owner: u64,
    record: UriRecord,
}

#[derive(Default)]
struct EnsembleInner {
    clusters: Mutex<BTreeMap<String, BTreeMap<Url, Node>>>,
    sessions: Mutex<HashSet<u64>>,
    next_session: AtomicU64,
}

/// In-memory node tree shared by every connection to it.
#[derive(Clone, Default)]
pub struct LocalEnsemble {
    inner: Arc<EnsembleInner>,
}

impl LocalEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session and return its id.
    pub fn open_session(&self) -> u64 {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.sessions.lock().insert(id);
        id
    }

    /// Close a session, removing every node it owns. Returns the number of
    /// nodes removed.
    pub fn close_session(&self, session: u64) -> usize {
        if !self.inner.sessions.lock().remove(&session) {
            return 0;
        }

        let mut removed = 0;
        let mut clusters = self.inner.clusters.lock();
        for nodes in clusters.values_mut() {
            let before = nodes.len();
            nodes.retain(|_, node| node.owner != session);
            removed += before - nodes.len();
        }
        removed
    }

    pub fn is_session_live(&self, session: u64) -> bool {
        self.inner.sessions.lock().contains(&session)
    }

    /// Snapshot of one cluster; `None` if it was never created.
    pub fn uri_properties(&self, cluster: &str) -> Option<UriProperties> {
        let clusters = self.inner.clusters.lock();
        clusters
            .get(cluster)
            .map(|nodes| cluster_snapshot(cluster, nodes))
    }

    /// Snapshot of every cluster.
    pub fn snapshot(&self) -> Vec<UriProperties> {
        let clusters = self.inner.clusters.lock();
        clusters
            .iter()
            .map(|(name, nodes)| cluster_snapshot(name, nodes))
            .collect()
    }

    fn put(&self, session: u64, cluster: &str, uri: &Url, record: UriRecord) {
        let mut clusters = self.inner.clusters.lock();
        clusters.entry(cluster.to_string()).or_default().insert(
            uri.clone(),
            Node {
                owner: session,
                record,
            },
        );
    }

    fn remove(&self, cluster: &str, uri: &Url) -> bool {
        let mut clusters = self.inner.clusters.lock();
        clusters
            .get_mut(cluster)
            .and_then(|nodes| nodes.remove(uri))
            .is_some()
    }

    /// Rewrite an existing node under `session`.
    fn update<F>(&self, session: u64, cluster: &str, uri: &Url, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut UriRecord),
    {
        let mut clusters = self.inner.clusters.lock();
        let nodes = clusters
            .get_mut(cluster)
            .ok_or_else(|| StoreError::ClusterNotFound(cluster.to_string()))?;
        let node = nodes.get_mut(uri).ok_or_else(|| StoreError::UriNotFound {
            cluster: cluster.to_string(),
            uri: uri.to_string(),
        })?;
        f(&mut node.record);
        node.owner = session;
        Ok(())
    }
}

fn cluster_snapshot(cluster: &str, nodes: &BTreeMap<Url, Node>) -> UriProperties {
    let uris = nodes
        .iter()
        .map(|(uri, node)| (uri.clone(), node.record.clone()))
        .collect();
    UriProperties::new(cluster, uris)
}

/// Connection state shared between a connection and the stores it creates.
#[derive(Default)]
struct Link {
    connected: AtomicBool,
    session: Mutex<Option<u64>>,
}

/// Connection to a [`LocalEnsemble`].
pub struct LocalConnection {
    ensemble: LocalEnsemble,
    link: Arc<Link>,
    listeners: ListenerSet,
}

impl LocalConnection {
    pub fn new(ensemble: LocalEnsemble) -> Self {
        Self {
            ensemble,
            link: Arc::new(Link::default()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn ensemble(&self) -> &LocalEnsemble {
        &self.ensemble
    }

    /// Id of the current session, if one is open.
    pub fn session_id(&self) -> Option<u64> {
        *self.link.session.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    /// Factory creating stores bound to this connection's current session.
    pub fn store_factory(&self) -> LocalStoreFactory {
        LocalStoreFactory {
            ensemble: self.ensemble.clone(),
            link: Arc::clone(&self.link),
        }
    }

    /// Drop the connection while keeping the session alive.
    pub fn disconnect(&self) {
        if self.session_id().is_some() && self.link.connected.swap(false, Ordering::SeqCst) {
            info!("Local connection lost");
            self.listeners.notify(ConnectionEvent::Disconnected);
        }
    }

    /// Restore a dropped connection within the same session.
    pub fn reconnect(&self) {
        if self.session_id().is_some() && !self.link.connected.swap(true, Ordering::SeqCst) {
            info!("Local connection restored");
            self.listeners.notify(ConnectionEvent::Reconnected);
        }
    }

    /// Expire the current session and open a fresh one.
    pub fn expire_session(&self) {
        let Some(old) = self.link.session.lock().take() else {
            return;
        };
        self.link.connected.store(false, Ordering::SeqCst);
        let removed = self.ensemble.close_session(old);
        info!("Session {} expired, {} ephemeral nodes removed", old, removed);
        self.listeners.notify(ConnectionEvent::SessionExpired);

        self.open();
    }

    fn open(&self) {
        let session = self.ensemble.open_session();
        *self.link.session.lock() = Some(session);
        self.link.connected.store(true, Ordering::SeqCst);
        info!("Session {} established", session);
        self.listeners.notify(ConnectionEvent::SessionEstablished);
    }
}

#[async_trait]
impl CoordinationConnection for LocalConnection {
    async fn start(&self) -> Result<(), StoreError> {
        if self.session_id().is_none() {
            self.open();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        let session = self.link.session.lock().take();
        self.link.connected.store(false, Ordering::SeqCst);
        if let Some(session) = session {
            let removed = self.ensemble.close_session(session);
            info!("Session {} closed, {} ephemeral nodes removed", session, removed);
        }
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }
}

/// Creates [`LocalStore`]s for a [`LocalConnection`].
#[derive(Clone)]
pub struct LocalStoreFactory {
    ensemble: LocalEnsemble,
    link: Arc<Link>,
}

impl StoreFactory for LocalStoreFactory {
    fn create_store(&self) -> Arc<dyn DiscoveryStore> {
        Arc::new(LocalStore {
            ensemble: self.ensemble.clone(),
            link: Arc::clone(&self.link),
            session: *self.link.session.lock(),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// [`DiscoveryStore`] writing ephemeral nodes of one session.
pub struct LocalStore {
    ensemble: LocalEnsemble,
    link: Arc<Link>,
    session: Option<u64>,
    shut_down: AtomicBool,
}

impl LocalStore {
    /// Session whose nodes this store writes.
    pub fn session(&self) -> Option<u64> {
        self.session
    }

    fn check(&self) -> Result<u64, StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        let session = self.session.ok_or(StoreError::SessionExpired)?;
        if *self.link.session.lock() != Some(session) || !self.ensemble.is_session_live(session) {
            return Err(StoreError::SessionExpired);
        }
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        Ok(session)
    }
}

#[async_trait]
impl DiscoveryStore for LocalStore {
    async fn start(&self) -> Result<(), StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn mark_up(
        &self,
        cluster: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        properties: &UriSpecificProperties,
    ) -> Result<(), StoreError> {
        let session = self.check()?;
        debug!("Local store: markUp {} in {}", uri, cluster);
        self.ensemble.put(
            session,
            cluster,
            uri,
            UriRecord {
                partitions: partitions.clone(),
                properties: properties.clone(),
            },
        );
        Ok(())
    }

    async fn mark_down(&self, cluster: &str, uri: &Url) -> Result<(), StoreError> {
        self.check()?;
        if self.ensemble.remove(cluster, uri) {
            debug!("Local store: markDown {} in {}", uri, cluster);
        } else {
            debug!("Local store: markDown {} in {}: not announced", uri, cluster);
        }
        Ok(())
    }

    async fn change_weight(
        &self,
        cluster: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        do_not_slow_start: bool,
    ) -> Result<(), StoreError> {
        let session = self.check()?;
        self.ensemble.update(session, cluster, uri, |record| {
            record.partitions = partitions.clone();
            record.properties.insert(
                DO_NOT_SLOW_START.to_string(),
                serde_json::Value::Bool(do_not_slow_start),
            );
        })
    }

    async fn add_uri_specific_property(
        &self,
        cluster: &str,
        operation: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let session = self.check()?;
        debug!("Local store: {} sets {} on {} in {}", operation, name, uri, cluster);
        self.ensemble.update(session, cluster, uri, |record| {
            record.partitions = partitions.clone();
            record.properties.insert(name.to_string(), value);
        })
    }
}
