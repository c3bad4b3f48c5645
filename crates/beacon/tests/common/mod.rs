// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared test helpers: a discovery store whose calls are completed by hand.

#![allow(dead_code)] // Not every test binary uses every helper

use async_trait::async_trait;
use beacon::{
    Announcer, Completion, DiscoveryStore, PartitionWeights, StoreError, StoreFactory,
    UriSpecificProperties,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use url::Url;

/// A store call as recorded by [`ScriptedStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    MarkUp {
        cluster: String,
        uri: Url,
    },
    MarkDown {
        cluster: String,
        uri: Url,
    },
    ChangeWeight {
        cluster: String,
        uri: Url,
        do_not_slow_start: bool,
    },
    AddProperty {
        cluster: String,
        uri: Url,
        name: String,
        value: serde_json::Value,
    },
}

impl Call {
    pub fn mark_up(cluster: &str) -> Self {
        Self::MarkUp {
            cluster: cluster.into(),
            uri: address(),
        }
    }

    pub fn mark_down(cluster: &str) -> Self {
        Self::MarkDown {
            cluster: cluster.into(),
            uri: address(),
        }
    }
}

type Responder = oneshot::Sender<Result<(), StoreError>>;

/// Discovery store that parks every announcement call until the test
/// completes it. `start` and `shutdown` succeed immediately.
#[derive(Default)]
pub struct ScriptedStore {
    history: Mutex<Vec<Call>>,
    pending: Mutex<VecDeque<(Call, Responder)>>,
    arrived: Notify,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call received so far, in order.
    pub fn history(&self) -> Vec<Call> {
        self.history.lock().clone()
    }

    /// Calls received but not completed yet.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for the next uncompleted call and complete it with `result`.
    pub async fn complete_next(&self, result: Result<(), StoreError>) -> Call {
        loop {
            let next = self.pending.lock().pop_front();
            if let Some((call, responder)) = next {
                // The caller may have gone away; the outcome is then moot.
                let _ = responder.send(result);
                return call;
            }
            self.arrived.notified().await;
        }
    }

    /// Like [`complete_next`](Self::complete_next), with a bound on the wait.
    pub async fn expect_call(&self, result: Result<(), StoreError>) -> Call {
        tokio::time::timeout(Duration::from_secs(60), self.complete_next(result))
            .await
            .expect("store call expected")
    }

    async fn park(&self, call: Call) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.history.lock().push(call.clone());
        self.pending.lock().push_back((call, tx));
        self.arrived.notify_one();
        rx.await
            .unwrap_or_else(|_| Err(StoreError::Backend("call dropped".into())))
    }
}

#[async_trait]
impl DiscoveryStore for ScriptedStore {
    async fn start(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn mark_up(
        &self,
        cluster: &str,
        uri: &Url,
        _partitions: &PartitionWeights,
        _properties: &UriSpecificProperties,
    ) -> Result<(), StoreError> {
        self.park(Call::MarkUp {
            cluster: cluster.into(),
            uri: uri.clone(),
        })
        .await
    }

    async fn mark_down(&self, cluster: &str, uri: &Url) -> Result<(), StoreError> {
        self.park(Call::MarkDown {
            cluster: cluster.into(),
            uri: uri.clone(),
        })
        .await
    }

    async fn change_weight(
        &self,
        cluster: &str,
        uri: &Url,
        _partitions: &PartitionWeights,
        do_not_slow_start: bool,
    ) -> Result<(), StoreError> {
        self.park(Call::ChangeWeight {
            cluster: cluster.into(),
            uri: uri.clone(),
            do_not_slow_start,
        })
        .await
    }

    async fn add_uri_specific_property(
        &self,
        cluster: &str,
        _operation: &str,
        uri: &Url,
        _partitions: &PartitionWeights,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.park(Call::AddProperty {
            cluster: cluster.into(),
            uri: uri.clone(),
            name: name.into(),
            value,
        })
        .await
    }
}

/// Factory wrapping every store it creates so that `start` waits for a
/// permit from `gate`. Other calls go straight to the wrapped store.
pub struct GatedStartFactory {
    factory: Arc<dyn StoreFactory>,
    gate: Arc<Semaphore>,
    starts: Arc<AtomicUsize>,
}

impl GatedStartFactory {
    pub fn new(factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            factory,
            gate: Arc::new(Semaphore::new(0)),
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Let one waiting (or future) `start` through.
    pub fn open_one(&self) {
        self.gate.add_permits(1);
    }

    /// Number of `start` calls received so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl StoreFactory for GatedStartFactory {
    fn create_store(&self) -> Arc<dyn DiscoveryStore> {
        Arc::new(GatedStartStore {
            store: self.factory.create_store(),
            gate: Arc::clone(&self.gate),
            starts: Arc::clone(&self.starts),
        })
    }
}

struct GatedStartStore {
    store: Arc<dyn DiscoveryStore>,
    gate: Arc<Semaphore>,
    starts: Arc<AtomicUsize>,
}

#[async_trait]
impl DiscoveryStore for GatedStartStore {
    async fn start(&self) -> Result<(), StoreError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| StoreError::Shutdown)?;
        permit.forget();
        self.store.start().await
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.store.shutdown().await
    }

    async fn mark_up(
        &self,
        cluster: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        properties: &UriSpecificProperties,
    ) -> Result<(), StoreError> {
        self.store.mark_up(cluster, uri, partitions, properties).await
    }

    async fn mark_down(&self, cluster: &str, uri: &Url) -> Result<(), StoreError> {
        self.store.mark_down(cluster, uri).await
    }

    async fn change_weight(
        &self,
        cluster: &str,
        uri: &Url,
        partitions: &PartitionWeights,
        do_not_slow_start: bool,
    ) -> Result<(), StoreError> {
        self.store
            .change_weight(cluster, uri, partitions, do_not_slow_start)
            .await
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
        self.store
            .add_uri_specific_property(cluster, operation, uri, partitions, name, value)
            .await
    }
}

pub const CLUSTER: &str = "cluster-1";
pub const WARMUP_CLUSTER: &str = "cluster-1-warmup";

pub fn address() -> Url {
    Url::parse("http://host-1:8080/svc").expect("valid url")
}

/// Announcer for [`CLUSTER`] at [`address`], without warmup.
pub fn announcer() -> Announcer {
    Announcer::builder(CLUSTER)
        .address(address())
        .build()
        .expect("tokio runtime")
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `check` until it holds, failing the test after a while.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Outcome of a completion, if it has fired.
pub fn outcome(completion: &mut Completion) -> Option<Result<(), String>> {
    completion
        .try_result()
        .map(|r| r.map_err(|e| e.to_string()))
}
