// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-target announcement state machine.
//!
//! One [`Announcer`] exists per (cluster, address) pair. Callers express the
//! desired state with [`Announcer::mark_up`] / [`Announcer::mark_down`]; the
//! announcer serializes the resulting store operations so that at most one is
//! in flight and at most one more is queued behind it:
//!
//! ```text
//!  mark_up(cb) / mark_down(cb)
//!        |
//!        v
//!  +-----------+   running    +-------------+
//!  |  enqueue  |------------->| queued_next |  (overwritten by newer requests)
//!  |  callback |              +-------------+
//!  +-----------+                     |
//!        | idle                      | run next
//!        v                           v
//!  +-----------------------------------------+
//!  |        store call (outside the lock)    |
//!  +-----------------------------------------+
//!        |
//!        v
//!  completion: drain pending callbacks, cancel opposite-kind ones when the
//!  desired state still matches, launch queued_next
//! ```
//!
//! # Dark warmup
//!
//! With warmup configured, a mark-up first announces to the warmup cluster,
//! waits `warmup_duration`, withdraws from the warmup cluster, and only then
//! announces to the regular cluster. Callers of `mark_up` resolve after the
//! final regular-cluster announcement.
//!
//! # Failure handling
//!
//! Transient store failures (connection loss, session expiry) abandon the
//! in-flight operation without touching the pending queues; the connection
//! manager calls [`Announcer::retry`] after a reconnect to re-drive it.
//! Callers whose requests were abandoned this way are only completed by that
//! retry, so they wait indefinitely if the connection never comes back.
//!
//! # Shutdown
//!
//! After [`Announcer::shutdown`] no new store operation is started. Requests
//! made afterwards are enqueued but never submitted: their callbacks are only
//! invoked if an operation that was already in flight drains them.

use crate::callback::Callback;
use crate::error::{AnnounceError, Operation, StoreError};
use crate::properties::{
    PartitionWeights, UriSpecificProperties, DO_NOT_LOAD_BALANCE, DO_NOT_SLOW_START,
};
use crate::scheduler::Scheduler;
use crate::store::StoreHandle;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use url::Url;

type StoreCall = Pin<Box<dyn Future<Output = Result<(), AnnounceError>> + Send + 'static>>;
type Completed = fn(&Arc<Inner>, Result<(), AnnounceError>, u64);

/// Builder for [`Announcer`].
pub struct AnnouncerBuilder {
    cluster: String,
    warmup_cluster: Option<String>,
    address: Option<Url>,
    partition_weights: PartitionWeights,
    extra_properties: UriSpecificProperties,
    warmup_enabled: bool,
    warmup_duration: Duration,
    scheduler: Option<Arc<dyn Scheduler>>,
    runtime: Option<Handle>,
}

impl AnnouncerBuilder {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            warmup_cluster: None,
            address: None,
            partition_weights: crate::properties::default_partition_weights(1.0),
            extra_properties: UriSpecificProperties::new(),
            warmup_enabled: false,
            warmup_duration: Duration::ZERO,
            scheduler: None,
            runtime: None,
        }
    }

    pub fn address(mut self, address: Url) -> Self {
        self.address = Some(address);
        self
    }

    pub fn warmup_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.warmup_cluster = Some(cluster.into());
        self
    }

    pub fn partition_weights(mut self, weights: PartitionWeights) -> Self {
        self.partition_weights = weights;
        self
    }

    pub fn extra_properties(mut self, properties: UriSpecificProperties) -> Self {
        self.extra_properties = properties;
        self
    }

    /// Enable dark warmup for `duration`, using `scheduler` for the timer.
    pub fn dark_warmup(mut self, duration: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        self.warmup_enabled = true;
        self.warmup_duration = duration;
        self.scheduler = Some(scheduler);
        self
    }

    pub fn warmup_enabled(mut self, enabled: bool) -> Self {
        self.warmup_enabled = enabled;
        self
    }

    pub fn warmup_duration(mut self, duration: Duration) -> Self {
        self.warmup_duration = duration;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Runtime used to drive store calls. Defaults to the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Announcer, AnnounceError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| AnnounceError::NoRuntime)?,
        };

        Ok(Announcer {
            inner: Arc::new(Inner {
                cluster: RwLock::new(self.cluster),
                warmup_cluster: RwLock::new(self.warmup_cluster),
                address: RwLock::new(self.address),
                partition_weights: ArcSwap::from_pointee(self.partition_weights),
                extra_properties: ArcSwap::from_pointee(self.extra_properties),
                is_up: AtomicBool::new(false),
                warmup_enabled: self.warmup_enabled,
                warmup_duration: self.warmup_duration,
                scheduler: self.scheduler,
                store: RwLock::new(Weak::new()),
                runtime,
                state: Mutex::new(CoordinationState::default()),
            }),
        })
    }
}

/// Status view consumed by readiness aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncerStatus {
    pub cluster: String,
    pub warmup_cluster: Option<String>,
    pub address: Option<Url>,
    /// A regular-cluster mark-up has been sent more recently than a mark-down.
    pub mark_up_intent_sent: bool,
    /// A mark-down has been sent more recently than a regular-cluster mark-up.
    pub mark_down_intent_sent: bool,
    /// A warmup-cluster mark-up has been sent and not yet torn down.
    pub dark_warmup_intent_sent: bool,
}

/// Coordination-state snapshot, mainly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub running: bool,
    pub queued_next: Option<Operation>,
    pub mark_up: usize,
    pub mark_down: usize,
    pub warmup_teardown: usize,
}

/// Announces one address in one cluster.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Announcer {
    inner: Arc<Inner>,
}

impl Announcer {
    pub fn builder(cluster: impl Into<String>) -> AnnouncerBuilder {
        AnnouncerBuilder::new(cluster)
    }

    /// Announce the address. `callback` fires once a mark-up completes.
    pub fn mark_up(&self, callback: Callback) {
        self.inner.request(Operation::MarkUp, callback);
    }

    /// Withdraw the address. `callback` fires once a mark-down completes.
    pub fn mark_down(&self, callback: Callback) {
        self.inner.request(Operation::MarkDown, callback);
    }

    /// Re-announce after a new session began. Succeeds immediately when the
    /// desired state is down.
    pub fn start(&self, callback: Callback) {
        if self.is_up() {
            self.mark_up(callback);
        } else {
            callback.succeed();
        }
    }

    /// Stop initiating store operations. One-way.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        info!("Announcer for {} shutting down", self.inner.target());
    }

    /// Re-drive an operation interrupted by a transient failure.
    ///
    /// Called by the connection manager after the connection is restored
    /// within the same session. Does nothing when no operation is pending:
    /// a completed announcement survives a connection blip.
    pub fn retry(&self, callback: Callback) {
        let action = {
            let mut st = self.inner.state.lock();
            if !st.pending_warmup_teardown.is_empty() && st.warming_up {
                st.retry_warmup_on_reconnect = true;
                Some(Operation::MarkUp)
            } else if !st.pending_mark_up.is_empty() || !st.pending_mark_down.is_empty() {
                if self.inner.is_up.load(Ordering::SeqCst) {
                    Some(Operation::MarkUp)
                } else {
                    Some(Operation::MarkDown)
                }
            } else {
                None
            }
        };

        match action {
            Some(op) => {
                info!("Retrying {} for {}", op, self.inner.target());
                self.inner.request(op, callback);
            }
            None => callback.succeed(),
        }
    }

    /// Mark down, then mark up again. A failed mark-down is reported to
    /// `callback` without marking up.
    pub fn reset(&self, callback: Callback) {
        let this = self.clone();
        self.mark_down(Callback::new(move |result| match result {
            Ok(()) => this.mark_up(callback),
            Err(e) => callback.fail(e),
        }));
    }

    /// Re-publish the current partition weights with `doNotSlowStart`.
    pub fn change_weight(&self, callback: Callback, do_not_slow_start: bool) {
        self.inner.extra_properties.rcu(|props| {
            let mut props = UriSpecificProperties::clone(props);
            props.insert(
                DO_NOT_SLOW_START.to_string(),
                serde_json::Value::Bool(do_not_slow_start),
            );
            props
        });

        let cluster = self.cluster();
        let label = format!("changeWeight of {}", self.inner.target());
        let store = self.inner.current_store();
        let address = self.address();
        let partitions = self.partition_weights();

        self.inner.runtime.spawn(async move {
            let result: Result<(), AnnounceError> = async {
                let store = store.ok_or(StoreError::NotConnected)?;
                let address =
                    address.ok_or_else(|| AnnounceError::AddressNotConfigured(cluster.clone()))?;
                store
                    .store()
                    .change_weight(&cluster, &address, &partitions, do_not_slow_start)
                    .await?;
                Ok(())
            }
            .await;
            callback.logged(label).complete(result);
        });
    }

    /// Publish the `doNotLoadBalance` property for this address.
    pub fn set_do_not_load_balance(&self, callback: Callback, do_not_load_balance: bool) {
        let value = serde_json::Value::Bool(do_not_load_balance);
        self.inner.extra_properties.rcu(|props| {
            let mut props = UriSpecificProperties::clone(props);
            props.insert(DO_NOT_LOAD_BALANCE.to_string(), value.clone());
            props
        });

        let cluster = self.cluster();
        let label = format!("setDoNotLoadBalance of {}", self.inner.target());
        let store = self.inner.current_store();
        let address = self.address();
        let partitions = self.partition_weights();

        self.inner.runtime.spawn(async move {
            let result: Result<(), AnnounceError> = async {
                let store = store.ok_or(StoreError::NotConnected)?;
                let address =
                    address.ok_or_else(|| AnnounceError::AddressNotConfigured(cluster.clone()))?;
                store
                    .store()
                    .add_uri_specific_property(
                        &cluster,
                        "setDoNotLoadBalance",
                        &address,
                        &partitions,
                        DO_NOT_LOAD_BALANCE,
                        value,
                    )
                    .await?;
                Ok(())
            }
            .await;
            callback.logged(label).complete(result);
        });
    }

    /// Point this announcer at the store of the current session.
    ///
    /// Only a weak reference is kept; operations fail transiently once the
    /// store is dropped.
    pub fn set_store(&self, store: &Arc<StoreHandle>) {
        *self.inner.store.write() = Arc::downgrade(store);
    }

    pub fn set_cluster(&self, cluster: impl Into<String>) {
        *self.inner.cluster.write() = cluster.into();
    }

    pub fn set_warmup_cluster(&self, cluster: Option<String>) {
        *self.inner.warmup_cluster.write() = cluster;
    }

    pub fn set_address(&self, address: Url) {
        *self.inner.address.write() = Some(address);
    }

    pub fn set_partition_weights(&self, weights: PartitionWeights) {
        self.inner.partition_weights.store(Arc::new(weights));
    }

    pub fn set_extra_properties(&self, properties: UriSpecificProperties) {
        self.inner.extra_properties.store(Arc::new(properties));
    }

    pub fn cluster(&self) -> String {
        self.inner.cluster.read().clone()
    }

    pub fn warmup_cluster(&self) -> Option<String> {
        self.inner.warmup_cluster.read().clone()
    }

    pub fn address(&self) -> Option<Url> {
        self.inner.address.read().clone()
    }

    pub fn partition_weights(&self) -> Arc<PartitionWeights> {
        self.inner.partition_weights.load_full()
    }

    pub fn extra_properties(&self) -> Arc<UriSpecificProperties> {
        self.inner.extra_properties.load_full()
    }

    /// Desired state: the intent of the most recent mark-up or mark-down.
    pub fn is_up(&self) -> bool {
        self.inner.is_up.load(Ordering::SeqCst)
    }

    pub fn last_mark_up_failed(&self) -> bool {
        self.inner.state.lock().last_mark_up_failed
    }

    pub fn is_warming_up(&self) -> bool {
        self.inner.state.lock().warming_up
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    pub fn status(&self) -> AnnouncerStatus {
        let st = self.inner.state.lock();
        AnnouncerStatus {
            cluster: self.cluster(),
            warmup_cluster: self.warmup_cluster(),
            address: self.address(),
            mark_up_intent_sent: st.mark_up_intent_sent,
            mark_down_intent_sent: st.mark_down_intent_sent,
            dark_warmup_intent_sent: st.dark_warmup_intent_sent,
        }
    }

    pub fn queue_depths(&self) -> QueueDepths {
        let st = self.inner.state.lock();
        QueueDepths {
            running: st.running,
            queued_next: st.queued_next.map(|q| q.op),
            mark_up: st.pending_mark_up.len(),
            mark_down: st.pending_mark_down.len(),
            warmup_teardown: st.pending_warmup_teardown.len(),
        }
    }
}

impl fmt::Debug for Announcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Announcer")
            .field("cluster", &self.cluster())
            .field("warmup_cluster", &self.warmup_cluster())
            .field("address", &self.address())
            .field("is_up", &self.is_up())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedOp {
    op: Operation,
    /// Ticket of the request that launched the operation.
    origin: u64,
}

struct Pending {
    ticket: u64,
    callback: Callback,
}

#[derive(Default)]
struct CoordinationState {
    running: bool,
    queued_next: Option<QueuedOp>,
    warming_up: bool,
    retry_warmup_on_reconnect: bool,
    last_mark_up_failed: bool,
    shutting_down: bool,
    pending_mark_up: VecDeque<Pending>,
    pending_mark_down: VecDeque<Pending>,
    pending_warmup_teardown: VecDeque<Callback>,
    next_ticket: u64,
    mark_up_intent_sent: bool,
    mark_down_intent_sent: bool,
    dark_warmup_intent_sent: bool,
}

impl CoordinationState {
    fn queue(&mut self, op: Operation) -> &mut VecDeque<Pending> {
        match op {
            Operation::MarkUp => &mut self.pending_mark_up,
            Operation::MarkDown => &mut self.pending_mark_down,
        }
    }

    fn take_pending(&mut self, op: Operation, ticket: u64) -> Option<Callback> {
        let queue = self.queue(op);
        let pos = queue.iter().position(|p| p.ticket == ticket)?;
        queue.remove(pos).map(|p| p.callback)
    }

    fn drain(&mut self, op: Operation) -> Vec<Callback> {
        self.queue(op).drain(..).map(|p| p.callback).collect()
    }

    /// Drop the in-flight operation after a transient failure.
    fn abandon_in_flight(&mut self) {
        self.running = false;
        self.queued_next = None;
    }
}

struct Inner {
    cluster: RwLock<String>,
    warmup_cluster: RwLock<Option<String>>,
    address: RwLock<Option<Url>>,
    partition_weights: ArcSwap<PartitionWeights>,
    extra_properties: ArcSwap<UriSpecificProperties>,
    is_up: AtomicBool,
    warmup_enabled: bool,
    warmup_duration: Duration,
    scheduler: Option<Arc<dyn Scheduler>>,
    store: RwLock<Weak<StoreHandle>>,
    runtime: Handle,
    state: Mutex<CoordinationState>,
}

fn is_transient(err: &AnnounceError) -> bool {
    err.store_error().is_some_and(StoreError::is_transient)
}

impl Inner {
    fn target(&self) -> String {
        match &*self.address.read() {
            Some(address) => format!("{} in {}", address, self.cluster.read()),
            None => format!("<no address> in {}", self.cluster.read()),
        }
    }

    fn current_store(&self) -> Option<Arc<StoreHandle>> {
        self.store.read().upgrade()
    }

    /// Enqueue the callback, record the desired state, then submit or queue.
    fn request(self: &Arc<Self>, op: Operation, callback: Callback) {
        let launch = {
            let mut st = self.state.lock();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.queue(op).push_back(Pending { ticket, callback });
            self.is_up.store(op == Operation::MarkUp, Ordering::SeqCst);

            let queued = QueuedOp { op, origin: ticket };
            if st.shutting_down {
                None
            } else if st.running {
                st.queued_next = Some(queued);
                None
            } else {
                st.running = true;
                Some(queued)
            }
        };

        match launch {
            Some(queued) => self.execute(queued),
            None => debug!("{} for {} not submitted now", op, self.target()),
        }
    }

    fn execute(self: &Arc<Self>, queued: QueuedOp) {
        match queued.op {
            Operation::MarkUp => self.perform_mark_up(queued.origin),
            Operation::MarkDown => self.perform_mark_down(queued.origin),
        }
    }

    /// Launch the queued operation, if any.
    ///
    /// `running` stays set while the queued operation is in flight, so a
    /// request arriving meanwhile is queued instead of racing it.
    fn run_next(self: &Arc<Self>) {
        let next = {
            let mut st = self.state.lock();
            let next = st.queued_next.take();
            if st.shutting_down {
                st.running = false;
                if let Some(dropped) = next {
                    debug!(
                        "Dropping queued {} for {}: shutting down",
                        dropped.op,
                        self.target()
                    );
                }
                None
            } else {
                if next.is_none() {
                    st.running = false;
                }
                next
            }
        };

        if let Some(queued) = next {
            self.execute(queued);
        }
    }

    fn dispatch(self: &Arc<Self>, call: StoreCall, origin: u64, done: Completed) {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = call.await;
            done(&this, result, origin);
        });
    }

    fn store_mark_up(&self, cluster: String) -> StoreCall {
        let store = self.current_store();
        let address = self.address.read().clone();
        let partitions = self.partition_weights.load_full();
        let properties = self.extra_properties.load_full();

        Box::pin(async move {
            let store = store.ok_or(StoreError::NotConnected)?;
            let address =
                address.ok_or_else(|| AnnounceError::AddressNotConfigured(cluster.clone()))?;
            store
                .store()
                .mark_up(&cluster, &address, &partitions, &properties)
                .await?;
            Ok(())
        })
    }

    fn store_mark_down(&self, cluster: String) -> StoreCall {
        let store = self.current_store();
        let address = self.address.read().clone();

        Box::pin(async move {
            let store = store.ok_or(StoreError::NotConnected)?;
            let address =
                address.ok_or_else(|| AnnounceError::AddressNotConfigured(cluster.clone()))?;
            store.store().mark_down(&cluster, &address).await?;
            Ok(())
        })
    }

    fn warmup_cluster_if_applicable(&self) -> Option<String> {
        if !self.warmup_enabled || self.warmup_duration.is_zero() || self.scheduler.is_none() {
            return None;
        }
        self.warmup_cluster.read().clone()
    }

    fn perform_mark_up(self: &Arc<Self>, origin: u64) {
        let resume = {
            let mut st = self.state.lock();
            if st.retry_warmup_on_reconnect {
                st.retry_warmup_on_reconnect = false;
                Some(st.warming_up)
            } else {
                None
            }
        };

        match resume {
            // Interrupted while tearing the warmup down: finish the teardown.
            Some(true) => self.tear_down_warmup(origin),
            // Teardown finished before the connection came back.
            Some(false) => self.mark_up_regular(origin),
            None => match self.warmup_cluster_if_applicable() {
                Some(warmup_cluster) => self.mark_up_warmup(warmup_cluster, origin),
                None => self.mark_up_regular(origin),
            },
        }
    }

    fn mark_up_warmup(self: &Arc<Self>, warmup_cluster: String, origin: u64) {
        self.state.lock().dark_warmup_intent_sent = true;
        debug!(
            "Dark warmup: marking up {} in warmup cluster {}",
            self.target(),
            warmup_cluster
        );
        let call = self.store_mark_up(warmup_cluster);
        self.dispatch(call, origin, Inner::on_warmup_mark_up_done);
    }

    fn on_warmup_mark_up_done(self: &Arc<Self>, result: Result<(), AnnounceError>, origin: u64) {
        match result {
            Err(e) if is_transient(&e) => {
                info!(
                    "Warmup markUp of {} interrupted ({}), waiting for reconnect",
                    self.target(),
                    e
                );
                let mut st = self.state.lock();
                st.last_mark_up_failed = false;
                st.abandon_in_flight();
            }
            Err(e) => {
                warn!(
                    "Warmup markUp of {} failed ({}), marking up without warmup",
                    self.target(),
                    e
                );
                self.mark_up_regular(origin);
            }
            Ok(()) => {
                let label = format!("warmup teardown of {}", self.target());
                {
                    let mut st = self.state.lock();
                    st.warming_up = true;
                    st.pending_warmup_teardown
                        .push_back(Callback::logging(label));
                }

                info!(
                    "Dark warmup of {} started, promoting in {:?}",
                    self.target(),
                    self.warmup_duration
                );

                match &self.scheduler {
                    Some(scheduler) => {
                        let this = Arc::clone(self);
                        scheduler.schedule(
                            self.warmup_duration,
                            Box::new(move || this.tear_down_warmup(origin)),
                        );
                    }
                    None => self.tear_down_warmup(origin),
                }
            }
        }
    }

    fn tear_down_warmup(self: &Arc<Self>, origin: u64) {
        let warmup_cluster = self.warmup_cluster.read().clone();
        match warmup_cluster {
            Some(warmup_cluster) => {
                self.state.lock().dark_warmup_intent_sent = false;
                debug!(
                    "Dark warmup: marking down {} in warmup cluster {}",
                    self.target(),
                    warmup_cluster
                );
                let call = self.store_mark_down(warmup_cluster);
                self.dispatch(call, origin, Inner::on_warmup_teardown_done);
            }
            None => self.mark_up_regular(origin),
        }
    }

    fn on_warmup_teardown_done(self: &Arc<Self>, result: Result<(), AnnounceError>, origin: u64) {
        match result {
            Err(e) if is_transient(&e) => {
                info!(
                    "Warmup teardown of {} interrupted ({}), waiting for reconnect",
                    self.target(),
                    e
                );
                self.state.lock().abandon_in_flight();
            }
            Err(e) => {
                warn!(
                    "Warmup teardown of {} failed ({}), promoting anyway",
                    self.target(),
                    e
                );
                self.mark_up_regular(origin);
            }
            Ok(()) => {
                let torn_down: Vec<Callback> = {
                    let mut st = self.state.lock();
                    st.warming_up = false;
                    st.pending_warmup_teardown.drain(..).collect()
                };
                for callback in torn_down {
                    callback.succeed();
                }
                self.mark_up_regular(origin);
            }
        }
    }

    fn mark_up_regular(self: &Arc<Self>, origin: u64) {
        let cluster = self.cluster.read().clone();
        {
            let mut st = self.state.lock();
            st.mark_up_intent_sent = true;
            st.mark_down_intent_sent = false;
        }
        debug!("Marking up {}", self.target());
        let call = self.store_mark_up(cluster);
        self.dispatch(call, origin, Inner::on_mark_up_done);
    }

    fn on_mark_up_done(self: &Arc<Self>, result: Result<(), AnnounceError>, origin: u64) {
        match result {
            Err(e) if is_transient(&e) => {
                info!(
                    "markUp of {} interrupted ({}), waiting for reconnect",
                    self.target(),
                    e
                );
                let mut st = self.state.lock();
                st.last_mark_up_failed = false;
                st.abandon_in_flight();
            }
            Err(e) => {
                warn!("markUp of {} failed: {}", self.target(), e);
                let originating = {
                    let mut st = self.state.lock();
                    st.last_mark_up_failed = true;
                    st.take_pending(Operation::MarkUp, origin)
                };
                if let Some(callback) = originating {
                    callback.fail(e);
                }
                self.run_next();
            }
            Ok(()) => {
                let (succeeded, cancelled) = {
                    let mut st = self.state.lock();
                    st.last_mark_up_failed = false;
                    let succeeded = st.drain(Operation::MarkUp);
                    let cancelled = if self.is_up.load(Ordering::SeqCst) {
                        st.drain(Operation::MarkDown)
                    } else {
                        Vec::new()
                    };
                    (succeeded, cancelled)
                };

                info!("Marked up {}", self.target());
                for callback in succeeded {
                    callback.succeed();
                }
                for callback in cancelled {
                    callback.fail(AnnounceError::cancelled(Operation::MarkDown));
                }
                self.run_next();
            }
        }
    }

    fn perform_mark_down(self: &Arc<Self>, origin: u64) {
        let cluster = self.cluster.read().clone();
        {
            let mut st = self.state.lock();
            st.mark_down_intent_sent = true;
            st.mark_up_intent_sent = false;
        }
        debug!("Marking down {}", self.target());
        let call = self.store_mark_down(cluster);
        self.dispatch(call, origin, Inner::on_mark_down_done);
    }

    fn on_mark_down_done(self: &Arc<Self>, result: Result<(), AnnounceError>, origin: u64) {
        match result {
            Err(e) if is_transient(&e) => {
                info!(
                    "markDown of {} interrupted ({}), waiting for reconnect",
                    self.target(),
                    e
                );
                self.state.lock().abandon_in_flight();
            }
            Err(e) => {
                warn!("markDown of {} failed: {}", self.target(), e);
                let originating = self
                    .state
                    .lock()
                    .take_pending(Operation::MarkDown, origin);
                if let Some(callback) = originating {
                    callback.fail(e);
                }
                self.run_next();
            }
            Ok(()) => {
                let (succeeded, cancelled) = {
                    let mut st = self.state.lock();
                    let succeeded = st.drain(Operation::MarkDown);
                    let cancelled = if self.is_up.load(Ordering::SeqCst) {
                        Vec::new()
                    } else {
                        st.drain(Operation::MarkUp)
                    };
                    (succeeded, cancelled)
                };

                info!("Marked down {}", self.target());
                for callback in succeeded {
                    callback.succeed();
                }
                for callback in cancelled {
                    callback.fail(AnnounceError::cancelled(Operation::MarkUp));
                }
                self.run_next();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcer() -> Announcer {
        Announcer::builder("cluster-1")
            .address(Url::parse("http://host-1:8080/svc").expect("url"))
            .build()
            .expect("runtime")
    }

    #[test]
    fn test_build_outside_runtime() {
        let result = Announcer::builder("c").build();
        assert!(matches!(result, Err(AnnounceError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_defaults() {
        let a = announcer();
        assert_eq!(a.cluster(), "cluster-1");
        assert!(a.warmup_cluster().is_none());
        assert!(!a.is_up());
        assert!(!a.last_mark_up_failed());
        assert_eq!(a.partition_weights().len(), 1);
        assert!(a.extra_properties().is_empty());
        assert_eq!(
            a.queue_depths(),
            QueueDepths {
                running: false,
                queued_next: None,
                mark_up: 0,
                mark_down: 0,
                warmup_teardown: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_start_when_down_succeeds_immediately() {
        let a = announcer();
        let (cb, completion) = Callback::channel();
        a.start(cb);
        assert!(completion.await.is_ok());
        assert!(!a.queue_depths().running);
    }

    #[tokio::test]
    async fn test_retry_without_pending_is_noop() {
        let a = announcer();
        let (cb, completion) = Callback::channel();
        a.retry(cb);
        assert!(completion.await.is_ok());
        assert!(!a.queue_depths().running);
    }

    #[tokio::test]
    async fn test_shutdown_drops_requests() {
        let a = announcer();
        a.shutdown();
        assert!(a.is_shutting_down());

        let (cb, mut completion) = Callback::channel();
        a.mark_up(cb);

        tokio::task::yield_now().await;
        assert!(completion.try_result().is_none());
        assert!(a.is_up());
        let depths = a.queue_depths();
        assert!(!depths.running);
        assert_eq!(depths.mark_up, 1);
    }

    #[tokio::test]
    async fn test_mark_up_without_store_is_transient() {
        let a = announcer();
        let (cb, mut completion) = Callback::channel();
        a.mark_up(cb);

        // The store call fails with NotConnected; the request stays pending.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(completion.try_result().is_none());
        assert!(!a.last_mark_up_failed());
        let depths = a.queue_depths();
        assert!(!depths.running);
        assert_eq!(depths.mark_up, 1);
    }

    #[tokio::test]
    async fn test_setters_replace_snapshots() {
        let a = announcer();
        a.set_cluster("cluster-2");
        a.set_warmup_cluster(Some("cluster-2-warmup".into()));
        a.set_partition_weights(crate::properties::default_partition_weights(2.0));
        let mut props = UriSpecificProperties::new();
        props.insert("zone".into(), serde_json::json!("a"));
        a.set_extra_properties(props);

        let status = a.status();
        assert_eq!(status.cluster, "cluster-2");
        assert_eq!(status.warmup_cluster.as_deref(), Some("cluster-2-warmup"));
        assert!(!status.mark_up_intent_sent);
        assert_eq!(a.partition_weights()[&0].weight(), 2.0);
        assert_eq!(a.extra_properties()["zone"], serde_json::json!("a"));
    }
}
