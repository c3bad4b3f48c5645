// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection manager.
//!
//! Binds a set of [`Announcer`]s to one coordination-service connection. A
//! fresh [`DiscoveryStore`](crate::store::DiscoveryStore) is created for every
//! session; once it is started it is handed to every announcer, which then
//! re-announces its desired state. After a reconnect within the same session
//! the announcers re-drive whatever the connection loss interrupted.

use crate::announcer::Announcer;
use crate::callback::{fan_in, Callback};
use crate::connection::{ConnectionEvent, ConnectionListener, CoordinationConnection};
use crate::error::{AnnounceError, StoreError};
use crate::store::{StoreFactory, StoreHandle};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ManagerState {
    manager_started: bool,
    store_ready: bool,
    store_started: bool,
    /// A store start is in flight.
    store_starting: bool,
    shut_down: bool,
    startup_callback: Option<Callback>,
}

struct ManagerInner {
    announcers: Vec<Announcer>,
    connection: Arc<dyn CoordinationConnection>,
    store_factory: Arc<dyn StoreFactory>,
    store: ArcSwapOption<StoreHandle>,
    state: Mutex<ManagerState>,
    runtime: Handle,
}

/// Owns the announcers of one process and their shared connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager and register its lifecycle listener on `connection`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        announcers: Vec<Announcer>,
        connection: Arc<dyn CoordinationConnection>,
        store_factory: Arc<dyn StoreFactory>,
    ) -> Result<Self, AnnounceError> {
        let runtime = Handle::try_current().map_err(|_| AnnounceError::NoRuntime)?;
        let inner = Arc::new(ManagerInner {
            announcers,
            connection,
            store_factory,
            store: ArcSwapOption::empty(),
            state: Mutex::new(ManagerState::default()),
            runtime,
        });

        inner.connection.add_listener(Arc::new(LifecycleListener {
            manager: Arc::downgrade(&inner),
        }));

        Ok(Self { inner })
    }

    /// Start the connection; `callback` fires once every announcer has been
    /// started against the first session's store.
    ///
    /// Succeeds immediately when already started. A second start while the
    /// first is still pending fails with [`AnnounceError::AlreadyStarting`].
    pub fn start(&self, callback: Callback) {
        {
            let mut st = self.inner.state.lock();
            if st.startup_callback.is_some() {
                drop(st);
                callback.fail(AnnounceError::AlreadyStarting);
                return;
            }
            if st.manager_started && st.store_started {
                drop(st);
                callback.succeed();
                return;
            }
            st.manager_started = true;
            st.shut_down = false;
            st.startup_callback = Some(callback);
        }

        info!(
            "Starting connection manager with {} announcers",
            self.inner.announcers.len()
        );

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            match inner.connection.start().await {
                Ok(()) => inner.try_start_store(),
                Err(e) => {
                    warn!("Failed to start coordination connection: {}", e);
                    let callback = {
                        let mut st = inner.state.lock();
                        st.manager_started = false;
                        st.startup_callback.take()
                    };
                    if let Some(callback) = callback {
                        callback.fail(e);
                    }
                }
            }
        });
    }

    /// Stop every announcer, then shut down the store and the connection.
    ///
    /// Idempotent. A start still waiting for its store fails with
    /// [`StoreError::Shutdown`].
    pub fn shutdown(&self, callback: Callback) {
        let pending_start = {
            let mut st = self.inner.state.lock();
            if st.shut_down {
                drop(st);
                callback.succeed();
                return;
            }
            st.shut_down = true;
            st.manager_started = false;
            st.store_started = false;
            st.store_ready = false;
            st.startup_callback.take()
        };

        if let Some(pending) = pending_start {
            pending.fail(StoreError::Shutdown);
        }

        info!("Shutting down connection manager");
        for announcer in &self.inner.announcers {
            announcer.shutdown();
        }

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Some(store) = inner.store.swap(None) {
                if let Err(e) = store.store().shutdown().await {
                    warn!("Failed to shut down discovery store: {}", e);
                }
            }
            let result = inner.connection.shutdown().await.map_err(AnnounceError::from);
            callback.logged("connection manager shutdown").complete(result);
        });
    }

    /// Mark every announcer up. Without a callback the outcome is only logged.
    pub fn mark_up_all_servers(&self, callback: Option<Callback>) {
        let outer = callback.unwrap_or_else(|| Callback::logging("markUp of all servers"));
        let children = fan_in(self.inner.announcers.len(), outer);
        for (announcer, child) in self.inner.announcers.iter().zip(children) {
            announcer.mark_up(child);
        }
    }

    /// Mark every announcer down. Without a callback the outcome is only logged.
    pub fn mark_down_all_servers(&self, callback: Option<Callback>) {
        let outer = callback.unwrap_or_else(|| Callback::logging("markDown of all servers"));
        let children = fan_in(self.inner.announcers.len(), outer);
        for (announcer, child) in self.inner.announcers.iter().zip(children) {
            announcer.mark_down(child);
        }
    }

    pub fn announcers(&self) -> &[Announcer] {
        &self.inner.announcers
    }

    /// Store of the current session, if any.
    pub fn current_store(&self) -> Option<Arc<StoreHandle>> {
        self.inner.store.load_full()
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().manager_started
    }

    pub fn is_store_started(&self) -> bool {
        self.inner.state.lock().store_started
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("announcers", &self.inner.announcers.len())
            .field("store", &self.inner.store.load_full())
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn on_session_established(self: &Arc<Self>) {
        let store = StoreHandle::new(self.store_factory.create_store());
        debug!("Session established, created store {:?}", store);
        if let Some(old) = self.store.swap(Some(store)) {
            self.shutdown_store_detached(old);
        }
        {
            let mut st = self.state.lock();
            st.store_ready = true;
            st.store_started = false;
        }
        self.try_start_store();
    }

    fn on_session_expired(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.store_started = false;
            st.store_ready = false;
        }
        if let Some(old) = self.store.swap(None) {
            info!("Session expired, discarding store {:?}", old);
            self.shutdown_store_detached(old);
        }
    }

    fn on_reconnected(self: &Arc<Self>) {
        let store_started = self.state.lock().store_started;
        if !store_started {
            self.try_start_store();
            return;
        }

        info!("Reconnected, retrying interrupted announcements");
        for announcer in &self.announcers {
            let label = format!(
                "retry of {} in {}",
                announcer
                    .address()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                announcer.cluster()
            );
            announcer.retry(Callback::logging(label));
        }
    }

    fn shutdown_store_detached(&self, store: Arc<StoreHandle>) {
        self.runtime.spawn(async move {
            if let Err(e) = store.store().shutdown().await {
                debug!("Shutdown of discarded store {:?} failed: {}", store, e);
            }
        });
    }

    fn try_start_store(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.shut_down
                || !(st.manager_started && st.store_ready)
                || st.store_started
                || st.store_starting
            {
                return;
            }
            st.store_starting = true;
        }
        self.start_store();
    }

    fn start_store(self: &Arc<Self>) {
        let Some(store) = self.store.load_full() else {
            self.state.lock().store_starting = false;
            return;
        };

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = store.store().start().await;

            let startup = {
                let mut st = inner.state.lock();
                st.store_starting = false;

                if st.shut_down || !st.manager_started {
                    debug!("Store {:?} started after manager shutdown", store);
                    return;
                }

                let current = inner.store.load_full().map(|s| s.generation());
                if current != Some(store.generation()) {
                    drop(st);
                    debug!("Store {:?} replaced while starting", store);
                    // The replacement was skipped while this start was in flight.
                    inner.try_start_store();
                    return;
                }

                match &result {
                    Ok(()) => {
                        st.store_started = true;
                        st.startup_callback.take()
                    }
                    // The startup callback waits for the store of the next attempt.
                    Err(e) if e.is_transient() => None,
                    Err(_) => st.startup_callback.take(),
                }
            };

            match result {
                Ok(()) => {
                    info!(
                        "Store {:?} started, starting {} announcers",
                        store,
                        inner.announcers.len()
                    );
                    for announcer in &inner.announcers {
                        announcer.set_store(&store);
                    }
                    let outer = startup.unwrap_or_else(|| Callback::logging("announcer start"));
                    let children = fan_in(inner.announcers.len(), outer);
                    for (announcer, child) in inner.announcers.iter().zip(children) {
                        announcer.start(child);
                    }
                }
                Err(e) if e.is_transient() => {
                    info!("Store start interrupted ({}), waiting for reconnect", e);
                }
                Err(e) => {
                    warn!("Failed to start discovery store: {}", e);
                    if let Some(callback) = startup {
                        callback.fail(e);
                    }
                }
            }
        });
    }
}

struct LifecycleListener {
    manager: Weak<ManagerInner>,
}

impl ConnectionListener for LifecycleListener {
    fn on_event(&self, event: ConnectionEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        debug!("Connection event: {:?}", event);
        match event {
            ConnectionEvent::SessionEstablished => manager.on_session_established(),
            ConnectionEvent::SessionExpired => manager.on_session_expired(),
            ConnectionEvent::Reconnected => manager.on_reconnected(),
            ConnectionEvent::Disconnected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalConnection, LocalEnsemble};
    use url::Url;

    fn announcer(cluster: &str, host: &str) -> Announcer {
        Announcer::builder(cluster)
            .address(Url::parse(&format!("http://{}:8080/svc", host)).expect("url"))
            .build()
            .expect("runtime")
    }

    fn manager(announcers: Vec<Announcer>) -> (ConnectionManager, Arc<LocalConnection>) {
        let conn = Arc::new(LocalConnection::new(LocalEnsemble::new()));
        let factory = Arc::new(conn.store_factory());
        let manager = ConnectionManager::new(announcers, conn.clone(), factory).expect("runtime");
        (manager, conn)
    }

    #[test]
    fn test_new_outside_runtime() {
        let conn = Arc::new(LocalConnection::new(LocalEnsemble::new()));
        let factory = Arc::new(conn.store_factory());
        let result = ConnectionManager::new(Vec::new(), conn, factory);
        assert!(matches!(result, Err(AnnounceError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (manager, conn) = manager(vec![announcer("c1", "h1")]);

        let (cb, done) = Callback::channel();
        manager.start(cb);
        done.await.expect("started");
        assert!(manager.is_started());
        assert!(manager.is_store_started());
        assert!(manager.current_store().is_some());
        assert!(conn.session_id().is_some());

        let (cb, done) = Callback::channel();
        manager.shutdown(cb);
        done.await.expect("shut down");
        assert!(!manager.is_started());
        assert!(manager.current_store().is_none());
        assert!(conn.session_id().is_none());
        assert!(manager.announcers()[0].is_shutting_down());

        let (cb, done) = Callback::channel();
        manager.shutdown(cb);
        done.await.expect("second shutdown is a no-op");
    }

    #[tokio::test]
    async fn test_start_when_started_succeeds() {
        let (manager, _conn) = manager(vec![announcer("c1", "h1")]);

        let (cb, done) = Callback::channel();
        manager.start(cb);
        done.await.expect("started");

        let (cb, done) = Callback::channel();
        manager.start(cb);
        done.await.expect("already started");
    }

    #[tokio::test]
    async fn test_concurrent_start_rejected() {
        let (manager, _conn) = manager(vec![announcer("c1", "h1")]);

        let (first, first_done) = Callback::channel();
        let (second, second_done) = Callback::channel();
        manager.start(first);
        manager.start(second);

        assert!(matches!(
            second_done.await,
            Err(AnnounceError::AlreadyStarting)
        ));
        first_done.await.expect("first start");
    }

    #[tokio::test]
    async fn test_mark_up_all_with_no_announcers() {
        let (manager, _conn) = manager(Vec::new());
        let (cb, done) = Callback::channel();
        manager.mark_up_all_servers(Some(cb));
        done.await.expect("nothing to do");
    }

    #[tokio::test]
    async fn test_mark_up_and_down_all() {
        let (manager, conn) = manager(vec![announcer("c1", "h1"), announcer("c1", "h2")]);

        let (cb, done) = Callback::channel();
        manager.start(cb);
        done.await.expect("started");

        let (cb, done) = Callback::channel();
        manager.mark_up_all_servers(Some(cb));
        done.await.expect("all up");
        let props = conn.ensemble().uri_properties("c1").expect("cluster");
        assert_eq!(props.len(), 2);

        let (cb, done) = Callback::channel();
        manager.mark_down_all_servers(Some(cb));
        done.await.expect("all down");
        let props = conn.ensemble().uri_properties("c1").expect("cluster");
        assert!(props.is_empty());
    }
}
