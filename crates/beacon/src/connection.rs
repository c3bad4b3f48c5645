// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Coordination-service connection lifecycle.

use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Lifecycle events of a coordination-service connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new session was established. Ephemeral state of any earlier session
    /// is gone.
    SessionEstablished,
    /// The session expired; its ephemeral nodes have been removed.
    SessionExpired,
    /// The connection came back within the existing session.
    Reconnected,
    /// The connection dropped; the session may still be alive.
    Disconnected,
}

/// Receives connection lifecycle events, on whatever thread raised them.
pub trait ConnectionListener: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

/// Connection to the coordination service.
#[async_trait]
pub trait CoordinationConnection: Send + Sync {
    /// Connect and open a session.
    async fn start(&self) -> Result<(), StoreError>;

    /// Close the session and the connection.
    async fn shutdown(&self) -> Result<(), StoreError>;

    /// Register a lifecycle listener.
    fn add_listener(&self, listener: Arc<dyn ConnectionListener>);
}

/// Listener registry shared by connection implementations.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener, outside the registry lock.
    pub fn notify(&self, event: ConnectionEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}
