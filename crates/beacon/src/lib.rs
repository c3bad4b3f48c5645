// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Beacon: service announcement for ephemeral-node coordination services.
//!
//! Advertises and withdraws the reachability of a service instance so that
//! other processes can discover live instances.
//!
//! # Features
//!
//! - **Serialized announcements**: one [`Announcer`] per (cluster, address)
//!   runs at most one store operation at a time and coalesces the rest
//! - **Dark warmup**: announce to a warmup cluster first, promote after a delay
//! - **Reconnect recovery**: operations interrupted by connection loss are
//!   re-driven by the [`ConnectionManager`] without caller involvement
//! - **In-process coordination service**: [`local`] for tests and drills
//!
//! # Quick Start
//!
//! ```no_run
//! use beacon::local::{LocalConnection, LocalEnsemble};
//! use beacon::{Announcer, Callback, ConnectionManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), beacon::AnnounceError> {
//! let connection = Arc::new(LocalConnection::new(LocalEnsemble::new()));
//! let factory = Arc::new(connection.store_factory());
//!
//! let announcer = Announcer::builder("profile-service")
//!     .address(url::Url::parse("http://10.0.0.12:8080/profile").expect("url"))
//!     .build()?;
//! let manager = ConnectionManager::new(vec![announcer], connection, factory)?;
//!
//! let (cb, started) = Callback::channel();
//! manager.start(cb);
//! started.await?;
//!
//! let (cb, up) = Callback::channel();
//! manager.mark_up_all_servers(Some(cb));
//! up.await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! name = "beacon-agent"
//!
//! [[announcers]]
//! cluster = "profile-service"
//! address = "http://10.0.0.12:8080/profile"
//! warmup_cluster = "profile-service-warmup"
//! warmup_enabled = true
//! warmup_duration_secs = 30
//! ```

pub mod announcer;
pub mod callback;
pub mod config;
pub mod connection;
pub mod error;
pub mod local;
pub mod manager;
pub mod properties;
pub mod scheduler;
pub mod store;

pub use announcer::{Announcer, AnnouncerBuilder, AnnouncerStatus, QueueDepths};
pub use callback::{fan_in, Callback, Completion};
pub use config::{AgentConfig, AnnouncerConfig, PartitionWeightConfig};
pub use connection::{ConnectionEvent, ConnectionListener, CoordinationConnection};
pub use error::{AnnounceError, ConfigError, Operation, StoreError};
pub use manager::ConnectionManager;
pub use properties::{PartitionData, PartitionWeights, UriProperties, UriSpecificProperties};
pub use scheduler::{Scheduler, TokioScheduler};
pub use store::{DiscoveryStore, StoreFactory, StoreHandle};
