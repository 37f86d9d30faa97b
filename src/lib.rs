//! # d-coord
//!
//! Client-side coordination recipes over a hierarchical, versioned coordination
//! service (ZooKeeper style: watches, ephemeral and sequential nodes, atomic multi-op
//! batches).
//!
//! - [`Connection`] - session lifecycle, chroot bootstrap, reads, error translation
//! - [`WriteTransaction`] - buffered writes, committed directly or as one atomic batch
//! - [`DistributedLock`] - ephemeral-node mutual exclusion with watch-driven waits
//! - [`DistributedQueue`] - ordered work queue with a claim-then-consume protocol
//!
//! The service itself is reached through the [`service::Connector`] and
//! [`service::CoordinationSession`] traits. [`service::MemoryEnsemble`] implements
//! both in process.
//!
//! ## Quick Start
//! ```ignore
//! use std::sync::Arc;
//!
//! use d_coord::service::MemoryEnsemble;
//! use d_coord::*;
//!
//! let config = CoordinatorConfig::new()?.validate()?;
//! let conn = Arc::new(Connection::new(Arc::new(MemoryEnsemble::new()), config));
//! conn.open().await?;
//!
//! let lock = DistributedLock::new(conn.clone(), "/locks/rebalance");
//! let guard = lock.lock().await?;
//! // ... critical section ...
//! guard.release().await?;
//! ```

mod codec;
mod config;
mod connection;
mod errors;
mod lock;
mod queue;
mod transaction;
mod utils;

pub mod metrics;
pub mod service;

pub use codec::*;
pub use config::*;
pub use connection::*;
pub use errors::*;
pub use lock::*;
pub use queue::*;
pub use transaction::*;
