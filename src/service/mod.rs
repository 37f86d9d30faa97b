//! Coordination service seam
//!
//! The wire protocol of the coordination service is an external dependency. This
//! module describes it at the level the client recipes need: a session that can
//! read, create, update and delete nodes, register one-shot existence watches,
//! submit atomic multi-op batches and answer four-letter diagnostic commands.
//!
//! - [`CoordinationSession`] - one live session against the ensemble
//! - [`Connector`] - establishes sessions
//! - [`MemoryEnsemble`] - in-process implementation of both

mod memory;

pub use memory::*;


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// One-shot watch callback, delivered asynchronously off the caller's task
pub type WatchCallback = Box<dyn FnOnce(WatchedEvent) + Send + Sync + 'static>;

/// Native error codes reported by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    #[error("Node has children: {path}")]
    NotEmpty { path: String },

    /// Reported for batch operations following the one that failed
    #[error("Runtime inconsistency")]
    RuntimeInconsistency,

    /// Reported for batch operations preceding the one that failed
    #[error("Rolled back")]
    RolledBack,

    #[error("Connection lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Bad arguments: {0}")]
    BadArguments(String),
}

/// CreateMode value determines how the node is created on the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node survives the creating session.
    Persistent,
    /// The node is deleted when the creating session ends.
    Ephemeral,
    /// Persistent, with a per-parent monotonically increasing 10-digit suffix.
    PersistentSequential,
    /// Ephemeral, with a per-parent monotonically increasing 10-digit suffix.
    EphemeralSequential,
}

impl CreateMode {
    pub fn new(
        ephemeral: bool,
        sequential: bool,
    ) -> Self {
        match (ephemeral, sequential) {
            (false, false) => CreateMode::Persistent,
            (true, false) => CreateMode::Ephemeral,
            (false, true) => CreateMode::PersistentSequential,
            (true, true) => CreateMode::EphemeralSequential,
        }
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// Statistics about a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// The transaction ID that created the node.
    pub czxid: i64,
    /// The last transaction that modified the node.
    pub mzxid: i64,
    /// The number of changes to the data of the node.
    pub version: i32,
    /// The number of changes to the children of the node.
    pub cversion: i32,
    /// The session ID of the owner of this node, if it is ephemeral, otherwise 0.
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: WatchedEventKind,
    /// Path as seen by the watching session (chroot stripped)
    pub path: String,
}

/// One operation of an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
    },
    Delete {
        path: String,
    },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. } | Op::SetData { path, .. } | Op::Delete { path } => path,
        }
    }
}

/// Successful result of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// Actual path of the created node (carries the sequence suffix if any)
    Created(String),
    SetData(Stat),
    Deleted,
}

/// Parameters used to start a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    /// `host:port` strings, tried in order
    pub hosts: Vec<String>,
    pub session_timeout: Duration,
    /// Prefix under which every path of the session is rooted
    pub chroot: Option<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    async fn get_data(
        &self,
        path: &str,
    ) -> ServiceResult<(Vec<u8>, Stat)>;

    /// Returns the node's stat if present. A supplied watch fires once on the
    /// next creation, deletion or data change of `path`.
    async fn exists(
        &self,
        path: &str,
        watch: Option<WatchCallback>,
    ) -> ServiceResult<Option<Stat>>;

    async fn get_children(
        &self,
        path: &str,
    ) -> ServiceResult<Vec<String>>;

    /// Returns the actual path of the created node.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_path: bool,
    ) -> ServiceResult<String>;

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> ServiceResult<Stat>;

    async fn delete(
        &self,
        path: &str,
    ) -> ServiceResult<()>;

    /// Applies all operations atomically. The outer error reports a failure of the
    /// request itself; per-operation failures are reported in the ordered results.
    async fn multi(
        &self,
        ops: Vec<Op>,
    ) -> ServiceResult<Vec<ServiceResult<OpOutcome>>>;

    /// Issues a plaintext four-letter diagnostic command (`envi`, `mntr`, ...)
    async fn four_letter_word(
        &self,
        command: &str,
    ) -> ServiceResult<String>;

    fn session_id(&self) -> i64;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> ServiceResult<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        params: &SessionParams,
    ) -> ServiceResult<Arc<dyn CoordinationSession>>;
}

impl fmt::Debug for dyn CoordinationSession {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CoordinationSession")
            .field("session_id", &self.session_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
