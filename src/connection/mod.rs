//! Session lifecycle and primitive reads
//!
//! [`Connection`] owns one session against the coordination ensemble:
//! - [`open()`](Connection::open) bootstraps the chroot and starts the session with
//!   bounded or unbounded retries
//! - reads ([`get`](Connection::get), [`exists`](Connection::exists),
//!   [`get_children`](Connection::get_children)) decode payloads and translate
//!   service errors into [`crate::Error`]
//! - every mutation goes through a [`WriteTransaction`]
//!
//! # Basic Usage
//! ```ignore
//! let ensemble = MemoryEnsemble::new();
//! let conn = Connection::new(Arc::new(ensemble), CoordinatorConfig::default());
//! conn.open().await?;
//!
//! conn.write("register worker", |txn| {
//!     txn.create("/workers/w1", &Value::Data("idle"), CreateOptions::default().ephemeral())?;
//!     Ok(())
//! })
//! .await?;
//!
//! let state: Value<String> = conn.get("/workers/w1").await?;
//! ```

mod server_info;

pub use server_info::*;

#[cfg(test)]
mod server_info_test;

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::service::Connector;
use crate::service::CoordinationSession;
use crate::service::CreateMode;
use crate::service::Op;
use crate::service::OpOutcome;
use crate::service::ServiceError;
use crate::service::ServiceResult;
use crate::service::SessionParams;
use crate::service::WatchCallback;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::utils::scoped_timer::ScopedTimer;
use crate::CoordinatorConfig;
use crate::Error;
use crate::PayloadFormat;
use crate::Result;
use crate::Value;
use crate::WriteOp;
use crate::WriteTransaction;

const ENVIRONMENT_COMMAND: &str = "envi";
const MONITOR_COMMAND: &str = "mntr";

/// Client connection to the coordination ensemble
///
/// Public operations may be called from any task; the connection adds no locking
/// beyond what the session provides.
pub struct Connection {
    connector: Arc<dyn Connector>,
    config: CoordinatorConfig,
    active: ArcSwapOption<ActiveSession>,
}

struct ActiveSession {
    session: Arc<dyn CoordinationSession>,
    hosts: Vec<String>,
}

impl Connection {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            connector,
            config,
            active: ArcSwapOption::empty(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn format(&self) -> PayloadFormat {
        self.config.codec
    }

    /// Starts the session.
    ///
    /// If a chroot is configured it is first created (with parents) through a
    /// throwaway session; a concurrent creation by another client is tolerated.
    ///
    /// # Errors
    /// - [`Error::AlreadyOpened`] if a session is active, or another `open()` on this
    ///   connection finished first (its session is kept, this one is closed)
    /// - the last connection error once bounded retries are exhausted
    pub async fn open(&self) -> Result<()> {
        if self.is_opened() {
            return Err(Error::AlreadyOpened);
        }
        let connection = &self.config.connection;

        let mut hosts = connection.hosts.clone();
        if connection.randomize_hosts {
            hosts.shuffle(&mut rand::thread_rng());
        }

        if let Some(chroot) = &connection.chroot {
            self.ensure_chroot(&hosts, chroot).await?;
        }

        let params = SessionParams {
            hosts: hosts.clone(),
            session_timeout: connection.session_timeout(),
            chroot: connection.chroot.clone(),
        };
        info!(?hosts, chroot = ?connection.chroot, "connecting to coordination service");
        let session = self.connect(&params).await?;
        let session_id = session.session_id();

        let vacant: Option<Arc<ActiveSession>> = None;
        let candidate = Arc::new(ActiveSession {
            session: session.clone(),
            hosts: hosts.clone(),
        });
        let previous = self.active.compare_and_swap(&vacant, Some(candidate));
        if previous.is_some() {
            warn!(session_id, "concurrent open won the race, closing surplus session");
            if let Err(e) = session.close().await {
                warn!(session_id, "closing surplus session failed: {}", e);
            }
            return Err(Error::AlreadyOpened);
        }
        info!(session_id, ?hosts, "coordination session started");
        Ok(())
    }

    async fn ensure_chroot(
        &self,
        hosts: &[String],
        chroot: &str,
    ) -> Result<()> {
        let params = SessionParams {
            hosts: hosts.to_vec(),
            session_timeout: self.config.connection.session_timeout(),
            chroot: None,
        };
        let bootstrap = self.connect(&params).await?;
        let created = bootstrap.create(chroot, Vec::new(), CreateMode::Persistent, true).await;
        if let Err(e) = bootstrap.close().await {
            warn!("closing chroot bootstrap session failed: {}", e);
        }
        match created {
            Ok(_) => {
                info!(chroot, "chroot created");
                Ok(())
            }
            Err(ServiceError::NodeExists { .. }) => {
                debug!(chroot, "chroot already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn connect(
        &self,
        params: &SessionParams,
    ) -> Result<Arc<dyn CoordinationSession>> {
        let connector = self.connector.clone();
        let session = task_with_timeout_and_exponential_backoff(
            || {
                let connector = connector.clone();
                async move {
                    debug!(hosts = ?params.hosts, "connect attempt");
                    connector.connect(params).await
                }
            },
            self.config.retry,
        )
        .await?;
        Ok(session)
    }

    /// Stops the session.
    ///
    /// # Errors
    /// [`Error::NotOpened`] when called on a client that was never opened or is
    /// already closed.
    pub async fn close(&self) -> Result<()> {
        let active = self.active.swap(None).ok_or(Error::NotOpened)?;
        let session_id = active.session.session_id();
        active.session.close().await?;
        info!(session_id, hosts = ?active.hosts, "coordination session closed");
        Ok(())
    }

    /// Structural check: a session has been started and not closed
    pub fn is_opened(&self) -> bool {
        self.active.load().is_some()
    }

    /// Live check: the session is currently connected
    pub fn is_alive(&self) -> bool {
        self.active
            .load_full()
            .map(|a| a.session.is_connected())
            .unwrap_or(false)
    }

    pub fn session_id(&self) -> Result<i64> {
        Ok(self.session()?.session_id())
    }

    pub(crate) fn session(&self) -> Result<Arc<dyn CoordinationSession>> {
        self.active
            .load_full()
            .map(|a| a.session.clone())
            .ok_or(Error::NotOpened)
    }

    /// Returns the decoded value of `path`.
    ///
    /// # Errors
    /// [`Error::NoNode`] if the node is absent
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Value<T>> {
        let _timer = ScopedTimer::new("connection::get");
        let (data, _stat) = self.session()?.get_data(path).await?;
        self.format().decode(&data)
    }

    /// Returns the decoded value of `path`, or `default` if the node is absent
    pub async fn get_or<T: DeserializeOwned>(
        &self,
        path: &str,
        default: Value<T>,
    ) -> Result<Value<T>> {
        match self.get(path).await {
            Err(Error::NoNode { .. }) => Ok(default),
            other => other,
        }
    }

    /// Presence check. A supplied `watch` fires once, asynchronously, on the next
    /// creation, deletion or data change of `path`.
    pub async fn exists(
        &self,
        path: &str,
        watch: Option<WatchCallback>,
    ) -> Result<bool> {
        let stat = self.session()?.exists(path, watch).await?;
        Ok(stat.is_some())
    }

    pub async fn get_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        let _timer = ScopedTimer::new("connection::get_children");
        Ok(self.session()?.get_children(path).await?)
    }

    pub async fn get_children_count(
        &self,
        path: &str,
    ) -> Result<usize> {
        Ok(self.get_children(path).await?.len())
    }

    /// Queries the `envi` and `mntr` diagnostic commands
    pub async fn get_server_info(&self) -> Result<ServerInfo> {
        let session = self.session()?;
        let environment = session.four_letter_word(ENVIRONMENT_COMMAND).await?;
        let monitor = session.four_letter_word(MONITOR_COMMAND).await?;
        Ok(ServerInfo {
            environment: parse_diagnostic(&environment),
            monitor: parse_diagnostic(&monitor),
        })
    }

    /// Starts an empty write request. Nothing is sent until
    /// [`commit`](WriteTransaction::commit).
    pub fn transaction(
        &self,
        comment: impl Into<String>,
    ) -> WriteTransaction<'_> {
        WriteTransaction::new(self, comment)
    }

    /// Scoped write request: `f` buffers operations, which are committed when it
    /// returns `Ok`. An error from `f` skips the commit and is returned as is.
    pub async fn write<F, R>(
        &self,
        comment: impl Into<String>,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<R>,
    {
        let mut txn = self.transaction(comment);
        let r = f(&mut txn)?;
        txn.commit().await?;
        Ok(r)
    }

    /// Executes one operation directly, outside any batch. The only path that may
    /// carry `recursive`.
    pub(crate) async fn execute(
        &self,
        op: &WriteOp,
    ) -> Result<OpOutcome> {
        let session = self.session()?;
        match op {
            WriteOp::Create {
                path,
                data,
                mode,
                recursive,
            } => {
                let created = session.create(path, data.clone(), *mode, *recursive).await?;
                Ok(OpOutcome::Created(created))
            }
            WriteOp::Set { path, data } => Ok(OpOutcome::SetData(session.set_data(path, data.clone()).await?)),
            WriteOp::Delete { path, recursive: false } => {
                session.delete(path).await?;
                Ok(OpOutcome::Deleted)
            }
            WriteOp::Delete { path, recursive: true } => {
                delete_recursive(session.as_ref(), path).await?;
                Ok(OpOutcome::Deleted)
            }
        }
    }

    /// Submits an atomic batch; per-op results are returned untranslated
    pub(crate) async fn multi(
        &self,
        ops: Vec<Op>,
    ) -> Result<Vec<ServiceResult<OpOutcome>>> {
        Ok(self.session()?.multi(ops).await?)
    }
}

impl fmt::Debug for Connection {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Connection")
            .field("opened", &self.is_opened())
            .field("config", &self.config)
            .finish()
    }
}

/// Deletes `path` and its descendants, deepest first. Descendants removed
/// concurrently are skipped.
async fn delete_recursive(
    session: &dyn CoordinationSession,
    path: &str,
) -> Result<()> {
    let mut order = Vec::new();
    let mut pending = vec![path.to_string()];
    while let Some(current) = pending.pop() {
        match session.get_children(&current).await {
            Ok(children) => pending.extend(children.iter().map(|c| join_path(&current, c))),
            Err(ServiceError::NoNode { .. }) if current != path => continue,
            Err(e) => return Err(e.into()),
        }
        order.push(current);
    }

    for node in order.iter().rev() {
        match session.delete(node).await {
            Ok(()) => {}
            Err(ServiceError::NoNode { .. }) if node != path => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Joins a parent path and a child name
pub fn join_path(
    parent: &str,
    child: &str,
) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}
