//! Work queue over sequential child nodes
//!
//! Entries are sequential children of the queue path, so their names order them by
//! creation. A consumer takes an entry in two steps:
//! 1. [`next()`](DistributedQueue::next) claims the lowest entry of its snapshot by
//!    creating an ephemeral `claim` child under it
//! 2. [`consume()`](DistributedQueue::consume) buffers the deletion of the marker
//!    and the entry into a write request, so both vanish together on commit
//!
//! There is no lease. An entry claimed by a consumer that never consumes it stays
//! claimed for as long as that consumer's session lives, and no other consumer
//! will see it. Only the end of the session removes the marker.
//!
//! Instances keep local claim state and must not be shared between tasks. Run
//! concurrent consumers as separate instances.


use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::join_path;
use crate::metrics::QUEUE_CLAIMS;
use crate::utils::scoped_timer::ScopedTimer;
use crate::Connection;
use crate::CreateOptions;
use crate::Error;
use crate::Result;
use crate::Value;
use crate::WriteTransaction;

const ENTRY_PREFIX: &str = "item-";
const CLAIM_MARKER: &str = "claim";

/// Claim bookkeeping of one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// Nothing returned yet, or the previous item was skipped
    Idle,
    /// Entry returned by `next()`, not yet consumed
    Claimed(String),
    /// `consume()` buffered the deletion of this entry
    Consumed(String),
}

pub struct DistributedQueue<T> {
    conn: Arc<Connection>,
    path: String,
    entry_options: CreateOptions,
    cached: VecDeque<String>,
    state: ClaimState,
    _payload: PhantomData<fn() -> T>,
}

impl<T> DistributedQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(
        conn: Arc<Connection>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            path: path.into(),
            entry_options: CreateOptions::default().ephemeral().sequence(),
            cached: VecDeque::new(),
            state: ClaimState::Idle,
            _payload: PhantomData,
        }
    }

    /// Entries outlive their producer's session. Needed on services that refuse
    /// children under ephemeral nodes.
    pub fn with_persistent_entries(mut self) -> Self {
        self.entry_options = CreateOptions::default().sequence();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> &ClaimState {
        &self.state
    }

    /// Creates the queue node (and parents) unless it already exists
    pub async fn ensure_path(&self) -> Result<()> {
        let mut txn = self.conn.transaction(format!("create queue {}", self.path));
        txn.create(&self.path, &Value::<()>::Empty, CreateOptions::default().recursive())?;
        match txn.commit().await {
            Ok(_) | Err(Error::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Buffers a new entry carrying `value` into `txn`
    pub fn put(
        &self,
        txn: &mut WriteTransaction<'_>,
        value: &T,
    ) -> Result<()> {
        let entry = join_path(&self.path, ENTRY_PREFIX);
        txn.create(&entry, &Value::Data(value), self.entry_options)?;
        Ok(())
    }

    /// Claims and returns the next entry, or `None` once no claimable entry is left.
    ///
    /// Never waits for new entries. The service is listed at most once per call;
    /// entries claimed by other consumers or removed meanwhile are skipped.
    ///
    /// # Errors
    /// [`Error::EmptyEntry`] if the claimed entry has no payload. The entry stays
    /// claimed and [`consume`](Self::consume) discards it.
    pub async fn next(&mut self) -> Result<Option<T>> {
        let _timer = ScopedTimer::new("queue::next");
        match std::mem::replace(&mut self.state, ClaimState::Idle) {
            ClaimState::Idle => {}
            ClaimState::Consumed(child) => self.forget(&child),
            ClaimState::Claimed(child) => {
                warn!(queue = %self.path, entry = %child, "entry claimed but never consumed, claim leaked");
                self.forget(&child);
            }
        }

        let mut refreshed = false;
        loop {
            if self.cached.is_empty() {
                if refreshed {
                    return Ok(None);
                }
                self.refresh().await?;
                refreshed = true;
                if self.cached.is_empty() {
                    return Ok(None);
                }
            }

            let child = match self.cached.front() {
                Some(child) => child.clone(),
                None => continue,
            };
            let entry = join_path(&self.path, &child);
            if !self.claim(&entry).await? {
                self.cached.pop_front();
                continue;
            }

            match self.conn.get::<T>(&entry).await {
                Ok(Value::Data(value)) => {
                    QUEUE_CLAIMS.with_label_values(&[&self.path, "claimed"]).inc();
                    debug!(queue = %self.path, entry = %child, "entry claimed");
                    self.state = ClaimState::Claimed(child);
                    return Ok(Some(value));
                }
                Ok(Value::Empty) => {
                    self.state = ClaimState::Claimed(child);
                    return Err(Error::EmptyEntry { path: entry });
                }
                Err(Error::NoNode { .. }) => {
                    QUEUE_CLAIMS.with_label_values(&[&self.path, "vanished"]).inc();
                    trace!(queue = %self.path, entry = %child, "entry vanished after claim");
                    self.cached.pop_front();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Buffers removal of the last claimed entry and its marker into `txn`.
    ///
    /// # Errors
    /// [`Error::NothingClaimed`] unless the last `next()` returned an entry that was
    /// not consumed yet.
    pub fn consume(
        &mut self,
        txn: &mut WriteTransaction<'_>,
    ) -> Result<()> {
        let child = match &self.state {
            ClaimState::Claimed(child) => child.clone(),
            _ => {
                return Err(Error::NothingClaimed {
                    queue: self.path.clone(),
                })
            }
        };
        let entry = join_path(&self.path, &child);
        txn.delete(&join_path(&entry, CLAIM_MARKER), false);
        txn.delete(&entry, false);
        self.state = ClaimState::Consumed(child);
        Ok(())
    }

    /// Entry count including claimed but unconsumed ones. A snapshot only.
    pub async fn len(&self) -> Result<usize> {
        self.conn.get_children_count(&self.path).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn refresh(&mut self) -> Result<()> {
        let mut children = self.conn.get_children(&self.path).await?;
        children.sort();
        trace!(queue = %self.path, entries = children.len(), "queue snapshot");
        self.cached = children.into();
        Ok(())
    }

    /// `false` if another consumer holds the entry or it is gone
    async fn claim(
        &self,
        entry: &str,
    ) -> Result<bool> {
        let mut txn = self.conn.transaction(format!("claim {entry}"));
        txn.create(
            &join_path(entry, CLAIM_MARKER),
            &Value::<()>::Empty,
            CreateOptions::default().ephemeral(),
        )?;
        match txn.commit().await {
            Ok(_) => Ok(true),
            Err(Error::NodeExists { .. }) => {
                QUEUE_CLAIMS.with_label_values(&[&self.path, "taken"]).inc();
                trace!(queue = %self.path, entry, "entry already claimed");
                Ok(false)
            }
            Err(Error::NoNode { .. }) => {
                QUEUE_CLAIMS.with_label_values(&[&self.path, "vanished"]).inc();
                trace!(queue = %self.path, entry, "entry vanished before claim");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn forget(
        &mut self,
        child: &str,
    ) {
        self.cached.retain(|c| c != child);
    }
}
