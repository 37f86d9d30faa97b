//! Ephemeral-node mutual exclusion
//!
//! The lock is held while its node exists. The node is ephemeral, so a holder whose
//! session dies releases it implicitly. Waiters are woken by an existence watch on
//! the node; there is no polling and no fairness among waiters.
//!
//! One instance is meant to be driven by one task at a time. Run concurrent
//! contenders with separate instances (and separate connections) on the same path.

#[cfg(test)]
mod lock_test;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::LOCK_CONTENDED;
use crate::metrics::LOCK_WAIT_MS;
use crate::service::WatchedEvent;
use crate::utils::scoped_timer::ScopedTimer;
use crate::Connection;
use crate::CreateOptions;
use crate::Error;
use crate::Result;
use crate::Value;
use crate::WriteTransaction;

#[derive(Debug, Clone)]
pub struct DistributedLock {
    conn: Arc<Connection>,
    path: String,
}

impl DistributedLock {
    pub fn new(
        conn: Arc<Connection>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Suspends until the lock node is created by this session.
    ///
    /// There is no deadline; see [`acquire_timeout`](Self::acquire_timeout).
    pub async fn acquire(&self) -> Result<()> {
        let timer = ScopedTimer::new("lock::acquire");
        while !self.try_acquire().await? {
            LOCK_CONTENDED.with_label_values(&[&self.path]).inc();
            self.wait_for_release().await?;
        }
        LOCK_WAIT_MS
            .with_label_values(&[&self.path])
            .observe(timer.elapsed_ms());
        info!(lock = %self.path, "lock acquired");
        Ok(())
    }

    /// # Errors
    /// [`Error::Timeout`] if the lock was not obtained within `wait`
    pub async fn acquire_timeout(
        &self,
        wait: Duration,
    ) -> Result<()> {
        timeout(wait, self.acquire())
            .await
            .map_err(|_| Error::Timeout(format!("lock {} not acquired within {:?}", self.path, wait)))?
    }

    /// Single create attempt. `false` means another session holds the lock.
    pub async fn try_acquire(&self) -> Result<bool> {
        let mut txn = self.conn.transaction(format!("acquire lock {}", self.path));
        self.acquire_in(&mut txn, &Value::<()>::Empty)?;
        match txn.commit().await {
            Ok(_) => Ok(true),
            Err(Error::NodeExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acquires and returns a guard that releases on drop
    pub async fn lock(&self) -> Result<LockGuard> {
        self.acquire().await?;
        Ok(LockGuard {
            lock: self.clone(),
            released: false,
        })
    }

    /// Deletes the lock node. A node already gone counts as released.
    pub async fn release(&self) -> Result<()> {
        let mut txn = self.conn.transaction(format!("release lock {}", self.path));
        self.release_in(&mut txn);
        match txn.commit().await {
            Ok(_) => {}
            Err(Error::NoNode { .. }) => debug!(lock = %self.path, "lock node already gone"),
            Err(e) => return Err(e),
        }
        info!(lock = %self.path, "lock released");
        Ok(())
    }

    /// Best effort: the answer may be stale by the time it is returned
    pub async fn is_locked(&self) -> Result<bool> {
        self.conn.exists(&self.path, None).await
    }

    /// Buffers the lock creation into `txn`, so taking the lock commits atomically
    /// with the other operations of the request.
    pub fn acquire_in<T: Serialize>(
        &self,
        txn: &mut WriteTransaction<'_>,
        value: &Value<T>,
    ) -> Result<()> {
        txn.create(&self.path, value, CreateOptions::default().ephemeral())?;
        Ok(())
    }

    /// Buffers the lock deletion into `txn`
    pub fn release_in(
        &self,
        txn: &mut WriteTransaction<'_>,
    ) {
        txn.delete(&self.path, false);
    }

    /// Registers an existence watch and, if the node is still there, waits for it
    /// to fire. A node already gone at registration returns at once.
    async fn wait_for_release(&self) -> Result<()> {
        let notify = Arc::new(Notify::new());
        let waker = notify.clone();
        let present = self
            .conn
            .exists(
                &self.path,
                Some(Box::new(move |event: WatchedEvent| {
                    trace!(path = %event.path, kind = ?event.kind, "lock watch fired");
                    waker.notify_one();
                })),
            )
            .await?;

        if present {
            debug!(lock = %self.path, "lock held elsewhere, waiting for release");
            notify.notified().await;
        }
        Ok(())
    }
}

/// Held lock. Dropping it without [`release`](LockGuard::release) schedules a best
/// effort release on the current runtime.
#[derive(Debug)]
pub struct LockGuard {
    lock: DistributedLock,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &str {
        self.lock.path()
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release().await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release().await {
                        warn!(lock = %lock.path, "failed to release lock on drop: {}", e);
                    }
                });
            }
            Err(_) => warn!(lock = %lock.path, "no runtime to release lock on drop, left to session expiry"),
        }
    }
}
