//! Buffered write requests
//!
//! A [`WriteTransaction`] collects create/set/delete operations and commits them in
//! one of two ways:
//! - exactly one operation: executed directly on the connection. This is the only
//!   path that can carry `recursive`.
//! - more than one operation: submitted as a single atomic batch. Either every
//!   operation is applied or none is.
//!
//! Dropping an uncommitted transaction discards its operations.


use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::WRITE_REQUESTS;
use crate::service::CreateMode;
use crate::service::Op;
use crate::service::OpOutcome;
use crate::service::ServiceError;
use crate::service::ServiceResult;
use crate::utils::scoped_timer::ScopedTimer;
use crate::Connection;
use crate::Error;
use crate::Result;
use crate::Value;

/// One buffered mutation, payload already encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
        /// Create missing parents
        recursive: bool,
    },
    Set {
        path: String,
        data: Vec<u8>,
    },
    Delete {
        path: String,
        /// Delete descendants first
        recursive: bool,
    },
}

impl WriteOp {
    pub fn path(&self) -> &str {
        match self {
            WriteOp::Create { path, .. } | WriteOp::Set { path, .. } | WriteOp::Delete { path, .. } => path,
        }
    }

    pub fn is_recursive(&self) -> bool {
        matches!(
            self,
            WriteOp::Create { recursive: true, .. } | WriteOp::Delete { recursive: true, .. }
        )
    }

    fn into_batch_op(self) -> Result<Op> {
        match self {
            WriteOp::Create { path, recursive: true, .. } | WriteOp::Delete { path, recursive: true } => {
                Err(Error::RecursiveInBatch { path })
            }
            WriteOp::Create { path, data, mode, .. } => Ok(Op::Create { path, data, mode }),
            WriteOp::Set { path, data } => Ok(Op::SetData { path, data }),
            WriteOp::Delete { path, .. } => Ok(Op::Delete { path }),
        }
    }
}

/// Flags of a buffered create
///
/// ```ignore
/// txn.create("/jobs/job-", &Value::Data(job), CreateOptions::default().ephemeral().sequence())?;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub ephemeral: bool,
    pub sequence: bool,
    pub recursive: bool,
}

impl CreateOptions {
    /// Node vanishes with the creating session
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Service appends a per-parent monotonically increasing suffix
    pub fn sequence(mut self) -> Self {
        self.sequence = true;
        self
    }

    /// Missing parents are created; the request must hold no other operation
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn mode(&self) -> CreateMode {
        CreateMode::new(self.ephemeral, self.sequence)
    }
}

/// Write request builder bound to a [`Connection`]
pub struct WriteTransaction<'a> {
    conn: &'a Connection,
    comment: String,
    ops: Vec<WriteOp>,
}

impl<'a> WriteTransaction<'a> {
    pub fn new(
        conn: &'a Connection,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            comment: comment.into(),
            ops: Vec::new(),
        }
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn create<T: Serialize>(
        &mut self,
        path: &str,
        value: &Value<T>,
        options: CreateOptions,
    ) -> Result<&mut Self> {
        let data = self.conn.format().encode(value)?;
        Ok(self.push(WriteOp::Create {
            path: path.to_string(),
            data,
            mode: options.mode(),
            recursive: options.recursive,
        }))
    }

    pub fn set<T: Serialize>(
        &mut self,
        path: &str,
        value: &Value<T>,
    ) -> Result<&mut Self> {
        let data = self.conn.format().encode(value)?;
        Ok(self.push(WriteOp::Set {
            path: path.to_string(),
            data,
        }))
    }

    pub fn delete(
        &mut self,
        path: &str,
        recursive: bool,
    ) -> &mut Self {
        self.push(WriteOp::Delete {
            path: path.to_string(),
            recursive,
        })
    }

    /// Appends an already encoded operation
    pub fn push(
        &mut self,
        op: WriteOp,
    ) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Applies the buffered operations.
    ///
    /// Returns one [`OpOutcome`] per operation, in buffer order. Created paths carry
    /// the sequence suffix assigned by the service.
    ///
    /// # Errors
    /// - [`Error::EmptyTransaction`] if nothing was buffered
    /// - [`Error::RecursiveInBatch`] if a recursive operation shares the request
    /// - the translated error of the failing operation; a batch is then fully rolled back
    /// - [`Error::Fatal`] if the batch reports an inconsistency without any error
    ///   explaining it
    pub async fn commit(self) -> Result<Vec<OpOutcome>> {
        let _timer = ScopedTimer::new("transaction::commit");
        let WriteTransaction { conn, comment, ops } = self;
        if ops.is_empty() {
            return Err(Error::EmptyTransaction { comment });
        }

        info!(comment = %comment, ops = ops.len(), "write request begin");
        let (kind, result) = if ops.len() == 1 {
            let op = &ops[0];
            ("direct", conn.execute(op).await.map(|outcome| vec![outcome]))
        } else {
            ("batch", commit_batch(conn, ops).await)
        };

        match &result {
            Ok(outcomes) => {
                WRITE_REQUESTS.with_label_values(&[kind, "ok"]).inc();
                info!(comment = %comment, path = kind, applied = outcomes.len(), "write request end");
            }
            Err(e) => {
                WRITE_REQUESTS.with_label_values(&[kind, "failed"]).inc();
                warn!(comment = %comment, path = kind, "write request failed: {}", e);
            }
        }
        result
    }
}

async fn commit_batch(
    conn: &Connection,
    ops: Vec<WriteOp>,
) -> Result<Vec<OpOutcome>> {
    let batch = ops.into_iter().map(WriteOp::into_batch_op).collect::<Result<Vec<_>>>()?;
    let results = conn.multi(batch).await?;
    scan_batch_results(results)
}

/// Reverse scan of per-op batch results.
///
/// `RuntimeInconsistency` only marks operations following the one that failed, so
/// the first other error met from the end is the cause and is returned. Markers
/// with no error behind them mean the batch result itself is corrupt.
pub(crate) fn scan_batch_results(results: Vec<ServiceResult<OpOutcome>>) -> Result<Vec<OpOutcome>> {
    let mut inconsistent = false;
    let mut outcomes = Vec::with_capacity(results.len());
    for result in results.into_iter().rev() {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(ServiceError::RuntimeInconsistency) => {
                debug!("runtime inconsistency marker in batch result");
                inconsistent = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if inconsistent {
        return Err(Error::Fatal(
            "batch reported a runtime inconsistency without a failing operation".to_string(),
        ));
    }
    outcomes.reverse();
    Ok(outcomes)
}
