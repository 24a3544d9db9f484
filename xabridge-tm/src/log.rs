//! Transaction-log contract and record model.
//!
//! A [`LogRecord`] is written after a successful prepare phase and before any
//! commit is sent; it is the durable commit decision. Records also accumulate
//! per-branch heuristic flags so recovery can tell which branches were
//! already completed out of band. The [`TxLog`] trait is the pluggable
//! storage seam; [`MemTxLog`] is the built-in backend used by default and in
//! tests.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use xabridge_core::xid::{BranchXid, GlobalXid};
use xabridge_core::Result;

// ============================================================================
// Record model
// ============================================================================

/// The coordinator's durable decision for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalDecision {
    /// All branches voted yes; commit them.
    Commit,
    /// Roll all branches back.
    Rollback,
}

impl fmt::Display for GlobalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalDecision::Commit => write!(f, "COMMIT"),
            GlobalDecision::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

/// How a branch was heuristically completed, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchHeuristic {
    /// The branch followed the coordinator's decision.
    #[default]
    None,
    /// The branch committed on its own.
    Commit,
    /// The branch rolled back on its own.
    Rollback,
    /// The branch partially committed and partially rolled back.
    Mixed,
}

/// One branch's entry in a log record.
#[derive(Debug, Clone, Copy)]
pub struct BranchDecision {
    /// The branch this entry covers.
    pub bxid: BranchXid,
    /// The branch's heuristic outcome, if any.
    pub heuristic: BranchHeuristic,
}

/// The durable record for one transaction.
#[derive(Debug, Clone)]
pub struct LogRecord {
    gxid: GlobalXid,
    branches: Vec<BranchDecision>,
    decision: GlobalDecision,
}

impl LogRecord {
    /// Creates a record covering `branches` with the given decision.
    pub fn new(gxid: GlobalXid, branches: Vec<BranchXid>, decision: GlobalDecision) -> Self {
        LogRecord {
            gxid,
            branches: branches
                .into_iter()
                .map(|bxid| BranchDecision {
                    bxid,
                    heuristic: BranchHeuristic::None,
                })
                .collect(),
            decision,
        }
    }

    /// The transaction this record covers.
    pub fn gxid(&self) -> &GlobalXid {
        &self.gxid
    }

    /// The recorded decision.
    pub fn decision(&self) -> GlobalDecision {
        self.decision
    }

    /// The branch entries.
    pub fn branches(&self) -> &[BranchDecision] {
        &self.branches
    }

    /// Marks a branch as heuristically completed, adding an entry if the
    /// branch is not yet listed.
    pub fn set_branch_heuristic(&mut self, bxid: &BranchXid, heuristic: BranchHeuristic) {
        if let Some(entry) = self.branches.iter_mut().find(|b| b.bxid == *bxid) {
            entry.heuristic = heuristic;
        } else {
            self.branches.push(BranchDecision {
                bxid: *bxid,
                heuristic,
            });
        }
    }

    /// Whether the branch was heuristically completed. `None` means this
    /// record does not list the branch at all.
    pub fn heuristic_branch(&self, bxid: &BranchXid) -> Option<bool> {
        self.branches
            .iter()
            .find(|b| b.bxid == *bxid)
            .map(|b| b.heuristic != BranchHeuristic::None)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [", self.gxid, self.decision)?;
        for (i, b) in self.branches.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", b.bxid)?;
            if b.heuristic != BranchHeuristic::None {
                write!(f, "({:?})", b.heuristic)?;
            }
        }
        write!(f, "]")
    }
}

// ============================================================================
// Log contract
// ============================================================================

/// The pluggable transaction-log backend.
///
/// Implementations must make `append` durable before returning; the
/// coordinator sends no commit until the decision is on record.
#[async_trait]
pub trait TxLog: Send + Sync {
    /// Opens the backend. Called once from manager init.
    async fn open(&self) -> Result<()>;

    /// Writes (or overwrites) the record for a transaction.
    async fn append(&self, record: &LogRecord) -> Result<()>;

    /// Persists a heuristic outcome for one branch; `record` is the
    /// caller's current view of the transaction including the new flag.
    async fn record_heuristic(&self, bxid: &BranchXid, record: &LogRecord) -> Result<()>;

    /// Fetches the record for a transaction, if one exists.
    async fn lookup(&self, gxid: &GlobalXid) -> Result<Option<LogRecord>>;

    /// Removes the record after a fully clean commit.
    async fn remove(&self, gxid: &GlobalXid) -> Result<()>;

    /// Removes a record during recovery reconciliation, once no live
    /// resource manager still references it.
    async fn reap(&self, gxid: &GlobalXid) -> Result<()>;

    /// Lists every record in the log.
    async fn list_all(&self) -> Result<Vec<LogRecord>>;

    /// Closes the backend. Called once from manager shutdown.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory log backend.
///
/// Survives nothing, which is fine for single-process brokers that prefer
/// redelivery over durable decisions, and for tests.
#[derive(Default)]
pub struct MemTxLog {
    records: Mutex<HashMap<GlobalXid, LogRecord>>,
}

impl MemTxLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TxLog for MemTxLog {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, record: &LogRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert(*record.gxid(), record.clone());
        Ok(())
    }

    async fn record_heuristic(&self, bxid: &BranchXid, record: &LogRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get_mut(record.gxid()) {
            Some(existing) => {
                for b in record.branches() {
                    if b.bxid == *bxid {
                        existing.set_branch_heuristic(bxid, b.heuristic);
                    }
                }
            }
            None => {
                records.insert(*record.gxid(), record.clone());
            }
        }
        Ok(())
    }

    async fn lookup(&self, gxid: &GlobalXid) -> Result<Option<LogRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(gxid).cloned())
    }

    async fn remove(&self, gxid: &GlobalXid) -> Result<()> {
        let mut records = self.records.lock().await;
        records.remove(gxid);
        Ok(())
    }

    async fn reap(&self, gxid: &GlobalXid) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.remove(gxid).is_some() {
            debug!(gxid = %gxid, "reaped log record");
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<LogRecord>> {
        let records = self.records.lock().await;
        Ok(records.values().cloned().collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
