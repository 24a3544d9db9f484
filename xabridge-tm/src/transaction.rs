//! The per-transaction two-phase-commit driver.
//!
//! A [`Transaction`] is an owned handle returned by
//! [`TransactionManager::begin`](crate::manager::TransactionManager::begin).
//! Resources are enlisted while the transaction is active, delisted once
//! their work is done, and then the handle's `commit`/`rollback` drives all
//! participants to completion. With two or more participants the commit
//! decision is made durable in the transaction log between the prepare and
//! commit phases; a single participant takes the one-phase shortcut and
//! never touches the log.
//!
//! Completion continues past individual participant failures and surfaces
//! the most informative one: mixed heuristics beat a heuristic rollback,
//! which beats a heuristic commit, which beats a generic error.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use xabridge_core::xa::{XaResource, XA_TMFAIL, XA_TMNOFLAGS, XA_TMSUCCESS};
use xabridge_core::xid::{BranchXid, GlobalXid};
use xabridge_core::{Result, TxError};

use crate::log::{BranchHeuristic, GlobalDecision, LogRecord};
use crate::manager::TmCore;
use crate::participant::Participant;

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting enlist/delist calls.
    Active,
    /// The only possible outcome is rollback.
    MarkedRollback,
    /// Prepare phase in progress.
    Preparing,
    /// All participants voted to commit.
    Prepared,
    /// Commit phase in progress.
    Committing,
    /// The commit phase ran; some branches may have failed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// The rollback phase ran; some branches may have failed.
    RolledBack,
    /// Cleanly completed; the handle is spent.
    NoTransaction,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::MarkedRollback => "MARKED_ROLLBACK",
            TransactionState::Preparing => "PREPARING",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RollingBack => "ROLLING_BACK",
            TransactionState::RolledBack => "ROLLEDBACK",
            TransactionState::NoTransaction => "NO_TRANSACTION",
        };
        write!(f, "{}", s)
    }
}

/// One distributed transaction and its enlisted participants.
pub struct Transaction {
    gxid: GlobalXid,
    state: TransactionState,
    core: Arc<TmCore>,
    participants: Vec<Participant>,
    associated: Vec<Arc<dyn XaResource>>,
    branch_count: u8,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("gxid", &self.gxid)
            .field("state", &self.state)
            .field("participants", &self.participants.len())
            .field("associated", &self.associated.len())
            .field("branch_count", &self.branch_count)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(gxid: GlobalXid, core: Arc<TmCore>) -> Self {
        Transaction {
            gxid,
            state: TransactionState::Active,
            core,
            participants: Vec::new(),
            associated: Vec::new(),
            branch_count: 0,
        }
    }

    /// The transaction's global xid.
    pub fn gxid(&self) -> &GlobalXid {
        &self.gxid
    }

    /// The current lifecycle state.
    pub fn status(&self) -> TransactionState {
        self.state
    }

    /// The enlisted participants, in enlistment order.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Enlists a resource: allocates the next branch xid, wraps the handle
    /// as a participant and starts its branch.
    pub async fn enlist(&mut self, resource: Arc<dyn XaResource>) -> Result<()> {
        debug!(txn = %self, "enlist resource");
        if self.state == TransactionState::MarkedRollback {
            return Err(TxError::RollbackOnly(self.to_string()));
        }
        if self.state != TransactionState::Active {
            return Err(TxError::IllegalTransactionState(format!(
                "enlist in {}",
                self
            )));
        }
        if self
            .participants
            .iter()
            .any(|p| Arc::ptr_eq(p.resource(), &resource))
        {
            return Err(TxError::AlreadyEnlisted(format!(
                "resource already enlisted in {}",
                self
            )));
        }

        let rm_name = match self.core.resolve_rm(&resource).await {
            Some(name) => name,
            None => {
                self.state = TransactionState::MarkedRollback;
                return Err(TxError::UnknownResourceManager(format!(
                    "no RM registered for resource of type {}",
                    resource.resource_type()
                )));
            }
        };

        let seq = self.next_branch_seq()?;
        let bxid = BranchXid::new(&self.gxid, &rm_name, resource.resource_type(), seq)?;
        let mut party = Participant::new(rm_name, resource.clone(), bxid);

        match party.start(XA_TMNOFLAGS).await {
            Ok(()) => {
                self.participants.push(party);
                self.associated.push(resource);
                Ok(())
            }
            Err(e) => {
                // The branch never carried any work; drop it rather than
                // leaving an unstartable participant behind.
                self.state = TransactionState::MarkedRollback;
                Err(e)
            }
        }
    }

    /// Delists a resource, ending its branch. Once the `end` call has been
    /// attempted the handle is always removed from the associated set; a
    /// rollback-required or error response marks the transaction
    /// rollback-only instead of failing the delist.
    pub async fn delist(&mut self, resource: &Arc<dyn XaResource>, for_failure: bool) -> Result<()> {
        debug!(txn = %self, for_failure, "delist resource");
        if self.state != TransactionState::Active && self.state != TransactionState::MarkedRollback
        {
            return Err(TxError::IllegalTransactionState(format!(
                "delist in {}",
                self
            )));
        }
        let pos = match self
            .associated
            .iter()
            .position(|r| Arc::ptr_eq(r, resource))
        {
            Some(pos) => pos,
            None => {
                return Err(TxError::IllegalTransactionState(format!(
                    "resource not associated to {}",
                    self
                )))
            }
        };
        let flags = if for_failure || self.state == TransactionState::MarkedRollback {
            XA_TMFAIL
        } else {
            XA_TMSUCCESS
        };

        let party = self
            .participants
            .iter()
            .position(|p| Arc::ptr_eq(p.resource(), resource));
        let result = match party {
            Some(i) => self.participants[i].end(flags).await,
            None => Err(TxError::IllegalTransactionState(format!(
                "resource has no participant in {}",
                self
            ))),
        };
        self.associated.remove(pos);
        match result {
            Ok(()) => Ok(()),
            Err(TxError::RollbackOnly(reason)) => {
                debug!(txn = %self, %reason, "delist marked transaction rollback-only");
                self.state = TransactionState::MarkedRollback;
                Ok(())
            }
            Err(e) => {
                warn!(txn = %self, error = %e, "delist failed; marking rollback-only");
                self.state = TransactionState::MarkedRollback;
                Ok(())
            }
        }
    }

    /// Commits the transaction: one-phase with a single participant,
    /// otherwise prepare-all, durable decision, commit-all.
    pub async fn commit(&mut self) -> Result<()> {
        debug!(txn = %self, "commit");
        if self.state == TransactionState::MarkedRollback {
            if let Err(e) = self.rollback_work().await {
                warn!(txn = %self, error = %e, "rollback of marked transaction failed");
            }
            return Err(TxError::RolledBack(self.to_string()));
        }
        if self.state != TransactionState::Active {
            return Err(TxError::IllegalTransactionState(format!(
                "commit in {}",
                self
            )));
        }
        if !self.associated.is_empty() {
            return Err(TxError::IllegalTransactionState(format!(
                "{} undelisted resources in {}",
                self.associated.len(),
                self
            )));
        }

        let one_phase = self.participants.len() <= 1;
        if !one_phase {
            self.state = TransactionState::Preparing;
            let mut prepared_one = false;
            for i in 0..self.participants.len() {
                match self.participants[i].prepare().await {
                    Ok(()) => prepared_one = true,
                    Err(e) if !prepared_one => {
                        self.state = TransactionState::MarkedRollback;
                        return Err(e);
                    }
                    Err(e) => {
                        self.state = TransactionState::MarkedRollback;
                        if let Err(re) = self.rollback_work().await {
                            warn!(txn = %self, error = %re,
                                "rollback after prepare failure itself failed");
                        }
                        return Err(TxError::RolledBack(format!("{}: {}", self, e)));
                    }
                }
            }
            self.state = TransactionState::Prepared;

            // Durable decision point: no commit is sent until this record
            // is on storage.
            let record = LogRecord::new(
                self.gxid,
                self.participants.iter().map(|p| *p.bxid()).collect(),
                GlobalDecision::Commit,
            );
            if let Err(e) = self.core.txlog.append(&record).await {
                error!(txn = %self, error = %e, "unable to log commit decision");
                self.state = TransactionState::MarkedRollback;
                if let Err(re) = self.rollback_work().await {
                    warn!(txn = %self, error = %re,
                        "rollback after log failure itself failed");
                }
                return Err(TxError::RolledBack(format!("{}: {}", self, e)));
            }
        }

        self.state = TransactionState::Committing;
        let mut agg: Option<TxError> = None;
        let mut committed_one = false;
        for i in 0..self.participants.len() {
            let bxid = *self.participants[i].bxid();
            match self.participants[i].commit(one_phase).await {
                Ok(()) => committed_one = true,
                Err(e @ TxError::IllegalParticipantState(_)) => {
                    if !committed_one {
                        return Err(e);
                    }
                    agg = prefer(agg, e);
                }
                Err(TxError::RollbackOnly(reason)) => {
                    // Only reported on one-phase commit.
                    self.state = TransactionState::RolledBack;
                    return Err(TxError::RolledBack(format!("{}: {}", self, reason)));
                }
                Err(e @ TxError::HeuristicCommit(_)) => {
                    // Outcome agrees with the decision; record it but do
                    // not fail the commit.
                    self.log_heuristic(&bxid, BranchHeuristic::Commit, GlobalDecision::Commit)
                        .await;
                    warn!(txn = %self, error = %e, "heuristic commit during commit");
                }
                Err(e @ TxError::HeuristicRollback(_)) => {
                    self.log_heuristic(&bxid, BranchHeuristic::Rollback, GlobalDecision::Commit)
                        .await;
                    agg = prefer(agg, e);
                }
                Err(e @ TxError::HeuristicMixed(_)) => {
                    self.log_heuristic(&bxid, BranchHeuristic::Mixed, GlobalDecision::Commit)
                        .await;
                    agg = prefer(agg, e);
                }
                Err(e) => {
                    error!(txn = %self, error = %e, "commit failed for branch");
                    agg = prefer(agg, e);
                }
            }
        }
        self.state = TransactionState::Committed;
        match agg {
            None => {
                self.state = TransactionState::NoTransaction;
                if !one_phase {
                    if let Err(e) = self.core.txlog.remove(&self.gxid).await {
                        warn!(txn = %self, error = %e,
                            "unable to remove committed log record");
                    }
                }
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Rolls the transaction back, delisting any still-associated handles
    /// first.
    pub async fn rollback(&mut self) -> Result<()> {
        debug!(txn = %self, "rollback");
        if self.state != TransactionState::Active && self.state != TransactionState::MarkedRollback
        {
            return Err(TxError::IllegalTransactionState(format!(
                "rollback in {}",
                self
            )));
        }
        self.rollback_work().await
    }

    /// Marks the transaction so the only possible outcome is rollback.
    pub fn set_rollback_only(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active
            | TransactionState::MarkedRollback
            | TransactionState::Preparing => {
                self.state = TransactionState::MarkedRollback;
                Ok(())
            }
            _ => Err(TxError::IllegalTransactionState(format!(
                "set_rollback_only in {}",
                self
            ))),
        }
    }

    async fn rollback_work(&mut self) -> Result<()> {
        let still_associated: Vec<Arc<dyn XaResource>> = self.associated.clone();
        for resource in &still_associated {
            if let Err(e) = self.delist(resource, true).await {
                warn!(txn = %self, error = %e, "unable to delist resource for rollback");
            }
        }
        self.state = TransactionState::RollingBack;

        let mut agg: Option<TxError> = None;
        let mut rolledback_one = false;
        for i in 0..self.participants.len() {
            let bxid = *self.participants[i].bxid();
            match self.participants[i].rollback().await {
                Ok(()) => rolledback_one = true,
                Err(e @ TxError::IllegalParticipantState(_)) => {
                    if !rolledback_one {
                        return Err(e);
                    }
                    agg = prefer(agg, e);
                }
                Err(e @ TxError::HeuristicCommit(_)) => {
                    self.log_heuristic(&bxid, BranchHeuristic::Commit, GlobalDecision::Rollback)
                        .await;
                    agg = prefer(agg, e);
                }
                Err(e @ TxError::HeuristicRollback(_)) => {
                    // Outcome agrees with the decision; record it but do
                    // not fail the rollback.
                    self.log_heuristic(&bxid, BranchHeuristic::Rollback, GlobalDecision::Rollback)
                        .await;
                    warn!(txn = %self, error = %e, "heuristic rollback during rollback");
                }
                Err(e @ TxError::HeuristicMixed(_)) => {
                    self.log_heuristic(&bxid, BranchHeuristic::Mixed, GlobalDecision::Rollback)
                        .await;
                    agg = prefer(agg, e);
                }
                Err(e) => {
                    error!(txn = %self, error = %e, "rollback failed for branch");
                    agg = prefer(agg, e);
                }
            }
        }
        self.state = TransactionState::RolledBack;
        match agg {
            None => {
                self.state = TransactionState::NoTransaction;
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Best-effort persistence of a heuristic branch outcome.
    async fn log_heuristic(
        &self,
        bxid: &BranchXid,
        heuristic: BranchHeuristic,
        decision: GlobalDecision,
    ) {
        let mut record = LogRecord::new(
            self.gxid,
            self.participants.iter().map(|p| *p.bxid()).collect(),
            decision,
        );
        record.set_branch_heuristic(bxid, heuristic);
        if let Err(e) = self.core.txlog.record_heuristic(bxid, &record).await {
            warn!(txn = %self, branch = %bxid, error = %e,
                "unable to log heuristic branch outcome");
        }
    }

    fn next_branch_seq(&mut self) -> Result<u8> {
        // The counter only moves on a granted sequence, so a caller that
        // keeps retrying past the cap cannot wrap it.
        if self.branch_count >= self.core.max_branches {
            return Err(TxError::TooManyBranches(format!(
                "number of branches {} reached max {} in {}",
                self.branch_count, self.core.max_branches, self
            )));
        }
        self.branch_count += 1;
        Ok(self.branch_count)
    }
}

fn prefer(current: Option<TxError>, new: TxError) -> Option<TxError> {
    match current {
        Some(c) if c.severity() > new.severity() => Some(c),
        _ => Some(new),
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.gxid == other.gxid
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.gxid, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefer_keeps_most_severe() {
        let agg = prefer(None, TxError::Coordinator("a".to_string()));
        let agg = prefer(agg, TxError::HeuristicMixed("b".to_string()));
        let agg = prefer(agg, TxError::HeuristicCommit("c".to_string()));
        assert!(matches!(agg, Some(TxError::HeuristicMixed(_))));
    }

    #[test]
    fn test_prefer_last_wins_among_equals() {
        let agg = prefer(None, TxError::HeuristicRollback("first".to_string()));
        let agg = prefer(agg, TxError::HeuristicRollback("second".to_string()));
        match agg {
            Some(TxError::HeuristicRollback(msg)) => assert_eq!(msg, "second"),
            other => panic!("unexpected aggregate {:?}", other),
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::MarkedRollback.to_string(), "MARKED_ROLLBACK");
        assert_eq!(TransactionState::NoTransaction.to_string(), "NO_TRANSACTION");
    }
}
