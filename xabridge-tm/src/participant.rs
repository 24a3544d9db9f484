//! One resource manager's branch of a transaction.
//!
//! A [`Participant`] pairs a resource handle with its branch xid and tracks
//! where the branch is in the XA protocol. Every operation checks the local
//! state first, then calls the resource and normalizes its reported outcome:
//! rollback reason codes collapse to a rollback-only error, heuristic codes
//! become the matching heuristic error with a best-effort `forget`, and
//! terminal re-calls are answered locally without touching the resource.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use xabridge_core::xa::{XaError, XaResource, Vote};
use xabridge_core::xid::BranchXid;
use xabridge_core::{Result, TxError};

/// Where a branch is in the XA protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    /// No `start` sent yet.
    NotStarted,
    /// `start` failed with a non-rollback error.
    StartFailed,
    /// The branch is associated with the resource's work.
    Started,
    /// `end` failed; may be retried.
    EndFailed,
    /// The branch is disassociated and ready for completion.
    Ended,
    /// `prepare` failed with a non-rollback error.
    PrepareFailed,
    /// The branch voted to commit.
    Prepared,
    /// `commit` failed; the branch outcome is unknown.
    CommitFailed,
    /// The branch is committed (or voted read-only).
    Committed,
    /// `rollback` failed; the branch outcome is unknown.
    RollbackFailed,
    /// The branch is rolled back.
    RolledBack,
    /// The branch rolled back although the decision was commit.
    RolledBackOnCommit,
    /// The branch committed although the decision was rollback.
    CommittedOnRollback,
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParticipantState::NotStarted => "NOT_STARTED",
            ParticipantState::StartFailed => "START_FAILED",
            ParticipantState::Started => "STARTED",
            ParticipantState::EndFailed => "END_FAILED",
            ParticipantState::Ended => "ENDED",
            ParticipantState::PrepareFailed => "PREPARE_FAILED",
            ParticipantState::Prepared => "PREPARED",
            ParticipantState::CommitFailed => "COMMIT_FAILED",
            ParticipantState::Committed => "COMMITTED",
            ParticipantState::RollbackFailed => "ROLLBACK_FAILED",
            ParticipantState::RolledBack => "ROLLEDBACK",
            ParticipantState::RolledBackOnCommit => "ROLLEDBACK_ONCOMMIT",
            ParticipantState::CommittedOnRollback => "COMMITTED_ONROLLBACK",
        };
        write!(f, "{}", s)
    }
}

/// One branch: a resource handle, its branch xid, and the protocol state.
pub struct Participant {
    rm_name: String,
    resource: Arc<dyn XaResource>,
    bxid: BranchXid,
    recovery: bool,
    state: ParticipantState,
}

impl Participant {
    /// Creates a participant for a live transaction.
    pub fn new(rm_name: impl Into<String>, resource: Arc<dyn XaResource>, bxid: BranchXid) -> Self {
        Participant {
            rm_name: rm_name.into(),
            resource,
            bxid,
            recovery: false,
            state: ParticipantState::NotStarted,
        }
    }

    /// Creates a participant for an in-doubt branch found during recovery.
    /// Local-state preconditions for completion are bypassed; the state was
    /// lost with the previous process.
    pub fn for_recovery(
        rm_name: impl Into<String>,
        resource: Arc<dyn XaResource>,
        bxid: BranchXid,
    ) -> Self {
        Participant {
            rm_name: rm_name.into(),
            resource,
            bxid,
            recovery: true,
            state: ParticipantState::NotStarted,
        }
    }

    /// The registered resource-manager name this branch belongs to.
    pub fn rm_name(&self) -> &str {
        &self.rm_name
    }

    /// The branch xid.
    pub fn bxid(&self) -> &BranchXid {
        &self.bxid
    }

    /// The current protocol state.
    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub(crate) fn resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    /// Associates the branch with the resource's unit of work.
    pub async fn start(&mut self, flags: i32) -> Result<()> {
        if self.state != ParticipantState::NotStarted {
            error!(participant = %self, "start called at an illegal state");
            return Err(TxError::IllegalParticipantState(format!(
                "start in state {}",
                self
            )));
        }
        match self.resource.start(&self.bxid, flags).await {
            Ok(()) => {
                self.state = ParticipantState::Started;
                Ok(())
            }
            Err(XaError::Rollback(reason)) => {
                self.state = ParticipantState::NotStarted;
                error!(participant = %self, %reason, "start reported rollback");
                Err(TxError::RollbackOnly(format!(
                    "{} on start from {}",
                    reason, self
                )))
            }
            Err(e) => {
                self.state = ParticipantState::StartFailed;
                error!(participant = %self, error = %e, "start failed");
                Err(TxError::Coordinator(format!("{} on start from {}", e, self)))
            }
        }
    }

    /// Disassociates the branch; `flags` carries the success/fail intent.
    pub async fn end(&mut self, flags: i32) -> Result<()> {
        match self.state {
            ParticipantState::Started
            | ParticipantState::StartFailed
            | ParticipantState::EndFailed => {}
            _ => {
                error!(participant = %self, "end called at an illegal state");
                return Err(TxError::IllegalParticipantState(format!(
                    "end in state {}",
                    self
                )));
            }
        }
        match self.resource.end(&self.bxid, flags).await {
            Ok(()) => {
                self.state = ParticipantState::Ended;
                Ok(())
            }
            Err(XaError::Rollback(reason)) => {
                // The branch is disassociated either way; it will only
                // accept a rollback now.
                self.state = ParticipantState::Ended;
                info!(participant = %self, %reason, "end reported rollback");
                Err(TxError::RollbackOnly(format!(
                    "{} on end from {}",
                    reason, self
                )))
            }
            Err(e) => {
                self.state = ParticipantState::EndFailed;
                error!(participant = %self, error = %e, "end failed");
                Err(TxError::Coordinator(format!("{} on end from {}", e, self)))
            }
        }
    }

    /// Phase one: collects the branch's vote.
    pub async fn prepare(&mut self) -> Result<()> {
        if self.state != ParticipantState::Ended {
            return Err(TxError::IllegalParticipantState(format!(
                "prepare in state {}",
                self
            )));
        }
        match self.resource.prepare(&self.bxid).await {
            Ok(Vote::Commit) => {
                self.state = ParticipantState::Prepared;
                Ok(())
            }
            Ok(Vote::ReadOnly) => {
                // Complete already; phase two skips this branch.
                self.state = ParticipantState::Committed;
                Ok(())
            }
            Err(XaError::Rollback(reason)) => {
                self.state = ParticipantState::RolledBack;
                Err(TxError::RollbackOnly(format!(
                    "{} on prepare from {}",
                    reason, self
                )))
            }
            Err(e) => {
                self.state = ParticipantState::PrepareFailed;
                Err(TxError::Coordinator(format!(
                    "{} on prepare from {}",
                    e, self
                )))
            }
        }
    }

    /// Phase two: commits the branch. With `one_phase` the resource both
    /// prepares and commits in a single call.
    pub async fn commit(&mut self, one_phase: bool) -> Result<()> {
        if one_phase {
            if self.state != ParticipantState::Ended {
                return Err(TxError::IllegalParticipantState(format!(
                    "one-phase commit in state {}",
                    self
                )));
            }
        } else if !self.recovery
            && self.state != ParticipantState::Prepared
            && self.state != ParticipantState::Committed
        {
            return Err(TxError::IllegalParticipantState(format!(
                "commit in state {}",
                self
            )));
        }
        if self.state == ParticipantState::Committed {
            // Read-only vote or a retried commit.
            info!(participant = %self, "branch already committed");
            return Ok(());
        }
        match self.resource.commit(&self.bxid, one_phase).await {
            Ok(()) => {
                self.state = ParticipantState::Committed;
                Ok(())
            }
            Err(XaError::HeuristicCommit) => {
                // The decision was commit, so the outcome is right.
                self.state = ParticipantState::Committed;
                info!(participant = %self, "branch heuristically committed");
                match self.resource.forget(&self.bxid).await {
                    Ok(()) => Ok(()),
                    Err(t) => {
                        warn!(participant = %self, error = %t,
                            "failed to forget heuristically committed branch");
                        Err(TxError::HeuristicCommit(format!(
                            "failed to forget heuristically committed branch from {}",
                            self
                        )))
                    }
                }
            }
            Err(e @ (XaError::HeuristicHazard | XaError::HeuristicMixed)) => {
                self.state = ParticipantState::CommitFailed;
                error!(participant = %self, error = %e,
                    "branch heuristically partially committed or rolled back");
                Err(TxError::HeuristicMixed(format!(
                    "{} on commit from {}",
                    e, self
                )))
            }
            Err(XaError::HeuristicRollback) => {
                self.state = ParticipantState::RolledBackOnCommit;
                error!(participant = %self, "branch heuristically rolled back on commit");
                Err(TxError::HeuristicRollback(format!(
                    "heuristic rollback on commit from {}",
                    self
                )))
            }
            Err(XaError::Rollback(reason)) => {
                self.state = ParticipantState::RolledBackOnCommit;
                if one_phase {
                    Err(TxError::RollbackOnly(format!(
                        "{} on one-phase commit from {}",
                        reason, self
                    )))
                } else {
                    error!(participant = %self, %reason,
                        "unexpected rollback on two-phase commit");
                    Err(TxError::Coordinator(format!(
                        "unexpected {} on two-phase commit from {}",
                        reason, self
                    )))
                }
            }
            Err(e) => {
                self.state = ParticipantState::CommitFailed;
                Err(TxError::Coordinator(format!(
                    "{} on commit from {}",
                    e, self
                )))
            }
        }
    }

    /// Rolls the branch back.
    pub async fn rollback(&mut self) -> Result<()> {
        if !self.recovery {
            match self.state {
                ParticipantState::Ended
                | ParticipantState::EndFailed
                | ParticipantState::Prepared
                | ParticipantState::PrepareFailed
                | ParticipantState::RolledBack
                | ParticipantState::RollbackFailed => {}
                _ => {
                    error!(participant = %self, "rollback called at an illegal state");
                    return Err(TxError::IllegalParticipantState(format!(
                        "rollback in state {}",
                        self
                    )));
                }
            }
        }
        if self.state == ParticipantState::RolledBack {
            info!(participant = %self, "branch already rolled back");
            return Ok(());
        }
        match self.resource.rollback(&self.bxid).await {
            Ok(()) => {
                self.state = ParticipantState::RolledBack;
                Ok(())
            }
            Err(XaError::HeuristicCommit) => {
                self.state = ParticipantState::CommittedOnRollback;
                error!(participant = %self, "branch heuristically committed on rollback");
                Err(TxError::HeuristicCommit(format!(
                    "heuristic commit on rollback from {}",
                    self
                )))
            }
            Err(e @ (XaError::HeuristicHazard | XaError::HeuristicMixed)) => {
                self.state = ParticipantState::RollbackFailed;
                error!(participant = %self, error = %e,
                    "branch heuristically partially committed or rolled back");
                Err(TxError::HeuristicMixed(format!(
                    "{} on rollback from {}",
                    e, self
                )))
            }
            Err(XaError::HeuristicRollback) => {
                // Matches the decision; just clean up.
                self.state = ParticipantState::RolledBack;
                match self.resource.forget(&self.bxid).await {
                    Ok(()) => Ok(()),
                    Err(t) => {
                        warn!(participant = %self, error = %t,
                            "failed to forget heuristically rolled back branch");
                        Err(TxError::HeuristicRollback(format!(
                            "failed to forget heuristically rolled back branch from {}",
                            self
                        )))
                    }
                }
            }
            Err(XaError::Rollback(_)) => {
                self.state = ParticipantState::RolledBack;
                info!(participant = %self, "branch reported already rolled back");
                Ok(())
            }
            Err(e) => {
                self.state = ParticipantState::RollbackFailed;
                Err(TxError::Coordinator(format!(
                    "{} on rollback from {}",
                    e, self
                )))
            }
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.bxid, self.rm_name, self.state)
    }
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        self.rm_name == other.rm_name
            && self.bxid == other.bxid
            && Arc::ptr_eq(&self.resource, &other.resource)
    }
}
