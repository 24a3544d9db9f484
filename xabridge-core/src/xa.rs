//! XA protocol vocabulary: flags, votes, and the resource capability trait.
//!
//! Outcomes a resource manager can report are modeled as the [`XaError`]
//! enum rather than numeric return codes; the coordinator matches on the
//! variants it cares about and treats everything else as a resource failure.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::xid::BranchXid;

// ============================================================================
// XA Flags
// ============================================================================

/// No flags (TMNOFLAGS).
pub const XA_TMNOFLAGS: i32 = 0;
/// Disassociate caller and mark transaction branch for commit (TMSUCCESS).
pub const XA_TMSUCCESS: i32 = 0x04000000;
/// Disassociate caller and mark transaction branch for rollback (TMFAIL).
pub const XA_TMFAIL: i32 = 0x20000000;
/// Start a recovery scan (TMSTARTRSCAN).
pub const XA_TMSTARTRSCAN: i32 = 0x01000000;
/// End a recovery scan (TMENDRSCAN).
///
/// The coordinator never sends this flag itself: its scan runs until the
/// resource returns an empty batch. It is provided for adapters that need
/// to cut a scan short on their own side.
pub const XA_TMENDRSCAN: i32 = 0x00800000;

// ============================================================================
// Prepare votes
// ============================================================================

/// The outcome of a successful `prepare` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The branch is prepared and will honor a later commit or rollback.
    Commit,
    /// The branch made no changes; it is already complete and must not
    /// receive a second-phase call.
    ReadOnly,
}

// ============================================================================
// Rollback reasons
// ============================================================================

/// Why a resource manager unilaterally rolled a branch back.
///
/// All reasons are handled identically by the coordinator; the variant is
/// carried for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// Unspecified rollback.
    Rollback,
    /// A communication failure inside the resource manager.
    CommFail,
    /// A deadlock was detected.
    Deadlock,
    /// An integrity condition was violated.
    Integrity,
    /// A reason not covered by the other variants.
    Other,
    /// A protocol error inside the resource manager.
    Proto,
    /// The branch's work timed out.
    Timeout,
    /// A transient condition; the work may succeed if retried.
    Transient,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackReason::Rollback => "rollback",
            RollbackReason::CommFail => "communication failure",
            RollbackReason::Deadlock => "deadlock",
            RollbackReason::Integrity => "integrity violation",
            RollbackReason::Other => "other",
            RollbackReason::Proto => "protocol error",
            RollbackReason::Timeout => "timeout",
            RollbackReason::Transient => "transient failure",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Resource-reported outcomes
// ============================================================================

/// Errors reported by a resource manager for an XA operation.
#[derive(Debug, Error)]
pub enum XaError {
    /// The branch was rolled back by the resource manager.
    #[error("branch rolled back ({0})")]
    Rollback(RollbackReason),

    /// The branch was heuristically committed.
    #[error("branch heuristically committed")]
    HeuristicCommit,

    /// The branch was heuristically rolled back.
    #[error("branch heuristically rolled back")]
    HeuristicRollback,

    /// The branch was partially committed and partially rolled back.
    #[error("branch heuristically mixed")]
    HeuristicMixed,

    /// The branch may have been heuristically completed; the resource
    /// manager cannot say which way.
    #[error("branch outcome hazardous")]
    HeuristicHazard,

    /// Any other resource-manager failure.
    #[error("resource manager error: {0}")]
    ResourceManager(String),
}

/// A specialized `Result` type for resource-manager operations.
pub type XaResult<T> = std::result::Result<T, XaError>;

// ============================================================================
// Resource capability trait
// ============================================================================

/// The capability a resource adapter exposes to the coordinator.
///
/// One implementation represents one connection to a resource manager. Two
/// handles may front the same underlying resource manager; [`is_same_rm`]
/// detects that so the coordinator can reuse a branch instead of opening a
/// new one.
///
/// [`is_same_rm`]: XaResource::is_same_rm
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Associate the branch with this resource's unit of work.
    async fn start(&self, xid: &BranchXid, flags: i32) -> XaResult<()>;

    /// Disassociate the branch; `flags` is [`XA_TMSUCCESS`] or [`XA_TMFAIL`].
    async fn end(&self, xid: &BranchXid, flags: i32) -> XaResult<()>;

    /// Phase one: ask the resource to vote on the branch.
    async fn prepare(&self, xid: &BranchXid) -> XaResult<Vote>;

    /// Phase two: commit the branch. With `one_phase` the resource both
    /// prepares and commits in a single call.
    async fn commit(&self, xid: &BranchXid, one_phase: bool) -> XaResult<()>;

    /// Roll the branch back.
    async fn rollback(&self, xid: &BranchXid) -> XaResult<()>;

    /// Tell the resource to discard its knowledge of a heuristically
    /// completed branch.
    async fn forget(&self, xid: &BranchXid) -> XaResult<()>;

    /// List branches the resource manager holds in a prepared or
    /// heuristically completed state. Driven as a cursor with
    /// [`XA_TMSTARTRSCAN`] then [`XA_TMNOFLAGS`] until it returns empty.
    async fn recover(&self, flags: i32) -> XaResult<Vec<BranchXid>>;

    /// A stable token identifying the underlying resource manager.
    fn rm_id(&self) -> u64;

    /// Whether `other` fronts the same resource manager as `self`.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.rm_id() == other.rm_id()
    }

    /// A short tag naming the kind of resource, embedded in branch
    /// qualifiers (for example `"jms"` or `"jdbc"`).
    fn resource_type(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(XA_TMNOFLAGS, 0);
        assert_eq!(XA_TMSUCCESS, 0x04000000);
        assert_eq!(XA_TMFAIL, 0x20000000);
        assert_eq!(XA_TMSTARTRSCAN, 0x01000000);
        assert_eq!(XA_TMENDRSCAN, 0x00800000);
    }

    #[test]
    fn test_rollback_reason_display() {
        assert_eq!(RollbackReason::Deadlock.to_string(), "deadlock");
        assert_eq!(RollbackReason::Timeout.to_string(), "timeout");
        assert_eq!(
            RollbackReason::Transient.to_string(),
            "transient failure"
        );
    }

    #[test]
    fn test_xa_error_display() {
        let err = XaError::Rollback(RollbackReason::CommFail);
        assert_eq!(
            err.to_string(),
            "branch rolled back (communication failure)"
        );
        assert_eq!(
            XaError::HeuristicMixed.to_string(),
            "branch heuristically mixed"
        );
    }

    #[test]
    fn test_vote_equality() {
        assert_eq!(Vote::Commit, Vote::Commit);
        assert_ne!(Vote::Commit, Vote::ReadOnly);
    }

    #[test]
    fn test_xa_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<XaError>();
    }
}
