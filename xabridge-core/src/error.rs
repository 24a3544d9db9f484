//! Error types for the transaction coordinator.

use std::io;
use thiserror::Error;

/// The main error type for coordinator operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// A transaction operation was attempted in a state that does not
    /// allow it (protocol-sequencing violation by the caller).
    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// A branch operation was attempted in a state that does not allow it.
    #[error("illegal participant state: {0}")]
    IllegalParticipantState(String),

    /// The transaction is marked rollback-only and cannot make progress.
    #[error("transaction marked rollback-only: {0}")]
    RollbackOnly(String),

    /// The transaction could not commit and has been rolled back; the
    /// caller must restart its unit of work.
    #[error("transaction rolled back: {0}")]
    RolledBack(String),

    /// A participant committed its branch without waiting for the
    /// coordinator's decision.
    #[error("heuristic commit: {0}")]
    HeuristicCommit(String),

    /// A participant rolled back its branch without waiting for the
    /// coordinator's decision.
    #[error("heuristic rollback: {0}")]
    HeuristicRollback(String),

    /// Part of the transaction was committed and part rolled back; the
    /// most severe heuristic outcome.
    #[error("heuristic mixed outcome: {0}")]
    HeuristicMixed(String),

    /// A resource handle was registered under an already-known RM name
    /// with a different resource type.
    #[error("resource manager conflict: {0}")]
    ResourceManagerConflict(String),

    /// No resource manager is registered for the presented handle.
    #[error("unknown resource manager: {0}")]
    UnknownResourceManager(String),

    /// The resource handle is already a participant of the transaction.
    #[error("resource already enlisted: {0}")]
    AlreadyEnlisted(String),

    /// The per-transaction branch limit was exceeded.
    #[error("too many branches: {0}")]
    TooManyBranches(String),

    /// A coordinator or resource-manager name exceeds its reserved
    /// encoding width.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// A transaction-manager lifecycle violation (not initialized,
    /// already initialized, shutting down).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed xid encoding.
    #[error("xid codec error: {0}")]
    Codec(String),

    /// Unexpected resource or log failure.
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// I/O errors from log backends.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TxError {
    /// Ranks outcome severity for aggregation across participants.
    ///
    /// When several participants fail during the completion phase the
    /// coordinator surfaces the most informative failure: a mixed
    /// heuristic outcome beats a heuristic rollback, which beats a
    /// heuristic commit, which beats any generic error.
    pub fn severity(&self) -> u8 {
        match self {
            TxError::HeuristicMixed(_) => 3,
            TxError::HeuristicRollback(_) => 2,
            TxError::HeuristicCommit(_) => 1,
            _ => 0,
        }
    }
}

/// A specialized `Result` type for coordinator operations.
pub type Result<T> = std::result::Result<T, TxError>;
