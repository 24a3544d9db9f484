//! An embeddable XA two-phase-commit transaction coordinator.
//!
//! The coordinator drives any number of [`XaResource`] adapters through the
//! XA protocol: branches are enlisted into a [`Transaction`], prepared,
//! logged, and committed (or rolled back), and in-doubt branches left behind
//! by a crash are resolved when their resource manager re-registers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xabridge_tm::{TmConfig, TransactionManager};
//! # use xabridge_core::Result;
//! # async fn demo(source: Arc<dyn xabridge_core::XaResource>) -> Result<()> {
//! let config = TmConfig::builder().tm_name("bridge-tm").build()?;
//! let tm = TransactionManager::new(config);
//! tm.init().await?;
//! tm.register_rm("source-broker", source.clone()).await?;
//!
//! let mut txn = tm.begin().await?;
//! txn.enlist(source.clone()).await?;
//! // ... transacted work ...
//! txn.delist(&source, false).await?;
//! txn.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod log;
pub mod manager;
pub mod participant;
pub mod transaction;

pub use config::{TmConfig, TmConfigBuilder};
pub use log::{BranchDecision, BranchHeuristic, GlobalDecision, LogRecord, MemTxLog, TxLog};
pub use manager::{TmState, TransactionManager};
pub use participant::{Participant, ParticipantState};
pub use transaction::{Transaction, TransactionState};

pub use xabridge_core::{Result, TxError, XaResource};
