//! The transaction manager: RM registry, xid allocation, and recovery.
//!
//! One [`TransactionManager`] is embedded per bridge process. After
//! `init()` opens the log and loads the leftover records from the previous
//! run, each resource manager registers itself; registration drives the XA
//! recovery scan against that RM, resolving its in-doubt branches from the
//! recorded decisions and reaping records no live RM still references.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use xabridge_core::xa::{XaResource, XA_TMNOFLAGS, XA_TMSTARTRSCAN};
use xabridge_core::xid::{BranchXid, GlobalXid, MAX_RM_NAME_LEN};
use xabridge_core::{Result, TxError};

use crate::config::TmConfig;
use crate::log::{GlobalDecision, LogRecord, MemTxLog, TxLog};
use crate::participant::Participant;
use crate::transaction::Transaction;

/// The manager's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmState {
    /// Created but not yet initialized.
    Uninitialized,
    /// Open for business.
    Initialized,
    /// Shutdown in progress.
    Closing,
    /// Shut down.
    Closed,
}

impl fmt::Display for TmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TmState::Uninitialized => "UNINITIALIZED",
            TmState::Initialized => "INITIALIZED",
            TmState::Closing => "CLOSING",
            TmState::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// Shared coordinator state, referenced by the manager and every live
/// transaction handle.
pub(crate) struct TmCore {
    pub(crate) tm_name: String,
    pub(crate) max_branches: u8,
    pub(crate) txlog: Arc<dyn TxLog>,
    state: Mutex<TmState>,
    registry: Mutex<HashMap<String, Vec<Arc<dyn XaResource>>>>,
    recovered: Mutex<Vec<LogRecord>>,
    keep_gxids: Mutex<HashMap<String, Vec<GlobalXid>>>,
    // Serializes whole recovery passes so concurrent registrations see a
    // consistent keep table (last registrant's view wins).
    recovery_lock: Mutex<()>,
}

impl TmCore {
    /// Resolves a resource handle to its registered RM name. Candidates
    /// match by `is_same_rm` or pointer identity; a candidate whose
    /// resource type differs is skipped with a warning.
    pub(crate) async fn resolve_rm(&self, resource: &Arc<dyn XaResource>) -> Option<String> {
        let registry = self.registry.lock().await;
        for (name, handles) in registry.iter() {
            for xar in handles {
                if xar.is_same_rm(resource.as_ref()) || Arc::ptr_eq(xar, resource) {
                    if xar.resource_type() != resource.resource_type() {
                        warn!(
                            rm = %name,
                            registered = xar.resource_type(),
                            presented = resource.resource_type(),
                            "resource type differs from what is registered"
                        );
                        continue;
                    }
                    return Some(name.clone());
                }
            }
        }
        None
    }

    async fn check_initialized(&self) -> Result<()> {
        let state = *self.state.lock().await;
        if state != TmState::Initialized {
            return Err(TxError::IllegalState(format!(
                "TM:{}[{}] not initialized",
                self.tm_name, state
            )));
        }
        Ok(())
    }
}

/// The process-wide transaction coordinator.
pub struct TransactionManager {
    core: Arc<TmCore>,
}

impl TransactionManager {
    /// Creates a manager from a validated configuration. Without a
    /// configured log backend the in-memory log is used.
    pub fn new(config: TmConfig) -> Self {
        let txlog = config
            .log
            .unwrap_or_else(|| Arc::new(MemTxLog::new()) as Arc<dyn TxLog>);
        TransactionManager {
            core: Arc::new(TmCore {
                tm_name: config.tm_name,
                max_branches: config.max_branches,
                txlog,
                state: Mutex::new(TmState::Uninitialized),
                registry: Mutex::new(HashMap::new()),
                recovered: Mutex::new(Vec::new()),
                keep_gxids: Mutex::new(HashMap::new()),
                recovery_lock: Mutex::new(()),
            }),
        }
    }

    /// The coordinator name embedded in every global xid.
    pub fn tm_name(&self) -> &str {
        &self.core.tm_name
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> TmState {
        *self.core.state.lock().await
    }

    /// Opens the transaction log and loads the recovery set.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.core.state.lock().await;
        if *state != TmState::Uninitialized {
            return Err(TxError::IllegalState(format!(
                "init on TM:{}[{}]",
                self.core.tm_name, state
            )));
        }
        self.core.txlog.open().await?;
        let records = self.core.txlog.list_all().await?;
        info!(
            tm = %self.core.tm_name,
            pending = records.len(),
            "transaction manager starting"
        );
        for record in &records {
            debug!(record = %record, "pending recovery record");
        }
        *self.core.recovered.lock().await = records;
        *state = TmState::Initialized;
        Ok(())
    }

    /// Starts a transaction, returning the handle that drives it.
    pub async fn begin(&self) -> Result<Transaction> {
        self.core.check_initialized().await?;
        let (unique, _) = Uuid::new_v4().as_u64_pair();
        let gxid = GlobalXid::new(&self.core.tm_name, unique)?;
        debug!(tm = %self.core.tm_name, gxid = %gxid, "begin transaction");
        Ok(Transaction::new(gxid, self.core.clone()))
    }

    /// Registers a resource manager and runs the recovery scan against it.
    ///
    /// Several handles may be registered under one name. Handles that front
    /// the same underlying RM must share a resource type; a mismatch is a
    /// misconfiguration and fails with `ResourceManagerConflict`.
    pub async fn register_rm(&self, rm_name: &str, resource: Arc<dyn XaResource>) -> Result<()> {
        self.core.check_initialized().await?;
        if rm_name.len() > MAX_RM_NAME_LEN {
            return Err(TxError::NameTooLong(format!(
                "RM name {} exceeds maximum {} bytes",
                rm_name, MAX_RM_NAME_LEN
            )));
        }

        let _recovery = self.core.recovery_lock.lock().await;

        {
            let mut registry = self.core.registry.lock().await;
            let handles = registry.entry(rm_name.to_string()).or_default();
            for xar in handles.iter() {
                if (xar.is_same_rm(resource.as_ref()) || resource.is_same_rm(xar.as_ref()))
                    && xar.resource_type() != resource.resource_type()
                {
                    return Err(TxError::ResourceManagerConflict(format!(
                        "resource type {} differs from registered {} for RM {}",
                        resource.resource_type(),
                        xar.resource_type(),
                        rm_name
                    )));
                }
            }
            if !handles.iter().any(|x| Arc::ptr_eq(x, &resource)) {
                handles.push(resource.clone());
            }
        }

        // Cursor the RM's in-doubt branch list.
        let mut batches: Vec<Vec<BranchXid>> = Vec::new();
        let mut flags = XA_TMSTARTRSCAN;
        loop {
            let xids = resource.recover(flags).await.map_err(|e| {
                TxError::Coordinator(format!("recovery scan of RM {} failed: {}", rm_name, e))
            })?;
            if xids.is_empty() {
                break;
            }
            flags = XA_TMNOFLAGS;
            batches.push(xids);
        }

        let mut keep_gxids: Vec<GlobalXid> = Vec::new();
        let mut real_names: Vec<String> = Vec::new();
        for bxid in batches.into_iter().flatten() {
            if bxid.is_foreign() {
                warn!(branch = %bxid, "ignoring foreign xid");
                continue;
            }
            let gxid = *bxid.global();
            match gxid.tm_name() {
                Some(tmn) if tmn == self.core.tm_name => {}
                _ => {
                    warn!(branch = %bxid, tm = %self.core.tm_name,
                        "ignoring xid from a different transaction manager");
                    continue;
                }
            }
            let real_rm = match bxid.rm_name() {
                Some(name) => name.to_string(),
                None => {
                    warn!(branch = %bxid, "unable to read RM name from branch; keeping");
                    keep_gxids.push(gxid);
                    continue;
                }
            };
            if real_rm != rm_name {
                warn!(branch = %bxid, rm = %rm_name, real_rm = %real_rm,
                    "recovered branch names a different RM");
                real_names.push(real_rm.clone());
            }
            info!(branch = %bxid, gxid = %gxid, rm = %rm_name,
                "recovering in-doubt branch");

            let record = self.core.txlog.lookup(&gxid).await?;
            let commit = matches!(
                record.as_ref().map(|r| r.decision()),
                Some(GlobalDecision::Commit)
            );
            if let Some(rec) = &record {
                match rec.heuristic_branch(&bxid) {
                    Some(true) => {
                        warn!(branch = %bxid, gxid = %gxid, commit,
                            "branch was heuristically completed; keeping");
                        keep_gxids.push(gxid);
                        continue;
                    }
                    None => {
                        warn!(branch = %bxid, record = %rec,
                            "branch not found in its log record; keeping");
                        keep_gxids.push(gxid);
                        continue;
                    }
                    Some(false) => {}
                }
            }

            let mut party = Participant::for_recovery(real_rm, resource.clone(), bxid);
            if commit {
                info!(branch = %bxid, rm = %rm_name, "committing recovered branch");
                if let Err(e) = party.commit(false).await {
                    warn!(branch = %bxid, error = %e, "failed to commit recovered branch");
                    keep_gxids.push(gxid);
                }
            } else {
                info!(branch = %bxid, rm = %rm_name, "rolling back recovered branch");
                if let Err(e) = party.rollback().await {
                    warn!(branch = %bxid, error = %e, "failed to rollback recovered branch");
                }
            }
        }

        self.cleanup_recovered(rm_name, keep_gxids, real_names)
            .await;
        Ok(())
    }

    /// Removes an RM from the registry if it has no live handles left;
    /// otherwise a warned no-op.
    pub async fn unregister_rm(&self, rm_name: &str) {
        let mut registry = self.core.registry.lock().await;
        let handle_count = match registry.get(rm_name) {
            None => {
                warn!(rm = %rm_name, "unregistering an unknown RM");
                return;
            }
            Some(handles) => handles.len(),
        };
        if handle_count == 0 {
            registry.remove(rm_name);
        } else {
            warn!(rm = %rm_name, handles = handle_count,
                "RM still has registered handles; not removed");
        }
    }

    /// Dumps the string form of every log record, for operator inspection.
    pub async fn list_transactions(&self) -> Result<Vec<String>> {
        self.core.check_initialized().await?;
        let records = self.core.txlog.list_all().await?;
        Ok(records.iter().map(|r| r.to_string()).collect())
    }

    /// Closes the transaction log. Idempotent once closed.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.core.state.lock().await;
        if *state == TmState::Closed {
            info!(tm = %self.core.tm_name, "transaction manager already shut down");
            return Ok(());
        }
        *state = TmState::Closing;
        self.core.txlog.close().await?;
        *state = TmState::Closed;
        info!(tm = %self.core.tm_name, "transaction manager shut down");
        Ok(())
    }

    /// Reconciles the keep table with the recovery set after one RM's scan:
    /// records whose every branch belongs to an already-scanned RM that no
    /// longer references them are reaped.
    async fn cleanup_recovered(
        &self,
        rm_name: &str,
        keep: Vec<GlobalXid>,
        real_names: Vec<String>,
    ) {
        info!(rm = %rm_name, kept = keep.len(), "updating recovery bookkeeping");
        let mut table = self.core.keep_gxids.lock().await;
        keep_gxid_for_rm(&mut table, rm_name, None);
        for real in &real_names {
            info!(rm = %rm_name, real_rm = %real, "updating recovery bookkeeping for real RM");
            keep_gxid_for_rm(&mut table, real, None);
        }
        for gxid in &keep {
            keep_gxid_for_rm(&mut table, rm_name, Some(gxid));
            for real in &real_names {
                keep_gxid_for_rm(&mut table, real, Some(gxid));
            }
        }

        let mut recovered = self.core.recovered.lock().await;
        let mut idx = 0;
        while idx < recovered.len() {
            let gxid = *recovered[idx].gxid();
            debug!(gxid = %gxid, "checking recovery completion");
            let mut keep_record = false;
            for branch in recovered[idx].branches() {
                let rmn = match branch.bxid.rm_name() {
                    Some(name) => name,
                    None => {
                        warn!(branch = %branch.bxid, gxid = %gxid,
                            "unable to read RM name from logged branch; keeping record");
                        keep_record = true;
                        break;
                    }
                };
                match table.get(rmn) {
                    None => {
                        debug!(gxid = %gxid, rm = %rmn, "keeping record; RM not yet scanned");
                        keep_record = true;
                        break;
                    }
                    Some(gxids) if gxids.contains(&gxid) => {
                        debug!(gxid = %gxid, rm = %rmn, "keeping record for RM");
                        keep_record = true;
                        break;
                    }
                    Some(_) => {}
                }
            }
            if keep_record {
                idx += 1;
                continue;
            }
            info!(gxid = %gxid, "cleaning up fully recovered transaction");
            match self.core.txlog.reap(&gxid).await {
                Ok(()) => {
                    recovered.remove(idx);
                }
                Err(e) => {
                    warn!(gxid = %gxid, error = %e, "unable to reap recovered record");
                    idx += 1;
                }
            }
        }
    }
}

fn keep_gxid_for_rm(
    table: &mut HashMap<String, Vec<GlobalXid>>,
    rm_name: &str,
    gxid: Option<&GlobalXid>,
) {
    let entry = table.entry(rm_name.to_string()).or_default();
    if let Some(gxid) = gxid {
        if !entry.contains(gxid) {
            entry.push(*gxid);
        }
    }
}

impl fmt::Display for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TM:{}", self.core.tm_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let config = TmConfig::builder().tm_name("tm1").build().unwrap();
        let tm = TransactionManager::new(config);
        assert_eq!(tm.state().await, TmState::Uninitialized);

        // Operations before init are rejected.
        let err = tm.begin().await.unwrap_err();
        assert!(matches!(err, TxError::IllegalState(_)));

        tm.init().await.unwrap();
        assert_eq!(tm.state().await, TmState::Initialized);

        // Double init is rejected.
        let err = tm.init().await.unwrap_err();
        assert!(matches!(err, TxError::IllegalState(_)));

        tm.shutdown().await.unwrap();
        assert_eq!(tm.state().await, TmState::Closed);
        // Idempotent.
        tm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_allocates_distinct_gxids() {
        let config = TmConfig::builder().tm_name("tm1").build().unwrap();
        let tm = TransactionManager::new(config);
        tm.init().await.unwrap();

        let a = tm.begin().await.unwrap();
        let b = tm.begin().await.unwrap();
        assert_ne!(a.gxid(), b.gxid());
        assert_eq!(a.gxid().tm_name(), Some("tm1"));
    }

    #[tokio::test]
    async fn test_register_rm_name_width_checked() {
        let config = TmConfig::builder().tm_name("tm1").build().unwrap();
        let tm = TransactionManager::new(config);
        tm.init().await.unwrap();

        struct Nop;
        #[async_trait::async_trait]
        impl XaResource for Nop {
            async fn start(&self, _x: &BranchXid, _f: i32) -> xabridge_core::xa::XaResult<()> {
                Ok(())
            }
            async fn end(&self, _x: &BranchXid, _f: i32) -> xabridge_core::xa::XaResult<()> {
                Ok(())
            }
            async fn prepare(
                &self,
                _x: &BranchXid,
            ) -> xabridge_core::xa::XaResult<xabridge_core::xa::Vote> {
                Ok(xabridge_core::xa::Vote::Commit)
            }
            async fn commit(&self, _x: &BranchXid, _o: bool) -> xabridge_core::xa::XaResult<()> {
                Ok(())
            }
            async fn rollback(&self, _x: &BranchXid) -> xabridge_core::xa::XaResult<()> {
                Ok(())
            }
            async fn forget(&self, _x: &BranchXid) -> xabridge_core::xa::XaResult<()> {
                Ok(())
            }
            async fn recover(&self, _f: i32) -> xabridge_core::xa::XaResult<Vec<BranchXid>> {
                Ok(Vec::new())
            }
            fn rm_id(&self) -> u64 {
                1
            }
            fn resource_type(&self) -> &str {
                "nop"
            }
        }

        let long = "r".repeat(MAX_RM_NAME_LEN + 1);
        let err = tm.register_rm(&long, Arc::new(Nop)).await.unwrap_err();
        assert!(matches!(err, TxError::NameTooLong(_)));

        tm.register_rm("rm1", Arc::new(Nop)).await.unwrap();
    }
}
