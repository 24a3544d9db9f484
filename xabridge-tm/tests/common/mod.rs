//! Shared test fixtures: a scriptable resource manager and a counting log.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use xabridge_core::xa::{Vote, XaResult};
use xabridge_core::xid::{BranchXid, GlobalXid};
use xabridge_core::{Result, XaResource};
use xabridge_tm::{LogRecord, MemTxLog, TxLog};

/// A resource manager whose outcomes are scripted per call and whose calls
/// are recorded, optionally into a journal shared across resources.
pub struct MockResource {
    rm_id: u64,
    rtype: String,
    label: String,
    journal: Option<Arc<Mutex<Vec<String>>>>,
    calls: Mutex<Vec<String>>,
    prepare_results: Mutex<VecDeque<XaResult<Vote>>>,
    commit_results: Mutex<VecDeque<XaResult<()>>>,
    rollback_results: Mutex<VecDeque<XaResult<()>>>,
    recover_batches: Mutex<VecDeque<Vec<BranchXid>>>,
    committed: Mutex<Vec<BranchXid>>,
    rolled_back: Mutex<Vec<BranchXid>>,
}

impl MockResource {
    pub fn new(label: &str, rm_id: u64) -> Self {
        MockResource {
            rm_id,
            rtype: "mock".to_string(),
            label: label.to_string(),
            journal: None,
            calls: Mutex::new(Vec::new()),
            prepare_results: Mutex::new(VecDeque::new()),
            commit_results: Mutex::new(VecDeque::new()),
            rollback_results: Mutex::new(VecDeque::new()),
            recover_batches: Mutex::new(VecDeque::new()),
            committed: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(Vec::new()),
        }
    }

    pub fn with_type(label: &str, rm_id: u64, rtype: &str) -> Self {
        let mut r = Self::new(label, rm_id);
        r.rtype = rtype.to_string();
        r
    }

    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn script_prepare(&self, result: XaResult<Vote>) {
        self.prepare_results.lock().unwrap().push_back(result);
    }

    pub fn script_commit(&self, result: XaResult<()>) {
        self.commit_results.lock().unwrap().push_back(result);
    }

    pub fn script_rollback(&self, result: XaResult<()>) {
        self.rollback_results.lock().unwrap().push_back(result);
    }

    pub fn script_recover(&self, batch: Vec<BranchXid>) {
        self.recover_batches.lock().unwrap().push_back(batch);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<BranchXid> {
        self.committed.lock().unwrap().clone()
    }

    pub fn rolled_back(&self) -> Vec<BranchXid> {
        self.rolled_back.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, call));
        }
    }
}

#[async_trait]
impl XaResource for MockResource {
    async fn start(&self, _xid: &BranchXid, _flags: i32) -> XaResult<()> {
        self.record("start");
        Ok(())
    }

    async fn end(&self, _xid: &BranchXid, _flags: i32) -> XaResult<()> {
        self.record("end");
        Ok(())
    }

    async fn prepare(&self, _xid: &BranchXid) -> XaResult<Vote> {
        self.record("prepare");
        self.prepare_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Vote::Commit))
    }

    async fn commit(&self, xid: &BranchXid, one_phase: bool) -> XaResult<()> {
        self.record(if one_phase { "commit1" } else { "commit" });
        let result = self
            .commit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            self.committed.lock().unwrap().push(*xid);
        }
        result
    }

    async fn rollback(&self, xid: &BranchXid) -> XaResult<()> {
        self.record("rollback");
        let result = self
            .rollback_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            self.rolled_back.lock().unwrap().push(*xid);
        }
        result
    }

    async fn forget(&self, _xid: &BranchXid) -> XaResult<()> {
        self.record("forget");
        Ok(())
    }

    async fn recover(&self, _flags: i32) -> XaResult<Vec<BranchXid>> {
        self.record("recover");
        Ok(self
            .recover_batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    fn rm_id(&self) -> u64 {
        self.rm_id
    }

    fn resource_type(&self) -> &str {
        &self.rtype
    }
}

/// An in-memory log that counts the calls the coordinator makes.
#[derive(Default)]
pub struct RecordingTxLog {
    inner: MemTxLog,
    appends: Mutex<u32>,
    removes: Mutex<u32>,
    reaps: Mutex<u32>,
}

impl RecordingTxLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appends(&self) -> u32 {
        *self.appends.lock().unwrap()
    }

    pub fn removes(&self) -> u32 {
        *self.removes.lock().unwrap()
    }

    pub fn reaps(&self) -> u32 {
        *self.reaps.lock().unwrap()
    }
}

#[async_trait]
impl TxLog for RecordingTxLog {
    async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    async fn append(&self, record: &LogRecord) -> Result<()> {
        *self.appends.lock().unwrap() += 1;
        self.inner.append(record).await
    }

    async fn record_heuristic(&self, bxid: &BranchXid, record: &LogRecord) -> Result<()> {
        self.inner.record_heuristic(bxid, record).await
    }

    async fn lookup(&self, gxid: &GlobalXid) -> Result<Option<LogRecord>> {
        self.inner.lookup(gxid).await
    }

    async fn remove(&self, gxid: &GlobalXid) -> Result<()> {
        *self.removes.lock().unwrap() += 1;
        self.inner.remove(gxid).await
    }

    async fn reap(&self, gxid: &GlobalXid) -> Result<()> {
        *self.reaps.lock().unwrap() += 1;
        self.inner.reap(gxid).await
    }

    async fn list_all(&self) -> Result<Vec<LogRecord>> {
        self.inner.list_all().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
