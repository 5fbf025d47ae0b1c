//! Collaborator doubles shared by the unit tests.

use crate::error::Result;
use crate::id::{Lsn, TxId};
use crate::lock::{LockDuration, LockManager, LockMode, LockReply, LockResource};
use crate::log::LogRecord;
use crate::pager::{BufferPool, MemDevice};
use crate::segment::VolumeAllocator;
use crate::wal::{LogEntryBuf, LogReader, LogWriter};
use crate::xact::{Xact, XactContext};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Log writer that keeps every record in memory and remembers flush requests.
pub(crate) struct MemLog {
    next: Mutex<u64>,
    records: Mutex<Vec<LogEntryBuf>>,
    pub(crate) flushed: Mutex<Vec<Lsn>>,
    fail: AtomicBool,
}

impl MemLog {
    pub(crate) fn new() -> Self {
        Self {
            next: Mutex::new(64),
            records: Mutex::new(vec![]),
            flushed: Mutex::new(vec![]),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Runs `f` over the records written so far, in lsn order.
    pub(crate) fn with_records<T>(&self, f: impl FnOnce(&[LogEntryBuf]) -> T) -> T {
        f(&self.records.lock())
    }
}

impl LogWriter for MemLog {
    fn write_record(&self, record: &LogRecord) -> Result<(Lsn, usize)> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("log is unavailable").into());
        }
        let mut next = self.next.lock();
        let lsn = Lsn::new(*next);
        let size = record.size();
        let mut bytes = vec![0u8; size];
        record.encode(&mut bytes);
        self.records.lock().push(LogEntryBuf::from_encoded(lsn, bytes));
        *next += size as u64;
        Ok((lsn, size))
    }

    fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        self.flushed.lock().push(lsn);
        Ok(())
    }
}

impl LogReader for MemLog {
    fn read_at(&self, lsn: Lsn) -> Result<LogEntryBuf> {
        self.records
            .lock()
            .iter()
            .find(|entry| entry.lsn == lsn)
            .cloned()
            .ok_or_else(|| anyhow!("no record at {lsn}").into())
    }
}

/// Lock manager that grants everything except the resources it was told to refuse.
#[derive(Default)]
pub(crate) struct ScriptedLocks {
    requests: Mutex<Vec<(LockResource, LockMode)>>,
    released: Mutex<Vec<LockResource>>,
    refuse: Mutex<Vec<LockResource>>,
    fail_release_all: AtomicBool,
}

impl ScriptedLocks {
    pub(crate) fn deadlock_on(&self, resource: LockResource) {
        self.refuse.lock().push(resource);
    }

    pub(crate) fn fail_release_all(&self) {
        self.fail_release_all.store(true, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<(LockResource, LockMode)> {
        self.requests.lock().clone()
    }

    pub(crate) fn released(&self) -> Vec<LockResource> {
        self.released.lock().clone()
    }
}

impl LockManager for ScriptedLocks {
    fn request(
        &self,
        _txid: TxId,
        resource: LockResource,
        mode: LockMode,
        _duration: LockDuration,
    ) -> Result<LockReply> {
        self.requests.lock().push((resource, mode));
        if self.refuse.lock().contains(&resource) {
            return Ok(LockReply::Deadlock);
        }
        Ok(LockReply::Granted(mode))
    }

    fn release(&self, _txid: TxId, resource: LockResource) -> Result<()> {
        self.released.lock().push(resource);
        Ok(())
    }

    fn release_all(&self, txid: TxId) -> Result<()> {
        if self.fail_release_all.load(Ordering::SeqCst) {
            return Err(anyhow!("cannot release the locks of {txid}").into());
        }
        Ok(())
    }
}

/// A pool over an in-memory device with one running transaction.
pub(crate) struct TestEnv {
    pub(crate) device: Arc<MemDevice>,
    pub(crate) log: Arc<MemLog>,
    pub(crate) pool: BufferPool,
    pub(crate) alloc: VolumeAllocator,
    pub(crate) locks: ScriptedLocks,
    pub(crate) xact: Xact,
}

impl TestEnv {
    pub(crate) fn new(page_size: usize, frames: usize) -> Self {
        let device = Arc::new(MemDevice::new(page_size));
        let log = Arc::new(MemLog::new());
        let pool = BufferPool::new(device.clone(), log.clone(), frames).unwrap();
        let alloc = VolumeAllocator::new(device.clone());
        Self {
            device,
            log,
            pool,
            alloc,
            locks: ScriptedLocks::default(),
            xact: Xact::new(TxId::new(1).unwrap()),
        }
    }

    pub(crate) fn ctx(&self) -> XactContext<'_> {
        XactContext {
            xact: &self.xact,
            pool: &self.pool,
            log: self.log.as_ref(),
            locks: Some(&self.locks),
            alloc: &self.alloc,
        }
    }

    /// Writes everything out and starts over with an empty pool on the same device, so a
    /// test can observe which pages an operation loads.
    pub(crate) fn cold_pool(&mut self) {
        self.pool.flush_all().unwrap();
        self.pool = BufferPool::new(self.device.clone(), self.log.clone(), 64).unwrap();
    }
}
