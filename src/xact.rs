use crate::error::Result;
use crate::id::{Lsn, TxId};
use crate::lock::LockManager;
use crate::log::{LogKind, LogMode, LogRecord};
use crate::pager::{BufferPool, LogContext};
use crate::segment::SegmentAllocator;
use crate::wal::LogWriter;
use parking_lot::Mutex;

/// A transaction's identity and the head of its log chain.
pub(crate) struct Xact {
    pub(crate) txid: TxId,
    last_lsn: Mutex<Option<Lsn>>,
}

impl Xact {
    pub(crate) fn new(txid: TxId) -> Self {
        Self {
            txid,
            last_lsn: Mutex::new(None),
        }
    }

    /// Rebuilds a transaction found unfinished by recovery.
    pub(crate) fn resume(txid: TxId, last_lsn: Option<Lsn>) -> Self {
        Self {
            txid,
            last_lsn: Mutex::new(last_lsn),
        }
    }

    pub(crate) fn last_lsn(&self) -> Option<Lsn> {
        *self.last_lsn.lock()
    }

    /// Appends a record to this transaction's chain, linking it to the previous one.
    pub(crate) fn append(
        &self,
        log: &dyn LogWriter,
        mode: LogMode,
        undo_next: Option<Lsn>,
        kind: LogKind,
    ) -> Result<(Lsn, usize)> {
        let mut last_lsn = self.last_lsn.lock();
        let (lsn, len) = log.write_record(&LogRecord {
            txid: self.txid,
            prev_lsn: *last_lsn,
            undo_next,
            mode,
            kind,
        })?;
        *last_lsn = Some(lsn);
        Ok((lsn, len))
    }
}

/// Everything a storage operation runs against, passed explicitly instead of living in
/// process-wide tables.
#[derive(Clone, Copy)]
pub(crate) struct XactContext<'a> {
    pub(crate) xact: &'a Xact,
    pub(crate) pool: &'a BufferPool,
    pub(crate) log: &'a dyn LogWriter,
    /// `None` in bulk mode, where the caller guarantees exclusive access.
    pub(crate) locks: Option<&'a dyn LockManager>,
    pub(crate) alloc: &'a dyn SegmentAllocator,
}

impl<'a> XactContext<'a> {
    pub(crate) fn txid(&self) -> TxId {
        self.xact.txid
    }

    pub(crate) fn log_context(&self) -> LogContext<'a> {
        LogContext::runtime(self.log, self.xact)
    }

    /// The same context with locking turned off.
    pub(crate) fn without_locks(self) -> Self {
        Self {
            locks: None,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::PageId;
    use crate::pager::Stamp;
    use crate::testing::TestEnv;

    #[test]
    fn test_every_context_is_logged() {
        let env = TestEnv::new(1024, 8);
        let pgid = PageId::new(0, 3).unwrap();

        for ctx in [env.ctx(), env.ctx().without_locks()] {
            let before = env.log.len();
            let stamp = ctx.log_context().record_alloc(pgid).unwrap();
            assert!(matches!(stamp, Stamp::Logged(..)));
            assert_eq!(before + 1, env.log.len());
        }
        assert!(env.ctx().without_locks().locks.is_none());
        assert!(env.xact.last_lsn().is_some());
    }
}
