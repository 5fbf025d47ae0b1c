use crate::error::{Error, Result};
use crate::id::{PageId, TxId};
use crate::lock::{LockDuration, LockManager, LockMode, LockReply, LockResource};
use crate::segment::SegmentAllocator;

/// Manual-duration locks taken by one structural operation.
///
/// Locks are released last-acquired-first, either explicitly through `release` once every
/// protected page is updated and marked dirty, or on drop when the operation bails out.
/// Declare the scope before pinning pages so that the page guards go out of scope first.
pub(crate) struct LockScope<'a> {
    locks: Option<&'a dyn LockManager>,
    txid: TxId,
    held: Vec<LockResource>,
}

impl<'a> LockScope<'a> {
    pub(crate) fn new(locks: Option<&'a dyn LockManager>, txid: TxId) -> Self {
        Self {
            locks,
            txid,
            held: vec![],
        }
    }

    pub(crate) fn is_locking(&self) -> bool {
        self.locks.is_some()
    }

    /// Requests a lock, returning the granted mode, or `None` when locking is off.
    pub(crate) fn acquire(
        &mut self,
        resource: LockResource,
        mode: LockMode,
        duration: LockDuration,
    ) -> Result<Option<LockMode>> {
        let Some(locks) = self.locks else {
            return Ok(None);
        };
        match locks.request(self.txid, resource, mode, duration)? {
            LockReply::Granted(granted) => {
                if duration == LockDuration::Manual {
                    self.held.push(resource);
                }
                Ok(Some(granted))
            }
            LockReply::Deadlock => Err(Error::Deadlock { resource }),
        }
    }

    /// Releases every held lock in reverse acquisition order and reports the first failure.
    pub(crate) fn release(mut self) -> Result<()> {
        self.release_held()
    }

    fn release_held(&mut self) -> Result<()> {
        let Some(locks) = self.locks else {
            return Ok(());
        };
        let mut first_err = None;
        while let Some(resource) = self.held.pop() {
            if let Err(err) = locks.release(self.txid, resource) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for LockScope<'_> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if let Err(err) = self.release_held() {
            log::warn!("cannot release locks of {} while unwinding: {err}", self.txid);
        }
    }
}

/// A page handed out by the allocator for an operation that has not completed yet. The
/// page goes back to the allocator on drop unless the operation keeps it.
pub(crate) struct PageReservation<'a> {
    alloc: &'a dyn SegmentAllocator,
    pgid: PageId,
    kept: bool,
}

impl<'a> PageReservation<'a> {
    pub(crate) fn new(alloc: &'a dyn SegmentAllocator, pgid: PageId) -> Self {
        Self {
            alloc,
            pgid,
            kept: false,
        }
    }

    pub(crate) fn keep(mut self) -> PageId {
        self.kept = true;
        self.pgid
    }
}

impl Drop for PageReservation<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        if let Err(err) = self.alloc.free_page(self.pgid) {
            log::warn!("cannot give back page {}: {err}", self.pgid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{LogContext, MemDevice};
    use crate::segment::{Segment, VolumeAllocator};
    use crate::testing::ScriptedLocks;
    use std::sync::Arc;

    #[test]
    fn test_release_in_reverse_order() {
        let locks = ScriptedLocks::default();
        let txid = TxId::new(1).unwrap();
        let a = LockResource::KeyRange(PageId::new(0, 1).unwrap());
        let b = LockResource::Page(PageId::new(0, 1).unwrap());
        let c = LockResource::Page(PageId::new(0, 2).unwrap());

        let mut scope = LockScope::new(Some(&locks), txid);
        scope.acquire(a, LockMode::IX, LockDuration::Manual).unwrap();
        scope.acquire(b, LockMode::X, LockDuration::Manual).unwrap();
        scope.acquire(c, LockMode::S, LockDuration::Commit).unwrap();
        scope.release().unwrap();

        assert_eq!(vec![b, a], locks.released());
    }

    #[test]
    fn test_deadlock_unwinds_on_drop() {
        let locks = ScriptedLocks::default();
        let txid = TxId::new(1).unwrap();
        let a = LockResource::KeyRange(PageId::new(0, 1).unwrap());
        let b = LockResource::Page(PageId::new(0, 1).unwrap());
        locks.deadlock_on(b);

        let result = (|| {
            let mut scope = LockScope::new(Some(&locks), txid);
            scope.acquire(a, LockMode::IX, LockDuration::Manual)?;
            scope.acquire(b, LockMode::X, LockDuration::Manual)?;
            scope.release()
        })();

        assert!(matches!(result, Err(Error::Deadlock { resource }) if resource == b));
        assert_eq!(vec![a], locks.released());
    }

    #[test]
    fn test_no_locking() {
        let mut scope = LockScope::new(None, TxId::new(1).unwrap());
        assert!(!scope.is_locking());
        let granted = scope
            .acquire(
                LockResource::Page(PageId::new(0, 1).unwrap()),
                LockMode::X,
                LockDuration::Manual,
            )
            .unwrap();
        assert_eq!(None, granted);
        scope.release().unwrap();
    }

    #[test]
    fn test_reservation_returns_page_unless_kept() {
        let alloc = VolumeAllocator::new(Arc::new(MemDevice::new(1024)));
        let a = alloc
            .allocate_page(&LogContext::Off, 0, Segment::Index)
            .unwrap();
        drop(PageReservation::new(&alloc, a));
        let b = alloc
            .allocate_page(&LogContext::Off, 0, Segment::Index)
            .unwrap();
        assert_eq!(a, b);

        assert_eq!(b, PageReservation::new(&alloc, b).keep());
        let c = alloc
            .allocate_page(&LogContext::Off, 0, Segment::Index)
            .unwrap();
        assert_ne!(b, c);
    }
}
