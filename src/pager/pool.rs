use crate::error::Result;
use crate::id::{Lsn, PageId, VolNo};
use crate::pager::device::Device;
use crate::pager::evictor::Evictor;
use crate::pager::flush::flush_buffer;
use crate::pager::log::Stamp;
use crate::pager::{PageHeader, PageType, PAGE_FOOTER_SIZE, PAGE_HEADER_SIZE};
use crate::wal::LogWriter;
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One frame of the pool.
pub(crate) struct BufferEntry {
    /// The page held by this frame, `None` while the frame is unused.
    pub(crate) key: Option<PageId>,
    pub(crate) header: PageHeader,
    /// Full page image, the header area is only filled in when the page is written out.
    pub(crate) page: Box<[u8]>,
    pub(crate) dirty: bool,
    /// Set when the page is being dropped, its content must never reach the device.
    pub(crate) invalid: bool,
}

impl BufferEntry {
    fn unused(page_size: usize) -> Self {
        Self {
            key: None,
            header: PageHeader::fresh(PageId { vol: 0, page: 0 }),
            page: vec![0u8; page_size].into_boxed_slice(),
            dirty: false,
            invalid: false,
        }
    }

    fn reset(&mut self, pgid: PageId) {
        self.key = Some(pgid);
        self.header = PageHeader::fresh(pgid);
        self.page.fill(0);
        self.dirty = false;
        self.invalid = false;
    }

    fn body(&self) -> &[u8] {
        let end = self.page.len() - PAGE_FOOTER_SIZE;
        &self.page[PAGE_HEADER_SIZE..end]
    }

    fn body_mut(&mut self) -> &mut [u8] {
        let end = self.page.len() - PAGE_FOOTER_SIZE;
        &mut self.page[PAGE_HEADER_SIZE..end]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolStats {
    pub(crate) pins: u64,
    pub(crate) reads: u64,
    pub(crate) writes: u64,
    pub(crate) evictions: u64,
}

/// A fixed set of page frames over a device. Pinned pages are never evicted, evicting a
/// dirty page goes through `flush_buffer`.
pub(crate) struct BufferPool {
    page_size: usize,
    device: Arc<dyn Device>,
    log: Arc<dyn LogWriter>,

    frames: Box<[RwLock<BufferEntry>]>,
    internal: Mutex<PoolInternal>,

    pins: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

struct PoolInternal {
    table: HashMap<PageId, usize>,
    allocated: usize,
    evictor: Evictor,
}

impl BufferPool {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        log: Arc<dyn LogWriter>,
        n: usize,
    ) -> anyhow::Result<Self> {
        if n == 0 {
            return Err(anyhow!("buffer pool needs at least one frame"));
        }
        let page_size = device.page_size();
        super::check_page_size(page_size)?;

        let frames = (0..n)
            .map(|_| RwLock::new(BufferEntry::unused(page_size)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            page_size,
            device,
            log,
            frames,
            internal: Mutex::new(PoolInternal {
                table: HashMap::with_capacity(n),
                allocated: 0,
                evictor: Evictor::new(n),
            }),
            pins: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn body_size(&self) -> usize {
        super::body_size(self.page_size)
    }

    pub(crate) fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub(crate) fn pin_read(&self, pgid: PageId) -> Result<PageRead<'_>> {
        let frame_id = self.acquire(pgid, false)?;
        Ok(PageRead {
            pool: self,
            frame_id,
            entry: self.frames[frame_id].read(),
        })
    }

    pub(crate) fn pin_write(&self, pgid: PageId) -> Result<PageWrite<'_>> {
        let frame_id = self.acquire(pgid, false)?;
        Ok(PageWrite {
            pool: self,
            frame_id,
            entry: self.frames[frame_id].write(),
        })
    }

    /// Pins a page that was just allocated, without reading it from the device.
    pub(crate) fn pin_new(&self, pgid: PageId) -> Result<PageWrite<'_>> {
        let frame_id = self.acquire(pgid, true)?;
        let mut entry = self.frames[frame_id].write();
        if entry.header.kind != PageType::Fresh || entry.dirty {
            // a dropped page that is still resident
            entry.reset(pgid);
        }
        Ok(PageWrite {
            pool: self,
            frame_id,
            entry,
        })
    }

    fn acquire(&self, pgid: PageId, fresh: bool) -> Result<usize> {
        self.pins.fetch_add(1, Ordering::Relaxed);

        let mut internal = self.internal.lock();
        if let Some(&frame_id) = internal.table.get(&pgid) {
            internal.evictor.pinned(frame_id);
            return Ok(frame_id);
        }

        let frame_id = if internal.allocated < self.frames.len() {
            let frame_id = internal.allocated;
            internal.allocated += 1;
            frame_id
        } else {
            let (frame_id, _) = internal.evictor.victim()?;
            let mut entry = self.frames[frame_id].write();
            if entry.dirty && !entry.invalid {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            flush_buffer(&mut entry, self.log.as_ref(), self.device.as_ref())?;
            if let Some(old) = entry.key.take() {
                log::trace!("evicted page {old} from frame {frame_id}");
                internal.table.remove(&old);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            frame_id
        };

        internal.evictor.pinned(frame_id);
        let mut entry = self.frames[frame_id].write();
        let loaded = if fresh {
            entry.reset(pgid);
            Ok(())
        } else {
            self.load(&mut entry, pgid)
        };
        if let Err(err) = loaded {
            entry.key = None;
            entry.dirty = false;
            drop(entry);
            internal.evictor.unpinned(frame_id, false);
            return Err(err);
        }
        internal.table.insert(pgid, frame_id);
        Ok(frame_id)
    }

    fn load(&self, entry: &mut BufferEntry, pgid: PageId) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let found = self.device.read_page(pgid, &mut entry.page)?;
        let header = if found {
            PageHeader::open(pgid, &entry.page)?
        } else {
            entry.page.fill(0);
            PageHeader::fresh(pgid)
        };
        log::trace!("loaded page {pgid} kind={:?} lsn={:?}", header.kind, header.lsn);

        entry.key = Some(pgid);
        entry.header = header;
        entry.dirty = false;
        entry.invalid = false;
        Ok(())
    }

    fn unpin(&self, frame_id: usize, dirty: bool) {
        self.internal.lock().evictor.unpinned(frame_id, dirty);
    }

    /// Writes the page out if it is resident and dirty. Blocks while the page is pinned
    /// for writing.
    pub(crate) fn flush(&self, pgid: PageId) -> Result<()> {
        let Some(frame_id) = self.internal.lock().table.get(&pgid).copied() else {
            return Ok(());
        };
        self.flush_frame(frame_id)
    }

    pub(crate) fn flush_all(&self) -> Result<()> {
        let allocated = self.internal.lock().allocated;
        for frame_id in 0..allocated {
            self.flush_frame(frame_id)?;
        }
        self.device.sync()
    }

    fn flush_frame(&self, frame_id: usize) -> Result<()> {
        let mut entry = self.frames[frame_id].write();
        if entry.dirty && !entry.invalid {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        flush_buffer(&mut entry, self.log.as_ref(), self.device.as_ref())
    }

    /// Drops a page from the pool without writing it. The page must not be pinned.
    pub(crate) fn invalidate(&self, pgid: PageId) -> Result<()> {
        let mut internal = self.internal.lock();
        let Some(&frame_id) = internal.table.get(&pgid) else {
            return Ok(());
        };
        if internal.evictor.pin_count(frame_id) > 0 {
            return Err(anyhow!("cannot invalidate pinned page {pgid}").into());
        }

        let mut entry = self.frames[frame_id].write();
        entry.invalid = true;
        entry.key = None;
        entry.dirty = false;
        internal.table.remove(&pgid);
        internal.evictor.pinned(frame_id);
        internal.evictor.unpinned(frame_id, false);
        Ok(())
    }

    /// Writes out and drops every resident page of `vol`, before the volume is dismounted.
    pub(crate) fn drop_volume(&self, vol: VolNo) -> Result<()> {
        let pgids = self
            .internal
            .lock()
            .table
            .keys()
            .filter(|pgid| pgid.vol == vol)
            .copied()
            .collect::<Vec<_>>();
        for pgid in pgids {
            self.flush(pgid)?;
            self.invalidate(pgid)?;
        }
        Ok(())
    }

    pub(crate) fn is_resident(&self, pgid: PageId) -> bool {
        self.internal.lock().table.contains_key(&pgid)
    }

    /// Number of frames that are currently pinned.
    pub(crate) fn pinned_frames(&self) -> usize {
        let internal = self.internal.lock();
        (0..internal.allocated)
            .filter(|frame_id| internal.evictor.pin_count(*frame_id) > 0)
            .count()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            pins: self.pins.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A page pinned for reading. Unpinned on drop.
pub(crate) struct PageRead<'a> {
    pool: &'a BufferPool,
    frame_id: usize,
    entry: RwLockReadGuard<'a, BufferEntry>,
}

impl PageRead<'_> {
    pub(crate) fn id(&self) -> PageId {
        self.entry.header.pgid
    }

    pub(crate) fn kind(&self) -> PageType {
        self.entry.header.kind
    }

    pub(crate) fn lsn(&self) -> Option<Lsn> {
        self.entry.header.lsn
    }

    pub(crate) fn body(&self) -> &[u8] {
        self.entry.body()
    }
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_id, self.entry.dirty);
    }
}

/// A page pinned for writing. Unpinned on drop, which leaves the dirty flag as it is.
pub(crate) struct PageWrite<'a> {
    pool: &'a BufferPool,
    frame_id: usize,
    entry: RwLockWriteGuard<'a, BufferEntry>,
}

impl PageWrite<'_> {
    pub(crate) fn id(&self) -> PageId {
        self.entry.header.pgid
    }

    pub(crate) fn kind(&self) -> PageType {
        self.entry.header.kind
    }

    pub(crate) fn set_kind(&mut self, kind: PageType) {
        self.entry.header.kind = kind;
    }

    pub(crate) fn lsn(&self) -> Option<Lsn> {
        self.entry.header.lsn
    }

    pub(crate) fn log_rec_len(&self) -> u32 {
        self.entry.header.log_rec_len
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.entry.dirty
    }

    pub(crate) fn body(&self) -> &[u8] {
        self.entry.body()
    }

    pub(crate) fn body_mut(&mut self) -> &mut [u8] {
        self.entry.body_mut()
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.entry.dirty = true;
    }

    /// Applies the outcome of logging a mutation of this page and marks it dirty.
    pub(crate) fn stamp(&mut self, stamp: Stamp) {
        match stamp {
            Stamp::Logged(lsn, len) => {
                self.entry.header.lsn = Some(lsn);
                self.entry.header.log_rec_len = len as u32;
            }
            Stamp::Replayed(lsn) => self.entry.header.lsn = Some(lsn),
            #[cfg(test)]
            Stamp::Unlogged => (),
        }
        self.mark_dirty();
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_id, self.entry.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TxId;
    use crate::log::{LogKind, LogMode};
    use crate::pager::{LogContext, MemDevice};
    use crate::testing::MemLog;
    use crate::xact::Xact;

    fn pool(n: usize) -> (Arc<MemDevice>, Arc<MemLog>, BufferPool) {
        let device = Arc::new(MemDevice::new(1024));
        let log = Arc::new(MemLog::new());
        let pool = BufferPool::new(device.clone(), log.clone(), n).unwrap();
        (device, log, pool)
    }

    fn pgid(page: u32) -> PageId {
        PageId::new(0, page).unwrap()
    }

    #[test]
    fn test_fresh_page_reads_as_zero() {
        let (_, _, pool) = pool(4);
        let page = pool.pin_read(pgid(3)).unwrap();
        assert_eq!(PageType::Fresh, page.kind());
        assert_eq!(None, page.lsn());
        assert!(page.body().iter().all(|b| *b == 0));
        assert_eq!(1024 - 32, page.body().len());
        drop(page);
        assert_eq!(0, pool.pinned_frames());
    }

    #[test]
    fn test_eviction_flushes_log_before_writing() {
        let (device, log, pool) = pool(2);
        let xact = Xact::new(TxId::new(1).unwrap());
        let ctx = LogContext::runtime(log.as_ref(), &xact);

        let mut page = pool.pin_new(pgid(1)).unwrap();
        page.set_kind(PageType::LotLeaf);
        page.body_mut()[0..5].copy_from_slice(b"hello");
        let stamp = ctx
            .record(LogMode::RedoOnly, || LogKind::LotInitLeaf { pgid: pgid(1) })
            .unwrap();
        page.stamp(stamp);
        let lsn = page.lsn().unwrap();
        drop(page);

        let two = pool.pin_read(pgid(2)).unwrap();
        assert!(device.writes().is_empty());

        // the only unpinned frame holds the dirty page
        drop(pool.pin_read(pgid(3)).unwrap());
        assert!(!pool.is_resident(pgid(1)));
        assert_eq!(vec![pgid(1)], device.writes());
        assert_eq!(vec![lsn], *log.flushed.lock());
        drop(two);

        let page = pool.pin_read(pgid(1)).unwrap();
        assert_eq!(PageType::LotLeaf, page.kind());
        assert_eq!(Some(lsn), page.lsn());
        assert_eq!(b"hello", &page.body()[0..5]);
        assert_eq!(2, pool.stats().evictions);
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() {
        let (_, _, pool) = pool(2);
        let a = pool.pin_read(pgid(1)).unwrap();
        let b = pool.pin_read(pgid(2)).unwrap();
        assert!(matches!(
            pool.pin_read(pgid(3)),
            Err(crate::error::Error::Storage(_))
        ));
        assert!(pool.is_resident(pgid(1)));
        assert_eq!(2, pool.pinned_frames());
        drop(a);
        drop(b);
        assert!(pool.pin_read(pgid(3)).is_ok());
    }

    #[test]
    fn test_failed_eviction_keeps_page_dirty() {
        let (device, _, pool) = pool(1);
        let mut page = pool.pin_new(pgid(1)).unwrap();
        page.set_kind(PageType::LotLeaf);
        page.stamp(Stamp::Unlogged);
        drop(page);

        device.set_fail_writes(true);
        assert!(pool.pin_read(pgid(2)).is_err());
        assert!(pool.is_resident(pgid(1)));

        device.set_fail_writes(false);
        drop(pool.pin_read(pgid(2)).unwrap());
        assert_eq!(vec![pgid(1)], device.writes());
    }

    #[test]
    fn test_invalidated_page_is_never_written() {
        let (device, _, pool) = pool(2);
        let mut page = pool.pin_new(pgid(1)).unwrap();
        page.set_kind(PageType::LotLeaf);
        page.stamp(Stamp::Unlogged);
        drop(page);

        pool.invalidate(pgid(1)).unwrap();
        assert!(!pool.is_resident(pgid(1)));
        pool.flush_all().unwrap();
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_drop_volume_writes_and_forgets_its_pages() {
        let (device, _, pool) = pool(4);
        let other = PageId::new(1, 1).unwrap();
        for pgid in [pgid(1), other] {
            let mut page = pool.pin_new(pgid).unwrap();
            page.set_kind(PageType::LotLeaf);
            page.stamp(Stamp::Unlogged);
        }

        pool.drop_volume(0).unwrap();
        assert_eq!(vec![pgid(1)], device.writes());
        assert!(!pool.is_resident(pgid(1)));
        assert!(pool.is_resident(other));
    }

    #[test]
    fn test_concurrent_readers() {
        let (_, _, pool) = pool(8);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..100 {
                        let page = pool.pin_read(pgid(i % 16)).unwrap();
                        assert_eq!(pgid(i % 16), page.id());
                    }
                });
            }
        });
        assert_eq!(0, pool.pinned_frames());
        assert_eq!(400, pool.stats().pins);
    }
}
