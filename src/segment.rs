use crate::error::Result;
use crate::id::{PageId, VolNo};
use crate::pager::{Device, LogContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The page pool a structure allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment {
    LargeObject,
    Index,
}

pub(crate) trait SegmentAllocator: Send + Sync {
    /// Hands out a page that no live structure uses and logs the allocation.
    fn allocate_page(&self, log: &LogContext, vol: VolNo, segment: Segment) -> Result<PageId>;

    fn free_page(&self, pgid: PageId) -> Result<()>;
}

#[derive(Default)]
struct VolumeSpace {
    next: u32,
    free: Vec<u32>,
}

/// Per-volume high-water mark plus an in-memory free list. Freed pages are only reused
/// within one process lifetime.
pub(crate) struct VolumeAllocator {
    device: Arc<dyn Device>,
    volumes: Mutex<HashMap<VolNo, VolumeSpace>>,
}

impl VolumeAllocator {
    pub(crate) fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    fn with_space<T>(&self, vol: VolNo, f: impl FnOnce(&mut VolumeSpace) -> T) -> Result<T> {
        let mut volumes = self.volumes.lock();
        if !volumes.contains_key(&vol) {
            let next = self.device.page_count(vol)?;
            volumes.insert(
                vol,
                VolumeSpace {
                    next,
                    free: vec![],
                },
            );
        }
        let space = volumes.get_mut(&vol).ok_or(crate::error::Error::NotMounted(vol))?;
        Ok(f(space))
    }

    /// Replays an allocation found in the log.
    pub(crate) fn redo_allocation(&self, pgid: PageId) -> Result<()> {
        self.with_space(pgid.vol, |space| {
            space.next = space.next.max(pgid.page + 1);
            space.free.retain(|page| *page != pgid.page);
        })
    }

    pub(crate) fn forget_volume(&self, vol: VolNo) {
        self.volumes.lock().remove(&vol);
    }
}

impl SegmentAllocator for VolumeAllocator {
    fn allocate_page(&self, log: &LogContext, vol: VolNo, segment: Segment) -> Result<PageId> {
        let page = self.with_space(vol, |space| match space.free.pop() {
            Some(page) => page,
            None => {
                space.next += 1;
                space.next - 1
            }
        })?;
        let pgid = PageId { vol, page };

        if let Err(err) = log.record_alloc(pgid) {
            self.with_space(vol, |space| space.free.push(page))?;
            return Err(err);
        }
        log::trace!("allocated page {pgid} for {segment:?}");
        Ok(pgid)
    }

    fn free_page(&self, pgid: PageId) -> Result<()> {
        self.with_space(pgid.vol, |space| {
            if pgid.page < space.next && !space.free.contains(&pgid.page) {
                space.free.push(pgid.page);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemDevice;

    #[test]
    fn test_allocate_reuse_and_redo() {
        let device = Arc::new(MemDevice::new(1024));
        device
            .write_page(PageId::new(2, 4).unwrap(), &vec![0u8; 1024])
            .unwrap();
        let alloc = VolumeAllocator::new(device);

        let a = alloc
            .allocate_page(&LogContext::Off, 2, Segment::Index)
            .unwrap();
        assert_eq!(PageId::new(2, 5).unwrap(), a);
        let b = alloc
            .allocate_page(&LogContext::Off, 2, Segment::LargeObject)
            .unwrap();
        assert_eq!(6, b.page);

        alloc.free_page(a).unwrap();
        let c = alloc
            .allocate_page(&LogContext::Off, 2, Segment::Index)
            .unwrap();
        assert_eq!(a, c);

        alloc.redo_allocation(PageId::new(2, 20).unwrap()).unwrap();
        let d = alloc
            .allocate_page(&LogContext::Off, 2, Segment::Index)
            .unwrap();
        assert_eq!(21, d.page);

        let e = alloc
            .allocate_page(&LogContext::Off, 0, Segment::Index)
            .unwrap();
        assert_eq!(PageId::new(0, 0).unwrap(), e);
    }
}
