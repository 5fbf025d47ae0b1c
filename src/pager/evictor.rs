use anyhow::anyhow;
use indexmap::IndexSet;

/// Tracks pin counts per frame and picks eviction victims, preferring clean frames so the
/// eviction path can skip the log force and the page write.
pub(crate) struct Evictor {
    ref_count: Vec<usize>,
    unpinned: IndexSet<usize>,
    unpinned_clean: IndexSet<usize>,
}

impl Evictor {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            ref_count: vec![0; n],
            unpinned: IndexSet::default(),
            unpinned_clean: IndexSet::default(),
        }
    }

    pub(crate) fn pinned(&mut self, frame_id: usize) {
        self.ref_count[frame_id] += 1;
        self.unpinned.shift_remove(&frame_id);
        self.unpinned_clean.shift_remove(&frame_id);
    }

    pub(crate) fn unpinned(&mut self, frame_id: usize, dirty: bool) {
        assert!(self.ref_count[frame_id] > 0, "frame {frame_id} is not pinned");
        self.ref_count[frame_id] -= 1;
        if self.ref_count[frame_id] > 0 {
            return;
        }

        self.unpinned.insert(frame_id);
        if dirty {
            self.unpinned_clean.shift_remove(&frame_id);
        } else {
            self.unpinned_clean.insert(frame_id);
        }
    }

    pub(crate) fn pin_count(&self, frame_id: usize) -> usize {
        self.ref_count[frame_id]
    }

    /// Returns the least recently unpinned frame, clean ones first, and whether it may
    /// need a flush.
    pub(crate) fn victim(&self) -> anyhow::Result<(usize, bool)> {
        if let Some(frame_id) = self.unpinned_clean.first().copied() {
            Ok((frame_id, false))
        } else if let Some(frame_id) = self.unpinned.first().copied() {
            Ok((frame_id, true))
        } else {
            Err(anyhow!("all pages are pinned"))
        }
    }
}
