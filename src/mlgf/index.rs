use crate::action::PageReservation;
use crate::error::{Error, Result};
use crate::id::{ObjectId, PageId};
use crate::lock::{LockDuration, LockMode, LockReply, LockResource};
use crate::log::LogMode;
use crate::mlgf::key::KeyDesc;
use crate::mlgf::page::{
    delete_leaf_objects, directory_capacity, encode_entries, init_directory, init_leaf_page,
    insert_directory_entries, insert_leaf_objects, leaf_capacity, update_directory_entry,
    DirEntry, DirPage, LeafObject, LeafPage,
};
use crate::mlgf::split::{
    overflow_key, split_directory_page, split_leaf_page, whole_space_bounds, SplitOutcome,
};
use crate::pager::{write_image, PageType};
use crate::segment::Segment;
use crate::xact::XactContext;
use anyhow::anyhow;

/// A directory page on the way from the root to a leaf.
#[derive(Debug, Clone)]
pub(crate) struct DirFrame {
    pub(crate) pgid: PageId,
    /// Entry followed to the next level.
    pub(crate) index: usize,
    pub(crate) entry: DirEntry,
}

/// A multilevel grid file rooted at a page that never moves.
pub(crate) struct MlgfIndex<'a> {
    ctx: XactContext<'a>,
    kdesc: &'a KeyDesc,
    root: PageId,
}

impl<'a> MlgfIndex<'a> {
    /// Creates an index made of a root directory with one entry over an empty leaf.
    pub(crate) fn create(
        ctx: XactContext<'a>,
        kdesc: &'a KeyDesc,
        vol: u32,
        iid: u32,
    ) -> Result<PageId> {
        let log = ctx.log_context();
        let n_keys = kdesc.n_keys() as u8;
        let root = ctx.alloc.allocate_page(&log, vol, Segment::Index)?;
        let root_reservation = PageReservation::new(ctx.alloc, root);
        let leaf = ctx.alloc.allocate_page(&log, vol, Segment::Index)?;
        let leaf_reservation = PageReservation::new(ctx.alloc, leaf);

        {
            let mut page = ctx.pool.pin_new(leaf)?;
            init_leaf_page(&mut page, &log, iid, n_keys)?;
        }
        {
            let mut page = ctx.pool.pin_new(root)?;
            init_directory(&mut page, &log, iid, 1, true, n_keys)?;
            let entry = DirEntry::whole_space(kdesc, leaf.page);
            insert_directory_entries(&mut page, &log, LogMode::RedoOnly, 0, &entry.to_bytes())?;
        }

        leaf_reservation.keep();
        let root = root_reservation.keep();
        log::debug!("created index {iid} at {root} with {n_keys} keys");
        Ok(root)
    }

    pub(crate) fn open(ctx: XactContext<'a>, kdesc: &'a KeyDesc, root: PageId) -> Self {
        Self { ctx, kdesc, root }
    }

    fn read_dir(&self, pgid: PageId) -> Result<DirPage> {
        let page = self.ctx.pool.pin_read(pgid)?;
        DirPage::read(&page)
    }

    /// Reads the root, which must be a root directory page of this index's shape.
    pub(crate) fn check_root(&self) -> Result<DirPage> {
        let page = self.ctx.pool.pin_read(self.root)?;
        if page.kind() != PageType::MlgfDirectory {
            return Err(Error::NotFound(format!("index at {}", self.root)));
        }
        let dir = DirPage::read(&page)?;
        if !dir.root {
            return Err(Error::NotFound(format!("index at {}", self.root)));
        }
        if dir.n_keys as usize != self.kdesc.n_keys() {
            return Err(Error::bad_parameter(format!(
                "index at {} has {} keys, the descriptor has {}",
                self.root,
                dir.n_keys,
                self.kdesc.n_keys()
            )));
        }
        Ok(dir)
    }

    /// Walks from the root to the leaf whose region holds `kval`.
    pub(crate) fn descend(&self, kval: &[u32]) -> Result<(Vec<DirFrame>, PageId)> {
        let mut frames = vec![];
        let mut pgid = self.root;
        loop {
            let dir = self.read_dir(pgid)?;
            let Some(index) = dir.find(kval) else {
                return Err(anyhow!("no entry of directory page {pgid} covers {kval:x?}").into());
            };
            let entry = dir.entries[index].clone();
            let child = pgid.sibling(entry.spid);
            frames.push(DirFrame { pgid, index, entry });
            if dir.height <= 1 {
                return Ok((frames, child));
            }
            pgid = child;
        }
    }

    pub(crate) fn insert(&self, kval: &[u32], oid: ObjectId) -> Result<()> {
        self.kdesc.check(kval)?;
        let object = LeafObject {
            kval: kval.to_vec(),
            oid,
        };
        let log = self.ctx.log_context();
        let capacity = leaf_capacity(self.ctx.pool.body_size(), self.kdesc.n_keys());

        loop {
            let (frames, leaf) = self.descend(kval)?;
            let primary = {
                let mut page = self.ctx.pool.pin_write(leaf)?;
                let primary = LeafPage::read_write(&page)?;
                let n = primary.objects.len();
                if n < capacity {
                    let bytes = object.to_bytes();
                    insert_leaf_objects(&mut page, &log, LogMode::RedoUndo, n, &bytes)?;
                    drop(page);
                    return self.widen(&frames, kval);
                }
                primary
            };

            // splitting cannot separate equal keys, they go to the overflow chain
            if primary.objects.iter().all(|o| o.kval == kval)
                && overflow_key(&self.ctx, leaf, primary.overflow)?.map_or(true, |k| k == kval)
            {
                self.insert_overflow(leaf, primary, &object)?;
                return self.widen(&frames, kval);
            }

            let parent = frames.len() - 1;
            let outcome =
                split_leaf_page(&self.ctx, self.kdesc, leaf, &frames[parent].entry, kval)?;
            self.replace_and_insert(&frames, parent, outcome)?;
        }
    }

    /// Adds `object` to the first page of the overflow chain of `leaf` with room, chaining
    /// a new page at the end when every page is full.
    fn insert_overflow(&self, leaf: PageId, primary: LeafPage, object: &LeafObject) -> Result<()> {
        let log = self.ctx.log_context();
        let capacity = leaf_capacity(self.ctx.pool.body_size(), self.kdesc.n_keys());

        let mut tail = (leaf, primary);
        while let Some(spid) = tail.1.overflow {
            let pgid = leaf.sibling(spid);
            let mut page = self.ctx.pool.pin_write(pgid)?;
            let chained = LeafPage::read_write(&page)?;
            let n = chained.objects.len();
            if n < capacity {
                let bytes = object.to_bytes();
                return insert_leaf_objects(&mut page, &log, LogMode::RedoUndo, n, &bytes);
            }
            tail = (pgid, chained);
        }

        let (tail_pgid, tail_page) = tail;
        let new_pgid = self.ctx.alloc.allocate_page(&log, leaf.vol, Segment::Index)?;
        let reservation = PageReservation::new(self.ctx.alloc, new_pgid);
        {
            let mut page = self.ctx.pool.pin_new(new_pgid)?;
            init_leaf_page(&mut page, &log, tail_page.iid, tail_page.n_keys)?;
            insert_leaf_objects(&mut page, &log, LogMode::RedoOnly, 0, &object.to_bytes())?;
        }
        let linked = LeafPage {
            overflow: Some(new_pgid.page),
            ..tail_page
        };
        let mut page = self.ctx.pool.pin_write(tail_pgid)?;
        write_image(&mut page, &log, &linked.encode(self.ctx.pool.body_size()))?;
        drop(page);

        let new_pgid = reservation.keep();
        log::debug!("chained overflow page {new_pgid} after {tail_pgid} of leaf {leaf}");
        Ok(())
    }

    /// A leaf followed by the pages of its overflow chain.
    fn leaf_chain(&self, leaf: PageId) -> Result<Vec<(PageId, LeafPage)>> {
        let mut chain = vec![];
        let mut next = Some(leaf);
        while let Some(pgid) = next {
            let page = self.ctx.pool.pin_read(pgid)?;
            let content = LeafPage::read(&page)?;
            next = content.overflow.map(|spid| leaf.sibling(spid));
            chain.push((pgid, content));
        }
        Ok(chain)
    }

    /// Stretches the extremes of every entry on the path to cover `kval`.
    fn widen(&self, frames: &[DirFrame], kval: &[u32]) -> Result<()> {
        let log = self.ctx.log_context();
        for frame in frames.iter().rev() {
            if let Some(wide) = frame.entry.widened(self.kdesc, kval) {
                let mut page = self.ctx.pool.pin_write(frame.pgid)?;
                update_directory_entry(&mut page, &log, frame.index, &wide.to_bytes())?;
            }
        }
        Ok(())
    }

    /// Puts the outcome of splitting the child at `frames[level].index` into the directory
    /// page `frames[level].pgid`.
    fn replace_and_insert(
        &self,
        frames: &[DirFrame],
        level: usize,
        outcome: SplitOutcome,
    ) -> Result<()> {
        let frame = &frames[level];
        {
            let mut page = self.ctx.pool.pin_write(frame.pgid)?;
            update_directory_entry(
                &mut page,
                &self.ctx.log_context(),
                frame.index,
                &outcome.src.to_bytes(),
            )?;
        }
        self.insert_entry(frames, level, frame.index, &outcome.dst)
    }

    /// Adds `entry` right after entry `after` of `frames[level].pgid`, splitting the page
    /// and continuing upwards when it is full.
    fn insert_entry(
        &self,
        frames: &[DirFrame],
        level: usize,
        after: usize,
        entry: &DirEntry,
    ) -> Result<()> {
        let pgid = frames[level].pgid;
        {
            let mut page = self.ctx.pool.pin_write(pgid)?;
            let dir = DirPage::read_write(&page)?;
            let capacity = directory_capacity(self.ctx.pool.body_size(), dir.n_keys as usize);
            if dir.entries.len() < capacity {
                return insert_directory_entries(
                    &mut page,
                    &self.ctx.log_context(),
                    LogMode::RedoUndo,
                    after + 1,
                    &entry.to_bytes(),
                );
            }
        }

        if level == 0 {
            let (child, whole) = self.grow_root()?;
            let outcome =
                split_directory_page(&self.ctx, self.kdesc, child, &whole, after, entry)?;
            let root = DirFrame {
                pgid: self.root,
                index: 0,
                entry: whole,
            };
            return self.replace_and_insert(&[root], 0, outcome);
        }

        let parent = &frames[level - 1];
        let outcome =
            split_directory_page(&self.ctx, self.kdesc, pgid, &parent.entry, after, entry)?;
        self.replace_and_insert(frames, level - 1, outcome)
    }

    /// Moves the root's entries one level down into a new page. The root is left with a
    /// single entry over the whole key space.
    fn grow_root(&self) -> Result<(PageId, DirEntry)> {
        let log = self.ctx.log_context();
        let root = self.read_dir(self.root)?;
        let child = self
            .ctx
            .alloc
            .allocate_page(&log, self.root.vol, Segment::Index)?;
        let reservation = PageReservation::new(self.ctx.alloc, child);
        {
            let mut page = self.ctx.pool.pin_new(child)?;
            init_directory(&mut page, &log, root.iid, root.height, false, root.n_keys)?;
            insert_directory_entries(
                &mut page,
                &log,
                LogMode::RedoOnly,
                0,
                &encode_entries(&root.entries),
            )?;
        }

        let whole = whole_space_bounds(self.kdesc, child.page, &root.entries);
        let grown = DirPage {
            height: root.height + 1,
            entries: vec![whole.clone()],
            ..root
        };
        let mut page = self.ctx.pool.pin_write(self.root)?;
        write_image(&mut page, &log, &grown.encode(self.ctx.pool.body_size()))?;
        drop(page);

        log::debug!(
            "index root {} grew to height {}",
            self.root,
            grown.height
        );
        Ok((reservation.keep(), whole))
    }

    /// Removes one stored object. Pages are never merged.
    pub(crate) fn delete(&self, kval: &[u32], oid: ObjectId) -> Result<()> {
        self.kdesc.check(kval)?;
        let (_, leaf) = self.descend(kval)?;
        let found = self.leaf_chain(leaf)?.into_iter().find_map(|(pgid, content)| {
            let at = content
                .objects
                .iter()
                .position(|o| o.kval == kval && o.oid == oid)?;
            Some((pgid, at))
        });
        let Some((pgid, at)) = found else {
            return Err(Error::NotFound(format!(
                "object {oid} with key {kval:x?} in index {}",
                self.root
            )));
        };
        let mut page = self.ctx.pool.pin_write(pgid)?;
        delete_leaf_objects(&mut page, &self.ctx.log_context(), LogMode::RedoUndo, at, 1)
    }

    /// Every object whose key lies in the box `[lower, upper]`, bounds included.
    pub(crate) fn search(&self, lower: &[u32], upper: &[u32]) -> Result<Vec<(Vec<u32>, ObjectId)>> {
        self.kdesc.check(lower)?;
        self.kdesc.check(upper)?;
        let mut found = vec![];
        let mut stack = vec![self.root];
        while let Some(pgid) = stack.pop() {
            let page = self.ctx.pool.pin_read(pgid)?;
            match page.kind() {
                PageType::MlgfDirectory => {
                    let dir = DirPage::read(&page)?;
                    stack.extend(
                        dir.entries
                            .iter()
                            .rev()
                            .filter(|e| e.intersects(self.kdesc, lower, upper))
                            .map(|e| pgid.sibling(e.spid)),
                    );
                }
                PageType::MlgfLeaf => {
                    let leaf = LeafPage::read(&page)?;
                    stack.extend(leaf.overflow.map(|spid| pgid.sibling(spid)));
                    found.extend(
                        leaf.objects
                            .into_iter()
                            .filter(|o| {
                                o.kval
                                    .iter()
                                    .zip(lower.iter().zip(upper))
                                    .all(|(k, (lo, hi))| lo <= k && k <= hi)
                            })
                            .map(|o| (o.kval, o.oid)),
                    );
                }
                kind => {
                    return Err(anyhow!("page {pgid} of index {} is {kind:?}", self.root).into())
                }
            }
        }
        Ok(found)
    }

    /// The object closest to `kval` on the leaf whose region holds `kval` or on its
    /// overflow chain, or `None` when they are empty. With `lock_leaf`, the leaf's key range
    /// is share-locked until commit before it is read.
    pub(crate) fn search_near_object(
        &self,
        kval: &[u32],
        lock_leaf: bool,
    ) -> Result<Option<(Vec<u32>, ObjectId)>> {
        self.kdesc.check(kval)?;
        let (_, leaf) = self.descend(kval)?;

        if let (true, Some(locks)) = (lock_leaf, self.ctx.locks) {
            let resource = LockResource::KeyRange(leaf);
            match locks.request(self.ctx.txid(), resource, LockMode::S, LockDuration::Commit)? {
                LockReply::Granted(_) => (),
                LockReply::Deadlock => return Err(Error::Deadlock { resource }),
            }
        }

        let objects = self
            .leaf_chain(leaf)?
            .into_iter()
            .flat_map(|(_, content)| content.objects);
        let distance = |o: &LeafObject| -> u64 {
            o.kval
                .iter()
                .zip(kval)
                .map(|(a, b)| a.abs_diff(*b) as u64)
                .sum()
        };
        Ok(objects
            .min_by_key(distance)
            .map(|o| (o.kval, o.oid)))
    }

    /// Every page of the index, in preorder.
    pub(crate) fn pages(&self) -> Result<Vec<PageId>> {
        let mut pages = vec![];
        let mut stack = vec![self.root];
        while let Some(pgid) = stack.pop() {
            pages.push(pgid);
            let page = self.ctx.pool.pin_read(pgid)?;
            match page.kind() {
                PageType::MlgfDirectory => {
                    let dir = DirPage::read(&page)?;
                    stack.extend(dir.entries.iter().rev().map(|e| pgid.sibling(e.spid)));
                }
                PageType::MlgfLeaf => {
                    let leaf = LeafPage::read(&page)?;
                    stack.extend(leaf.overflow.map(|spid| pgid.sibling(spid)));
                }
                _ => (),
            }
        }
        Ok(pages)
    }
}
