use crate::error::{Error, Result};
use crate::id::PageId;
use crate::log::LogMode;
use crate::lot::node::{
    encode_node, init_leaf, init_node, max_entries, replace_entries, write_leaf, INode,
    INodeEntry,
};
use crate::pager::{write_image, PageType};
use crate::segment::Segment;
use crate::xact::XactContext;
use anyhow::anyhow;

/// One internal node on a root-to-leaf path.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) pgid: PageId,
    pub(crate) node: INode,
    /// Entry followed to the next level.
    pub(crate) index: usize,
}

/// Result of routing a byte offset from the root down to a leaf.
#[derive(Debug, Clone)]
pub(crate) struct TreePath {
    pub(crate) frames: Vec<Frame>,
    pub(crate) leaf: PageId,
    /// Object offset of the first byte stored in the leaf.
    pub(crate) leaf_start: u64,
    pub(crate) leaf_len: u64,
}

/// A byte stream stored as a tree of pages, rooted at a page that never moves.
pub(crate) struct LargeObject<'a> {
    ctx: XactContext<'a>,
    root: PageId,
}

impl<'a> LargeObject<'a> {
    pub(crate) fn create(ctx: XactContext<'a>, vol: u32, data: &[u8]) -> Result<PageId> {
        let log = ctx.log_context();
        let root = ctx.alloc.allocate_page(&log, vol, Segment::LargeObject)?;
        {
            let mut page = ctx.pool.pin_new(root)?;
            init_node(&mut page, &log, 1)?;
        }
        log::debug!("created large object {root}");
        Self::open(ctx, root).append(data)?;
        Ok(root)
    }

    pub(crate) fn open(ctx: XactContext<'a>, root: PageId) -> Self {
        Self { ctx, root }
    }

    pub(crate) fn size(&self) -> Result<u64> {
        let page = self.ctx.pool.pin_read(self.root)?;
        Ok(INode::read(&page)?.total())
    }

    fn read_node(&self, pgid: PageId) -> Result<INode> {
        let page = self.ctx.pool.pin_read(pgid)?;
        INode::read(&page)
    }

    /// Routes `offset` to the leaf holding it. Each node is searched for the first entry
    /// whose cumulative count exceeds the offset.
    pub(crate) fn traverse(&self, offset: u64) -> Result<TreePath> {
        let mut frames = vec![];
        let mut pgid = self.root;
        let mut relative = offset;
        let mut leaf_start = 0;
        let mut expected_height = None;

        loop {
            let node = self.read_node(pgid)?;
            if expected_height.is_some_and(|h| h != node.height) || node.height == 0 {
                return Err(anyhow!(
                    "node {pgid} has height {}, expected {expected_height:?}",
                    node.height
                )
                .into());
            }
            let Some(index) = node.find(relative) else {
                return Err(Error::bad_parameter(format!(
                    "offset {offset} is past the end of object {}",
                    self.root
                )));
            };

            let prev = if index == 0 {
                0
            } else {
                node.entries[index - 1].count
            };
            let child = node.child(pgid, index);
            let child_len = node.child_count(index);
            let height = node.height;
            frames.push(Frame { pgid, node, index });
            relative -= prev;
            leaf_start += prev;

            if height == 1 {
                return Ok(TreePath {
                    frames,
                    leaf: child,
                    leaf_start,
                    leaf_len: child_len,
                });
            }
            expected_height = Some(height - 1);
            pgid = child;
        }
    }

    pub(crate) fn read(&self, start: i64, length: i64) -> Result<Vec<u8>> {
        if start < 0 || length < 0 {
            return Err(Error::bad_parameter(format!(
                "cannot read {length} bytes at {start}"
            )));
        }
        if length == 0 {
            return Ok(vec![]);
        }

        let (start, end) = (start as u64, start as u64 + length as u64);
        let size = self.size()?;
        if end > size {
            return Err(Error::bad_parameter(format!(
                "range [{start}, {end}) is outside the object of {size} bytes"
            )));
        }

        let mut out = Vec::with_capacity(length as usize);
        let mut offset = start;
        while offset < end {
            let path = self.traverse(offset)?;
            let in_leaf = offset - path.leaf_start;
            let n = (path.leaf_len - in_leaf).min(end - offset);

            let page = self.ctx.pool.pin_read(path.leaf)?;
            if page.kind() != PageType::LotLeaf {
                return Err(anyhow!("page {} is not a large object leaf", path.leaf).into());
            }
            let from = in_leaf as usize;
            out.extend_from_slice(&page.body()[from..from + n as usize]);
            offset += n;
        }
        Ok(out)
    }

    /// Overwrites `length` bytes at `start`, extending the object when the range runs past
    /// its end. A zero length touches nothing.
    pub(crate) fn write(&self, start: i64, length: i64, data: Option<&[u8]>) -> Result<()> {
        if start < 0 || length < 0 {
            return Err(Error::bad_parameter(format!(
                "cannot write {length} bytes at {start}"
            )));
        }
        if length == 0 {
            return Ok(());
        }
        let Some(data) = data else {
            return Err(Error::bad_parameter(format!(
                "no data given for a write of {length} bytes"
            )));
        };
        if (data.len() as u64) < length as u64 {
            return Err(Error::bad_parameter(format!(
                "write of {length} bytes got a buffer of {} bytes",
                data.len()
            )));
        }
        let data = &data[..length as usize];
        let start = start as u64;

        let size = self.size()?;
        if start > size {
            return Err(Error::bad_parameter(format!(
                "start {start} is past the end of the object ({size} bytes)"
            )));
        }

        let overlap = ((size - start) as usize).min(data.len());
        self.overwrite(start, &data[..overlap])?;
        self.append(&data[overlap..])
    }

    fn overwrite(&self, mut offset: u64, mut data: &[u8]) -> Result<()> {
        let log = self.ctx.log_context();
        while !data.is_empty() {
            let path = self.traverse(offset)?;
            let in_leaf = (offset - path.leaf_start) as usize;
            let n = ((path.leaf_len as usize) - in_leaf).min(data.len());

            let mut page = self.ctx.pool.pin_write(path.leaf)?;
            write_leaf(&mut page, &log, LogMode::RedoUndo, in_leaf, &data[..n])?;
            drop(page);

            offset += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Frames along the right edge of the tree, ending at the node right above the leaves.
    fn right_edge(&self) -> Result<Vec<Frame>> {
        let mut frames = vec![];
        let mut pgid = self.root;
        loop {
            let node = self.read_node(pgid)?;
            let height = node.height;
            let last = node.entries.len().checked_sub(1);
            frames.push(Frame {
                pgid,
                node,
                index: last.unwrap_or(0),
            });
            if height <= 1 {
                return Ok(frames);
            }
            let Some(last) = last else {
                return Err(anyhow!("internal node {pgid} at height {height} is empty").into());
            };
            pgid = frames[frames.len() - 1].node.child(pgid, last);
        }
    }

    pub(crate) fn append(&self, mut data: &[u8]) -> Result<()> {
        let log = self.ctx.log_context();
        let capacity = self.ctx.pool.body_size();

        while !data.is_empty() {
            let frames = self.right_edge()?;
            let bottom = &frames[frames.len() - 1];

            if let Some(last) = bottom.node.entries.len().checked_sub(1) {
                let leaf_len = bottom.node.child_count(last) as usize;
                if leaf_len < capacity {
                    let n = (capacity - leaf_len).min(data.len());
                    let leaf = bottom.node.child(bottom.pgid, last);
                    let mut page = self.ctx.pool.pin_write(leaf)?;
                    write_leaf(&mut page, &log, LogMode::RedoUndo, leaf_len, &data[..n])?;
                    drop(page);

                    self.grow_counts(&frames, n as u64)?;
                    data = &data[n..];
                    continue;
                }
            }

            let n = capacity.min(data.len());
            let leaf = self.new_leaf(&data[..n])?;
            self.push_right(&frames, leaf, n as u64)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Adds `n` to the last entry of every given frame.
    fn grow_counts(&self, frames: &[Frame], n: u64) -> Result<()> {
        let log = self.ctx.log_context();
        for frame in frames.iter().rev() {
            let Some(last) = frame.node.entries.len().checked_sub(1) else {
                return Err(anyhow!("node {} has no entry to grow", frame.pgid).into());
            };
            let entry = frame.node.entries[last];
            let mut page = self.ctx.pool.pin_write(frame.pgid)?;
            replace_entries(
                &mut page,
                &log,
                LogMode::RedoUndo,
                last,
                &[INodeEntry {
                    spid: entry.spid,
                    count: entry.count + n,
                }],
            )?;
        }
        Ok(())
    }

    /// Hangs a new subtree of `n` bytes off the right edge, starting new right siblings for
    /// full nodes and growing the root when it is full as well.
    fn push_right(&self, frames: &[Frame], child: PageId, n: u64) -> Result<()> {
        let log = self.ctx.log_context();
        let max = max_entries(self.ctx.pool.body_size());
        let mut carry = child;

        for level in (0..frames.len()).rev() {
            let frame = &frames[level];
            let total = frame.node.total();
            let len = frame.node.entries.len();

            if len < max {
                let mut page = self.ctx.pool.pin_write(frame.pgid)?;
                replace_entries(
                    &mut page,
                    &log,
                    LogMode::RedoUndo,
                    len,
                    &[INodeEntry {
                        spid: carry.page,
                        count: total + n,
                    }],
                )?;
                drop(page);
                return self.grow_counts(&frames[..level], n);
            }

            let sibling = self.new_node(frame.node.height, carry, n)?;
            if level == 0 {
                self.grow_root(frame)?;
                let mut page = self.ctx.pool.pin_write(self.root)?;
                return replace_entries(
                    &mut page,
                    &log,
                    LogMode::RedoUndo,
                    1,
                    &[INodeEntry {
                        spid: sibling.page,
                        count: total + n,
                    }],
                );
            }
            carry = sibling;
        }

        Err(anyhow!("large object {} has no root frame", self.root).into())
    }

    /// Moves the root's entries to a new child one level down, leaving the root with a
    /// single entry over that child.
    fn grow_root(&self, root: &Frame) -> Result<()> {
        let log = self.ctx.log_context();
        let moved = self
            .ctx
            .alloc
            .allocate_page(&log, self.root.vol, Segment::LargeObject)?;
        {
            let mut page = self.ctx.pool.pin_new(moved)?;
            init_node(&mut page, &log, root.node.height)?;
            replace_entries(&mut page, &log, LogMode::RedoOnly, 0, &root.node.entries)?;
        }

        let body = encode_node(
            self.ctx.pool.body_size(),
            root.node.height + 1,
            &[INodeEntry {
                spid: moved.page,
                count: root.node.total(),
            }],
        );
        let mut page = self.ctx.pool.pin_write(self.root)?;
        write_image(&mut page, &log, &body)?;
        log::debug!(
            "large object {} grew to height {}",
            self.root,
            root.node.height + 1
        );
        Ok(())
    }

    fn new_node(&self, height: u16, child: PageId, n: u64) -> Result<PageId> {
        let log = self.ctx.log_context();
        let pgid = self
            .ctx
            .alloc
            .allocate_page(&log, self.root.vol, Segment::LargeObject)?;
        let mut page = self.ctx.pool.pin_new(pgid)?;
        init_node(&mut page, &log, height)?;
        replace_entries(
            &mut page,
            &log,
            LogMode::RedoOnly,
            0,
            &[INodeEntry {
                spid: child.page,
                count: n,
            }],
        )?;
        Ok(pgid)
    }

    fn new_leaf(&self, data: &[u8]) -> Result<PageId> {
        let log = self.ctx.log_context();
        let pgid = self
            .ctx
            .alloc
            .allocate_page(&log, self.root.vol, Segment::LargeObject)?;
        let mut page = self.ctx.pool.pin_new(pgid)?;
        init_leaf(&mut page, &log)?;
        write_leaf(&mut page, &log, LogMode::RedoOnly, 0, data)?;
        Ok(pgid)
    }

    /// Every page of the object, in preorder.
    pub(crate) fn pages(&self) -> Result<Vec<PageId>> {
        let mut pages = vec![];
        let mut stack = vec![self.root];
        while let Some(pgid) = stack.pop() {
            pages.push(pgid);
            let node = self.read_node(pgid)?;
            if node.height == 1 {
                pages.extend((0..node.entries.len()).map(|i| node.child(pgid, i)));
            } else {
                stack.extend((0..node.entries.len()).rev().map(|i| node.child(pgid, i)));
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::LogContext;
    use crate::testing::TestEnv;
    use rand::{Rng, SeedableRng};

    fn random_bytes(n: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_write_read_round_trip() {
        let env = TestEnv::new(1024, 16);
        let data = random_bytes(3000, 1);
        let root = LargeObject::create(env.ctx(), 0, &data).unwrap();
        let object = LargeObject::open(env.ctx(), root);
        assert_eq!(3000, object.size().unwrap());
        assert_eq!(data, object.read(0, 3000).unwrap());

        let patch = random_bytes(1200, 2);
        object.write(500, 1200, Some(&patch)).unwrap();
        assert_eq!(patch, object.read(500, 1200).unwrap());
        assert_eq!(&data[..500], &object.read(0, 500).unwrap()[..]);
        assert_eq!(&data[1700..], &object.read(1700, 1300).unwrap()[..]);

        // overlapping the end extends the object
        let tail = random_bytes(800, 3);
        object.write(2800, 800, Some(&tail)).unwrap();
        assert_eq!(3600, object.size().unwrap());
        assert_eq!(tail, object.read(2800, 800).unwrap());
        assert_eq!(0, env.pool.pinned_frames());
    }

    #[test]
    fn test_zero_length_write_touches_nothing() {
        let env = TestEnv::new(1024, 16);
        let root = LargeObject::create(env.ctx(), 0, b"abc").unwrap();
        let object = LargeObject::open(env.ctx(), root);

        let pins = env.pool.stats().pins;
        let records = env.log.len();
        object.write(1, 0, Some(b"zzz")).unwrap();
        object.write(1_000_000, 0, None).unwrap();
        assert_eq!(pins, env.pool.stats().pins);
        assert_eq!(records, env.log.len());
        assert_eq!(b"abc".to_vec(), object.read(0, 3).unwrap());
    }

    #[test]
    fn test_bad_parameters() {
        let env = TestEnv::new(1024, 16);
        let root = LargeObject::create(env.ctx(), 0, b"hello").unwrap();
        let object = LargeObject::open(env.ctx(), root);

        for (start, length) in [(-1, 3), (0, -1), (-5, -5), (i64::MIN, 0)] {
            let err = object.write(start, length, Some(b"xyz")).unwrap_err();
            assert!(matches!(err, Error::BadParameter(_)), "{start} {length}");
        }
        assert!(matches!(
            object.write(0, 3, None),
            Err(Error::BadParameter(_))
        ));
        assert!(matches!(
            object.write(0, 4, Some(b"xyz")),
            Err(Error::BadParameter(_))
        ));
        assert!(matches!(
            object.write(6, 1, Some(b"x")),
            Err(Error::BadParameter(_))
        ));
        assert!(matches!(object.read(3, 3), Err(Error::BadParameter(_))));
        assert!(matches!(object.read(-1, 3), Err(Error::BadParameter(_))));

        // writing at the very end appends
        object.write(5, 1, Some(b"!")).unwrap();
        assert_eq!(b"hello!".to_vec(), object.read(0, 6).unwrap());
    }

    #[test]
    fn test_append_grows_root_in_place() {
        let env = TestEnv::new(1024, 16);
        let data = random_bytes(200_000, 4);
        let root = LargeObject::create(env.ctx(), 0, &data[..10]).unwrap();
        let object = LargeObject::open(env.ctx(), root);
        for chunk in data[10..].chunks(7_000) {
            object.append(chunk).unwrap();
        }

        assert_eq!(200_000, object.size().unwrap());
        let path = object.traverse(199_999).unwrap();
        assert_eq!(2, path.frames.len());
        assert_eq!(root, path.frames[0].pgid);
        assert_eq!(2, path.frames[0].node.height);
        // 82 leaves per node, the first two nodes are full
        assert_eq!(3, path.frames[0].node.entries.len());
        assert_eq!(data, object.read(0, 200_000).unwrap());

        let pages = object.pages().unwrap();
        assert_eq!(root, pages[0]);
        assert_eq!(1 + 3 + 202, pages.len());
        assert_eq!(0, env.pool.pinned_frames());
    }

    #[test]
    fn test_traverse_takes_first_entry_past_offset() {
        let env = TestEnv::new(1024, 16);
        let data = random_bytes(2000, 5);
        let root = LargeObject::create(env.ctx(), 0, &data).unwrap();
        let object = LargeObject::open(env.ctx(), root);

        let path = object.traverse(991).unwrap();
        assert_eq!(0, path.frames[0].index);
        let path = object.traverse(992).unwrap();
        assert_eq!(1, path.frames[0].index);
        assert_eq!(992, path.leaf_start);
        assert_eq!(992, path.leaf_len);
        assert!(matches!(
            object.traverse(2000),
            Err(Error::BadParameter(_))
        ));
    }

    fn build_node(env: &TestEnv, page: u32, height: u16, entries: &[INodeEntry]) -> PageId {
        let pgid = PageId::new(0, page).unwrap();
        let mut guard = env.pool.pin_new(pgid).unwrap();
        init_node(&mut guard, &LogContext::Off, height).unwrap();
        replace_entries(&mut guard, &LogContext::Off, LogMode::RedoOnly, 0, entries).unwrap();
        pgid
    }

    fn build_leaf(env: &TestEnv, page: u32, data: &[u8]) -> PageId {
        let pgid = PageId::new(0, page).unwrap();
        let mut guard = env.pool.pin_new(pgid).unwrap();
        init_leaf(&mut guard, &LogContext::Off).unwrap();
        write_leaf(&mut guard, &LogContext::Off, LogMode::RedoOnly, 0, data).unwrap();
        pgid
    }

    #[test]
    fn test_write_routes_to_second_child_only() {
        let mut env = TestEnv::new(1024, 16);
        let entry = |spid, count| INodeEntry { spid, count };
        let root = build_node(&env, 1, 2, &[entry(2, 100), entry(3, 250), entry(4, 400)]);
        let first = build_node(&env, 2, 1, &[entry(5, 100)]);
        let second = build_node(&env, 3, 1, &[entry(6, 150)]);
        let third = build_node(&env, 4, 1, &[entry(7, 150)]);
        let leaves = [
            build_leaf(&env, 5, &[1u8; 100]),
            build_leaf(&env, 6, &[2u8; 150]),
            build_leaf(&env, 7, &[3u8; 150]),
        ];
        env.cold_pool();

        let object = LargeObject::open(env.ctx(), root);
        object.write(120, 50, Some(&[9u8; 50])).unwrap();

        assert!(env.pool.is_resident(root));
        assert!(env.pool.is_resident(second));
        assert!(env.pool.is_resident(leaves[1]));
        for untouched in [first, third, leaves[0], leaves[2]] {
            assert!(!env.pool.is_resident(untouched), "{untouched} was loaded");
        }

        let second_leaf = env.pool.pin_read(leaves[1]).unwrap();
        assert_eq!(&[2u8; 20], &second_leaf.body()[..20]);
        assert_eq!(&[9u8; 50], &second_leaf.body()[20..70]);
        assert_eq!(&[2u8; 80], &second_leaf.body()[70..150]);
    }
}
