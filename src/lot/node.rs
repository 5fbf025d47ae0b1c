use crate::bins::SliceExt;
use crate::error::Result;
use crate::id::{PageId, ShortPageId};
use crate::log::{LogKind, LogMode};
use crate::pager::{LogContext, PageRead, PageType, PageWrite};
use anyhow::anyhow;
use std::ops::Range;

// Internal node body:
// height (u16) | entry count (u16) | entries
// entry: child page number (u32) | cumulative byte count (u64)
const INODE_HEIGHT_RANGE: Range<usize> = 0..2;
const INODE_COUNT_RANGE: Range<usize> = 2..4;
pub(crate) const INODE_HEADER_SIZE: usize = 4;

pub(crate) const INODE_ENTRY_SIZE: usize = 12;
const INODE_ENTRY_SPID_RANGE: Range<usize> = 0..4;
const INODE_ENTRY_COUNT_RANGE: Range<usize> = 4..12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct INodeEntry {
    pub(crate) spid: ShortPageId,
    /// Bytes stored under this entry and every entry before it.
    pub(crate) count: u64,
}

impl INodeEntry {
    fn decode(buff: &[u8]) -> Self {
        Self {
            spid: buff[INODE_ENTRY_SPID_RANGE].read_u32(),
            count: buff[INODE_ENTRY_COUNT_RANGE].read_u64(),
        }
    }

    fn encode(&self, buff: &mut [u8]) {
        buff[INODE_ENTRY_SPID_RANGE].put_u32(self.spid);
        buff[INODE_ENTRY_COUNT_RANGE].put_u64(self.count);
    }
}

pub(crate) fn encode_entries(entries: &[INodeEntry]) -> Vec<u8> {
    let mut buff = vec![0u8; entries.len() * INODE_ENTRY_SIZE];
    for (i, entry) in entries.iter().enumerate() {
        entry.encode(&mut buff[i * INODE_ENTRY_SIZE..(i + 1) * INODE_ENTRY_SIZE]);
    }
    buff
}

pub(crate) fn max_entries(body_size: usize) -> usize {
    (body_size - INODE_HEADER_SIZE) / INODE_ENTRY_SIZE
}

/// Builds a complete node body, as written by a page image record.
pub(crate) fn encode_node(body_size: usize, height: u16, entries: &[INodeEntry]) -> Vec<u8> {
    let mut body = vec![0u8; body_size];
    body[INODE_HEIGHT_RANGE].put_u16(height);
    body[INODE_COUNT_RANGE].put_u16(entries.len() as u16);
    let encoded = encode_entries(entries);
    body[INODE_HEADER_SIZE..INODE_HEADER_SIZE + encoded.len()].copy_from_slice(&encoded);
    body
}

/// A decoded internal node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct INode {
    pub(crate) height: u16,
    pub(crate) entries: Vec<INodeEntry>,
}

impl INode {
    pub(crate) fn decode(body: &[u8]) -> anyhow::Result<Self> {
        let height = body[INODE_HEIGHT_RANGE].read_u16();
        let n = body[INODE_COUNT_RANGE].read_u16() as usize;
        if n > max_entries(body.len()) {
            return Err(anyhow!("internal node claims {n} entries"));
        }
        let entries = (0..n)
            .map(|i| {
                let offset = INODE_HEADER_SIZE + i * INODE_ENTRY_SIZE;
                INodeEntry::decode(&body[offset..offset + INODE_ENTRY_SIZE])
            })
            .collect();
        Ok(Self { height, entries })
    }

    pub(crate) fn read(page: &PageRead) -> Result<Self> {
        if page.kind() != PageType::LotNode {
            return Err(anyhow!("page {} is not a large object node", page.id()).into());
        }
        Ok(Self::decode(page.body())?)
    }

    pub(crate) fn read_write(page: &PageWrite) -> Result<Self> {
        if page.kind() != PageType::LotNode {
            return Err(anyhow!("page {} is not a large object node", page.id()).into());
        }
        Ok(Self::decode(page.body())?)
    }

    /// Total bytes stored under this node.
    pub(crate) fn total(&self) -> u64 {
        self.entries.last().map(|e| e.count).unwrap_or(0)
    }

    /// Byte count of the subtree under entry `i`.
    pub(crate) fn child_count(&self, i: usize) -> u64 {
        let prev = if i == 0 { 0 } else { self.entries[i - 1].count };
        self.entries[i].count - prev
    }

    /// Index of the first entry whose cumulative count exceeds `offset`.
    pub(crate) fn find(&self, offset: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.count > offset)
    }

    pub(crate) fn child(&self, pgid: PageId, i: usize) -> PageId {
        pgid.sibling(self.entries[i].spid)
    }
}

pub(crate) fn init_node(page: &mut PageWrite, ctx: &LogContext, height: u16) -> Result<()> {
    let pgid = page.id();
    let stamp = ctx.record(LogMode::RedoOnly, || LogKind::LotInitNode { pgid, height })?;

    page.set_kind(PageType::LotNode);
    let body = page.body_mut();
    body.fill(0);
    body[INODE_HEIGHT_RANGE].put_u16(height);
    body[INODE_COUNT_RANGE].put_u16(0);
    page.stamp(stamp);
    Ok(())
}

/// Replaces every entry from `start` on with `new`.
pub(crate) fn replace_entries(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    start: usize,
    new: &[INodeEntry],
) -> Result<()> {
    replace_entries_raw(page, ctx, mode, start, &encode_entries(new))
}

pub(crate) fn replace_entries_raw(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    start: usize,
    new: &[u8],
) -> Result<()> {
    if page.kind() != PageType::LotNode {
        return Err(anyhow!("page {} is not a large object node", page.id()).into());
    }
    let body = page.body();
    let n = body[INODE_COUNT_RANGE].read_u16() as usize;
    if start > n || new.len() % INODE_ENTRY_SIZE != 0 {
        return Err(anyhow!("bad entry replacement at {start} on node {}", page.id()).into());
    }
    let new_n = start + new.len() / INODE_ENTRY_SIZE;
    if new_n > max_entries(body.len()) {
        return Err(anyhow!("node {} overflows with {new_n} entries", page.id()).into());
    }

    let from = INODE_HEADER_SIZE + start * INODE_ENTRY_SIZE;
    let to = INODE_HEADER_SIZE + n * INODE_ENTRY_SIZE;
    let pgid = page.id();
    let stamp = ctx.record(mode, || LogKind::LotReplaceEntries {
        pgid,
        start: start as u16,
        old: &body[from..to],
        new,
    })?;

    let body = page.body_mut();
    body[from..from + new.len()].copy_from_slice(new);
    body[from + new.len()..to.max(from + new.len())].fill(0);
    body[INODE_COUNT_RANGE].put_u16(new_n as u16);
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn init_leaf(page: &mut PageWrite, ctx: &LogContext) -> Result<()> {
    let pgid = page.id();
    let stamp = ctx.record(LogMode::RedoOnly, || LogKind::LotInitLeaf { pgid })?;
    page.set_kind(PageType::LotLeaf);
    page.body_mut().fill(0);
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn write_leaf(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    offset: usize,
    data: &[u8],
) -> Result<()> {
    if page.kind() != PageType::LotLeaf {
        return Err(anyhow!("page {} is not a large object leaf", page.id()).into());
    }
    let end = offset + data.len();
    if end > page.body().len() {
        return Err(anyhow!("write [{offset}, {end}) overflows leaf {}", page.id()).into());
    }

    let pgid = page.id();
    let body = page.body();
    let stamp = ctx.record(mode, || LogKind::LotWriteLeaf {
        pgid,
        offset: offset as u16,
        old: &body[offset..end],
        new: data,
    })?;
    page.body_mut()[offset..end].copy_from_slice(data);
    page.stamp(stamp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    #[test]
    fn test_node_layout() {
        let env = TestEnv::new(1024, 8);
        let pgid = PageId::new(0, 1).unwrap();
        let mut page = env.pool.pin_new(pgid).unwrap();
        init_node(&mut page, &LogContext::Off, 1).unwrap();
        let entries = [
            INodeEntry { spid: 7, count: 100 },
            INodeEntry { spid: 9, count: 250 },
        ];
        replace_entries(&mut page, &LogContext::Off, LogMode::RedoUndo, 0, &entries).unwrap();

        assert_eq!(
            &[
                0x00, 0x01, 0x00, 0x02, // height=1, count=2
                0x00, 0x00, 0x00, 0x07, 0, 0, 0, 0, 0, 0, 0, 100, // spid=7 count=100
                0x00, 0x00, 0x00, 0x09, 0, 0, 0, 0, 0, 0, 0, 250, // spid=9 count=250
            ],
            &page.body()[..28]
        );

        let node = INode::read_write(&page).unwrap();
        assert_eq!(250, node.total());
        assert_eq!(150, node.child_count(1));
        assert_eq!(Some(0), node.find(99));
        assert_eq!(Some(1), node.find(100));
        assert_eq!(None, node.find(250));
        assert_eq!(82, max_entries(env.pool.body_size()));
    }

    #[test]
    fn test_replace_tail_shrinks_node() {
        let env = TestEnv::new(1024, 8);
        let pgid = PageId::new(0, 1).unwrap();
        let mut page = env.pool.pin_new(pgid).unwrap();
        let ctx = env.ctx().log_context();
        init_node(&mut page, &ctx, 2).unwrap();
        let entries = (0..5)
            .map(|i| INodeEntry {
                spid: i,
                count: (i as u64 + 1) * 10,
            })
            .collect::<Vec<_>>();
        replace_entries(&mut page, &ctx, LogMode::RedoUndo, 0, &entries).unwrap();
        let entry = INodeEntry { spid: 99, count: 21 };
        replace_entries(&mut page, &ctx, LogMode::RedoUndo, 2, &[entry]).unwrap();

        let node = INode::read_write(&page).unwrap();
        assert_eq!(3, node.entries.len());
        assert_eq!(INodeEntry { spid: 99, count: 21 }, node.entries[2]);
        assert!(page.body()[INODE_HEADER_SIZE + 3 * INODE_ENTRY_SIZE..]
            .iter()
            .all(|b| *b == 0));
        assert_eq!(3, env.log.len());
        assert!(page.is_dirty());
    }

    #[test]
    fn test_leaf_write_bounds() {
        let env = TestEnv::new(1024, 8);
        let mut page = env.pool.pin_new(PageId::new(0, 2).unwrap()).unwrap();
        init_leaf(&mut page, &LogContext::Off).unwrap();
        write_leaf(&mut page, &LogContext::Off, LogMode::RedoUndo, 990, b"ab").unwrap();
        assert!(write_leaf(&mut page, &LogContext::Off, LogMode::RedoUndo, 991, b"ab").is_err());
    }
}
