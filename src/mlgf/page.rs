use crate::bins::SliceExt;
use crate::error::Result;
use crate::id::{ObjectId, PageId, PageIdExt};
use crate::log::{LogKind, LogMode};
use crate::mlgf::key::{mask_upper, region, Extreme, KeyDesc};
use crate::pager::{LogContext, PageRead, PageType, PageWrite};
use anyhow::anyhow;
use std::ops::Range;

// Directory page body:
// iid (u32) | height (u16) | root flag (u8) | key count (u8) | entry count (u16) | entries
// entry: child page number (u32) | theta (u16) | valid bits per key (u8 each)
//        | extreme hash value per key (u32 each)
const DIR_IID_RANGE: Range<usize> = 0..4;
const DIR_HEIGHT_RANGE: Range<usize> = 4..6;
const DIR_ROOT_INDEX: usize = 6;
const DIR_NKEYS_INDEX: usize = 7;
const DIR_NENTRIES_RANGE: Range<usize> = 8..10;
pub(crate) const DIR_HEADER_SIZE: usize = 10;

// Leaf page body:
// iid (u32) | key count (u8) | object count (u16) | overflow page (u32) | objects
// object: hash value per key (u32 each) | data page (8) | slot (u16) | unique (u32)
const LEAF_IID_RANGE: Range<usize> = 0..4;
const LEAF_NKEYS_INDEX: usize = 4;
const LEAF_NOBJECTS_RANGE: Range<usize> = 5..7;
const LEAF_OVERFLOW_RANGE: Range<usize> = 7..11;
pub(crate) const LEAF_HEADER_SIZE: usize = 11;

const NO_OVERFLOW: u32 = u32::MAX;

pub(crate) fn entry_len(n_keys: usize) -> usize {
    4 + 2 + n_keys * (1 + 4)
}

pub(crate) fn object_len(n_keys: usize) -> usize {
    4 * n_keys + 8 + 2 + 4
}

pub(crate) fn directory_capacity(body_size: usize, n_keys: usize) -> usize {
    (body_size - DIR_HEADER_SIZE) / entry_len(n_keys)
}

pub(crate) fn leaf_capacity(body_size: usize, n_keys: usize) -> usize {
    (body_size - LEAF_HEADER_SIZE) / object_len(n_keys)
}

/// A directory entry: the region of a child page and the extreme values stored below it.
///
/// On every dimension the region is the set of hash values sharing the upper
/// `n_valid_bits[d]` bits of `hash[d]`. `hash[d]` itself is the smallest or the largest
/// value stored below the entry, depending on the dimension's `Extreme`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntry {
    pub(crate) spid: u32,
    /// Fewest valid bits among the entries of the child directory page.
    pub(crate) theta: u16,
    pub(crate) n_valid_bits: Vec<u8>,
    pub(crate) hash: Vec<u32>,
}

impl DirEntry {
    /// An entry covering the whole key space with nothing stored below it.
    pub(crate) fn whole_space(kdesc: &KeyDesc, spid: u32) -> Self {
        let n = kdesc.n_keys();
        Self {
            spid,
            theta: 0,
            n_valid_bits: vec![0; n],
            hash: (0..n)
                .map(|d| match kdesc.extreme(d) {
                    Extreme::Min => u32::MAX,
                    Extreme::Max => 0,
                })
                .collect(),
        }
    }

    pub(crate) fn decode(buff: &[u8], n_keys: usize) -> Self {
        let bits_at = 6;
        let hash_at = bits_at + n_keys;
        Self {
            spid: buff[0..4].read_u32(),
            theta: buff[4..6].read_u16(),
            n_valid_bits: buff[bits_at..hash_at].to_vec(),
            hash: (0..n_keys)
                .map(|d| buff[hash_at + 4 * d..hash_at + 4 * d + 4].read_u32())
                .collect(),
        }
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        let n_keys = self.hash.len();
        let bits_at = 6;
        let hash_at = bits_at + n_keys;
        buff[0..4].put_u32(self.spid);
        buff[4..6].put_u16(self.theta);
        buff[bits_at..hash_at].copy_from_slice(&self.n_valid_bits);
        for (d, hash) in self.hash.iter().enumerate() {
            buff[hash_at + 4 * d..hash_at + 4 * d + 4].put_u32(*hash);
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut buff = vec![0u8; entry_len(self.hash.len())];
        self.encode(&mut buff);
        buff
    }

    pub(crate) fn total_bits(&self) -> u16 {
        self.n_valid_bits.iter().map(|b| *b as u16).sum()
    }

    /// Whether `kval` falls in the entry's region.
    pub(crate) fn contains(&self, kval: &[u32]) -> bool {
        kval.iter()
            .zip(&self.hash)
            .zip(&self.n_valid_bits)
            .all(|((k, h), bits)| mask_upper(*k, *bits) == mask_upper(*h, *bits))
    }

    /// Inclusive range of values that may be stored below the entry on `dim`.
    pub(crate) fn bounds(&self, kdesc: &KeyDesc, dim: usize) -> (u32, u32) {
        let (low, high) = region(self.hash[dim], self.n_valid_bits[dim]);
        match kdesc.extreme(dim) {
            Extreme::Min => (self.hash[dim], high),
            Extreme::Max => (low, self.hash[dim]),
        }
    }

    pub(crate) fn intersects(&self, kdesc: &KeyDesc, lower: &[u32], upper: &[u32]) -> bool {
        (0..self.hash.len()).all(|d| {
            let (low, high) = self.bounds(kdesc, d);
            low <= upper[d] && high >= lower[d]
        })
    }

    /// The entry with its extremes stretched to cover `kval`, or `None` when they already do.
    pub(crate) fn widened(&self, kdesc: &KeyDesc, kval: &[u32]) -> Option<DirEntry> {
        let mut entry = self.clone();
        for (d, k) in kval.iter().enumerate() {
            entry.hash[d] = match kdesc.extreme(d) {
                Extreme::Min => entry.hash[d].min(*k),
                Extreme::Max => entry.hash[d].max(*k),
            };
        }
        (entry != *self).then_some(entry)
    }
}

pub(crate) fn encode_entries(entries: &[DirEntry]) -> Vec<u8> {
    entries.iter().flat_map(|e| e.to_bytes()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirPage {
    pub(crate) iid: u32,
    /// 1 when the children are leaf pages.
    pub(crate) height: u16,
    pub(crate) root: bool,
    pub(crate) n_keys: u8,
    pub(crate) entries: Vec<DirEntry>,
}

impl DirPage {
    pub(crate) fn decode(body: &[u8]) -> anyhow::Result<Self> {
        let n_keys = body[DIR_NKEYS_INDEX];
        let n = body[DIR_NENTRIES_RANGE].read_u16() as usize;
        if n_keys == 0 || n > directory_capacity(body.len(), n_keys as usize) {
            return Err(anyhow!(
                "directory page claims {n} entries of {n_keys} keys"
            ));
        }
        let len = entry_len(n_keys as usize);
        let entries = (0..n)
            .map(|i| {
                let offset = DIR_HEADER_SIZE + i * len;
                DirEntry::decode(&body[offset..offset + len], n_keys as usize)
            })
            .collect();
        Ok(Self {
            iid: body[DIR_IID_RANGE].read_u32(),
            height: body[DIR_HEIGHT_RANGE].read_u16(),
            root: body[DIR_ROOT_INDEX] != 0,
            n_keys,
            entries,
        })
    }

    pub(crate) fn read(page: &PageRead) -> Result<Self> {
        if page.kind() != PageType::MlgfDirectory {
            return Err(anyhow!("page {} is not a directory page", page.id()).into());
        }
        Ok(Self::decode(page.body())?)
    }

    pub(crate) fn read_write(page: &PageWrite) -> Result<Self> {
        if page.kind() != PageType::MlgfDirectory {
            return Err(anyhow!("page {} is not a directory page", page.id()).into());
        }
        Ok(Self::decode(page.body())?)
    }

    pub(crate) fn encode(&self, body_size: usize) -> Vec<u8> {
        let mut body = vec![0u8; body_size];
        body[DIR_IID_RANGE].put_u32(self.iid);
        body[DIR_HEIGHT_RANGE].put_u16(self.height);
        body[DIR_ROOT_INDEX] = self.root as u8;
        body[DIR_NKEYS_INDEX] = self.n_keys;
        body[DIR_NENTRIES_RANGE].put_u16(self.entries.len() as u16);
        let entries = encode_entries(&self.entries);
        body[DIR_HEADER_SIZE..DIR_HEADER_SIZE + entries.len()].copy_from_slice(&entries);
        body
    }

    /// Index of the entry whose region holds `kval`.
    pub(crate) fn find(&self, kval: &[u32]) -> Option<usize> {
        self.entries.iter().position(|e| e.contains(kval))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafObject {
    pub(crate) kval: Vec<u32>,
    pub(crate) oid: ObjectId,
}

impl LeafObject {
    fn decode(buff: &[u8], n_keys: usize) -> anyhow::Result<Self> {
        let kval = (0..n_keys).map(|d| buff[4 * d..4 * d + 4].read_u32()).collect();
        let at = 4 * n_keys;
        let page = PageId::from_be_bytes(buff[at..at + 8].try_into().unwrap())
            .ok_or_else(|| anyhow!("index object points to a nil page"))?;
        Ok(Self {
            kval,
            oid: ObjectId {
                page,
                slot: buff[at + 8..at + 10].read_u16(),
                unique: buff[at + 10..at + 14].read_u32(),
            },
        })
    }

    fn encode(&self, buff: &mut [u8]) {
        for (d, k) in self.kval.iter().enumerate() {
            buff[4 * d..4 * d + 4].put_u32(*k);
        }
        let at = 4 * self.kval.len();
        buff[at..at + 8].copy_from_slice(&self.oid.page.to_be_bytes());
        buff[at + 8..at + 10].put_u16(self.oid.slot);
        buff[at + 10..at + 14].put_u32(self.oid.unique);
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut buff = vec![0u8; object_len(self.kval.len())];
        self.encode(&mut buff);
        buff
    }
}

pub(crate) fn encode_objects(objects: &[LeafObject]) -> Vec<u8> {
    objects.iter().flat_map(|o| o.to_bytes()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafPage {
    pub(crate) iid: u32,
    pub(crate) n_keys: u8,
    pub(crate) objects: Vec<LeafObject>,
    /// Next page of objects sharing one key, on the same volume.
    pub(crate) overflow: Option<u32>,
}

impl LeafPage {
    pub(crate) fn decode(body: &[u8]) -> anyhow::Result<Self> {
        let n_keys = body[LEAF_NKEYS_INDEX];
        let n = body[LEAF_NOBJECTS_RANGE].read_u16() as usize;
        if n_keys == 0 || n > leaf_capacity(body.len(), n_keys as usize) {
            return Err(anyhow!("leaf page claims {n} objects of {n_keys} keys"));
        }
        let len = object_len(n_keys as usize);
        let objects = (0..n)
            .map(|i| {
                let offset = LEAF_HEADER_SIZE + i * len;
                LeafObject::decode(&body[offset..offset + len], n_keys as usize)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let overflow = body[LEAF_OVERFLOW_RANGE].read_u32();
        Ok(Self {
            iid: body[LEAF_IID_RANGE].read_u32(),
            n_keys,
            objects,
            overflow: (overflow != NO_OVERFLOW).then_some(overflow),
        })
    }

    pub(crate) fn read(page: &PageRead) -> Result<Self> {
        if page.kind() != PageType::MlgfLeaf {
            return Err(anyhow!("page {} is not an index leaf", page.id()).into());
        }
        Ok(Self::decode(page.body())?)
    }

    pub(crate) fn read_write(page: &PageWrite) -> Result<Self> {
        if page.kind() != PageType::MlgfLeaf {
            return Err(anyhow!("page {} is not an index leaf", page.id()).into());
        }
        Ok(Self::decode(page.body())?)
    }

    pub(crate) fn encode(&self, body_size: usize) -> Vec<u8> {
        let mut body = vec![0u8; body_size];
        body[LEAF_IID_RANGE].put_u32(self.iid);
        body[LEAF_NKEYS_INDEX] = self.n_keys;
        body[LEAF_NOBJECTS_RANGE].put_u16(self.objects.len() as u16);
        body[LEAF_OVERFLOW_RANGE].put_u32(self.overflow.unwrap_or(NO_OVERFLOW));
        let objects = encode_objects(&self.objects);
        body[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + objects.len()].copy_from_slice(&objects);
        body
    }
}

/// Where the fixed-size items of a directory or leaf page live.
struct ItemLayout {
    header: usize,
    count: Range<usize>,
    item_len: usize,
}

impl ItemLayout {
    fn of(page: &PageWrite, expected: PageType) -> Result<Self> {
        if page.kind() != expected {
            return Err(anyhow!("page {} is {:?}, not {expected:?}", page.id(), page.kind()).into());
        }
        let body = page.body();
        Ok(match expected {
            PageType::MlgfLeaf => Self {
                header: LEAF_HEADER_SIZE,
                count: LEAF_NOBJECTS_RANGE,
                item_len: object_len(body[LEAF_NKEYS_INDEX] as usize),
            },
            _ => Self {
                header: DIR_HEADER_SIZE,
                count: DIR_NENTRIES_RANGE,
                item_len: entry_len(body[DIR_NKEYS_INDEX] as usize),
            },
        })
    }

    fn len(&self, body: &[u8]) -> usize {
        body[self.count.clone()].read_u16() as usize
    }

    fn range(&self, start: usize, n: usize) -> Range<usize> {
        let from = self.header + start * self.item_len;
        from..from + n * self.item_len
    }

    fn check_insert(&self, pgid: PageId, body: &[u8], start: usize, bytes: &[u8]) -> Result<()> {
        let n = self.len(body);
        if start > n || bytes.len() % self.item_len != 0 {
            let len = bytes.len();
            return Err(anyhow!("bad insert of {len} bytes at {start} on page {pgid}").into());
        }
        if self.header + n * self.item_len + bytes.len() > body.len() {
            return Err(anyhow!("page {pgid} is full").into());
        }
        Ok(())
    }

    fn insert(&self, body: &mut [u8], start: usize, bytes: &[u8]) {
        let n = self.len(body);
        let tail = self.range(start, n - start);
        body.copy_within(tail.clone(), tail.start + bytes.len());
        body[tail.start..tail.start + bytes.len()].copy_from_slice(bytes);
        let k = bytes.len() / self.item_len;
        body[self.count.clone()].put_u16((n + k) as u16);
    }

    fn check_remove(&self, pgid: PageId, body: &[u8], start: usize, k: usize) -> Result<()> {
        if start + k > self.len(body) {
            return Err(anyhow!("cannot remove {k} items at {start} from page {pgid}").into());
        }
        Ok(())
    }

    fn remove(&self, body: &mut [u8], start: usize, k: usize) {
        let n = self.len(body);
        let tail = self.range(start + k, n - start - k);
        let end = tail.end;
        body.copy_within(tail, self.range(start, 0).start);
        body[end - k * self.item_len..end].fill(0);
        body[self.count.clone()].put_u16((n - k) as u16);
    }
}

pub(crate) fn init_directory(
    page: &mut PageWrite,
    ctx: &LogContext,
    iid: u32,
    height: u16,
    root: bool,
    n_keys: u8,
) -> Result<()> {
    let pgid = page.id();
    let stamp = ctx.record(LogMode::RedoOnly, || LogKind::MlgfInitDirectoryPage {
        pgid,
        iid,
        height,
        root,
        n_keys,
    })?;
    page.set_kind(PageType::MlgfDirectory);
    let body = page.body_mut();
    body.fill(0);
    body[DIR_IID_RANGE].put_u32(iid);
    body[DIR_HEIGHT_RANGE].put_u16(height);
    body[DIR_ROOT_INDEX] = root as u8;
    body[DIR_NKEYS_INDEX] = n_keys;
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn insert_directory_entries(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    start: usize,
    entries: &[u8],
) -> Result<()> {
    let layout = ItemLayout::of(page, PageType::MlgfDirectory)?;
    let pgid = page.id();
    layout.check_insert(pgid, page.body(), start, entries)?;
    let stamp = ctx.record(mode, || LogKind::MlgfInsertDirectoryEntries {
        pgid,
        start: start as u16,
        entries,
    })?;
    layout.insert(page.body_mut(), start, entries);
    page.stamp(stamp);
    Ok(())
}

/// Removes `n` entries from `start` on. The removed bytes go to the log for undo.
pub(crate) fn delete_directory_entries(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    start: usize,
    n: usize,
) -> Result<()> {
    let layout = ItemLayout::of(page, PageType::MlgfDirectory)?;
    let pgid = page.id();
    layout.check_remove(pgid, page.body(), start, n)?;
    let body = page.body();
    let stamp = ctx.record(mode, || LogKind::MlgfDeleteDirectoryEntries {
        pgid,
        start: start as u16,
        entries: &body[layout.range(start, n)],
    })?;
    layout.remove(page.body_mut(), start, n);
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn update_directory_entry(
    page: &mut PageWrite,
    ctx: &LogContext,
    index: usize,
    new: &[u8],
) -> Result<()> {
    let layout = ItemLayout::of(page, PageType::MlgfDirectory)?;
    let pgid = page.id();
    if index >= layout.len(page.body()) || new.len() != layout.item_len {
        return Err(anyhow!("bad update of entry {index} on page {pgid}").into());
    }
    let range = layout.range(index, 1);
    let body = page.body();
    let stamp = ctx.record(LogMode::RedoUndo, || LogKind::MlgfUpdateDirectoryEntry {
        pgid,
        index: index as u16,
        old: &body[range.clone()],
        new,
    })?;
    page.body_mut()[range].copy_from_slice(new);
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn init_leaf_page(
    page: &mut PageWrite,
    ctx: &LogContext,
    iid: u32,
    n_keys: u8,
) -> Result<()> {
    let pgid = page.id();
    let stamp = ctx.record(LogMode::RedoOnly, || LogKind::MlgfInitLeafPage {
        pgid,
        iid,
        n_keys,
    })?;
    page.set_kind(PageType::MlgfLeaf);
    let body = page.body_mut();
    body.fill(0);
    body[LEAF_IID_RANGE].put_u32(iid);
    body[LEAF_NKEYS_INDEX] = n_keys;
    body[LEAF_OVERFLOW_RANGE].put_u32(NO_OVERFLOW);
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn insert_leaf_objects(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    start: usize,
    objects: &[u8],
) -> Result<()> {
    let layout = ItemLayout::of(page, PageType::MlgfLeaf)?;
    let pgid = page.id();
    layout.check_insert(pgid, page.body(), start, objects)?;
    let stamp = ctx.record(mode, || LogKind::MlgfInsertLeafObjects {
        pgid,
        start: start as u16,
        objects,
    })?;
    layout.insert(page.body_mut(), start, objects);
    page.stamp(stamp);
    Ok(())
}

pub(crate) fn delete_leaf_objects(
    page: &mut PageWrite,
    ctx: &LogContext,
    mode: LogMode,
    start: usize,
    n: usize,
) -> Result<()> {
    let layout = ItemLayout::of(page, PageType::MlgfLeaf)?;
    let pgid = page.id();
    layout.check_remove(pgid, page.body(), start, n)?;
    let body = page.body();
    let stamp = ctx.record(mode, || LogKind::MlgfDeleteLeafObjects {
        pgid,
        start: start as u16,
        objects: &body[layout.range(start, n)],
    })?;
    layout.remove(page.body_mut(), start, n);
    page.stamp(stamp);
    Ok(())
}

/// Number of items a delete record covers.
pub(crate) fn deleted_count(page: &PageWrite, bytes: &[u8]) -> Result<usize> {
    let expected = match page.kind() {
        PageType::MlgfLeaf => PageType::MlgfLeaf,
        _ => PageType::MlgfDirectory,
    };
    let layout = ItemLayout::of(page, expected)?;
    Ok(bytes.len() / layout.item_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    fn entry(spid: u32, bits: &[u8], hash: &[u32]) -> DirEntry {
        DirEntry {
            spid,
            theta: 0,
            n_valid_bits: bits.to_vec(),
            hash: hash.to_vec(),
        }
    }

    #[test]
    fn test_entry_layout() {
        let e = entry(9, &[3, 1], &[0xa000_0000, 0x0000_00ff]);
        let bytes = e.to_bytes();
        assert_eq!(entry_len(2), bytes.len());
        assert_eq!(
            vec![
                0, 0, 0, 9, // spid
                0, 0, // theta
                3, 1, // valid bits
                0xa0, 0, 0, 0, // hash 0
                0, 0, 0, 0xff, // hash 1
            ],
            bytes
        );
        assert_eq!(e, DirEntry::decode(&bytes, 2));
        assert_eq!(4, e.total_bits());
    }

    #[test]
    fn test_entry_region() {
        let kdesc = KeyDesc::new(vec![Extreme::Min, Extreme::Max]).unwrap();
        let e = entry(1, &[4, 1], &[0xa100_0000, 0x0000_0010]);
        assert!(e.contains(&[0xafff_ffff, 0x7fff_ffff]));
        assert!(!e.contains(&[0xb000_0000, 0]));
        assert!(!e.contains(&[0xa000_0000, 0x8000_0000]));

        assert_eq!((0xa100_0000, 0xafff_ffff), e.bounds(&kdesc, 0));
        assert_eq!((0, 0x10), e.bounds(&kdesc, 1));
        assert!(e.intersects(&kdesc, &[0, 0], &[0xa100_0000, 0]));
        assert!(!e.intersects(&kdesc, &[0, 0], &[0xa0ff_ffff, u32::MAX]));
        assert!(!e.intersects(&kdesc, &[0, 0x11], &[u32::MAX, u32::MAX]));

        assert_eq!(None, e.widened(&kdesc, &[0xa200_0000, 0x5]));
        let wide = e.widened(&kdesc, &[0xa000_0001, 0x20]).unwrap();
        assert_eq!(vec![0xa000_0001, 0x20], wide.hash);
    }

    #[test]
    fn test_directory_mutations() {
        let env = TestEnv::new(1024, 8);
        let ctx = env.ctx().log_context();
        let mut page = env.pool.pin_new(PageId::new(0, 3).unwrap()).unwrap();
        init_directory(&mut page, &ctx, 77, 1, true, 2).unwrap();

        let entries = (0..4)
            .map(|i| entry(i, &[2, 0], &[i << 30, 0]))
            .collect::<Vec<_>>();
        insert_directory_entries(&mut page, &ctx, LogMode::RedoUndo, 0, &encode_entries(&entries))
            .unwrap();
        delete_directory_entries(&mut page, &ctx, LogMode::RedoUndo, 1, 2).unwrap();
        let updated = entry(3, &[2, 1], &[3 << 30, 7]);
        update_directory_entry(&mut page, &ctx, 1, &updated.to_bytes()).unwrap();

        let dir = DirPage::read_write(&page).unwrap();
        assert_eq!(77, dir.iid);
        assert!(dir.root);
        assert_eq!(vec![entries[0].clone(), updated], dir.entries);
        assert_eq!(Some(1), dir.find(&[0xc000_0000, 5]));
        assert_eq!(dir.encode(page.body().len()), page.body());
        assert_eq!(4, env.log.len());

        assert!(delete_directory_entries(&mut page, &ctx, LogMode::RedoUndo, 1, 2).is_err());
        assert_eq!(4, env.log.len(), "rejected mutations are not logged");
        assert_eq!(46, directory_capacity(992, 3));
    }

    #[test]
    fn test_leaf_mutations() {
        let env = TestEnv::new(1024, 8);
        let mut page = env.pool.pin_new(PageId::new(0, 4).unwrap()).unwrap();
        init_leaf_page(&mut page, &LogContext::Off, 5, 2).unwrap();
        let objects = (0..3)
            .map(|i| LeafObject {
                kval: vec![i, 100 - i],
                oid: ObjectId {
                    page: PageId::new(1, 50 + i).unwrap(),
                    slot: i as u16,
                    unique: 1000 + i,
                },
            })
            .collect::<Vec<_>>();
        let ctx = LogContext::Off;
        let rest = encode_objects(&objects[1..]);
        insert_leaf_objects(&mut page, &ctx, LogMode::RedoUndo, 0, &rest).unwrap();
        let first = objects[0].to_bytes();
        insert_leaf_objects(&mut page, &ctx, LogMode::RedoUndo, 0, &first).unwrap();
        assert_eq!(objects, LeafPage::read_write(&page).unwrap().objects);

        delete_leaf_objects(&mut page, &LogContext::Off, LogMode::RedoUndo, 0, 1).unwrap();
        let leaf = LeafPage::read_write(&page).unwrap();
        assert_eq!(&objects[1..], &leaf.objects[..]);
        assert_eq!(None, leaf.overflow);
        assert_eq!(leaf.encode(page.body().len()), page.body());

        let chained = LeafPage {
            overflow: Some(17),
            ..leaf.clone()
        };
        let decoded = LeafPage::decode(&chained.encode(page.body().len())).unwrap();
        assert_eq!(Some(17), decoded.overflow);
        assert_eq!(leaf.objects, decoded.objects);
        assert_eq!(2, deleted_count(&page, &encode_objects(&objects[1..])).unwrap());
        assert_eq!(44, leaf_capacity(992, 2));
    }
}
