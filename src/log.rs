use crate::bins::{pad8, SliceExt};
use crate::id::{Lsn, LsnExt, PageId, PageIdExt, TxId, TxIdExt};
use anyhow::anyhow;

/// Which halves of a record recovery may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogMode {
    RedoOnly,
    UndoOnly,
    RedoUndo,
}

impl LogMode {
    fn code(self) -> u8 {
        match self {
            LogMode::RedoOnly => 1,
            LogMode::UndoOnly => 2,
            LogMode::RedoUndo => 3,
        }
    }

    fn from_code(code: u8) -> anyhow::Result<Self> {
        match code {
            1 => Ok(LogMode::RedoOnly),
            2 => Ok(LogMode::UndoOnly),
            3 => Ok(LogMode::RedoUndo),
            _ => Err(anyhow!("invalid log mode {code}")),
        }
    }

    pub(crate) fn has_redo(self) -> bool {
        matches!(self, LogMode::RedoOnly | LogMode::RedoUndo)
    }

    pub(crate) fn has_undo(self) -> bool {
        matches!(self, LogMode::UndoOnly | LogMode::RedoUndo)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LogRecord<'a> {
    pub(crate) txid: TxId,
    pub(crate) prev_lsn: Option<Lsn>,
    /// Set on compensation records: the next record of the chain still to be undone.
    pub(crate) undo_next: Option<Lsn>,
    pub(crate) mode: LogMode,
    pub(crate) kind: LogKind<'a>,
}

pub(crate) const RECORD_HEADER_SIZE: usize = 30;
const RECORD_CHECKSUM_SIZE: usize = 8;

impl LogRecord<'_> {
    pub(crate) fn size(&self) -> usize {
        Self::size_by_payload_size(self.kind.size())
    }

    /// Total encoded size of the record whose first `RECORD_HEADER_SIZE` bytes are `header`.
    pub(crate) fn size_from_header(header: &[u8]) -> usize {
        Self::size_by_payload_size(header[24..28].read_u32() as usize)
    }

    fn size_by_payload_size(payload_size: usize) -> usize {
        // txid(8) | prev_lsn(8) | undo_next(8) | payload size(4) | action(1) | mode(1)
        // | payload | pad to 8 | checksum(8)
        pad8(RECORD_HEADER_SIZE + payload_size) + RECORD_CHECKSUM_SIZE
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        let payload_size = self.kind.size();
        let size = Self::size_by_payload_size(payload_size);
        assert_eq!(size, buff.len());

        buff[0..8].copy_from_slice(&self.txid.to_be_bytes());
        buff[8..16].copy_from_slice(&self.prev_lsn.to_be_bytes());
        buff[16..24].copy_from_slice(&self.undo_next.to_be_bytes());
        buff[24..28].put_u32(payload_size as u32);
        buff[28] = self.kind.action();
        buff[29] = self.mode.code();
        self.kind
            .encode(&mut buff[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_size]);

        let next = pad8(RECORD_HEADER_SIZE + payload_size);
        buff[RECORD_HEADER_SIZE + payload_size..next].fill(0);
        let checksum = crc64::crc64(0x1d0f, &buff[0..next]);
        buff[next..next + 8].copy_from_slice(&checksum.to_be_bytes());
    }

    pub(crate) fn decode(buff: &[u8]) -> LogDecodeResult<'_> {
        if buff.len() < RECORD_HEADER_SIZE {
            return LogDecodeResult::NeedMoreBytes;
        }

        let payload_size = buff[24..28].read_u32() as usize;
        let size = Self::size_by_payload_size(payload_size);
        if buff.len() < size {
            return LogDecodeResult::NeedMoreBytes;
        }

        let next = size - RECORD_CHECKSUM_SIZE;
        let calculated_checksum = crc64::crc64(0x1d0f, &buff[0..next]);
        let stored_checksum = buff[next..].read_u64();
        if calculated_checksum != stored_checksum {
            return LogDecodeResult::Incomplete;
        }

        let Some(txid) = TxId::from_be_bytes(buff[0..8].try_into().unwrap()) else {
            return LogDecodeResult::Err(anyhow!("log record has a zero txid"));
        };
        let prev_lsn = Lsn::from_be_bytes(buff[8..16].try_into().unwrap());
        let undo_next = Lsn::from_be_bytes(buff[16..24].try_into().unwrap());
        let mode = match LogMode::from_code(buff[29]) {
            Ok(mode) => mode,
            Err(err) => return LogDecodeResult::Err(err),
        };
        let payload = &buff[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_size];
        let kind = match LogKind::decode(payload, buff[28]) {
            Ok(kind) => kind,
            Err(err) => return LogDecodeResult::Err(err),
        };

        LogDecodeResult::Ok(
            LogRecord {
                txid,
                prev_lsn,
                undo_next,
                mode,
                kind,
            },
            size,
        )
    }
}

pub(crate) enum LogDecodeResult<'a> {
    Ok(LogRecord<'a>, usize),
    NeedMoreBytes,
    Incomplete,
    Err(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogKind<'a> {
    Begin,
    Commit,
    Abort,
    End,
    Checkpoint {
        next_txid: TxId,
        active: Vec<(TxId, Option<Lsn>)>,
    },

    AllocPage {
        pgid: PageId,
    },

    LotInitNode {
        pgid: PageId,
        height: u16,
    },
    LotInitLeaf {
        pgid: PageId,
    },
    /// Replaces every entry from `start` to the end of the node.
    LotReplaceEntries {
        pgid: PageId,
        start: u16,
        old: &'a [u8],
        new: &'a [u8],
    },
    LotWriteLeaf {
        pgid: PageId,
        offset: u16,
        old: &'a [u8],
        new: &'a [u8],
    },

    MlgfInitDirectoryPage {
        pgid: PageId,
        iid: u32,
        height: u16,
        root: bool,
        n_keys: u8,
    },
    MlgfInsertDirectoryEntries {
        pgid: PageId,
        start: u16,
        entries: &'a [u8],
    },
    MlgfDeleteDirectoryEntries {
        pgid: PageId,
        start: u16,
        entries: &'a [u8],
    },
    MlgfUpdateDirectoryEntry {
        pgid: PageId,
        index: u16,
        old: &'a [u8],
        new: &'a [u8],
    },
    MlgfInitLeafPage {
        pgid: PageId,
        iid: u32,
        n_keys: u8,
    },
    MlgfInsertLeafObjects {
        pgid: PageId,
        start: u16,
        objects: &'a [u8],
    },
    MlgfDeleteLeafObjects {
        pgid: PageId,
        start: u16,
        objects: &'a [u8],
    },

    /// Replaces the whole page body after the common header.
    PageImage {
        pgid: PageId,
        old: &'a [u8],
        new: &'a [u8],
    },
}

const LOG_BEGIN_KIND: u8 = 1;
const LOG_COMMIT_KIND: u8 = 2;
const LOG_ABORT_KIND: u8 = 3;
const LOG_END_KIND: u8 = 4;
const LOG_CHECKPOINT_KIND: u8 = 5;

const LOG_ALLOC_PAGE_KIND: u8 = 10;

const LOG_LOT_INIT_NODE_KIND: u8 = 20;
const LOG_LOT_INIT_LEAF_KIND: u8 = 21;
const LOG_LOT_REPLACE_ENTRIES_KIND: u8 = 22;
const LOG_LOT_WRITE_LEAF_KIND: u8 = 23;

const LOG_MLGF_INIT_DIRECTORY_PAGE_KIND: u8 = 30;
const LOG_MLGF_INSERT_DIRECTORY_ENTRIES_KIND: u8 = 31;
const LOG_MLGF_DELETE_DIRECTORY_ENTRIES_KIND: u8 = 32;
const LOG_MLGF_UPDATE_DIRECTORY_ENTRY_KIND: u8 = 33;
const LOG_MLGF_INIT_LEAF_PAGE_KIND: u8 = 34;
const LOG_MLGF_INSERT_LEAF_OBJECTS_KIND: u8 = 35;
const LOG_MLGF_DELETE_LEAF_OBJECTS_KIND: u8 = 36;

const LOG_PAGE_IMAGE_KIND: u8 = 40;

impl<'a> LogKind<'a> {
    fn action(&self) -> u8 {
        match self {
            LogKind::Begin => LOG_BEGIN_KIND,
            LogKind::Commit => LOG_COMMIT_KIND,
            LogKind::Abort => LOG_ABORT_KIND,
            LogKind::End => LOG_END_KIND,
            LogKind::Checkpoint { .. } => LOG_CHECKPOINT_KIND,
            LogKind::AllocPage { .. } => LOG_ALLOC_PAGE_KIND,
            LogKind::LotInitNode { .. } => LOG_LOT_INIT_NODE_KIND,
            LogKind::LotInitLeaf { .. } => LOG_LOT_INIT_LEAF_KIND,
            LogKind::LotReplaceEntries { .. } => LOG_LOT_REPLACE_ENTRIES_KIND,
            LogKind::LotWriteLeaf { .. } => LOG_LOT_WRITE_LEAF_KIND,
            LogKind::MlgfInitDirectoryPage { .. } => LOG_MLGF_INIT_DIRECTORY_PAGE_KIND,
            LogKind::MlgfInsertDirectoryEntries { .. } => LOG_MLGF_INSERT_DIRECTORY_ENTRIES_KIND,
            LogKind::MlgfDeleteDirectoryEntries { .. } => LOG_MLGF_DELETE_DIRECTORY_ENTRIES_KIND,
            LogKind::MlgfUpdateDirectoryEntry { .. } => LOG_MLGF_UPDATE_DIRECTORY_ENTRY_KIND,
            LogKind::MlgfInitLeafPage { .. } => LOG_MLGF_INIT_LEAF_PAGE_KIND,
            LogKind::MlgfInsertLeafObjects { .. } => LOG_MLGF_INSERT_LEAF_OBJECTS_KIND,
            LogKind::MlgfDeleteLeafObjects { .. } => LOG_MLGF_DELETE_LEAF_OBJECTS_KIND,
            LogKind::PageImage { .. } => LOG_PAGE_IMAGE_KIND,
        }
    }

    /// The page this record updates, `None` for transaction bookkeeping.
    pub(crate) fn pgid(&self) -> Option<PageId> {
        match self {
            LogKind::Begin
            | LogKind::Commit
            | LogKind::Abort
            | LogKind::End
            | LogKind::Checkpoint { .. } => None,
            LogKind::AllocPage { pgid }
            | LogKind::LotInitNode { pgid, .. }
            | LogKind::LotInitLeaf { pgid }
            | LogKind::LotReplaceEntries { pgid, .. }
            | LogKind::LotWriteLeaf { pgid, .. }
            | LogKind::MlgfInitDirectoryPage { pgid, .. }
            | LogKind::MlgfInsertDirectoryEntries { pgid, .. }
            | LogKind::MlgfDeleteDirectoryEntries { pgid, .. }
            | LogKind::MlgfUpdateDirectoryEntry { pgid, .. }
            | LogKind::MlgfInitLeafPage { pgid, .. }
            | LogKind::MlgfInsertLeafObjects { pgid, .. }
            | LogKind::MlgfDeleteLeafObjects { pgid, .. }
            | LogKind::PageImage { pgid, .. } => Some(*pgid),
        }
    }

    /// The action that reverts this one, used by rollback. Records that only build fresh
    /// pages have no inverse.
    pub(crate) fn inverse(&self) -> Option<LogKind<'a>> {
        let inverse = match *self {
            LogKind::LotReplaceEntries {
                pgid,
                start,
                old,
                new,
            } => LogKind::LotReplaceEntries {
                pgid,
                start,
                old: new,
                new: old,
            },
            LogKind::LotWriteLeaf {
                pgid,
                offset,
                old,
                new,
            } => LogKind::LotWriteLeaf {
                pgid,
                offset,
                old: new,
                new: old,
            },
            LogKind::MlgfInsertDirectoryEntries {
                pgid,
                start,
                entries,
            } => LogKind::MlgfDeleteDirectoryEntries {
                pgid,
                start,
                entries,
            },
            LogKind::MlgfDeleteDirectoryEntries {
                pgid,
                start,
                entries,
            } => LogKind::MlgfInsertDirectoryEntries {
                pgid,
                start,
                entries,
            },
            LogKind::MlgfUpdateDirectoryEntry {
                pgid,
                index,
                old,
                new,
            } => LogKind::MlgfUpdateDirectoryEntry {
                pgid,
                index,
                old: new,
                new: old,
            },
            LogKind::MlgfInsertLeafObjects {
                pgid,
                start,
                objects,
            } => LogKind::MlgfDeleteLeafObjects {
                pgid,
                start,
                objects,
            },
            LogKind::MlgfDeleteLeafObjects {
                pgid,
                start,
                objects,
            } => LogKind::MlgfInsertLeafObjects {
                pgid,
                start,
                objects,
            },
            LogKind::PageImage { pgid, old, new } => LogKind::PageImage {
                pgid,
                old: new,
                new: old,
            },
            _ => return None,
        };
        Some(inverse)
    }

    fn size(&self) -> usize {
        match self {
            LogKind::Begin | LogKind::Commit | LogKind::Abort | LogKind::End => 0,
            LogKind::Checkpoint { active, .. } => 8 + 4 + active.len() * 16,
            LogKind::AllocPage { .. } | LogKind::LotInitLeaf { .. } => 8,
            LogKind::LotInitNode { .. } => 8 + 2,
            LogKind::LotReplaceEntries { old, new, .. }
            | LogKind::LotWriteLeaf { old, new, .. }
            | LogKind::MlgfUpdateDirectoryEntry { old, new, .. } => {
                8 + 2 + 4 + old.len() + 4 + new.len()
            }
            LogKind::MlgfInitDirectoryPage { .. } => 8 + 4 + 2 + 1 + 1,
            LogKind::MlgfInsertDirectoryEntries { entries, .. }
            | LogKind::MlgfDeleteDirectoryEntries { entries, .. } => 8 + 2 + 4 + entries.len(),
            LogKind::MlgfInitLeafPage { .. } => 8 + 4 + 1,
            LogKind::MlgfInsertLeafObjects { objects, .. }
            | LogKind::MlgfDeleteLeafObjects { objects, .. } => 8 + 2 + 4 + objects.len(),
            LogKind::PageImage { old, new, .. } => 8 + 4 + old.len() + 4 + new.len(),
        }
    }

    fn encode(&self, buff: &mut [u8]) {
        let mut w = Writer { buff, pos: 0 };
        match self {
            LogKind::Begin | LogKind::Commit | LogKind::Abort | LogKind::End => (),
            LogKind::Checkpoint { next_txid, active } => {
                w.put(&next_txid.to_be_bytes());
                w.put_u32(active.len() as u32);
                for (txid, last_lsn) in active {
                    w.put(&txid.to_be_bytes());
                    w.put(&last_lsn.to_be_bytes());
                }
            }
            LogKind::AllocPage { pgid } | LogKind::LotInitLeaf { pgid } => {
                w.put(&pgid.to_be_bytes());
            }
            LogKind::LotInitNode { pgid, height } => {
                w.put(&pgid.to_be_bytes());
                w.put_u16(*height);
            }
            LogKind::LotReplaceEntries {
                pgid,
                start: pos,
                old,
                new,
            }
            | LogKind::LotWriteLeaf {
                pgid,
                offset: pos,
                old,
                new,
            }
            | LogKind::MlgfUpdateDirectoryEntry {
                pgid,
                index: pos,
                old,
                new,
            } => {
                w.put(&pgid.to_be_bytes());
                w.put_u16(*pos);
                w.put_bytes(old);
                w.put_bytes(new);
            }
            LogKind::MlgfInitDirectoryPage {
                pgid,
                iid,
                height,
                root,
                n_keys,
            } => {
                w.put(&pgid.to_be_bytes());
                w.put_u32(*iid);
                w.put_u16(*height);
                w.put(&[*root as u8, *n_keys]);
            }
            LogKind::MlgfInsertDirectoryEntries {
                pgid,
                start,
                entries: bytes,
            }
            | LogKind::MlgfDeleteDirectoryEntries {
                pgid,
                start,
                entries: bytes,
            }
            | LogKind::MlgfInsertLeafObjects {
                pgid,
                start,
                objects: bytes,
            }
            | LogKind::MlgfDeleteLeafObjects {
                pgid,
                start,
                objects: bytes,
            } => {
                w.put(&pgid.to_be_bytes());
                w.put_u16(*start);
                w.put_bytes(bytes);
            }
            LogKind::MlgfInitLeafPage { pgid, iid, n_keys } => {
                w.put(&pgid.to_be_bytes());
                w.put_u32(*iid);
                w.put(&[*n_keys]);
            }
            LogKind::PageImage { pgid, old, new } => {
                w.put(&pgid.to_be_bytes());
                w.put_bytes(old);
                w.put_bytes(new);
            }
        }
        assert_eq!(w.pos, w.buff.len(), "log payload size mismatch");
    }

    fn decode(buff: &'a [u8], action: u8) -> anyhow::Result<Self> {
        let mut r = Reader { buff, pos: 0 };
        let kind = match action {
            LOG_BEGIN_KIND => LogKind::Begin,
            LOG_COMMIT_KIND => LogKind::Commit,
            LOG_ABORT_KIND => LogKind::Abort,
            LOG_END_KIND => LogKind::End,
            LOG_CHECKPOINT_KIND => {
                let next_txid = TxId::new(r.u64()?)
                    .ok_or_else(|| anyhow!("checkpoint has a zero next txid"))?;
                let n = r.u32()? as usize;
                let mut active = Vec::with_capacity(n);
                for _ in 0..n {
                    let txid =
                        TxId::new(r.u64()?).ok_or_else(|| anyhow!("checkpoint has a zero txid"))?;
                    let last_lsn = Lsn::from_be_bytes(r.take(8)?.try_into().unwrap());
                    active.push((txid, last_lsn));
                }
                LogKind::Checkpoint { next_txid, active }
            }
            LOG_ALLOC_PAGE_KIND => LogKind::AllocPage { pgid: r.pgid()? },
            LOG_LOT_INIT_NODE_KIND => LogKind::LotInitNode {
                pgid: r.pgid()?,
                height: r.u16()?,
            },
            LOG_LOT_INIT_LEAF_KIND => LogKind::LotInitLeaf { pgid: r.pgid()? },
            LOG_LOT_REPLACE_ENTRIES_KIND => LogKind::LotReplaceEntries {
                pgid: r.pgid()?,
                start: r.u16()?,
                old: r.bytes()?,
                new: r.bytes()?,
            },
            LOG_LOT_WRITE_LEAF_KIND => LogKind::LotWriteLeaf {
                pgid: r.pgid()?,
                offset: r.u16()?,
                old: r.bytes()?,
                new: r.bytes()?,
            },
            LOG_MLGF_INIT_DIRECTORY_PAGE_KIND => LogKind::MlgfInitDirectoryPage {
                pgid: r.pgid()?,
                iid: r.u32()?,
                height: r.u16()?,
                root: r.u8()? != 0,
                n_keys: r.u8()?,
            },
            LOG_MLGF_INSERT_DIRECTORY_ENTRIES_KIND => LogKind::MlgfInsertDirectoryEntries {
                pgid: r.pgid()?,
                start: r.u16()?,
                entries: r.bytes()?,
            },
            LOG_MLGF_DELETE_DIRECTORY_ENTRIES_KIND => LogKind::MlgfDeleteDirectoryEntries {
                pgid: r.pgid()?,
                start: r.u16()?,
                entries: r.bytes()?,
            },
            LOG_MLGF_UPDATE_DIRECTORY_ENTRY_KIND => LogKind::MlgfUpdateDirectoryEntry {
                pgid: r.pgid()?,
                index: r.u16()?,
                old: r.bytes()?,
                new: r.bytes()?,
            },
            LOG_MLGF_INIT_LEAF_PAGE_KIND => LogKind::MlgfInitLeafPage {
                pgid: r.pgid()?,
                iid: r.u32()?,
                n_keys: r.u8()?,
            },
            LOG_MLGF_INSERT_LEAF_OBJECTS_KIND => LogKind::MlgfInsertLeafObjects {
                pgid: r.pgid()?,
                start: r.u16()?,
                objects: r.bytes()?,
            },
            LOG_MLGF_DELETE_LEAF_OBJECTS_KIND => LogKind::MlgfDeleteLeafObjects {
                pgid: r.pgid()?,
                start: r.u16()?,
                objects: r.bytes()?,
            },
            LOG_PAGE_IMAGE_KIND => LogKind::PageImage {
                pgid: r.pgid()?,
                old: r.bytes()?,
                new: r.bytes()?,
            },
            _ => return Err(anyhow!("invalid log record kind {action}")),
        };
        if r.pos != buff.len() {
            return Err(anyhow!(
                "log record kind {action} has {} trailing bytes",
                buff.len() - r.pos
            ));
        }
        Ok(kind)
    }
}

struct Writer<'b> {
    buff: &'b mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buff[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u16(&mut self, v: u16) {
        self.put(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put(bytes);
    }
}

struct Reader<'a> {
    buff: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.pos + n > self.buff.len() {
            return Err(anyhow!(
                "log payload too short, need {n} bytes at {}",
                self.pos
            ));
        }
        let s = &self.buff[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> anyhow::Result<u16> {
        Ok(self.take(2)?.read_u16())
    }

    fn u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.take(4)?.read_u32())
    }

    fn u64(&mut self) -> anyhow::Result<u64> {
        Ok(self.take(8)?.read_u64())
    }

    fn pgid(&mut self) -> anyhow::Result<PageId> {
        PageId::from_be_bytes(self.take(8)?.try_into().unwrap())
            .ok_or_else(|| anyhow!("log record references a nil page"))
    }

    fn bytes(&mut self) -> anyhow::Result<&'a [u8]> {
        let n = self.u32()? as usize;
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(record: &LogRecord) -> Vec<u8> {
        let mut buff = vec![0u8; record.size()];
        record.encode(&mut buff);
        buff
    }

    #[test]
    fn test_encode_begin() {
        let record = LogRecord {
            txid: TxId::new(1).unwrap(),
            prev_lsn: None,
            undo_next: None,
            mode: LogMode::RedoOnly,
            kind: LogKind::Begin,
        };
        let buff = encode(&record);
        assert_eq!(40, buff.len());
        assert_eq!(&[0, 0, 0, 0, 0, 0, 0, 1], &buff[0..8]);
        assert_eq!(&[0xff; 16], &buff[8..24]);
        assert_eq!(&[0, 0, 0, 0, LOG_BEGIN_KIND, 1, 0, 0], &buff[24..32]);
    }

    #[test]
    fn test_decode_split_records() {
        let pgid = PageId::new(1, 9).unwrap();
        let entries = [7u8; 46];
        let records = [
            LogRecord {
                txid: TxId::new(3).unwrap(),
                prev_lsn: Some(Lsn::new(64)),
                undo_next: None,
                mode: LogMode::RedoOnly,
                kind: LogKind::MlgfInitDirectoryPage {
                    pgid,
                    iid: 42,
                    height: 2,
                    root: false,
                    n_keys: 3,
                },
            },
            LogRecord {
                txid: TxId::new(3).unwrap(),
                prev_lsn: Some(Lsn::new(104)),
                undo_next: None,
                mode: LogMode::RedoOnly,
                kind: LogKind::MlgfInsertDirectoryEntries {
                    pgid,
                    start: 0,
                    entries: &entries,
                },
            },
            LogRecord {
                txid: TxId::new(3).unwrap(),
                prev_lsn: Some(Lsn::new(200)),
                undo_next: Some(Lsn::new(64)),
                mode: LogMode::RedoUndo,
                kind: LogKind::Checkpoint {
                    next_txid: TxId::new(9).unwrap(),
                    active: vec![(TxId::new(4).unwrap(), None)],
                },
            },
        ];

        for record in &records {
            let buff = encode(record);
            let LogDecodeResult::Ok(decoded, size) = LogRecord::decode(&buff) else {
                panic!("record must be decodable");
            };
            assert_eq!(buff.len(), size);
            assert_eq!(record, &decoded);
        }
    }

    #[test]
    fn test_decode_torn_record() {
        let record = LogRecord {
            txid: TxId::new(2).unwrap(),
            prev_lsn: None,
            undo_next: None,
            mode: LogMode::RedoUndo,
            kind: LogKind::LotWriteLeaf {
                pgid: PageId::new(0, 5).unwrap(),
                offset: 12,
                old: b"hello",
                new: b"world",
            },
        };
        let mut buff = encode(&record);
        assert!(matches!(
            LogRecord::decode(&buff[..buff.len() - 1]),
            LogDecodeResult::NeedMoreBytes
        ));
        buff[35] ^= 0xff;
        assert!(matches!(
            LogRecord::decode(&buff),
            LogDecodeResult::Incomplete
        ));
    }

    #[test]
    fn test_inverse() {
        let pgid = PageId::new(0, 5).unwrap();
        let kind = LogKind::MlgfInsertDirectoryEntries {
            pgid,
            start: 2,
            entries: b"abc",
        };
        assert_eq!(
            Some(LogKind::MlgfDeleteDirectoryEntries {
                pgid,
                start: 2,
                entries: b"abc",
            }),
            kind.inverse()
        );
        assert_eq!(None, LogKind::LotInitLeaf { pgid }.inverse());
        assert_eq!(Some(pgid), kind.pgid());
        assert_eq!(None, LogKind::Commit.pgid());
    }
}
