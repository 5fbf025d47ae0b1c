use crate::error::Result;
use crate::id::{Lsn, PageId, TxId};
use crate::log::{LogKind, LogMode};
use crate::lot::node::{init_leaf, init_node, replace_entries_raw, write_leaf};
use crate::mlgf::page::{
    delete_directory_entries, delete_leaf_objects, deleted_count, init_directory,
    init_leaf_page, insert_directory_entries, insert_leaf_objects, update_directory_entry,
};
use crate::pager::{write_image, BufferPool, LogContext, PageWrite};
use crate::segment::{SegmentAllocator, VolumeAllocator};
use crate::wal::{LogEntryBuf, LogReader, LogWriter, Wal};
use crate::xact::Xact;
use anyhow::anyhow;
use indexmap::IndexMap;

/// Applies the page action described by `kind` through the regular page mutators. Redo
/// passes a `Redo` context, rollback passes a `Compensate` context with the inverse action.
pub(crate) fn apply(page: &mut PageWrite, ctx: &LogContext, kind: &LogKind) -> Result<()> {
    // compensation records are always redo-only, the context overrides the mode
    let mode = LogMode::RedoOnly;
    match *kind {
        LogKind::LotInitNode { height, .. } => init_node(page, ctx, height),
        LogKind::LotInitLeaf { .. } => init_leaf(page, ctx),
        LogKind::LotReplaceEntries { start, new, .. } => {
            replace_entries_raw(page, ctx, mode, start as usize, new)
        }
        LogKind::LotWriteLeaf { offset, new, .. } => {
            write_leaf(page, ctx, mode, offset as usize, new)
        }

        LogKind::MlgfInitDirectoryPage {
            iid,
            height,
            root,
            n_keys,
            ..
        } => init_directory(page, ctx, iid, height, root, n_keys),
        LogKind::MlgfInsertDirectoryEntries { start, entries, .. } => {
            insert_directory_entries(page, ctx, mode, start as usize, entries)
        }
        LogKind::MlgfDeleteDirectoryEntries { start, entries, .. } => {
            let n = deleted_count(page, entries)?;
            delete_directory_entries(page, ctx, mode, start as usize, n)
        }
        LogKind::MlgfUpdateDirectoryEntry { index, new, .. } => {
            update_directory_entry(page, ctx, index as usize, new)
        }
        LogKind::MlgfInitLeafPage { iid, n_keys, .. } => init_leaf_page(page, ctx, iid, n_keys),
        LogKind::MlgfInsertLeafObjects { start, objects, .. } => {
            insert_leaf_objects(page, ctx, mode, start as usize, objects)
        }
        LogKind::MlgfDeleteLeafObjects { start, objects, .. } => {
            let n = deleted_count(page, objects)?;
            delete_leaf_objects(page, ctx, mode, start as usize, n)
        }

        LogKind::PageImage { new, .. } => write_image(page, ctx, new),

        LogKind::Begin
        | LogKind::Commit
        | LogKind::Abort
        | LogKind::End
        | LogKind::Checkpoint { .. }
        | LogKind::AllocPage { .. } => {
            Err(anyhow!("{kind:?} does not describe a page update").into())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct Analysis {
    redo_from: Lsn,
    /// Transactions without an `End` record, with their last lsn.
    losers: IndexMap<TxId, (TxStatus, Option<Lsn>)>,
    next_txid: TxId,
}

/// Brings the pages back to the state the log describes and rolls back every transaction
/// that did not finish. Returns the first unused transaction id.
pub(crate) fn recover(wal: &Wal, pool: &BufferPool, alloc: &VolumeAllocator) -> Result<TxId> {
    let analysis = analyze(wal)?;
    redo(wal, pool, alloc, analysis.redo_from)?;
    undo(wal, pool, alloc, &analysis)?;
    Ok(analysis.next_txid)
}

fn analyze(wal: &Wal) -> Result<Analysis> {
    let redo_from = wal.checkpoint().unwrap_or(Wal::first_lsn());
    log::debug!("recovery analysis started at {redo_from}");

    let mut losers: IndexMap<TxId, (TxStatus, Option<Lsn>)> = IndexMap::new();
    let mut next_txid = TxId::new(1).ok_or_else(|| anyhow!("txid 1 is invalid"))?;

    let mut iter = wal.iter_from(redo_from)?;
    while let Some(entry) = iter.next()? {
        let record = entry.record()?;
        log::trace!("analysis lsn={} txid={} {:?}", entry.lsn, record.txid, record.kind);

        if let LogKind::Checkpoint {
            next_txid: checkpoint_next,
            ref active,
        } = record.kind
        {
            next_txid = next_txid.max(checkpoint_next);
            for (txid, last_lsn) in active {
                if losers.contains_key(txid) {
                    continue;
                }
                if let Some(status) = status_at(wal, *last_lsn)? {
                    losers.insert(*txid, (status, *last_lsn));
                }
            }
            continue;
        }

        next_txid = next_txid.max(record.txid.next());
        if record.kind == LogKind::End {
            losers.shift_remove(&record.txid);
            continue;
        }
        let state = losers
            .entry(record.txid)
            .or_insert((TxStatus::Active, None));
        state.1 = Some(entry.lsn);
        match record.kind {
            LogKind::Commit => state.0 = TxStatus::Committed,
            LogKind::Abort => state.0 = TxStatus::Aborted,
            _ => (),
        }
    }

    log::debug!(
        "recovery analysis finished, {} unfinished transactions, next txid {next_txid}",
        losers.len()
    );
    Ok(Analysis {
        redo_from,
        losers,
        next_txid,
    })
}

/// Status of a checkpointed transaction, judged by the last record it wrote. A transaction
/// listed between its `Commit` and its `End` is already committed, one listed after its
/// `End` is finished.
fn status_at(wal: &Wal, last_lsn: Option<Lsn>) -> Result<Option<TxStatus>> {
    let Some(lsn) = last_lsn else {
        return Ok(Some(TxStatus::Active));
    };
    let entry = wal.read_record(lsn)?;
    Ok(match entry.record()?.kind {
        LogKind::End => None,
        LogKind::Commit => Some(TxStatus::Committed),
        LogKind::Abort => Some(TxStatus::Aborted),
        _ => Some(TxStatus::Active),
    })
}

fn redo(wal: &Wal, pool: &BufferPool, alloc: &VolumeAllocator, from: Lsn) -> Result<()> {
    log::debug!("recovery redo started at {from}");
    let mut replayed = 0usize;
    let mut iter = wal.iter_from(from)?;
    while let Some(entry) = iter.next()? {
        if redo_record(pool, alloc, &entry)? {
            replayed += 1;
        }
    }
    log::debug!("recovery redo finished, {replayed} records replayed");
    Ok(())
}

/// Replays one record unless the page already reflects it. Returns whether a page changed.
fn redo_record(pool: &BufferPool, alloc: &VolumeAllocator, entry: &LogEntryBuf) -> Result<bool> {
    let record = entry.record()?;
    if let LogKind::AllocPage { pgid } = record.kind {
        alloc.redo_allocation(pgid)?;
        return Ok(false);
    }
    let Some(pgid) = record.kind.pgid() else {
        return Ok(false);
    };
    if !record.mode.has_redo() {
        return Ok(false);
    }

    let mut page = pool.pin_write(pgid)?;
    if page.lsn().is_some_and(|page_lsn| page_lsn >= entry.lsn) {
        log::trace!("redo of {} skipped, page {pgid} is at {:?}", entry.lsn, page.lsn());
        return Ok(false);
    }
    apply(&mut page, &LogContext::Redo(entry.lsn), &record.kind)?;
    Ok(true)
}

fn undo(wal: &Wal, pool: &BufferPool, alloc: &VolumeAllocator, analysis: &Analysis) -> Result<()> {
    log::debug!("recovery undo started");

    let mut losers = vec![];
    for (txid, (status, last_lsn)) in &analysis.losers {
        let xact = Xact::resume(*txid, *last_lsn);
        match status {
            TxStatus::Committed | TxStatus::Aborted => {
                log::debug!("finishing {status:?} transaction {txid}");
                xact.append(wal, LogMode::RedoOnly, None, LogKind::End)?;
            }
            TxStatus::Active => losers.push(xact),
        }
    }
    let mut rollbacks = losers.iter().map(Rollback::new).collect::<Vec<_>>();

    // one global backwards pass, so that changes of different losers on the same page are
    // undone in the reverse of the order they were made
    loop {
        let Some(next) = rollbacks
            .iter_mut()
            .filter(|r| r.next.is_some())
            .max_by_key(|r| r.next)
        else {
            break;
        };
        next.step(wal, wal, pool)?;
    }
    for rollback in rollbacks {
        rollback.finish(wal, pool, alloc)?;
    }

    log::debug!("recovery undo finished");
    Ok(())
}

/// Undoes every change of `xact`, newest first, then logs `Abort` and `End`. Pages the
/// transaction allocated go back to the allocator.
pub(crate) fn rollback(
    xact: &Xact,
    log: &dyn LogWriter,
    reader: &dyn LogReader,
    pool: &BufferPool,
    alloc: &dyn SegmentAllocator,
) -> Result<()> {
    log::debug!("rolling back transaction {}", xact.txid);
    let mut rollback = Rollback::new(xact);
    while rollback.next.is_some() {
        rollback.step(log, reader, pool)?;
    }
    rollback.finish(log, pool, alloc)
}

/// Progress of undoing one transaction chain.
struct Rollback<'x> {
    xact: &'x Xact,
    next: Option<Lsn>,
    allocated: Vec<PageId>,
}

impl<'x> Rollback<'x> {
    fn new(xact: &'x Xact) -> Self {
        let next = xact.last_lsn();
        Self {
            xact,
            next,
            allocated: vec![],
        }
    }

    /// Undoes the record at `self.next` and moves to the one before it.
    fn step(
        &mut self,
        log: &dyn LogWriter,
        reader: &dyn LogReader,
        pool: &BufferPool,
    ) -> Result<()> {
        let Some(lsn) = self.next else {
            return Ok(());
        };
        let entry = reader.read_at(lsn)?;
        let record = entry.record()?;
        if record.txid != self.xact.txid {
            return Err(anyhow!(
                "record at {lsn} belongs to {}, not to {}",
                record.txid,
                self.xact.txid
            )
            .into());
        }

        // a compensation record points past everything it already undid
        if let Some(undo_next) = record.undo_next {
            self.next = Some(undo_next);
            return Ok(());
        }

        match record.kind {
            LogKind::Begin => {
                self.next = None;
                return Ok(());
            }
            LogKind::Commit | LogKind::End => {
                return Err(anyhow!("transaction {} already finished at {lsn}", record.txid).into())
            }
            LogKind::AllocPage { pgid } => self.allocated.push(pgid),
            LogKind::Abort | LogKind::Checkpoint { .. } => (),
            ref kind if record.mode.has_undo() => {
                let Some(inverse) = kind.inverse() else {
                    return Err(anyhow!("record at {lsn} cannot be undone: {kind:?}").into());
                };
                let Some(pgid) = inverse.pgid() else {
                    return Err(anyhow!("record at {lsn} has no page").into());
                };
                log::trace!("undo {lsn} on page {pgid}");
                let mut page = pool.pin_write(pgid)?;
                let ctx = LogContext::Compensate {
                    log,
                    xact: self.xact,
                    undo_next: record.prev_lsn,
                };
                apply(&mut page, &ctx, &inverse)?;
            }
            _ => (),
        }
        self.next = record.prev_lsn;
        Ok(())
    }

    fn finish(
        self,
        log: &dyn LogWriter,
        pool: &BufferPool,
        alloc: &dyn SegmentAllocator,
    ) -> Result<()> {
        self.xact.append(log, LogMode::RedoOnly, None, LogKind::Abort)?;
        self.xact.append(log, LogMode::RedoOnly, None, LogKind::End)?;
        for pgid in self.allocated.iter().rev() {
            pool.invalidate(*pgid)?;
            alloc.free_page(*pgid)?;
        }
        log::debug!(
            "transaction {} rolled back, {} pages released",
            self.xact.txid,
            self.allocated.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::lot::LargeObject;
    use crate::mlgf::{KeyDesc, MlgfIndex};
    use crate::pager::MemDevice;
    use crate::segment::Segment;
    use crate::testing::{MemLog, TestEnv};
    use crate::xact::XactContext;
    use std::sync::Arc;

    fn oid(i: u32) -> ObjectId {
        ObjectId {
            page: PageId::new(5, i).unwrap(),
            slot: 0,
            unique: i,
        }
    }

    fn bodies(pool: &BufferPool, pages: &[PageId]) -> Vec<Vec<u8>> {
        pages
            .iter()
            .map(|pgid| pool.pin_read(*pgid).unwrap().body().to_vec())
            .collect()
    }

    #[test]
    fn test_rollback_restores_committed_state() {
        let env = TestEnv::new(1024, 64);
        let kdesc = KeyDesc::all_min(2).unwrap();
        let data = (0..3000).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        let root = LargeObject::create(env.ctx(), 0, &data).unwrap();
        let index_root = MlgfIndex::create(env.ctx(), &kdesc, 0, 1).unwrap();
        let index = MlgfIndex::open(env.ctx(), &kdesc, index_root);
        for i in 0..30 {
            index.insert(&[i * 7919, i * 104_729], oid(i)).unwrap();
        }

        let mut before_pages = LargeObject::open(env.ctx(), root).pages().unwrap();
        before_pages.extend(index.pages().unwrap());
        let before = bodies(&env.pool, &before_pages);

        let xact = Xact::new(TxId::new(2).unwrap());
        xact.append(env.log.as_ref(), LogMode::RedoOnly, None, LogKind::Begin)
            .unwrap();
        let ctx = XactContext {
            xact: &xact,
            pool: &env.pool,
            log: env.log.as_ref(),
            locks: None,
            alloc: &env.alloc,
        };
        let object = LargeObject::open(ctx, root);
        object.write(10, 5, Some(b"hello")).unwrap();
        object.append(&vec![9u8; 150_000]).unwrap();
        let index = MlgfIndex::open(ctx, &kdesc, index_root);
        for i in 30..400 {
            index.insert(&[i * 7919, i * 104_729], oid(i)).unwrap();
        }
        index.delete(&[7919, 104_729], oid(1)).unwrap();
        let mut grown = object.pages().unwrap();
        grown.extend(index.pages().unwrap());
        assert!(grown.len() > before_pages.len() + 100);

        rollback(&xact, env.log.as_ref(), env.log.as_ref(), &env.pool, &env.alloc).unwrap();

        assert_eq!(before, bodies(&env.pool, &before_pages));
        let object = LargeObject::open(env.ctx(), root);
        assert_eq!(data.len() as u64, object.size().unwrap());
        assert_eq!(data, object.read(0, data.len() as i64).unwrap());
        let index = MlgfIndex::open(env.ctx(), &kdesc, index_root);
        assert_eq!(30, index.search(&[0, 0], &[u32::MAX, u32::MAX]).unwrap().len());

        let tail = env.log.with_records(|records| {
            records
                .iter()
                .rev()
                .take(2)
                .map(|r| match r.record().unwrap().kind {
                    LogKind::Abort => "abort",
                    LogKind::End => "end",
                    _ => "other",
                })
                .collect::<Vec<_>>()
        });
        assert_eq!(vec!["end", "abort"], tail);

        // the pages of the rolled back growth are handed out again
        let reused = env
            .alloc
            .allocate_page(&LogContext::Off, 0, Segment::LargeObject)
            .unwrap();
        assert!(grown.contains(&reused) && !before_pages.contains(&reused));
    }

    #[test]
    fn test_rollback_resumes_after_compensation() {
        let env = TestEnv::new(1024, 16);
        let data = vec![1u8; 500];
        let root = LargeObject::create(env.ctx(), 0, &data).unwrap();

        let xact = Xact::new(TxId::new(2).unwrap());
        xact.append(env.log.as_ref(), LogMode::RedoOnly, None, LogKind::Begin)
            .unwrap();
        let ctx = XactContext {
            xact: &xact,
            ..env.ctx()
        };
        let object = LargeObject::open(ctx, root);
        object.write(0, 3, Some(b"abc")).unwrap();
        object.write(100, 3, Some(b"xyz")).unwrap();

        // undo only the newest record, as a crash in the middle of a rollback would
        let mut partial = Rollback::new(&xact);
        partial
            .step(env.log.as_ref(), env.log.as_ref(), &env.pool)
            .unwrap();
        drop(partial);
        let clr = env.log.read_at(xact.last_lsn().unwrap()).unwrap();
        assert!(clr.record().unwrap().undo_next.is_some());

        rollback(&xact, env.log.as_ref(), env.log.as_ref(), &env.pool, &env.alloc).unwrap();
        let object = LargeObject::open(env.ctx(), root);
        assert_eq!(data, object.read(0, 500).unwrap());
    }

    #[test]
    fn test_redo_skips_pages_at_or_past_the_record() {
        let env = TestEnv::new(1024, 16);
        let root = LargeObject::create(env.ctx(), 0, &vec![4u8; 2000]).unwrap();
        LargeObject::open(env.ctx(), root)
            .write(1000, 4, Some(b"redo"))
            .unwrap();
        let expected = LargeObject::open(env.ctx(), root).pages().unwrap();
        let expected = bodies(&env.pool, &expected);

        // replay into an empty device, twice
        let device = Arc::new(MemDevice::new(1024));
        let log = Arc::new(MemLog::new());
        let pool = BufferPool::new(device.clone(), log, 16).unwrap();
        let alloc = VolumeAllocator::new(device);
        let records = env.log.with_records(|records| records.to_vec());
        let replayed = records
            .iter()
            .map(|entry| redo_record(&pool, &alloc, entry).unwrap())
            .filter(|changed| *changed)
            .count();
        assert!(replayed > 0);
        for entry in &records {
            assert!(!redo_record(&pool, &alloc, entry).unwrap());
        }

        let pages = LargeObject::open(env.ctx(), root).pages().unwrap();
        assert_eq!(expected, bodies(&pool, &pages));
        let next = alloc
            .allocate_page(&LogContext::Off, 0, Segment::LargeObject)
            .unwrap();
        assert_eq!(pages.len() as u32, next.page);
    }

    #[test]
    fn test_recover_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("wal");
        let device = Arc::new(MemDevice::new(1024));
        let kdesc = KeyDesc::all_min(3).unwrap();
        let committed = (0..5000).map(|i| (i % 13) as u8).collect::<Vec<_>>();

        let (root, index_root) = {
            let wal = Arc::new(Wal::open(&wal_path, 4096).unwrap());
            // a small pool, so that pages of both transactions reach the device
            let pool = BufferPool::new(device.clone(), wal.clone(), 8).unwrap();
            let alloc = VolumeAllocator::new(device.clone());

            let t1 = Xact::new(TxId::new(1).unwrap());
            t1.append(wal.as_ref(), LogMode::RedoOnly, None, LogKind::Begin)
                .unwrap();
            let ctx = XactContext {
                xact: &t1,
                pool: &pool,
                log: wal.as_ref(),
                locks: None,
                alloc: &alloc,
            };
            let root = LargeObject::create(ctx, 0, &committed).unwrap();
            let index_root = MlgfIndex::create(ctx, &kdesc, 0, 1).unwrap();
            let index = MlgfIndex::open(ctx, &kdesc, index_root);
            for i in 0..100 {
                index.insert(&[i, i << 20, !i], oid(i)).unwrap();
            }
            t1.append(wal.as_ref(), LogMode::RedoOnly, None, LogKind::Commit)
                .unwrap();
            t1.append(wal.as_ref(), LogMode::RedoOnly, None, LogKind::End)
                .unwrap();

            let t2 = Xact::new(TxId::new(2).unwrap());
            t2.append(wal.as_ref(), LogMode::RedoOnly, None, LogKind::Begin)
                .unwrap();
            let ctx = XactContext { xact: &t2, ..ctx };
            LargeObject::open(ctx, root)
                .write(0, 5000, Some(&vec![0xee; 5000]))
                .unwrap();
            let index = MlgfIndex::open(ctx, &kdesc, index_root);
            for i in 100..300 {
                index.insert(&[i, i << 20, !i], oid(i)).unwrap();
            }
            wal.sync_all().unwrap();
            assert!(!device.writes().is_empty());
            // dropped without flushing the pool
            (root, index_root)
        };

        let wal = Arc::new(Wal::open(&wal_path, 4096).unwrap());
        let pool = BufferPool::new(device.clone(), wal.clone(), 32).unwrap();
        let alloc = VolumeAllocator::new(device.clone());
        let next_txid = recover(&wal, &pool, &alloc).unwrap();
        assert_eq!(3, next_txid.get());

        let xact = Xact::new(next_txid);
        let ctx = XactContext {
            xact: &xact,
            pool: &pool,
            log: wal.as_ref(),
            locks: None,
            alloc: &alloc,
        };
        assert_eq!(committed, LargeObject::open(ctx, root).read(0, 5000).unwrap());
        let found = MlgfIndex::open(ctx, &kdesc, index_root)
            .search(&[0; 3], &[u32::MAX; 3])
            .unwrap();
        let mut oids = found.into_iter().map(|(_, oid)| oid).collect::<Vec<_>>();
        oids.sort();
        assert_eq!((0..100).map(oid).collect::<Vec<_>>(), oids);

        // a second recovery has nothing left to undo
        drop(pool);
        let pool = BufferPool::new(device.clone(), wal.clone(), 32).unwrap();
        let alloc = VolumeAllocator::new(device);
        let analysis = analyze(&wal).unwrap();
        assert!(analysis.losers.is_empty(), "{analysis:?}");
        assert_eq!(3, recover(&wal, &pool, &alloc).unwrap().get());
    }

    #[test]
    fn test_analysis_reads_checkpointed_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal"), 4096).unwrap();
        let txid = |id: u64| TxId::new(id).unwrap();

        let committing = Xact::new(txid(1));
        let finished = Xact::new(txid(2));
        let running = Xact::new(txid(3));
        for xact in [&committing, &finished, &running] {
            xact.append(&wal, LogMode::RedoOnly, None, LogKind::Begin)
                .unwrap();
        }
        committing
            .append(&wal, LogMode::RedoOnly, None, LogKind::Commit)
            .unwrap();
        finished
            .append(&wal, LogMode::RedoOnly, None, LogKind::Commit)
            .unwrap();
        finished
            .append(&wal, LogMode::RedoOnly, None, LogKind::End)
            .unwrap();

        let active = [&committing, &finished, &running]
            .iter()
            .map(|xact| (xact.txid, xact.last_lsn()))
            .chain([(txid(4), None)])
            .collect();
        let (lsn, _) = wal
            .write_record(&crate::log::LogRecord {
                txid: txid(5),
                prev_lsn: None,
                undo_next: None,
                mode: LogMode::RedoOnly,
                kind: LogKind::Checkpoint {
                    next_txid: txid(5),
                    active,
                },
            })
            .unwrap();
        wal.set_checkpoint(lsn).unwrap();

        let analysis = analyze(&wal).unwrap();
        assert_eq!(lsn, analysis.redo_from);
        assert_eq!(5, analysis.next_txid.get());
        assert_eq!(
            vec![
                (txid(1), TxStatus::Committed),
                (txid(3), TxStatus::Active),
                (txid(4), TxStatus::Active),
            ],
            analysis
                .losers
                .iter()
                .map(|(txid, (status, _))| (*txid, *status))
                .collect::<Vec<_>>()
        );
    }
}
