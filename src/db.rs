use crate::bins::SliceExt;
use crate::error::{Error, Result};
use crate::file_lock::FileLock;
use crate::id::{Lsn, ObjectId, PageId, TxId, VolNo};
use crate::lock::{LocalLockManager, LockDuration, LockManager, LockMode, LockReply, LockResource};
use crate::log::{LogKind, LogMode, LogRecord};
use crate::lot::{dump_tree, LargeObject};
use crate::mlgf::{KeyDesc, MlgfIndex};
use crate::pager::{check_page_size, BufferPool, PageType, VolumeSet};
use crate::recovery::{recover, rollback};
use crate::segment::VolumeAllocator;
use crate::wal::{LogWriter, Wal};
use crate::xact::{Xact, XactContext};
use anyhow::anyhow;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A storage directory: the `info` header, the write-ahead log and one data file per
/// mounted volume.
pub struct Storage {
    shared: Arc<Shared>,
    background: Option<Background>,
}

struct Background {
    chan: Sender<()>,
    thread: JoinHandle<()>,
}

struct Shared {
    // keeps the directory locked for this process
    _header_file: File,
    volumes: Arc<VolumeSet>,
    wal: Arc<Wal>,
    pool: BufferPool,
    alloc: VolumeAllocator,
    locks: LocalLockManager,

    next_txid: AtomicU64,
    active: Mutex<IndexMap<TxId, Arc<Xact>>>,
    /// Shared by operations that only read pages, exclusive for the ones that change them.
    structure: RwLock<()>,
}

#[derive(Debug, Clone)]
pub struct Setting {
    /// Only used when the storage is created, an existing storage keeps its page size.
    pub page_size: usize,
    pub buffer_frames: usize,
    /// Size of the in-memory log append buffer, in bytes.
    pub wal_buffer_size: usize,
    /// A lock wait longer than this reports a deadlock.
    pub lock_timeout: Duration,
    pub checkpoint_period: Option<Duration>,
}

impl std::default::Default for Setting {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_frames: 1024,
            wal_buffer_size: 64 * DEFAULT_PAGE_SIZE,
            lock_timeout: Duration::from_secs(1),
            checkpoint_period: None,
        }
    }
}

impl Setting {
    fn validate(&self) -> Result<()> {
        if let Err(err) = check_page_size(self.page_size) {
            return Err(Error::bad_parameter(err.to_string()));
        }
        if self.buffer_frames < MINIMUM_BUFFER_FRAMES {
            return Err(Error::bad_parameter(format!(
                "the buffer pool needs at least {MINIMUM_BUFFER_FRAMES} frames"
            )));
        }
        if self.wal_buffer_size < 2 * self.page_size {
            return Err(Error::bad_parameter(
                "the log buffer must hold at least two pages",
            ));
        }
        if let Some(period) = self.checkpoint_period {
            if period < Duration::from_secs(1) {
                return Err(Error::bad_parameter(
                    "checkpoint period can't be less than a second",
                ));
            }
        }
        Ok(())
    }
}

const MINIMUM_BUFFER_FRAMES: usize = 8;

impl Storage {
    pub fn open(path: &Path, setting: Setting) -> Result<Self> {
        setting.validate()?;

        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()).into());
        }

        let header_path = path.join("info");
        let mut header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&header_path)?
            .lock_exclusive(&header_path)?;
        let header = Self::load_header(&mut header_file, setting.page_size)?;
        if header.version != STORAGE_VERSION {
            return Err(anyhow!("unsupported storage version {}", header.version).into());
        }
        let page_size = header.page_size as usize;
        check_page_size(page_size)?;
        if page_size != setting.page_size {
            log::warn!(
                "{} was created with {page_size} bytes pages, ignoring the configured {}",
                path.display(),
                setting.page_size
            );
        }

        let volumes = Arc::new(VolumeSet::new(path, page_size));
        for vol in VolumeSet::existing_volumes(path)? {
            volumes.mount(vol)?;
        }
        let wal = Arc::new(Wal::open(&path.join("wal"), setting.wal_buffer_size)?);
        let pool = BufferPool::new(volumes.clone(), wal.clone(), setting.buffer_frames)?;
        let alloc = VolumeAllocator::new(volumes.clone());

        let next_txid = recover(&wal, &pool, &alloc)?;

        let shared = Arc::new(Shared {
            _header_file: header_file,
            volumes,
            wal,
            pool,
            alloc,
            locks: LocalLockManager::new(setting.lock_timeout),
            next_txid: AtomicU64::new(next_txid.get()),
            active: Mutex::new(IndexMap::new()),
            structure: RwLock::new(()),
        });

        // recovery leaves no active transaction, so the log before this point is never
        // needed again
        shared.checkpoint()?;

        let background = setting.checkpoint_period.map(|period| {
            let (chan, receiver) = channel();
            let shared = shared.clone();
            let thread = std::thread::spawn(move || loop {
                let Err(err) = receiver.recv_timeout(period) else {
                    break;
                };
                if err != RecvTimeoutError::Timeout {
                    break;
                }

                if let Err(err) = shared.checkpoint() {
                    log::error!("cannot perform checkpoint: {err}");
                }
            });
            Background { chan, thread }
        });

        Ok(Self { shared, background })
    }

    fn load_header(f: &mut File, page_size: usize) -> anyhow::Result<Header> {
        let size = f.metadata()?.len();
        if size < 2 * HEADER_SIZE as u64 {
            return Self::init_header(f, page_size);
        }

        let mut buff = vec![0; 2 * HEADER_SIZE];
        f.read_exact(&mut buff)?;

        if buff[..8].cmp(MAGIC_HEADER).is_ne() {
            return Err(anyhow!("the directory is not a gridstore storage"));
        }

        if let Some(header) = Header::decode(&buff[0..HEADER_SIZE]) {
            return Ok(header);
        }

        if let Some(header) = Header::decode(&buff[HEADER_SIZE..HEADER_SIZE * 2]) {
            return Ok(header);
        }

        Err(anyhow!("storage is corrupted, both headers are broken"))
    }

    fn init_header(f: &mut File, page_size: usize) -> anyhow::Result<Header> {
        let header = Header {
            version: STORAGE_VERSION,
            page_size: page_size as u32,
        };

        let mut buff = vec![0; 2 * HEADER_SIZE];
        header.encode(&mut buff[..HEADER_SIZE]);
        header.encode(&mut buff[HEADER_SIZE..HEADER_SIZE * 2]);
        f.write_all(&buff)?;
        f.sync_all()?;

        Ok(header)
    }

    pub fn page_size(&self) -> usize {
        self.shared.pool.page_size()
    }

    /// Mounts a volume, creating its data file when it does not exist.
    pub fn mount(&self, vol: VolNo) -> Result<()> {
        self.shared.volumes.mount(vol)
    }

    /// Writes out the volume's pages and removes it from the mount table.
    pub fn dismount(&self, vol: VolNo) -> Result<()> {
        if !self.shared.volumes.is_mounted(vol) {
            return Err(Error::NotMounted(vol));
        }
        let _structure = self.shared.structure.write();
        self.shared.pool.drop_volume(vol)?;
        self.shared.alloc.forget_volume(vol);
        self.shared.volumes.dismount(vol)
    }

    pub fn begin(&self) -> Result<Transaction<'_>> {
        let shared = self.shared.as_ref();

        // logged under the table lock so a checkpoint sees either both or neither
        let mut active = shared.active.lock();
        let txid = shared.next_txid.fetch_add(1, Ordering::SeqCst);
        let txid = TxId::new(txid).ok_or_else(|| anyhow!("transaction id {txid} is invalid"))?;
        let xact = Arc::new(Xact::new(txid));
        xact.append(shared.wal.as_ref(), LogMode::RedoOnly, None, LogKind::Begin)?;
        active.insert(txid, xact.clone());
        drop(active);

        log::debug!("transaction {txid} started");
        Ok(Transaction {
            shared,
            xact,
            locking: true,
            finished: false,
        })
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint()
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop_background()?;

        // owning self means no transaction borrows the storage anymore
        self.shared.checkpoint()?;
        self.shared.wal.sync_all()?;
        log::debug!("storage shut down");
        Ok(())
    }

    fn stop_background(&mut self) -> Result<()> {
        let Some(background) = self.background.take() else {
            return Ok(());
        };
        // the thread also stops when the channel is gone
        let _ = background.chan.send(());
        if background.thread.join().is_err() {
            return Err(anyhow!("cannot join the checkpoint thread").into());
        }
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.stop_background() {
            log::warn!("{err}");
        }
    }
}

impl Shared {
    fn checkpoint(&self) -> Result<()> {
        let lsn = {
            // no page change and no transaction boundary may slip between the snapshot
            // and the record
            let _structure = self.structure.write();
            let active = self.active.lock();
            let next = self.next_txid.load(Ordering::SeqCst);
            let next_txid =
                TxId::new(next).ok_or_else(|| anyhow!("transaction id {next} is invalid"))?;
            let record = LogRecord {
                txid: next_txid,
                prev_lsn: None,
                undo_next: None,
                mode: LogMode::RedoOnly,
                kind: LogKind::Checkpoint {
                    next_txid,
                    active: active
                        .values()
                        .map(|xact| (xact.txid, xact.last_lsn()))
                        .collect(),
                },
            };
            self.wal.write_record(&record)?.0
        };

        self.pool.flush_all()?;
        self.wal.set_checkpoint(lsn)?;
        log::debug!("checkpoint completed at {lsn}");
        Ok(())
    }
}

const HEADER_SIZE: usize = 24;
const DEFAULT_PAGE_SIZE: usize = 0x1000;
const MAGIC_HEADER: &[u8] = b"gridstr0";
const STORAGE_VERSION: u32 = 0;

#[derive(Debug, PartialEq, Eq)]
struct Header {
    version: u32,
    page_size: u32,
}

impl Header {
    fn encode(&self, buff: &mut [u8]) {
        buff[0..8].copy_from_slice(MAGIC_HEADER);
        buff[8..12].put_u32(self.version);
        buff[12..16].put_u32(self.page_size);
        let checksum = crc64::crc64(0x1d0f, &buff[0..16]);
        buff[16..24].put_u64(checksum);
    }

    fn decode(buff: &[u8]) -> Option<Self> {
        let calculated_checksum = crc64::crc64(0x1d0f, &buff[0..HEADER_SIZE - 8]);
        let checksum = buff[HEADER_SIZE - 8..].read_u64();

        if calculated_checksum != checksum {
            return None;
        }

        let version = buff[8..].read_u32();
        let page_size = buff[12..].read_u32();

        Some(Self { version, page_size })
    }
}

/// A multidimensional index: its root page and the descriptor it was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexId {
    root: PageId,
    kdesc: KeyDesc,
}

impl IndexId {
    pub fn new(root: PageId, kdesc: KeyDesc) -> Self {
        Self { root, kdesc }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn key_desc(&self) -> &KeyDesc {
        &self.kdesc
    }
}

/// A lock the caller asks a search to take on what it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub mode: LockMode,
    pub duration: LockDuration,
}

impl LockRequest {
    pub const SHARED_UNTIL_COMMIT: LockRequest = LockRequest {
        mode: LockMode::S,
        duration: LockDuration::Commit,
    };
}

/// A running transaction. Dropping it without `commit` rolls it back.
pub struct Transaction<'s> {
    shared: &'s Shared,
    xact: Arc<Xact>,
    locking: bool,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub fn id(&self) -> TxId {
        self.xact.txid
    }

    /// Turns lock requests off, for bulk work where the caller guarantees exclusive access.
    pub fn set_locking(&mut self, locking: bool) {
        self.locking = locking;
    }

    fn ctx(&self) -> XactContext<'_> {
        let ctx = XactContext {
            xact: &self.xact,
            pool: &self.shared.pool,
            log: self.shared.wal.as_ref(),
            locks: Some(&self.shared.locks),
            alloc: &self.shared.alloc,
        };
        if self.locking {
            ctx
        } else {
            ctx.without_locks()
        }
    }

    fn check_mounted(&self, vol: VolNo) -> Result<()> {
        if !self.shared.volumes.is_mounted(vol) {
            return Err(Error::NotMounted(vol));
        }
        Ok(())
    }

    fn check_object(&self, root: PageId) -> Result<()> {
        self.check_mounted(root.vol)?;
        let page = self.shared.pool.pin_read(root)?;
        if page.kind() != PageType::LotNode {
            return Err(Error::NotFound(format!("large object at {root}")));
        }
        Ok(())
    }

    /// Takes the commit-duration exclusive lock that every writer of the object or index
    /// rooted at `root` holds. Undo is physical, so no two running transactions may change
    /// the same structure.
    fn lock_for_update(&self, root: PageId) -> Result<()> {
        if !self.locking {
            return Ok(());
        }
        let resource = LockResource::Page(root);
        match self
            .shared
            .locks
            .request(self.xact.txid, resource, LockMode::X, LockDuration::Commit)?
        {
            LockReply::Granted(_) => Ok(()),
            LockReply::Deadlock => Err(Error::Deadlock { resource }),
        }
    }

    /// Creates a large object holding `data` and returns its root page.
    pub fn create_object(&mut self, vol: VolNo, data: &[u8]) -> Result<PageId> {
        self.check_mounted(vol)?;
        let _structure = self.shared.structure.write();
        let root = LargeObject::create(self.ctx(), vol, data)?;
        self.lock_for_update(root)?;
        Ok(root)
    }

    pub fn object_size(&self, root: PageId) -> Result<u64> {
        let _structure = self.shared.structure.read();
        self.check_object(root)?;
        LargeObject::open(self.ctx(), root).size()
    }

    pub fn read_object(&self, root: PageId, start: i64, length: i64) -> Result<Vec<u8>> {
        let _structure = self.shared.structure.read();
        self.check_object(root)?;
        LargeObject::open(self.ctx(), root).read(start, length)
    }

    /// Overwrites `length` bytes at `start` with the head of `data`. The range may extend
    /// past the end of the object but may not start after it.
    pub fn write_object(
        &mut self,
        root: PageId,
        start: i64,
        length: i64,
        data: Option<&[u8]>,
    ) -> Result<()> {
        self.check_mounted(root.vol)?;
        self.lock_for_update(root)?;
        let _structure = self.shared.structure.write();
        self.check_object(root)?;
        LargeObject::open(self.ctx(), root).write(start, length, data)
    }

    pub fn append_object(&mut self, root: PageId, data: &[u8]) -> Result<()> {
        self.check_mounted(root.vol)?;
        self.lock_for_update(root)?;
        let _structure = self.shared.structure.write();
        self.check_object(root)?;
        LargeObject::open(self.ctx(), root).append(data)
    }

    pub fn dump_object(&self, root: PageId, out: &mut dyn Write) -> Result<()> {
        let _structure = self.shared.structure.read();
        self.check_object(root)?;
        dump_tree(&self.shared.pool, root, out)
    }

    pub fn create_index(&mut self, vol: VolNo, iid: u32, kdesc: KeyDesc) -> Result<IndexId> {
        self.check_mounted(vol)?;
        let _structure = self.shared.structure.write();
        let root = MlgfIndex::create(self.ctx(), &kdesc, vol, iid)?;
        self.lock_for_update(root)?;
        Ok(IndexId { root, kdesc })
    }

    fn open_index<'i>(&'i self, index: &'i IndexId) -> Result<MlgfIndex<'i>> {
        self.check_mounted(index.root.vol)?;
        let mlgf = MlgfIndex::open(self.ctx(), &index.kdesc, index.root);
        mlgf.check_root()?;
        Ok(mlgf)
    }

    pub fn insert_index(&mut self, index: &IndexId, kval: &[u32], oid: ObjectId) -> Result<()> {
        self.check_mounted(index.root.vol)?;
        self.lock_for_update(index.root)?;
        let _structure = self.shared.structure.write();
        self.open_index(index)?.insert(kval, oid)
    }

    pub fn delete_index(&mut self, index: &IndexId, kval: &[u32], oid: ObjectId) -> Result<()> {
        self.check_mounted(index.root.vol)?;
        self.lock_for_update(index.root)?;
        let _structure = self.shared.structure.write();
        self.open_index(index)?.delete(kval, oid)
    }

    /// Every object whose key lies in the box `[lower, upper]`.
    pub fn search_index(
        &self,
        index: &IndexId,
        lower: &[u32],
        upper: &[u32],
    ) -> Result<Vec<(Vec<u32>, ObjectId)>> {
        let _structure = self.shared.structure.read();
        self.open_index(index)?.search(lower, upper)
    }

    /// An object stored on the leaf whose region holds `kval`, or `None` when that leaf is
    /// empty. With `lock`, which must be a shared commit-duration request, the leaf's key
    /// range stays locked until the transaction ends.
    pub fn search_near_object(
        &self,
        index: &IndexId,
        kval: &[u32],
        lock: Option<LockRequest>,
    ) -> Result<Option<(Vec<u32>, ObjectId)>> {
        self.check_mounted(index.root.vol)?;
        if let Some(lock) = lock {
            if lock != LockRequest::SHARED_UNTIL_COMMIT {
                return Err(Error::bad_parameter(format!(
                    "search_near_object only takes S locks until commit, got {:?} {:?}",
                    lock.mode, lock.duration
                )));
            }
        }

        let _structure = self.shared.structure.read();
        self.open_index(index)?
            .search_near_object(kval, lock.is_some())
    }

    pub fn commit(mut self) -> Result<()> {
        let shared = self.shared;
        let txid = self.xact.txid;

        let (commit_lsn, _) = {
            let _active = shared.active.lock();
            self.xact
                .append(shared.wal.as_ref(), LogMode::RedoOnly, None, LogKind::Commit)?
        };
        self.finished = true;
        end_committed(
            &self.xact,
            commit_lsn,
            shared.wal.as_ref(),
            &shared.locks,
            &shared.active,
        )?;

        log::debug!("transaction {txid} committed at {commit_lsn}");
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.abort()
    }

    fn abort(&mut self) -> Result<()> {
        self.finished = true;
        let shared = self.shared;
        let txid = self.xact.txid;
        log::debug!("rolling back transaction {txid}");

        {
            let _structure = shared.structure.write();
            rollback(
                &self.xact,
                shared.wal.as_ref(),
                shared.wal.as_ref(),
                &shared.pool,
                &shared.alloc,
            )?;
        }
        shared.active.lock().shift_remove(&txid);
        shared.locks.release_all(txid)
    }
}

/// Finishes a transaction whose `Commit` record is at `commit_lsn`. `End` is written and
/// the transaction leaves the active table even when its locks cannot be released.
fn end_committed(
    xact: &Xact,
    commit_lsn: Lsn,
    log: &dyn LogWriter,
    locks: &dyn LockManager,
    active: &Mutex<IndexMap<TxId, Arc<Xact>>>,
) -> Result<()> {
    log.flush_up_to(commit_lsn)?;
    let released = locks.release_all(xact.txid);

    let mut active = active.lock();
    let end = xact.append(log, LogMode::RedoOnly, None, LogKind::End);
    active.shift_remove(&xact.txid);
    drop(active);

    end?;
    released
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.abort() {
            log::warn!("cannot roll back transaction {}: {err}", self.xact.txid);
        }
    }
}
