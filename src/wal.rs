use crate::bins::SliceExt;
use crate::error::Result;
use crate::file_lock::FileLock;
use crate::id::{Lsn, LsnExt};
use crate::log::{LogDecodeResult, LogRecord, RECORD_HEADER_SIZE};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// The log writer contract consumed by the page engines and the flush coordinator.
pub(crate) trait LogWriter: Send + Sync {
    /// Queues `record` and returns its LSN and encoded length. The record is not durable
    /// until `flush_up_to` covers it.
    fn write_record(&self, record: &LogRecord) -> Result<(Lsn, usize)>;

    /// Blocks until every record with an LSN up to and including `lsn` is durable.
    fn flush_up_to(&self, lsn: Lsn) -> Result<()>;
}

/// Random access to written records, used to walk a transaction chain backwards.
pub(crate) trait LogReader: Send + Sync {
    fn read_at(&self, lsn: Lsn) -> Result<LogEntryBuf>;
}

const WAL_MAGIC: &[u8; 6] = b"gs_wal";
const WAL_HEADER_SIZE: usize = 32;
const WAL_VERSION: u16 = 0;

struct WalHeader {
    version: u16,
    checkpoint: Option<Lsn>,
}

impl WalHeader {
    fn decode(buff: &[u8]) -> Option<Self> {
        if &buff[0..6] != WAL_MAGIC {
            return None;
        }
        let stored_checksum = buff[24..32].read_u64();
        let calculated_checksum = crc64::crc64(0x1d0f, &buff[0..24]);
        if stored_checksum != calculated_checksum {
            return None;
        }

        Some(WalHeader {
            version: buff[6..8].read_u16(),
            checkpoint: Lsn::from_be_bytes(buff[8..16].try_into().unwrap()),
        })
    }

    fn encode(&self, buff: &mut [u8]) {
        assert_eq!(WAL_HEADER_SIZE, buff.len());
        buff[0..6].copy_from_slice(WAL_MAGIC);
        buff[6..8].put_u16(self.version);
        buff[8..16].copy_from_slice(&self.checkpoint.to_be_bytes());
        buff[16..24].fill(0);
        let checksum = crc64::crc64(0x1d0f, &buff[0..24]);
        buff[24..32].put_u64(checksum);
    }
}

/// File-backed write-ahead log. The LSN of a record is its byte offset in the file.
pub(crate) struct Wal {
    f: Mutex<File>,
    internal: Mutex<WalInternal>,
}

struct WalInternal {
    buffer: Vec<u8>,
    offset_end: usize,
    next_lsn: Lsn,
    first_unflushed: Lsn,
    checkpoint: Option<Lsn>,
}

impl Wal {
    pub(crate) fn open(path: &Path, buffer_size: usize) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?
            .lock_exclusive(path)?;

        let header = if f.metadata()?.len() < 2 * WAL_HEADER_SIZE as u64 {
            let header = WalHeader {
                version: WAL_VERSION,
                checkpoint: None,
            };
            Self::write_header(&mut f, &header)?;
            header
        } else {
            let mut header_buff = vec![0u8; 2 * WAL_HEADER_SIZE];
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut header_buff)?;
            let header = WalHeader::decode(&header_buff[..WAL_HEADER_SIZE])
                .or_else(|| WalHeader::decode(&header_buff[WAL_HEADER_SIZE..]))
                .ok_or_else(|| anyhow!("{} is not a wal file or is corrupted", path.display()))?;
            if header.version != WAL_VERSION {
                return Err(anyhow!("unsupported wal version {}", header.version));
            }
            header
        };

        let f = Mutex::new(f);

        let scan_start = header.checkpoint.unwrap_or(Self::first_lsn());
        let mut iter = WalIterator::new(&f, scan_start);
        while iter.next()?.is_some() {}
        let next_lsn = iter.lsn;

        // drop a torn tail so new records extend the valid prefix
        {
            let f = f.lock();
            if f.metadata()?.len() > next_lsn.get() {
                log::debug!("truncating torn wal tail at {next_lsn}");
                f.set_len(next_lsn.get())?;
            }
        }

        Ok(Wal {
            f,
            internal: Mutex::new(WalInternal {
                buffer: vec![0u8; buffer_size],
                offset_end: 0,
                next_lsn,
                first_unflushed: next_lsn,
                checkpoint: header.checkpoint,
            }),
        })
    }

    pub(crate) fn first_lsn() -> Lsn {
        Lsn::new(2 * WAL_HEADER_SIZE as u64)
    }

    fn write_header(f: &mut File, header: &WalHeader) -> anyhow::Result<()> {
        let mut header_buff = vec![0u8; 2 * WAL_HEADER_SIZE];
        header.encode(&mut header_buff[..WAL_HEADER_SIZE]);
        header.encode(&mut header_buff[WAL_HEADER_SIZE..]);
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&header_buff)?;
        f.sync_all()?;
        Ok(())
    }

    pub(crate) fn append(&self, record: &LogRecord) -> anyhow::Result<Lsn> {
        let size = record.size();

        let mut internal = self.internal.lock();
        if internal.offset_end + size > internal.buffer.len() {
            Self::flush(&mut self.f.lock(), &mut internal)?;
            if size > internal.buffer.len() {
                internal.buffer.resize(size, 0);
            }
        }

        let offset_end = internal.offset_end;
        let lsn = internal.next_lsn;
        record.encode(&mut internal.buffer[offset_end..offset_end + size]);
        internal.offset_end += size;
        internal.next_lsn = lsn.add(size);

        Ok(lsn)
    }

    pub(crate) fn sync(&self, lsn: Lsn) -> anyhow::Result<()> {
        let mut internal = self.internal.lock();
        if internal.first_unflushed <= lsn {
            Self::flush(&mut self.f.lock(), &mut internal)?;
        }
        Ok(())
    }

    pub(crate) fn sync_all(&self) -> anyhow::Result<()> {
        let mut internal = self.internal.lock();
        Self::flush(&mut self.f.lock(), &mut internal)
    }

    fn flush(f: &mut File, internal: &mut WalInternal) -> anyhow::Result<()> {
        if internal.offset_end == 0 {
            return Ok(());
        }
        f.seek(SeekFrom::Start(internal.first_unflushed.get()))?;
        f.write_all(&internal.buffer[..internal.offset_end])?;
        f.sync_data()?;
        log::trace!(
            "wal flushed [{}, {})",
            internal.first_unflushed,
            internal.next_lsn
        );
        internal.offset_end = 0;
        internal.first_unflushed = internal.next_lsn;
        Ok(())
    }

    pub(crate) fn next_lsn(&self) -> Lsn {
        self.internal.lock().next_lsn
    }

    pub(crate) fn checkpoint(&self) -> Option<Lsn> {
        self.internal.lock().checkpoint
    }

    /// Makes `lsn` the starting point of the next recovery. Every page dirtied before the
    /// checkpoint record must already be on disk.
    pub(crate) fn set_checkpoint(&self, lsn: Lsn) -> anyhow::Result<()> {
        let mut internal = self.internal.lock();
        let mut f = self.f.lock();
        Self::flush(&mut f, &mut internal)?;
        Self::write_header(
            &mut f,
            &WalHeader {
                version: WAL_VERSION,
                checkpoint: Some(lsn),
            },
        )?;
        internal.checkpoint = Some(lsn);
        Ok(())
    }

    /// Iterates the durable records starting at `lsn`. Pending records are flushed first.
    pub(crate) fn iter_from(&self, lsn: Lsn) -> anyhow::Result<WalIterator<'_>> {
        self.sync_all()?;
        Ok(WalIterator::new(&self.f, lsn))
    }

    /// Reads the record at `lsn`, flushing pending records first when it is not durable yet.
    pub(crate) fn read_record(&self, lsn: Lsn) -> anyhow::Result<LogEntryBuf> {
        self.sync(lsn)?;

        let mut f = self.f.lock();
        let mut header = [0u8; RECORD_HEADER_SIZE];
        f.seek(SeekFrom::Start(lsn.get()))?;
        f.read_exact(&mut header)?;
        let size = LogRecord::size_from_header(&header);

        let mut bytes = vec![0u8; size];
        f.seek(SeekFrom::Start(lsn.get()))?;
        f.read_exact(&mut bytes)?;
        match LogRecord::decode(&bytes) {
            LogDecodeResult::Ok(..) => Ok(LogEntryBuf { lsn, bytes }),
            LogDecodeResult::Err(err) => Err(err),
            _ => Err(anyhow!("log record at {lsn} is corrupted")),
        }
    }

    pub(crate) fn shutdown(self) -> anyhow::Result<()> {
        let mut internal = self.internal.into_inner();
        let mut f = self.f.into_inner();
        Self::flush(&mut f, &mut internal)
    }
}

impl LogWriter for Wal {
    fn write_record(&self, record: &LogRecord) -> Result<(Lsn, usize)> {
        let lsn = self.append(record)?;
        Ok((lsn, record.size()))
    }

    fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        Ok(self.sync(lsn)?)
    }
}

impl LogReader for Wal {
    fn read_at(&self, lsn: Lsn) -> Result<LogEntryBuf> {
        Ok(self.read_record(lsn)?)
    }
}

/// An owned copy of one encoded record.
#[derive(Clone)]
pub(crate) struct LogEntryBuf {
    pub(crate) lsn: Lsn,
    bytes: Vec<u8>,
}

impl LogEntryBuf {
    #[cfg(test)]
    pub(crate) fn from_encoded(lsn: Lsn, bytes: Vec<u8>) -> Self {
        Self { lsn, bytes }
    }

    pub(crate) fn record(&self) -> anyhow::Result<LogRecord<'_>> {
        match LogRecord::decode(&self.bytes) {
            LogDecodeResult::Ok(record, _) => Ok(record),
            LogDecodeResult::Err(err) => Err(err),
            _ => Err(anyhow!("log record at {} is corrupted", self.lsn)),
        }
    }

    pub(crate) fn next_lsn(&self) -> Lsn {
        self.lsn.add(self.bytes.len())
    }
}

pub(crate) struct WalIterator<'a> {
    f: &'a Mutex<File>,
    f_offset: u64,
    lsn: Lsn,

    buffer: Vec<u8>,
    start_offset: usize,
    end_offset: usize,
}

impl<'a> WalIterator<'a> {
    fn new(f: &'a Mutex<File>, lsn: Lsn) -> Self {
        Self {
            f,
            f_offset: lsn.get(),
            lsn,
            buffer: vec![0u8; 64 * 1024],
            start_offset: 0,
            end_offset: 0,
        }
    }

    pub(crate) fn next(&mut self) -> anyhow::Result<Option<LogEntryBuf>> {
        loop {
            let buff = &self.buffer[self.start_offset..self.end_offset];
            match LogRecord::decode(buff) {
                LogDecodeResult::Ok(_, size) => {
                    let entry = LogEntryBuf {
                        lsn: self.lsn,
                        bytes: buff[..size].to_vec(),
                    };
                    self.start_offset += size;
                    self.lsn = self.lsn.add(size);
                    return Ok(Some(entry));
                }
                LogDecodeResult::NeedMoreBytes => {
                    let len = self.end_offset - self.start_offset;
                    self.buffer.copy_within(self.start_offset..self.end_offset, 0);
                    self.start_offset = 0;
                    self.end_offset = len;
                    if self.end_offset == self.buffer.len() {
                        let new_len = self.buffer.len() * 2;
                        self.buffer.resize(new_len, 0);
                    }

                    let mut f = self.f.lock();
                    if self.f_offset >= f.metadata()?.len() {
                        return Ok(None);
                    }
                    f.seek(SeekFrom::Start(self.f_offset))?;
                    let n = f.read(&mut self.buffer[self.end_offset..])?;
                    if n == 0 {
                        return Ok(None);
                    }
                    self.f_offset += n as u64;
                    self.end_offset += n;
                }
                LogDecodeResult::Incomplete => return Ok(None),
                LogDecodeResult::Err(err) => return Err(err),
            }
        }
    }
}
