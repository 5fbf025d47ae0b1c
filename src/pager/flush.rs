use crate::error::Result;
use crate::pager::device::Device;
use crate::pager::pool::BufferEntry;
use crate::wal::LogWriter;

/// Writes a dirty buffer entry to its device page, forcing the log first.
///
/// Clean and invalid entries are left alone. The log is made durable up to the page lsn
/// before the image is written, and the dirty flag is cleared only once the write
/// succeeded. On error the entry stays dirty.
pub(crate) fn flush_buffer(
    entry: &mut BufferEntry,
    log: &dyn LogWriter,
    device: &dyn Device,
) -> Result<()> {
    if !entry.dirty || entry.invalid {
        return Ok(());
    }
    let Some(pgid) = entry.key else {
        return Ok(());
    };

    if let Some(lsn) = entry.header.lsn {
        log.flush_up_to(lsn)?;
    }

    entry.header.seal(&mut entry.page);
    device.write_page(pgid, &entry.page)?;
    entry.dirty = false;

    log::trace!("flushed page {pgid} lsn={:?}", entry.header.lsn);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::id::{Lsn, PageId, VolNo};
    use crate::log::LogRecord;
    use crate::pager::{PageHeader, PageType};
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        FlushLog(Lsn),
        WritePage(PageId),
    }

    struct RecordingLog {
        calls: Arc<Mutex<Vec<Call>>>,
        fail: bool,
    }

    impl LogWriter for RecordingLog {
        fn write_record(&self, _record: &LogRecord) -> Result<(Lsn, usize)> {
            unreachable!("flushing never writes log records")
        }

        fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
            if self.fail {
                return Err(anyhow!("log device is gone").into());
            }
            self.calls.lock().push(Call::FlushLog(lsn));
            Ok(())
        }
    }

    struct RecordingDevice {
        calls: Arc<Mutex<Vec<Call>>>,
        fail: bool,
    }

    impl Device for RecordingDevice {
        fn page_size(&self) -> usize {
            1024
        }

        fn read_page(&self, _pgid: PageId, _buff: &mut [u8]) -> Result<bool> {
            Ok(false)
        }

        fn write_page(&self, pgid: PageId, _buff: &[u8]) -> Result<()> {
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "short write").into());
            }
            self.calls.lock().push(Call::WritePage(pgid));
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }

        fn page_count(&self, _vol: VolNo) -> Result<u32> {
            Ok(0)
        }
    }

    fn collaborators(
        fail_log: bool,
        fail_device: bool,
    ) -> (Arc<Mutex<Vec<Call>>>, RecordingLog, RecordingDevice) {
        let calls = Arc::new(Mutex::new(vec![]));
        let log = RecordingLog {
            calls: calls.clone(),
            fail: fail_log,
        };
        let device = RecordingDevice {
            calls: calls.clone(),
            fail: fail_device,
        };
        (calls, log, device)
    }

    fn entry(pgid: PageId, lsn: u64, dirty: bool, invalid: bool) -> BufferEntry {
        BufferEntry {
            key: Some(pgid),
            header: PageHeader {
                pgid,
                lsn: Some(Lsn::new(lsn)),
                log_rec_len: 40,
                kind: PageType::LotLeaf,
            },
            page: vec![0u8; 1024].into_boxed_slice(),
            dirty,
            invalid,
        }
    }

    #[test]
    fn test_clean_or_invalid_entry_is_noop() {
        let pgid = PageId::new(0, 1).unwrap();
        for (dirty, invalid) in [(false, false), (false, true), (true, true)] {
            let (calls, log, device) = collaborators(false, false);
            let mut entry = entry(pgid, 128, dirty, invalid);
            flush_buffer(&mut entry, &log, &device).unwrap();
            assert!(calls.lock().is_empty());
            assert_eq!(dirty, entry.dirty);
        }
    }

    #[test]
    fn test_log_is_forced_before_page_write() {
        let pgid = PageId::new(0, 7).unwrap();
        let (calls, log, device) = collaborators(false, false);
        let mut entry = entry(pgid, 4096, true, false);
        flush_buffer(&mut entry, &log, &device).unwrap();

        assert_eq!(
            vec![Call::FlushLog(Lsn::new(4096)), Call::WritePage(pgid)],
            *calls.lock()
        );
        assert!(!entry.dirty);
        assert_eq!(
            entry.header,
            PageHeader::open(pgid, &entry.page).unwrap(),
            "the written image carries the page header"
        );
    }

    #[test]
    fn test_failures_keep_entry_dirty() {
        let pgid = PageId::new(0, 7).unwrap();

        let (calls, log, device) = collaborators(true, false);
        let mut dirty = entry(pgid, 64, true, false);
        let err = flush_buffer(&mut dirty, &log, &device).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(dirty.dirty);
        assert!(calls.lock().is_empty(), "page must not be written without the log");

        let (calls, log, device) = collaborators(false, true);
        let err = flush_buffer(&mut dirty, &log, &device).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(dirty.dirty);
        assert_eq!(vec![Call::FlushLog(Lsn::new(64))], *calls.lock());
    }
}
