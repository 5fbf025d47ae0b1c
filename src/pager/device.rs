use crate::error::{Error, Result};
use crate::file_lock::FileLock;
use crate::id::{PageId, VolNo};
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Page-granular storage underneath the buffer pool.
pub(crate) trait Device: Send + Sync {
    fn page_size(&self) -> usize;

    /// Fills `buff` with the stored image. Returns false if the page was never written.
    fn read_page(&self, pgid: PageId, buff: &mut [u8]) -> Result<bool>;

    fn write_page(&self, pgid: PageId, buff: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;

    /// Number of pages the volume spans on the device.
    fn page_count(&self, vol: VolNo) -> Result<u32>;
}

struct VolumeFile {
    path: PathBuf,
    f: Mutex<File>,
}

/// The mount table: one data file per volume, named `vol-{n}.dat`.
pub(crate) struct VolumeSet {
    dir: PathBuf,
    page_size: usize,
    volumes: RwLock<HashMap<VolNo, Arc<VolumeFile>>>,
}

impl VolumeSet {
    pub(crate) fn new(dir: &Path, page_size: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            page_size,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn volume_path(dir: &Path, vol: VolNo) -> PathBuf {
        dir.join(format!("vol-{vol}.dat"))
    }

    /// Volumes that have a data file in the storage directory.
    pub(crate) fn existing_volumes(dir: &Path) -> anyhow::Result<Vec<VolNo>> {
        let mut vols = vec![];
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(vol) = name
                .strip_prefix("vol-")
                .and_then(|s| s.strip_suffix(".dat"))
                .and_then(|s| s.parse::<VolNo>().ok())
            else {
                continue;
            };
            vols.push(vol);
        }
        vols.sort_unstable();
        Ok(vols)
    }

    pub(crate) fn mount(&self, vol: VolNo) -> Result<()> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&vol) {
            return Ok(());
        }

        let path = Self::volume_path(&self.dir, vol);
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?
            .lock_exclusive(&path)?;
        if !f.metadata()?.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()).into());
        }
        if f.metadata()?.len() % self.page_size as u64 != 0 {
            log::warn!(
                "{} is not a multiple of the page size, the last page is partial",
                path.display()
            );
        }

        log::debug!("mounted volume {vol} from {}", path.display());
        volumes.insert(
            vol,
            Arc::new(VolumeFile {
                path,
                f: Mutex::new(f),
            }),
        );
        Ok(())
    }

    /// Removes the volume from the mount table. Its pages must already be flushed.
    pub(crate) fn dismount(&self, vol: VolNo) -> Result<()> {
        let Some(volume) = self.volumes.write().remove(&vol) else {
            return Err(Error::NotMounted(vol));
        };
        volume.f.lock().sync_all()?;
        log::debug!("dismounted volume {vol} ({})", volume.path.display());
        Ok(())
    }

    pub(crate) fn is_mounted(&self, vol: VolNo) -> bool {
        self.volumes.read().contains_key(&vol)
    }

    fn volume(&self, vol: VolNo) -> Result<Arc<VolumeFile>> {
        self.volumes
            .read()
            .get(&vol)
            .cloned()
            .ok_or(Error::NotMounted(vol))
    }
}

impl Device for VolumeSet {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, pgid: PageId, buff: &mut [u8]) -> Result<bool> {
        assert_eq!(self.page_size, buff.len());
        let volume = self.volume(pgid.vol)?;
        let mut f = volume.f.lock();

        let offset = pgid.page as u64 * self.page_size as u64;
        if offset + self.page_size as u64 > f.metadata()?.len() {
            return Ok(false);
        }
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buff)?;
        Ok(true)
    }

    fn write_page(&self, pgid: PageId, buff: &[u8]) -> Result<()> {
        assert_eq!(self.page_size, buff.len());
        let volume = self.volume(pgid.vol)?;
        let mut f = volume.f.lock();

        let offset = pgid.page as u64 * self.page_size as u64;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buff)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let volumes = self.volumes.read().values().cloned().collect::<Vec<_>>();
        for volume in volumes {
            volume.f.lock().sync_all()?;
        }
        Ok(())
    }

    fn page_count(&self, vol: VolNo) -> Result<u32> {
        let volume = self.volume(vol)?;
        let len = volume.f.lock().metadata()?.len();
        Ok((len / self.page_size as u64) as u32)
    }
}

/// In-memory device for tests, with switchable write failures.
#[cfg(test)]
pub(crate) struct MemDevice {
    page_size: usize,
    pages: Mutex<HashMap<PageId, Box<[u8]>>>,
    writes: Mutex<Vec<PageId>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemDevice {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(HashMap::new()),
            writes: Mutex::new(vec![]),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Page ids in write order.
    pub(crate) fn writes(&self) -> Vec<PageId> {
        self.writes.lock().clone()
    }

    pub(crate) fn stored(&self, pgid: PageId) -> Option<Box<[u8]>> {
        self.pages.lock().get(&pgid).cloned()
    }
}

#[cfg(test)]
impl Device for MemDevice {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, pgid: PageId, buff: &mut [u8]) -> Result<bool> {
        match self.pages.lock().get(&pgid) {
            Some(page) => {
                buff.copy_from_slice(page);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_page(&self, pgid: PageId, buff: &[u8]) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!("injected write failure on page {pgid}").into());
        }
        self.pages.lock().insert(pgid, buff.into());
        self.writes.lock().push(pgid);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn page_count(&self, vol: VolNo) -> Result<u32> {
        Ok(self
            .pages
            .lock()
            .keys()
            .filter(|pgid| pgid.vol == vol)
            .map(|pgid| pgid.page + 1)
            .max()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_set_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeSet::new(dir.path(), 1024);

        let pgid = PageId::new(1, 3).unwrap();
        let mut buff = vec![0u8; 1024];
        assert!(matches!(
            volumes.read_page(pgid, &mut buff),
            Err(Error::NotMounted(1))
        ));

        volumes.mount(1).unwrap();
        assert!(!volumes.read_page(pgid, &mut buff).unwrap());
        assert_eq!(0, volumes.page_count(1).unwrap());

        buff.fill(7);
        volumes.write_page(pgid, &buff).unwrap();
        assert_eq!(4, volumes.page_count(1).unwrap());

        let mut read = vec![0u8; 1024];
        assert!(volumes.read_page(pgid, &mut read).unwrap());
        assert_eq!(buff, read);
        assert!(volumes.read_page(pgid.sibling(0), &mut read).unwrap());
        assert!(read.iter().all(|b| *b == 0), "holes read back as zeroes");

        volumes.dismount(1).unwrap();
        assert!(!volumes.is_mounted(1));
        assert_eq!(vec![1], VolumeSet::existing_volumes(dir.path()).unwrap());
    }
}
