use std::fs::File;
use std::path::Path;

/// Exclusive advisory lock held for the lifetime of the file handle, so two processes never
/// open the same volume or log.
pub(crate) trait FileLock: Sized {
    fn lock_exclusive(self, path: &Path) -> anyhow::Result<Self>;
}

#[cfg(unix)]
impl FileLock for File {
    fn lock_exclusive(self, path: &Path) -> anyhow::Result<Self> {
        use anyhow::anyhow;
        use std::os::unix::io::AsRawFd;
        use syscalls::{syscall2, Sysno};

        const LOCK_EX: usize = 0x2;
        const LOCK_NB: usize = 0x4;
        let fd = self.as_raw_fd();
        let result = unsafe { syscall2(Sysno::flock, fd as usize, LOCK_EX | LOCK_NB) };
        if let Err(err) = result {
            Err(anyhow!(
                "cannot lock {}, is it opened by another process? errno={err}",
                path.display()
            ))
        } else {
            Ok(self)
        }
    }
}

#[cfg(not(unix))]
impl FileLock for File {
    fn lock_exclusive(self, _path: &Path) -> anyhow::Result<Self> {
        Ok(self)
    }
}
