use crate::error::Result;
use crate::id::{Lsn, PageId};
use crate::log::{LogKind, LogMode};
use crate::pager::PageWrite;
use crate::wal::LogWriter;
use crate::xact::Xact;
use anyhow::anyhow;

/// How a page mutation is accounted for in the log.
///
/// Page mutators are shared by normal operation, recovery redo and rollback, the context
/// decides whether a record is written and which lsn the page gets.
#[derive(Clone, Copy)]
pub(crate) enum LogContext<'a> {
    Runtime {
        log: &'a dyn LogWriter,
        xact: &'a Xact,
    },
    /// Rollback: records are written as redo-only compensation records.
    Compensate {
        log: &'a dyn LogWriter,
        xact: &'a Xact,
        undo_next: Option<Lsn>,
    },
    /// Recovery is replaying the record at this lsn.
    Redo(Lsn),
    /// Writes nothing, for laying out pages in tests.
    #[cfg(test)]
    Off,
}

/// What a page header should carry after a logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stamp {
    Logged(Lsn, usize),
    Replayed(Lsn),
    #[cfg(test)]
    Unlogged,
}

impl<'a> LogContext<'a> {
    pub(crate) fn runtime(log: &'a dyn LogWriter, xact: &'a Xact) -> Self {
        Self::Runtime { log, xact }
    }

    pub(crate) fn record<'e, F>(&self, mode: LogMode, kind: F) -> Result<Stamp>
    where
        F: FnOnce() -> LogKind<'e>,
    {
        match *self {
            Self::Runtime { log, xact } => {
                let (lsn, len) = xact.append(log, mode, None, kind())?;
                Ok(Stamp::Logged(lsn, len))
            }
            Self::Compensate {
                log,
                xact,
                undo_next,
            } => {
                let (lsn, len) = xact.append(log, LogMode::RedoOnly, undo_next, kind())?;
                Ok(Stamp::Logged(lsn, len))
            }
            Self::Redo(lsn) => Ok(Stamp::Replayed(lsn)),
            #[cfg(test)]
            Self::Off => Ok(Stamp::Unlogged),
        }
    }

    /// Writes a record that does not touch a page, such as an allocation.
    pub(crate) fn record_alloc(&self, pgid: PageId) -> Result<Stamp> {
        self.record(LogMode::RedoOnly, || LogKind::AllocPage { pgid })
    }
}

/// Replaces the whole body of a page, keeping its type. Used when a structure moves the
/// content of a page elsewhere or reorders it in place.
pub(crate) fn write_image(page: &mut PageWrite, ctx: &LogContext, new: &[u8]) -> Result<()> {
    if new.len() != page.body().len() {
        return Err(anyhow!(
            "image of {} bytes does not fit the body of page {}",
            new.len(),
            page.id()
        )
        .into());
    }
    let pgid = page.id();
    let old = page.body();
    let stamp = ctx.record(LogMode::RedoUndo, || LogKind::PageImage { pgid, old, new })?;
    page.body_mut().copy_from_slice(new);
    page.stamp(stamp);
    Ok(())
}
