use crate::error::Result;
use crate::id::{PageId, TxId};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// The key space covered by an index page.
    KeyRange(PageId),
    Page(PageId),
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::KeyRange(pgid) => write!(f, "key range {pgid}"),
            LockResource::Page(pgid) => write!(f, "page {pgid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IS,
    IX,
    S,
    SIX,
    X,
}

impl LockMode {
    pub fn is_compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IS, IS | IX | S | SIX) | (IX, IS | IX) | (S, IS | S) | (SIX, IS)
        )
    }

    /// The weakest mode that covers both.
    pub fn supremum(self, other: LockMode) -> LockMode {
        use LockMode::*;
        match (self, other) {
            (a, b) if a == b => a,
            (X, _) | (_, X) => X,
            (SIX, _) | (_, SIX) => SIX,
            (IX, S) | (S, IX) => SIX,
            (IS, m) | (m, IS) => m,
            _ => X,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockDuration {
    /// Released explicitly by the operation that took it.
    Manual,
    /// Held until the transaction ends.
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReply {
    /// Granted, carrying the mode now held by the requester.
    Granted(LockMode),
    Deadlock,
}

pub trait LockManager: Send + Sync {
    fn request(
        &self,
        txid: TxId,
        resource: LockResource,
        mode: LockMode,
        duration: LockDuration,
    ) -> Result<LockReply>;

    /// Drops one manual-duration hold. Commit-duration holds stay until `release_all`.
    fn release(&self, txid: TxId, resource: LockResource) -> Result<()>;

    fn release_all(&self, txid: TxId) -> Result<()>;
}

/// What one transaction holds on a resource. The commit-duration part stays until
/// `release_all`, the manual part goes after as many releases as it was requested.
#[derive(Debug, Clone, Copy, Default)]
struct Hold {
    commit: Option<LockMode>,
    manual: Option<LockMode>,
    count: usize,
}

impl Hold {
    fn mode(&self) -> Option<LockMode> {
        match (self.commit, self.manual) {
            (Some(commit), Some(manual)) => Some(commit.supremum(manual)),
            (commit, manual) => commit.or(manual),
        }
    }

    fn add(&mut self, mode: LockMode, duration: LockDuration) {
        let part = match duration {
            LockDuration::Commit => &mut self.commit,
            LockDuration::Manual => {
                self.count += 1;
                &mut self.manual
            }
        };
        *part = Some(part.map_or(mode, |held| held.supremum(mode)));
    }
}

/// In-process lock table. A request that waits longer than the timeout is answered with
/// `Deadlock`.
pub struct LocalLockManager {
    table: Mutex<HashMap<LockResource, IndexMap<TxId, Hold>>>,
    released: Condvar,
    timeout: Duration,
}

impl LocalLockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Mode held by `txid` on `resource`, if any.
    pub fn held(&self, txid: TxId, resource: LockResource) -> Option<LockMode> {
        self.table
            .lock()
            .get(&resource)
            .and_then(|holders| holders.get(&txid))
            .and_then(Hold::mode)
    }
}

impl LockManager for LocalLockManager {
    fn request(
        &self,
        txid: TxId,
        resource: LockResource,
        mode: LockMode,
        duration: LockDuration,
    ) -> Result<LockReply> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        loop {
            let holders = table.entry(resource).or_default();
            let wanted = match holders.get(&txid).and_then(Hold::mode) {
                Some(held) => held.supremum(mode),
                None => mode,
            };
            let conflict = holders.iter().any(|(other, hold)| {
                *other != txid && hold.mode().is_some_and(|held| !wanted.is_compatible(held))
            });

            if !conflict {
                holders.entry(txid).or_default().add(mode, duration);
                log::trace!("{txid} holds {resource} in {wanted:?}");
                return Ok(LockReply::Granted(wanted));
            }

            if self.released.wait_until(&mut table, deadline).timed_out() {
                log::debug!("{txid} timed out waiting for {resource} in {wanted:?}");
                if table.get(&resource).is_some_and(|h| h.is_empty()) {
                    table.remove(&resource);
                }
                return Ok(LockReply::Deadlock);
            }
        }
    }

    fn release(&self, txid: TxId, resource: LockResource) -> Result<()> {
        let mut table = self.table.lock();
        let Some(holders) = table.get_mut(&resource) else {
            return Ok(());
        };
        let Some(hold) = holders.get_mut(&txid) else {
            return Ok(());
        };
        if hold.manual.is_none() {
            return Ok(());
        }

        hold.count -= 1;
        if hold.count == 0 {
            hold.manual = None;
            if hold.commit.is_none() {
                holders.shift_remove(&txid);
                if holders.is_empty() {
                    table.remove(&resource);
                }
            }
            self.released.notify_all();
        }
        Ok(())
    }

    fn release_all(&self, txid: TxId) -> Result<()> {
        let mut table = self.table.lock();
        table.retain(|_, holders| {
            holders.shift_remove(&txid);
            !holders.is_empty()
        });
        self.released.notify_all();
        Ok(())
    }
}
