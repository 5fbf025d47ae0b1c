use std::fmt;
use std::num::NonZeroU64;

pub type VolNo = u32;

/// Page number inside a volume. Child pointers in LOT and MLGF pages store only this part,
/// the volume is implied by the parent.
pub type ShortPageId = u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(NonZeroU64);

impl TxId {
    #[inline]
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    #[inline]
    pub(crate) fn next(&self) -> Self {
        Self(self.0.checked_add(1).unwrap())
    }

    #[inline]
    pub(crate) fn from_be_bytes(txid: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_be_bytes(txid))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

pub(crate) trait TxIdExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl TxIdExt for TxId {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}

impl TxIdExt for Option<TxId> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(txid) = self {
            txid.to_be_bytes()
        } else {
            0u64.to_be_bytes()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    #[inline]
    pub(crate) fn new(lsn: u64) -> Self {
        assert!(lsn != u64::MAX);
        Self(lsn)
    }

    #[inline]
    pub(crate) fn from_be_bytes(lsn: [u8; 8]) -> Option<Self> {
        let val = u64::from_be_bytes(lsn);
        if val == u64::MAX {
            None
        } else {
            Some(Self(val))
        }
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn add(&self, offset: usize) -> Self {
        Self::new(self.0 + offset as u64)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) trait LsnExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl LsnExt for Lsn {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.get().to_be_bytes()
    }
}

impl LsnExt for Option<Lsn> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(lsn) = self {
            lsn.to_be_bytes()
        } else {
            [0xffu8; 8]
        }
    }
}

/// Stable on-disk identity of a page: a volume and a page number inside it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    pub vol: VolNo,
    pub page: ShortPageId,
}

impl PageId {
    pub fn new(vol: VolNo, page: ShortPageId) -> Option<Self> {
        if vol == u32::MAX && page == u32::MAX {
            None
        } else {
            Some(Self { vol, page })
        }
    }

    /// Returns the page with number `page` on the same volume.
    #[inline]
    pub(crate) fn sibling(&self, page: ShortPageId) -> Self {
        Self {
            vol: self.vol,
            page,
        }
    }

    pub(crate) fn from_be_bytes(pgid: [u8; 8]) -> Option<Self> {
        let vol = u32::from_be_bytes(pgid[0..4].try_into().unwrap());
        let page = u32::from_be_bytes(pgid[4..8].try_into().unwrap());
        Self::new(vol, page)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vol, self.page)
    }
}

pub(crate) trait PageIdExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl PageIdExt for PageId {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        let mut buff = [0u8; 8];
        buff[0..4].copy_from_slice(&self.vol.to_be_bytes());
        buff[4..8].copy_from_slice(&self.page.to_be_bytes());
        buff
    }
}

impl PageIdExt for Option<PageId> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(pgid) = self {
            pgid.to_be_bytes()
        } else {
            [0xffu8; 8]
        }
    }
}

/// Identity of an object stored in a data page, as recorded in index leaves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub page: PageId,
    pub slot: u16,
    /// Distinguishes successive objects that reuse a slot.
    pub unique: u32,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.page, self.slot, self.unique)
    }
}
