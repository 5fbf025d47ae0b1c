mod device;
mod evictor;
mod flush;
mod log;
mod pool;

use crate::bins::SliceExt;
use crate::id::{Lsn, LsnExt, PageId, PageIdExt};
use anyhow::anyhow;
use std::ops::Range;

pub(crate) use device::{Device, VolumeSet};
#[cfg(test)]
pub(crate) use device::MemDevice;
pub(crate) use flush::flush_buffer;
pub(crate) use log::{write_image, LogContext, Stamp};
pub(crate) use pool::{BufferPool, PageRead, PageWrite, PoolStats};

pub(crate) const MINIMUM_PAGE_SIZE: usize = 1024;
pub(crate) const MAXIMUM_PAGE_SIZE: usize = 0x4000;

pub(crate) const PAGE_HEADER_SIZE: usize = 24;
const PAGE_HEADER_PAGE_ID_RANGE: Range<usize> = 0..8;
const PAGE_HEADER_PAGE_LSN_RANGE: Range<usize> = 8..16;
const PAGE_HEADER_LOG_REC_LEN_RANGE: Range<usize> = 16..20;
const PAGE_HEADER_KIND_INDEX: usize = 20;

pub(crate) const PAGE_FOOTER_SIZE: usize = 8;

const fn range_size(range: Range<usize>) -> usize {
    range.end - range.start
}

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

const_assert!(PAGE_HEADER_PAGE_ID_RANGE.end <= PAGE_HEADER_SIZE);
const_assert!(range_size(PAGE_HEADER_PAGE_ID_RANGE) == 8);
const_assert!(PAGE_HEADER_PAGE_LSN_RANGE.end <= PAGE_HEADER_SIZE);
const_assert!(range_size(PAGE_HEADER_PAGE_LSN_RANGE) == 8);
const_assert!(range_size(PAGE_HEADER_LOG_REC_LEN_RANGE) == 4);
const_assert!(PAGE_HEADER_KIND_INDEX < PAGE_HEADER_SIZE);

pub(crate) fn check_page_size(page_size: usize) -> anyhow::Result<()> {
    if page_size.count_ones() != 1 {
        return Err(anyhow!("page size must be a power of 2, but got {page_size}"));
    }
    if page_size < MINIMUM_PAGE_SIZE {
        return Err(anyhow!(
            "page size must be at least {MINIMUM_PAGE_SIZE} bytes, but got {page_size}"
        ));
    }
    if page_size > MAXIMUM_PAGE_SIZE {
        return Err(anyhow!(
            "page size must be at most {MAXIMUM_PAGE_SIZE} bytes, but got {page_size}"
        ));
    }
    Ok(())
}

/// Size of the type-specific area of a page.
pub(crate) fn body_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - PAGE_FOOTER_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageType {
    /// Never written, the body is all zeroes.
    Fresh,
    LotNode,
    LotLeaf,
    MlgfDirectory,
    MlgfLeaf,
}

impl PageType {
    fn code(self) -> u8 {
        match self {
            PageType::Fresh => 0,
            PageType::LotNode => 1,
            PageType::LotLeaf => 2,
            PageType::MlgfDirectory => 3,
            PageType::MlgfLeaf => 4,
        }
    }

    fn from_code(code: u8) -> anyhow::Result<Self> {
        Ok(match code {
            0 => PageType::Fresh,
            1 => PageType::LotNode,
            2 => PageType::LotLeaf,
            3 => PageType::MlgfDirectory,
            4 => PageType::MlgfLeaf,
            _ => return Err(anyhow!("unknown page type {code}")),
        })
    }
}

/// The header every buffered page starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    pub(crate) pgid: PageId,
    /// LSN of the last record applied to this page.
    pub(crate) lsn: Option<Lsn>,
    pub(crate) log_rec_len: u32,
    pub(crate) kind: PageType,
}

impl PageHeader {
    pub(crate) fn fresh(pgid: PageId) -> Self {
        Self {
            pgid,
            lsn: None,
            log_rec_len: 0,
            kind: PageType::Fresh,
        }
    }

    /// Stamps the header and the footer checksum into a full page image.
    pub(crate) fn seal(&self, page: &mut [u8]) {
        page[PAGE_HEADER_PAGE_ID_RANGE].copy_from_slice(&self.pgid.to_be_bytes());
        page[PAGE_HEADER_PAGE_LSN_RANGE].copy_from_slice(&self.lsn.to_be_bytes());
        page[PAGE_HEADER_LOG_REC_LEN_RANGE].put_u32(self.log_rec_len);
        page[PAGE_HEADER_KIND_INDEX] = self.kind.code();
        page[PAGE_HEADER_KIND_INDEX + 1..PAGE_HEADER_SIZE].fill(0);

        let footer = page.len() - PAGE_FOOTER_SIZE;
        let checksum = crc64::crc64(0x1d0f, &page[..footer]);
        page[footer..].put_u64(checksum);
    }

    /// Decodes a full page image read from a device. An all-zero image is a fresh page.
    pub(crate) fn open(pgid: PageId, page: &[u8]) -> anyhow::Result<Self> {
        if page.iter().all(|b| *b == 0) {
            return Ok(Self::fresh(pgid));
        }

        let footer = page.len() - PAGE_FOOTER_SIZE;
        let stored_checksum = page[footer..].read_u64();
        let calculated_checksum = crc64::crc64(0x1d0f, &page[..footer]);
        if stored_checksum != calculated_checksum {
            return Err(anyhow!("page {pgid} has a checksum mismatch"));
        }

        let stored_pgid =
            PageId::from_be_bytes(page[PAGE_HEADER_PAGE_ID_RANGE].try_into().unwrap());
        if stored_pgid != Some(pgid) {
            return Err(anyhow!(
                "page {pgid} holds the image of page {stored_pgid:?}"
            ));
        }

        Ok(Self {
            pgid,
            lsn: Lsn::from_be_bytes(page[PAGE_HEADER_PAGE_LSN_RANGE].try_into().unwrap()),
            log_rec_len: page[PAGE_HEADER_LOG_REC_LEN_RANGE].read_u32(),
            kind: PageType::from_code(page[PAGE_HEADER_KIND_INDEX])?,
        })
    }
}
