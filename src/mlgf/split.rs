use crate::action::{LockScope, PageReservation};
use crate::error::{Error, Result};
use crate::id::PageId;
use crate::lock::{LockDuration, LockMode, LockResource};
use crate::log::LogMode;
use crate::mlgf::key::{low_bits, mask_upper, next_bit, Extreme, KeyDesc, HASH_BITS};
use crate::mlgf::page::{
    delete_directory_entries, encode_entries, encode_objects, init_directory, init_leaf_page,
    insert_directory_entries, insert_leaf_objects, DirEntry, DirPage, LeafPage,
};
use crate::pager::write_image;
use crate::segment::Segment;
use crate::xact::XactContext;

/// The dimension and bit a page is split on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SplitDomain {
    pub(crate) dim: usize,
    pub(crate) bit: u32,
    /// Whether the entries with the bit set already form a suffix of the page.
    pub(crate) contiguous: bool,
}

/// The two halves of a split page, described as entries of the parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SplitOutcome {
    /// Replaces the parent's entry for the page that was split.
    pub(crate) src: DirEntry,
    /// Goes right after `src` in the parent.
    pub(crate) dst: DirEntry,
    pub(crate) new_page: PageId,
    pub(crate) dim: usize,
}

/// Chooses the dimension to split a directory page on.
///
/// `entries` are the page's entries in storage order, with the entry being added already
/// in place, and `region_bits` are the valid bits of the page's own region. A dimension
/// qualifies when every entry fixes the next bit of the region on it and both sides of
/// that bit are non-empty. Contiguous dimensions win over the others, then the most
/// balanced one, then the lowest.
pub(crate) fn select_split_domain(entries: &[DirEntry], region_bits: &[u8]) -> Option<SplitDomain> {
    let mut best: Option<((bool, usize), SplitDomain)> = None;
    for (dim, bits) in region_bits.iter().copied().enumerate() {
        if bits >= HASH_BITS || entries.iter().any(|e| e.n_valid_bits[dim] <= bits) {
            continue;
        }
        let bit = next_bit(bits);
        let sides = entries
            .iter()
            .map(|e| e.hash[dim] & bit != 0)
            .collect::<Vec<_>>();
        let ones = sides.iter().filter(|s| **s).count();
        if ones == 0 || ones == sides.len() {
            continue;
        }

        let contiguous = sides.windows(2).all(|w| !(w[0] && !w[1]));
        let rank = (!contiguous, ones.abs_diff(sides.len() - ones));
        if best.as_ref().map_or(true, |(best_rank, _)| rank < *best_rank) {
            best = Some((
                rank,
                SplitDomain {
                    dim,
                    bit,
                    contiguous,
                },
            ));
        }
    }
    best.map(|(_, domain)| domain)
}

/// Bounds of one half of a split: the region `prefix`/`bits` tightened to the extremes of
/// `values`. An empty half records the far end of its region.
fn bounding_entry<'v>(
    kdesc: &KeyDesc,
    spid: u32,
    bits: &[u8],
    prefix: &[u32],
    theta: u16,
    values: impl Iterator<Item = &'v [u32]> + Clone,
) -> DirEntry {
    let hash = (0..kdesc.n_keys())
        .map(|d| {
            let low = mask_upper(prefix[d], bits[d]);
            match kdesc.extreme(d) {
                Extreme::Min => values
                    .clone()
                    .map(|v| v[d])
                    .fold(low | low_bits(bits[d]), u32::min),
                Extreme::Max => values.clone().map(|v| v[d]).fold(low, u32::max),
            }
        })
        .collect();
    DirEntry {
        spid,
        theta,
        n_valid_bits: bits.to_vec(),
        hash,
    }
}

fn split_regions(src: &DirEntry, dim: usize, bit: u32) -> (Vec<u8>, Vec<u32>, Vec<u32>) {
    let prefix = src
        .hash
        .iter()
        .zip(&src.n_valid_bits)
        .map(|(h, b)| mask_upper(*h, *b))
        .collect::<Vec<_>>();
    let mut bits = src.n_valid_bits.clone();
    bits[dim] += 1;
    let mut dst_prefix = prefix.clone();
    dst_prefix[dim] |= bit;
    (bits, prefix, dst_prefix)
}

fn lock_for_split(
    locks: &mut LockScope,
    pgid: PageId,
    range_mode: LockMode,
) -> Result<LockMode> {
    let granted = locks.acquire(LockResource::KeyRange(pgid), range_mode, LockDuration::Manual)?;
    locks.acquire(LockResource::Page(pgid), LockMode::X, LockDuration::Manual)?;
    Ok(granted.unwrap_or(range_mode))
}

/// Splits the full directory page `pgid` while adding `inserted` right after the entry at
/// `after`. `src` is the parent's entry for the page.
///
/// The entries from the first one with the split bit set to the end move to a new page.
/// Records for the new page are written before the deletion from the old one. The caller
/// puts the returned entries into the parent.
pub(crate) fn split_directory_page(
    ctx: &XactContext,
    kdesc: &KeyDesc,
    pgid: PageId,
    src: &DirEntry,
    after: usize,
    inserted: &DirEntry,
) -> Result<SplitOutcome> {
    let log = ctx.log_context();
    let mut locks = LockScope::new(ctx.locks, ctx.txid());
    let range_mode = lock_for_split(&mut locks, pgid, LockMode::IX)?;

    let mut page = ctx.pool.pin_write(pgid)?;
    let dir = DirPage::read_write(&page)?;
    if after >= dir.entries.len() {
        return Err(Error::bad_parameter(format!(
            "page {pgid} has no entry {after} to insert after"
        )));
    }

    // entries in their final order, the flag marks the inserted one
    let mut all = dir
        .entries
        .iter()
        .cloned()
        .map(|e| (e, false))
        .collect::<Vec<_>>();
    all.insert(after + 1, (inserted.clone(), true));
    let list = all.iter().map(|(e, _)| e.clone()).collect::<Vec<_>>();
    let Some(domain) = select_split_domain(&list, &src.n_valid_bits) else {
        return Err(Error::Unsplittable(pgid));
    };
    let SplitDomain { dim, bit, .. } = domain;
    log::debug!(
        "splitting directory page {pgid} on dimension {dim} bit {bit:#010x} contiguous={}",
        domain.contiguous
    );

    let reordered = if domain.contiguous {
        None
    } else {
        let (unset, set): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|(e, _)| e.hash[dim] & bit == 0);
        all = unset.into_iter().chain(set).collect();
        Some(DirPage {
            entries: all
                .iter()
                .filter(|(_, new)| !new)
                .map(|(e, _)| e.clone())
                .collect(),
            ..dir.clone()
        })
    };

    let split_at = all
        .iter()
        .position(|(e, _)| e.hash[dim] & bit != 0)
        .unwrap_or(all.len());
    let inserted_at = all.iter().position(|(_, new)| *new).unwrap_or(after + 1);
    let into_new_page = inserted_at >= split_at;
    let stored = all
        .iter()
        .filter(|(_, new)| !new)
        .map(|(e, _)| e.clone())
        .collect::<Vec<_>>();
    let kept = if into_new_page { split_at } else { split_at - 1 };

    let new_pgid = ctx.alloc.allocate_page(&log, pgid.vol, Segment::Index)?;
    let reservation = PageReservation::new(ctx.alloc, new_pgid);
    lock_for_split(&mut locks, new_pgid, range_mode)?;
    if let Some(reordered) = reordered {
        write_image(&mut page, &log, &reordered.encode(ctx.pool.body_size()))?;
    }
    let mut new_page = ctx.pool.pin_new(new_pgid)?;

    init_directory(&mut new_page, &log, dir.iid, dir.height, false, dir.n_keys)?;
    if kept < stored.len() {
        let moved = encode_entries(&stored[kept..]);
        insert_directory_entries(&mut new_page, &log, LogMode::RedoOnly, 0, &moved)?;
        delete_directory_entries(&mut page, &log, LogMode::RedoUndo, kept, stored.len() - kept)?;
    }
    let bytes = inserted.to_bytes();
    if into_new_page {
        let at = inserted_at - split_at;
        insert_directory_entries(&mut new_page, &log, LogMode::RedoOnly, at, &bytes)?;
    } else {
        insert_directory_entries(&mut page, &log, LogMode::RedoUndo, inserted_at, &bytes)?;
    }

    let (bits, prefix, dst_prefix) = split_regions(src, dim, bit);
    let theta = |entries: &[(DirEntry, bool)]| {
        entries.iter().map(|(e, _)| e.total_bits()).min().unwrap_or(0)
    };
    let (old_half, new_half) = all.split_at(split_at);
    let src_entry = bounding_entry(
        kdesc,
        pgid.page,
        &bits,
        &prefix,
        theta(old_half),
        old_half.iter().map(|(e, _)| &e.hash[..]),
    );
    let dst_entry = bounding_entry(
        kdesc,
        new_pgid.page,
        &bits,
        &dst_prefix,
        theta(new_half),
        new_half.iter().map(|(e, _)| &e.hash[..]),
    );

    drop(new_page);
    drop(page);
    let new_pgid = reservation.keep();
    locks.release()?;

    Ok(SplitOutcome {
        src: src_entry,
        dst: dst_entry,
        new_page: new_pgid,
        dim,
    })
}

/// Chooses the dimension and bit to split a leaf on, given every key stored under the
/// leaf and the valid bits of its region.
///
/// Dimensions whose keys all agree below the region can never separate them and are
/// skipped. The others rank by how far below the region their keys first differ, so a
/// split that leaves one side empty is only made when no dimension divides the keys at
/// the next bit. Ties go to the most balanced dimension, then the lowest.
pub(crate) fn select_leaf_domain(keys: &[&[u32]], region_bits: &[u8]) -> Option<(usize, u32)> {
    let first = keys.first()?;
    let mut best: Option<((u32, usize), usize, u32)> = None;
    for (dim, bits) in region_bits.iter().copied().enumerate() {
        if bits >= HASH_BITS {
            continue;
        }
        let differ = keys
            .iter()
            .fold(0, |acc, k| acc | (k[dim] ^ first[dim]))
            & low_bits(bits);
        if differ == 0 {
            continue;
        }
        let distance = differ.leading_zeros().saturating_sub(bits as u32);
        let bit = next_bit(bits);
        let ones = keys.iter().filter(|k| k[dim] & bit != 0).count();
        let rank = (distance, ones.abs_diff(keys.len() - ones));
        if best.as_ref().map_or(true, |(b, _, _)| rank < *b) {
            best = Some((rank, dim, bit));
        }
    }
    best.map(|(_, dim, bit)| (dim, bit))
}

/// The key shared by the overflow pages chained after a leaf, or `None` when the chain
/// holds no object.
pub(crate) fn overflow_key(
    ctx: &XactContext,
    leaf: PageId,
    mut next: Option<u32>,
) -> Result<Option<Vec<u32>>> {
    while let Some(spid) = next {
        let page = ctx.pool.pin_read(leaf.sibling(spid))?;
        let chained = LeafPage::read(&page)?;
        if let Some(object) = chained.objects.into_iter().next() {
            return Ok(Some(object.kval));
        }
        next = chained.overflow;
    }
    Ok(None)
}

/// Splits the full leaf `pgid` before `pending` is added to it. `src` is the parent's
/// entry for the leaf.
///
/// One side may be left empty when every key agrees on the chosen bit. The overflow
/// chain of the leaf follows the side its key falls on. When every key under the leaf is
/// `pending`, nothing is allocated and `Unsplittable` is returned. The caller retries
/// the insert.
pub(crate) fn split_leaf_page(
    ctx: &XactContext,
    kdesc: &KeyDesc,
    pgid: PageId,
    src: &DirEntry,
    pending: &[u32],
) -> Result<SplitOutcome> {
    let log = ctx.log_context();
    let mut locks = LockScope::new(ctx.locks, ctx.txid());
    let range_mode = lock_for_split(&mut locks, pgid, LockMode::IX)?;

    let mut page = ctx.pool.pin_write(pgid)?;
    let leaf = LeafPage::read_write(&page)?;
    let chain_key = overflow_key(ctx, pgid, leaf.overflow)?;

    let keys = leaf
        .objects
        .iter()
        .map(|o| &o.kval[..])
        .chain(std::iter::once(pending))
        .chain(chain_key.as_deref())
        .collect::<Vec<_>>();
    let Some((dim, bit)) = select_leaf_domain(&keys, &src.n_valid_bits) else {
        return Err(Error::Unsplittable(pgid));
    };
    log::debug!("splitting index leaf {pgid} on dimension {dim} bit {bit:#010x}");

    let (kept, moved): (Vec<_>, Vec<_>) = leaf
        .objects
        .iter()
        .cloned()
        .partition(|o| o.kval[dim] & bit == 0);
    let chain_moves = matches!(&chain_key, Some(k) if k[dim] & bit != 0);

    let new_pgid = ctx.alloc.allocate_page(&log, pgid.vol, Segment::Index)?;
    let reservation = PageReservation::new(ctx.alloc, new_pgid);
    lock_for_split(&mut locks, new_pgid, range_mode)?;
    let mut new_page = ctx.pool.pin_new(new_pgid)?;

    init_leaf_page(&mut new_page, &log, leaf.iid, leaf.n_keys)?;
    if chain_moves {
        let built = LeafPage {
            objects: moved.clone(),
            ..leaf.clone()
        };
        write_image(&mut new_page, &log, &built.encode(ctx.pool.body_size()))?;
    } else if !moved.is_empty() {
        let bytes = encode_objects(&moved);
        insert_leaf_objects(&mut new_page, &log, LogMode::RedoOnly, 0, &bytes)?;
    }
    if chain_moves || !moved.is_empty() {
        let remaining = LeafPage {
            objects: kept.clone(),
            overflow: if chain_moves { None } else { leaf.overflow },
            ..leaf.clone()
        };
        write_image(&mut page, &log, &remaining.encode(ctx.pool.body_size()))?;
    }

    let (bits, prefix, dst_prefix) = split_regions(src, dim, bit);
    let theta = bits.iter().map(|b| *b as u16).sum();
    let (kept_chain, moved_chain) = match chain_key.as_deref() {
        Some(k) if chain_moves => (None, Some(k)),
        other => (other, None),
    };
    let src_entry = bounding_entry(
        kdesc,
        pgid.page,
        &bits,
        &prefix,
        theta,
        kept.iter().map(|o| &o.kval[..]).chain(kept_chain),
    );
    let dst_entry = bounding_entry(
        kdesc,
        new_pgid.page,
        &bits,
        &dst_prefix,
        theta,
        moved.iter().map(|o| &o.kval[..]).chain(moved_chain),
    );

    drop(new_page);
    drop(page);
    let new_pgid = reservation.keep();
    locks.release()?;

    Ok(SplitOutcome {
        src: src_entry,
        dst: dst_entry,
        new_page: new_pgid,
        dim,
    })
}

/// Bounds of a directory page's entries as a single entry over the whole key space.
pub(crate) fn whole_space_bounds(kdesc: &KeyDesc, spid: u32, entries: &[DirEntry]) -> DirEntry {
    let n = kdesc.n_keys();
    bounding_entry(
        kdesc,
        spid,
        &vec![0; n],
        &vec![0; n],
        entries.iter().map(|e| e.total_bits()).min().unwrap_or(0),
        entries.iter().map(|e| &e.hash[..]),
    )
}
