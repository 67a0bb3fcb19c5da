//! The three conflict lists and region search.
//!
//! `write_locks`, `copy_locks`, and `wait_for_journal` are small intrusive doubly-linked
//! lists keyed by index into the [`crate::rcb::RcbSlab`]. This
//! mirrors the cooperative, single-owner waiter bookkeeping `vector-buffers`'s
//! `ledger.rs` uses for its writer/reader wait queues, generalized from one queue to
//! three and from FIFO wake to an overlap scan.

use std::ops::Range;

use crate::bitmap::DualBitmap;
use crate::header::SECTOR_SIZE;
use crate::rcb::{ListMembership, RcbId, RcbSlab};

fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

fn wake_all(slab: &RcbSlab, ids: &[RcbId]) {
    for &id in ids {
        if let Some(rcb) = slab.get(id) {
            rcb.notify.notify_one();
        }
    }
}

/// An intrusive doubly-linked list of RCBs, threaded through [`Rcb::prev`]/[`Rcb::next`].
#[derive(Debug, Default)]
struct IntrusiveList {
    head: Option<RcbId>,
    tail: Option<RcbId>,
}

impl IntrusiveList {
    fn push_back(&mut self, slab: &mut RcbSlab, id: RcbId, membership: ListMembership) {
        if let Some(tail) = self.tail {
            slab.get_mut(tail).expect("tail must be live").next = Some(id);
        } else {
            self.head = Some(id);
        }
        let rcb = slab.get_mut(id).expect("rcb must be live");
        rcb.prev = self.tail;
        rcb.next = None;
        rcb.membership = membership;
        self.tail = Some(id);
    }

    fn remove(&mut self, slab: &mut RcbSlab, id: RcbId) {
        let (prev, next) = match slab.get(id) {
            Some(rcb) => (rcb.prev, rcb.next),
            None => return,
        };
        match prev {
            Some(p) => slab.get_mut(p).expect("prev must be live").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => slab.get_mut(n).expect("next must be live").prev = prev,
            None => self.tail = prev,
        }
        if let Some(rcb) = slab.get_mut(id) {
            rcb.prev = None;
            rcb.next = None;
            rcb.membership = ListMembership::None;
        }
    }

    fn iter<'a>(&self, slab: &'a RcbSlab) -> IntrusiveListIter<'a> {
        IntrusiveListIter { slab, cursor: self.head }
    }
}

struct IntrusiveListIter<'a> {
    slab: &'a RcbSlab,
    cursor: Option<RcbId>,
}

impl Iterator for IntrusiveListIter<'_> {
    type Item = RcbId;
    fn next(&mut self) -> Option<RcbId> {
        let id = self.cursor?;
        self.cursor = self.slab.get(id).and_then(|rcb| rcb.next);
        Some(id)
    }
}

/// The three conflict lists.
#[derive(Debug, Default)]
pub struct LockTable {
    write_locks: IntrusiveList,
    copy_locks: IntrusiveList,
    wait_for_journal: IntrusiveList,
}

/// Outcome of trying to acquire a write lock for a new request.
pub enum WriteLockOutcome {
    /// No conflict: the RCB has been linked into `write_locks` and may proceed.
    Acquired,
    /// Overlaps an in-flight copy; `blocking` now has this RCB recorded as a dependent
    /// and will restart it once the copy completes.
    ParkedOnCopy { blocking: RcbId },
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conflict rule at new-write arrival: scan `copy_locks` for any overlap; if found,
    /// park on that copy-lock's dependent list.
    pub fn acquire_write(&mut self, slab: &mut RcbSlab, id: RcbId) -> WriteLockOutcome {
        let range = slab.get(id).expect("rcb must be live").range.clone();
        if let Some(blocking) = self
            .copy_locks
            .iter(slab)
            .find(|&other| overlaps(&range, &slab.get(other).unwrap().range))
        {
            slab.get_mut(blocking).unwrap().dependents.push(id);
            return WriteLockOutcome::ParkedOnCopy { blocking };
        }
        self.write_locks.push_back(slab, id, ListMembership::WriteLocks);
        WriteLockOutcome::Acquired
    }

    /// Declines (by reporting conflict) any copy-on-read attempt overlapping an
    /// in-flight write, the symmetric rule to `acquire_write`.
    pub fn write_lock_conflicts(&self, slab: &RcbSlab, range: &Range<u64>) -> bool {
        self.write_locks
            .iter(slab)
            .any(|other| overlaps(range, &slab.get(other).unwrap().range))
    }

    pub fn copy_lock_conflicts(&self, slab: &RcbSlab, range: &Range<u64>) -> Option<RcbId> {
        self.copy_locks
            .iter(slab)
            .find(|&other| overlaps(range, &slab.get(other).unwrap().range))
    }

    pub fn install_copy_lock(&mut self, slab: &mut RcbSlab, id: RcbId) {
        self.copy_locks.push_back(slab, id, ListMembership::CopyLocks);
    }

    /// Releases the write lock and wakes every dependent parked on it.
    pub fn release_write(&mut self, slab: &mut RcbSlab, id: RcbId) -> Vec<RcbId> {
        self.write_locks.remove(slab, id);
        let dependents = std::mem::take(&mut slab.get_mut(id).expect("rcb must be live").dependents);
        wake_all(slab, &dependents);
        dependents
    }

    /// Releases the copy lock and wakes every dependent parked on it.
    pub fn release_copy(&mut self, slab: &mut RcbSlab, id: RcbId) -> Vec<RcbId> {
        self.copy_locks.remove(slab, id);
        let dependents = std::mem::take(&mut slab.get_mut(id).expect("rcb must be live").dependents);
        wake_all(slab, &dependents);
        dependents
    }

    pub fn park_on_journal(&mut self, slab: &mut RcbSlab, id: RcbId) {
        self.wait_for_journal.push_back(slab, id, ListMembership::WaitForJournal);
    }

    /// Drains `wait_for_journal` in FIFO-of-head order, at recycle time.
    pub fn drain_journal_waiters(&mut self, slab: &mut RcbSlab) -> Vec<RcbId> {
        let mut drained = Vec::new();
        while let Some(id) = self.wait_for_journal.head {
            self.wait_for_journal.remove(slab, id);
            drained.push(id);
        }
        drained
    }

    #[cfg(test)]
    fn write_locks_len(&self, slab: &RcbSlab) -> usize {
        self.write_locks.iter(slab).count()
    }
}

/// `find_region_in_base_img`: the largest sub-range of `[begin, end)`
/// (expressed in sectors, like every other RCB range) that (a) still needs the base
/// image in `fresh`, (b) lies inside the base image, (c) is block-aligned, and (d) does
/// not overlap any lock in `locks`. Mutates `begin` and `end` in place and returns
/// `false` if nothing eligible remains.
pub fn find_region_in_base_img(
    bitmap: &DualBitmap,
    locks: &LockTable,
    slab: &RcbSlab,
    begin: &mut u64,
    end: &mut u64,
) -> bool {
    let sectors_per_block = (bitmap.block_size() as u64 / SECTOR_SIZE).max(1);
    let mut cursor = *begin;
    let search_end = *end;

    while cursor < search_end {
        let block = cursor / sectors_per_block;
        if bitmap.fresh().test_block(block) {
            cursor += sectors_per_block;
            continue;
        }
        // Found a block needing the base image; extend the run while still eligible.
        let region_start = cursor;
        let mut region_end = cursor + sectors_per_block;
        while region_end < search_end {
            let next_block = region_end / sectors_per_block;
            if !bitmap.fresh().test_block(next_block) {
                region_end += sectors_per_block;
            } else {
                break;
            }
        }
        let region_end = region_end.min(search_end);
        let candidate = region_start..region_end;
        if locks.copy_lock_conflicts(slab, &candidate).is_none()
            && !locks.write_lock_conflicts(slab, &candidate)
        {
            *begin = region_start;
            *end = region_end;
            return true;
        }
        cursor = region_end;
    }
    false
}
