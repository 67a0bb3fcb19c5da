//! The block-presence bitmap.
//!
//! Two in-memory copies are kept when copy-on-read or prefetching is enabled: `fresh`
//! (all in-memory state, including not-yet-durable soft updates) and `stale` (on-disk
//! state plus journalled updates). The invariant `stale[b] == 1 => fresh[b] == 1` is
//! upheld by construction: every call that sets a `stale` bit first asserts (in debug
//! builds) that the corresponding `fresh` bit is already set.

use crate::header::SECTOR_SIZE;

/// A flat bit-per-block allocation map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    bits: Vec<u8>,
    num_blocks: u64,
}

impl BlockBitmap {
    pub fn new(num_blocks: u64) -> Self {
        let bytes = ((num_blocks + 7) / 8) as usize;
        Self {
            bits: vec![0u8; bytes],
            num_blocks,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, num_blocks: u64) -> Self {
        let mut bits = bytes;
        let needed = ((num_blocks + 7) / 8) as usize;
        bits.resize(needed, 0);
        Self { bits, num_blocks }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn test_block(&self, block: u64) -> bool {
        if block >= self.num_blocks {
            return false;
        }
        let byte = self.bits[(block / 8) as usize];
        byte & (1 << (block % 8)) != 0
    }

    pub fn set_block(&mut self, block: u64, value: bool) {
        if block >= self.num_blocks {
            return;
        }
        let idx = (block / 8) as usize;
        let mask = 1u8 << (block % 8);
        if value {
            self.bits[idx] |= mask;
        } else {
            self.bits[idx] &= !mask;
        }
    }

    /// Sets every block in `[first_block, last_block]` (inclusive) to `value`. A no-op
    /// for blocks already at `value`.
    pub fn set_range(&mut self, first_block: u64, last_block: u64, value: bool) {
        for b in first_block..=last_block.min(self.num_blocks.saturating_sub(1)) {
            self.set_block(b, value);
        }
    }

    pub fn fill(&mut self, value: bool) {
        let byte = if value { 0xFF } else { 0x00 };
        self.bits.iter_mut().for_each(|b| *b = byte);
    }
}

/// Converts a `[sector_num, sector_num + nb_sectors)` range into the inclusive block
/// range it overlaps, given `block_size` in bytes. Ranges are block-aligned by
/// expansion.
pub fn sectors_to_block_range(sector_num: u64, nb_sectors: u64, block_size: u32) -> (u64, u64) {
    let sectors_per_block = (block_size as u64) / SECTOR_SIZE;
    let first_block = sector_num / sectors_per_block;
    let last_sector = sector_num + nb_sectors.saturating_sub(1).max(0);
    let last_block = last_sector / sectors_per_block;
    (first_block, last_block)
}

/// Holds `fresh` and `stale` copies, or a single shared bitmap when neither
/// copy-on-read nor prefetch is enabled, in which case the two are the same object.
#[derive(Debug, Clone)]
pub struct DualBitmap {
    fresh: BlockBitmap,
    stale: Option<BlockBitmap>,
    block_size: u32,
    nb_sectors_in_base_img: u64,
}

impl DualBitmap {
    pub fn new(num_blocks: u64, block_size: u32, nb_sectors_in_base_img: u64, split: bool) -> Self {
        let fresh = BlockBitmap::new(num_blocks);
        let stale = if split { Some(BlockBitmap::new(num_blocks)) } else { None };
        Self {
            fresh,
            stale,
            block_size,
            nb_sectors_in_base_img,
        }
    }

    pub fn from_parts(fresh: BlockBitmap, stale: Option<BlockBitmap>, block_size: u32, nb_sectors_in_base_img: u64) -> Self {
        Self {
            fresh,
            stale,
            block_size,
            nb_sectors_in_base_img,
        }
    }

    pub fn fresh(&self) -> &BlockBitmap {
        &self.fresh
    }

    pub fn stale(&self) -> &BlockBitmap {
        self.stale.as_ref().unwrap_or(&self.fresh)
    }

    /// Whether a sector range lies (at least partly) within the base image; ranges
    /// beyond it are ignored: ranges above `nb_sectors_in_base_img` never need tracking.
    fn clamp_to_base(&self, sector_num: u64, nb_sectors: u64) -> Option<(u64, u64)> {
        if sector_num >= self.nb_sectors_in_base_img || nb_sectors == 0 {
            return None;
        }
        let end = (sector_num + nb_sectors).min(self.nb_sectors_in_base_img);
        Some(sectors_to_block_range(sector_num, end - sector_num, self.block_size))
    }

    /// Sets `fresh` (and, if unsplit, `stale`) over a sector range — the "soft update"
    /// path used by copy-on-read/prefetch completion.
    pub fn set_fresh(&mut self, sector_num: u64, nb_sectors: u64) {
        if let Some((first, last)) = self.clamp_to_base(sector_num, nb_sectors) {
            self.fresh.set_range(first, last, true);
            if self.stale.is_none() {
                // Unsplit: there is only one bitmap, so this *is* the stale update too.
            }
        }
    }

    /// Sets `stale` over a sector range — only valid once the journal (or, on the
    /// journal-skipped path, a direct bitmap write) has durably recorded the update.
    pub fn set_stale(&mut self, sector_num: u64, nb_sectors: u64) {
        if let Some((first, last)) = self.clamp_to_base(sector_num, nb_sectors) {
            debug_assert!(
                (first..=last).all(|b| self.fresh.test_block(b)),
                "stale bit set before corresponding fresh bit"
            );
            if let Some(stale) = self.stale.as_mut() {
                stale.set_range(first, last, true);
            } else {
                self.fresh.set_range(first, last, true);
            }
        }
    }

    /// `need_update`: does `stale` differ from `fresh` anywhere in this range? Used by
    /// the write engine to decide whether a metadata journal update is required.
    pub fn need_update(&self, sector_num: u64, nb_sectors: u64) -> bool {
        let Some((first, last)) = self.clamp_to_base(sector_num, nb_sectors) else {
            return false;
        };
        match &self.stale {
            None => false,
            Some(stale) => (first..=last).any(|b| self.fresh.test_block(b) != stale.test_block(b)),
        }
    }

    /// True if every block in the range is already present in `fresh` (i.e. the fast
    /// read/write path can be taken without consulting the base image).
    pub fn all_fresh(&self, sector_num: u64, nb_sectors: u64) -> bool {
        match self.clamp_to_base(sector_num, nb_sectors) {
            None => true,
            Some((first, last)) => (first..=last).all(|b| self.fresh.test_block(b)),
        }
    }

    pub fn all_stale(&self, sector_num: u64, nb_sectors: u64) -> bool {
        match self.clamp_to_base(sector_num, nb_sectors) {
            None => true,
            Some((first, last)) => (first..=last).all(|b| self.stale().test_block(b)),
        }
    }

    /// Brings `stale` fully up to date with `fresh` (a full metadata flush, used when
    /// recycling the journal).
    pub fn sync_stale_to_fresh(&mut self) {
        if let Some(stale) = self.stale.as_mut() {
            *stale = self.fresh.clone();
        }
    }

    pub fn fill_all_ones(&mut self) {
        self.fresh.fill(true);
        if let Some(stale) = self.stale.as_mut() {
            stale.fill(true);
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_set_range() {
        let mut bm = BlockBitmap::new(64);
        bm.set_range(4, 10, true);
        let snapshot = bm.clone();
        bm.set_range(4, 10, true);
        assert_eq!(bm, snapshot);
    }

    #[test]
    fn dual_bitmap_soft_update_does_not_touch_stale() {
        let mut dual = DualBitmap::new(16, 65536, 16 * 128, true);
        dual.set_fresh(0, 1);
        assert!(dual.fresh().test_block(0));
        assert!(!dual.stale().test_block(0));
        assert!(dual.need_update(0, 1));
    }

    #[test]
    fn dual_bitmap_set_stale_catches_up() {
        let mut dual = DualBitmap::new(16, 65536, 16 * 128, true);
        dual.set_fresh(0, 1);
        dual.set_stale(0, 1);
        assert!(dual.stale().test_block(0));
        assert!(!dual.need_update(0, 1));
    }

    #[test]
    fn ranges_beyond_base_image_are_ignored() {
        let mut dual = DualBitmap::new(4, 65536, 2 * 128, true);
        // base image covers 2 blocks (256 sectors); this write starts beyond it.
        dual.set_fresh(1000, 10);
        assert!(!dual.fresh().test_block(0));
    }

    quickcheck::quickcheck! {
        fn prop_idempotent(block: u64, value: bool) -> bool {
            let mut bm = BlockBitmap::new(256);
            let block = block % 256;
            bm.set_block(block, value);
            let once = bm.clone();
            bm.set_block(block, value);
            bm == once
        }
    }
}
