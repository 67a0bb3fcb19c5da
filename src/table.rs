//! The compact chunk-allocation table.
//!
//! Entry packing follows the same fixed-width framing idiom as [`crate::header`]; the
//! allocation counter (`used_storage`) follows the monotonic-counter style of
//! `vector-buffers`'s `ledger.rs` (`writer_next_record`, there an `AtomicU64`) — here a
//! plain `u64` since the engine is single-threaded and cooperative.

use snafu::Snafu;

pub const EMPTY: u32 = 0xFFFF_FFFF;
const DIRTY_BIT: u32 = 0x8000_0000;
const PHYS_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Snafu)]
pub enum TableError {
    #[snafu(display("compact storage exhausted: need {needed} bytes, have {available} bytes"))]
    StorageExhausted { needed: u64, available: u64 },

    #[snafu(display("virtual chunk {chunk} out of range (table has {len} entries)"))]
    ChunkOutOfRange { chunk: u64, len: u64 },
}

/// One entry: either [`EMPTY`], or a physical chunk index with an optional dirty bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry(u32);

impl TableEntry {
    pub const fn empty() -> Self {
        Self(EMPTY)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == EMPTY
    }

    pub fn is_dirty(&self) -> bool {
        self.0 != EMPTY && self.0 & DIRTY_BIT != 0
    }

    pub fn physical_chunk(&self) -> Option<u32> {
        if self.0 == EMPTY {
            None
        } else {
            Some(self.0 & PHYS_MASK)
        }
    }

    pub fn mapped(physical_chunk: u32, dirty: bool) -> Self {
        let mut raw = physical_chunk & PHYS_MASK;
        if dirty {
            raw |= DIRTY_BIT;
        }
        Self(raw)
    }

    pub fn with_dirty(self, dirty: bool) -> Self {
        match self.physical_chunk() {
            None => self,
            Some(phys) => Self::mapped(phys, dirty),
        }
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Contiguous-allocation status reported by [`CompactTable::block_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    pub allocated: bool,
    pub run_length_chunks: u64,
}

/// The virtual-chunk -> physical-chunk mapping array, plus the storage allocator.
#[derive(Debug, Clone)]
pub struct CompactTable {
    entries: Vec<TableEntry>,
    chunk_size: u64,
    used_storage: u64,
    data_storage: u64,
    storage_grow_unit: u64,
}

impl CompactTable {
    pub fn new(num_chunks: u64, chunk_size: u64, data_storage: u64, storage_grow_unit: u64) -> Self {
        Self {
            entries: vec![TableEntry::empty(); num_chunks as usize],
            chunk_size,
            used_storage: 0,
            data_storage,
            storage_grow_unit,
        }
    }

    pub fn from_entries(entries: Vec<TableEntry>, chunk_size: u64, data_storage: u64, storage_grow_unit: u64) -> Self {
        let used_storage = entries
            .iter()
            .filter_map(TableEntry::physical_chunk)
            .map(|c| c as u64 + 1)
            .max()
            .unwrap_or(0)
            * chunk_size;
        Self {
            entries,
            chunk_size,
            used_storage,
            data_storage,
            storage_grow_unit,
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn used_storage(&self) -> u64 {
        self.used_storage
    }

    pub fn data_storage(&self) -> u64 {
        self.data_storage
    }

    pub fn get(&self, chunk: u64) -> Result<TableEntry, TableError> {
        self.entries
            .get(chunk as usize)
            .copied()
            .ok_or(TableError::ChunkOutOfRange { chunk, len: self.len() })
    }

    pub fn set(&mut self, chunk: u64, entry: TableEntry) {
        if let Some(slot) = self.entries.get_mut(chunk as usize) {
            *slot = entry;
        }
    }

    pub fn clear_dirty(&mut self, chunk: u64) {
        if let Some(slot) = self.entries.get_mut(chunk as usize) {
            *slot = slot.with_dirty(false);
        }
    }

    pub fn as_raw_entries(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(TableEntry::raw)
    }

    /// Encodes every entry as little-endian `u32`s, the on-disk table layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 4);
        for e in &self.entries {
            buf.extend_from_slice(&e.raw().to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8], chunk_size: u64, data_storage: u64, storage_grow_unit: u64) -> Self {
        let entries = buf
            .chunks_exact(4)
            .map(|c| TableEntry::from_raw(u32::from_le_bytes(c.try_into().unwrap())))
            .collect();
        Self::from_entries(entries, chunk_size, data_storage, storage_grow_unit)
    }

    /// Clears `DIRTY` on every entry, ahead of a journal recycle.
    pub fn clear_all_dirty(&mut self) {
        for slot in &mut self.entries {
            *slot = slot.with_dirty(false);
        }
    }

    /// `allocate_chunk`: returns `used_storage / chunk_size`, bumps `used_storage`, and
    /// grows `data_storage` (by truncating up by `storage_grow_unit`) if needed. The
    /// external-growth-command path is represented by
    /// [`GrowthOutcome::NeedsExternalCommand`]; callers that have configured an
    /// `add_storage_cmd` should run it and call [`CompactTable::record_growth`] with the
    /// new probed length before retrying.
    pub fn allocate_chunk(&mut self) -> Result<u64, GrowthRequired> {
        let candidate = self.used_storage / self.chunk_size;
        let needed = self.used_storage + self.chunk_size;
        if needed > self.data_storage {
            return Err(GrowthRequired {
                needed,
                available: self.data_storage,
                grow_by: self.storage_grow_unit,
            });
        }
        self.used_storage = needed;
        Ok(candidate)
    }

    /// Call after successfully growing the backing data file (either via the external
    /// command or by truncating it up), with the newly probed file length.
    pub fn record_growth(&mut self, new_data_storage: u64) {
        self.data_storage = new_data_storage;
    }

    /// `get_block_status`: the largest prefix of `[sector_num, sector_num + nb_sectors)`
    /// with uniform empty/non-empty status, tie-breaking by the first chunk.
    pub fn block_status(&self, first_chunk: u64, num_chunks: u64) -> BlockStatus {
        if num_chunks == 0 || first_chunk >= self.len() {
            return BlockStatus {
                allocated: false,
                run_length_chunks: 0,
            };
        }
        let last = (first_chunk + num_chunks).min(self.len());
        let first_empty = self.entries[first_chunk as usize].is_empty();
        let mut run = 0u64;
        for c in first_chunk..last {
            if self.entries[c as usize].is_empty() == first_empty {
                run += 1;
            } else {
                break;
            }
        }
        BlockStatus {
            allocated: !first_empty,
            run_length_chunks: run,
        }
    }
}

/// Returned by [`CompactTable::allocate_chunk`] when growth is required before the
/// allocation can proceed.
#[derive(Debug, Clone, Copy)]
pub struct GrowthRequired {
    pub needed: u64,
    pub available: u64,
    pub grow_by: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_chunk_is_monotonic() {
        let mut table = CompactTable::new(4, 1024 * 1024, 4 * 1024 * 1024, 1024 * 1024);
        let c0 = table.allocate_chunk().unwrap();
        let c1 = table.allocate_chunk().unwrap();
        assert_eq!(c0, 0);
        assert_eq!(c1, 1);
        assert_eq!(table.used_storage(), 2 * 1024 * 1024);
    }

    #[test]
    fn allocate_chunk_reports_growth_required() {
        let mut table = CompactTable::new(4, 1024 * 1024, 1024 * 1024, 1024 * 1024);
        table.allocate_chunk().unwrap();
        let err = table.allocate_chunk().unwrap_err();
        assert_eq!(err.needed, 2 * 1024 * 1024);
        assert_eq!(err.available, 1024 * 1024);

        table.record_growth(2 * 1024 * 1024);
        let c1 = table.allocate_chunk().unwrap();
        assert_eq!(c1, 1);
    }

    #[test]
    fn distinct_virtual_chunks_map_to_distinct_physical_chunks() {
        // Ownership invariant: never assign the same physical index twice.
        let mut table = CompactTable::new(8, 1024, 8192, 1024);
        let mut seen = std::collections::HashSet::new();
        for v in 0..8u64 {
            let phys = table.allocate_chunk().unwrap();
            table.set(v, TableEntry::mapped(phys as u32, true));
            assert!(seen.insert(phys));
        }
    }

    #[test]
    fn block_status_finds_largest_uniform_prefix() {
        let mut table = CompactTable::new(4, 1024, 4096, 1024);
        table.set(0, TableEntry::mapped(0, false));
        table.set(1, TableEntry::mapped(1, false));
        // chunk 2, 3 stay EMPTY
        let status = table.block_status(0, 4);
        assert!(status.allocated);
        assert_eq!(status.run_length_chunks, 2);

        let status = table.block_status(2, 2);
        assert!(!status.allocated);
        assert_eq!(status.run_length_chunks, 2);
    }

    quickcheck::quickcheck! {
        fn prop_no_duplicate_physical_chunks(n: u8) -> bool {
            let n = (n % 32) as u64 + 1;
            let mut table = CompactTable::new(n, 512, n * 512, 512);
            let mut seen = std::collections::HashSet::new();
            for v in 0..n {
                match table.allocate_chunk() {
                    Ok(phys) => {
                        table.set(v, TableEntry::mapped(phys as u32, false));
                        if !seen.insert(phys) {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
            true
        }
    }
}
