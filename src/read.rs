//! The Read Engine.
//!
//! Grounded on `vector-buffers`'s `reader.rs` split between a fast direct path and a
//! slower path that merges a bounce buffer before the request can complete — here the
//! bounce buffer is the base-image read and the merge guide is a bitmap snapshot rather
//! than a record boundary.

use snafu::ResultExt;

use crate::bitmap::BlockBitmap;
use crate::error::{FvdError, IoSnafu};
use crate::header::SECTOR_SIZE;
use crate::locks::find_region_in_base_img;
use crate::rcb::OpKind;
use crate::state::Engine;

impl Engine {
    /// Entry point: `read(sector_num, nb_sectors, iov)`.
    pub async fn read(&mut self, sector_num: u64, nb_sectors: u64, iov: &mut [u8]) -> Result<(), FvdError> {
        debug_assert_eq!(iov.len() as u64, nb_sectors * SECTOR_SIZE);
        let base_sectors = self.header.nb_sectors_in_base_img();
        let beyond_base = sector_num >= base_sectors;
        let prefetch_done = self.header.all_data_in_fvd_img;

        // Step 1: prefetch finished, or entirely beyond the base image -> direct load.
        if prefetch_done || beyond_base || self.base.is_none() {
            return crate::compact::load(
                &*self.data,
                self.table.as_ref(),
                self.header.data_offset(),
                sector_num,
                nb_sectors,
                iov,
            )
            .await;
        }

        let request_base_end = base_sectors.min(sector_num + nb_sectors);

        if self.bitmap.all_fresh(sector_num, nb_sectors) {
            return crate::compact::load(
                &*self.data,
                self.table.as_ref(),
                self.header.data_offset(),
                sector_num,
                nb_sectors,
                iov,
            )
            .await;
        }

        // Step 4+: mixed base/overlay request. Snapshot `fresh` before any await so the
        // merge below reflects the state as of submission, not as of completion.
        let snapshot: BlockBitmap = self.bitmap.fresh().clone();
        let rcb_id = self.rcbs.alloc(OpKind::Read, sector_num..(sector_num + nb_sectors));

        let base_read_len = (request_base_end - sector_num) * SECTOR_SIZE;
        let mut base_buf = vec![0u8; base_read_len as usize];
        if base_read_len > 0 {
            let base = self.base.as_ref().expect("checked above");
            base.read_at(sector_num * SECTOR_SIZE, &mut base_buf)
                .await
                .context(IoSnafu { op: "base image read (merge)" })?;
        }

        crate::compact::load(
            &*self.data,
            self.table.as_ref(),
            self.header.data_offset(),
            sector_num,
            nb_sectors,
            iov,
        )
        .await?;

        let sectors_per_block = (self.bitmap.block_size() as u64 / SECTOR_SIZE).max(1);
        for s in 0..nb_sectors {
            let abs_sector = sector_num + s;
            if abs_sector >= request_base_end {
                break;
            }
            let block = abs_sector / sectors_per_block;
            if !snapshot.test_block(block) {
                let start = (s * SECTOR_SIZE) as usize;
                let end = start + SECTOR_SIZE as usize;
                iov[start..end].copy_from_slice(&base_buf[start..end]);
            }
        }

        // Step 6: copy-on-read phase.
        if self.header.copy_on_read {
            self.copy_on_read_phase(sector_num, request_base_end, &base_buf).await?;
        }

        self.rcbs.free(rcb_id);
        Ok(())
    }

    /// Copy-on-read phase: iterate `find_region_in_base_img` over the just-buffered
    /// base range, storing each eligible region into the overlay and advancing `fresh`
    /// (never `stale`, never on-disk — that happens at the next recycle or close).
    async fn copy_on_read_phase(&mut self, base_start: u64, base_end: u64, base_buf: &[u8]) -> Result<(), FvdError> {
        let mut cursor = base_start;
        while cursor < base_end {
            let mut region_begin = cursor;
            let mut region_end = base_end;
            if !find_region_in_base_img(&self.bitmap, &self.locks, &self.rcbs, &mut region_begin, &mut region_end) {
                break;
            }

            let copy_id = self.rcbs.alloc(OpKind::Copy, region_begin..region_end);
            self.locks.install_copy_lock(&mut self.rcbs, copy_id);

            let slice_start = ((region_begin - base_start) * SECTOR_SIZE) as usize;
            let slice_end = ((region_end - base_start) * SECTOR_SIZE) as usize;
            let store_result = crate::compact::store(
                &*self.data,
                self.table.as_mut(),
                self.header.data_offset(),
                region_begin,
                region_end - region_begin,
                &base_buf[slice_start..slice_end],
            )
            .await;

            self.locks.release_copy(&mut self.rcbs, copy_id);
            self.rcbs.free(copy_id);

            // Only on success does the region stop "needing base"; a failed copy-on-read
            // store is non-fatal to the read itself (the caller's iov is already
            // correct), so the error is swallowed here and the region is retried on the
            // next read that touches it.
            match store_result {
                Ok(_) => self.bitmap.set_fresh(region_begin, region_end - region_begin),
                Err(err) => tracing::warn!(%err, "copy-on-read store failed, will retry on next access"),
            }

            cursor = region_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::{BlockBackend, MemBlockBackend};
    use crate::bitmap::DualBitmap;
    use crate::header::{Header, PrefetchTuning, SECTOR_SIZE};
    use crate::locks::LockTable;
    use crate::prefetch::PrefetchState;
    use crate::rcb::RcbSlab;
    use crate::state::Engine;

    fn test_header(copy_on_read: bool) -> Header {
        Header {
            all_data_in_fvd_img: false,
            virtual_disk_size: 16 * SECTOR_SIZE as i64,
            metadata_size: 4096,
            base_img: "base".to_string(),
            base_img_fmt: "raw".to_string(),
            base_img_size: 16 * SECTOR_SIZE as i64,
            bitmap_offset: 4096,
            bitmap_size: 64,
            block_size: 512,
            copy_on_read,
            max_outstanding_copy_on_read_data: 1024 * 1024,
            data_file: String::new(),
            data_file_fmt: String::new(),
            prefetch: PrefetchTuning::default(),
            prefetch_profile_offset: 0,
            prefetch_profile_entries: 0,
            compact_image: false,
            table_offset: 0,
            chunk_size: 0,
            storage_grow_unit: 0,
            add_storage_cmd: String::new(),
            journal_offset: 8192,
            journal_size: 4096,
            clean_shutdown: true,
            need_zero_init: false,
            generate_prefetch_profile: false,
            unit_of_prefetch_profile_entry_len: 0,
            profile_directed_prefetch_start_delay: -1,
        }
    }

    async fn build_engine(copy_on_read: bool) -> (Engine, Arc<MemBlockBackend>) {
        let header = test_header(copy_on_read);
        let meta: Arc<dyn crate::backend::BlockBackend> = MemBlockBackend::shared(1024 * 1024);
        let base = MemBlockBackend::shared(header.base_img_size as u64);
        base.write_at(0, &vec![0x42u8; header.base_img_size as usize])
            .await
            .unwrap();
        let base_dyn: Arc<dyn crate::backend::BlockBackend> = base.clone();

        let bitmap = DualBitmap::new(16, header.block_size as u32, header.nb_sectors_in_base_img(), copy_on_read);
        let engine = Engine {
            header,
            meta: Arc::clone(&meta),
            data: Arc::clone(&meta),
            base: Some(base_dyn),
            bitmap,
            table: None,
            journal: crate::journal::JournalRing::new(8192, 8),
            locks: LockTable::new(),
            rcbs: RcbSlab::new(),
            prefetch: PrefetchState::new(),
            dirty: false,
        };
        (engine, base)
    }

    #[tokio::test]
    async fn read_entirely_in_base_returns_base_contents() {
        let (mut engine, _base) = build_engine(false).await;
        let mut buf = vec![0u8; 4 * SECTOR_SIZE as usize];
        engine.read(0, 4, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
    }

    #[tokio::test]
    async fn copy_on_read_marks_blocks_fresh_without_touching_stale() {
        let (mut engine, _base) = build_engine(true).await;
        let mut buf = vec![0u8; 4 * SECTOR_SIZE as usize];
        engine.read(0, 4, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
        assert!(engine.bitmap.all_fresh(0, 4));
        assert!(!engine.bitmap.all_stale(0, 4));
    }
}
