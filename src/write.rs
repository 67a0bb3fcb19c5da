//! The Write Engine.
//!
//! Grounded on `vector-buffers`'s `writer.rs` / `ledger.rs` pairing: a writer that may
//! have to wait for the ledger's advisory lock before it can append, then records the
//! write durably before releasing waiters. Here the "advisory lock" is the copy_lock
//! conflict a write can run into, and the "durable record" is the journal update that
//! may or may not be owed once the Store itself has completed.

use snafu::ResultExt;

use crate::bitmap::sectors_to_block_range;
use crate::error::{FvdError, IoSnafu, JournalSnafu};
use crate::header::SECTOR_SIZE;
use crate::journal::{self, Reservation, UpdatePlan};
use crate::locks::WriteLockOutcome;
use crate::rcb::{CancelToken, OpKind};
use crate::state::Engine;

impl Engine {
    /// Entry point: `write(sector_num, nb_sectors, iov)`, with no cancellation token —
    /// equivalent to `write_cancellable(..., None)`.
    pub async fn write(&mut self, sector_num: u64, nb_sectors: u64, iov: &[u8]) -> Result<(), FvdError> {
        self.write_cancellable(sector_num, nb_sectors, iov, None).await
    }

    /// `write` plus cancellation support: `cancel` is the caller-held ACB.
    /// Cancellation only takes effect while the request is parked — blocked behind a
    /// copy_lock, or queued on the journal ring's `wait_for_journal` list — since those
    /// are the only points this single-threaded cooperative engine ever suspends a write
    /// without having already committed irreversible state.
    pub async fn write_cancellable(
        &mut self,
        sector_num: u64,
        nb_sectors: u64,
        iov: &[u8],
        cancel: Option<&CancelToken>,
    ) -> Result<(), FvdError> {
        debug_assert_eq!(iov.len() as u64, nb_sectors * SECTOR_SIZE);
        let base_sectors = self.header.nb_sectors_in_base_img();
        let beyond_base = sector_num >= base_sectors;
        let prefetch_done = self.header.all_data_in_fvd_img;

        // Fast path: nothing left to copy-on-write for this range.
        if prefetch_done || beyond_base || self.base.is_none() || self.bitmap.all_stale(sector_num, nb_sectors) {
            let outcome = crate::compact::store(
                &*self.data,
                self.table.as_mut(),
                self.header.data_offset(),
                sector_num,
                nb_sectors,
                iov,
            )
            .await?;
            if outcome.update_table {
                self.journal_update(sector_num, nb_sectors, true, cancel).await?;
            }
            return Ok(());
        }

        let write_id = self.rcbs.alloc(OpKind::Write, sector_num..(sector_num + nb_sectors));

        // Conflict check against in-flight copy_locks, parking (and retrying) until the
        // range is clear of overlapping copy-on-read/prefetch activity.
        loop {
            match self.locks.acquire_write(&mut self.rcbs, write_id) {
                WriteLockOutcome::Acquired => break,
                WriteLockOutcome::ParkedOnCopy { .. } => {
                    let notify = self.rcbs.get(write_id).expect("write rcb must be live").notify.clone();
                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = notify.notified() => {}
                                _ = token.cancelled() => {
                                    self.rcbs.free(write_id);
                                    return Err(FvdError::Cancelled);
                                }
                            }
                        }
                        None => notify.notified().await,
                    }
                }
            }
        }

        let store_result = self.copy_on_write_then_store(sector_num, nb_sectors, iov).await;

        let (store_outcome, stored_range) = match store_result {
            Ok(v) => v,
            Err(err) => {
                self.locks.release_write(&mut self.rcbs, write_id);
                self.rcbs.free(write_id);
                return Err(err);
            }
        };

        // The store always lands real data in the overlay for the whole stored range, so
        // mark it fresh before deciding whether the durable (`stale`) side has fallen
        // behind enough to owe a journal write.
        self.bitmap.set_fresh(stored_range.start, stored_range.end - stored_range.start);
        let needs_metadata_update =
            store_outcome.update_table || self.bitmap.need_update(stored_range.start, stored_range.end - stored_range.start);
        if !needs_metadata_update {
            self.locks.release_write(&mut self.rcbs, write_id);
            self.rcbs.free(write_id);
            return Ok(());
        }

        // If the image is unsplit (no separate `stale` copy), the bitmap update *is*
        // the durable state, so locks can be released immediately; otherwise they are
        // held until the journal write that makes `stale` catch up completes.
        let unsplit = std::ptr::eq(self.bitmap.fresh(), self.bitmap.stale());
        if unsplit {
            self.locks.release_write(&mut self.rcbs, write_id);
        }

        let journal_result = self
            .journal_update(
                stored_range.start,
                stored_range.end - stored_range.start,
                store_outcome.update_table,
                cancel,
            )
            .await;

        if !unsplit {
            self.locks.release_write(&mut self.rcbs, write_id);
        }
        self.rcbs.free(write_id);
        journal_result
    }

    /// Determines whether the first/last block of the range needs a copy-on-write merge
    /// (a partial-block write against a block that is not yet `fresh`), performs it if
    /// so, then stores `iov`.
    async fn copy_on_write_then_store(
        &mut self,
        sector_num: u64,
        nb_sectors: u64,
        iov: &[u8],
    ) -> Result<(crate::compact::StoreOutcome, std::ops::Range<u64>), FvdError> {
        let sectors_per_block = (self.bitmap.block_size() as u64 / SECTOR_SIZE).max(1);
        let (first_block, last_block) = sectors_to_block_range(sector_num, nb_sectors, self.bitmap.block_size());
        let aligned_start = first_block * sectors_per_block;
        let aligned_end = (last_block + 1) * sectors_per_block;

        if aligned_start == sector_num && aligned_end == sector_num + nb_sectors {
            // Already block-aligned: no merge needed regardless of freshness.
            let outcome = crate::compact::store(
                &*self.data,
                self.table.as_mut(),
                self.header.data_offset(),
                sector_num,
                nb_sectors,
                iov,
            )
            .await?;
            return Ok((outcome, sector_num..(sector_num + nb_sectors)));
        }

        if self.bitmap.all_fresh(aligned_start, aligned_end - aligned_start) {
            // The surrounding blocks are already resident in the overlay; a partial
            // write there is just a partial store, no base-image merge required.
            let outcome = crate::compact::store(
                &*self.data,
                self.table.as_mut(),
                self.header.data_offset(),
                sector_num,
                nb_sectors,
                iov,
            )
            .await?;
            return Ok((outcome, sector_num..(sector_num + nb_sectors)));
        }

        // Merge: load the overlay's view of the aligned range (real data where fresh,
        // zero-fill placeholders elsewhere), then patch in base-image contents for the
        // sectors that are not yet fresh, exactly mirroring the read engine's snapshot
        // merge. No `.await` separates the snapshot from the patch, so it cannot race
        // with anything else touching this range while the write lock is held.
        let merge_len = (aligned_end - aligned_start) * SECTOR_SIZE;
        let mut merged = vec![0u8; merge_len as usize];
        crate::compact::load(
            &*self.data,
            self.table.as_ref(),
            self.header.data_offset(),
            aligned_start,
            aligned_end - aligned_start,
            &mut merged,
        )
        .await?;

        let base_sectors = self.header.nb_sectors_in_base_img();
        let merge_base_end = base_sectors.min(aligned_end);
        if merge_base_end > aligned_start {
            if let Some(base) = self.base.as_ref() {
                let base_len = ((merge_base_end - aligned_start) * SECTOR_SIZE) as usize;
                let mut base_buf = vec![0u8; base_len];
                base.read_at(aligned_start * SECTOR_SIZE, &mut base_buf)
                    .await
                    .context(IoSnafu { op: "write merge: base read" })?;
                for s in 0..(merge_base_end - aligned_start) {
                    if !self.bitmap.fresh().test_block((aligned_start + s) / sectors_per_block) {
                        let off = (s * SECTOR_SIZE) as usize;
                        merged[off..off + SECTOR_SIZE as usize]
                            .copy_from_slice(&base_buf[off..off + SECTOR_SIZE as usize]);
                    }
                }
            }
        }

        // `merged` now holds the correct pre-write image; splice the caller's payload.
        let splice_start = ((sector_num - aligned_start) * SECTOR_SIZE) as usize;
        let splice_end = splice_start + iov.len();
        merged[splice_start..splice_end].copy_from_slice(iov);

        let outcome = crate::compact::store(
            &*self.data,
            self.table.as_mut(),
            self.header.data_offset(),
            aligned_start,
            aligned_end - aligned_start,
            &merged,
        )
        .await?;
        Ok((outcome, aligned_start..aligned_end))
    }

    /// Builds and commits the journal update owed after a Store, parking on
    /// `wait_for_journal` or recycling as the ring requires.
    async fn journal_update(
        &mut self,
        sector_num: u64,
        nb_sectors: u64,
        update_table: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<(), FvdError> {
        let plan = if update_table {
            let sectors_per_chunk = self
                .table
                .as_ref()
                .map(|t| t.chunk_size() / SECTOR_SIZE)
                .unwrap_or(1);
            let first_chunk = sector_num / sectors_per_chunk;
            let last_chunk = (sector_num + nb_sectors - 1) / sectors_per_chunk;
            let table = self.table.as_ref().expect("update_table implies a compact table");
            let entries: Vec<u32> = (first_chunk..=last_chunk)
                .map(|c| table.get(c).map(|e| e.raw()).unwrap_or(crate::table::EMPTY))
                .collect();
            UpdatePlan::Mixed {
                chunk_offset: first_chunk as u32,
                entries,
                sector_num: sector_num as i64,
                nb_sectors: nb_sectors as u32,
            }
        } else {
            UpdatePlan::BitmapOnly {
                sector_num: sector_num as i64,
                nb_sectors: nb_sectors as u32,
            }
        };
        let sectors = plan.into_sectors();
        let n = sectors.len() as u64;

        let start_sector = loop {
            match self.journal.try_reserve(n).context(JournalSnafu)? {
                Reservation::Reserved { start_sector } => break start_sector,
                Reservation::NeedsRecycle => self.recycle_journal().await?,
                Reservation::Parked { woken } => match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = woken => {}
                            _ = token.cancelled() => return Err(FvdError::Cancelled),
                        }
                    }
                    None => {
                        let _ = woken.await;
                    }
                },
            }
        };

        journal::write_sectors(&*self.meta, self.journal.offset, start_sector, &sectors)
            .await
            .context(JournalSnafu)?;

        let mut table = self.table.take();
        journal::apply_update_effects(
            table.as_mut().unwrap_or(&mut crate::table::CompactTable::new(0, 1, 0, 1)),
            &mut self.bitmap,
            &sectors,
        );
        self.table = table;

        if self.journal.finish_update() {
            self.recycle_journal().await?;
        }
        Ok(())
    }
}
