//! Open/close lifecycle and the core engine state, plus the `get_info`/`truncate`/
//! `OpenMode` management surface.
//!
//! Grounded on `vector-buffers`'s `mod.rs` `Buffer::from_config_inner`: load-or-create
//! the durable state, run recovery, and hand back an assembled handle wired to the
//! shared backend. FVD's `Engine::open` follows the same shape: load the header, load
//! bitmap/table, replay the journal if the image was not cleanly shut down, then arm the
//! prefetcher.

use std::sync::Arc;

use snafu::{ensure, ResultExt};
use tracing::{info, warn};

use crate::backend::BlockBackend;
use crate::bitmap::DualBitmap;
use crate::config::FvdConfig;
use crate::error::{FormatSnafu, FvdError, IoSnafu, JournalDirtySnafu, JournalSnafu};
use crate::header::{round_up_to_page, Header, PrefetchTuning, SECTOR_SIZE};
use crate::journal::{self, JournalRing};
use crate::locks::LockTable;
use crate::prefetch::PrefetchState;
use crate::rcb::RcbSlab;
use crate::table::CompactTable;

/// Distinguishes a normal boot-time open (which refuses a dirty, unrecoverable journal)
/// from a maintenance-tool open (which tolerates it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Boot,
    Maintenance,
}

/// A point-in-time snapshot of an open image's state, for management tooling.
#[derive(Debug, Clone)]
pub struct FvdInfo {
    pub virtual_disk_size: u64,
    pub block_size: u32,
    pub compact_image: bool,
    pub used_storage: u64,
    pub data_storage: u64,
    pub copy_on_read: bool,
    pub clean_shutdown: bool,
    pub dirty: bool,
    pub all_data_in_fvd_img: bool,
    pub prefetch_running: bool,
}

/// The assembled, opened image: header plus every piece of live state the engine
/// needs — bitmap, table, journal ring, and the three conflict lists.
pub struct Engine {
    pub(crate) header: Header,
    pub(crate) meta: Arc<dyn BlockBackend>,
    pub(crate) data: Arc<dyn BlockBackend>,
    pub(crate) base: Option<Arc<dyn BlockBackend>>,
    pub(crate) bitmap: DualBitmap,
    pub(crate) table: Option<CompactTable>,
    pub(crate) journal: JournalRing,
    pub(crate) locks: LockTable,
    pub(crate) rcbs: RcbSlab,
    pub(crate) prefetch: PrefetchState,
    pub(crate) dirty: bool,
}

impl Engine {
    /// Open: load the header, load bitmap/table, recover the journal if needed, and
    /// arm the prefetch timer.
    pub async fn open(
        meta: Arc<dyn BlockBackend>,
        data: Option<Arc<dyn BlockBackend>>,
        base: Option<Arc<dyn BlockBackend>>,
        mode: OpenMode,
    ) -> Result<Self, FvdError> {
        let mut header_buf = vec![0u8; Header::ENCODED_LEN];
        meta.read_at(0, &mut header_buf).await.context(IoSnafu { op: "read header" })?;
        let header = Header::decode(&header_buf).context(FormatSnafu)?;

        let data = data.unwrap_or_else(|| Arc::clone(&meta));

        let mut bitmap_buf = vec![0u8; header.bitmap_size as usize];
        meta.read_at(header.bitmap_offset as u64, &mut bitmap_buf)
            .await
            .context(IoSnafu { op: "read bitmap" })?;
        let num_blocks = header.virtual_disk_sectors() / (header.block_size as u64 / SECTOR_SIZE).max(1);
        let split = header.copy_on_read || header.generate_prefetch_profile;
        let fresh = crate::bitmap::BlockBitmap::from_bytes(bitmap_buf.clone(), num_blocks);
        let stale = split.then(|| crate::bitmap::BlockBitmap::from_bytes(bitmap_buf, num_blocks));
        let mut bitmap = DualBitmap::from_parts(fresh, stale, header.block_size as u32, header.nb_sectors_in_base_img());

        let mut table = if header.compact_image {
            let num_chunks = header.virtual_disk_sectors() / (header.chunk_size as u64 / SECTOR_SIZE);
            let mut table_buf = vec![0u8; (num_chunks * 4) as usize];
            meta.read_at(header.table_offset as u64, &mut table_buf)
                .await
                .context(IoSnafu { op: "read table" })?;
            let data_storage = data.len().await.context(IoSnafu { op: "probe data storage" })?;
            Some(CompactTable::decode(
                &table_buf,
                header.chunk_size as u64,
                data_storage,
                header.storage_grow_unit as u64,
            ))
        } else {
            None
        };

        let journal = JournalRing::new(header.journal_offset as u64, (header.journal_size as u64) / SECTOR_SIZE);

        let mut dirty = false;
        let mut recovered = 0u64;
        if !header.clean_shutdown {
            ensure!(header.journal_size > 0, JournalDirtySnafu);
            recovered = journal::recover(
                &*meta,
                header.journal_offset as u64,
                (header.journal_size as u64) / SECTOR_SIZE,
                table.as_mut().unwrap_or(&mut CompactTable::new(0, 1, 0, 1)),
                &mut bitmap,
            )
            .await
            .context(JournalSnafu)?;
            if recovered == 0 && mode == OpenMode::Boot {
                warn!("unclean shutdown with an empty journal; proceeding with on-disk metadata as-is");
            }
            dirty = mode == OpenMode::Maintenance;
            info!(applied = recovered, "journal recovery complete");
        }

        let mut engine = Self {
            header,
            meta,
            data,
            base,
            bitmap,
            table,
            journal,
            locks: LockTable::new(),
            rcbs: RcbSlab::new(),
            prefetch: PrefetchState::new(),
            dirty,
        };
        if recovered > 0 {
            // Recovery only updated in-memory state; write it back out so the replayed
            // updates are durable before the ring is reused for new writes.
            engine.recycle_journal().await?;
        }
        engine.clear_clean_shutdown().await?;
        Ok(engine)
    }

    async fn clear_clean_shutdown(&mut self) -> Result<(), FvdError> {
        self.header.clean_shutdown = false;
        self.meta
            .write_at(0, &self.header.encode())
            .await
            .context(IoSnafu { op: "clear clean_shutdown" })?;
        self.meta.flush().await.context(IoSnafu { op: "flush header" })
    }

    /// Recycling: flush bitmap and table, clear table `DIRTY` bits, reset the journal
    /// ring, and wake every parked request.
    pub async fn recycle_journal(&mut self) -> Result<(), FvdError> {
        self.bitmap.sync_stale_to_fresh();
        self.meta
            .write_at(self.header.bitmap_offset as u64, self.bitmap.stale().as_bytes())
            .await
            .context(IoSnafu { op: "recycle: flush bitmap" })?;
        if let Some(table) = self.table.as_mut() {
            table.clear_all_dirty();
            self.meta
                .write_at(self.header.table_offset as u64, &table.encode())
                .await
                .context(IoSnafu { op: "recycle: flush table" })?;
        }
        self.meta.flush().await.context(IoSnafu { op: "recycle: flush metadata" })?;
        self.journal.reset_after_recycle();
        let waiting = self.locks.drain_journal_waiters(&mut self.rcbs);
        for id in &waiting {
            if let Some(rcb) = self.rcbs.get(*id) {
                rcb.notify.notify_one();
            }
        }
        Ok(())
    }

    /// Close: cancel the prefetcher, flush metadata, and mark `clean_shutdown` unless
    /// the image is dirty.
    pub async fn close(mut self) -> Result<(), FvdError> {
        self.prefetch.stop();
        self.recycle_journal().await?;
        if !self.dirty {
            self.header.clean_shutdown = true;
        }
        self.meta
            .write_at(0, &self.header.encode())
            .await
            .context(IoSnafu { op: "close: write header" })?;
        self.meta.flush().await.context(IoSnafu { op: "close: flush" })?;
        Ok(())
    }

    pub fn get_info(&self) -> FvdInfo {
        FvdInfo {
            virtual_disk_size: self.header.virtual_disk_size as u64,
            block_size: self.header.block_size as u32,
            compact_image: self.header.compact_image,
            used_storage: self.table.as_ref().map(CompactTable::used_storage).unwrap_or(0),
            data_storage: self.table.as_ref().map(CompactTable::data_storage).unwrap_or(0),
            copy_on_read: self.header.copy_on_read,
            clean_shutdown: self.header.clean_shutdown,
            dirty: self.dirty,
            all_data_in_fvd_img: self.header.all_data_in_fvd_img,
            prefetch_running: self.prefetch.is_running(),
        }
    }

    /// `block_status`/sparsification query.
    pub fn block_status(&self, sector_num: u64, nb_sectors: u64) -> crate::table::BlockStatus {
        match &self.table {
            None => crate::table::BlockStatus {
                allocated: true,
                run_length_chunks: nb_sectors,
            },
            Some(table) => {
                let sectors_per_chunk = table.chunk_size() / SECTOR_SIZE;
                let first_chunk = sector_num / sectors_per_chunk;
                let num_chunks = (nb_sectors + sectors_per_chunk - 1) / sectors_per_chunk;
                table.block_status(first_chunk, num_chunks)
            }
        }
    }

    /// Resizes the *virtual* disk, distinct from the internal storage growth
    /// `allocate_chunk` performs. Only growing is supported: a shrink path would also
    /// need to free now-out-of-range chunks, which is out of scope for a guest-visible
    /// resize primitive.
    pub async fn truncate(&mut self, new_virtual_disk_size: u64) -> Result<(), FvdError> {
        if new_virtual_disk_size % SECTOR_SIZE != 0 {
            return Err(FvdError::Invalid {
                reason: format!("new size {new_virtual_disk_size} is not sector-aligned"),
            });
        }
        if new_virtual_disk_size < self.header.virtual_disk_size as u64 {
            return Err(FvdError::Invalid {
                reason: "shrinking the virtual disk is not supported".to_string(),
            });
        }
        self.header.virtual_disk_size = new_virtual_disk_size as i64;
        self.header.metadata_size = round_up_to_page(self.header.metadata_size as u64) as i64;
        self.meta
            .write_at(0, &self.header.encode())
            .await
            .context(IoSnafu { op: "truncate: write header" })?;
        Ok(())
    }

    pub fn prefetch_tuning(&self) -> &PrefetchTuning {
        &self.header.prefetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBlockBackend;
    use crate::bitmap::BlockBitmap;

    fn fresh_header(virtual_disk_size: u64) -> Header {
        Header {
            all_data_in_fvd_img: true,
            virtual_disk_size: virtual_disk_size as i64,
            metadata_size: Header::ENCODED_LEN as i64 * 4,
            base_img: String::new(),
            base_img_fmt: String::new(),
            base_img_size: 0,
            bitmap_offset: Header::ENCODED_LEN as i64,
            bitmap_size: 64,
            block_size: 4096,
            copy_on_read: false,
            max_outstanding_copy_on_read_data: 0,
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
            journal_offset: 2 * Header::ENCODED_LEN as i64,
            journal_size: Header::ENCODED_LEN as i64,
            clean_shutdown: true,
            need_zero_init: false,
            generate_prefetch_profile: false,
            unit_of_prefetch_profile_entry_len: 0,
            profile_directed_prefetch_start_delay: -1,
        }
    }

    #[tokio::test]
    async fn open_close_round_trip_preserves_clean_shutdown() {
        let backend: Arc<dyn BlockBackend> = MemBlockBackend::shared(1024 * 1024);
        let header = fresh_header(256 * 4096);
        backend.write_at(0, &header.encode()).await.unwrap();
        let bitmap = BlockBitmap::new(64);
        backend
            .write_at(header.bitmap_offset as u64, bitmap.as_bytes())
            .await
            .unwrap();

        let mut engine = Engine::open(Arc::clone(&backend), None, None, OpenMode::Boot).await.unwrap();
        assert!(!engine.dirty);
        let info = engine.get_info();
        assert_eq!(info.virtual_disk_size, 256 * 4096);
        engine.close().await.unwrap();

        let mut reopened_header_buf = vec![0u8; Header::ENCODED_LEN];
        backend.read_at(0, &mut reopened_header_buf).await.unwrap();
        let reopened = Header::decode(&reopened_header_buf).unwrap();
        assert!(reopened.clean_shutdown);
    }
}
