//! Image creation.
//!
//! Grounded on `vector-buffers`'s `ledger.rs::Ledger::load_or_create`: compute the
//! on-disk layout from a config, write out freshly initialized metadata structures,
//! flush them durably, then hand back an opened image by delegating to the same
//! [`Engine::open`] path a pre-existing image goes through.

use std::sync::Arc;

use snafu::ResultExt;

use crate::backend::BlockBackend;
use crate::bitmap::BlockBitmap;
use crate::config::FvdConfig;
use crate::error::{FormatSnafu, FvdError, IoSnafu};
use crate::header::{round_up_to_page, Header, SECTOR_SIZE};
use crate::state::{Engine, OpenMode};
use crate::table::CompactTable;

/// Creates a brand-new image per `config` on the given backends, then opens it.
///
/// `meta` holds the header/bitmap/table/journal. `data` is the data region's own
/// backend when `config.data_file` names a separate file; pass `None` to have the data
/// region share `meta`'s file, starting right after the metadata area. `base` is the
/// read-only base-image backend when `config.base_img` is set.
pub async fn create(
    meta: Arc<dyn BlockBackend>,
    data: Option<Arc<dyn BlockBackend>>,
    base: Option<Arc<dyn BlockBackend>>,
    config: &FvdConfig,
) -> Result<Engine, FvdError> {
    config.validate().map_err(|source| FvdError::Invalid { reason: source.to_string() })?;

    let sectors_per_block = (config.block_size as u64 / SECTOR_SIZE).max(1);
    let virtual_sectors = config.virtual_disk_size / SECTOR_SIZE;
    let num_blocks = (virtual_sectors + sectors_per_block - 1) / sectors_per_block;

    let bitmap_offset = round_up_to_page(Header::ENCODED_LEN as u64);
    let bitmap_bytes = (num_blocks + 7) / 8;
    let bitmap_size = round_up_to_page(bitmap_bytes.max(SECTOR_SIZE));
    let after_bitmap = bitmap_offset + bitmap_size;

    let num_chunks = if config.compact_image {
        (virtual_sectors * SECTOR_SIZE + config.chunk_size - 1) / config.chunk_size
    } else {
        0
    };
    let table_bytes = num_chunks * 4;
    let table_offset = after_bitmap;
    let after_table = if config.compact_image {
        round_up_to_page(table_offset + table_bytes.max(1))
    } else {
        after_bitmap
    };

    let journal_offset = after_table;
    let journal_size = round_up_to_page(config.journal_size.max(SECTOR_SIZE));
    let metadata_size = round_up_to_page(journal_offset + journal_size);

    let data_file_separate = config.data_file.is_some();

    // No chunk is allocated yet; `compact::store`'s growth path grows the data region
    // the first time a write actually needs a chunk. For a non-compact image the whole
    // virtual disk is addressable from the start.
    let initial_data_region_len = if config.compact_image { 0 } else { config.virtual_disk_size };

    meta.grow_to(if data_file_separate {
        metadata_size
    } else {
        metadata_size + initial_data_region_len
    })
    .await
    .context(IoSnafu { op: "create: size metadata backend" })?;
    if let Some(data) = data.as_ref() {
        data.grow_to(initial_data_region_len)
            .await
            .context(IoSnafu { op: "create: size data backend" })?;
    }

    let base_img_size = match base.as_ref() {
        Some(base) => base.len().await.context(IoSnafu { op: "create: probe base image size" })?,
        None => 0,
    };

    let mut bitmap = BlockBitmap::new(num_blocks);
    if config.detect_sparse_hole {
        if let Some(base) = base.as_ref() {
            mark_sparse_holes(&mut bitmap, &**base, base_img_size, config.block_size).await?;
        }
    }
    meta.write_at(bitmap_offset, bitmap.as_bytes())
        .await
        .context(IoSnafu { op: "create: write bitmap" })?;

    if config.compact_image {
        let table = CompactTable::new(num_chunks, config.chunk_size, initial_data_region_len, config.storage_grow_unit);
        meta.write_at(table_offset, &table.encode())
            .await
            .context(IoSnafu { op: "create: write table" })?;
    }

    let header = Header {
        all_data_in_fvd_img: base.is_none(),
        virtual_disk_size: config.virtual_disk_size as i64,
        metadata_size: metadata_size as i64,
        base_img: config.base_img.clone().unwrap_or_default(),
        base_img_fmt: config.base_img_fmt.clone(),
        base_img_size: base_img_size as i64,
        bitmap_offset: bitmap_offset as i64,
        bitmap_size: bitmap_size as i64,
        block_size: config.block_size as i32,
        copy_on_read: config.copy_on_read,
        max_outstanding_copy_on_read_data: config.max_outstanding_copy_on_read_data as i64,
        data_file: config.data_file.clone().unwrap_or_default(),
        data_file_fmt: config.data_file_fmt.clone(),
        prefetch: config.prefetch,
        prefetch_profile_offset: 0,
        prefetch_profile_entries: 0,
        compact_image: config.compact_image,
        table_offset: table_offset as i64,
        chunk_size: config.chunk_size as i64,
        storage_grow_unit: config.storage_grow_unit as i64,
        add_storage_cmd: config.add_storage_cmd.clone().unwrap_or_default(),
        journal_offset: journal_offset as i64,
        journal_size: journal_size as i64,
        clean_shutdown: true,
        need_zero_init: config.need_zero_init,
        generate_prefetch_profile: config.generate_prefetch_profile,
        unit_of_prefetch_profile_entry_len: 0,
        profile_directed_prefetch_start_delay: -1,
    };
    header.validate().context(FormatSnafu)?;

    meta.write_at(0, &header.encode()).await.context(IoSnafu { op: "create: write header" })?;
    meta.flush().await.context(IoSnafu { op: "create: flush" })?;

    Engine::open(meta, data, base, OpenMode::Boot).await
}

/// `detect_sparse_hole`'s `search_holes` optimisation, guarded on `need_zero_init`: scan
/// the base image block by block and mark every all-zero block
/// present in the overlay, so a later read never has to copy a run of zeros off the
/// base image only to reproduce what the overlay already reads as by default.
async fn mark_sparse_holes(
    bitmap: &mut BlockBitmap,
    base: &dyn BlockBackend,
    base_img_size: u64,
    block_size: u32,
) -> Result<(), FvdError> {
    let block_size = block_size as u64;
    let num_base_blocks = base_img_size / block_size;
    let mut buf = vec![0u8; block_size as usize];
    for block in 0..num_base_blocks {
        base.read_at(block * block_size, &mut buf)
            .await
            .context(IoSnafu { op: "create: scan base image for sparse holes" })?;
        if buf.iter().all(|&b| b == 0) {
            bitmap.set_range(block, block, true);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBlockBackend;

    #[tokio::test]
    async fn create_then_open_round_trips_a_plain_image() {
        let meta: Arc<dyn BlockBackend> = MemBlockBackend::shared(0);
        let config = FvdConfig::builder(64 * 4096).block_size(4096).build().unwrap();

        let mut engine = create(meta, None, None, &config).await.unwrap();
        let info = engine.get_info();
        assert_eq!(info.virtual_disk_size, 64 * 4096);
        assert!(!info.dirty);
        assert!(!info.compact_image);

        let mut buf = vec![0u8; 512];
        engine.read(0, 1, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn create_compact_image_allocates_lazily() {
        let meta: Arc<dyn BlockBackend> = MemBlockBackend::shared(0);
        let config = FvdConfig::builder(16 * 1024 * 1024)
            .block_size(4096)
            .compact_image(1024 * 1024, 1024 * 1024)
            .build()
            .unwrap();

        let mut engine = create(meta, None, None, &config).await.unwrap();
        assert_eq!(engine.get_info().used_storage, 0);

        let data = vec![0xAB; 512];
        engine.write(0, 1, &data).await.unwrap();
        assert!(engine.get_info().used_storage > 0);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn detect_sparse_hole_marks_all_zero_base_regions_present() {
        let meta: Arc<dyn BlockBackend> = MemBlockBackend::shared(0);
        let base_size = 16 * 4096u64;
        let base: Arc<dyn BlockBackend> = MemBlockBackend::shared(base_size);
        // Fill the first block with non-zero content; leave the rest zero.
        base.write_at(0, &[0x11u8; 4096]).await.unwrap();

        let config = FvdConfig::builder(base_size)
            .block_size(4096)
            .base_img("base.img", "raw")
            .need_zero_init(true)
            .detect_sparse_hole(true)
            .build()
            .unwrap();

        let mut engine = create(meta, None, Some(base), &config).await.unwrap();
        // Block 0 is non-zero in the base, so it must still be read from there.
        let mut buf = vec![0u8; 4096];
        engine.read(0, 8, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0x11));
        // A later, all-zero block was pre-marked present, so no copy-on-read is needed
        // even though copy_on_read defaults to false here.
        assert!(engine.bitmap.fresh().test_block(1));
        engine.close().await.unwrap();
    }
}
