//! End-to-end lifecycle scenarios, driven entirely through the public
//! `create`/`Engine` surface against `MemBlockBackend`, the way `vector-buffers` exercises
//! `disk_v2` through its `Buffer`/`Ledger` pairing rather than poking at internals.
//!
//! The bitmap-level invariants (copy-on-read advancing `fresh` but not `stale`, etc.) are
//! exercised at the unit level in `read.rs`/`write.rs`, which have `pub(crate)` access to
//! `Engine`'s fields; these scenarios only observe behavior visible through the public
//! surface, matching what an embedder actually sees.

use std::sync::Arc;

use fvd::{BlockBackend, Engine, FvdConfig, MemBlockBackend, OpenMode};

/// S1: the very first write to a freshly created compact image lands through the
/// lazy-allocation/auto-growth path rather than failing, and is durable afterward.
#[tokio::test]
async fn s1_first_write_to_empty_compact_image_allocates_and_grows() {
    let meta: Arc<dyn BlockBackend> = MemBlockBackend::shared(0);
    let config = FvdConfig::builder(8 * 1024 * 1024)
        .block_size(4096)
        .compact_image(1024 * 1024, 1024 * 1024)
        .build()
        .unwrap();

    let mut engine = fvd::create::create(meta, None, None, &config).await.unwrap();
    assert_eq!(engine.get_info().used_storage, 0);

    let data = vec![0x7Eu8; 4096];
    engine.write(0, 8, &data).await.unwrap();
    assert!(engine.get_info().used_storage > 0);

    let mut readback = vec![0u8; 4096];
    engine.read(0, 8, &mut readback).await.unwrap();
    assert_eq!(readback, data);
    engine.close().await.unwrap();
}

/// S2: copy-on-read pulls base-image contents into the overlay on a plain read, and a
/// later, unrelated write still lands correctly and survives a close/reopen cycle.
#[tokio::test]
async fn s2_copy_on_read_then_unrelated_write_both_survive_reopen() {
    let meta = MemBlockBackend::shared(0);
    let base_size = 4 * 1024 * 1024u64;
    let base: Arc<dyn BlockBackend> = MemBlockBackend::shared(base_size);
    base.write_at(0, &vec![0x5Au8; base_size as usize]).await.unwrap();

    let config = FvdConfig::builder(base_size)
        .block_size(4096)
        .base_img("base.img", "raw")
        .copy_on_read(true)
        .build()
        .unwrap();

    let meta_dyn: Arc<dyn BlockBackend> = Arc::clone(&meta) as Arc<dyn BlockBackend>;
    let mut engine = fvd::create::create(meta_dyn, None, Some(base), &config).await.unwrap();

    let mut buf = vec![0u8; 4096];
    engine.read(0, 8, &mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 0x5A));

    let written = vec![0x77u8; 4096];
    engine.write(4096, 8, &written).await.unwrap();
    engine.close().await.unwrap();

    let mut engine = Engine::open(Arc::clone(&meta) as Arc<dyn BlockBackend>, None, None, OpenMode::Boot)
        .await
        .unwrap();
    let mut readback_copy_on_read = vec![0u8; 4096];
    engine.read(0, 8, &mut readback_copy_on_read).await.unwrap();
    assert!(readback_copy_on_read.iter().all(|&b| b == 0x5A));

    let mut readback_write = vec![0u8; 4096];
    engine.read(8, 8, &mut readback_write).await.unwrap();
    assert_eq!(readback_write, written);
    engine.close().await.unwrap();
}

/// S3: a write landing on a block that is not yet fresh, against an image with
/// copy-on-read enabled, journals its bitmap update durably — the written data survives
/// a close/reopen even though nothing triggered an explicit recycle in between.
#[tokio::test]
async fn s3_write_against_stale_block_survives_close_and_reopen() {
    let meta = MemBlockBackend::shared(0);
    let base_size = 1024 * 1024u64;
    let base: Arc<dyn BlockBackend> = MemBlockBackend::shared(base_size);
    base.write_at(0, &vec![0x11u8; base_size as usize]).await.unwrap();

    let config = FvdConfig::builder(base_size)
        .block_size(4096)
        .base_img("base.img", "raw")
        .copy_on_read(true)
        .build()
        .unwrap();

    let meta_dyn: Arc<dyn BlockBackend> = Arc::clone(&meta) as Arc<dyn BlockBackend>;
    let mut engine = fvd::create::create(meta_dyn, None, Some(base), &config).await.unwrap();
    let data = vec![0x22u8; 4096];
    engine.write(0, 8, &data).await.unwrap();
    engine.close().await.unwrap();

    let mut engine = Engine::open(Arc::clone(&meta) as Arc<dyn BlockBackend>, None, None, OpenMode::Boot)
        .await
        .unwrap();
    let mut readback = vec![0u8; 4096];
    engine.read(0, 8, &mut readback).await.unwrap();
    assert_eq!(readback, data);
    engine.close().await.unwrap();
}

/// S4: two sequential overlapping writes against the same never-touched region both
/// complete and the later payload wins, exercising the write-lock acquisition path
/// without a torn interleave.
#[tokio::test]
async fn s4_sequential_overlapping_writes_apply_in_order() {
    let meta: Arc<dyn BlockBackend> = MemBlockBackend::shared(0);
    let config = FvdConfig::builder(1024 * 1024).block_size(4096).build().unwrap();
    let mut engine = fvd::create::create(meta, None, None, &config).await.unwrap();

    let first = vec![0xAAu8; 4096];
    let second = vec![0xBBu8; 4096];
    engine.write(0, 8, &first).await.unwrap();
    engine.write(0, 8, &second).await.unwrap();

    let mut readback = vec![0u8; 4096];
    engine.read(0, 8, &mut readback).await.unwrap();
    assert_eq!(readback, second, "later write must win");
    engine.close().await.unwrap();
}

/// S5: a journal update whose sector write landed, but whose owning session never ran a
/// clean `close()` (so the on-disk table/bitmap regions were never rewritten), is
/// replayed on the next open — the reopened image reads back the crashed session's write
/// even though the on-disk table region by itself still encodes the chunk as `EMPTY`.
#[tokio::test]
async fn s5_journal_recovery_replays_after_simulated_crash() {
    let meta = MemBlockBackend::shared(0);
    let meta_dyn: Arc<dyn BlockBackend> = Arc::clone(&meta) as Arc<dyn BlockBackend>;
    let config = FvdConfig::builder(1024 * 1024)
        .block_size(4096)
        .compact_image(65536, 65536)
        .build()
        .unwrap();

    let mut engine = fvd::create::create(meta_dyn, None, None, &config).await.unwrap();
    let data = vec![0x99u8; 4096];
    engine.write(0, 8, &data).await.unwrap();

    // No `close()`: the journal sector the write produced is already durable (the write
    // path flushes it), but `recycle_journal`'s bitmap/table rewrite never ran, and the
    // header's `clean_shutdown` bit was already false from `open`'s own bookkeeping. This
    // is exactly the on-disk state a crash right after the write would leave behind.
    std::mem::forget(engine);

    let mut reopened = Engine::open(Arc::clone(&meta) as Arc<dyn BlockBackend>, None, None, OpenMode::Boot)
        .await
        .unwrap();

    let mut readback = vec![0u8; 4096];
    reopened.read(0, 8, &mut readback).await.unwrap();
    assert_eq!(readback, data, "recovered image must still contain the crashed session's write");
    reopened.close().await.unwrap();
}

/// S6: the prefetcher terminates once every base-image sector has been pulled into the
/// overlay and flips `all_data_in_fvd_img`, after which reads still return correct data.
#[tokio::test]
async fn s6_prefetch_runs_to_completion_and_terminates() {
    let meta: Arc<dyn BlockBackend> = MemBlockBackend::shared(0);
    let base_size = 256 * 1024u64;
    let base: Arc<dyn BlockBackend> = MemBlockBackend::shared(base_size);
    base.write_at(0, &vec![0x33u8; base_size as usize]).await.unwrap();

    let config = FvdConfig::builder(base_size)
        .block_size(4096)
        .base_img("base.img", "raw")
        .build()
        .unwrap();

    let mut engine = fvd::create::create(meta, None, Some(base), &config).await.unwrap();
    fvd::prefetch::run_to_completion(&mut engine).await.unwrap();

    assert!(engine.get_info().all_data_in_fvd_img);
    assert!(!engine.get_info().prefetch_running);

    let mut buf = vec![0u8; 4096];
    engine.read(0, 8, &mut buf).await.unwrap();
    assert!(buf.iter().all(|&b| b == 0x33));
    engine.close().await.unwrap();
}
