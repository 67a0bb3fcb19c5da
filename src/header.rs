//! On-disk header and its codec.
//!
//! The header is a single fixed-layout, little-endian record at offset 0 of the
//! metadata file, rounded up to a 4 KiB page. Encoding/decoding is hand-written
//! `to_le_bytes`/`from_le_bytes` framing rather than a zero-copy archive format, because
//! the byte layout here is externally specified and must match exactly — unlike
//! `vector-buffers`'s `ledger.rs`, which owns its own on-disk layout and so can use
//! `rkyv`.

use snafu::Snafu;

pub const PAGE_SIZE: u64 = 4096;
pub const SECTOR_SIZE: u64 = 512;
pub const HEADER_MAGIC: u32 = 0xA9F5_4351;
pub const HEADER_VERSION: u32 = 1;

const PATH_FIELD_LEN: usize = 1024;
const FMT_FIELD_LEN: usize = 16;
const ADD_STORAGE_CMD_LEN: usize = 2048;

/// Errors raised while validating or decoding a header.
#[derive(Debug, Snafu)]
pub enum HeaderError {
    #[snafu(display("bad magic: expected {:#010x}, found {:#010x}", HEADER_MAGIC, found))]
    BadMagic { found: u32 },

    #[snafu(display("unsupported version: {found} (supported: {HEADER_VERSION})"))]
    BadVersion { found: u32 },

    #[snafu(display("virtual_disk_size {size} is not a multiple of the sector size ({SECTOR_SIZE})"))]
    MisalignedVirtualSize { size: i64 },

    #[snafu(display("header buffer too short: need at least {need} bytes, got {got}"))]
    Truncated { need: usize, got: usize },

    #[snafu(display("embedded path is not valid UTF-8"))]
    InvalidPath,
}

/// Prefetcher tuning parameters embedded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchTuning {
    /// Seconds to wait after open before starting the background prefetcher. Negative
    /// disables prefetch entirely.
    pub start_delay_secs: i32,
    pub num_slots: i32,
    pub bytes_per_prefetch: i32,
    pub read_throughput_measure_time_ms: i32,
    pub write_throughput_measure_time_ms: i32,
    /// Exponential-smoothing factor, 0..100.
    pub perf_calc_alpha: i32,
    pub min_read_throughput_kbps: i32,
    pub min_write_throughput_kbps: i32,
    pub max_read_throughput_kbps: i32,
    pub max_write_throughput_kbps: i32,
    pub throttle_time_ms: i32,
}

impl Default for PrefetchTuning {
    fn default() -> Self {
        Self {
            start_delay_secs: 5,
            num_slots: 4,
            bytes_per_prefetch: 1024 * 1024,
            read_throughput_measure_time_ms: 200,
            write_throughput_measure_time_ms: 200,
            perf_calc_alpha: 80,
            min_read_throughput_kbps: 2048,
            min_write_throughput_kbps: 2048,
            max_read_throughput_kbps: 0,
            max_write_throughput_kbps: 0,
            throttle_time_ms: 2000,
        }
    }
}

/// The fixed-layout on-disk header.
///
/// # Warning
///
/// Field order and width define the on-disk layout. Do not reorder, resize, or remove
/// fields without bumping [`HEADER_VERSION`] and adding an explicit migration path.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub all_data_in_fvd_img: bool,
    pub virtual_disk_size: i64,
    pub metadata_size: i64,

    pub base_img: String,
    pub base_img_fmt: String,
    pub base_img_size: i64,

    pub bitmap_offset: i64,
    pub bitmap_size: i64,
    pub block_size: i32,

    pub copy_on_read: bool,
    pub max_outstanding_copy_on_read_data: i64,

    pub data_file: String,
    pub data_file_fmt: String,

    pub prefetch: PrefetchTuning,
    pub prefetch_profile_offset: i64,
    pub prefetch_profile_entries: i64,

    pub compact_image: bool,
    pub table_offset: i64,
    pub chunk_size: i64,
    pub storage_grow_unit: i64,
    pub add_storage_cmd: String,

    pub journal_offset: i64,
    pub journal_size: i64,

    pub clean_shutdown: bool,
    pub need_zero_init: bool,
    pub generate_prefetch_profile: bool,
    pub unit_of_prefetch_profile_entry_len: i32,
    pub profile_directed_prefetch_start_delay: i32,
}

impl Header {
    /// Number of bytes the encoded header occupies on disk: 4 KiB, fixed.
    pub const ENCODED_LEN: usize = PAGE_SIZE as usize;

    pub fn data_offset(&self) -> u64 {
        if self.data_file.is_empty() {
            self.metadata_size as u64
        } else {
            0
        }
    }

    pub fn nb_sectors_in_base_img(&self) -> u64 {
        if self.base_img.is_empty() {
            0
        } else {
            (self.base_img_size as u64) / SECTOR_SIZE
        }
    }

    pub fn virtual_disk_sectors(&self) -> u64 {
        self.virtual_disk_size as u64 / SECTOR_SIZE
    }

    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.virtual_disk_size % SECTOR_SIZE as i64 != 0 {
            return MisalignedVirtualSizeSnafu {
                size: self.virtual_disk_size,
            }
            .fail();
        }
        Ok(())
    }

    /// Encodes the header into a freshly allocated, page-aligned buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        let mut w = Writer { buf: &mut buf, at: 0 };

        w.put_u32(HEADER_MAGIC);
        w.put_u32(HEADER_VERSION);
        w.put_i32(self.all_data_in_fvd_img as i32);
        w.put_i64(self.virtual_disk_size);
        w.put_i64(self.metadata_size);
        w.put_str(&self.base_img, PATH_FIELD_LEN);
        w.put_str(&self.base_img_fmt, FMT_FIELD_LEN);
        w.put_i64(self.base_img_size);
        w.put_i64(self.bitmap_offset);
        w.put_i64(self.bitmap_size);
        w.put_i32(self.block_size);
        w.put_i32(self.copy_on_read as i32);
        w.put_i64(self.max_outstanding_copy_on_read_data);
        w.put_str(&self.data_file, PATH_FIELD_LEN);
        w.put_str(&self.data_file_fmt, FMT_FIELD_LEN);
        w.put_i32(self.prefetch.start_delay_secs);
        w.put_i64(self.prefetch_profile_offset);
        w.put_i64(self.prefetch_profile_entries);
        w.put_i32(self.prefetch.num_slots);
        w.put_i32(self.prefetch.bytes_per_prefetch);
        w.put_i32(self.prefetch.read_throughput_measure_time_ms);
        w.put_i32(self.prefetch.write_throughput_measure_time_ms);
        w.put_i32(self.prefetch.perf_calc_alpha);
        w.put_i32(self.prefetch.min_read_throughput_kbps);
        w.put_i32(self.prefetch.min_write_throughput_kbps);
        w.put_i32(self.prefetch.max_read_throughput_kbps);
        w.put_i32(self.prefetch.max_write_throughput_kbps);
        w.put_i32(self.prefetch.throttle_time_ms);
        w.put_i32(self.compact_image as i32);
        w.put_i64(self.table_offset);
        w.put_i64(self.chunk_size);
        w.put_i64(self.storage_grow_unit);
        w.put_str(&self.add_storage_cmd, ADD_STORAGE_CMD_LEN);
        w.put_i64(self.journal_offset);
        w.put_i64(self.journal_size);
        w.put_i32(self.clean_shutdown as i32);
        w.put_i32(self.need_zero_init as i32);
        w.put_i32(self.generate_prefetch_profile as i32);
        w.put_i32(self.unit_of_prefetch_profile_entry_len);
        w.put_i32(self.profile_directed_prefetch_start_delay);

        buf
    }

    /// Decodes and validates a header from a buffer of at least [`Self::ENCODED_LEN`]
    /// bytes: converts little-endian fields to host order, validates magic and version,
    /// and rejects a `virtual_disk_size` that is not a multiple of 512.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < Self::ENCODED_LEN {
            return TruncatedSnafu {
                need: Self::ENCODED_LEN,
                got: buf.len(),
            }
            .fail();
        }

        let mut r = Reader { buf, at: 0 };
        let magic = r.get_u32();
        if magic != HEADER_MAGIC {
            return BadMagicSnafu { found: magic }.fail();
        }
        let version = r.get_u32();
        if version != HEADER_VERSION {
            return BadVersionSnafu { found: version }.fail();
        }

        let all_data_in_fvd_img = r.get_i32() != 0;
        let virtual_disk_size = r.get_i64();
        let metadata_size = r.get_i64();
        let base_img = r.get_str(PATH_FIELD_LEN)?;
        let base_img_fmt = r.get_str(FMT_FIELD_LEN)?;
        let base_img_size = r.get_i64();
        let bitmap_offset = r.get_i64();
        let bitmap_size = r.get_i64();
        let block_size = r.get_i32();
        let copy_on_read = r.get_i32() != 0;
        let max_outstanding_copy_on_read_data = r.get_i64();
        let data_file = r.get_str(PATH_FIELD_LEN)?;
        let data_file_fmt = r.get_str(FMT_FIELD_LEN)?;
        let start_delay_secs = r.get_i32();
        let prefetch_profile_offset = r.get_i64();
        let prefetch_profile_entries = r.get_i64();
        let num_slots = r.get_i32();
        let bytes_per_prefetch = r.get_i32();
        let read_throughput_measure_time_ms = r.get_i32();
        let write_throughput_measure_time_ms = r.get_i32();
        let perf_calc_alpha = r.get_i32();
        let min_read_throughput_kbps = r.get_i32();
        let min_write_throughput_kbps = r.get_i32();
        let max_read_throughput_kbps = r.get_i32();
        let max_write_throughput_kbps = r.get_i32();
        let throttle_time_ms = r.get_i32();
        let compact_image = r.get_i32() != 0;
        let table_offset = r.get_i64();
        let chunk_size = r.get_i64();
        let storage_grow_unit = r.get_i64();
        let add_storage_cmd = r.get_str(ADD_STORAGE_CMD_LEN)?;
        let journal_offset = r.get_i64();
        let journal_size = r.get_i64();
        let clean_shutdown = r.get_i32() != 0;
        let need_zero_init = r.get_i32() != 0;
        let generate_prefetch_profile = r.get_i32() != 0;
        let unit_of_prefetch_profile_entry_len = r.get_i32();
        let profile_directed_prefetch_start_delay = r.get_i32();

        let header = Header {
            all_data_in_fvd_img,
            virtual_disk_size,
            metadata_size,
            base_img,
            base_img_fmt,
            base_img_size,
            bitmap_offset,
            bitmap_size,
            block_size,
            copy_on_read,
            max_outstanding_copy_on_read_data,
            data_file,
            data_file_fmt,
            prefetch: PrefetchTuning {
                start_delay_secs,
                num_slots,
                bytes_per_prefetch,
                read_throughput_measure_time_ms,
                write_throughput_measure_time_ms,
                perf_calc_alpha,
                min_read_throughput_kbps,
                min_write_throughput_kbps,
                max_read_throughput_kbps,
                max_write_throughput_kbps,
                throttle_time_ms,
            },
            prefetch_profile_offset,
            prefetch_profile_entries,
            compact_image,
            table_offset,
            chunk_size,
            storage_grow_unit,
            add_storage_cmd,
            journal_offset,
            journal_size,
            clean_shutdown,
            need_zero_init,
            generate_prefetch_profile,
            unit_of_prefetch_profile_entry_len,
            profile_directed_prefetch_start_delay,
        };

        header.validate()?;
        Ok(header)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn put_u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }
    fn put_i32(&mut self, v: i32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }
    fn put_i64(&mut self, v: i64) {
        self.buf[self.at..self.at + 8].copy_from_slice(&v.to_le_bytes());
        self.at += 8;
    }
    fn put_str(&mut self, s: &str, field_len: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(field_len.saturating_sub(1));
        self.buf[self.at..self.at + n].copy_from_slice(&bytes[..n]);
        // Remaining bytes in the field, including the terminator, stay zero.
        self.at += field_len;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn get_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.at..self.at + 4].try_into().unwrap());
        self.at += 4;
        v
    }
    fn get_i32(&mut self) -> i32 {
        let v = i32::from_le_bytes(self.buf[self.at..self.at + 4].try_into().unwrap());
        self.at += 4;
        v
    }
    fn get_i64(&mut self) -> i64 {
        let v = i64::from_le_bytes(self.buf[self.at..self.at + 8].try_into().unwrap());
        self.at += 8;
        v
    }
    fn get_str(&mut self, field_len: usize) -> Result<String, HeaderError> {
        let field = &self.buf[self.at..self.at + field_len];
        self.at += field_len;
        let nul = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        std::str::from_utf8(&field[..nul])
            .map(str::to_owned)
            .map_err(|_| InvalidPathSnafu.build())
    }
}

/// Rounds `len` up to the next multiple of [`PAGE_SIZE`].
pub fn round_up_to_page(len: u64) -> u64 {
    (len + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            all_data_in_fvd_img: false,
            virtual_disk_size: 4 * 1024 * 1024,
            metadata_size: PAGE_SIZE as i64,
            base_img: "/tmp/base.img".to_string(),
            base_img_fmt: "raw".to_string(),
            base_img_size: 4 * 1024 * 1024,
            bitmap_offset: PAGE_SIZE as i64,
            bitmap_size: PAGE_SIZE as i64,
            block_size: 65536,
            copy_on_read: true,
            max_outstanding_copy_on_read_data: 16 * 1024 * 1024,
            data_file: String::new(),
            data_file_fmt: String::new(),
            prefetch: PrefetchTuning::default(),
            prefetch_profile_offset: 0,
            prefetch_profile_entries: 0,
            compact_image: true,
            table_offset: 2 * PAGE_SIZE as i64,
            chunk_size: 1024 * 1024,
            storage_grow_unit: 16 * 1024 * 1024,
            add_storage_cmd: String::new(),
            journal_offset: 3 * PAGE_SIZE as i64,
            journal_size: PAGE_SIZE as i64,
            clean_shutdown: true,
            need_zero_init: false,
            generate_prefetch_profile: false,
            unit_of_prefetch_profile_entry_len: 0,
            profile_directed_prefetch_start_delay: -1,
        }
    }

    #[test]
    fn round_trip() {
        let h = sample_header();
        let encoded = h.encode();
        assert_eq!(encoded.len(), Header::ENCODED_LEN);
        let decoded = Header::decode(&encoded).expect("decode");
        assert_eq!(h, decoded);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = sample_header().encode();
        encoded[0] = 0;
        match Header::decode(&encoded) {
            Err(HeaderError::BadMagic { .. }) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn rejects_misaligned_virtual_size() {
        let mut h = sample_header();
        h.virtual_disk_size = 1023;
        match h.validate() {
            Err(HeaderError::MisalignedVirtualSize { .. }) => {}
            other => panic!("expected MisalignedVirtualSize, got {other:?}"),
        }
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
