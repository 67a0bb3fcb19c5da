//! Image-creation configuration: the create-time flag set.
//!
//! Modeled on `vector-buffers`'s `DiskBufferConfig`/`DiskBufferConfigBuilder` in
//! `common.rs`: a plain data struct plus a builder that defaults every optional
//! tunable and validates at `build()` time rather than at every setter call.

use snafu::Snafu;

use crate::header::{PrefetchTuning, SECTOR_SIZE};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("size must be a positive multiple of the sector size ({SECTOR_SIZE})"))]
    InvalidSize,

    #[snafu(display("block_size must be a positive power of two multiple of the sector size"))]
    InvalidBlockSize,

    #[snafu(display("chunk_size must be a positive multiple of block_size"))]
    InvalidChunkSize,

    #[snafu(display("compact_image requires chunk_size and storage_grow_unit to be set"))]
    CompactImageMissingChunking,

    #[snafu(display("detect_sparse_hole requires need_zero_init"))]
    SparseHoleRequiresZeroInit,
}

/// Create-time configuration for a new FVD image.
#[derive(Debug, Clone)]
pub struct FvdConfig {
    pub virtual_disk_size: u64,
    pub block_size: u32,
    pub base_img: Option<String>,
    pub base_img_fmt: String,
    pub data_file: Option<String>,
    pub data_file_fmt: String,
    pub copy_on_read: bool,
    pub max_outstanding_copy_on_read_data: u64,
    pub compact_image: bool,
    pub chunk_size: u64,
    pub storage_grow_unit: u64,
    pub add_storage_cmd: Option<String>,
    pub journal_size: u64,
    pub need_zero_init: bool,
    pub detect_sparse_hole: bool,
    pub generate_prefetch_profile: bool,
    pub prefetch: PrefetchTuning,
}

impl FvdConfig {
    pub fn builder(virtual_disk_size: u64) -> FvdConfigBuilder {
        FvdConfigBuilder::new(virtual_disk_size)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_disk_size == 0 || self.virtual_disk_size % SECTOR_SIZE != 0 {
            return Err(ConfigError::InvalidSize);
        }
        if self.block_size == 0
            || (self.block_size as u64) % SECTOR_SIZE != 0
            || !self.block_size.is_power_of_two()
        {
            return Err(ConfigError::InvalidBlockSize);
        }
        if self.compact_image {
            if self.chunk_size == 0 || self.chunk_size % self.block_size as u64 != 0 {
                return Err(ConfigError::InvalidChunkSize);
            }
            if self.storage_grow_unit == 0 {
                return Err(ConfigError::CompactImageMissingChunking);
            }
        }
        if self.detect_sparse_hole && !self.need_zero_init {
            return Err(ConfigError::SparseHoleRequiresZeroInit);
        }
        Ok(())
    }
}

/// Builder for [`FvdConfig`], defaulting every tunable a caller does not set explicitly.
#[derive(Debug, Clone)]
pub struct FvdConfigBuilder {
    config: FvdConfig,
}

impl FvdConfigBuilder {
    pub fn new(virtual_disk_size: u64) -> Self {
        Self {
            config: FvdConfig {
                virtual_disk_size,
                block_size: 65536,
                base_img: None,
                base_img_fmt: "raw".to_string(),
                data_file: None,
                data_file_fmt: "raw".to_string(),
                copy_on_read: false,
                max_outstanding_copy_on_read_data: 16 * 1024 * 1024,
                compact_image: false,
                chunk_size: 1024 * 1024,
                storage_grow_unit: 16 * 1024 * 1024,
                add_storage_cmd: None,
                journal_size: 8 * crate::header::PAGE_SIZE,
                need_zero_init: false,
                detect_sparse_hole: false,
                generate_prefetch_profile: false,
                prefetch: PrefetchTuning::default(),
            },
        }
    }

    pub fn block_size(mut self, v: u32) -> Self {
        self.config.block_size = v;
        self
    }

    pub fn base_img(mut self, path: impl Into<String>, fmt: impl Into<String>) -> Self {
        self.config.base_img = Some(path.into());
        self.config.base_img_fmt = fmt.into();
        self
    }

    pub fn data_file(mut self, path: impl Into<String>, fmt: impl Into<String>) -> Self {
        self.config.data_file = Some(path.into());
        self.config.data_file_fmt = fmt.into();
        self
    }

    pub fn copy_on_read(mut self, v: bool) -> Self {
        self.config.copy_on_read = v;
        self
    }

    pub fn max_outstanding_copy_on_read_data(mut self, v: u64) -> Self {
        self.config.max_outstanding_copy_on_read_data = v;
        self
    }

    pub fn compact_image(mut self, chunk_size: u64, storage_grow_unit: u64) -> Self {
        self.config.compact_image = true;
        self.config.chunk_size = chunk_size;
        self.config.storage_grow_unit = storage_grow_unit;
        self
    }

    pub fn add_storage_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.add_storage_cmd = Some(cmd.into());
        self
    }

    pub fn journal_size(mut self, v: u64) -> Self {
        self.config.journal_size = v;
        self
    }

    pub fn need_zero_init(mut self, v: bool) -> Self {
        self.config.need_zero_init = v;
        self
    }

    pub fn detect_sparse_hole(mut self, v: bool) -> Self {
        self.config.detect_sparse_hole = v;
        self
    }

    pub fn generate_prefetch_profile(mut self, v: bool) -> Self {
        self.config.generate_prefetch_profile = v;
        self
    }

    pub fn prefetch(mut self, tuning: PrefetchTuning) -> Self {
        self.config.prefetch = tuning;
        self
    }

    pub fn build(self) -> Result<FvdConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = FvdConfig::builder(4 * 1024 * 1024).build().unwrap();
        assert_eq!(cfg.block_size, 65536);
    }

    #[test]
    fn compact_image_requires_chunking_fields() {
        let mut cfg = FvdConfig::builder(4 * 1024 * 1024).build().unwrap();
        cfg.compact_image = true;
        cfg.storage_grow_unit = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::CompactImageMissingChunking)));
    }

    #[test]
    fn sparse_hole_requires_zero_init() {
        let cfg = FvdConfig::builder(4 * 1024 * 1024).detect_sparse_hole(true).build();
        assert!(matches!(cfg, Err(ConfigError::SparseHoleRequiresZeroInit)));
    }

    #[test]
    fn rejects_misaligned_size() {
        let cfg = FvdConfig::builder(1023).build();
        assert!(matches!(cfg, Err(ConfigError::InvalidSize)));
    }
}
