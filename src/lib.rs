//! FVD: a copy-on-write, optionally compact, optionally prefetching virtual-disk image
//! format.
//!
//! The crate is organized the way `vector-buffers` organizes its `disk_v2` engine: one
//! module per concern (on-disk codec, allocation bitmap, chunk table, journal, conflict
//! locks, the read/write engines themselves), wired together by a single `Engine` type
//! that owns all live state for one open image. There is no `unsafe` anywhere in this
//! crate.

#![deny(clippy::all)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod backend;
pub mod bitmap;
pub mod compact;
pub mod config;
pub mod create;
pub mod error;
pub mod header;
pub mod journal;
pub mod locks;
pub mod prefetch;
pub mod rcb;
pub mod read;
pub mod state;
pub mod table;
pub mod write;

pub use backend::{BlockBackend, FileBlockBackend, MemBlockBackend};
pub use config::{ConfigError, FvdConfig, FvdConfigBuilder};
pub use error::FvdError;
pub use rcb::CancelToken;
pub use state::{Engine, FvdInfo, OpenMode};
pub use table::BlockStatus;
