//! # Flashtier - Log-Structured Two-Tier FTL Core
//!
//! A flash translation layer over two block-device backings: a fast
//! non-volatile cache absorbing user writes and an append-only, zoned
//! base device holding compacted data. The host sees a flat
//! logical-block address space.
//!
//! ## Architecture
//!
//! - `core`: address codec, shared buffers, device geometry
//! - `reactor`: single-threaded cooperative scheduling and task objects
//! - `device`: the block-device collaborator trait and the in-memory
//!   test backing
//! - `layout`: static region partitioning and the superblock
//! - `md`: metadata objects with persist/restore/clear, mirrors, and
//!   shared-memory backing
//! - `l2p`: logical-to-physical map, flat and paged backends
//! - `nv_cache`: chunked write cache with per-chunk metadata and tail
//!   maps
//! - `band`: sequentially written band layout with P2L checkpoints and
//!   the valid map
//! - `recovery`: bounded-memory replay after a dirty shutdown
//! - `dev`: device assembly, mount/format/halt, and the user data path

#![warn(missing_docs)]
#![warn(clippy::all)]

// Foundational types
pub mod core;

// Cooperative scheduling
pub mod reactor;

// Block-device collaborator
pub mod device;

// On-disk layout
pub mod layout;

// Metadata objects
pub mod md;

// Logical-to-physical map
pub mod l2p;

// Non-volatile cache
pub mod nv_cache;

// Band layout
pub mod band;

// Dirty-shutdown replay
pub mod recovery;

// Device assembly
pub mod dev;

// Configuration
pub mod config;

// Re-export commonly used types
pub use crate::config::{FtlConfig, L2pBackend, ShmMode};
pub use crate::core::addr::{Addr, AddrCodec};
pub use crate::core::{FTL_BLOCK_SIZE, FTL_LBA_INVALID, FTL_MD_VSS_SZ};
pub use crate::dev::{FtlCore, FtlDev, FtlDevRef, FtlError};
pub use crate::reactor::{Reactor, ReactorRef};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
