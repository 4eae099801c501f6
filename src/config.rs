//! # Configuration
//!
//! Tunables of the translation layer. Defaults match the shipped format;
//! everything here is fixed at device creation and persisted where it
//! shapes the on-disk layout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which logical-to-physical backend the device runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum L2pBackend {
    /// The whole table resident in memory (or a pmem file).
    Flat,
    /// Paged table with LRU-evicted resident pages.
    Cache,
}

/// Shared-memory mode for metadata buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShmMode {
    /// Plain heap buffers; no fast restart.
    Off,
    /// Named shared-memory objects, reused across restarts.
    On,
    /// Shared-memory objects on hugetlbfs, registered with the I/O
    /// allocator.
    Huge,
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtlConfig {
    /// Device name used in logs.
    pub name: String,

    /// Device identity. Generated at creation when absent; a remount of
    /// an existing device must pass the formatted identity so
    /// shared-memory objects resolve.
    pub uuid: Option<uuid::Uuid>,

    /// Percentage of base-device capacity withheld from the host.
    pub lba_rsvd: u8,

    /// Transfer unit of the base device, in blocks. Metadata I/O runs in
    /// `4 x xfer_size` chunks.
    pub xfer_size: u64,

    /// Blocks per cache chunk, tail metadata included.
    pub chunk_blocks: u64,

    /// Size of the user I/O pool, in requests.
    pub user_io_pool_size: usize,

    /// Memory budget of the paged L2P, in MiB. Also bounds the recovery
    /// working set.
    pub l2p_dram_limit_mib: u64,

    /// Upper bound on the paged L2P eviction keep-floor, in pages.
    pub l2p_evict_keep_max: u32,

    /// L2P backend selection.
    pub l2p_backend: L2pBackend,

    /// Optional pmem file backing the flat L2P.
    pub l2p_pmem_path: Option<PathBuf>,

    /// Shared-memory mode for metadata buffers.
    pub shm_mode: ShmMode,

    /// Directory holding shared-memory objects. Defaults to `/dev/shm`
    /// (or `/dev/hugepages` in huge mode); tests point this at a
    /// temporary directory.
    pub shm_dir: Option<PathBuf>,

    /// Logical on-disk format version stamped into region VSS blocks.
    pub format_version: u64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfig {
            name: "ftl".to_string(),
            uuid: None,
            lba_rsvd: 5,
            xfer_size: 16,
            chunk_blocks: 1024,
            user_io_pool_size: 256,
            l2p_dram_limit_mib: 64,
            l2p_evict_keep_max: 16 * 1024,
            l2p_backend: L2pBackend::Flat,
            l2p_pmem_path: None,
            shm_mode: ShmMode::Off,
            shm_dir: None,
            format_version: 1,
        }
    }
}

impl FtlConfig {
    /// Validate internal consistency.
    pub fn is_valid(&self) -> bool {
        self.lba_rsvd < 100
            && self.xfer_size > 0
            && self.chunk_blocks > 0
            && self.user_io_pool_size > 0
            && self.l2p_dram_limit_mib > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FtlConfig::default().is_valid());
    }

    #[test]
    fn test_invalid_reservation_detected() {
        let config = FtlConfig {
            lba_rsvd: 100,
            ..FtlConfig::default()
        };
        assert!(!config.is_valid());
    }

    #[test]
    fn test_config_serializes() {
        let config = FtlConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: FtlConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunk_blocks, config.chunk_blocks);
    }
}
