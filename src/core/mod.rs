//! # Core Types
//!
//! Foundational types shared by every subsystem:
//!
//! - `addr`: the on-disk address and its packed wire format
//! - `buf`: DMA-style buffers shared with the block device until completion
//! - Device geometry (bands, punits, zones) derived from bdev attributes

pub mod addr;
pub mod buf;

/// Smallest addressable data unit, in bytes.
pub const FTL_BLOCK_SIZE: usize = 4096;

/// Marks a logical block address as invalid.
pub const FTL_LBA_INVALID: u64 = u64::MAX;

/// Per-block side-channel metadata size, in bytes.
pub const FTL_MD_VSS_SZ: usize = 64;

/// Base-device geometry as seen by the translation layer.
///
/// A band is a contiguous group of zones written sequentially; one zone per
/// parallel unit. The zone size of the base device must divide the band
/// evenly, which the layout validates at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Number of blocks in a single zone.
    pub zone_size: u64,
    /// Number of parallel units (zones written concurrently in one band).
    pub num_punits: u64,
    /// Number of bands on the base device.
    pub num_bands: u64,
}

impl Geometry {
    /// Number of blocks in one band.
    pub fn blocks_in_band(&self) -> u64 {
        self.zone_size * self.num_punits
    }

    /// Band index containing a base-device block offset.
    pub fn band_of(&self, offset: u64) -> u64 {
        offset / self.blocks_in_band()
    }

    /// Parallel unit of a base-device block offset.
    pub fn punit_of(&self, offset: u64) -> u64 {
        (offset / self.zone_size) % self.num_punits
    }

    /// Offset within the zone of a base-device block offset.
    pub fn zone_offset_of(&self, offset: u64) -> u64 {
        offset % self.zone_size
    }

    /// Block offset within the band of a base-device block offset.
    pub fn band_offset_of(&self, offset: u64) -> u64 {
        offset % self.blocks_in_band()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_decomposition() {
        let geom = Geometry {
            zone_size: 256,
            num_punits: 4,
            num_bands: 8,
        };

        assert_eq!(geom.blocks_in_band(), 1024);
        assert_eq!(geom.band_of(0), 0);
        assert_eq!(geom.band_of(1023), 0);
        assert_eq!(geom.band_of(1024), 1);
        assert_eq!(geom.punit_of(256), 1);
        assert_eq!(geom.punit_of(1024 + 512), 2);
        assert_eq!(geom.zone_offset_of(257), 1);
        assert_eq!(geom.band_offset_of(1025), 1);
    }
}
