//! # On-Disk Layout
//!
//! Static partitioning of the two backings into named regions. All
//! metadata regions live on the non-volatile cache device; the base device
//! is one contiguous data region. Every region starts and ends on a
//! 32-block boundary and no two regions on the same device may intersect,
//! which `validate` enforces at format and at mount.
//!
//! The layout also fixes the L2P shape for the lifetime of the format:
//! address bit length, entry size (packed 4-byte entries when the combined
//! block count fits), and LBAs per L2P page.

pub mod superblock;

use thiserror::Error;

use crate::config::FtlConfig;
use crate::core::addr::AddrCodec;
use crate::core::{Geometry, FTL_BLOCK_SIZE};
use crate::device::Bdev;

/// Region alignment, in blocks.
pub const REGION_ALIGN_BLOCKS: u64 = 32;

/// Number of rotating physical-to-logical checkpoint regions.
pub const P2L_CKPT_COUNT: u8 = 4;

/// Which backing a region lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSel {
    /// The non-volatile cache device.
    Cache,
    /// The base device.
    Base,
}

/// Identity of a layout region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionType {
    /// Device superblock.
    Superblock,
    /// Mirror of the superblock.
    SuperblockMirror,
    /// Per-band metadata entries.
    BandMd,
    /// Mirror of the band metadata.
    BandMdMirror,
    /// Persisted valid-map bits.
    ValidMap,
    /// Per-chunk metadata entries of the non-volatile cache.
    NvcMd,
    /// Mirror of the chunk metadata.
    NvcMdMirror,
    /// One of the rotating P2L checkpoint slots.
    P2lCkpt(u8),
    /// The logical-to-physical table.
    L2p,
    /// Cache data (chunks).
    DataNvc,
    /// Base-device data (bands).
    DataBase,
}

impl RegionType {
    /// Human-readable region name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RegionType::Superblock => "sb",
            RegionType::SuperblockMirror => "sb_mirror",
            RegionType::BandMd => "band_md",
            RegionType::BandMdMirror => "band_md_mirror",
            RegionType::ValidMap => "valid_map",
            RegionType::NvcMd => "nvc_md",
            RegionType::NvcMdMirror => "nvc_md_mirror",
            RegionType::P2lCkpt(0) => "p2l0",
            RegionType::P2lCkpt(1) => "p2l1",
            RegionType::P2lCkpt(2) => "p2l2",
            RegionType::P2lCkpt(_) => "p2l3",
            RegionType::L2p => "l2p",
            RegionType::DataNvc => "data_nvc",
            RegionType::DataBase => "data_btm",
        }
    }
}

/// One named, block-aligned span on a backing device.
#[derive(Debug, Clone)]
pub struct LayoutRegion {
    /// Region identity.
    pub rtype: RegionType,
    /// Backing device.
    pub device: DeviceSel,
    /// First block of the region.
    pub offset_blocks: u64,
    /// Length in blocks.
    pub length_blocks: u64,
    /// Logical format version, stamped into every VSS block written to
    /// the region.
    pub version: u64,
    /// Size of one entry in blocks; zero when the region does not support
    /// entry-granular I/O.
    pub entry_size: u64,
    /// Number of entries for entry-granular regions.
    pub num_entries: u64,
    /// Per-block VSS bytes available on the backing device.
    pub vss_blksz: u32,
    /// Mirror region, when the region is mirrored.
    pub mirror_type: Option<RegionType>,
}

/// L2P shape fixed at format time.
#[derive(Debug, Clone, Copy)]
pub struct L2pShape {
    /// Bit length of the combined address space, including the cached
    /// flag.
    pub addr_length: u32,
    /// Entry size in bytes (4 or 8).
    pub addr_size: usize,
    /// L2P entries per block.
    pub lbas_in_page: u64,
}

impl L2pShape {
    /// Address codec matching this shape.
    pub fn codec(&self) -> AddrCodec {
        AddrCodec::from_entry_size(self.addr_size)
    }
}

/// Layout subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// A device is too small for its metadata regions.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Two regions on the same device intersect.
    #[error("regions {0} and {1} overlap")]
    Overlap(&'static str, &'static str),

    /// The persisted logical capacity does not match the derived one.
    #[error("logical capacity mismatch: persisted {persisted}, derived {derived}")]
    NumLbasMismatch {
        /// Value stored in the superblock.
        persisted: u64,
        /// Value derived from the current devices.
        derived: u64,
    },

    /// The base-device zone shape cannot form bands.
    #[error("invalid zoned geometry: {0}")]
    InvalidGeometry(String),
}

/// The complete static partitioning of both devices.
#[derive(Debug, Clone)]
pub struct Layout {
    regions: Vec<LayoutRegion>,
    /// L2P shape.
    pub l2p: L2pShape,
    /// Number of host-visible logical blocks.
    pub num_lbas: u64,
    /// Base-device band geometry.
    pub geometry: Geometry,
    /// Total blocks on the cache device.
    pub nvc_total_blocks: u64,
    /// Total blocks on the base device.
    pub base_total_blocks: u64,
    /// Blocks per cache chunk, tail metadata included.
    pub chunk_blocks: u64,
    /// Number of cache chunks.
    pub chunk_count: u64,
    /// Trailing blocks of each chunk holding its LBA map.
    pub chunk_tail_md_blocks: u64,
    /// Blocks holding one band's LBA map (tail metadata and checkpoint
    /// payload size).
    pub band_tail_md_blocks: u64,
}

fn align_region(blocks: u64) -> u64 {
    blocks.div_ceil(REGION_ALIGN_BLOCKS) * REGION_ALIGN_BLOCKS
}

fn blocks_for_bytes(bytes: u64) -> u64 {
    align_region(bytes.div_ceil(FTL_BLOCK_SIZE as u64))
}

/// Band map entry size on disk: `{lba: u64, seq_id: u64}`.
pub const BAND_MAP_ENTRY_SIZE: u64 = 16;

impl Layout {
    /// Derive the layout from the two devices and the configuration.
    ///
    /// `persisted_num_lbas` is the value recorded in the superblock at
    /// format time; passing `Some` makes the derivation fail on mismatch,
    /// which is the mount-time guard against swapped devices.
    pub fn setup(
        config: &FtlConfig,
        base: &dyn Bdev,
        cache: &dyn Bdev,
        persisted_num_lbas: Option<u64>,
    ) -> Result<Layout, LayoutError> {
        let base_total = base.num_blocks();
        let nvc_total = cache.num_blocks();

        let zone_size = base.zone_size();
        let num_punits = base.optimal_open_zones();
        if zone_size == 0 || num_punits == 0 {
            return Err(LayoutError::InvalidGeometry(
                "base device reports no zones".to_string(),
            ));
        }
        let blocks_in_band = zone_size * num_punits;
        let num_bands = base_total / blocks_in_band;
        if num_bands == 0 {
            return Err(LayoutError::InvalidGeometry(format!(
                "base device smaller than one band ({} blocks)",
                blocks_in_band
            )));
        }
        let geometry = Geometry {
            zone_size,
            num_punits,
            num_bands,
        };

        let num_lbas = base_total * (100 - u64::from(config.lba_rsvd)) / 100;
        if let Some(persisted) = persisted_num_lbas {
            if persisted != num_lbas {
                return Err(LayoutError::NumLbasMismatch {
                    persisted,
                    derived: num_lbas,
                });
            }
        }

        let addr_length = 64 - (base_total + nvc_total).leading_zeros();
        let addr_size = if addr_length > 32 { 8 } else { 4 };
        let l2p = L2pShape {
            addr_length,
            addr_size,
            lbas_in_page: (FTL_BLOCK_SIZE / addr_size) as u64,
        };

        let chunk_blocks = config.chunk_blocks;
        let chunk_tail_md_blocks =
            (chunk_blocks * addr_size as u64).div_ceil(FTL_BLOCK_SIZE as u64);
        if chunk_blocks <= chunk_tail_md_blocks {
            return Err(LayoutError::InvalidGeometry(format!(
                "chunk of {} blocks cannot hold {} tail metadata blocks",
                chunk_blocks, chunk_tail_md_blocks
            )));
        }
        let band_tail_md_blocks =
            (blocks_in_band * BAND_MAP_ENTRY_SIZE).div_ceil(FTL_BLOCK_SIZE as u64);

        let cache_vss = cache.md_size();
        let mut regions = Vec::new();
        let mut offset = 0u64;

        struct CacheSpan {
            rtype: RegionType,
            length: u64,
            entry_size: u64,
            num_entries: u64,
            mirror: Option<RegionType>,
        }

        fn push_cache_region(
            regions: &mut Vec<LayoutRegion>,
            offset: &mut u64,
            version: u64,
            vss_blksz: u32,
            span: CacheSpan,
        ) {
            regions.push(LayoutRegion {
                rtype: span.rtype,
                device: DeviceSel::Cache,
                offset_blocks: *offset,
                length_blocks: span.length,
                version,
                entry_size: span.entry_size,
                num_entries: span.num_entries,
                vss_blksz,
                mirror_type: span.mirror,
            });
            *offset += span.length;
        }

        let band_md_blocks = align_region(num_bands);
        let valid_map_blocks = blocks_for_bytes(base_total.div_ceil(8));
        // Chunk count is bounded by the whole device; the final count is
        // recomputed from the data remainder below.
        let est_chunks = nvc_total / chunk_blocks;
        let nvc_md_blocks = align_region(est_chunks.max(1));
        let p2l_blocks = align_region(1 + band_tail_md_blocks);
        let l2p_blocks = blocks_for_bytes(num_lbas * addr_size as u64);

        let mut spans = vec![
            CacheSpan {
                rtype: RegionType::Superblock,
                length: REGION_ALIGN_BLOCKS,
                entry_size: 0,
                num_entries: 0,
                mirror: Some(RegionType::SuperblockMirror),
            },
            CacheSpan {
                rtype: RegionType::SuperblockMirror,
                length: REGION_ALIGN_BLOCKS,
                entry_size: 0,
                num_entries: 0,
                mirror: None,
            },
            CacheSpan {
                rtype: RegionType::BandMd,
                length: band_md_blocks,
                entry_size: 1,
                num_entries: num_bands,
                mirror: Some(RegionType::BandMdMirror),
            },
            CacheSpan {
                rtype: RegionType::BandMdMirror,
                length: band_md_blocks,
                entry_size: 1,
                num_entries: num_bands,
                mirror: None,
            },
            CacheSpan {
                rtype: RegionType::ValidMap,
                length: valid_map_blocks,
                entry_size: 0,
                num_entries: 0,
                mirror: None,
            },
            CacheSpan {
                rtype: RegionType::NvcMd,
                length: nvc_md_blocks,
                entry_size: 1,
                num_entries: est_chunks,
                mirror: Some(RegionType::NvcMdMirror),
            },
            CacheSpan {
                rtype: RegionType::NvcMdMirror,
                length: nvc_md_blocks,
                entry_size: 1,
                num_entries: est_chunks,
                mirror: None,
            },
        ];
        for ckpt in 0..P2L_CKPT_COUNT {
            spans.push(CacheSpan {
                rtype: RegionType::P2lCkpt(ckpt),
                length: p2l_blocks,
                entry_size: 0,
                num_entries: 0,
                mirror: None,
            });
        }
        spans.push(CacheSpan {
            rtype: RegionType::L2p,
            length: l2p_blocks,
            entry_size: 0,
            num_entries: 0,
            mirror: None,
        });

        for span in spans {
            push_cache_region(&mut regions, &mut offset, config.format_version, cache_vss, span);
        }

        if offset >= nvc_total {
            return Err(LayoutError::InsufficientCapacity(format!(
                "cache device of {} blocks cannot hold {} metadata blocks",
                nvc_total, offset
            )));
        }
        let data_nvc_blocks = nvc_total - offset;
        let chunk_count = data_nvc_blocks / chunk_blocks;
        if chunk_count == 0 {
            return Err(LayoutError::InsufficientCapacity(format!(
                "cache data remainder of {} blocks holds no {}-block chunk",
                data_nvc_blocks, chunk_blocks
            )));
        }
        push_cache_region(
            &mut regions,
            &mut offset,
            config.format_version,
            cache_vss,
            CacheSpan {
                rtype: RegionType::DataNvc,
                length: data_nvc_blocks,
                entry_size: 0,
                num_entries: 0,
                mirror: None,
            },
        );

        regions.push(LayoutRegion {
            rtype: RegionType::DataBase,
            device: DeviceSel::Base,
            offset_blocks: 0,
            length_blocks: base_total,
            version: config.format_version,
            entry_size: 0,
            num_entries: 0,
            vss_blksz: 0,
            mirror_type: None,
        });

        // Entry counts for the chunk metadata follow the final chunk
        // count, not the estimate.
        for region in regions.iter_mut() {
            if matches!(region.rtype, RegionType::NvcMd | RegionType::NvcMdMirror) {
                region.num_entries = chunk_count;
            }
        }

        let layout = Layout {
            regions,
            l2p,
            num_lbas,
            geometry,
            nvc_total_blocks: nvc_total,
            base_total_blocks: base_total,
            chunk_blocks,
            chunk_count,
            chunk_tail_md_blocks,
            band_tail_md_blocks,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Look up a region by type.
    ///
    /// Panics on a type absent from the layout; region types are static
    /// and the layout always carries all of them.
    pub fn region(&self, rtype: RegionType) -> &LayoutRegion {
        self.regions
            .iter()
            .find(|r| r.rtype == rtype)
            .unwrap_or_else(|| panic!("layout region {} missing", rtype.name()))
    }

    /// All regions, in layout order.
    pub fn regions(&self) -> &[LayoutRegion] {
        &self.regions
    }

    /// First data block of the cache chunk area.
    pub fn nvc_data_offset(&self) -> u64 {
        self.region(RegionType::DataNvc).offset_blocks
    }

    /// Verify that no two regions on the same device intersect and that
    /// alignment holds.
    pub fn validate(&self) -> Result<(), LayoutError> {
        for region in &self.regions {
            debug_assert_eq!(region.offset_blocks % REGION_ALIGN_BLOCKS, 0);
            if region.rtype != RegionType::DataNvc && region.rtype != RegionType::DataBase {
                debug_assert_eq!(region.length_blocks % REGION_ALIGN_BLOCKS, 0);
            }
        }

        for (i, r1) in self.regions.iter().enumerate() {
            for r2 in self.regions.iter().skip(i + 1) {
                if r1.device != r2.device {
                    continue;
                }
                let r1_end = r1.offset_blocks + r1.length_blocks - 1;
                let r2_end = r2.offset_blocks + r2.length_blocks - 1;
                if r1.offset_blocks.max(r2.offset_blocks) <= r1_end.min(r2_end) {
                    return Err(LayoutError::Overlap(r1.rtype.name(), r2.rtype.name()));
                }
            }
        }
        Ok(())
    }

    /// Log the partitioning of both devices.
    pub fn dump(&self) {
        log::info!(
            "layout: base {:.2} MiB, cache {:.2} MiB, {} LBAs, addr size {}",
            blocks_to_mib(self.base_total_blocks),
            blocks_to_mib(self.nvc_total_blocks),
            self.num_lbas,
            self.l2p.addr_size,
        );
        for region in &self.regions {
            log::info!(
                "  region {:<14} {:?} offset {:>8} blocks {:>8}",
                region.rtype.name(),
                region.device,
                region.offset_blocks,
                region.length_blocks,
            );
        }
    }
}

fn blocks_to_mib(blocks: u64) -> f64 {
    (blocks as f64) * (FTL_BLOCK_SIZE as f64) / 1024.0 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mem::MemBdev;
    use crate::reactor::Reactor;

    fn layout_for(base_blocks: u64, cache_blocks: u64) -> Result<Layout, LayoutError> {
        let reactor = Reactor::new();
        let base = MemBdev::new(std::rc::Rc::clone(&reactor), base_blocks, 0, 256, 2);
        let cache = MemBdev::new(reactor, cache_blocks, 64, 0, 0);
        Layout::setup(&FtlConfig::default(), &*base, &*cache, None)
    }

    #[test]
    fn test_regions_are_aligned_and_disjoint() {
        let layout = layout_for(16384, 8192).unwrap();
        layout.validate().unwrap();
        for region in layout.regions() {
            assert_eq!(region.offset_blocks % REGION_ALIGN_BLOCKS, 0);
        }
    }

    #[test]
    fn test_data_regions_span_remainders() {
        let layout = layout_for(16384, 8192).unwrap();
        let data_nvc = layout.region(RegionType::DataNvc);
        assert_eq!(
            data_nvc.offset_blocks + data_nvc.length_blocks,
            layout.nvc_total_blocks
        );
        let data_base = layout.region(RegionType::DataBase);
        assert_eq!(data_base.offset_blocks, 0);
        assert_eq!(data_base.length_blocks, layout.base_total_blocks);
        assert!(layout.chunk_count >= 1);
    }

    #[test]
    fn test_addr_size_selection() {
        let layout = layout_for(16384, 8192).unwrap();
        // 24576 blocks fit comfortably below 32 bits.
        assert_eq!(layout.l2p.addr_size, 4);
        assert_eq!(layout.l2p.lbas_in_page, 1024);
    }

    #[test]
    fn test_num_lbas_reservation_and_mismatch() {
        let layout = layout_for(16384, 8192).unwrap();
        let expected = 16384 * (100 - u64::from(FtlConfig::default().lba_rsvd)) / 100;
        assert_eq!(layout.num_lbas, expected);

        let reactor = Reactor::new();
        let base = MemBdev::new(std::rc::Rc::clone(&reactor), 16384, 0, 256, 2);
        let cache = MemBdev::new(reactor, 8192, 64, 0, 0);
        let err = Layout::setup(&FtlConfig::default(), &*base, &*cache, Some(expected + 1));
        assert!(matches!(err, Err(LayoutError::NumLbasMismatch { .. })));
    }

    #[test]
    fn test_too_small_cache_is_rejected() {
        assert!(matches!(
            layout_for(16384, 64),
            Err(LayoutError::InsufficientCapacity(_))
        ));
    }

    #[test]
    fn test_mirrors_are_linked() {
        let layout = layout_for(16384, 8192).unwrap();
        assert_eq!(
            layout.region(RegionType::BandMd).mirror_type,
            Some(RegionType::BandMdMirror)
        );
        assert_eq!(
            layout.region(RegionType::NvcMd).mirror_type,
            Some(RegionType::NvcMdMirror)
        );
    }
}
