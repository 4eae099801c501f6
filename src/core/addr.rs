//! # On-Disk Address
//!
//! A physical address points either at the base device or, with the cached
//! flag set, at an offset inside the non-volatile cache. The in-memory form
//! is a tagged enum; two wire forms exist:
//!
//! - raw 64-bit: bit 63 carries the cached flag, all-ones is invalid
//! - packed 32-bit: same layout in the low 32 bits, usable when the whole
//!   address space fits in 31 bits
//!
//! Packing is chosen once at format time from the combined block count of
//! both devices and never changes for the lifetime of the on-disk format.

use crate::core::FTL_LBA_INVALID;

/// Raw form of an invalid address (all ones).
pub const ADDR_RAW_INVALID: u64 = u64::MAX;

/// Packed form of an invalid address (all ones, 32-bit).
pub const ADDR_PACKED_INVALID: u32 = u32::MAX;

const RAW_CACHED_BIT: u64 = 1 << 63;
const RAW_OFFSET_MASK: u64 = RAW_CACHED_BIT - 1;

const PACKED_CACHED_BIT: u32 = 1 << 31;
const PACKED_OFFSET_MASK: u32 = PACKED_CACHED_BIT - 1;

/// Physical location of a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    /// No physical location; the block was never written or was trimmed.
    Invalid,
    /// Offset inside the non-volatile cache data region.
    Cached(u64),
    /// Offset on the base device.
    Flash(u64),
}

impl Addr {
    /// Whether this is the invalid sentinel.
    pub fn is_invalid(self) -> bool {
        matches!(self, Addr::Invalid)
    }

    /// Whether this address points into the non-volatile cache.
    pub fn is_cached(self) -> bool {
        matches!(self, Addr::Cached(_))
    }

    /// Cache offset of a cached address.
    ///
    /// Panics when called on a non-cached address; callers check
    /// `is_cached` first.
    pub fn cache_offset(self) -> u64 {
        match self {
            Addr::Cached(offset) => offset,
            _ => panic!("cache_offset on non-cached address"),
        }
    }

    /// Base-device offset of a flash address.
    pub fn flash_offset(self) -> u64 {
        match self {
            Addr::Flash(offset) => offset,
            _ => panic!("flash_offset on non-flash address"),
        }
    }

    /// Encode into the raw 64-bit wire form.
    pub fn to_raw(self) -> u64 {
        match self {
            Addr::Invalid => ADDR_RAW_INVALID,
            Addr::Cached(offset) => {
                debug_assert!(offset < RAW_OFFSET_MASK);
                RAW_CACHED_BIT | offset
            }
            Addr::Flash(offset) => {
                debug_assert!(offset < RAW_CACHED_BIT);
                offset
            }
        }
    }

    /// Decode from the raw 64-bit wire form.
    pub fn from_raw(raw: u64) -> Self {
        if raw == ADDR_RAW_INVALID {
            Addr::Invalid
        } else if raw & RAW_CACHED_BIT != 0 {
            Addr::Cached(raw & RAW_OFFSET_MASK)
        } else {
            Addr::Flash(raw)
        }
    }

    /// Encode into the packed 32-bit wire form.
    ///
    /// Lossless for any address whose offset fits in 31 bits, which the
    /// layout guarantees before selecting the packed format.
    pub fn to_packed(self) -> u32 {
        match self {
            Addr::Invalid => ADDR_PACKED_INVALID,
            Addr::Cached(offset) => {
                debug_assert!(offset < u64::from(PACKED_OFFSET_MASK));
                PACKED_CACHED_BIT | (offset as u32)
            }
            Addr::Flash(offset) => {
                debug_assert!(offset < u64::from(PACKED_CACHED_BIT));
                offset as u32
            }
        }
    }

    /// Decode from the packed 32-bit wire form.
    pub fn from_packed(packed: u32) -> Self {
        if packed == ADDR_PACKED_INVALID {
            Addr::Invalid
        } else if packed & PACKED_CACHED_BIT != 0 {
            Addr::Cached(u64::from(packed & PACKED_OFFSET_MASK))
        } else {
            Addr::Flash(u64::from(packed))
        }
    }
}

/// Size of one address entry on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSize {
    /// Packed 4-byte entries.
    Packed,
    /// Raw 8-byte entries.
    Wide,
}

/// Address codec bound to the entry size chosen at format time.
///
/// Load and store are total functions on well-formed buffers; an
/// out-of-bounds index is a programming error and panics via the slice
/// indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrCodec {
    size: AddrSize,
}

impl AddrCodec {
    /// Pick the codec from the address bit length of the combined device
    /// space: packed entries when every address fits in less than 32 bits.
    pub fn from_addr_length(addr_length: u32) -> Self {
        let size = if addr_length > 32 {
            AddrSize::Wide
        } else {
            AddrSize::Packed
        };
        AddrCodec { size }
    }

    /// Build a codec from an explicit entry size in bytes (4 or 8).
    pub fn from_entry_size(bytes: usize) -> Self {
        let size = match bytes {
            4 => AddrSize::Packed,
            8 => AddrSize::Wide,
            _ => panic!("unsupported address entry size: {}", bytes),
        };
        AddrCodec { size }
    }

    /// Entry size in bytes (4 or 8).
    pub fn entry_size(&self) -> usize {
        match self.size {
            AddrSize::Packed => 4,
            AddrSize::Wide => 8,
        }
    }

    /// Addresses held by one block of this entry size.
    pub fn entries_per_block(&self) -> u64 {
        (crate::core::FTL_BLOCK_SIZE / self.entry_size()) as u64
    }

    /// Load the address at entry index `idx`.
    pub fn load(&self, buf: &[u8], idx: u64) -> Addr {
        let at = idx as usize * self.entry_size();
        match self.size {
            AddrSize::Packed => {
                let raw = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
                Addr::from_packed(raw)
            }
            AddrSize::Wide => {
                let raw = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
                Addr::from_raw(raw)
            }
        }
    }

    /// Store `addr` at entry index `idx`.
    pub fn store(&self, buf: &mut [u8], idx: u64, addr: Addr) {
        let at = idx as usize * self.entry_size();
        match self.size {
            AddrSize::Packed => {
                buf[at..at + 4].copy_from_slice(&addr.to_packed().to_le_bytes());
            }
            AddrSize::Wide => {
                buf[at..at + 8].copy_from_slice(&addr.to_raw().to_le_bytes());
            }
        }
    }

    /// Load the LBA at entry index `idx` from an LBA-map buffer.
    ///
    /// LBA maps share the address entry size; the packed form widens the
    /// 32-bit invalid sentinel back to the 64-bit one.
    pub fn lba_load(&self, buf: &[u8], idx: u64) -> u64 {
        let at = idx as usize * self.entry_size();
        match self.size {
            AddrSize::Packed => {
                let lba = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
                if lba == u32::MAX {
                    FTL_LBA_INVALID
                } else {
                    u64::from(lba)
                }
            }
            AddrSize::Wide => u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()),
        }
    }

    /// Store `lba` at entry index `idx` into an LBA-map buffer.
    pub fn lba_store(&self, buf: &mut [u8], idx: u64, lba: u64) {
        let at = idx as usize * self.entry_size();
        match self.size {
            AddrSize::Packed => {
                let narrow = if lba == FTL_LBA_INVALID {
                    u32::MAX
                } else {
                    debug_assert!(lba < u64::from(u32::MAX));
                    lba as u32
                };
                buf[at..at + 4].copy_from_slice(&narrow.to_le_bytes());
            }
            AddrSize::Wide => {
                buf[at..at + 8].copy_from_slice(&lba.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_invalid_sentinels() {
        assert_eq!(Addr::Invalid.to_raw(), ADDR_RAW_INVALID);
        assert_eq!(Addr::Invalid.to_packed(), ADDR_PACKED_INVALID);
        assert_eq!(Addr::from_raw(ADDR_RAW_INVALID), Addr::Invalid);
        assert_eq!(Addr::from_packed(ADDR_PACKED_INVALID), Addr::Invalid);
    }

    #[test]
    fn test_cached_flag_round_trip() {
        let addr = Addr::Cached(12345);
        assert!(addr.is_cached());
        assert_eq!(Addr::from_raw(addr.to_raw()), addr);
        assert_eq!(Addr::from_packed(addr.to_packed()), addr);

        let addr = Addr::Flash(54321);
        assert!(!addr.is_cached());
        assert_eq!(Addr::from_raw(addr.to_raw()), addr);
        assert_eq!(Addr::from_packed(addr.to_packed()), addr);
    }

    #[test]
    fn test_codec_selection() {
        assert_eq!(AddrCodec::from_addr_length(20).entry_size(), 4);
        assert_eq!(AddrCodec::from_addr_length(32).entry_size(), 4);
        assert_eq!(AddrCodec::from_addr_length(33).entry_size(), 8);
    }

    #[test]
    fn test_buffer_store_load() {
        for codec in [AddrCodec::from_entry_size(4), AddrCodec::from_entry_size(8)] {
            let mut buf = vec![0u8; 64];
            codec.store(&mut buf, 0, Addr::Flash(7));
            codec.store(&mut buf, 1, Addr::Cached(9));
            codec.store(&mut buf, 2, Addr::Invalid);
            assert_eq!(codec.load(&buf, 0), Addr::Flash(7));
            assert_eq!(codec.load(&buf, 1), Addr::Cached(9));
            assert_eq!(codec.load(&buf, 2), Addr::Invalid);
        }
    }

    #[test]
    fn test_lba_store_load() {
        for codec in [AddrCodec::from_entry_size(4), AddrCodec::from_entry_size(8)] {
            let mut buf = vec![0u8; 64];
            codec.lba_store(&mut buf, 0, 41);
            codec.lba_store(&mut buf, 1, FTL_LBA_INVALID);
            assert_eq!(codec.lba_load(&buf, 0), 41);
            assert_eq!(codec.lba_load(&buf, 1), FTL_LBA_INVALID);
        }
    }

    proptest! {
        #[test]
        fn prop_raw_round_trip(offset in 0u64..(1 << 62)) {
            for addr in [Addr::Flash(offset), Addr::Cached(offset)] {
                prop_assert_eq!(Addr::from_raw(addr.to_raw()), addr);
            }
        }

        #[test]
        fn prop_packed_round_trip(offset in 0u64..(1 << 30)) {
            for addr in [Addr::Flash(offset), Addr::Cached(offset)] {
                prop_assert_eq!(Addr::from_packed(addr.to_packed()), addr);
            }
        }

        #[test]
        fn prop_buffer_round_trip(offset in 0u64..(1 << 30), idx in 0u64..16) {
            for codec in [AddrCodec::from_entry_size(4), AddrCodec::from_entry_size(8)] {
                let mut buf = vec![0u8; 16 * codec.entry_size()];
                for addr in [Addr::Flash(offset), Addr::Cached(offset), Addr::Invalid] {
                    codec.store(&mut buf, idx, addr);
                    prop_assert_eq!(codec.load(&buf, idx), addr);
                }
            }
        }
    }
}
