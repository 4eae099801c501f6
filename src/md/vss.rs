//! # VSS Records
//!
//! Every block written to a metadata region carries 64 bytes of
//! side-channel metadata. The high eight bytes hold the region's logical
//! version; the low bytes carry the payload variant: the LBA of a cached
//! user block, or an unmap run. Accessors work on 64-byte record slices
//! inside a larger VSS buffer.

use byteorder::{ByteOrder, LittleEndian};

use crate::core::FTL_MD_VSS_SZ;

const OFF_PAYLOAD_LO: usize = 0;
const OFF_PAYLOAD_HI: usize = 8;
const OFF_VERSION: usize = FTL_MD_VSS_SZ - 8;

/// Read the region version of a record.
pub fn version(rec: &[u8]) -> u64 {
    LittleEndian::read_u64(&rec[OFF_VERSION..])
}

/// Stamp the region version into a record.
pub fn set_version(rec: &mut [u8], version: u64) {
    LittleEndian::write_u64(&mut rec[OFF_VERSION..], version);
}

/// Read the cached-block LBA payload.
pub fn nv_lba(rec: &[u8]) -> u64 {
    LittleEndian::read_u64(&rec[OFF_PAYLOAD_LO..])
}

/// Store the cached-block LBA payload.
pub fn set_nv_lba(rec: &mut [u8], lba: u64) {
    LittleEndian::write_u64(&mut rec[OFF_PAYLOAD_LO..], lba);
}

/// Read an unmap run payload as `(start_lba, num_blocks)`.
pub fn unmap_run(rec: &[u8]) -> (u64, u64) {
    (
        LittleEndian::read_u64(&rec[OFF_PAYLOAD_LO..]),
        LittleEndian::read_u64(&rec[OFF_PAYLOAD_HI..]),
    )
}

/// Store an unmap run payload.
pub fn set_unmap_run(rec: &mut [u8], start_lba: u64, num_blocks: u64) {
    LittleEndian::write_u64(&mut rec[OFF_PAYLOAD_LO..], start_lba);
    LittleEndian::write_u64(&mut rec[OFF_PAYLOAD_HI..], num_blocks);
}

/// One VSS record used as an initialization pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VssPattern {
    bytes: [u8; FTL_MD_VSS_SZ],
}

impl VssPattern {
    /// Zeroed record carrying only the region version.
    pub fn with_version(version: u64) -> Self {
        let mut bytes = [0u8; FTL_MD_VSS_SZ];
        set_version(&mut bytes, version);
        VssPattern { bytes }
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable record bytes, for payload fields.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Stamp `pattern` across every record of a VSS buffer.
pub fn init_buf(buf: &mut [u8], pattern: &VssPattern) {
    debug_assert_eq!(buf.len() % FTL_MD_VSS_SZ, 0);
    for rec in buf.chunks_mut(FTL_MD_VSS_SZ) {
        rec.copy_from_slice(pattern.as_bytes());
    }
}

/// Record slice at `idx` of a VSS buffer.
pub fn record(buf: &[u8], idx: usize) -> &[u8] {
    &buf[idx * FTL_MD_VSS_SZ..(idx + 1) * FTL_MD_VSS_SZ]
}

/// Mutable record slice at `idx` of a VSS buffer.
pub fn record_mut(buf: &mut [u8], idx: usize) -> &mut [u8] {
    &mut buf[idx * FTL_MD_VSS_SZ..(idx + 1) * FTL_MD_VSS_SZ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_and_lba_coexist() {
        let mut rec = [0u8; FTL_MD_VSS_SZ];
        set_version(&mut rec, 3);
        set_nv_lba(&mut rec, 777);
        assert_eq!(version(&rec), 3);
        assert_eq!(nv_lba(&rec), 777);
    }

    #[test]
    fn test_unmap_run_round_trip() {
        let mut rec = [0u8; FTL_MD_VSS_SZ];
        set_unmap_run(&mut rec, 10, 32);
        assert_eq!(unmap_run(&rec), (10, 32));
    }

    #[test]
    fn test_init_buf_stamps_every_record() {
        let mut buf = vec![0u8; 4 * FTL_MD_VSS_SZ];
        init_buf(&mut buf, &VssPattern::with_version(9));
        for idx in 0..4 {
            assert_eq!(version(record(&buf, idx)), 9);
        }
    }
}
