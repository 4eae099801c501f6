//! # Superblock
//!
//! One block of device identity and shutdown state, stored at the head of
//! the cache device with a mirror slot. The codec is fixed-layout
//! little-endian with a CRC32C trailer; a decode failure at mount means
//! the device was never formatted or the metadata is corrupt.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use uuid::Uuid;

use crate::core::FTL_BLOCK_SIZE;

const SB_MAGIC: u32 = 0x4654_4C53; // "FTLS"

/// Current superblock format version.
pub const SB_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_UUID: usize = 8;
const OFF_NUM_LBAS: usize = 24;
const OFF_CLEAN: usize = 32;
const OFF_CKPT_SEQ_ID: usize = 40;
const OFF_SEQ_ID: usize = 48;
const OFF_CRC: usize = 56;

/// Superblock decode failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SuperblockError {
    /// The block does not carry the superblock magic.
    #[error("superblock magic not found")]
    BadMagic,

    /// Unknown format version.
    #[error("unsupported superblock version {0}")]
    BadVersion(u32),

    /// The checksum does not cover the content.
    #[error("superblock checksum mismatch")]
    BadChecksum,
}

/// Device identity and shutdown state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Device instance identity; also names the shared-memory objects.
    pub uuid: Uuid,
    /// Host-visible logical capacity recorded at format time.
    pub num_lbas: u64,
    /// Whether the previous shutdown completed cleanly.
    pub clean: bool,
    /// Sequence id of the last completed checkpoint.
    pub ckpt_seq_id: u64,
    /// Highest sequence id handed out before the last clean shutdown.
    pub seq_id: u64,
}

impl Superblock {
    /// Fresh superblock for a newly formatted device.
    pub fn new(uuid: Uuid, num_lbas: u64) -> Self {
        Superblock {
            uuid,
            num_lbas,
            clean: true,
            ckpt_seq_id: 0,
            seq_id: 0,
        }
    }

    /// Encode into one block.
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; FTL_BLOCK_SIZE];
        LittleEndian::write_u32(&mut block[OFF_MAGIC..], SB_MAGIC);
        LittleEndian::write_u32(&mut block[OFF_VERSION..], SB_VERSION);
        block[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        LittleEndian::write_u64(&mut block[OFF_NUM_LBAS..], self.num_lbas);
        block[OFF_CLEAN] = u8::from(self.clean);
        LittleEndian::write_u64(&mut block[OFF_CKPT_SEQ_ID..], self.ckpt_seq_id);
        LittleEndian::write_u64(&mut block[OFF_SEQ_ID..], self.seq_id);
        let crc = crc32c::crc32c(&block[..OFF_CRC]);
        LittleEndian::write_u32(&mut block[OFF_CRC..], crc);
        block
    }

    /// Decode from the first block of the superblock region.
    pub fn decode(block: &[u8]) -> Result<Self, SuperblockError> {
        if LittleEndian::read_u32(&block[OFF_MAGIC..]) != SB_MAGIC {
            return Err(SuperblockError::BadMagic);
        }
        let version = LittleEndian::read_u32(&block[OFF_VERSION..]);
        if version != SB_VERSION {
            return Err(SuperblockError::BadVersion(version));
        }
        let crc = LittleEndian::read_u32(&block[OFF_CRC..]);
        if crc != crc32c::crc32c(&block[..OFF_CRC]) {
            return Err(SuperblockError::BadChecksum);
        }

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&block[OFF_UUID..OFF_UUID + 16]);
        Ok(Superblock {
            uuid: Uuid::from_bytes(uuid_bytes),
            num_lbas: LittleEndian::read_u64(&block[OFF_NUM_LBAS..]),
            clean: block[OFF_CLEAN] != 0,
            ckpt_seq_id: LittleEndian::read_u64(&block[OFF_CKPT_SEQ_ID..]),
            seq_id: LittleEndian::read_u64(&block[OFF_SEQ_ID..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut sb = Superblock::new(Uuid::new_v4(), 4096);
        sb.clean = false;
        sb.ckpt_seq_id = 17;
        sb.seq_id = 99;

        let block = sb.encode();
        assert_eq!(block.len(), FTL_BLOCK_SIZE);
        assert_eq!(Superblock::decode(&block).unwrap(), sb);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let block = vec![0u8; FTL_BLOCK_SIZE];
        assert_eq!(Superblock::decode(&block), Err(SuperblockError::BadMagic));
    }

    #[test]
    fn test_decode_rejects_bit_flip() {
        let sb = Superblock::new(Uuid::new_v4(), 4096);
        let mut block = sb.encode();
        block[OFF_NUM_LBAS] ^= 1;
        assert_eq!(
            Superblock::decode(&block),
            Err(SuperblockError::BadChecksum)
        );
    }
}
